//! usbaudio Core - streaming primitives for USB Audio Class isochronous I/O
//!
//! This crate holds the lock-free building blocks that sit between an
//! isochronous USB transport and a host audio engine. Nothing here talks to a
//! device or spawns a thread; the managers in `usbaudio-stream` wire these
//! pieces to a transport.
//!
//! # Core Abstractions
//!
//! ## Buffers
//!
//! - [`RingBuffer`] - Fixed-capacity circular buffer with wrap notification
//! - [`FrameSizeQueue`] - Lock-free FIFO of per-frame byte counts, the
//!   implicit-synchronization channel from the recording side to the
//!   playback side
//!
//! ## Timing
//!
//! - [`TimestampFilter`] - Critically damped mass-spring-damper filter that
//!   turns jittery wrap timestamps into a smooth timing signal
//!
//! ## Format
//!
//! - [`StreamFormat`] - Sample rate / channel / sample width arithmetic
//! - [`FrameSizer`] - Exact fractional pacing of bytes per bus interval
//!
//! # no_std Support
//!
//! Disable the default `std` feature to build for targets without an
//! operating system; only `alloc` is required:
//!
//! ```toml
//! [dependencies]
//! usbaudio-core = { version = "0.1", default-features = false }
//! ```
//!
//! # Example
//!
//! ```rust
//! use usbaudio_core::{FrameSizeQueue, RingBuffer};
//!
//! let mut ring = RingBuffer::<u8>::with_capacity(4096).unwrap();
//! let queue = FrameSizeQueue::new();
//!
//! // One isochronous frame of 16-bit stereo at 48 kHz
//! let frame = [0u8; 192];
//! ring.push_slice(&frame, 1_000_000).unwrap();
//! queue.push(frame.len() as u32);
//!
//! assert_eq!(ring.available(), 192);
//! assert_eq!(queue.pop(), Some(192));
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod error;
pub mod format;
pub mod frame_size_queue;
pub mod ring;
pub mod timestamp_filter;

pub use error::{Error, Result};
pub use format::{BusSpeed, FrameSizer, StreamFormat};
pub use frame_size_queue::{FRAME_SIZE_QUEUE_CAPACITY, FrameSizeQueue};
pub use ring::{RingBuffer, WrapEvent, WrapObserver};
pub use timestamp_filter::{FilterConfig, TimestampFilter};
