//! Isochronous stream managers for USB Audio Class devices.
//!
//! This crate drives the primitives from [`usbaudio_core`] against a
//! [`Transport`]: it keeps several frame lists in flight per direction,
//! moves payloads between the transport and the ring buffers, carries frame
//! sizes from the recording side to the playback side, and recovers a smooth
//! ring-position clock from wrap timestamps.
//!
//! # Components
//!
//! - [`InputStreamManager`] - reads into the input ring, feeds the
//!   [`FrameSizeQueue`](usbaudio_core::FrameSizeQueue)
//! - [`OutputStreamManager`] - writes from the output ring, sized by the
//!   queue
//! - [`ClockSync`] - filtered wrap time and position estimates
//! - [`StreamSession`] - owns the state the two directions share
//! - [`SimulatedDevice`] - deterministic in-process [`Transport`]
//! - [`VolumeControl`] - get/set/observe capability for playback gain
//!
//! # Threading
//!
//! Transports report completions on a bounded channel; whoever owns the
//! manager calls [`pump`](InputStreamManager::pump) (or
//! [`process_pending`](InputStreamManager::process_pending)) on the context
//! that should run the completion path. Every manager method takes `&self`,
//! so managers can be shared by `Arc` between that context, the host audio
//! callback and the control thread.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use usbaudio_stream::{
//!     InputConfig, InputStreamManager, SessionConfig, SimConfig, SimulatedDevice, StreamSession,
//! };
//!
//! let device = Arc::new(SimulatedDevice::new(SimConfig::default()));
//! let session = StreamSession::new(&SessionConfig::default(), device.clock()).unwrap();
//! let (events, closed) = crossbeam_channel::unbounded();
//!
//! let input = InputStreamManager::new(InputConfig::default(), events);
//! input
//!     .init(device.clone(), session.input_ring(), session.frame_sizes(), session.clock())
//!     .unwrap();
//! input.start().unwrap();
//!
//! for _ in 0..32 {
//!     device.run_interval();
//!     input.process_pending().unwrap();
//! }
//! assert!(session.input_ring().lock().available() > 0);
//!
//! input.stop().unwrap();
//! while closed.try_recv().is_err() {
//!     device.run_interval();
//!     input.process_pending().unwrap();
//! }
//! input.free().unwrap();
//! ```

pub mod clock;
pub mod control;
pub mod input;
pub mod output;
pub mod session;
pub mod sim;
pub mod state;
pub mod transport;

use std::sync::Arc;

use parking_lot::Mutex;
use usbaudio_core::RingBuffer;

pub use clock::{ClockSync, ManualClock, MonotonicClock, TimeSource};
pub use control::{Control, Observer, ObserverId, Volume, VolumeControl};
pub use input::{InputConfig, InputStreamManager};
pub use output::{OutputConfig, OutputStreamManager, PreparedList, WrapMark};
pub use session::{SessionConfig, StreamSession};
pub use sim::{SimConfig, SimulatedDevice};
pub use state::{StatsSnapshot, StreamEvent, StreamState, StreamStats};
pub use transport::{
    Completion, Direction, FrameDescriptor, FrameList, FrameStatus, RingSegment,
    SharedFrameList, Submission, TransferStatus, Transport, TransportError,
};

/// A byte ring shared between a manager and the host audio path.
///
/// The lock is held for one copy at a time.
pub type SharedRing = Arc<Mutex<RingBuffer<u8>>>;

/// Errors from stream operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Lifecycle or buffer status.
    #[error(transparent)]
    Status(#[from] usbaudio_core::Error),

    /// The transport refused a submission.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl Error {
    /// The status code, if this is not a transport failure.
    pub fn status(&self) -> Option<usbaudio_core::Error> {
        match self {
            Error::Status(status) => Some(*status),
            Error::Transport(_) => None,
        }
    }
}

/// Result type for stream operations.
pub type Result<T> = std::result::Result<T, Error>;
