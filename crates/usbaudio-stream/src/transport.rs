//! Isochronous transport collaborator and the frame lists it fills.
//!
//! The stream managers never touch USB hardware. They hand pre-allocated
//! [`FrameList`]s to a [`Transport`], which schedules one packet per bus
//! interval and reports back through a [`Completion`] on the channel carried
//! by the [`Submission`].
//!
//! Frame lists are shared with the transport behind a mutex. A transport may
//! fill frames progressively (setting each descriptor's status as its packet
//! lands) and only send the completion once the whole list is done; the input
//! manager's [`gather`](crate::InputStreamManager::gather) picks up frames
//! that are already final.
//!
//! # Buffer layout
//!
//! Frame `i`'s data starts at the sum of the requested sizes of frames
//! `0..i`. For reads every slot requests the maximum packet size, so the
//! data of frame `i` lives at `i * max_packet`.

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use usbaudio_core::Error;

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host (recording).
    Input,
    /// Host to device (playback).
    Output,
}

impl Direction {
    /// Both directions, input first.
    pub const ALL: [Direction; 2] = [Direction::Input, Direction::Output];

    pub(crate) const fn index(self) -> usize {
        match self {
            Direction::Input => 0,
            Direction::Output => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Input => "input",
            Direction::Output => "output",
        })
    }
}

/// Outcome of one packet within a frame list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    /// Not yet serviced by the transport.
    #[default]
    Pending,
    /// Transferred; `actual` bytes are valid.
    Complete,
    /// Cancelled, usually because the endpoint is shutting down.
    Aborted,
    /// The bus reported an error for this packet.
    Failed,
}

/// Per-packet bookkeeping: requested size, actual size, status and the time
/// the packet was serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameDescriptor {
    /// Bytes requested (read capacity or write payload).
    pub requested: u32,
    /// Bytes actually transferred.
    pub actual: u32,
    /// Packet outcome.
    pub status: FrameStatus,
    /// Completion time in nanoseconds on the transport's clock.
    pub timestamp_ns: u64,
}

impl FrameDescriptor {
    /// Whether the transport is done with this packet, successfully or not.
    pub fn is_final(&self) -> bool {
        self.status != FrameStatus::Pending
    }
}

/// A contiguous span of the ring buffer backing part of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSegment {
    /// Physical start index in the ring.
    pub offset: usize,
    /// Length in bytes.
    pub len: usize,
}

/// A batch of isochronous packets submitted as one unit.
#[derive(Debug, Clone, Default)]
pub struct FrameList {
    /// One descriptor per bus interval.
    pub frames: Vec<FrameDescriptor>,
    /// Packet payloads, laid out back to back by requested size.
    pub buffer: Vec<u8>,
    /// For writes: the ring spans the payload was taken from, in order.
    /// Empty when the list carries silence.
    pub segments: Vec<RingSegment>,
}

impl FrameList {
    /// Allocate a list of `frame_count` packets of up to `max_packet` bytes.
    pub fn try_new(frame_count: usize, max_packet: usize) -> Result<Self, Error> {
        if frame_count == 0 || max_packet == 0 {
            return Err(Error::BadArgument);
        }
        let bytes = frame_count
            .checked_mul(max_packet)
            .ok_or(Error::BadArgument)?;
        let mut frames = Vec::new();
        frames
            .try_reserve_exact(frame_count)
            .map_err(|_| Error::NoMemory)?;
        frames.resize(frame_count, FrameDescriptor::default());
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(bytes)
            .map_err(|_| Error::NoMemory)?;
        buffer.resize(bytes, 0);
        Ok(Self {
            frames,
            buffer,
            segments: Vec::with_capacity(2),
        })
    }

    /// Prepare every slot to receive up to `max_packet` bytes.
    pub fn reset_for_read(&mut self, max_packet: u32) {
        for frame in &mut self.frames {
            *frame = FrameDescriptor {
                requested: max_packet,
                ..FrameDescriptor::default()
            };
        }
        self.buffer.resize(self.frames.len() * max_packet as usize, 0);
        self.segments.clear();
    }

    /// Byte offset of frame `index` within [`buffer`](Self::buffer).
    pub fn frame_offset(&self, index: usize) -> usize {
        self.frames[..index]
            .iter()
            .map(|f| f.requested as usize)
            .sum()
    }

    /// Sum of all requested sizes.
    pub fn total_requested(&self) -> usize {
        self.frame_offset(self.frames.len())
    }

    /// Valid payload of frame `index`, clamped to what was requested and to
    /// the end of the buffer.
    pub fn frame_data(&self, index: usize) -> &[u8] {
        let frame = &self.frames[index];
        let start = self.frame_offset(index).min(self.buffer.len());
        let len = frame.actual.min(frame.requested) as usize;
        let end = (start + len).min(self.buffer.len());
        &self.buffer[start..end]
    }

    /// Whether every frame has been serviced.
    pub fn is_complete(&self) -> bool {
        self.frames.iter().all(FrameDescriptor::is_final)
    }
}

/// A frame list shared between a manager and the transport.
pub type SharedFrameList = Arc<Mutex<FrameList>>;

/// Overall outcome of a submitted list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Every packet was serviced; individual frames may still carry errors.
    Complete,
    /// The list was cancelled.
    Aborted,
    /// The transfer failed as a whole.
    Failed(TransportError),
}

/// Message the transport sends when a submitted list is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Direction of the list.
    pub direction: Direction,
    /// Index of the list within its manager.
    pub list_index: usize,
    /// Overall status.
    pub status: TransferStatus,
}

/// One list handed to the transport.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Direction of the transfer.
    pub direction: Direction,
    /// Index of the list within its manager, echoed back in the completion.
    pub list_index: usize,
    /// Bus frame to start on, or `None` for as soon as possible.
    pub first_frame: Option<u64>,
    /// Frame descriptors and payload.
    pub list: SharedFrameList,
    /// Where to send the completion.
    pub completion: Sender<Completion>,
}

/// Submission or transfer failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The endpoint for this direction is not available.
    #[error("{0} endpoint is not open")]
    EndpointClosed(Direction),

    /// The device is gone.
    #[error("device disconnected")]
    Disconnected,

    /// The transport could not schedule the requested bus frame.
    #[error("isochronous schedule missed at frame {0}")]
    ScheduleMissed(u64),

    /// Any other transport-specific failure.
    #[error("transfer failed: {0}")]
    Io(String),
}

/// The isochronous endpoint pair the managers stream through.
///
/// Implementations must send exactly one [`Completion`] per accepted
/// submission, including when the list is aborted. Submissions that return
/// `Err` are not in flight and produce no completion.
pub trait Transport: Send + Sync {
    /// Whether the endpoint for `direction` exists.
    fn is_open(&self, direction: Direction) -> bool;

    /// Current bus frame number.
    fn frame_number(&self) -> u64;

    /// Queue a read of every frame in the list.
    fn submit_read(&self, submission: Submission) -> Result<(), TransportError>;

    /// Queue a write of every frame in the list.
    fn submit_write(&self, submission: Submission) -> Result<(), TransportError>;
}
