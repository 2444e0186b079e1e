//! Status taxonomy shared by every streaming component.

/// Failure statuses reported by buffers, filters and stream managers.
///
/// Lifecycle violations ([`NotReady`](Error::NotReady),
/// [`StillOpen`](Error::StillOpen)) are programming errors and are never
/// retried. [`Overrun`](Error::Overrun) and [`Underrun`](Error::Underrun) are
/// data-path conditions the managers log and ride through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// Operation issued in a state that does not allow it (e.g. start before init).
    NotReady,
    /// The transport endpoint backing the stream is absent.
    NotOpen,
    /// Resources are still in use (e.g. free before the stream has closed).
    StillOpen,
    /// Backing storage could not be allocated.
    NoMemory,
    /// An argument is out of range.
    BadArgument,
    /// Not enough free space for the write.
    Overrun,
    /// Not enough data for the read.
    Underrun,
    /// The transfer was aborted, typically during deliberate shutdown.
    Aborted,
    /// The operation did not complete in time.
    Timeout,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Self::NotReady => "not ready",
            Self::NotOpen => "endpoint not open",
            Self::StillOpen => "still open",
            Self::NoMemory => "out of memory",
            Self::BadArgument => "bad argument",
            Self::Overrun => "buffer overrun",
            Self::Underrun => "buffer underrun",
            Self::Aborted => "aborted",
            Self::Timeout => "timed out",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Convenience result type for core operations.
pub type Result<T> = core::result::Result<T, Error>;
