use thiserror::Error;

/// Errors surfaced by the sink's synchronous API.
///
/// Background workers never return these to a caller; they log and degrade
/// instead, so a filesystem hiccup can stall rotation or retention without
/// taking the process down.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A single write can never be satisfied by rotation, so it is rejected
    /// before any state is touched.
    #[error("write of {len} bytes exceeds maximum segment size {max}")]
    WriteTooLarge { len: u64, max: u64 },

    #[error("cannot format backup timestamp: {0}")]
    TimeFormat(#[from] time::error::Format),

    #[error("sink is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
