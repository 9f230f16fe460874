//! Rotating log-file sink.
//!
//! `logmill` is a write target that transparently rotates its backing file
//! when a time window elapses or a size threshold is reached. The next
//! segment is pre-created shortly before the boundary so rotation never
//! stalls the write path, buffered writes are drained to disk by a
//! background consumer, and retired segments are retained, aged out and
//! gzip-compressed by a background mill.
//!
//! Durability is intentionally bounded: writes are handed off through a
//! non-blocking queue and land in the OS file cache eventually. A full
//! queue drops buffers rather than blocking the caller; the loss is
//! observable through [`RollingFile::dropped`].
//!
//! # Example
//!
//! ```no_run
//! use logmill::RollingFile;
//!
//! let sink = RollingFile::builder("./logs", "app.log")
//!     .window_minutes(30)
//!     .max_backups(7)
//!     .max_age_days(30)
//!     .compress(true)
//!     .build()?;
//!
//! sink.write(b"starting up\n")?;
//! sink.rotate()?; // e.g. on SIGHUP
//! sink.close()?;
//! # Ok::<(), logmill::Error>(())
//! ```

pub mod clock;
pub mod error;
pub mod policy;

mod mill;
mod naming;
mod queue;
mod sink;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use policy::{RotationMode, RotationPolicy, DEFAULT_MAX_SIZE};
pub use sink::{RollingFile, RollingFileBuilder};
