//! Rotation policy and the engine's fixed margins.

use std::time::Duration;

pub(crate) const MEGABYTE: u64 = 1024 * 1024;

/// Default maximum segment size: 800 MB.
pub const DEFAULT_MAX_SIZE: u64 = 800 * MEGABYTE;

/// Window length used when the caller passes 0 minutes.
pub(crate) const DEFAULT_WINDOW_MINUTES: u32 = 30;

/// The staging file is created this many seconds before the window ends.
pub(crate) const PREOPEN_LEAD_SECS: i64 = 5;

/// The staging file is created once the projected segment size comes within
/// this margin of the limit.
pub(crate) const PREOPEN_SIZE_MARGIN: u64 = 5 * MEGABYTE;

/// Pre-open scheduler tick.
pub(crate) const PREOPEN_TICK: Duration = Duration::from_secs(1);

/// Attempts at promoting the staged file before the engine degrades to
/// reopening on the next write.
pub(crate) const PROMOTE_ATTEMPTS: u32 = 3;

/// Default settle delay between deciding to rotate and touching the
/// filesystem, so the drain consumer can catch up with already-enqueued
/// buffers.
pub(crate) const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Default drain queue depth, in buffers.
pub(crate) const DEFAULT_QUEUE_CAPACITY: usize = 40_960;

/// Age-based cleanup only runs while the hour falls in this range.
pub(crate) const OFFPEAK_START_HOUR: u8 = 3;
pub(crate) const OFFPEAK_END_HOUR: u8 = 7;

/// When the sink rotates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationMode {
    /// Rotate at fixed time-window boundaries, or earlier when the segment
    /// would overflow `max_size`.
    Window { minutes: u32 },
    /// Rotate only when the segment would overflow `max_size`.
    SizeOnly,
}

impl RotationMode {
    /// Window mode with the length clamped to [1, 60] minutes; zero falls
    /// back to the 30 minute default.
    pub(crate) fn window_clamped(minutes: u32) -> Self {
        let minutes = if minutes == 0 {
            DEFAULT_WINDOW_MINUTES
        } else {
            minutes.min(60)
        };
        RotationMode::Window { minutes }
    }
}

/// Immutable rotation policy, fixed when the sink is built.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    /// Maximum segment size in bytes before a size-triggered rotation.
    pub max_size: u64,
    pub mode: RotationMode,
    /// Retired segments kept on disk; 0 keeps all of them.
    pub max_backups: usize,
    /// Days before a retired segment is eligible for age cleanup; 0 disables
    /// age cleanup.
    pub max_age_days: u32,
    /// Gzip-compress retired segments.
    pub compress: bool,
    /// Use local time for backup names and the off-peak cleanup window.
    pub local_time: bool,
    pub(crate) debounce: Duration,
    pub(crate) queue_capacity: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            mode: RotationMode::Window {
                minutes: DEFAULT_WINDOW_MINUTES,
            },
            max_backups: 0,
            max_age_days: 0,
            compress: false,
            local_time: true,
            debounce: DEFAULT_DEBOUNCE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}
