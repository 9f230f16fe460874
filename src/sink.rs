//! The rotating file sink engine.
//!
//! `RollingFile` owns one canonical file and appends to it through a bounded
//! drain queue, so callers never wait on disk I/O. A pre-open scheduler
//! stages the next segment shortly before the rotation boundary, and the
//! rotation coordinator retires the active file under a timestamped backup
//! name on a detached thread, single-flighted by an atomic flag. Every
//! rotation signals the retention mill.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, warn};

use crate::clock::{Clock, SystemClock};
use crate::mill;
use crate::naming::SegmentPaths;
use crate::policy::{
    RotationMode, RotationPolicy, PREOPEN_LEAD_SECS, PREOPEN_SIZE_MARGIN, PREOPEN_TICK,
    PROMOTE_ATTEMPTS,
};
use crate::queue::DrainQueue;
use crate::{Error, Result};

/// Mutable engine state. One mutex guards all of it; only the rotation
/// single-flight flag lives outside, so the write path never waits on an
/// in-flight rotation.
struct EngineState {
    active: Option<File>,
    preopened: Option<File>,
    /// Bytes handed to the drain queue since the last rotation. Counted at
    /// enqueue time, not at disk append, because rotation decisions must be
    /// made before the asynchronous drain catches up.
    buffered: u64,
    /// Start of the current rotation window, aligned to the window length.
    window_start: i64,
    /// The pending rotation was caused by size overflow, which changes the
    /// timestamp embedded in the backup name.
    size_triggered: bool,
    queue: Option<DrainQueue>,
    mill_tx: Option<SyncSender<()>>,
    closed: bool,
}

struct Inner {
    paths: SegmentPaths,
    policy: RotationPolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<EngineState>,
    /// True exactly while a rotation is in flight.
    rotating: AtomicBool,
    dropped: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
}

/// A write target that transparently rotates its backing file.
///
/// Built via [`RollingFile::builder`]. Writes are buffered and drained to
/// disk by a background consumer; rotation, retention and compression all
/// happen off the write path.
///
/// # Example
///
/// ```no_run
/// use logmill::RollingFile;
///
/// let sink = RollingFile::builder("./logs", "app.log")
///     .window_minutes(30)
///     .max_backups(5)
///     .compress(true)
///     .build()?;
///
/// sink.write(b"hello\n")?;
/// sink.close()?;
/// # Ok::<(), logmill::Error>(())
/// ```
pub struct RollingFile {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Configures and builds a [`RollingFile`].
pub struct RollingFileBuilder {
    dir: PathBuf,
    file_name: String,
    policy: RotationPolicy,
    clock: Arc<dyn Clock>,
}

impl RollingFileBuilder {
    fn new(dir: PathBuf, file_name: String) -> Self {
        Self {
            dir,
            file_name,
            policy: RotationPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Maximum segment size in bytes. Defaults to 800 MB.
    pub fn max_size(mut self, bytes: u64) -> Self {
        self.policy.max_size = bytes;
        self
    }

    /// Rotate at time-window boundaries of the given length, clamped to
    /// [1, 60] minutes (0 selects the 30 minute default). Size overflow
    /// still forces an early rotation.
    pub fn window_minutes(mut self, minutes: u32) -> Self {
        self.policy.mode = RotationMode::window_clamped(minutes);
        self
    }

    /// Rotate on size overflow only.
    pub fn size_only(mut self) -> Self {
        self.policy.mode = RotationMode::SizeOnly;
        self
    }

    /// Retired segments to keep; 0 keeps all of them.
    pub fn max_backups(mut self, count: usize) -> Self {
        self.policy.max_backups = count;
        self
    }

    /// Days before a retired segment is aged out; 0 disables age cleanup.
    pub fn max_age_days(mut self, days: u32) -> Self {
        self.policy.max_age_days = days;
        self
    }

    /// Gzip-compress retired segments.
    pub fn compress(mut self, enabled: bool) -> Self {
        self.policy.compress = enabled;
        self
    }

    /// Use local time for backup names and the off-peak cleanup window.
    /// Defaults to true; falls back to UTC when the local offset cannot be
    /// determined.
    pub fn local_time(mut self, enabled: bool) -> Self {
        self.policy.local_time = enabled;
        self
    }

    /// Drain queue depth, in buffers.
    pub fn queue_capacity(mut self, buffers: usize) -> Self {
        self.policy.queue_capacity = buffers.max(1);
        self
    }

    /// Settle delay between deciding to rotate and touching the filesystem.
    pub fn debounce(mut self, delay: Duration) -> Self {
        self.policy.debounce = delay;
        self
    }

    /// Replace the wall clock, e.g. with a `ManualClock` under test.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Opens the initial active file and spawns the drain consumer, the
    /// pre-open scheduler and the retention mill.
    pub fn build(self) -> Result<RollingFile> {
        let paths = SegmentPaths::new(self.dir, &self.file_name);
        let policy = self.policy;
        let clock = self.clock;

        let dropped = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let window_start = align_window(clock.unix_secs(), &policy);

        let inner = Arc::new(Inner {
            paths: paths.clone(),
            policy: policy.clone(),
            clock: Arc::clone(&clock),
            state: Mutex::new(EngineState {
                active: None,
                preopened: None,
                buffered: 0,
                window_start,
                size_triggered: false,
                queue: None,
                mill_tx: None,
                closed: false,
            }),
            rotating: AtomicBool::new(false),
            dropped: Arc::clone(&dropped),
            shutdown: Arc::clone(&shutdown),
        });

        {
            let mut state = inner.state();
            inner.open_existing_or_new(&mut state, 0)?;
        }

        let drain_inner = Arc::clone(&inner);
        let (queue, drain) = DrainQueue::spawn(policy.queue_capacity, dropped, move |bytes| {
            drain_inner.append_to_active(bytes)
        });

        let (mill_tx, mill_rx) = mpsc::sync_channel(1);
        let mill = mill::spawn_worker(mill_rx, paths, policy, Arc::clone(&clock));

        {
            let mut state = inner.state();
            state.queue = Some(queue);
            // One pass at startup picks up leftovers from a previous run.
            let _ = mill_tx.try_send(());
            state.mill_tx = Some(mill_tx);
        }

        let preopen_inner = Arc::clone(&inner);
        let preopen = thread::spawn(move || preopen_loop(preopen_inner));

        Ok(RollingFile {
            inner,
            workers: Mutex::new(vec![drain, mill, preopen]),
        })
    }
}

impl RollingFile {
    pub fn builder(dir: impl Into<PathBuf>, file_name: impl Into<String>) -> RollingFileBuilder {
        RollingFileBuilder::new(dir.into(), file_name.into())
    }

    /// Hands `bytes` to the sink and returns immediately.
    ///
    /// The append itself happens asynchronously; a full drain queue drops
    /// the buffer rather than blocking (see [`dropped`](Self::dropped)). A
    /// write larger than the configured maximum segment size is rejected
    /// outright, since no rotation could ever make it fit.
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        let inner = &self.inner;
        let len = bytes.len() as u64;
        if len > inner.policy.max_size {
            return Err(Error::WriteTooLarge {
                len,
                max: inner.policy.max_size,
            });
        }

        let mut state = inner.state();
        if state.closed {
            return Err(Error::Closed);
        }
        if state.active.is_none() {
            inner.open_existing_or_new(&mut state, len)?;
        }

        match inner.policy.mode {
            RotationMode::Window { minutes } => {
                let window = i64::from(minutes) * 60;
                if inner.clock.unix_secs() - state.window_start >= window {
                    Inner::request_rotation(inner, &mut state, false);
                } else if state.buffered + len > inner.policy.max_size {
                    state.size_triggered = true;
                    Inner::request_rotation(inner, &mut state, true);
                }
            }
            RotationMode::SizeOnly => {
                if state.buffered + len > inner.policy.max_size {
                    state.size_triggered = true;
                    Inner::request_rotation(inner, &mut state, true);
                }
            }
        }

        if let Some(queue) = state.queue.as_ref() {
            if queue.enqueue(bytes) {
                state.buffered += len;
            }
        }
        Ok(bytes.len())
    }

    /// Forces a rotation, e.g. in response to an external signal.
    ///
    /// Stages a fresh segment if the scheduler has not already done so, then
    /// kicks the coordinator. Idempotent while a rotation is in flight: the
    /// request collapses into the running one.
    pub fn rotate(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state();
        if state.closed {
            return Err(Error::Closed);
        }
        if state.active.is_none() {
            inner.open_existing_or_new(&mut state, 0)?;
        }
        if state.preopened.is_none() {
            state.preopened = Some(inner.create_staging()?);
        }
        let size_triggered = state.size_triggered;
        Inner::request_rotation(inner, &mut state, size_triggered);
        Ok(())
    }

    /// Buffers dropped by the non-blocking enqueue since construction.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Shuts the sink down: stops the workers, drains the queued buffers to
    /// disk and releases the active handle. Later writes fail with
    /// [`Error::Closed`]. Idempotent.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        inner.shutdown.store(true, Ordering::Release);

        let (queue, mill_tx) = {
            let mut state = inner.state();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            (state.queue.take(), state.mill_tx.take())
        };
        // Dropping the sender lets the consumer drain the backlog and exit;
        // the mill worker exits once its last sender is gone.
        drop(queue);
        drop(mill_tx);

        let workers = {
            let mut workers = self
                .workers
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            std::mem::take(&mut *workers)
        };
        for handle in workers {
            let _ = handle.join();
        }

        let mut state = inner.state();
        state.preopened = None;
        if let Some(file) = state.active.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for RollingFile {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("close on drop failed: {err}");
        }
    }
}

impl io::Write for &RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        RollingFile::write(*self, buf).map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Drain consumer callback: append one buffer to whatever is active.
    fn append_to_active(&self, bytes: &[u8]) {
        let mut state = self.state();
        match state.active.as_mut() {
            Some(file) => {
                if let Err(err) = file.write_all(bytes) {
                    warn!("drain append failed: {err}");
                }
            }
            None => debug!("drain discarded {} bytes: no active segment", bytes.len()),
        }
    }

    /// Opens the canonical file for appending, or starts a fresh one.
    /// A leftover segment that would already overflow is retired under a
    /// backup name first, replaying the rotation rename synchronously.
    fn open_existing_or_new(&self, state: &mut EngineState, incoming: u64) -> Result<()> {
        if let Some(tx) = state.mill_tx.as_ref() {
            let _ = tx.try_send(());
        }
        let path = self.paths.active();
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return self.open_new(state),
            Err(err) => return Err(err.into()),
        };
        if matches!(self.policy.mode, RotationMode::SizeOnly)
            && meta.len() + incoming >= self.policy.max_size
        {
            return self.open_new(state);
        }
        match OpenOptions::new().append(true).open(&path) {
            Ok(file) => {
                state.active = Some(file);
                state.buffered = meta.len();
                Ok(())
            }
            Err(err) => {
                warn!(
                    "cannot append to {}: {err}; starting a new segment",
                    path.display()
                );
                self.open_new(state)
            }
        }
    }

    /// Creates a fresh active file, moving any existing one out of the way
    /// under a backup name.
    fn open_new(&self, state: &mut EngineState) -> Result<()> {
        fs::create_dir_all(self.paths.dir())?;
        let path = self.paths.active();
        if fs::metadata(&path).is_ok() {
            let ts = self.clock.now();
            let mut backup = self.paths.backup(ts, self.policy.local_time)?;
            if backup.exists() {
                backup =
                    self.paths
                        .backup_disambiguated(ts, self.policy.local_time, subsec_micros(ts))?;
            }
            fs::rename(&path, &backup)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        state.active = Some(file);
        state.buffered = 0;
        state.size_triggered = false;
        state.window_start = align_window(self.clock.unix_secs(), &self.policy);
        Ok(())
    }

    fn create_staging(&self) -> Result<File> {
        fs::create_dir_all(self.paths.dir())?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.paths.staging())?;
        Ok(file)
    }

    /// Kicks the rotation coordinator. Requires a staged segment; without
    /// one the request is deferred until the scheduler has caught up. A
    /// failed flag swap means a rotation is already in flight and the
    /// request collapses into it.
    fn request_rotation(this: &Arc<Inner>, state: &mut EngineState, size_triggered: bool) {
        if state.preopened.is_none() {
            return;
        }
        if this
            .rotating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let backup_ts = match this.policy.mode {
            RotationMode::Window { minutes } if !size_triggered => {
                unix_system_time(state.window_start + i64::from(minutes) * 60)
            }
            _ => this.clock.now(),
        };

        let coordinator = Arc::clone(this);
        thread::spawn(move || coordinator.run_rotation(backup_ts));
    }

    /// The rotation pass, run on its own thread.
    fn run_rotation(self: Arc<Self>, backup_ts: SystemTime) {
        if let Err(err) = fs::create_dir_all(self.paths.dir()) {
            warn!("rotation: cannot create {}: {err}", self.paths.dir().display());
        }
        // Let the drain consumer catch up with buffers enqueued before the
        // trigger fired.
        thread::sleep(self.policy.debounce);

        let mut state = self.state();
        if state.closed {
            self.rotating.store(false, Ordering::Release);
            return;
        }

        let active_path = self.paths.active();
        let backup = match self.backup_target(backup_ts) {
            Ok(backup) => backup,
            Err(err) => {
                error!("rotation: cannot name backup: {err}");
                self.rotating.store(false, Ordering::Release);
                return;
            }
        };

        if let Err(err) = fs::rename(&active_path, &backup) {
            // The staged segment is kept; a later trigger retries the whole
            // pass.
            error!("rotation: cannot retire {}: {err}", active_path.display());
            self.rotating.store(false, Ordering::Release);
            return;
        }

        // Promote the staged file to the canonical name. The open handle
        // stays valid across the rename.
        let staging = self.paths.staging();
        let mut promoted = false;
        for attempt in 1..=PROMOTE_ATTEMPTS {
            match fs::rename(&staging, &active_path) {
                Ok(()) => {
                    promoted = true;
                    break;
                }
                Err(err) => {
                    warn!("rotation: promote attempt {attempt} failed: {err}");
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }

        let retiring = state.active.take();
        if promoted {
            state.active = state.preopened.take();
        } else {
            // Degrade: drop the staged handle and let the next write reopen.
            state.preopened = None;
            error!("rotation: staged segment could not be promoted; reopening on next write");
        }
        state.buffered = 0;
        state.size_triggered = false;
        state.window_start = align_window(self.clock.unix_secs(), &self.policy);
        let mill_tx = state.mill_tx.clone();
        drop(state);

        self.rotating.store(false, Ordering::Release);
        drop(retiring);

        if let Some(tx) = mill_tx {
            let _ = tx.try_send(());
        }
        debug!(
            "rotated {} -> {}",
            active_path.display(),
            backup.display()
        );
    }

    fn backup_target(&self, ts: SystemTime) -> Result<PathBuf> {
        let backup = self.paths.backup(ts, self.policy.local_time)?;
        if backup.exists() {
            let micros = subsec_micros(self.clock.now());
            return self
                .paths
                .backup_disambiguated(ts, self.policy.local_time, micros);
        }
        Ok(backup)
    }

    /// One pre-open scheduler tick: stage the next segment once either the
    /// window end is within the lead margin or the projected size is within
    /// the size margin. At most one staged file exists at a time; creation
    /// failures are retried on the next tick.
    fn preopen_tick(&self) {
        let mut state = self.state();
        if state.closed || state.preopened.is_some() {
            return;
        }
        let due = match self.policy.mode {
            RotationMode::Window { minutes } => {
                let window = i64::from(minutes) * 60;
                self.clock.unix_secs() - state.window_start + PREOPEN_LEAD_SECS >= window
                    || state.buffered + PREOPEN_SIZE_MARGIN > self.policy.max_size
            }
            RotationMode::SizeOnly => {
                state.buffered + PREOPEN_SIZE_MARGIN > self.policy.max_size
            }
        };
        if !due {
            return;
        }
        match self.create_staging() {
            Ok(file) => {
                debug!(
                    "staged {} ({} bytes buffered)",
                    self.paths.staging().display(),
                    state.buffered
                );
                state.preopened = Some(file);
            }
            Err(err) => warn!("cannot stage {}: {err}", self.paths.staging().display()),
        }
    }
}

fn preopen_loop(inner: Arc<Inner>) {
    // Sleep in short slices so close() is never stuck behind a full tick.
    const SLICE: Duration = Duration::from_millis(250);
    let mut elapsed = Duration::ZERO;
    loop {
        thread::sleep(SLICE);
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        elapsed += SLICE;
        if elapsed < PREOPEN_TICK {
            continue;
        }
        elapsed = Duration::ZERO;
        inner.preopen_tick();
    }
}

/// `now - (now mod window)`, the invariant form of the window start.
fn align_window(now: i64, policy: &RotationPolicy) -> i64 {
    match policy.mode {
        RotationMode::Window { minutes } => {
            let window = i64::from(minutes) * 60;
            now - now.rem_euclid(window)
        }
        RotationMode::SizeOnly => now,
    }
}

fn unix_system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn subsec_micros(ts: SystemTime) -> u32 {
    ts.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_micros())
        .unwrap_or(0)
}
