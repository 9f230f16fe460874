//! Retention and compression of retired segments.
//!
//! The mill runs one pass per rotation, coalesced through a depth-1 signal
//! so a burst of rotations never builds a backlog. A pass enforces the
//! count cap, ages out old segments during the off-peak hours, and
//! gzip-compresses whatever remains uncompressed.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};
use time::OffsetDateTime;

use crate::clock::Clock;
use crate::naming::{name_offset, SegmentPaths, COMPRESS_SUFFIX};
use crate::policy::{RotationPolicy, OFFPEAK_END_HOUR, OFFPEAK_START_HOUR};
use crate::{Error, Result};

/// Spawns the worker that consumes the rotation signal. Exits once every
/// sender of `rx` is dropped.
pub(crate) fn spawn_worker(
    rx: Receiver<()>,
    paths: SegmentPaths,
    policy: RotationPolicy,
    clock: Arc<dyn Clock>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while rx.recv().is_ok() {
            if let Err(err) = run_once(&paths, &policy, clock.now()) {
                warn!("retention pass failed: {err}");
            }
        }
    })
}

/// One retention/compression pass.
///
/// Every eligible candidate is attempted; the first error encountered is
/// returned after the pass completes, so one bad file cannot shadow the
/// rest.
pub(crate) fn run_once(paths: &SegmentPaths, policy: &RotationPolicy, now: SystemTime) -> Result<()> {
    if policy.max_backups == 0 && policy.max_age_days == 0 && !policy.compress {
        return Ok(());
    }

    let backups = paths.scan_backups()?;

    let mut remove = Vec::new();
    let mut keep = Vec::new();

    if policy.max_backups > 0 {
        // A compressed segment and its uncompressed counterpart count as one
        // name against the cap.
        let mut preserved = HashSet::new();
        for backup in backups {
            preserved.insert(backup.base_name().to_string());
            if preserved.len() > policy.max_backups {
                remove.push(backup);
            } else {
                keep.push(backup);
            }
        }
    } else {
        keep = backups;
    }

    if policy.max_age_days > 0 && in_offpeak_window(now, policy.local_time) {
        let cutoff = now - Duration::from_secs(u64::from(policy.max_age_days) * 86_400);
        let mut remaining = Vec::new();
        for backup in keep {
            if backup.modified < cutoff {
                remove.push(backup);
            } else {
                remaining.push(backup);
            }
        }
        keep = remaining;
    }

    let mut compress = Vec::new();
    if policy.compress {
        for backup in keep {
            if !backup.name.ends_with(COMPRESS_SUFFIX) {
                compress.push(backup);
            }
        }
    }

    let mut first_err: Option<Error> = None;
    let mut removed = 0usize;
    for backup in &remove {
        match fs::remove_file(&backup.path) {
            Ok(()) => removed += 1,
            Err(err) => {
                warn!("cannot remove {}: {err}", backup.path.display());
                first_err.get_or_insert(err.into());
            }
        }
    }

    let mut compressed = 0usize;
    for backup in &compress {
        let dst = compressed_path(&backup.path);
        match compress_file(&backup.path, &dst) {
            Ok(()) => compressed += 1,
            Err(err) => {
                warn!("cannot compress {}: {err}", backup.path.display());
                first_err.get_or_insert(err);
            }
        }
    }

    if removed > 0 || compressed > 0 {
        debug!("retention pass: removed {removed}, compressed {compressed}");
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Whether `now` falls in the low-traffic hours reserved for age cleanup.
fn in_offpeak_window(now: SystemTime, local: bool) -> bool {
    let hour = OffsetDateTime::from(now).to_offset(name_offset(local)).hour();
    (OFFPEAK_START_HOUR..=OFFPEAK_END_HOUR).contains(&hour)
}

fn compressed_path(path: &Path) -> PathBuf {
    let mut os: OsString = path.into();
    os.push(COMPRESS_SUFFIX);
    PathBuf::from(os)
}

/// Gzip `src` into `dst`, removing `src` only once the stream is fully
/// written and synced. A failed attempt deletes the partial `dst` and leaves
/// `src` untouched.
pub(crate) fn compress_file(src: &Path, dst: &Path) -> Result<()> {
    if let Err(err) = write_gzip(src, dst) {
        let _ = fs::remove_file(dst);
        return Err(err);
    }
    fs::remove_file(src)?;
    Ok(())
}

fn write_gzip(src: &Path, dst: &Path) -> Result<()> {
    let mut input = File::open(src)?;
    let output = File::create(dst)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    let output = encoder.finish()?;
    output.sync_all()?;
    Ok(())
}
