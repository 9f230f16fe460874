//! Segment path layout and backup-name handling.
//!
//! One sink owns one canonical file, `<dir>/<name><ext>`. Rotation retires
//! it under `<name>-<YYYY-MM-DD-HH-MM-SS><ext>`, appending `.gz` once the
//! mill compresses it, and the pre-open scheduler stages the next segment
//! under the fixed `<dir>/.new<ext>` name.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use crate::Result;

/// Timestamp embedded in backup names, second resolution.
const BACKUP_TIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]-[hour]-[minute]-[second]");

/// Extension appended to compressed backups.
pub(crate) const COMPRESS_SUFFIX: &str = ".gz";

/// Stem of the pre-opened staging file; the active extension is appended.
const STAGING_STEM: &str = ".new";

/// Offset used for backup names and the off-peak window.
///
/// The local offset is indeterminate in some environments (multi-threaded
/// processes on certain platforms); UTC is the fallback.
pub(crate) fn name_offset(local: bool) -> UtcOffset {
    if local {
        UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC)
    } else {
        UtcOffset::UTC
    }
}

/// A retired segment found on disk.
#[derive(Debug, Clone)]
pub(crate) struct Backup {
    pub path: PathBuf,
    pub name: String,
    pub modified: SystemTime,
}

impl Backup {
    /// File name with any compression suffix stripped, so a `.gz` and its
    /// uncompressed counterpart collapse to one name for retention counting.
    pub fn base_name(&self) -> &str {
        self.name
            .strip_suffix(COMPRESS_SUFFIX)
            .unwrap_or(&self.name)
    }
}

/// Path layout for one sink: directory, file stem and extension.
#[derive(Debug, Clone)]
pub(crate) struct SegmentPaths {
    dir: PathBuf,
    prefix: String,
    ext: String,
}

impl SegmentPaths {
    pub fn new(dir: impl Into<PathBuf>, file_name: &str) -> Self {
        let (prefix, ext) = match file_name.rfind('.') {
            Some(dot) if dot > 0 => (&file_name[..dot], &file_name[dot..]),
            _ => (file_name, ""),
        };
        Self {
            dir: dir.into(),
            prefix: prefix.to_string(),
            ext: ext.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The canonical file currently receiving writes.
    pub fn active(&self) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix, self.ext))
    }

    /// The fixed staging name used by the pre-open scheduler.
    pub fn staging(&self) -> PathBuf {
        self.dir.join(format!("{STAGING_STEM}{}", self.ext))
    }

    /// Backup name embedding `ts` at second resolution.
    pub fn backup(&self, ts: SystemTime, local: bool) -> Result<PathBuf> {
        let stamp = format_stamp(ts, local)?;
        Ok(self
            .dir
            .join(format!("{}-{}{}", self.prefix, stamp, self.ext)))
    }

    /// Backup name with a sub-second disambiguator, for when the plain name
    /// already exists in the directory.
    pub fn backup_disambiguated(&self, ts: SystemTime, local: bool, micros: u32) -> Result<PathBuf> {
        let stamp = format_stamp(ts, local)?;
        Ok(self
            .dir
            .join(format!("{}-{}.{}{}", self.prefix, stamp, micros, self.ext)))
    }

    /// Whether `name` looks like one of this sink's retired segments,
    /// compressed or not.
    pub fn is_backup_name(&self, name: &str) -> bool {
        if !name.starts_with(&format!("{}-", self.prefix)) {
            return false;
        }
        name.ends_with(&self.ext) || name.ends_with(&format!("{}{COMPRESS_SUFFIX}", self.ext))
    }

    /// All retired segments in the directory, newest first by modification
    /// time.
    pub fn scan_backups(&self) -> Result<Vec<Backup>> {
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if !self.is_backup_name(&name) {
                continue;
            }
            backups.push(Backup {
                path: entry.path(),
                name,
                modified: meta.modified()?,
            });
        }
        backups.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(backups)
    }
}

fn format_stamp(ts: SystemTime, local: bool) -> Result<String> {
    let stamp = OffsetDateTime::from(ts)
        .to_offset(name_offset(local))
        .format(&BACKUP_TIME_FORMAT)?;
    Ok(stamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn paths_in(dir: &Path) -> SegmentPaths {
        SegmentPaths::new(dir, "app.log")
    }

    #[test]
    fn layout_splits_name_and_extension() {
        let paths = SegmentPaths::new("/var/log", "app.log");
        assert_eq!(paths.active(), PathBuf::from("/var/log/app.log"));
        assert_eq!(paths.staging(), PathBuf::from("/var/log/.new.log"));

        let bare = SegmentPaths::new("/var/log", "app");
        assert_eq!(bare.active(), PathBuf::from("/var/log/app"));
        assert_eq!(bare.staging(), PathBuf::from("/var/log/.new"));
    }

    #[test]
    fn backup_name_embeds_utc_stamp() {
        let paths = SegmentPaths::new("/var/log", "app.log");
        let ts = UNIX_EPOCH + Duration::from_secs(1_700_000_040);

        let backup = paths.backup(ts, false).unwrap();
        assert_eq!(
            backup,
            PathBuf::from("/var/log/app-2023-11-14-22-14-00.log")
        );

        let collided = paths.backup_disambiguated(ts, false, 123_456).unwrap();
        assert_eq!(
            collided,
            PathBuf::from("/var/log/app-2023-11-14-22-14-00.123456.log")
        );
    }

    #[test]
    fn backup_matching_accepts_compressed_variant() {
        let paths = SegmentPaths::new("/var/log", "app.log");
        assert!(paths.is_backup_name("app-2023-11-14-22-14-00.log"));
        assert!(paths.is_backup_name("app-2023-11-14-22-14-00.log.gz"));
        assert!(paths.is_backup_name("app-2023-11-14-22-14-00.123456.log"));
        assert!(!paths.is_backup_name("app.log"));
        assert!(!paths.is_backup_name(".new.log"));
        assert!(!paths.is_backup_name("other-2023-11-14-22-14-00.log"));
    }

    #[test]
    fn scan_orders_newest_first() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(dir.path());

        for name in [
            "app-2023-11-14-22-14-00.log",
            "app-2023-11-14-22-15-00.log",
            "app-2023-11-14-22-16-00.log.gz",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
        fs::write(dir.path().join("app.log"), b"active").unwrap();
        fs::write(dir.path().join(".new.log"), b"").unwrap();

        let backups = paths.scan_backups().unwrap();
        assert_eq!(backups.len(), 3);
        assert_eq!(backups[0].name, "app-2023-11-14-22-16-00.log.gz");
        assert_eq!(backups[0].base_name(), "app-2023-11-14-22-16-00.log");
        assert_eq!(backups[2].name, "app-2023-11-14-22-14-00.log");
    }
}
