use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use logmill::RollingFile;
use tempfile::tempdir;

fn wait_for(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    pred()
}

fn backups_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|entry| entry.expect("dir entry").file_name().into_string().ok())
        .filter(|name| name.starts_with("app-"))
        .collect();
    names.sort();
    names
}

#[test]
fn backup_count_is_capped_across_rotations() {
    let dir = tempdir().expect("tempdir");

    let sink = RollingFile::builder(dir.path(), "app.log")
        .size_only()
        .max_size(1024 * 1024)
        .max_backups(2)
        .local_time(false)
        .debounce(Duration::from_millis(10))
        .build()
        .expect("build sink");

    let active = dir.path().join("app.log");
    let mut after_first = Vec::new();

    for cycle in 0..3usize {
        let payload = format!("cycle-{cycle}");
        sink.write(payload.as_bytes()).expect("write");
        assert!(wait_for(
            || {
                fs::read(&active)
                    .map(|c| c == payload.as_bytes())
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
        ));

        sink.rotate().expect("rotate");
        let expected = (cycle + 1).min(2);
        assert!(wait_for(
            || backups_in(dir.path()).len() == expected,
            Duration::from_secs(10),
        ));

        if cycle == 0 {
            after_first = backups_in(dir.path());
        }
        // Distinct mtimes keep the retention ordering unambiguous.
        std::thread::sleep(Duration::from_millis(50));
    }

    // Two backups remain and the oldest one is the one that went.
    let survivors = backups_in(dir.path());
    assert_eq!(survivors.len(), 2);
    assert!(!survivors.contains(&after_first[0]));

    sink.close().expect("close");
}

#[test]
fn unlimited_backups_are_all_kept() {
    let dir = tempdir().expect("tempdir");

    let sink = RollingFile::builder(dir.path(), "app.log")
        .size_only()
        .max_size(1024 * 1024)
        .local_time(false)
        .debounce(Duration::from_millis(10))
        .build()
        .expect("build sink");

    let active = dir.path().join("app.log");
    for cycle in 0..3usize {
        let payload = format!("cycle-{cycle}");
        sink.write(payload.as_bytes()).expect("write");
        assert!(wait_for(
            || {
                fs::read(&active)
                    .map(|c| c == payload.as_bytes())
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
        ));
        sink.rotate().expect("rotate");
        assert!(wait_for(
            || backups_in(dir.path()).len() == cycle + 1,
            Duration::from_secs(10),
        ));
        std::thread::sleep(Duration::from_millis(50));
    }

    assert_eq!(backups_in(dir.path()).len(), 3);
    sink.close().expect("close");
}
