//! Minimal demo: a sink rotating on a 1 minute window, written to directly
//! and through the `io::Write` adapter.
//!
//! Run with `RUST_LOG=debug` to watch the engine's own rotation and
//! retention events.

use std::io::Write;
use std::thread;
use std::time::Duration;

use logmill::RollingFile;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let sink = RollingFile::builder("./logs", "demo.log")
        .window_minutes(1)
        .max_size(1024 * 1024)
        .max_backups(3)
        .compress(true)
        .build()?;

    for i in 0..50 {
        let line = format!("demo line {i}\n");
        sink.write(line.as_bytes())?;
        thread::sleep(Duration::from_millis(20));
    }

    // The adapter lets the sink slot under anything expecting io::Write.
    writeln!(&mut &sink, "and one through the adapter")?;

    sink.rotate()?;
    thread::sleep(Duration::from_secs(1));
    sink.close()?;
    Ok(())
}
