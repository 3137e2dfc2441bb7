//! Prints raw keystrokes as the capture sees them, for a few seconds.
//! Useful to find the scan code of a key you want to remap or monitor.

#[cfg(windows)]
fn main() -> anyhow::Result<()> {
    use modfix_core::hook::{KeyInjector, KeyboardCapture};
    use modfix_core::types::{EventSink, EventSource};
    use std::time::{Duration, Instant};

    tracing_subscriber::fmt::init();

    let mut capture = KeyboardCapture::install()?;
    let mut injector = KeyInjector;
    println!("Press keys to see their scan codes. Exiting in 10 seconds.");

    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Some(event) = capture.wait_for_event(Duration::from_millis(50)) {
            println!(
                "sc={:#04X} ext={} {}",
                event.key.sc,
                event.key.ext,
                if event.up { "up" } else { "down" }
            );
            // Pass the keystroke along so typing keeps working.
            injector.inject(event)?;
        }
    }
    Ok(())
}

#[cfg(not(windows))]
fn main() {
    eprintln!("capture_probe only runs on Windows.");
}
