//! Console monitor: runs the reconciliation loop on the main thread and
//! redraws a small dashboard whenever the engine state changes.

#[cfg(windows)]
fn main() -> anyhow::Result<()> {
    monitor::run()
}

#[cfg(not(windows))]
fn main() {
    eprintln!("modfix drives the Windows keyboard stack and only runs on Windows.");
    std::process::exit(1);
}

#[cfg(windows)]
mod monitor {
    use anyhow::{Context, Result};
    use crossterm::event::{Event, KeyCode, KeyEventKind};
    use crossterm::style::Print;
    use crossterm::terminal::{Clear, ClearType};
    use crossterm::{cursor, event, queue, terminal};
    use modfix_core::config::Config;
    use modfix_core::fixer::{EngineSnapshot, FixEngine};
    use modfix_core::hook::{AsyncKeyQuery, KeyInjector, KeyboardCapture};
    use std::io::{self, Write};
    use std::time::Duration;
    use tracing::info;

    const CYCLE_WAIT: Duration = Duration::from_millis(50);

    pub fn run() -> Result<()> {
        let config_path = Config::default_path();
        let config = Config::load_or_default(&config_path);

        let level = if config.advanced.debug_mode {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(io::stderr)
            .with_target(false)
            .init();

        info!(
            path = %config_path.display(),
            threshold_ms = config.general.threshold_ms,
            "configuration loaded"
        );

        let capture = KeyboardCapture::install().context(
            "could not acquire the keyboard (is another instance running, or is elevation needed?)",
        )?;

        let mut engine = FixEngine::new(
            &config,
            Box::new(capture),
            Box::new(KeyInjector),
            Box::new(AsyncKeyQuery),
        );

        terminal::enable_raw_mode()?;
        let outcome = monitor_loop(&mut engine);
        terminal::disable_raw_mode()?;

        print_statistics(&engine);
        outcome
    }

    fn monitor_loop(engine: &mut FixEngine) -> Result<()> {
        let mut stdout = io::stdout();
        let mut last = EngineSnapshot::default();

        loop {
            while event::poll(Duration::ZERO)? {
                if let Event::Key(key) = event::read()? {
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    match key.code {
                        KeyCode::Esc => return Ok(()),
                        KeyCode::Char('p') | KeyCode::Char('P') => {
                            if engine.is_paused() {
                                engine.resume();
                            } else {
                                engine.pause();
                            }
                        }
                        _ => {}
                    }
                }
            }

            engine.process_events(CYCLE_WAIT);

            let snapshot = engine.snapshot();
            if snapshot != last {
                draw(&mut stdout, &snapshot)?;
                last = snapshot;
            }
        }
    }

    fn draw(out: &mut impl Write, snapshot: &EngineSnapshot) -> Result<()> {
        queue!(out, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
        queue!(
            out,
            Print("=== Modifier Key Auto-Fix Monitor ===\r\n"),
            Print(format!(
                "Threshold: {}ms | Total Fixes: {} | Status: {}\r\n",
                snapshot.threshold_ms,
                snapshot.total_fixes,
                if snapshot.paused { "PAUSED" } else { "RUNNING" }
            )),
            Print("Press ESC to exit | Press P to pause/resume\r\n\r\n"),
        )?;

        for key in &snapshot.keys {
            let mut line = format!(
                "{:<12}: Physical[{}] Virtual[{}]",
                key.name,
                if key.physical { "PRESSED " } else { "RELEASED" },
                if key.logical { "PRESSED " } else { "RELEASED" },
            );
            if key.mismatched {
                line.push_str(&format!(" <-- MISMATCH ({}ms)", key.mismatch_ms));
                if key.stuck {
                    line.push_str(" [STUCK!]");
                }
            }
            line.push_str("\r\n");
            queue!(out, Print(line))?;
        }

        let status = if snapshot.paused {
            "Monitoring PAUSED. Press P to resume."
        } else if snapshot.keys.iter().any(|k| k.stuck) {
            "Stuck keys detected! Press any key to auto-fix."
        } else {
            "All keys normal. Monitoring..."
        };
        queue!(out, Print(format!("\r\nStatus: {status}\r\n")))?;

        out.flush()?;
        Ok(())
    }

    fn print_statistics(engine: &FixEngine) {
        let snapshot = engine.snapshot();
        println!("\nFix Statistics:");
        println!("  Total fixes: {}", snapshot.total_fixes);
        for key in snapshot.keys.iter().filter(|k| k.fixes > 0) {
            println!("  {}: {}", key.name, key.fixes);
        }
    }
}
