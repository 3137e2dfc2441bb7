//! Background worker for front ends that are not the console monitor.
//!
//! The worker thread owns the engine exclusively; everyone else talks to it
//! through commands and reads the latest published snapshot.

use crate::config::Config;
use crate::fixer::{EngineSnapshot, FixEngine};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::info;

const CYCLE_WAIT: Duration = Duration::from_millis(50);

enum Command {
    Pause,
    Resume,
    ApplyConfig(Box<Config>),
    Reinitialize(Box<Config>),
    ResetStatistics,
    Shutdown,
}

/// Handle to a running fixer worker. Dropping the handle shuts the worker
/// down and joins it.
pub struct FixerService {
    commands: Sender<Command>,
    snapshot: Arc<Mutex<EngineSnapshot>>,
    worker: Option<JoinHandle<()>>,
}

impl FixerService {
    pub fn spawn(engine: FixEngine) -> Self {
        let (commands, receiver) = unbounded();
        let snapshot = Arc::new(Mutex::new(engine.snapshot()));
        let shared = Arc::clone(&snapshot);
        let worker = std::thread::Builder::new()
            .name("modfix-worker".into())
            .spawn(move || worker_loop(engine, receiver, shared))
            .expect("failed to spawn worker thread");

        Self {
            commands,
            snapshot,
            worker: Some(worker),
        }
    }

    /// Latest state published by the worker, at most one cycle old.
    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot.lock().clone()
    }

    pub fn pause(&self) {
        let _ = self.commands.send(Command::Pause);
    }

    pub fn resume(&self) {
        let _ = self.commands.send(Command::Resume);
    }

    pub fn apply_config(&self, config: Config) {
        let _ = self.commands.send(Command::ApplyConfig(Box::new(config)));
    }

    pub fn reinitialize(&self, config: Config) {
        let _ = self.commands.send(Command::Reinitialize(Box::new(config)));
    }

    pub fn reset_statistics(&self) {
        let _ = self.commands.send(Command::ResetStatistics);
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.commands.send(Command::Shutdown);
            let _ = worker.join();
        }
    }
}

impl Drop for FixerService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    mut engine: FixEngine,
    commands: Receiver<Command>,
    shared: Arc<Mutex<EngineSnapshot>>,
) {
    info!("fixer worker started");
    loop {
        loop {
            match commands.try_recv() {
                Ok(Command::Pause) => engine.pause(),
                Ok(Command::Resume) => engine.resume(),
                Ok(Command::ApplyConfig(config)) => engine.apply_config(&config),
                Ok(Command::Reinitialize(config)) => engine.reinitialize(&config),
                Ok(Command::ResetStatistics) => engine.reset_statistics(),
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => {
                    info!("fixer worker stopping");
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        engine.process_events(CYCLE_WAIT);
        *shared.lock() = engine.snapshot();
    }
}
