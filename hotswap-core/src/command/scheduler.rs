//! Command Scheduler - debounces, merges and launches commands

use super::{Command, CommandKey, DuplicatePolicy};
use crate::{lock, panic_message};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, trace, warn};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due commands are looked for
    pub tick_interval: Duration,
    /// Debounce window used by [`CommandScheduler::schedule`]
    pub default_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            default_timeout: Duration::from_millis(100),
        }
    }
}

/// Counters since the scheduler was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub merged: u64,
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Debug)]
struct ScheduledEntry {
    command: Box<dyn Command>,
    due: Instant,
    policy: DuplicatePolicy,
}

#[derive(Debug, Default)]
struct State {
    pending: HashMap<CommandKey, ScheduledEntry>,
    running: HashMap<CommandKey, usize>,
    stats: SchedulerStats,
}

struct Shared {
    config: SchedulerConfig,
    // Pending and running bookkeeping share one lock so that detecting an
    // equal command and storing the merge result cannot interleave.
    state: Mutex<State>,
    stopped: AtomicBool,
    ticking: AtomicBool,
}

/// Debouncing command scheduler.
///
/// Equal commands scheduled before the pending one is due are merged into it
/// and push its due time back. Due commands run on tokio's blocking pool.
#[derive(Clone)]
pub struct CommandScheduler {
    shared: Arc<Shared>,
}

impl CommandScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State::default()),
                stopped: AtomicBool::new(false),
                ticking: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Schedule with the default timeout and [`DuplicatePolicy::WaitAndRunAfter`]
    pub fn schedule<C: Command>(&self, command: C) {
        self.schedule_with(command, self.shared.config.default_timeout, DuplicatePolicy::default());
    }

    /// Schedule with [`DuplicatePolicy::WaitAndRunAfter`]
    pub fn schedule_in<C: Command>(&self, command: C, timeout: Duration) {
        self.schedule_with(command, timeout, DuplicatePolicy::default());
    }

    /// Schedule `command` to run once `timeout` passes without an equal
    /// command arriving.
    pub fn schedule_with<C: Command>(&self, command: C, timeout: Duration, policy: DuplicatePolicy) {
        if self.shared.stopped.load(Ordering::SeqCst) {
            debug!("Scheduler stopped, ignoring {:?}", command);
            return;
        }

        let key = command.key();
        let due = Instant::now() + timeout;
        let command: Box<dyn Command> = Box::new(command);

        let mut state = lock(&self.shared.state);
        state.stats.scheduled += 1;

        let command = match state.pending.remove(&key) {
            Some(existing) => {
                state.stats.merged += 1;
                trace!("Merging into pending command {:?}", key);
                existing.command.merge(command)
            }
            None => {
                trace!("Scheduling command {:?} in {:?}", key, timeout);
                command
            }
        };

        state.pending.insert(key, ScheduledEntry { command, due, policy });
    }

    /// Launch every due command allowed by its duplicate policy. Returns the
    /// number of launched commands.
    pub fn process_commands(&self) -> usize {
        let now = Instant::now();
        let mut launch = Vec::new();

        {
            let mut state = lock(&self.shared.state);
            let due: Vec<CommandKey> = state
                .pending
                .iter()
                .filter(|(_, entry)| entry.due <= now)
                .map(|(key, _)| key.clone())
                .collect();

            for key in due {
                let busy = state.running.get(&key).is_some_and(|count| *count > 0);
                let policy = match state.pending.get(&key) {
                    Some(entry) => entry.policy,
                    None => continue,
                };

                if busy {
                    match policy {
                        DuplicatePolicy::WaitAndRunAfter => {
                            trace!("Command {:?} still running, waiting", key);
                            continue;
                        }
                        DuplicatePolicy::Skip => {
                            state.pending.remove(&key);
                            state.stats.skipped += 1;
                            debug!("Command {:?} still running, skipping duplicate", key);
                            continue;
                        }
                        DuplicatePolicy::RunDuplicate => {
                            debug!("Command {:?} still running, launching duplicate", key);
                        }
                    }
                }

                if let Some(entry) = state.pending.remove(&key) {
                    *state.running.entry(key.clone()).or_insert(0) += 1;
                    launch.push((key, entry.command));
                }
            }
        }

        let launched = launch.len();
        for (key, command) in launch {
            self.launch(key, command);
        }
        launched
    }

    fn launch(&self, key: CommandKey, command: Box<dyn Command>) {
        let guard = RunningGuard { shared: self.shared.clone(), key };

        let job = move || {
            let guard = guard;
            trace!("Executing command {:?}", guard.key);
            let outcome = catch_unwind(AssertUnwindSafe(|| command.execute()));
            let mut state = lock(&guard.shared.state);
            match outcome {
                Ok(Ok(())) => state.stats.executed += 1,
                Ok(Err(e)) => {
                    state.stats.failed += 1;
                    error!("Command {:?} failed: {:#}", guard.key, e);
                }
                Err(panic) => {
                    state.stats.failed += 1;
                    error!("Command {:?} panicked: {}", guard.key, panic_message(panic.as_ref()));
                }
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => {
                let spawned = std::thread::Builder::new().name("hotswap-command".into()).spawn(job);
                if let Err(e) = spawned {
                    error!("Unable to spawn command thread: {}", e);
                }
            }
        }
    }

    /// Start the tick loop. Must be called from within a tokio runtime.
    ///
    /// Returns `None` when a tick loop is already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let scheduler = self.clone();
        let tick = self.shared.config.tick_interval;

        if self.shared.ticking.swap(true, Ordering::SeqCst) {
            warn!("Scheduler is already running");
            return None;
        }
        info!("Starting command scheduler (tick {:?})", tick);

        Some(tokio::spawn(async move {
            let mut ticks = interval(tick);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while !scheduler.shared.stopped.load(Ordering::SeqCst) {
                ticks.tick().await;
                scheduler.process_commands();
            }
            scheduler.shared.ticking.store(false, Ordering::SeqCst);
            debug!("Command scheduler loop finished");
        }))
    }

    /// Stop ticking and discard pending commands. Commands already running
    /// finish normally; later schedules are ignored.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = lock(&self.shared.state);
        let discarded = state.pending.len();
        state.pending.clear();
        info!("Stopping command scheduler, discarded {} pending commands", discarded);
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.shared.state).pending.len()
    }

    /// Number of executions in flight
    pub fn running_count(&self) -> usize {
        lock(&self.shared.state).running.values().sum()
    }

    pub fn is_pending(&self, key: &CommandKey) -> bool {
        lock(&self.shared.state).pending.contains_key(key)
    }

    pub fn is_running(&self, key: &CommandKey) -> bool {
        lock(&self.shared.state).running.contains_key(key)
    }

    pub fn stats(&self) -> SchedulerStats {
        lock(&self.shared.state).stats
    }
}

impl std::fmt::Debug for CommandScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandScheduler")
            .field("config", &self.shared.config)
            .field("pending", &self.pending_count())
            .field("running", &self.running_count())
            .finish()
    }
}

/// Releases a running slot on every exit path of an execution
struct RunningGuard {
    shared: Arc<Shared>,
    key: CommandKey,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.shared.state);
        if let Some(count) = state.running.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                state.running.remove(&self.key);
            }
        }
    }
}
