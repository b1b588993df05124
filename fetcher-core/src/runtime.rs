//! TaskRuntime (spec §4.1): supervises the long-running components
//! (EmailSource, Coordinator, SiteWorkers, DelayScheduler), restarting
//! crashed tasks with backoff and shutting them down in a fixed order.
//!
//! Grounded on `ferrex-core/src/scan/orchestration/runtime/supervisor.rs`'s
//! `OrchestratorRuntime`: a registry of named tasks behind an async `RwLock`,
//! one `CancellationToken` per supervised task, and a `shutdown()` that
//! cancels then joins with a timeout before forcibly aborting stragglers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RuntimeConfig;

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type TaskEntrypoint = Arc<dyn Fn(CancellationToken) -> TaskFuture + Send + Sync>;

/// Lifecycle state of one registered task (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Restarting,
}

/// Shutdown ordering group: sources stop first, then the coordinator, then
/// workers, then the delay scheduler last so in-flight reinjections have a
/// chance to land before it stops accepting them (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShutdownGroup {
    Source,
    Coordinator,
    Worker,
    Scheduler,
}

const SHUTDOWN_ORDER: [ShutdownGroup; 4] = [
    ShutdownGroup::Source,
    ShutdownGroup::Coordinator,
    ShutdownGroup::Worker,
    ShutdownGroup::Scheduler,
];

struct Task {
    entrypoint: TaskEntrypoint,
    group: ShutdownGroup,
    state: TaskState,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    restart_attempts: u32,
}

/// Supervises a fixed set of named background tasks for the lifetime of the
/// process.
pub struct TaskRuntime {
    config: RuntimeConfig,
    tasks: Arc<RwLock<HashMap<String, Task>>>,
    stop_requested: Arc<AtomicBool>,
    monitor_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TaskRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            stop_requested: Arc::new(AtomicBool::new(false)),
            monitor_handle: std::sync::Mutex::new(None),
        }
    }

    /// Register a task. `entrypoint` is invoked with a fresh
    /// [`CancellationToken`] each time the task (re)starts.
    pub async fn register<F>(&self, name: impl Into<String>, group: ShutdownGroup, entrypoint: F)
    where
        F: Fn(CancellationToken) -> TaskFuture + Send + Sync + 'static,
    {
        let mut tasks = self.tasks.write().await;
        tasks.insert(
            name.into(),
            Task {
                entrypoint: Arc::new(entrypoint),
                group,
                state: TaskState::Registered,
                cancel: CancellationToken::new(),
                handle: None,
                restart_attempts: 0,
            },
        );
    }

    /// Spawn every registered task and, if `enable_monitoring`, the
    /// background health-check/restart loop.
    pub async fn start_all(self: &Arc<Self>) {
        let names: Vec<String> = {
            let mut tasks = self.tasks.write().await;
            for task in tasks.values_mut() {
                task.cancel = CancellationToken::new();
            }
            tasks.keys().cloned().collect()
        };
        for name in names {
            self.spawn_task(&name).await;
        }

        if self.config.enable_monitoring {
            let runtime = Arc::clone(self);
            let handle = tokio::spawn(async move { runtime.monitor_loop().await });
            *self.monitor_handle.lock().unwrap() = Some(handle);
        }
        info!("task runtime started");
    }

    async fn spawn_task(&self, name: &str) {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(name) else {
            return;
        };
        task.state = TaskState::Starting;
        let entrypoint = Arc::clone(&task.entrypoint);
        let cancel = task.cancel.clone();
        task.handle = Some(tokio::spawn(entrypoint(cancel)));
        task.state = TaskState::Running;
    }

    async fn monitor_loop(self: Arc<Self>) {
        let interval = Duration::from_secs_f64(self.config.health_check_interval);
        loop {
            tokio::time::sleep(interval).await;
            if self.stop_requested.load(AtomicOrdering::SeqCst) {
                break;
            }
            self.check_and_restart().await;
        }
    }

    async fn check_and_restart(&self) {
        let crashed: Vec<String> = {
            let tasks = self.tasks.read().await;
            tasks
                .iter()
                .filter(|(_, t)| {
                    !t.cancel.is_cancelled()
                        && t.handle.as_ref().is_some_and(JoinHandle::is_finished)
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        for name in crashed {
            self.handle_crash(&name).await;
        }
    }

    async fn handle_crash(&self, name: &str) {
        let finished_handle = {
            let mut tasks = self.tasks.write().await;
            tasks.get_mut(name).and_then(|task| task.handle.take())
        };
        match finished_handle {
            Some(handle) => match handle.await {
                Ok(()) => warn!(name, "task exited unexpectedly without being cancelled"),
                Err(join_err) => error!(name, error = %join_err, "task panicked"),
            },
            None => return,
        }

        let should_restart = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(name) else {
                return;
            };
            if self.config.auto_restart && task.restart_attempts < self.config.max_restart_attempts
            {
                task.restart_attempts += 1;
                task.state = TaskState::Restarting;
                true
            } else {
                task.state = TaskState::Crashed;
                false
            }
        };

        if should_restart {
            warn!(name, "restarting crashed task after backoff");
            tokio::time::sleep(Duration::from_secs_f64(self.config.restart_delay)).await;
            {
                let mut tasks = self.tasks.write().await;
                if let Some(task) = tasks.get_mut(name) {
                    task.cancel = CancellationToken::new();
                }
            }
            self.spawn_task(name).await;
        } else {
            error!(name, "task exhausted restart attempts, marked crashed");
        }
    }

    /// Snapshot of every registered task's current state.
    pub async fn health(&self) -> HashMap<String, TaskState> {
        let tasks = self.tasks.read().await;
        tasks.iter().map(|(name, t)| (name.clone(), t.state)).collect()
    }

    /// Stop a single named task, independent of shutdown-group ordering.
    /// Used for targeted restarts/maintenance; full shutdown goes through
    /// [`TaskRuntime::stop_all`] so ordering is respected.
    pub async fn stop(&self, name: &str) {
        let handle = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(name) else {
                warn!(name, "stop called for unregistered task");
                return;
            };
            task.state = TaskState::Stopping;
            task.cancel.cancel();
            task.handle.take()
        };
        if let Some(handle) = handle {
            let timeout = Duration::from_secs_f64(self.config.shutdown_timeout);
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(name, error = %e, "task panicked while stopping"),
                Err(_) => warn!(name, "task did not exit within shutdown_timeout"),
            }
        }
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(name) {
            task.state = TaskState::Stopped;
        }
    }

    /// Block until every registered task reaches a terminal state
    /// (`Stopped` or `Crashed`), or `timeout` elapses. Returns `true` if all
    /// tasks were terminal before the deadline.
    pub async fn wait_all(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let all_terminal = {
                let tasks = self.tasks.read().await;
                tasks
                    .values()
                    .all(|t| matches!(t.state, TaskState::Stopped | TaskState::Crashed))
            };
            if all_terminal {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop every task in shutdown-group order: cancel a group's tokens,
    /// wait (bounded by the overall `shutdown_timeout`) for those tasks to
    /// exit, then move to the next group. Idempotent — a second call is a
    /// no-op, which is what makes repeated OS signals safe (spec §4.1).
    pub async fn stop_all(&self) {
        if self.stop_requested.swap(true, AtomicOrdering::SeqCst) {
            debug_already_stopping();
            return;
        }

        if let Some(handle) = self.monitor_handle.lock().unwrap().take() {
            handle.abort();
        }

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs_f64(self.config.shutdown_timeout);

        for group in SHUTDOWN_ORDER {
            self.stop_group(group, deadline).await;
        }

        let mut tasks = self.tasks.write().await;
        for (name, task) in tasks.iter_mut() {
            if let Some(handle) = task.handle.take() {
                if !handle.is_finished() {
                    warn!(name, "forcibly terminating task past shutdown_timeout");
                    handle.abort();
                }
            }
            task.state = TaskState::Stopped;
        }
        info!("task runtime stopped");
    }

    async fn stop_group(&self, group: ShutdownGroup, deadline: tokio::time::Instant) {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut tasks = self.tasks.write().await;
            let mut drained = Vec::new();
            for (name, task) in tasks.iter_mut() {
                if task.group != group {
                    continue;
                }
                task.state = TaskState::Stopping;
                task.cancel.cancel();
                if let Some(handle) = task.handle.take() {
                    drained.push((name.clone(), handle));
                }
            }
            drained
        };

        for (name, handle) in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(name, error = %e, "task panicked during shutdown"),
                Err(_) => {
                    warn!(name, "task did not exit within shutdown_timeout, will be aborted");
                }
            }
        }
    }
}

fn debug_already_stopping() {
    tracing::debug!("stop_all called again, ignoring (already stopping)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_task(
        started: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    ) -> impl Fn(CancellationToken) -> TaskFuture + Send + Sync + 'static {
        move |cancel: CancellationToken| {
            let started = Arc::clone(&started);
            let stopped = Arc::clone(&stopped);
            Box::pin(async move {
                started.fetch_add(1, AtomicOrdering::SeqCst);
                cancel.cancelled().await;
                stopped.fetch_add(1, AtomicOrdering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn start_all_runs_every_registered_task() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut config = RuntimeConfig::default();
        config.enable_monitoring = false;
        let runtime = Arc::new(TaskRuntime::new(config));

        runtime
            .register("source", ShutdownGroup::Source, counting_task(started.clone(), stopped.clone()))
            .await;
        runtime
            .register("worker", ShutdownGroup::Worker, counting_task(started.clone(), stopped.clone()))
            .await;

        runtime.start_all().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(AtomicOrdering::SeqCst), 2);

        runtime.stop_all().await;
        assert_eq!(stopped.load(AtomicOrdering::SeqCst), 2);

        let health = runtime.health().await;
        assert!(health.values().all(|s| *s == TaskState::Stopped));
    }

    #[tokio::test]
    async fn stop_all_is_idempotent_under_repeated_calls() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut config = RuntimeConfig::default();
        config.enable_monitoring = false;
        let runtime = Arc::new(TaskRuntime::new(config));
        runtime
            .register("source", ShutdownGroup::Source, counting_task(started, stopped.clone()))
            .await;
        runtime.start_all().await;

        let (a, b) = tokio::join!(runtime.stop_all(), runtime.stop_all());
        let _ = (a, b);
        assert_eq!(stopped.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn crashed_task_restarts_up_to_the_configured_cap() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut config = RuntimeConfig::default();
        config.health_check_interval = 0.05;
        config.restart_delay = 0.01;
        config.max_restart_attempts = 2;
        config.auto_restart = true;
        let runtime = Arc::new(TaskRuntime::new(config));

        let attempts_clone = attempts.clone();
        runtime
            .register("flaky", ShutdownGroup::Worker, move |_cancel| {
                let attempts = attempts_clone.clone();
                Box::pin(async move {
                    attempts.fetch_add(1, AtomicOrdering::SeqCst);
                    // Exits immediately without waiting for cancellation: an
                    // unexpected (crash-like) termination from the runtime's
                    // point of view.
                })
            })
            .await;

        runtime.start_all().await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        let health = runtime.health().await;
        assert_eq!(health.get("flaky"), Some(&TaskState::Crashed));
        // Initial spawn + up to max_restart_attempts retries.
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stop_targets_a_single_task_without_touching_others() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut config = RuntimeConfig::default();
        config.enable_monitoring = false;
        let runtime = Arc::new(TaskRuntime::new(config));
        runtime
            .register("a", ShutdownGroup::Source, counting_task(started.clone(), stopped.clone()))
            .await;
        runtime
            .register("b", ShutdownGroup::Worker, counting_task(started.clone(), stopped.clone()))
            .await;
        runtime.start_all().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        runtime.stop("a").await;
        assert_eq!(stopped.load(AtomicOrdering::SeqCst), 1);
        let health = runtime.health().await;
        assert_eq!(health.get("a"), Some(&TaskState::Stopped));
        assert_eq!(health.get("b"), Some(&TaskState::Running));

        runtime.stop_all().await;
    }

    #[tokio::test]
    async fn wait_all_reports_false_on_timeout_and_true_once_stopped() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut config = RuntimeConfig::default();
        config.enable_monitoring = false;
        let runtime = Arc::new(TaskRuntime::new(config));
        runtime
            .register("a", ShutdownGroup::Source, counting_task(started, stopped))
            .await;
        runtime.start_all().await;

        assert!(!runtime.wait_all(Duration::from_millis(20)).await);

        runtime.stop_all().await;
        assert!(runtime.wait_all(Duration::from_millis(20)).await);
    }
}
