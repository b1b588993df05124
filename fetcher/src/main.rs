//! CLI entrypoint: wires the external collaborators (mailbox, story-fetcher
//! CLI, library CLI, notification dispatcher) into the orchestrator core and
//! runs it under [`TaskRuntime`] until a termination signal arrives.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use fetcher_core::active_set::ActiveSet;
use fetcher_core::clients::{
    FetcherClient, ImapMailboxClient, LibraryClient, MailboxClient, NotificationDispatcher,
    ProcessFetcherClient, ProcessLibraryClient, WebhookNotificationDispatcher,
};
use fetcher_core::config::Config;
use fetcher_core::coordinator::{Coordinator, IngressMessage, WorkerAssignment};
use fetcher_core::email_source::EmailSource;
use fetcher_core::runtime::{ShutdownGroup, TaskFuture, TaskRuntime, TaskState};
use fetcher_core::scheduler::{DelayScheduler, DelaySchedulerHandle};
use fetcher_core::worker::{SiteWorker, WorkerPolicy};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Watches a mailbox for fanfic update notifications and drives download,
/// retry, and library integration.
#[derive(Parser, Debug)]
#[command(name = "fetcher")]
#[command(about = "Ingests fanfic update emails into download, retry, and library integration")]
struct Args {
    /// Path to `config.toml`.
    #[arg(long)]
    config: PathBuf,

    /// Raise the default log level to debug for this crate and `fetcher-core`.
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

const CONFIG_EXIT_CODE: i32 = 1;
const INIT_EXIT_CODE: i32 = 2;

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    let verbose = args.verbose || env_verbose();
    init_logging(verbose);

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            // tracing isn't guaranteed flushed synchronously on process exit,
            // so also print to stderr for a config error a user is likely
            // staring directly at a terminal for.
            eprintln!("invalid configuration: {e}");
            error!(error = %e, "invalid configuration");
            return std::process::ExitCode::from(CONFIG_EXIT_CODE as u8);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return std::process::ExitCode::from(INIT_EXIT_CODE as u8);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "unrecoverable init failure");
            std::process::ExitCode::from(INIT_EXIT_CODE as u8)
        }
    }
}

fn env_verbose() -> bool {
    std::env::var("VERBOSE")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "fetcher=debug,fetcher_core=debug"
    } else {
        "fetcher=info,fetcher_core=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wraps a one-shot resource so it can be handed to [`TaskRuntime::register`],
/// whose entrypoint closure must be callable more than once (for restarts)
/// even though the resource itself (channel receivers, the like) can only be
/// consumed once. Grounded on the `Arc<Mutex<Option<_>>>` single-consumer
/// pattern `ferrex-player` uses for its own one-shot receivers (e.g.
/// `domains/metadata/messages/image_loading_subscription.rs`). A restart
/// attempted after the resource is already consumed just idles until
/// cancellation — acceptable because spec §4.1 only expects EmailSource to
/// plausibly crash and restart; the other components never originate
/// story-level errors.
fn restartable<T, F, Fut>(
    resource: T,
    run: F,
) -> impl Fn(CancellationToken) -> TaskFuture + Send + Sync + 'static
where
    T: Send + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let resource = Arc::new(AsyncMutex::new(Some(resource)));
    let run = Arc::new(run);
    move |cancel: CancellationToken| {
        let resource = Arc::clone(&resource);
        let run = Arc::clone(&run);
        let fut: TaskFuture = Box::pin(async move {
            let taken = resource.lock().await.take();
            match taken {
                Some(res) => run(res, cancel).await,
                None => {
                    warn!("task resource already consumed, cannot restart; idling until shutdown");
                    cancel.cancelled().await;
                }
            }
        });
        fut
    }
}

struct WorkerResources {
    worker_id: String,
    assignment_rx: mpsc::Receiver<WorkerAssignment>,
    ingress_tx: mpsc::Sender<IngressMessage>,
    active_set: Arc<ActiveSet>,
    scheduler: DelaySchedulerHandle,
    library: Arc<dyn LibraryClient>,
    fetcher: Arc<dyn FetcherClient>,
    notifier: Arc<dyn NotificationDispatcher>,
    policy: WorkerPolicy,
}

async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let mailbox: Arc<dyn MailboxClient> = Arc::new(ImapMailboxClient::new(
        config.email.server.clone(),
        993,
        config.email.email.clone(),
        config.email.password.clone(),
        config.email.mailbox.clone(),
    ));
    let library: Arc<dyn LibraryClient> = Arc::new(ProcessLibraryClient::new(
        config.library.binary.clone(),
        config.library.path.clone(),
    ));
    let fetcher: Arc<dyn FetcherClient> = Arc::new(ProcessFetcherClient::new(
        config.runtime.fetcher_binary.clone(),
        Duration::from_secs(config.runtime.fetch_timeout_seconds),
    ));
    let notifier: Arc<dyn NotificationDispatcher> =
        Arc::new(WebhookNotificationDispatcher::new(&config.notifications));

    let active_set = Arc::new(ActiveSet::new());
    let (ingress_tx, ingress_rx) = mpsc::channel(1024);
    let (scheduler, delay_handle) = DelayScheduler::new(ingress_tx.clone());

    let worker_count = config.runtime.worker_count;
    let mut coordinator_workers = Vec::with_capacity(worker_count);
    let mut worker_assignment_rxs = Vec::with_capacity(worker_count);
    for i in 0..worker_count {
        let worker_id = format!("worker-{i}");
        let (assign_tx, assign_rx) = mpsc::channel(4);
        coordinator_workers.push((worker_id.clone(), assign_tx));
        worker_assignment_rxs.push((worker_id, assign_rx));
    }

    let scratch_root = std::env::temp_dir().join("fetcher-scratch");
    let policy = WorkerPolicy {
        update_method: config.library.update_method,
        metadata_preservation_mode: config.library.metadata_preservation_mode,
        retry: config.retry.clone(),
        scratch_root,
    };

    let task_runtime = Arc::new(TaskRuntime::new(config.runtime.clone()));

    {
        let sleep_time = Duration::from_secs(config.email.sleep_time.max(5));
        let resources = (
            mailbox.clone(),
            ingress_tx.clone(),
            active_set.clone(),
            delay_handle.clone(),
            notifier.clone(),
            sleep_time,
            config.email.disabled_sites.clone(),
        );
        task_runtime
            .register(
                "email-source",
                ShutdownGroup::Source,
                restartable_email_source(resources),
            )
            .await;
    }

    {
        let resources = (
            ingress_rx,
            active_set.clone(),
            delay_handle.clone(),
            coordinator_workers,
            config.runtime.site_channel_capacity,
        );
        task_runtime
            .register(
                "coordinator",
                ShutdownGroup::Coordinator,
                restartable_coordinator(resources),
            )
            .await;
    }

    for (worker_id, assignment_rx) in worker_assignment_rxs {
        let resources = WorkerResources {
            worker_id: worker_id.clone(),
            assignment_rx,
            ingress_tx: ingress_tx.clone(),
            active_set: active_set.clone(),
            scheduler: delay_handle.clone(),
            library: library.clone(),
            fetcher: fetcher.clone(),
            notifier: notifier.clone(),
            policy: policy.clone(),
        };
        task_runtime
            .register(
                worker_id,
                ShutdownGroup::Worker,
                restartable_worker(resources),
            )
            .await;
    }

    task_runtime
        .register(
            "delay-scheduler",
            ShutdownGroup::Scheduler,
            restartable_scheduler(scheduler),
        )
        .await;

    task_runtime.start_all().await;
    info!(workers = worker_count, "fetcher started");

    wait_for_shutdown_signal().await?;

    let shutdown_runtime = Arc::clone(&task_runtime);
    let shutdown = tokio::spawn(async move { shutdown_runtime.stop_all().await });
    absorb_repeated_signals(shutdown).await?;

    let health = task_runtime.health().await;
    for (name, state) in &health {
        debug!(name = %name, ?state, "final task state");
    }
    if health.values().any(|s| matches!(s, TaskState::Crashed)) {
        warn!("one or more tasks ended crashed; see health log above");
    }
    info!("fetcher shut down cleanly");
    Ok(())
}

fn restartable_email_source(
    resources: (
        Arc<dyn MailboxClient>,
        mpsc::Sender<IngressMessage>,
        Arc<ActiveSet>,
        DelaySchedulerHandle,
        Arc<dyn NotificationDispatcher>,
        Duration,
        Vec<String>,
    ),
) -> impl Fn(CancellationToken) -> TaskFuture + Send + Sync + 'static {
    restartable(resources, |res, cancel| async move {
        let (mailbox, ingress_tx, active_set, delay_handle, notifier, sleep_time, disabled) = res;
        let source = EmailSource::new(
            mailbox,
            ingress_tx,
            active_set,
            delay_handle,
            notifier,
            sleep_time,
            disabled,
        );
        source.run(cancel).await;
    })
}

fn restartable_coordinator(
    resources: (
        mpsc::Receiver<IngressMessage>,
        Arc<ActiveSet>,
        DelaySchedulerHandle,
        Vec<(String, mpsc::Sender<WorkerAssignment>)>,
        usize,
    ),
) -> impl Fn(CancellationToken) -> TaskFuture + Send + Sync + 'static {
    restartable(resources, |res, cancel| async move {
        let (ingress_rx, active_set, delay_handle, workers, capacity) = res;
        let coordinator = Coordinator::new(ingress_rx, active_set, delay_handle, workers, capacity);
        coordinator.run(cancel).await;
    })
}

fn restartable_worker(
    resources: WorkerResources,
) -> impl Fn(CancellationToken) -> TaskFuture + Send + Sync + 'static {
    restartable(resources, |res, cancel| async move {
        let worker = SiteWorker::new(
            res.worker_id,
            res.assignment_rx,
            res.ingress_tx,
            res.active_set,
            res.scheduler,
            res.library,
            res.fetcher,
            res.notifier,
            res.policy,
        );
        worker.run(cancel).await;
    })
}

fn restartable_scheduler(
    scheduler: DelayScheduler,
) -> impl Fn(CancellationToken) -> TaskFuture + Send + Sync + 'static {
    restartable(scheduler, |scheduler, cancel| async move {
        scheduler.run(cancel).await;
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("installing ctrl-c handler")?;
    info!("received ctrl-c");
    Ok(())
}

/// After the first signal triggers `stop_all`, keep observing further
/// signals so repeated termination requests are logged and ignored rather
/// than crashing the process — `stop_all` itself collapses them to one
/// sequence (spec §4.1: "Signal re-entry must not cause double-stop").
#[cfg(unix)]
async fn absorb_repeated_signals(shutdown: tokio::task::JoinHandle<()>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = sigterm.recv() => debug!("additional SIGTERM observed mid-shutdown, ignoring"),
            _ = sigint.recv() => debug!("additional SIGINT observed mid-shutdown, ignoring"),
            res = &mut shutdown => {
                res.context("shutdown task panicked")?;
                return Ok(());
            }
        }
    }
}

#[cfg(not(unix))]
async fn absorb_repeated_signals(shutdown: tokio::task::JoinHandle<()>) -> anyhow::Result<()> {
    shutdown.await.context("shutdown task panicked")?;
    Ok(())
}
