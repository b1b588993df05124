//! SiteWorker (spec §4.4): dequeues stories for one site at a time, invokes
//! the external CLIs under an isolated scratch directory, and dispatches the
//! outcome to notification/retry/library integration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::active_set::{ActiveSet, InsertOutcome};
use crate::clients::fetcher_client::FetcherClient;
use crate::clients::library::LibraryClient;
use crate::clients::notify::{Notification, NotificationDispatcher, Severity};
use crate::config::{self, MetadataPreservationMode, RetryConfig, UpdateMethod};
use crate::coordinator::{IngressMessage, WorkerAssignment};
use crate::outcome::FetcherOutcome;
use crate::retry::{self, RetryDecision};
use crate::scheduler::DelaySchedulerHandle;
use crate::story::{LastStatus, Story, StoryKey};

/// Policy knobs a worker needs that don't belong to any one external client.
#[derive(Debug, Clone)]
pub struct WorkerPolicy {
    pub update_method: UpdateMethod,
    pub metadata_preservation_mode: MetadataPreservationMode,
    pub retry: RetryConfig,
    pub scratch_root: PathBuf,
}

/// One long-running worker task, identified by `worker_id`. Rotates across
/// sites as the coordinator reassigns it; never holds more than one site's
/// channel at a time.
pub struct SiteWorker {
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

impl SiteWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: String,
        assignment_rx: mpsc::Receiver<WorkerAssignment>,
        ingress_tx: mpsc::Sender<IngressMessage>,
        active_set: Arc<ActiveSet>,
        scheduler: DelaySchedulerHandle,
        library: Arc<dyn LibraryClient>,
        fetcher: Arc<dyn FetcherClient>,
        notifier: Arc<dyn NotificationDispatcher>,
        policy: WorkerPolicy,
    ) -> Self {
        Self {
            worker_id,
            assignment_rx,
            ingress_tx,
            active_set,
            scheduler,
            library,
            fetcher,
            notifier,
            policy,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(worker_id = %self.worker_id, "worker started");
        loop {
            let assignment = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                a = self.assignment_rx.recv() => match a {
                    Some(a) => a,
                    None => break,
                },
            };
            let site = assignment.site;
            let mut rx = assignment.rx;
            debug!(worker_id = %self.worker_id, %site, "worker picked up site");

            loop {
                let story = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        info!(worker_id = %self.worker_id, %site, "cancellation observed, worker exiting");
                        return;
                    }
                    s = rx.recv() => match s {
                        Some(s) => s,
                        None => break,
                    },
                };
                self.process_story(story).await;
            }

            debug!(worker_id = %self.worker_id, %site, "site backlog drained, reporting idle");
            let _ = self
                .ingress_tx
                .send(IngressMessage::WorkerIdle {
                    worker_id: self.worker_id.clone(),
                    finished_site: site,
                })
                .await;
        }
        info!(worker_id = %self.worker_id, "worker stopped");
    }

    async fn process_story(&mut self, mut story: Story) {
        let key = StoryKey::from(&story);
        if self.active_set.try_insert(key.clone()) == InsertOutcome::AlreadyPresent {
            debug!(url = %story.url, "skipping duplicate already in-flight");
            return;
        }

        let scratch = match self.acquire_scratch_dir() {
            Ok(dir) => dir,
            Err(e) => {
                warn!(url = %story.url, error = %e, "failed to create scratch directory, treating as transient");
                self.handle_transient(story, "scratch directory unavailable".to_string())
                    .await;
                self.active_set.remove(&key);
                return;
            }
        };

        if let Ok(Some(library_id)) = self.library.lookup_by_url(&story.url).await {
            story.library_id = Some(library_id);
        }

        let modifier = config::resolve_fetch_modifier(self.policy.update_method, story.behavior);
        let outcome = self
            .fetcher
            .fetch(&story.url, modifier, scratch.path())
            .await;

        match outcome {
            Ok(FetcherOutcome::Success { library_id }) => {
                self.handle_success(story, library_id, scratch.path()).await;
            }
            Ok(FetcherOutcome::ForceIndicated) => {
                self.handle_force_indicated(story).await;
            }
            Ok(FetcherOutcome::TransientFailure { reason }) => {
                self.handle_transient(story, reason).await;
            }
            Ok(FetcherOutcome::PermanentFailure { reason }) => {
                self.handle_permanent(story, reason).await;
            }
            Err(e) => {
                // Infrastructure error invoking the fetcher: spec §7 treats
                // this as transient rather than propagating.
                warn!(url = %story.url, error = %e, "fetcher invocation failed");
                self.handle_transient(story, format!("fetcher invocation error: {e}"))
                    .await;
            }
        }

        self.active_set.remove(&key);
        // scratch TempDir drops here, removing the directory regardless of
        // which branch above returned (spec §4.4: release guaranteed on all
        // exit paths).
    }

    fn acquire_scratch_dir(&self) -> std::io::Result<TempDir> {
        std::fs::create_dir_all(&self.policy.scratch_root)?;
        tempfile::Builder::new()
            .prefix("fetcher-")
            .tempdir_in(&self.policy.scratch_root)
    }

    async fn handle_success(&self, story: Story, library_id: Option<String>, scratch: &Path) {
        let was_final_attempt = matches!(story.last_status, Some(LastStatus::FinalPending));
        let epub = match find_epub(scratch) {
            Some(path) => path,
            None => {
                warn!(url = %story.url, "fetcher reported success but produced no epub, treating as transient");
                self.handle_transient(story, "no epub produced".to_string())
                    .await;
                return;
            }
        };

        let existing = library_id.or_else(|| story.library_id.clone());
        match self
            .library
            .integrate(
                existing.as_deref(),
                &epub,
                self.policy.metadata_preservation_mode,
            )
            .await
        {
            Ok(final_id) => {
                info!(url = %story.url, library_id = %final_id, "story updated successfully");
                let subject = if was_final_attempt {
                    "Story updated on final attempt"
                } else {
                    "Story updated"
                };
                self.notifier
                    .notify(Notification {
                        subject,
                        body: &format!("{} (library id {final_id})", story.url),
                        severity: Severity::Info,
                    })
                    .await
                    .ok();
            }
            Err(e) => {
                warn!(url = %story.url, error = %e, "library integration failed");
                self.handle_transient(story, format!("library integration error: {e}"))
                    .await;
            }
        }
    }

    async fn handle_force_indicated(&self, mut story: Story) {
        if !config::allows_force_promotion(self.policy.update_method) {
            // update_no_force: treated as an ordinary transient failure
            // (spec §4.8).
            self.handle_transient(story, "force indicated but suppressed by update_no_force".into())
                .await;
            return;
        }
        story.promote_to_force();
        debug!(url = %story.url, "force indicated, reinjecting with force behavior");
        if self
            .ingress_tx
            .send(IngressMessage::Arrival(story))
            .await
            .is_err()
        {
            warn!("ingress channel closed while reinjecting force-promoted story");
        }
    }

    async fn handle_permanent(&self, mut story: Story, reason: String) {
        warn!(url = %story.url, %reason, "permanent failure");
        story.last_status = Some(LastStatus::Transient(reason.clone()));
        self.notifier
            .notify(Notification {
                subject: "Story fetch failed permanently",
                body: &format!("{}: {reason}", story.url),
                severity: Severity::Error,
            })
            .await
            .ok();
    }

    async fn handle_transient(&self, mut story: Story, reason: String) {
        let was_final_attempt = matches!(story.last_status, Some(LastStatus::FinalPending));
        story.attempts += 1;
        story.last_status = Some(LastStatus::Transient(reason.clone()));

        let was_force_suppressed =
            was_final_attempt && !config::allows_force_promotion(self.policy.update_method);

        match retry::decide(story.attempts, &self.policy.retry) {
            RetryDecision::RequeueAfter(delay) => {
                debug!(url = %story.url, attempts = story.attempts, ?delay, "scheduling retry");
                self.scheduler.schedule(story, delay).await;
            }
            RetryDecision::FinalAttemptAfter(delay) => {
                self.notifier
                    .notify(Notification {
                        subject: "Story approaching final attempt",
                        body: &format!(
                            "{} failed {} times; one final attempt in {:.1}h",
                            story.url,
                            story.attempts,
                            delay.as_secs_f64() / 3600.0
                        ),
                        severity: Severity::Warning,
                    })
                    .await
                    .ok();
                story.last_status = Some(LastStatus::FinalPending);
                if config::allows_force_promotion(self.policy.update_method) {
                    story.promote_to_force();
                }
                self.scheduler.schedule(story, delay).await;
            }
            RetryDecision::GiveUp => {
                story.last_status = Some(LastStatus::GivenUp);
                if was_force_suppressed {
                    self.notifier
                        .notify(Notification {
                            subject: "Story given up (force suppressed)",
                            body: &format!(
                                "{} exhausted retries; force was suppressed by update_no_force",
                                story.url
                            ),
                            severity: Severity::Warning,
                        })
                        .await
                        .ok();
                } else {
                    info!(url = %story.url, "giving up after exhausting retries");
                }
            }
        }
    }
}

fn find_epub(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .find(|p| p.extension().and_then(|e| e.to_str()) == Some("epub"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::library::LibraryClient;
    use crate::config::{MetadataPreservationMode, RetryConfig, UpdateMethod};
    use crate::story::Behavior;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeFetcher {
        outcome: FetcherOutcome,
        write_epub: bool,
    }

    #[async_trait]
    impl FetcherClient for FakeFetcher {
        async fn fetch(
            &self,
            _url: &str,
            _modifier: config::FetchModifier,
            scratch_dir: &Path,
        ) -> Result<FetcherOutcome, crate::error::FetcherError> {
            if self.write_epub {
                std::fs::write(scratch_dir.join("story.epub"), b"fake epub").unwrap();
            }
            Ok(self.outcome.clone())
        }
    }

    #[derive(Default)]
    struct FakeLibrary;

    #[async_trait]
    impl LibraryClient for FakeLibrary {
        async fn lookup_by_url(&self, _url: &str) -> Result<Option<String>, crate::error::FetcherError> {
            Ok(None)
        }
        async fn add(&self, _epub_path: &Path) -> Result<String, crate::error::FetcherError> {
            Ok("42".to_string())
        }
        async fn replace_format(
            &self,
            _library_id: &str,
            _epub_path: &Path,
        ) -> Result<(), crate::error::FetcherError> {
            Ok(())
        }
        async fn remove(&self, _library_id: &str) -> Result<(), crate::error::FetcherError> {
            Ok(())
        }
        async fn export_custom_fields(
            &self,
            _library_id: &str,
        ) -> Result<HashMap<String, String>, crate::error::FetcherError> {
            Ok(HashMap::new())
        }
        async fn restore_custom_fields(
            &self,
            _library_id: &str,
            _fields: HashMap<String, String>,
        ) -> Result<(), crate::error::FetcherError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeNotifier {
        subjects: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationDispatcher for FakeNotifier {
        async fn notify(
            &self,
            notification: Notification<'_>,
        ) -> Result<(), crate::error::FetcherError> {
            self.subjects
                .lock()
                .unwrap()
                .push(notification.subject.to_string());
            Ok(())
        }
    }

    fn policy(scratch_root: PathBuf) -> WorkerPolicy {
        WorkerPolicy {
            update_method: UpdateMethod::Update,
            metadata_preservation_mode: MetadataPreservationMode::RemoveAdd,
            retry: RetryConfig {
                max_normal_retries: 2,
                final_attempt_enabled: true,
                final_attempt_wait_hours: 1.0,
            },
            scratch_root,
        }
    }

    fn harness(
        fetcher: FakeFetcher,
        notifier: Arc<FakeNotifier>,
    ) -> (SiteWorker, mpsc::Receiver<IngressMessage>, Arc<ActiveSet>) {
        let (ingress_tx, ingress_rx) = mpsc::channel(16);
        let (_assign_tx, assign_rx) = mpsc::channel(1);
        let active_set = Arc::new(ActiveSet::new());
        let (_scheduler, delay_handle) = crate::scheduler::DelayScheduler::new(ingress_tx.clone());
        let scratch_root = std::env::temp_dir().join(format!(
            "fetcher-worker-test-{}",
            std::process::id()
        ));
        let worker = SiteWorker::new(
            "worker-test".to_string(),
            assign_rx,
            ingress_tx,
            active_set.clone(),
            delay_handle,
            Arc::new(FakeLibrary),
            Arc::new(fetcher),
            notifier,
            policy(scratch_root),
        );
        (worker, ingress_rx, active_set)
    }

    #[tokio::test]
    async fn success_notifies_and_clears_active_set() {
        let notifier = Arc::new(FakeNotifier::default());
        let (mut worker, _ingress_rx, active_set) = harness(
            FakeFetcher {
                outcome: FetcherOutcome::Success {
                    library_id: Some("99".to_string()),
                },
                write_epub: true,
            },
            notifier.clone(),
        );

        let story = Story::new("https://a.example/1".to_string(), "a".to_string());
        worker.process_story(story.clone()).await;

        assert!(!active_set.contains(&StoryKey::from(&story)));
        assert_eq!(*notifier.subjects.lock().unwrap(), vec!["Story updated".to_string()]);
    }

    #[tokio::test]
    async fn force_indicated_promotes_and_reinjects_without_incrementing_attempts() {
        let notifier = Arc::new(FakeNotifier::default());
        let (mut worker, mut ingress_rx, _active_set) = harness(
            FakeFetcher {
                outcome: FetcherOutcome::ForceIndicated,
                write_epub: false,
            },
            notifier,
        );

        let story = Story::new("https://a.example/1".to_string(), "a".to_string());
        worker.process_story(story).await;

        let msg = tokio::time::timeout(Duration::from_secs(1), ingress_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            IngressMessage::Arrival(s) => {
                assert_eq!(s.behavior, Behavior::Force);
                assert_eq!(s.attempts, 0);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn transient_failure_increments_attempts_and_schedules_retry() {
        let notifier = Arc::new(FakeNotifier::default());
        let (mut worker, mut ingress_rx, active_set) = harness(
            FakeFetcher {
                outcome: FetcherOutcome::TransientFailure {
                    reason: "rate limit".to_string(),
                },
                write_epub: false,
            },
            notifier.clone(),
        );

        let story = Story::new("https://a.example/1".to_string(), "a".to_string());
        let key = StoryKey::from(&story);
        worker.process_story(story).await;

        assert!(!active_set.contains(&key));
        // First failure stays below max_normal_retries=2, so it's a silent
        // requeue, not a notification.
        assert!(notifier.subjects.lock().unwrap().is_empty());
        assert!(ingress_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn permanent_failure_notifies_without_reinjection() {
        let notifier = Arc::new(FakeNotifier::default());
        let (mut worker, mut ingress_rx, active_set) = harness(
            FakeFetcher {
                outcome: FetcherOutcome::PermanentFailure {
                    reason: "unsupported site".to_string(),
                },
                write_epub: false,
            },
            notifier.clone(),
        );

        let story = Story::new("https://a.example/1".to_string(), "a".to_string());
        let key = StoryKey::from(&story);
        worker.process_story(story).await;

        assert!(!active_set.contains(&key));
        assert_eq!(
            *notifier.subjects.lock().unwrap(),
            vec!["Story fetch failed permanently".to_string()]
        );
        assert!(ingress_rx.try_recv().is_err());
    }
}
