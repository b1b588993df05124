//! EmailSource (spec §4.2): polls the mailbox at a fixed interval, extracts
//! candidate story URLs from unseen messages, and feeds them into the
//! ingress channel as [`Story`] arrivals.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::active_set::ActiveSet;
use crate::clients::mailbox::MailboxClient;
use crate::clients::notify::{Notification, NotificationDispatcher, Severity};
use crate::coordinator::IngressMessage;
use crate::error::FetcherError;
use crate::scheduler::DelaySchedulerHandle;
use crate::site;
use crate::story::{Story, StoryKey};

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://[^\s<>\x22']+").expect("static pattern is valid"))
}

/// Polls `mailbox` every `sleep_time` for unread messages, turning each
/// recognized story URL into an ingress arrival. Sites in `disabled_sites`
/// are logged and skipped without ever becoming a [`Story`] (spec §4.2).
pub struct EmailSource {
    mailbox: Arc<dyn MailboxClient>,
    ingress_tx: mpsc::Sender<IngressMessage>,
    active_set: Arc<ActiveSet>,
    delay_scheduler: DelaySchedulerHandle,
    notifier: Arc<dyn NotificationDispatcher>,
    sleep_time: Duration,
    disabled_sites: HashSet<String>,
}

impl EmailSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mailbox: Arc<dyn MailboxClient>,
        ingress_tx: mpsc::Sender<IngressMessage>,
        active_set: Arc<ActiveSet>,
        delay_scheduler: DelaySchedulerHandle,
        notifier: Arc<dyn NotificationDispatcher>,
        sleep_time: Duration,
        disabled_sites: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            mailbox,
            ingress_tx,
            active_set,
            delay_scheduler,
            notifier,
            sleep_time,
            disabled_sites: disabled_sites.into_iter().collect(),
        }
    }

    /// Runs until `cancel` fires. A transient IMAP failure is logged and
    /// retried after the normal poll interval; an authentication failure is
    /// treated as unrecoverable and ends the task (spec §4.2, §7).
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("email source started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("email source observed cancellation");
                    break;
                }
                () = tokio::time::sleep(self.sleep_time) => {
                    if let Err(fatal) = self.poll_once().await {
                        error!(error = %fatal, "email source exiting after unrecoverable mailbox error");
                        break;
                    }
                }
            }
        }
        info!("email source stopped");
    }

    /// One poll cycle. Returns `Err` only for failures spec §7 classifies as
    /// unrecoverable (authentication); transient failures are logged and
    /// swallowed so the loop retries on the next tick.
    async fn poll_once(&mut self) -> Result<(), FetcherError> {
        let messages = match self.mailbox.fetch_unseen().await {
            Ok(messages) => messages,
            Err(e @ FetcherError::Mailbox(ref msg)) if is_auth_failure(msg) => {
                return Err(e);
            }
            Err(e) => {
                warn!(error = %e, "transient mailbox error, will retry next cycle");
                return Ok(());
            }
        };

        for message in messages {
            let urls: HashSet<String> = url_pattern()
                .find_iter(&message.body)
                .map(|m| m.as_str().trim_end_matches(['.', ',', ')', ']']).to_string())
                .collect();

            for url in urls {
                self.handle_candidate_url(&url).await;
            }

            if let Err(e) = self.mailbox.mark_seen(message.uid).await {
                warn!(uid = message.uid, error = %e, "failed to mark message seen");
            }
        }

        Ok(())
    }

    async fn handle_candidate_url(&self, url: &str) {
        let Some(site) = site::normalize(url) else {
            debug!(%url, "could not derive a site identifier, skipping");
            return;
        };

        if self.disabled_sites.contains(&site) {
            debug!(%url, %site, "site is disabled, notifying without creating a story");
            self.notifier
                .notify(Notification {
                    subject: "Story ignored (site disabled)",
                    body: &format!("{url} matched disabled site {site}"),
                    severity: Severity::Info,
                })
                .await
                .ok();
            return;
        }

        let story = Story::new(url.to_string(), site.clone());
        let key = StoryKey::from(&story);
        if self.active_set.contains(&key) || self.delay_scheduler.is_pending(&key) {
            debug!(%url, "already in-flight or pending retry, skipping");
            return;
        }

        if self
            .ingress_tx
            .send(IngressMessage::Arrival(story))
            .await
            .is_err()
        {
            warn!(%url, "ingress channel closed while submitting email-sourced story");
        }
    }
}

fn is_auth_failure(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("login failed") || lower.contains("authenticationfailed")
}
