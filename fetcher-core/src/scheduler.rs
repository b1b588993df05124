//! DelayScheduler (spec §4.5). Holds failed stories until their scheduled
//! retry time, then reinjects them into the ingress channel.
//!
//! Testability note: rather than hand-rolling a `Clock` trait, scheduling
//! uses `tokio::time::Instant`/`sleep_until` directly so tests can drive time
//! deterministically with `tokio::time::pause()` + `tokio::time::advance()`
//! (tokio's own virtual-clock support), which is the idiomatic equivalent of
//! the "testable with a virtual clock injection" requirement.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::IngressMessage;
use crate::story::{Story, StoryKey};

struct ScheduledEntry {
    fire_at: Instant,
    seq: u64,
    story: Story,
}

impl ScheduledEntry {
    fn key(&self) -> StoryKey {
        StoryKey::from(&self.story)
    }
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}
impl Eq for ScheduledEntry {}
impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest fire_at sorts
        // to the top.
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Clonable front-end used by [`crate::worker::SiteWorker`] to schedule
/// retries and by [`crate::coordinator::Coordinator`] to check whether a
/// story is currently pending a delayed retry (spec §9 Open Question: a
/// pending DelayScheduler entry blocks a duplicate ingestion the same way
/// [`crate::active_set::ActiveSet`] membership does, without overloading
/// ActiveSet's own "held by a worker" invariant).
#[derive(Clone)]
pub struct DelaySchedulerHandle {
    entries_tx: mpsc::Sender<(Duration, Story)>,
    pending: Arc<DashSet<StoryKey>>,
}

impl DelaySchedulerHandle {
    /// Schedule `story` to be reinjected into ingress after `delay`.
    pub async fn schedule(&self, story: Story, delay: Duration) {
        self.pending.insert(StoryKey::from(&story));
        if self.entries_tx.send((delay, story)).await.is_err() {
            warn!("delay scheduler channel closed, dropping scheduled story");
        }
    }

    pub fn is_pending(&self, key: &StoryKey) -> bool {
        self.pending.contains(key)
    }
}

/// Owns the scheduling loop; construct with [`DelayScheduler::new`] and run
/// with [`DelayScheduler::run`]. The returned [`DelaySchedulerHandle`] is the
/// only thing other components hold.
pub struct DelayScheduler {
    entries_rx: mpsc::Receiver<(Duration, Story)>,
    pending: Arc<DashSet<StoryKey>>,
    ingress_tx: mpsc::Sender<IngressMessage>,
    seq: u64,
}

impl DelayScheduler {
    pub fn new(ingress_tx: mpsc::Sender<IngressMessage>) -> (Self, DelaySchedulerHandle) {
        let (entries_tx, entries_rx) = mpsc::channel(1024);
        let pending = Arc::new(DashSet::new());
        let handle = DelaySchedulerHandle {
            entries_tx,
            pending: pending.clone(),
        };
        (
            Self {
                entries_rx,
                pending,
                ingress_tx,
                seq: 0,
            },
            handle,
        )
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("delay scheduler started");
        let mut heap: BinaryHeap<ScheduledEntry> = BinaryHeap::new();

        loop {
            let far_future = Instant::now() + Duration::from_secs(365 * 24 * 3600);
            let next_deadline = heap.peek().map(|e| e.fire_at).unwrap_or(far_future);

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    for entry in heap.drain() {
                        self.pending.remove(&entry.key());
                        debug!(url = %entry.story.url, "dropping pending retry on shutdown");
                    }
                    info!("delay scheduler observed cancellation, pending entries dropped");
                    break;
                }
                maybe_entry = self.entries_rx.recv() => {
                    match maybe_entry {
                        Some((delay, story)) => {
                            let fire_at = Instant::now() + delay;
                            self.seq += 1;
                            let next_attempt_at = Utc::now()
                                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                            let mut story = story;
                            story.next_attempt_at = Some(next_attempt_at);
                            debug!(url = %story.url, delay_secs = delay.as_secs(), "scheduled retry");
                            heap.push(ScheduledEntry { fire_at, seq: self.seq, story });
                        }
                        None => {
                            info!("delay scheduler input channel closed, stopping");
                            break;
                        }
                    }
                }
                () = tokio::time::sleep_until(next_deadline), if !heap.is_empty() => {
                    let entry = heap.pop().expect("heap checked non-empty");
                    self.pending.remove(&entry.key());
                    if self.ingress_tx.send(IngressMessage::Arrival(entry.story)).await.is_err() {
                        warn!("ingress channel closed while reinjecting scheduled story");
                    }
                }
            }
        }
        info!("delay scheduler stopped");
    }
}
