//! Upload aggregator — coalesces a burst of attachments into one batch.
//!
//! Each attachment (re)schedules a deferred check at
//! `last_seen_at + quiet_period`. A check only flushes if no attachment
//! arrived after it was scheduled; older checks wake up, see a newer
//! generation, and do nothing.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::channels::Attachment;

/// A completed burst, handed to the orchestrator exactly once.
#[derive(Debug, Clone)]
pub struct FlushedBatch {
    pub batch_id: Uuid,
    pub user_id: String,
    /// Ordered by the channel's message id.
    pub items: Vec<Attachment>,
    pub first_seen_at: Instant,
    pub last_seen_at: Instant,
}

/// A burst that is still accumulating.
#[derive(Debug)]
struct PendingBatch {
    batch_id: Uuid,
    items: Vec<Attachment>,
    first_seen_at: Instant,
    last_seen_at: Instant,
    /// Bumped on every attachment; a check only flushes its own generation.
    generation: u64,
    check: JoinHandle<()>,
}

/// Debounces attachments per user.
pub struct UploadAggregator {
    quiet_period: Duration,
    pending: Mutex<HashMap<String, PendingBatch>>,
    flush_tx: mpsc::UnboundedSender<FlushedBatch>,
}

impl UploadAggregator {
    /// Create an aggregator and the receiver flushed batches arrive on.
    pub fn new(quiet_period: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<FlushedBatch>) {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let aggregator = Arc::new(Self {
            quiet_period,
            pending: Mutex::new(HashMap::new()),
            flush_tx,
        });
        (aggregator, flush_rx)
    }

    /// Buffer an attachment and push the user's deadline back.
    pub async fn push(self: &Arc<Self>, user_id: &str, item: Attachment) {
        let now = Instant::now();
        let deadline = now + self.quiet_period;
        let mut pending = self.pending.lock().await;

        if let Some(batch) = pending.get_mut(user_id) {
            batch.items.push(item);
            batch.last_seen_at = now;
            batch.generation += 1;
            // The previous check stays alive and becomes a no-op.
            batch.check = self.schedule_check(user_id, batch.generation, deadline);
            debug!(user_id, items = batch.items.len(), "Attachment added to pending batch");
            return;
        }

        let check = self.schedule_check(user_id, 0, deadline);
        pending.insert(
            user_id.to_string(),
            PendingBatch {
                batch_id: Uuid::new_v4(),
                items: vec![item],
                first_seen_at: now,
                last_seen_at: now,
                generation: 0,
                check,
            },
        );
        debug!(user_id, "Started new upload batch");
    }

    /// Drop the user's pending batch without flushing it. Returns the number
    /// of discarded attachments.
    pub async fn discard(&self, user_id: &str) -> usize {
        let removed = self.pending.lock().await.remove(user_id);
        match removed {
            Some(batch) => {
                batch.check.abort();
                info!(
                    user_id,
                    batch_id = %batch.batch_id,
                    items = batch.items.len(),
                    "Discarded pending upload batch"
                );
                batch.items.len()
            }
            None => 0,
        }
    }

    /// Number of attachments buffered for `user_id`.
    pub async fn pending_items(&self, user_id: &str) -> usize {
        self.pending
            .lock()
            .await
            .get(user_id)
            .map(|b| b.items.len())
            .unwrap_or(0)
    }

    fn schedule_check(
        self: &Arc<Self>,
        user_id: &str,
        generation: u64,
        deadline: Instant,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(aggregator) = weak.upgrade() {
                aggregator.check(&user_id, generation).await;
            }
        })
    }

    /// Deferred check: flush only if nothing arrived since it was scheduled.
    async fn check(&self, user_id: &str, generation: u64) {
        let mut pending = self.pending.lock().await;
        let current = match pending.get(user_id) {
            Some(batch) => batch.generation,
            None => {
                debug!(user_id, "No pending batch at check time");
                return;
            }
        };
        if current != generation {
            debug!(user_id, generation, current, "Superseded quiet-period check");
            return;
        }

        let Some(batch) = pending.remove(user_id) else {
            return;
        };
        drop(pending);

        let mut items = batch.items;
        items.sort_by_key(|item| item.message_id);

        info!(
            user_id,
            batch_id = %batch.batch_id,
            items = items.len(),
            "Upload batch ready"
        );

        let flushed = FlushedBatch {
            batch_id: batch.batch_id,
            user_id: user_id.to_string(),
            items,
            first_seen_at: batch.first_seen_at,
            last_seen_at: batch.last_seen_at,
        };
        if self.flush_tx.send(flushed).is_err() {
            debug!(user_id, "Flush receiver closed, dropping batch");
        }
    }
}
