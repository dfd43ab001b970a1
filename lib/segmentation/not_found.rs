use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use super::OsegInner;
use crate::server::monitoring::OSEG_METRICS;
use crate::types::ObjectId;

struct NotFoundEntry {
    object_id: ObjectId,
    enqueued_at: Instant,
}

/// FIFO of objects whose store lookup came back "not found".
///
/// Entries are enqueued in arrival order, so a sweep can stop at the first
/// entry still inside its sit-out instead of scanning the whole queue.
pub(super) struct NotFoundQueue {
    entries: Mutex<VecDeque<NotFoundEntry>>,
}

impl NotFoundQueue {
    pub(super) fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub(super) fn enqueue(&self, object_id: ObjectId) {
        let mut entries = self.entries.lock().expect("not-found mutex poisoned");
        entries.push_back(NotFoundEntry {
            object_id,
            enqueued_at: Instant::now(),
        });
    }

    /// Pops every entry that has sat out at least `sit_out`.
    pub(super) fn take_expired(&self, sit_out: Duration) -> Vec<ObjectId> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("not-found mutex poisoned");
        let mut expired = Vec::new();
        while let Some(front) = entries.front() {
            if now.duration_since(front.enqueued_at) < sit_out {
                break;
            }
            if let Some(entry) = entries.pop_front() {
                expired.push(entry.object_id);
            }
        }
        expired
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.entries.lock().expect("not-found mutex poisoned").len()
    }
}

/// Timer-driven sweep: re-issues the store GET for every entry past its
/// sit-out. The retry bypasses coalescing (no transit record) because the
/// request that triggered it was already answered "unresolved".
pub(super) async fn run_sweeper(inner: Arc<OsegInner>) {
    let mut ticker = tokio::time::interval(inner.settings.not_found_sweep_interval);
    loop {
        tokio::select! {
            _ = inner.stopping.cancelled() => break,
            _ = ticker.tick() => {
                for id in inner.not_found.take_expired(inner.settings.not_found_sit_out) {
                    debug!("retrying store lookup for {}", id);
                    if let Some(metrics) = OSEG_METRICS.get() {
                        metrics.not_found_retries.inc();
                    }
                    let retry_inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        let result = retry_inner.store_get_with_retry(id).await;
                        retry_inner.route_get_completion(id, result, true);
                    });
                }
            }
        }
    }
}
