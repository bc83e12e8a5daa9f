//! # ClosureScheduler
//!
//! Durable timers for scheduled thread closures.
//!
//! A closure is persisted before its timer is armed. Timers do not close
//! anything themselves: when one elapses it enqueues a [`FireJob`] onto the
//! relay's work queue, and the relay runs the closure on the same execution
//! context as regular event handling.
//!
//! # Developer Note
//! Every arm hands out a fresh token. A job only runs if its token still
//! matches the armed entry, so a timer that raced a cancel or a replacement
//! is dropped in [`ClosureScheduler::claim`] instead of closing the thread.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{PendingClosure, UserId};
use crate::registry::ThreadRegistry;
use crate::traits::RelayStore;

/// A closure whose delay has elapsed, waiting to be run by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FireJob {
    pub recipient_id: UserId,
    pub token: Uuid,
}

struct Armed {
    token: Uuid,
    closure: PendingClosure,
    timer: Option<JoinHandle<()>>,
}

impl Drop for Armed {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Outcome of [`ClosureScheduler::recover_on_startup`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Re-armed with their remaining delay.
    pub rearmed: usize,
    /// Already due; enqueued to fire immediately.
    pub overdue: usize,
    /// No live thread any more; record removed.
    pub dropped: usize,
}

pub struct ClosureScheduler {
    store: Arc<dyn RelayStore>,
    armed: DashMap<UserId, Armed>,
    jobs: mpsc::UnboundedSender<FireJob>,
}

impl ClosureScheduler {
    pub fn new(store: Arc<dyn RelayStore>) -> (Self, mpsc::UnboundedReceiver<FireJob>) {
        let (jobs, rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                armed: DashMap::new(),
                jobs,
            },
            rx,
        )
    }

    /// Persists the closure, then arms a timer for `fire_at - now` (clamped
    /// to zero). Replaces any closure already armed for the recipient.
    pub async fn schedule(&self, closure: PendingClosure) -> Result<()> {
        self.store.save_closure(&closure).await?;
        self.arm(closure, Utc::now());
        Ok(())
    }

    fn arm(&self, closure: PendingClosure, now: DateTime<Utc>) {
        let recipient_id = closure.recipient_id;
        let job = FireJob {
            recipient_id,
            token: Uuid::new_v4(),
        };
        let delay = (closure.fire_at - now).to_std().unwrap_or_default();

        let timer = if delay.is_zero() {
            if self.jobs.send(job).is_err() {
                warn!(recipient = %recipient_id, "closure queue is gone, closure not fired");
            }
            None
        } else {
            let jobs = self.jobs.clone();
            Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = jobs.send(job);
            }))
        };

        debug!(recipient = %recipient_id, ?delay, "closure armed");
        // Dropping the replaced entry aborts its timer.
        self.armed.insert(
            recipient_id,
            Armed {
                token: job.token,
                closure,
                timer,
            },
        );
    }

    /// Disarms and forgets the recipient's closure. Returns whether anything
    /// was pending; a no-op otherwise.
    pub async fn cancel(&self, recipient_id: UserId) -> Result<bool> {
        let disarmed = self.armed.remove(&recipient_id).is_some();
        let removed = self.store.remove_closure(recipient_id).await?;
        Ok(disarmed || removed)
    }

    /// Takes the closure a job refers to, if the job is still current.
    pub fn claim(&self, job: &FireJob) -> Option<PendingClosure> {
        self.armed
            .remove_if(&job.recipient_id, |_, armed| armed.token == job.token)
            .map(|(_, mut armed)| {
                armed.timer = None;
                armed.closure.clone()
            })
    }

    /// Removes the persisted record of a closure that has run (or failed).
    pub async fn forget(&self, recipient_id: UserId) -> Result<()> {
        self.store.remove_closure(recipient_id).await?;
        Ok(())
    }

    /// Closures currently armed in this process.
    pub fn pending(&self) -> Vec<PendingClosure> {
        let mut pending: Vec<_> = self.armed.iter().map(|a| a.closure.clone()).collect();
        pending.sort_by_key(|c| c.fire_at);
        pending
    }

    pub fn is_armed(&self, recipient_id: UserId) -> bool {
        self.armed.contains_key(&recipient_id)
    }

    /// Re-arms every persisted closure. Overdue closures are enqueued right
    /// away; closures for threads that no longer exist are dropped.
    pub async fn recover_on_startup(
        &self,
        registry: &ThreadRegistry,
        now: DateTime<Utc>,
    ) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for closure in self.store.list_closures().await? {
            let Some(thread) = registry.find_by_recipient(closure.recipient_id) else {
                debug!(recipient = %closure.recipient_id, "closure for a vanished thread dropped");
                self.store.remove_closure(closure.recipient_id).await?;
                report.dropped += 1;
                continue;
            };
            if closure.fire_at <= now {
                report.overdue += 1;
            } else {
                report.rearmed += 1;
            }
            thread.restore_closing(closure.clone());
            self.arm(closure, now);
        }
        info!(
            rearmed = report.rearmed,
            overdue = report.overdue,
            dropped = report.dropped,
            "pending closures recovered"
        );
        Ok(report)
    }
}
