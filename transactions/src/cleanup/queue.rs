//! Cleanup of this client's own unfinished attempts.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Cleaner, CleanupRequest, TransactionCleanupAttempt};

/// How many outcomes a [`CleanupSummary`] keeps.
pub const RECENT_OUTCOMES: usize = 32;

/// What the queue did over its lifetime.
///
/// # Invariants
/// - `recent` holds at most [`RECENT_OUTCOMES`] entries, oldest first
/// - `succeeded + failed` counts every cleanup, including ones no longer in
///   `recent`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub recent: VecDeque<TransactionCleanupAttempt>,
}

impl CleanupSummary {
    fn record(&mut self, attempt: TransactionCleanupAttempt) {
        if attempt.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        if self.recent.len() == RECENT_OUTCOMES {
            self.recent.pop_front();
        }
        self.recent.push_back(attempt);
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// A queue drained by one background task that finishes each attempt as
/// soon as it is enqueued.
pub struct CleanupQueue {
    sender: Option<mpsc::UnboundedSender<CleanupRequest>>,
    task: Option<tokio::task::JoinHandle<CleanupSummary>>,
}

impl CleanupQueue {
    /// Start the drain task. Outside a Tokio runtime the queue is inert and
    /// requests are dropped with a warning.
    #[must_use]
    pub fn new(cleaner: Cleaner) -> Self {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("no async runtime, cleanup of unfinished attempts disabled");
            return Self::disabled();
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Some(sender),
            task: Some(tokio::spawn(drain(cleaner, receiver))),
        }
    }

    /// A queue that drops every request.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            sender: None,
            task: None,
        }
    }

    pub fn enqueue(&self, request: CleanupRequest) {
        let Some(sender) = &self.sender else {
            debug!(attempt_id = %request.attempt_id, "cleanup queue disabled, dropping request");
            return;
        };
        let attempt_id = request.attempt_id.clone();
        if sender.send(request).is_err() {
            warn!(%attempt_id, "cleanup queue closed, dropping request");
        }
    }

    /// Finish every queued request, then stop.
    pub async fn shutdown(&mut self) -> CleanupSummary {
        self.sender = None;
        let Some(task) = self.task.take() else {
            return CleanupSummary::default();
        };
        match task.await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(error = %err, "cleanup queue task panicked");
                CleanupSummary::default()
            }
        }
    }
}

async fn drain(
    cleaner: Cleaner,
    mut receiver: mpsc::UnboundedReceiver<CleanupRequest>,
) -> CleanupSummary {
    let mut summary = CleanupSummary::default();
    while let Some(request) = receiver.recv().await {
        let attempt = cleaner.cleanup(&request, true).await;
        if attempt.success {
            info!(%attempt, "cleaned up attempt");
        } else {
            warn!(%attempt, reason = ?attempt.failure_reason, "cleanup of attempt failed");
        }
        summary.record(attempt);
    }
    debug!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        "cleanup queue drained"
    );
    summary
}
