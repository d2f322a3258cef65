//! Process router
//!
//! Single consumer over the journal: claims `Ingested` operations in
//! source-timestamp order, dispatches each to the conversion engine, and
//! records the typed outcome. Claims are atomic find-and-update calls,
//! so a second router instance cannot double-claim; a claim whose
//! handler dies on a transient error is released back to `Ingested`.

use bson::doc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::db::schemas::{OpState, TrackedOp};
use crate::db::MongoCollection;
use crate::engine::{ConversionEngine, Outcome};
use crate::types::{BridgeError, Result};

/// Idle poll interval when the journal has no claimable rows
const IDLE_POLL: Duration = Duration::from_millis(500);
/// Pause after an unexpected handler failure
const RECOVERY_PAUSE: Duration = Duration::from_secs(5);

/// Persists watcher output into the journal. Duplicate replays of the
/// same source event hit the unique index and are dropped quietly.
pub async fn run_journal_writer(
    journal: MongoCollection<TrackedOp>,
    mut rx: mpsc::Receiver<TrackedOp>,
) {
    while let Some(op) = rx.recv().await {
        match journal.insert_one(op.clone()).await {
            Ok(_) => {
                debug!(group_id = %op.group_id, kind = op.source_kind.as_str(), "Journaled");
            }
            Err(BridgeError::DuplicateEntry(_)) => {
                debug!(group_id = %op.group_id, "Duplicate source event, no-op");
            }
            Err(e) => {
                error!(group_id = %op.group_id, "Journal write failed: {e}");
            }
        }
    }
    info!("Journal writer channel closed");
}

/// The single-consumer routing stage
pub struct Router {
    journal: MongoCollection<TrackedOp>,
    engine: Arc<ConversionEngine>,
}

impl Router {
    pub fn new(journal: MongoCollection<TrackedOp>, engine: Arc<ConversionEngine>) -> Self {
        Self { journal, engine }
    }

    /// Run until cancelled
    pub async fn run(&self) {
        info!("Router started");
        loop {
            match self.step().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(IDLE_POLL).await,
                Err(e) => {
                    error!("Router step failed: {e}");
                    tokio::time::sleep(RECOVERY_PAUSE).await;
                }
            }
        }
    }

    /// Claim and process one operation. Returns Ok(false) when nothing
    /// was claimable.
    pub async fn step(&self) -> Result<bool> {
        let Some(op) = self.claim_next().await? else {
            return Ok(false);
        };

        let started = Instant::now();
        let outcome = self.engine.handle(&op).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        match &outcome {
            Outcome::Processed | Outcome::Refunded => {
                debug!(group_id = %op.group_id, ?outcome, elapsed_ms, "Op processed");
            }
            Outcome::Skipped(reason) => {
                debug!(group_id = %op.group_id, reason = %reason, "Op skipped");
            }
            Outcome::Failed(error) => {
                warn!(group_id = %op.group_id, error = %error, "Op failed");
            }
        }

        self.record_outcome(&op, outcome, elapsed_ms).await?;
        Ok(true)
    }

    /// Atomically claim the oldest Ingested operation
    async fn claim_next(&self) -> Result<Option<TrackedOp>> {
        self.journal
            .find_one_and_update(
                doc! { "state": OpState::Ingested.as_str() },
                doc! { "$set": {
                    "state": OpState::Routed.as_str(),
                    "metadata.updated_at": bson::DateTime::now(),
                }},
                Some(doc! { "source_timestamp": 1 }),
            )
            .await
    }

    async fn record_outcome(
        &self,
        op: &TrackedOp,
        outcome: Outcome,
        elapsed_ms: i64,
    ) -> Result<()> {
        let update = match outcome {
            Outcome::Processed | Outcome::Refunded => doc! { "$set": {
                "state": OpState::Processed.as_str(),
                "process_time_ms": elapsed_ms,
                "metadata.updated_at": bson::DateTime::now(),
            }},
            Outcome::Skipped(reason) => doc! { "$set": {
                "state": OpState::Skipped.as_str(),
                "skip_reason": reason,
                "metadata.updated_at": bson::DateTime::now(),
            }},
            Outcome::Failed(ref error) if is_transient_failure(error) => {
                // Release the claim so a later pass retries
                warn!(group_id = %op.group_id, "Transient failure, releasing claim");
                doc! { "$set": {
                    "state": OpState::Ingested.as_str(),
                    "last_error": error.clone(),
                    "metadata.updated_at": bson::DateTime::now(),
                }}
            }
            Outcome::Failed(error) => doc! { "$set": {
                "state": OpState::Failed.as_str(),
                "last_error": error,
                "metadata.updated_at": bson::DateTime::now(),
            }},
        };
        self.journal
            .update_one(doc! { "group_id": &op.group_id, "source_kind": op.source_kind.as_str() }, update)
            .await?;
        Ok(())
    }
}

/// Failures worth retrying keep their taxonomy in the message prefix
fn is_transient_failure(error: &str) -> bool {
    error.starts_with("Database error")
        || error.starts_with("Cache error")
        || error.starts_with("Hive RPC error")
        || error.starts_with("Lightning error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_release_the_claim() {
        assert!(is_transient_failure("Database error: timeout"));
        assert!(is_transient_failure("Lightning error: connection reset"));
        assert!(!is_transient_failure("Ledger invariant violated: dup"));
        assert!(!is_transient_failure("Rejected: below minimum"));
    }
}
