//! Resumable Hive block watcher
//!
//! Advances head-ward one block at a time from the persisted marker,
//! extracts qualifying operations, and hands tracked ops to the journal
//! writer. A stale marker (more than two hours behind head) triggers a
//! bulk catch-up with a larger marker stride and reduced per-block
//! logging. Missing blocks at the tip are waited out; a missing block
//! inside the stream is fatal for the watcher task.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::db::schemas::{BlockMarker, TrackedOp};
use crate::db::MongoCollection;
use crate::hive::client::HiveRpc;
use crate::hive::ops::{extract_tracked_ops, OpFilter};
use crate::types::{BridgeError, Result};

/// Hive block interval
const BLOCK_INTERVAL: Duration = Duration::from_secs(3);
/// Blocks behind head that trigger bulk catch-up (two hours)
const CATCH_UP_BLOCKS: u64 = 2 * 3600 / 3;
/// Marker commit stride during catch-up
const CATCH_UP_MARKER_STRIDE: u64 = 100;
/// Consecutive misses inside the stream before declaring desync
const MAX_INTERIOR_MISSES: u32 = 10;
/// Backoff cap for source failures
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Seam over the Hive RPC surface the watcher needs
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn head_block(&self) -> Result<u64>;
    /// Block body, or None when the block does not exist yet
    async fn block(&self, height: u64) -> Result<Option<Value>>;
    async fn virtual_ops(&self, height: u64) -> Result<Vec<Value>>;
}

#[async_trait]
impl BlockSource for HiveRpc {
    async fn head_block(&self) -> Result<u64> {
        self.head_block_num().await
    }

    async fn block(&self, height: u64) -> Result<Option<Value>> {
        self.get_block(height).await
    }

    async fn virtual_ops(&self, height: u64) -> Result<Vec<Value>> {
        self.get_ops_in_block(height).await
    }
}

/// Persisted marker store seam
#[async_trait]
pub trait MarkerStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<u64>>;
    async fn save(&self, name: &str, height: u64) -> Result<()>;
}

#[async_trait]
impl MarkerStore for MongoCollection<BlockMarker> {
    async fn load(&self, name: &str) -> Result<Option<u64>> {
        Ok(self
            .find_one(bson::doc! { "name": name })
            .await?
            .map(|m| m.height))
    }

    async fn save(&self, name: &str, height: u64) -> Result<()> {
        self.upsert_one(
            bson::doc! { "name": name },
            bson::doc! { "$set": {
                "name": name,
                "height": height as i64,
                "metadata.updated_at": bson::DateTime::now(),
            }},
        )
        .await?;
        Ok(())
    }
}

/// Watch filter re-export kept close to the watcher's constructor
pub type WatchFilter = OpFilter;

/// Streams blocks and emits tracked ops
pub struct HiveWatcher {
    source: Arc<dyn BlockSource>,
    markers: Arc<dyn MarkerStore>,
    filter: OpFilter,
    marker_name: String,
    start_override: Option<u64>,
    tx: mpsc::Sender<TrackedOp>,
}

impl HiveWatcher {
    pub fn new(
        source: Arc<dyn BlockSource>,
        markers: Arc<dyn MarkerStore>,
        filter: OpFilter,
        start_override: Option<u64>,
        tx: mpsc::Sender<TrackedOp>,
    ) -> Self {
        Self {
            source,
            markers,
            filter,
            marker_name: "hive".to_string(),
            start_override,
            tx,
        }
    }

    /// Run until the channel closes or the stream desyncs.
    ///
    /// Transient source failures back off and retry from the persisted
    /// height; only `OutOfSync` escapes to the supervisor.
    pub async fn run(&self) -> Result<()> {
        let mut height = self.resume_height().await?;
        info!(height, "Hive watcher starting");

        let mut backoff = BLOCK_INTERVAL;
        let mut interior_misses: u32 = 0;
        let mut in_catch_up = false;

        loop {
            let head = match self.source.head_block().await {
                Ok(h) => h,
                Err(e) => {
                    warn!("Hive head lookup failed: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            if height > head {
                // Marker equal to head: nothing new yet
                tokio::time::sleep(BLOCK_INTERVAL).await;
                continue;
            }

            let catch_up = head.saturating_sub(height) > CATCH_UP_BLOCKS;
            if catch_up && !in_catch_up {
                info!(
                    behind = head - height,
                    "Hive watcher catch-up mode (marker more than two hours behind head)"
                );
            } else if !catch_up && in_catch_up {
                info!(height, "Hive watcher caught up, resuming normal streaming");
            }
            in_catch_up = catch_up;

            match self.process_block(height, head, catch_up).await {
                Ok(true) => {
                    interior_misses = 0;
                    backoff = BLOCK_INTERVAL;
                    // Marker records the last processed height; catch-up
                    // commits on a stride to cut write traffic
                    let stride_hit = !catch_up || height % CATCH_UP_MARKER_STRIDE == 0;
                    if stride_hit {
                        self.markers.save(&self.marker_name, height).await?;
                    }
                    height += 1;
                }
                Ok(false) => {
                    // Block missing. Tolerable at the tip, fatal inside
                    // the stream.
                    if head.saturating_sub(height) <= 1 {
                        tokio::time::sleep(BLOCK_INTERVAL).await;
                    } else {
                        interior_misses += 1;
                        if interior_misses >= MAX_INTERIOR_MISSES {
                            return Err(BridgeError::OutOfSync(format!(
                                "block {height} missing with head at {head}"
                            )));
                        }
                        tokio::time::sleep(BLOCK_INTERVAL).await;
                    }
                }
                Err(e) => {
                    warn!(height, "Hive block fetch failed: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }

            if self.tx.is_closed() {
                info!("Hive watcher channel closed; stopping");
                return Ok(());
            }
        }
    }

    /// First height to process: one past the last processed marker. A
    /// marker equal to the live head therefore emits nothing until a new
    /// block arrives.
    async fn resume_height(&self) -> Result<u64> {
        if let Some(start) = self.start_override {
            return Ok(start);
        }
        if let Some(last_processed) = self.markers.load(&self.marker_name).await? {
            return Ok(last_processed + 1);
        }
        // No marker: start from live head
        self.source.head_block().await
    }

    /// Returns Ok(true) when the block was processed, Ok(false) when it
    /// does not exist yet.
    async fn process_block(&self, height: u64, head: u64, catch_up: bool) -> Result<bool> {
        let Some(block) = self.source.block(height).await? else {
            return Ok(false);
        };
        let virtual_ops = self.source.virtual_ops(height).await?;
        let ops = extract_tracked_ops(height, &block, &virtual_ops, &self.filter);

        if !catch_up && !ops.is_empty() {
            debug!(height, count = ops.len(), behind = head - height, "Hive block ops");
        }

        for op in ops {
            if self.tx.send(op).await.is_err() {
                return Ok(true);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;

    struct MockSource {
        head: u64,
        blocks: HashMap<u64, Value>,
    }

    #[async_trait]
    impl BlockSource for MockSource {
        async fn head_block(&self) -> Result<u64> {
            Ok(self.head)
        }

        async fn block(&self, height: u64) -> Result<Option<Value>> {
            Ok(self.blocks.get(&height).cloned())
        }

        async fn virtual_ops(&self, _height: u64) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct MockMarkers {
        saved: Mutex<Option<u64>>,
    }

    #[async_trait]
    impl MarkerStore for MockMarkers {
        async fn load(&self, _name: &str) -> Result<Option<u64>> {
            Ok(*self.saved.lock())
        }

        async fn save(&self, _name: &str, height: u64) -> Result<()> {
            *self.saved.lock() = Some(height);
            Ok(())
        }
    }

    fn transfer_block(from: &str) -> Value {
        json!({
            "timestamp": "2025-11-02T12:00:00",
            "transaction_ids": ["tx1"],
            "transactions": [{
                "operations": [["transfer", {
                    "from": from,
                    "to": "bridge-server",
                    "amount": "5.000 HIVE",
                    "memo": "#sats"
                }]]
            }]
        })
    }

    fn filter() -> OpFilter {
        let mut f = OpFilter::default();
        f.accounts.insert("bridge-server".to_string());
        f
    }

    #[tokio::test]
    async fn resumes_past_marker_without_duplicates() {
        let mut blocks = HashMap::new();
        blocks.insert(100, transfer_block("alice"));
        blocks.insert(101, transfer_block("bob"));
        blocks.insert(102, transfer_block("carol"));
        let source = Arc::new(MockSource { head: 102, blocks });
        let markers = Arc::new(MockMarkers::default());
        markers.save("hive", 101).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let watcher = HiveWatcher::new(source, markers, filter(), None, tx);

        let handle = tokio::spawn(async move { watcher.run().await });

        // Marker says 101 was already processed: only block 102 arrives
        let first = rx.recv().await.unwrap();
        match &first.payload {
            crate::db::schemas::OpPayload::HiveTransfer(t) => {
                assert!(t.block_num > 101);
                assert_eq!(t.from, "carol");
            }
            other => panic!("unexpected payload {other:?}"),
        }
        let next = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(next.is_err(), "no duplicate blocks should be emitted");

        drop(rx);
        handle.abort();
    }

    #[tokio::test]
    async fn marker_at_head_emits_nothing() {
        let mut blocks = HashMap::new();
        blocks.insert(100, transfer_block("alice"));
        let source = Arc::new(MockSource { head: 100, blocks });
        let markers = Arc::new(MockMarkers::default());
        markers.save("hive", 100).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let watcher = HiveWatcher::new(source, markers, filter(), None, tx);
        let handle = tokio::spawn(async move { watcher.run().await });

        // Persisted height equals the live head: zero events until a new
        // block arrives
        let got = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(got.is_err(), "no events expected at head");

        handle.abort();
    }

    #[tokio::test]
    async fn interior_gap_is_fatal() {
        // Head far ahead, block 101 permanently missing
        let mut blocks = HashMap::new();
        blocks.insert(100, transfer_block("alice"));
        let source = Arc::new(MockSource { head: 5000, blocks });
        let markers = Arc::new(MockMarkers::default());
        markers.save("hive", 101).await.unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let watcher = HiveWatcher::new(source, markers, filter(), None, tx);

        tokio::time::pause();
        let run = tokio::spawn(async move { watcher.run().await });
        // Let the paused clock burn through the miss allowance
        for _ in 0..200 {
            tokio::time::advance(Duration::from_secs(3)).await;
            tokio::task::yield_now().await;
            if run.is_finished() {
                break;
            }
        }
        let result = run.await.unwrap();
        assert!(matches!(result, Err(BridgeError::OutOfSync(_))));
    }
}
