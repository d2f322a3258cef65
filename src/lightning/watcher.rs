//! Lightning event watcher
//!
//! Three concurrent subscription loops (invoices, payments, forwards)
//! multiplexed into the tracked-op stream. Each loop reconnects with its
//! own backoff and resumes from its persisted index; terminal states
//! advance the cursor, so interim events are never lost across a
//! reconnect.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::db::schemas::{
    ln_group_id, ForwardPayload, InvoicePayload, LightningCursor, OpPayload, PaymentPayload,
    TrackedOp,
};
use crate::db::MongoCollection;
use crate::lightning::node::LightningNode;
use crate::types::Result;

/// Backoff cap for reconnect loops
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Persisted cursor store seam
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<LightningCursor>;
    async fn save(&self, cursor: &LightningCursor) -> Result<()>;
}

#[async_trait]
impl CursorStore for MongoCollection<LightningCursor> {
    async fn load(&self, name: &str) -> Result<LightningCursor> {
        Ok(self
            .find_one(bson::doc! { "name": name })
            .await?
            .unwrap_or_else(|| LightningCursor::new(name)))
    }

    async fn save(&self, cursor: &LightningCursor) -> Result<()> {
        self.upsert_one(
            bson::doc! { "name": &cursor.name },
            bson::doc! { "$set": {
                "name": &cursor.name,
                "invoice_add_index": cursor.invoice_add_index as i64,
                "payment_index": cursor.payment_index as i64,
                "forward_timestamp_ns": cursor.forward_timestamp_ns as i64,
                "metadata.updated_at": bson::DateTime::now(),
            }},
        )
        .await?;
        Ok(())
    }
}

pub struct LightningWatcher {
    node: Arc<dyn LightningNode>,
    cursors: Arc<dyn CursorStore>,
    node_name: String,
    tx: mpsc::Sender<TrackedOp>,
}

impl LightningWatcher {
    pub fn new(
        node: Arc<dyn LightningNode>,
        cursors: Arc<dyn CursorStore>,
        node_name: &str,
        tx: mpsc::Sender<TrackedOp>,
    ) -> Self {
        Self {
            node,
            cursors,
            node_name: node_name.to_string(),
            tx,
        }
    }

    /// Spawn the three subscription loops. Returns after the startup
    /// self-test; the loops run until the channel closes.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        // Startup self-test: prove the node answers and that the
        // notification path works end to end before trusting the streams
        let node_info = self.node.get_info().await?;
        info!(
            notify = true,
            alias = %node_info.alias,
            pubkey = %node_info.identity_pubkey,
            synced = node_info.synced_to_chain,
            "Lightning watcher connected"
        );

        let invoices = self.clone();
        tokio::spawn(async move { invoices.invoice_loop().await });
        let payments = self.clone();
        tokio::spawn(async move { payments.payment_loop().await });
        let forwards = self.clone();
        tokio::spawn(async move { forwards.forward_loop().await });
        Ok(())
    }

    async fn invoice_loop(&self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let mut cursor = match self.cursors.load(&self.node_name).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Invoice cursor load failed: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            let stream = match self.node.subscribe_invoices(cursor.invoice_add_index).await {
                Ok(s) => {
                    backoff = INITIAL_BACKOFF;
                    s
                }
                Err(e) => {
                    warn!("Invoice subscription failed: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            let mut stream = stream;
            while let Some(item) = stream.next().await {
                let invoice = match item {
                    Ok(inv) => inv,
                    Err(e) => {
                        warn!("Invoice stream error: {e}");
                        break;
                    }
                };
                let group_id = ln_group_id(&invoice.payment_hash);
                let payload = OpPayload::LnInvoice(InvoicePayload {
                    add_index: invoice.add_index,
                    settle_index: invoice.settle_index,
                    payment_hash: invoice.payment_hash.clone(),
                    value_msats: invoice.value_msats,
                    state: invoice.state.as_str().to_string(),
                    memo: invoice.memo.clone(),
                });
                let op = TrackedOp::new(group_id, chrono::Utc::now(), payload);
                if self.tx.send(op).await.is_err() {
                    return;
                }
                if invoice.state.is_terminal() && invoice.add_index > cursor.invoice_add_index {
                    cursor.invoice_add_index = invoice.add_index;
                    if let Err(e) = self.cursors.save(&cursor).await {
                        warn!("Invoice cursor save failed: {e}");
                    }
                }
            }
            warn!("Invoice stream closed; reconnecting");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn payment_loop(&self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let mut cursor = match self.cursors.load(&self.node_name).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Payment cursor load failed: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            let stream = match self.node.track_payments().await {
                Ok(s) => {
                    backoff = INITIAL_BACKOFF;
                    s
                }
                Err(e) => {
                    warn!("Payment subscription failed: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            let mut stream = stream;
            while let Some(item) = stream.next().await {
                let payment = match item {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Payment stream error: {e}");
                        break;
                    }
                };
                // Resume filter: the payment stream has no server-side
                // start index
                if payment.payment_index <= cursor.payment_index {
                    continue;
                }
                let group_id = ln_group_id(&payment.payment_hash);
                let payload = OpPayload::LnPayment(PaymentPayload {
                    payment_index: payment.payment_index,
                    payment_hash: payment.payment_hash.clone(),
                    value_msats: payment.value_msats,
                    fee_msats: payment.fee_msats,
                    status: payment.status.as_str().to_string(),
                    failure_reason: payment.failure_reason.clone(),
                });
                let op = TrackedOp::new(group_id, chrono::Utc::now(), payload);
                if self.tx.send(op).await.is_err() {
                    return;
                }
                if payment.status.is_terminal() {
                    cursor.payment_index = payment.payment_index;
                    if let Err(e) = self.cursors.save(&cursor).await {
                        warn!("Payment cursor save failed: {e}");
                    }
                }
            }
            warn!("Payment stream closed; reconnecting");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn forward_loop(&self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let mut cursor = match self.cursors.load(&self.node_name).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Forward cursor load failed: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            let stream = match self.node.subscribe_forwards(cursor.forward_timestamp_ns).await {
                Ok(s) => {
                    backoff = INITIAL_BACKOFF;
                    s
                }
                Err(e) => {
                    warn!("Forward subscription failed: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            let mut stream = stream;
            while let Some(item) = stream.next().await {
                let fwd = match item {
                    Ok(f) => f,
                    Err(e) => {
                        warn!("Forward stream error: {e}");
                        break;
                    }
                };
                // Forwards have no payment hash; the natural id is the
                // event timestamp and channel pair
                let natural = format!("fwd:{}:{}:{}", fwd.timestamp_ns, fwd.chan_id_in, fwd.chan_id_out);
                let group_id = ln_group_id(&natural);
                let payload = OpPayload::LnForward(ForwardPayload {
                    timestamp_ns: fwd.timestamp_ns,
                    chan_id_in: fwd.chan_id_in,
                    chan_id_out: fwd.chan_id_out,
                    amt_in_msats: fwd.amt_in_msats,
                    amt_out_msats: fwd.amt_out_msats,
                    fee_msats: fwd.fee_msats,
                });
                let op = TrackedOp::new(group_id, chrono::Utc::now(), payload);
                if self.tx.send(op).await.is_err() {
                    return;
                }
                if fwd.timestamp_ns > cursor.forward_timestamp_ns {
                    cursor.forward_timestamp_ns = fwd.timestamp_ns;
                    if let Err(e) = self.cursors.save(&cursor).await {
                        warn!("Forward cursor save failed: {e}");
                    }
                }
            }
            warn!("Forward stream closed; reconnecting");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lightning::node::{InvoiceState, LnForward, LnInvoice, LnPayment, NodeInfo, PayReq};
    use futures_util::stream::BoxStream;
    use parking_lot::Mutex;

    struct MockNode {
        invoices: Mutex<Vec<LnInvoice>>,
    }

    #[async_trait]
    impl LightningNode for MockNode {
        async fn subscribe_invoices(
            &self,
            add_index: u64,
        ) -> Result<BoxStream<'static, Result<LnInvoice>>> {
            let items: Vec<Result<LnInvoice>> = self
                .invoices
                .lock()
                .iter()
                .filter(|i| i.add_index > add_index)
                .cloned()
                .map(Ok)
                .collect();
            Ok(futures_util::stream::iter(items)
                .chain(futures_util::stream::pending())
                .boxed())
        }

        async fn track_payments(&self) -> Result<BoxStream<'static, Result<LnPayment>>> {
            Ok(futures_util::stream::pending().boxed())
        }

        async fn subscribe_forwards(
            &self,
            _start_time_ns: u64,
        ) -> Result<BoxStream<'static, Result<LnForward>>> {
            Ok(futures_util::stream::pending().boxed())
        }

        async fn decode_pay_req(&self, _bolt11: &str) -> Result<PayReq> {
            unimplemented!("not needed by the watcher")
        }

        async fn pay_invoice(
            &self,
            _bolt11: &str,
            _max_fee_msats: i64,
            _timeout: Duration,
        ) -> Result<LnPayment> {
            unimplemented!("not needed by the watcher")
        }

        async fn add_invoice(&self, _value_msats: i64, _memo: &str) -> Result<String> {
            unimplemented!("not needed by the watcher")
        }

        async fn get_info(&self) -> Result<NodeInfo> {
            Ok(NodeInfo {
                alias: "mock".to_string(),
                identity_pubkey: "02abc".to_string(),
                synced_to_chain: true,
            })
        }
    }

    #[derive(Default)]
    struct MockCursors {
        cursor: Mutex<Option<LightningCursor>>,
    }

    #[async_trait]
    impl CursorStore for MockCursors {
        async fn load(&self, name: &str) -> Result<LightningCursor> {
            Ok(self
                .cursor
                .lock()
                .clone()
                .unwrap_or_else(|| LightningCursor::new(name)))
        }

        async fn save(&self, cursor: &LightningCursor) -> Result<()> {
            *self.cursor.lock() = Some(cursor.clone());
            Ok(())
        }
    }

    fn invoice(add_index: u64, state: InvoiceState) -> LnInvoice {
        LnInvoice {
            add_index,
            settle_index: if state == InvoiceState::Settled { add_index } else { 0 },
            payment_hash: format!("hash-{add_index}"),
            value_msats: 1_000_000,
            state,
            memo: "bridge:alice".to_string(),
        }
    }

    #[tokio::test]
    async fn invoice_loop_resumes_from_cursor_and_advances_it() {
        let node = Arc::new(MockNode {
            invoices: Mutex::new(vec![
                invoice(1, InvoiceState::Settled),
                invoice(2, InvoiceState::Settled),
                invoice(3, InvoiceState::Open),
            ]),
        });
        let cursors = Arc::new(MockCursors::default());
        cursors
            .save(&{
                let mut c = LightningCursor::new("lnd");
                c.invoice_add_index = 1;
                c
            })
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let watcher = Arc::new(LightningWatcher::new(
            node,
            cursors.clone(),
            "lnd",
            tx,
        ));
        watcher.clone().start().await.unwrap();

        // Invoice 1 is before the cursor; 2 and 3 arrive
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        match (&first.payload, &second.payload) {
            (OpPayload::LnInvoice(a), OpPayload::LnInvoice(b)) => {
                assert_eq!(a.add_index, 2);
                assert_eq!(b.add_index, 3);
            }
            other => panic!("unexpected payloads {other:?}"),
        }

        // Settled invoice 2 advanced the cursor; open invoice 3 did not
        tokio::time::sleep(Duration::from_millis(50)).await;
        let saved = cursors.load("lnd").await.unwrap();
        assert_eq!(saved.invoice_add_index, 2);
    }

    #[tokio::test]
    async fn same_payment_hash_yields_same_group_id() {
        let a = ln_group_id("hash-1");
        let b = ln_group_id("hash-1");
        assert_eq!(a, b);
    }
}
