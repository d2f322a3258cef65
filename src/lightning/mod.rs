//! Lightning node integration
//!
//! The node seam is the `LightningNode` trait; the production
//! implementation speaks to LND's REST gateway. The watcher multiplexes
//! the invoice, payment, and forward subscriptions into the tracked-op
//! stream.

pub mod lnd_rest;
pub mod lnurl;
pub mod node;
pub mod watcher;

pub use lnd_rest::LndRest;
pub use lnurl::{parse_lightning_address, resolve_lightning_address};
pub use node::{
    InvoiceState, LightningNode, LnForward, LnInvoice, LnPayment, NodeInfo, PayReq, PaymentStatus,
};
pub use watcher::LightningWatcher;
