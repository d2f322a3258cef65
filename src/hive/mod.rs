//! Hive blockchain integration
//!
//! JSON-RPC client, operation parsing, and the resumable block watcher.

pub mod client;
pub mod ops;
pub mod watcher;

pub use client::{HiveRpc, HiveWallet, OutboundMessage, OutboundTransfer, SigningServiceWallet};
pub use ops::{classify_memo, parse_amount, MemoIntent, OpFilter, BALANCE_ADJUSTMENT_MARKER};
pub use watcher::{BlockSource, HiveWatcher, MarkerStore, WatchFilter};
