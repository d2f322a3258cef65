//! Watcher resume state
//!
//! The Hive watcher persists its last processed block height; the
//! Lightning watcher persists one index per subscription stream. Both
//! are single documents keyed by a name.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for block markers
pub const BLOCK_MARKERS_COLLECTION: &str = "block_markers";
/// Collection name for Lightning stream cursors
pub const WATCH_CURSORS_COLLECTION: &str = "watch_cursors";

/// Last processed Hive block height
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMarker {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Marker name (one watcher instance per name)
    pub name: String,
    pub height: u64,
}

impl BlockMarker {
    pub fn new(name: &str, height: u64) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            name: name.to_string(),
            height,
        }
    }
}

impl IntoIndexes for BlockMarker {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "name": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("name_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for BlockMarker {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// Resume indices for the three Lightning subscription streams
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightningCursor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Node name (one cursor document per node)
    pub name: String,

    /// Last seen invoice add-index with a terminal state
    pub invoice_add_index: u64,
    /// Last seen payment index with a terminal state
    pub payment_index: u64,
    /// Timestamp of the last seen forward, in nanoseconds
    pub forward_timestamp_ns: u64,
}

impl LightningCursor {
    pub fn new(name: &str) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            name: name.to_string(),
            invoice_add_index: 0,
            payment_index: 0,
            forward_timestamp_ns: 0,
        }
    }
}

impl IntoIndexes for LightningCursor {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "name": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("name_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for LightningCursor {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
