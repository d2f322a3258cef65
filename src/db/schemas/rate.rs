//! Market-rate time series
//!
//! One point per fetched quote; the nearest point to a historical
//! timestamp values entries posted near that time.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for the rate time series
pub const RATES_COLLECTION: &str = "rates";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatePoint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub timestamp: bson::DateTime,
    /// e.g. "HIVEBTC", "HBDBTC"
    pub pair: String,
    pub rate: f64,
    pub source: String,
}

impl RatePoint {
    pub fn new(pair: &str, rate: f64, source: &str) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            timestamp: bson::DateTime::now(),
            pair: pair.to_string(),
            rate,
            source: source.to_string(),
        }
    }
}

impl IntoIndexes for RatePoint {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "pair": 1, "timestamp": -1 },
            Some(
                IndexOptions::builder()
                    .name("pair_ts_index".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for RatePoint {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
