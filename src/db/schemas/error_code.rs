//! Persisted error-code history
//!
//! Recurring errors carry an `error_code` tag; repeats inside the
//! re-alert interval are suppressed in the logging pipeline. The machine
//! id is part of the key so identical errors on different hosts do not
//! suppress each other.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for error codes
pub const ERROR_CODES_COLLECTION: &str = "error_codes";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCodeDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub code: String,
    pub machine_id: String,
    pub message: String,

    /// First occurrence of the current episode
    pub start_time: bson::DateTime,
    /// Last time the code was allowed through to the log
    pub last_log_time: bson::DateTime,
    /// Suppression window in seconds
    pub re_alert_interval_secs: i64,

    /// True while the error condition persists
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleared_at: Option<bson::DateTime>,
}

impl ErrorCodeDoc {
    pub fn new(code: &str, machine_id: &str, message: &str, re_alert_interval_secs: i64) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            code: code.to_string(),
            machine_id: machine_id.to_string(),
            message: message.to_string(),
            start_time: bson::DateTime::now(),
            last_log_time: bson::DateTime::now(),
            re_alert_interval_secs,
            active: true,
            cleared_at: None,
        }
    }
}

impl IntoIndexes for ErrorCodeDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "code": 1, "machine_id": 1, "start_time": 1 },
            Some(
                IndexOptions::builder()
                    .name("code_machine_index".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for ErrorCodeDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
