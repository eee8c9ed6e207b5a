//! Status records read back from the store

use crate::object::ObjectStatus;
use chrono::{DateTime, Utc};

/// One row of the status table
///
/// Extended columns are `None` when the table (or the reading store) does
/// not carry them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRecord {
    pub source_id: String,
    pub target_id: Option<String>,
    pub directory: bool,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    pub status: Option<ObjectStatus>,
    pub transfer_start: Option<DateTime<Utc>>,
    pub transfer_complete: Option<DateTime<Utc>>,
    pub verify_start: Option<DateTime<Utc>>,
    pub verify_complete: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub source_deleted: bool,

    pub source_md5: Option<String>,
    pub source_retention_end: Option<DateTime<Utc>>,
    pub target_mtime: Option<DateTime<Utc>>,
    pub target_md5: Option<String>,
    pub target_retention_end: Option<DateTime<Utc>>,
    pub first_error_message: Option<String>,
}

impl SyncRecord {
    /// True if the record reached `Transferred` or `Verified`
    pub fn is_success(&self) -> bool {
        self.status.map(|s| s.is_success()).unwrap_or(false)
    }
}
