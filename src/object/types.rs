//! Object model shared by plugins, the engine and the status store

use crate::object::ObjectStatus;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use std::sync::Arc;

/// Lightweight description of an object produced by source enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    /// Source identifier (primary key in the status store)
    pub identifier: String,

    /// Whether the object is a directory
    pub directory: bool,

    /// Size in bytes (0 for directories)
    pub size: u64,
}

impl ObjectSummary {
    /// Create a summary for a data object
    pub fn file(identifier: impl Into<String>, size: u64) -> Self {
        Self {
            identifier: identifier.into(),
            directory: false,
            size,
        }
    }

    /// Create a summary for a directory
    pub fn directory(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            directory: true,
            size: 0,
        }
    }
}

/// Metadata carried alongside object data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub directory: bool,
    pub content_length: u64,
    pub content_type: Option<String>,
    pub mtime: Option<DateTime<Utc>>,
    pub retention_end: Option<DateTime<Utc>>,
    /// MD5 hex reported by the storage, if it keeps one
    pub checksum: Option<String>,
}

/// A loaded object: relative path, metadata and (for data objects) content
#[derive(Debug, Clone)]
pub struct SyncObject {
    /// Path relative to the storage root, used to derive target identifiers
    pub relative_path: String,

    pub metadata: ObjectMetadata,

    /// Content; `None` for directories
    pub data: Option<Arc<Vec<u8>>>,
}

impl SyncObject {
    /// Create a data object, deriving length from the content
    pub fn file(relative_path: impl Into<String>, data: Vec<u8>) -> Self {
        let metadata = ObjectMetadata {
            directory: false,
            content_length: data.len() as u64,
            content_type: Some("application/octet-stream".into()),
            mtime: Some(Utc::now()),
            ..Default::default()
        };
        Self {
            relative_path: relative_path.into(),
            metadata,
            data: Some(Arc::new(data)),
        }
    }

    /// Create a directory object
    pub fn directory(relative_path: impl Into<String>) -> Self {
        let metadata = ObjectMetadata {
            directory: true,
            mtime: Some(Utc::now()),
            ..Default::default()
        };
        Self {
            relative_path: relative_path.into(),
            metadata,
            data: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.metadata.directory
    }

    /// MD5 of the content as lowercase hex
    ///
    /// When `prefer_metadata` is set and the storage reported a checksum,
    /// that value is returned without reading the data.
    pub fn md5_hex(&self, prefer_metadata: bool) -> Option<String> {
        if prefer_metadata {
            if let Some(checksum) = &self.metadata.checksum {
                return Some(checksum.clone());
            }
        }
        let data = self.data.as_ref()?;
        Some(hex::encode(Md5::digest(data.as_slice())))
    }
}

/// Per-object state passed through the filter chain and into the status store
#[derive(Debug, Clone)]
pub struct ObjectContext {
    /// Summary produced by enumeration
    pub summary: ObjectSummary,

    /// Object loaded from the source (set by the sync task)
    pub object: Option<SyncObject>,

    pub target_id: Option<String>,
    pub target_mtime: Option<DateTime<Utc>>,
    pub target_md5: Option<String>,
    pub target_retention_end: Option<DateTime<Utc>>,

    /// Current status; must be set before any status write
    pub status: Option<ObjectStatus>,

    /// Number of failed attempts so far
    failures: u32,
}

impl ObjectContext {
    /// Create a fresh context in the `Queue` state
    pub fn new(summary: ObjectSummary) -> Self {
        Self {
            summary,
            object: None,
            target_id: None,
            target_mtime: None,
            target_md5: None,
            target_retention_end: None,
            status: Some(ObjectStatus::Queue),
            failures: 0,
        }
    }

    /// Builder-style status setter
    pub fn with_status(mut self, status: ObjectStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Builder-style target id setter
    pub fn with_target_id(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn source_id(&self) -> &str {
        &self.summary.identifier
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn inc_failures(&mut self) -> u32 {
        self.failures += 1;
        self.failures
    }

    /// Carry over a failure count stored by an earlier run
    pub fn set_failures(&mut self, failures: u32) {
        self.failures = failures;
    }

    /// Modification time of the loaded source object
    pub fn source_mtime(&self) -> Option<DateTime<Utc>> {
        self.object.as_ref().and_then(|o| o.metadata.mtime)
    }
}
