//! MD5 verification of transferred objects

use crate::error::{ObjectError, ObjectResult};
use crate::object::SyncObject;
use crate::plugin::Verifier;
use tracing::debug;

/// Compares directory-ness, size and MD5 of source and target
#[derive(Debug, Clone, Default)]
pub struct Md5Verifier {
    /// Trust a checksum reported in metadata instead of hashing the data
    pub use_metadata_checksum: bool,
}

impl Md5Verifier {
    pub fn new(use_metadata_checksum: bool) -> Self {
        Self {
            use_metadata_checksum,
        }
    }

    fn mismatch(source: &SyncObject, reason: String) -> ObjectError {
        ObjectError::Verify {
            identifier: source.relative_path.clone(),
            reason,
        }
    }
}

impl Verifier for Md5Verifier {
    fn name(&self) -> &str {
        "md5"
    }

    fn verify(&self, source: &SyncObject, target: &SyncObject) -> ObjectResult<()> {
        if source.is_directory() {
            if !target.is_directory() {
                return Err(Self::mismatch(source, "source is directory; target is not".into()));
            }
            return Ok(());
        }
        if target.is_directory() {
            return Err(Self::mismatch(source, "source is data object; target is directory".into()));
        }

        let source_len = source.data.as_ref().map(|d| d.len() as u64).unwrap_or(0);
        let target_len = target.data.as_ref().map(|d| d.len() as u64).unwrap_or(0);
        if source_len != target_len {
            return Err(Self::mismatch(
                source,
                format!("size mismatch ({} != {})", source_len, target_len),
            ));
        }

        let source_md5 = source.md5_hex(self.use_metadata_checksum).unwrap_or_default();
        let target_md5 = target.md5_hex(self.use_metadata_checksum).unwrap_or_default();
        if source_md5 != target_md5 {
            return Err(Self::mismatch(
                source,
                format!("MD5 sum mismatch ({} != {})", source_md5, target_md5),
            ));
        }

        debug!(object = %source.relative_path, md5 = %source_md5, "MD5 sum verified");
        Ok(())
    }
}
