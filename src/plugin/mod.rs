//! Collaborator plugins
//!
//! The engine only talks to storage through [`SyncStorage`], transforms
//! objects through [`SyncFilter`] and compares copies through [`Verifier`].
//! Concrete plugins are resolved by URI prefix or name through
//! [`PluginRegistry`].

pub mod chain;
pub mod delay;
pub mod registry;
pub mod test_storage;
pub mod verify;

pub use chain::FilterChain;
pub use delay::DelayFilter;
pub use registry::PluginRegistry;
pub use test_storage::TestStorage;
pub use verify::Md5Verifier;

use crate::error::ObjectResult;
use crate::object::{ObjectContext, ObjectSummary, SyncObject};

/// A storage system usable as a source or a target
pub trait SyncStorage: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Identifier for an object at `relative_path`
    fn identifier(&self, relative_path: &str, directory: bool) -> String;

    /// Path of `identifier` relative to the storage root
    fn relative_path(&self, identifier: &str) -> String;

    /// Top-level objects; each call starts a fresh enumeration
    fn all_objects(&self) -> ObjectResult<Box<dyn Iterator<Item = ObjectSummary> + Send + '_>>;

    /// Immediate children of a directory
    fn children(&self, parent: &ObjectSummary) -> ObjectResult<Vec<ObjectSummary>>;

    fn load_object(&self, identifier: &str) -> ObjectResult<SyncObject>;

    /// Create or replace the object at `identifier`
    fn update_object(&self, identifier: &str, object: &SyncObject) -> ObjectResult<()>;

    fn delete(&self, identifier: &str) -> ObjectResult<()>;

    /// Called once when the run ends
    fn cleanup(&self) {}
}

/// In-line transformation applied between source and target
pub trait SyncFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Transform an object on its way to the target
    fn filter(&self, ctx: &mut ObjectContext, object: SyncObject) -> ObjectResult<SyncObject>;

    /// Undo the transformation on an object read back from the target
    fn reverse_filter(&self, _ctx: &ObjectContext, object: SyncObject) -> ObjectResult<SyncObject> {
        Ok(object)
    }

    fn cleanup(&self) {}
}

/// Compares a source object with its read-back copy
pub trait Verifier: Send + Sync {
    fn name(&self) -> &str;

    /// Fails with [`crate::error::ObjectError::Verify`] on a mismatch
    fn verify(&self, source: &SyncObject, target: &SyncObject) -> ObjectResult<()>;

    fn cleanup(&self) {}
}
