//! Filter chain ending in the target storage

use crate::error::{ObjectError, ObjectResult};
use crate::object::{ObjectContext, SyncObject};
use crate::plugin::{SyncFilter, SyncStorage};
use std::sync::Arc;
use tracing::trace;

/// Immutable chain of filters whose last hop writes to the target
pub struct FilterChain {
    filters: Vec<Arc<dyn SyncFilter>>,
    target: Arc<dyn SyncStorage>,
    /// Capture target details for the extended status columns
    extended: bool,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn SyncFilter>>, target: Arc<dyn SyncStorage>, extended: bool) -> Self {
        Self {
            filters,
            target,
            extended,
        }
    }

    pub fn filters(&self) -> &[Arc<dyn SyncFilter>] {
        &self.filters
    }

    pub fn target(&self) -> &Arc<dyn SyncStorage> {
        &self.target
    }

    /// Target identifier for the context, derived once and then reused
    fn target_id(&self, ctx: &ObjectContext, object: &SyncObject) -> String {
        match &ctx.target_id {
            Some(id) => id.clone(),
            None => self
                .target
                .identifier(&object.relative_path, object.is_directory()),
        }
    }

    fn capture_target_details(&self, ctx: &mut ObjectContext, target: &SyncObject) {
        ctx.target_mtime = target.metadata.mtime;
        ctx.target_md5 = target.md5_hex(true);
        ctx.target_retention_end = target.metadata.retention_end;
    }

    /// Run `object` through every filter in order and write it to the target
    pub fn transfer(&self, ctx: &mut ObjectContext, object: SyncObject) -> ObjectResult<()> {
        let mut object = object;
        for filter in &self.filters {
            object = filter.filter(ctx, object)?;
        }

        let target_id = self.target_id(ctx, &object);
        trace!(source_id = %ctx.source_id(), target_id = %target_id, "Writing to target");
        self.target.update_object(&target_id, &object)?;
        ctx.target_id = Some(target_id);

        if self.extended {
            if let Some(id) = ctx.target_id.clone() {
                if let Ok(written) = self.target.load_object(&id) {
                    self.capture_target_details(ctx, &written);
                }
            }
        }
        Ok(())
    }

    /// Load the target copy and undo the filters in reverse order
    pub fn read_back(&self, ctx: &mut ObjectContext) -> ObjectResult<SyncObject> {
        let target_id = match (&ctx.target_id, &ctx.object) {
            (Some(id), _) => id.clone(),
            (None, Some(object)) => self.target_id(ctx, object),
            (None, None) => {
                return Err(ObjectError::NonRetriable {
                    identifier: ctx.source_id().to_string(),
                    reason: "no target identifier and no source object to derive one".into(),
                })
            }
        };

        let mut object = self.target.load_object(&target_id).map_err(|e| match e {
            ObjectError::NotFound { identifier } => ObjectError::Verify {
                identifier,
                reason: "target object not found".into(),
            },
            other => other,
        })?;
        ctx.target_id = Some(target_id);

        if self.extended {
            self.capture_target_details(ctx, &object);
        }

        for filter in self.filters.iter().rev() {
            object = filter.reverse_filter(ctx, object)?;
        }
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectSummary;
    use crate::plugin::TestStorage;

    /// Upper-cases data forward and lower-cases it back
    struct UpperFilter;

    impl SyncFilter for UpperFilter {
        fn name(&self) -> &str {
            "upper"
        }

        fn filter(&self, _ctx: &mut ObjectContext, object: SyncObject) -> ObjectResult<SyncObject> {
            Ok(map_data(object, |b| b.to_ascii_uppercase()))
        }

        fn reverse_filter(&self, _ctx: &ObjectContext, object: SyncObject) -> ObjectResult<SyncObject> {
            Ok(map_data(object, |b| b.to_ascii_lowercase()))
        }
    }

    fn map_data(mut object: SyncObject, f: impl Fn(&[u8]) -> Vec<u8>) -> SyncObject {
        if let Some(data) = object.data.take() {
            object.data = Some(Arc::new(f(&data)));
        }
        object
    }

    #[test]
    fn test_transfer_and_read_back() {
        let target = Arc::new(TestStorage::new());
        let chain = FilterChain::new(vec![Arc::new(UpperFilter)], target.clone(), true);

        let mut ctx = ObjectContext::new(ObjectSummary::file("/root/a.txt", 5));
        chain
            .transfer(&mut ctx, SyncObject::file("a.txt", b"hello".to_vec()))
            .unwrap();

        assert_eq!(ctx.target_id.as_deref(), Some("/root/a.txt"));
        let stored = target.load_object("/root/a.txt").unwrap();
        assert_eq!(stored.data.as_deref().map(Vec::as_slice), Some(&b"HELLO"[..]));
        assert!(ctx.target_md5.is_some());

        let back = chain.read_back(&mut ctx).unwrap();
        assert_eq!(back.data.as_deref().map(Vec::as_slice), Some(&b"hello"[..]));
    }

    #[test]
    fn test_missing_target_is_verify_failure() {
        let chain = FilterChain::new(Vec::new(), Arc::new(TestStorage::new()), false);
        let mut ctx = ObjectContext::new(ObjectSummary::file("/root/gone", 1)).with_target_id("/root/gone");

        let err = chain.read_back(&mut ctx).unwrap_err();
        assert!(matches!(err, ObjectError::Verify { .. }));
        assert!(err.is_recoverable());
    }
}
