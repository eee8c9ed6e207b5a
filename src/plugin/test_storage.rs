//! In-memory storage
//!
//! Usable as a source or a target. As a source it can generate a random tree
//! of directories and data objects; as a target it keeps whatever is written
//! so a run can be checked end to end without any external system.
//!
//! URI form: `test:` or `test:?objects=N&max-depth=D&min-size=A&max-size=B&children=P&max-children=C`

use crate::error::{ConfigError, ObjectError, ObjectResult};
use crate::object::{ObjectSummary, SyncObject};
use crate::plugin::SyncStorage;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

/// Identifier of the storage root
pub const ROOT_PATH: &str = "/root";

/// URI prefix for this storage
pub const URI_PREFIX: &str = "test:";

/// Largest generated object; data is held in memory
const MAX_GENERATED_SIZE: u64 = 64 * 1024 * 1024;

/// Random tree generation settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Objects at the top level
    pub object_count: u64,
    pub max_depth: u32,
    pub min_size: u64,
    pub max_size: u64,
    /// Percent chance that an object is a directory
    pub chance_of_children: u32,
    pub max_children: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            object_count: 100,
            max_depth: 5,
            min_size: 0,
            max_size: 1024 * 1024,
            chance_of_children: 30,
            max_children: 8,
        }
    }
}

impl GeneratorConfig {
    /// Parse the query part of a `test:` URI
    pub fn from_query(query: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid(format!("expected key=value, got '{}'", pair)))?;
            let number: u64 = value
                .parse()
                .map_err(|_| invalid(format!("'{}' is not a number for {}", value, key)))?;

            match key {
                "objects" => config.object_count = number,
                "max-depth" => config.max_depth = number as u32,
                "min-size" => config.min_size = number,
                "max-size" => config.max_size = number,
                "children" => config.chance_of_children = number.min(100) as u32,
                "max-children" => config.max_children = number as u32,
                other => return Err(invalid(format!("unknown option '{}'", other))),
            }
        }

        if config.min_size > config.max_size {
            return Err(invalid("min-size cannot be greater than max-size".into()));
        }
        if config.max_size > MAX_GENERATED_SIZE {
            return Err(invalid(format!("max-size cannot exceed {}", MAX_GENERATED_SIZE)));
        }
        Ok(config)
    }
}

fn invalid(reason: String) -> ConfigError {
    ConfigError::InvalidPluginOption {
        plugin: "test".into(),
        reason,
    }
}

/// Parent identifier of `identifier`, or `None` for the root
fn parent_path(identifier: &str) -> Option<&str> {
    let trimmed = identifier.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

#[derive(Default)]
struct StorageState {
    objects: HashMap<String, SyncObject>,
    /// Parent identifier to child identifiers, sorted for stable listings
    children: HashMap<String, BTreeSet<String>>,
}

/// In-memory storage keyed by `/root/<relative path>`
#[derive(Default)]
pub struct TestStorage {
    state: RwLock<StorageState>,
}

impl TestStorage {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `test:` URI, generating objects if options are given
    pub fn from_uri(uri: &str) -> Result<Self, ConfigError> {
        let rest = uri
            .strip_prefix(URI_PREFIX)
            .ok_or_else(|| ConfigError::UnknownStorage {
                uri: uri.to_string(),
            })?;
        let storage = Self::new();

        if let Some(query) = rest.strip_prefix('?') {
            let config = GeneratorConfig::from_query(query)?;
            storage.generate(&config);
        }
        Ok(storage)
    }

    /// Populate with a random tree
    pub fn generate(&self, config: &GeneratorConfig) {
        let mut rng = rand::thread_rng();
        self.generate_level(&mut rng, config, ROOT_PATH, config.object_count, 1);
        debug!(objects = self.object_count(), "Generated test objects");
    }

    fn generate_level(&self, rng: &mut impl Rng, config: &GeneratorConfig, parent: &str, count: u64, level: u32) {
        if level > config.max_depth {
            return;
        }

        for i in 0..count {
            let directory = rng.gen_range(0..100) < config.chance_of_children;
            let name = format!("random{}{}", i, if directory { ".dir" } else { ".object" });
            let identifier = format!("{}/{}", parent, name);
            let relative = self.relative_path(&identifier);

            if directory {
                self.ingest(&identifier, SyncObject::directory(relative));
                let children = if config.max_children > 0 {
                    rng.gen_range(0..config.max_children)
                } else {
                    0
                };
                self.generate_level(rng, config, &identifier, u64::from(children), level + 1);
            } else {
                let size = if config.max_size > config.min_size {
                    rng.gen_range(config.min_size..=config.max_size)
                } else {
                    config.max_size
                };
                let mut data = vec![0u8; size as usize];
                rng.fill(&mut data[..]);

                let mut object = SyncObject::file(relative, data);
                if rng.gen_bool(0.5) {
                    let secs = rng.gen_range(100..1_100);
                    object.metadata.retention_end = Some(Utc::now() + ChronoDuration::seconds(secs));
                }
                self.ingest(&identifier, object);
            }
        }
    }

    /// Add a data object at `relative_path`, creating parent directories
    pub fn insert_file(&self, relative_path: &str, data: impl Into<Vec<u8>>) -> String {
        let identifier = self.identifier(relative_path, false);
        self.ingest(&identifier, SyncObject::file(relative_path, data.into()));
        identifier
    }

    /// Add a directory at `relative_path`, creating parent directories
    pub fn insert_dir(&self, relative_path: &str) -> String {
        let identifier = self.identifier(relative_path, true);
        self.ingest(&identifier, SyncObject::directory(relative_path));
        identifier
    }

    /// Total objects stored, directories included
    pub fn object_count(&self) -> usize {
        self.state.read().objects.len()
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.state.read().objects.contains_key(identifier)
    }

    fn ingest(&self, identifier: &str, object: SyncObject) {
        let mut state = self.state.write();
        self.mkdirs(&mut state, identifier);

        if let Some(parent) = parent_path(identifier) {
            state
                .children
                .entry(parent.to_string())
                .or_default()
                .insert(identifier.to_string());
        }
        state.objects.insert(identifier.to_string(), object);
        trace!(identifier, "Stored test object");
    }

    /// Create any missing ancestor directories of `identifier`
    fn mkdirs(&self, state: &mut StorageState, identifier: &str) {
        let mut missing = Vec::new();
        let mut current = parent_path(identifier);

        while let Some(dir) = current {
            if dir == ROOT_PATH || dir == "/" || state.objects.contains_key(dir) {
                break;
            }
            missing.push(dir.to_string());
            current = parent_path(dir);
        }

        for dir in missing.into_iter().rev() {
            if let Some(parent) = parent_path(&dir) {
                state
                    .children
                    .entry(parent.to_string())
                    .or_default()
                    .insert(dir.clone());
            }
            let relative = self.relative_path(&dir);
            state.objects.insert(dir, SyncObject::directory(relative));
        }
    }

    fn summary(identifier: &str, object: &SyncObject) -> ObjectSummary {
        ObjectSummary {
            identifier: identifier.to_string(),
            directory: object.is_directory(),
            size: object.metadata.content_length,
        }
    }

    fn list(&self, parent: &str) -> Vec<ObjectSummary> {
        let state = self.state.read();
        state
            .children
            .get(parent)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.objects.get(id).map(|o| Self::summary(id, o)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl SyncStorage for TestStorage {
    fn name(&self) -> &str {
        "test"
    }

    fn identifier(&self, relative_path: &str, _directory: bool) -> String {
        let relative = relative_path.trim_matches('/');
        if relative.is_empty() {
            ROOT_PATH.to_string()
        } else {
            format!("{}/{}", ROOT_PATH, relative)
        }
    }

    fn relative_path(&self, identifier: &str) -> String {
        identifier
            .strip_prefix(ROOT_PATH)
            .unwrap_or(identifier)
            .trim_matches('/')
            .to_string()
    }

    fn all_objects(&self) -> ObjectResult<Box<dyn Iterator<Item = ObjectSummary> + Send + '_>> {
        Ok(Box::new(self.list(ROOT_PATH).into_iter()))
    }

    fn children(&self, parent: &ObjectSummary) -> ObjectResult<Vec<ObjectSummary>> {
        Ok(self.list(&parent.identifier))
    }

    fn load_object(&self, identifier: &str) -> ObjectResult<SyncObject> {
        self.state
            .read()
            .objects
            .get(identifier)
            .cloned()
            .ok_or_else(|| ObjectError::NotFound {
                identifier: identifier.to_string(),
            })
    }

    fn update_object(&self, identifier: &str, object: &SyncObject) -> ObjectResult<()> {
        let mut stored = object.clone();
        if stored.is_directory() {
            stored.data = None;
        }
        stored.metadata.content_length = stored.data.as_ref().map(|d| d.len() as u64).unwrap_or(0);
        self.ingest(identifier, stored);
        Ok(())
    }

    fn delete(&self, identifier: &str) -> ObjectResult<()> {
        let mut state = self.state.write();
        if state.children.get(identifier).is_some_and(|c| !c.is_empty()) {
            return Err(ObjectError::NonRetriable {
                identifier: identifier.to_string(),
                reason: "directory is not empty".into(),
            });
        }
        if state.objects.remove(identifier).is_none() {
            return Err(ObjectError::NotFound {
                identifier: identifier.to_string(),
            });
        }
        state.children.remove(identifier);
        if let Some(parent) = parent_path(identifier) {
            if let Some(siblings) = state.children.get_mut(parent) {
                siblings.remove(identifier);
            }
        }
        Ok(())
    }
}
