//! Filter that sleeps before passing each object on
//!
//! Useful for slowing a run down enough to watch progress or to exercise
//! termination. Options: `delay?ms=N` (default 100).

use crate::error::{ConfigError, ObjectResult};
use crate::object::{ObjectContext, SyncObject};
use crate::plugin::SyncFilter;
use std::thread;
use std::time::Duration;

pub const FILTER_NAME: &str = "delay";

#[derive(Debug, Clone)]
pub struct DelayFilter {
    delay: Duration,
}

impl DelayFilter {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Parse `ms=N` options
    pub fn from_options(options: &str) -> Result<Self, ConfigError> {
        let mut delay = Duration::from_millis(100);
        for pair in options.split('&').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some(("ms", value)) => {
                    let ms = value.parse().map_err(|_| ConfigError::InvalidPluginOption {
                        plugin: FILTER_NAME.into(),
                        reason: format!("'{}' is not a number of milliseconds", value),
                    })?;
                    delay = Duration::from_millis(ms);
                }
                _ => {
                    return Err(ConfigError::InvalidPluginOption {
                        plugin: FILTER_NAME.into(),
                        reason: format!("unknown option '{}'", pair),
                    })
                }
            }
        }
        Ok(Self::new(delay))
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl SyncFilter for DelayFilter {
    fn name(&self) -> &str {
        FILTER_NAME
    }

    fn filter(&self, _ctx: &mut ObjectContext, object: SyncObject) -> ObjectResult<SyncObject> {
        thread::sleep(self.delay);
        Ok(object)
    }
}
