use serde::{Deserialize, Serialize};

use crate::sequence::DEFAULT_MAX_RETRIES;

/// Per-DAO settings threaded through backend constructors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaoSettings {
    /// Logical type served by the DAO, e.g. `"Widget|"`.
    #[serde(default)]
    pub entity_type: String,
    /// Stamped into `appVersion` of records that don't carry one.
    #[serde(default = "default_app_version")]
    pub app_version: String,
    #[serde(default = "default_max_sequence_retries")]
    pub max_sequence_retries: u32,
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_max_sequence_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for DaoSettings {
    fn default() -> Self {
        Self {
            entity_type: String::new(),
            app_version: default_app_version(),
            max_sequence_retries: default_max_sequence_retries(),
        }
    }
}

impl DaoSettings {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            ..Self::default()
        }
    }

    pub fn with_app_version(mut self, app_version: impl Into<String>) -> Self {
        self.app_version = app_version.into();
        self
    }

    pub fn with_max_sequence_retries(mut self, retries: u32) -> Self {
        self.max_sequence_retries = retries;
        self
    }
}
