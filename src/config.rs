use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use dualdao_core::DaoSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub dao: DaoSettings,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Document,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Table backing the entity type on the SQLite backend.
    #[serde(default = "default_table")]
    pub table: String,

    /// Declared domain columns of `table`.
    #[serde(default)]
    pub columns: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sqlite_path() -> String {
    ":memory:".to_string()
}

fn default_table() -> String {
    "entities".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: BackendKind::default(),
            sqlite_path: default_sqlite_path(),
            table: default_table(),
            columns: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        default_logging()
    }
}

impl Config {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.store.backend, BackendKind::Document);
        assert_eq!(config.store.sqlite_path, ":memory:");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.dao.max_sequence_retries, 200);
        assert_eq!(config.dao.app_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::from_toml_str(
            r#"
            [dao]
            entity_type = "Widget|"
            app_version = "3.1.0"
            max_sequence_retries = 10

            [store]
            backend = "sqlite"
            table = "widgets"
            columns = ["name", "color"]

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .unwrap();
        assert_eq!(config.dao.entity_type, "Widget|");
        assert_eq!(config.dao.app_version, "3.1.0");
        assert_eq!(config.dao.max_sequence_retries, 10);
        assert_eq!(config.store.backend, BackendKind::Sqlite);
        assert_eq!(config.store.columns, vec!["name", "color"]);
        assert!(config.logging.json);
    }

    #[test]
    fn unknown_backend_is_a_parse_error() {
        let err = Config::from_toml_str("[store]\nbackend = \"oracle\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_files_and_tolerates_missing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing.store.backend, BackendKind::Document);

        let path = dir.path().join("dualdao.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[dao]\nentity_type = \"Gadget|\"").unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.dao.entity_type, "Gadget|");
    }
}
