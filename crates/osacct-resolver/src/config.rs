use osacct_storage::StoreConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid resolver config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A `table.column` pair holding account object ids that merges must repoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceColumn {
    pub table: String,
    pub column: String,
}

impl ReferenceColumn {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResolverConfig {
    pub store: StoreConfig,
    pub reference_columns: Vec<ReferenceColumn>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            reference_columns: vec![
                ReferenceColumn::new("tsk_files", "os_account_obj_id"),
                ReferenceColumn::new("blackboard_artifacts", "os_account_obj_id"),
            ],
        }
    }
}

impl ResolverConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Reads a TOML config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osacct_storage::WriteLock;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn partial_toml_keeps_defaults_for_missing_sections() {
        let config = ResolverConfig::from_toml_str(
            r#"
            [store]
            write_lock = "deferred"
            "#,
        )
        .expect("parse config");

        assert_eq!(config.store.write_lock, WriteLock::Deferred);
        assert_eq!(config.store.busy_timeout_ms, 5_000);
        assert_eq!(config.reference_columns.len(), 2);
    }

    #[test]
    fn reference_columns_can_be_replaced() {
        let config = ResolverConfig::from_toml_str(
            r#"
            [[reference_columns]]
            table = "tsk_files"
            column = "os_account_obj_id"
            "#,
        )
        .expect("parse config");
        assert_eq!(
            config.reference_columns,
            vec![ReferenceColumn::new("tsk_files", "os_account_obj_id")]
        );
    }

    #[test]
    fn load_reads_file_and_defaults_when_missing() {
        let mut file = NamedTempFile::new().expect("temp config");
        writeln!(file, "[store]\nbusy_timeout_ms = 250").expect("write config");
        let config = ResolverConfig::load(file.path()).expect("load config");
        assert_eq!(config.store.busy_timeout_ms, 250);

        let missing = file.path().with_extension("missing.toml");
        assert_eq!(
            ResolverConfig::load(&missing).expect("defaults"),
            ResolverConfig::default()
        );
    }

    #[test]
    fn malformed_toml_is_reported() {
        assert!(matches!(
            ResolverConfig::from_toml_str("store = 3"),
            Err(ConfigError::Parse(_))
        ));
    }
}
