//! Configuration: data queries and engine settings.
//!
//! Data queries come from YAML (a file or an inline string). Engine settings
//! use `figment` for layered configuration: defaults -> user config file ->
//! `--settings` file -> `EMBARGO_` environment variables.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CatalogError, ConfigError, EmbargoError, RepositoryError, Result};
use crate::filter::Filter;
use crate::retry::RetryPolicy;
use crate::timespan::hours_to_duration;

/// A single pattern or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrList::One(s) => vec![s.clone()],
            StringOrList::Many(v) => v.clone(),
        }
    }
}

impl From<&str> for StringOrList {
    fn from(s: &str) -> Self {
        StringOrList::One(s.to_string())
    }
}

/// One entry of the data query list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataQuery {
    /// Collection names or glob patterns to search.
    pub collections: StringOrList,
    /// Dataset type names or glob patterns to transfer.
    pub dataset_types: StringOrList,
    /// Falls back to the instrument given on the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    #[serde(default, rename = "where")]
    pub where_clause: String,
    /// Falls back to `--embargo-hours`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embargo_hours: Option<f64>,
    #[serde(default)]
    pub is_raw: bool,
    /// Dataset types present in these collections are never transferred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avoid_dstypes_from_collections: Option<StringOrList>,
}

impl DataQuery {
    pub fn new(collections: impl Into<StringOrList>, dataset_types: impl Into<StringOrList>) -> Self {
        Self {
            collections: collections.into(),
            dataset_types: dataset_types.into(),
            instrument: None,
            where_clause: String::new(),
            embargo_hours: None,
            is_raw: false,
            avoid_dstypes_from_collections: None,
        }
    }

    /// Parse a YAML list of queries.
    pub fn from_yaml(source: &str) -> std::result::Result<Vec<DataQuery>, ConfigError> {
        serde_yaml::from_str(source).map_err(|e| ConfigError::ParseError {
            message: format!("data queries: {e}"),
        })
    }

    pub fn from_yaml_file(path: &Path) -> std::result::Result<Vec<DataQuery>, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::FileNotFound {
                path: path.to_path_buf(),
            },
            _ => ConfigError::Unreadable {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        Self::from_yaml(&source)
    }

    /// Apply command-line fallbacks and validate.
    pub fn resolve(&self, instrument: &str, embargo_hours: Option<f64>) -> Result<ResolvedQuery> {
        let hours = self.embargo_hours.or(embargo_hours).ok_or_else(|| {
            EmbargoError::validation(format!(
                "no embargo_hours for query on {:?} and no --embargo-hours given",
                self.dataset_types.to_vec()
            ))
        })?;
        hours_to_duration(hours)?;
        let collections = self.collections.to_vec();
        let dataset_types = self.dataset_types.to_vec();
        if collections.is_empty() || dataset_types.is_empty() {
            return Err(EmbargoError::validation(
                "data query needs at least one collection and one dataset type",
            ));
        }
        Ok(ResolvedQuery {
            collections,
            dataset_types,
            instrument: self
                .instrument
                .clone()
                .unwrap_or_else(|| instrument.to_string()),
            filter: Filter::parse(&self.where_clause)?,
            where_clause: self.where_clause.clone(),
            embargo_hours: hours,
            is_raw: self.is_raw,
            avoid_collections: self
                .avoid_dstypes_from_collections
                .as_ref()
                .map(StringOrList::to_vec)
                .unwrap_or_default(),
        })
    }
}

/// A validated data query with every fallback applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedQuery {
    pub collections: Vec<String>,
    pub dataset_types: Vec<String>,
    pub instrument: String,
    pub filter: Option<Filter>,
    pub where_clause: String,
    pub embargo_hours: f64,
    pub is_raw: bool,
    pub avoid_collections: Vec<String>,
}

/// Attempt budget and backoff range for one class of remote calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetrySettings {
    fn validate(&self, name: &str) -> std::result::Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                message: format!("{name}.max_attempts must be at least 1"),
            });
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid {
                message: format!("{name}.min_delay_ms exceeds max_delay_ms"),
            });
        }
        Ok(())
    }

    fn policy<E: std::error::Error + 'static>(&self, retryable: fn(&E) -> bool) -> RetryPolicy<E> {
        RetryPolicy::new(self.max_attempts, retryable).with_backoff(
            Duration::from_millis(self.min_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Tunables for a transfer run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Dimension ids per dataset query.
    pub dimension_batch_size: usize,
    /// Dataset refs per transfer call.
    pub dataset_batch_size: usize,
    pub repository_retry: RetrySettings,
    pub catalog_retry: RetrySettings,
    /// Storage element used when `--rse` is not given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rse: Option<String>,
    /// Catalog scope used when `--scope` is not given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            dimension_batch_size: 100,
            dataset_batch_size: 1000,
            repository_retry: RetrySettings {
                max_attempts: 10,
                min_delay_ms: 2_000,
                max_delay_ms: 10_000,
            },
            catalog_retry: RetrySettings {
                max_attempts: 2,
                min_delay_ms: 500,
                max_delay_ms: 2_000,
            },
            rse: None,
            scope: None,
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.dimension_batch_size == 0 || self.dataset_batch_size == 0 {
            return Err(ConfigError::Invalid {
                message: "batch sizes must be positive".into(),
            });
        }
        self.repository_retry.validate("repository_retry")?;
        self.catalog_retry.validate("catalog_retry")
    }

    pub fn repository_policy(&self) -> RetryPolicy<RepositoryError> {
        self.repository_retry.policy(RepositoryError::is_transient)
    }

    pub fn catalog_policy(&self) -> RetryPolicy<CatalogError> {
        self.catalog_retry.policy(CatalogError::is_transient)
    }
}

/// User-level settings file, e.g. `~/.config/transfer-embargo/settings.toml`.
pub fn user_settings_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "lsst", "transfer-embargo")
        .map(|dirs| dirs.config_dir().join("settings.toml"))
}

/// Load engine settings from defaults, the user file, an explicit file and
/// the environment (`EMBARGO_DATASET_BATCH_SIZE`,
/// `EMBARGO_REPOSITORY_RETRY__MAX_ATTEMPTS`, ...).
pub fn load_settings(explicit: Option<&Path>) -> std::result::Result<EngineSettings, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(EngineSettings::default()));

    if let Some(user) = user_settings_path()
        && user.exists()
    {
        figment = figment.merge(Toml::file(&user));
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("EMBARGO_").split("__"));

    let settings: EngineSettings = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.dimension_batch_size, 100);
        assert_eq!(settings.dataset_batch_size, 1000);
        assert_eq!(settings.repository_policy().max_attempts, 10);
        assert_eq!(settings.catalog_policy().max_attempts, 2);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_query_yaml_accepts_string_or_list() {
        let yaml = r#"
- collections: LATISS/raw/all
  dataset_types: raw
  where: "exposure.observation_type = 'science'"
  embargo_hours: 80.0
  is_raw: true
- collections: [LATISS/runs/*, LATISS/calib]
  dataset_types: ["*"]
  instrument: LSSTComCam
  avoid_dstypes_from_collections: LATISS/raw/all
"#;
        let queries = DataQuery::from_yaml(yaml).unwrap();
        assert_eq!(queries.len(), 2);
        assert!(queries[0].is_raw);
        assert_eq!(queries[0].collections.to_vec(), vec!["LATISS/raw/all"]);
        assert_eq!(queries[1].collections.to_vec().len(), 2);
        assert!(!queries[1].is_raw);
        assert_eq!(queries[1].where_clause, "");
    }

    #[test]
    fn test_unknown_query_field_rejected() {
        let err = DataQuery::from_yaml("- {collections: a, dataset_types: b, colour: red}")
            .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_resolve_applies_fallbacks() {
        let query = DataQuery::new("LATISS/raw/all", "raw");
        let resolved = query.resolve("LATISS", Some(80.0)).unwrap();
        assert_eq!(resolved.instrument, "LATISS");
        assert_eq!(resolved.embargo_hours, 80.0);
        assert!(resolved.filter.is_none());

        let own = DataQuery {
            instrument: Some("LSSTCam".into()),
            embargo_hours: Some(0.1),
            ..query.clone()
        };
        let resolved = own.resolve("LATISS", Some(80.0)).unwrap();
        assert_eq!(resolved.instrument, "LSSTCam");
        assert_eq!(resolved.embargo_hours, 0.1);
    }

    #[test]
    fn test_resolve_requires_valid_hours() {
        let query = DataQuery::new("c", "t");
        assert!(matches!(
            query.resolve("LATISS", None),
            Err(EmbargoError::Validation { .. })
        ));
        assert!(query.resolve("LATISS", Some(-1.0)).is_err());
    }

    #[test]
    fn test_resolve_rejects_bad_filter() {
        let query = DataQuery {
            where_clause: "exposure.id IN (1, ".into(),
            ..DataQuery::new("c", "t")
        };
        assert!(matches!(
            query.resolve("LATISS", Some(1.0)),
            Err(EmbargoError::Filter(_))
        ));
    }

    #[test]
    fn test_load_settings_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "settings.toml",
                r#"
                dataset_batch_size = 250
                rse = "SLAC_RAW"

                [catalog_retry]
                max_attempts = 3
                min_delay_ms = 0
                max_delay_ms = 0
                "#,
            )?;
            jail.set_env("EMBARGO_DIMENSION_BATCH_SIZE", "20");
            jail.set_env("EMBARGO_SCOPE", "raw");

            let settings =
                load_settings(Some(Path::new("settings.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(settings.dataset_batch_size, 250);
            assert_eq!(settings.dimension_batch_size, 20);
            assert_eq!(settings.rse.as_deref(), Some("SLAC_RAW"));
            assert_eq!(settings.scope.as_deref(), Some("raw"));
            assert_eq!(settings.catalog_retry.max_attempts, 3);
            assert_eq!(settings.repository_retry.max_attempts, 10);
            Ok(())
        });
    }

    #[test]
    fn test_load_settings_rejects_zero_batch() {
        Jail::expect_with(|jail| {
            jail.set_env("EMBARGO_DATASET_BATCH_SIZE", "0");
            assert!(matches!(
                load_settings(None),
                Err(ConfigError::Invalid { .. })
            ));
            Ok(())
        });
    }

    #[test]
    fn test_query_file_errors_keep_their_cause() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = DataQuery::from_yaml_file(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));

        // A directory exists but cannot be read as a file.
        let err = DataQuery::from_yaml_file(dir.path()).unwrap_err();
        match err {
            ConfigError::Unreadable { path, .. } => assert_eq!(path, dir.path()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_settings_file() {
        let err = load_settings(Some(Path::new("/nonexistent/settings.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
