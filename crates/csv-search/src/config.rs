//! Configuration parsing and validation.
//!
//! csv-search is configured via a TOML file (default: `config/csvs.toml`).
//! Every section is optional; omitted values fall back to built-in
//! defaults, and command-line flags override both.
//!
//! # Example
//!
//! ```toml
//! default_dataset = "items"
//!
//! [db]
//! path = "data/app.db"
//!
//! [embedding]
//! provider = "local"
//! model = "multilingual-e5-small"
//! dims = 384
//!
//! [search]
//! default_top_k = 10
//!
//! [server]
//! bind = "127.0.0.1:8080"
//! request_timeout_secs = 30
//!
//! [logging]
//! level = "csv_search=info"
//! format = "text"
//!
//! [datasets.items]
//! csv = "data/items.csv"
//! id_column = "id"
//! text_columns = ["title", "body"]
//! meta_columns = ["*"]
//! lat_column = "lat"
//! lng_column = "lng"
//! ```
//!
//! Relative paths (`db.path`, `datasets.*.csv`) resolve against the
//! directory that contains the config file.
//!
//! # Validation
//!
//! [`load_config`] rejects unknown keys, unknown providers, a zero
//! `search.default_top_k` or `server.request_timeout_secs`, and an enabled
//! provider without `dims` (or without `model` where one is needed). All
//! of these surface as [`Error::Configuration`].

use anyhow::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use csv_search_core::columns::ColumnConfig;
use csv_search_core::ingest::DEFAULT_BATCH_SIZE;
use csv_search_core::models::DEFAULT_NAMESPACE;
use csv_search_core::search::DEFAULT_LIMIT;
use csv_search_core::Error;

/// Config file looked up when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "config/csvs.toml";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Dataset used when a command does not name one.
    #[serde(default)]
    pub default_dataset: Option<String>,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetConfig>,
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/app.db")
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    DEFAULT_LIMIT
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_shutdown_timeout() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "csv_search=info,csv_search_core=info".to_string()
}

/// Ingestion defaults for one named dataset.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    /// Namespace the rows are stored under; defaults to the dataset name.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub csv: Option<PathBuf>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub id_column: Option<String>,
    #[serde(default)]
    pub text_columns: Vec<String>,
    #[serde(default)]
    pub meta_columns: Vec<String>,
    #[serde(default)]
    pub lat_column: Option<String>,
    #[serde(default)]
    pub lng_column: Option<String>,
}

impl DatasetConfig {
    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn columns(&self) -> ColumnConfig {
        ColumnConfig {
            id: self.id_column.clone().unwrap_or_else(|| "id".to_string()),
            text: self.text_columns.clone(),
            metadata: self.meta_columns.clone(),
            lat: self.lat_column.clone(),
            lng: self.lng_column.clone(),
        }
    }
}

/// A dataset selected by name, together with the namespace it maps to.
#[derive(Debug, Clone)]
pub struct DatasetSelection {
    pub name: Option<String>,
    pub namespace: String,
    pub config: DatasetConfig,
}

impl Config {
    /// Resolve `value` against the config file's directory.
    pub fn resolve_path(&self, value: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if value.is_relative() => base.join(value),
            _ => value.to_path_buf(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.resolve_path(&self.db.path)
    }

    /// Pick a dataset and namespace.
    ///
    /// The dataset is `dataset`, else `default_dataset`. The namespace is
    /// `table`, else the dataset's `table`, else the dataset name, else
    /// `"default"`.
    pub fn select_dataset(&self, dataset: Option<&str>, table: Option<&str>) -> DatasetSelection {
        let name = non_empty(dataset)
            .or_else(|| non_empty(self.default_dataset.as_deref()))
            .map(str::to_string);
        let config = name
            .as_ref()
            .and_then(|n| self.datasets.get(n))
            .cloned()
            .unwrap_or_default();
        let namespace = non_empty(table)
            .or_else(|| non_empty(config.table.as_deref()))
            .or(name.as_deref())
            .unwrap_or(DEFAULT_NAMESPACE)
            .to_string();
        DatasetSelection {
            name,
            namespace,
            config,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn invalid(msg: impl Into<String>) -> anyhow::Error {
    Error::configuration(msg).into()
}

/// Load and validate the config file at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        invalid(format!(
            "failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut config: Config = toml::from_str(&content).map_err(|e| {
        invalid(format!(
            "failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })?;
    config.base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf);

    validate(&config)?;
    Ok(config)
}

/// Load `explicit` when given; otherwise the default path if it exists,
/// else built-in defaults.
pub fn load_or_default(explicit: Option<&Path>) -> Result<Config> {
    match explicit {
        Some(path) => load_config(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                load_config(default)
            } else {
                Ok(Config::default())
            }
        }
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.search.default_top_k == 0 {
        return Err(invalid("search.default_top_k must be >= 1"));
    }
    if config.server.request_timeout_secs == 0 {
        return Err(invalid("server.request_timeout_secs must be > 0"));
    }

    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "disabled" => {}
        "hash" => {
            if embedding.dims.unwrap_or(0) == 0 {
                return Err(invalid("embedding.dims must be > 0 when provider is 'hash'"));
            }
        }
        "openai" | "ollama" | "local" => {
            if embedding.dims.unwrap_or(0) == 0 {
                return Err(invalid(format!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    embedding.provider
                )));
            }
            if embedding.model.is_none() {
                return Err(invalid(format!(
                    "embedding.model must be specified when provider is '{}'",
                    embedding.provider
                )));
            }
        }
        other => {
            return Err(invalid(format!(
                "unknown embedding provider: '{}'. Must be disabled, openai, ollama, local, or hash.",
                other
            )))
        }
    }

    for (name, ds) in &config.datasets {
        if ds.batch_size == Some(0) {
            return Err(invalid(format!("datasets.{}.batch_size must be > 0", name)));
        }
        if ds.id_column.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(invalid(format!("datasets.{}.id_column must not be empty", name)));
        }
    }
    Ok(())
}
