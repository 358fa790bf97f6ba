//! Storage settings.
//!
//! Read from `settings.toml` and `.secrets.toml` (merged, secrets win) in the
//! working directory or `FRESH_AIR_SETTINGS_DIR`, then overridden by
//! `FRESH_AIR_`-prefixed environment variables using `__` for nesting, e.g.
//! `FRESH_AIR_STORAGE__USE_STORAGE=bigquery`.

use crate::error::{StorageError, StorageResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "FRESH_AIR_";
const SETTINGS_DIR_ENV: &str = "FRESH_AIR_SETTINGS_DIR";
const SETTINGS_FILES: [&str; 2] = ["settings.toml", ".secrets.toml"];

/// Root settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub credentials: CredentialSettings,
}

/// `[storage]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Active backend: "local" or "bigquery"
    #[serde(default = "default_use_storage")]
    pub use_storage: String,

    #[serde(default)]
    pub local: LocalSettings,

    #[serde(default)]
    pub bigquery: BigQuerySettings,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            use_storage: default_use_storage(),
            local: LocalSettings::default(),
            bigquery: BigQuerySettings::default(),
        }
    }
}

/// `[storage.local]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalSettings {
    /// Root directory for local resources (`~` is expanded)
    #[serde(default = "default_base_dir")]
    pub base_dir: String,

    /// File format: "json" (JSON lines) or "avro"
    #[serde(default = "default_format")]
    pub format: String,

    /// Avro block codec: "deflate" or "null"
    #[serde(default = "default_codec")]
    pub codec: String,

    /// Serialize same-file writers with advisory file locks
    #[serde(default = "default_locking")]
    pub locking: bool,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            format: default_format(),
            codec: default_codec(),
            locking: default_locking(),
        }
    }
}

/// `[storage.bigquery]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BigQuerySettings {
    /// Project used when a table path does not name one
    #[serde(default)]
    pub project_id: Option<String>,

    /// Dataset and job location (e.g. "EU")
    #[serde(default)]
    pub location: Option<String>,

    /// API root; override for emulators
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

impl Default for BigQuerySettings {
    fn default() -> Self {
        Self {
            project_id: None,
            location: None,
            endpoint: default_endpoint(),
        }
    }
}

/// `[credentials]` section, usually kept in `.secrets.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialSettings {
    /// OAuth2 access token, used as is
    #[serde(default)]
    pub access_token: Option<String>,

    /// Path to a service-account JSON key file (`~` is expanded).
    /// Without a token or key file the metadata server is asked.
    #[serde(default)]
    pub etl_service_account_json: Option<String>,

    #[serde(default = "default_metadata_endpoint")]
    pub metadata_endpoint: String,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            access_token: None,
            etl_service_account_json: None,
            metadata_endpoint: default_metadata_endpoint(),
        }
    }
}

fn default_use_storage() -> String { "local".to_string() }
fn default_base_dir() -> String { "./data".to_string() }
fn default_format() -> String { "json".to_string() }
fn default_codec() -> String { "deflate".to_string() }
fn default_locking() -> bool { true }
fn default_endpoint() -> String { "https://bigquery.googleapis.com".to_string() }
fn default_metadata_endpoint() -> String {
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token"
        .to_string()
}

impl Settings {
    /// Load from the default directory and the process environment.
    pub fn load() -> StorageResult<Self> {
        let dir = std::env::var(SETTINGS_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let mut settings = Self::load_from_dir(&dir)?;
        settings.apply_env_overrides(std::env::vars())?;
        Ok(settings)
    }

    /// Load the settings files in `dir`; missing files mean defaults.
    pub fn load_from_dir(dir: &Path) -> StorageResult<Self> {
        let mut merged = toml::Table::new();
        for name in SETTINGS_FILES {
            let path = dir.join(name);
            if !path.exists() {
                continue;
            }
            let content =
                std::fs::read_to_string(&path).map_err(|e| StorageError::io(&path, e))?;
            let table: toml::Table = toml::from_str(&content).map_err(|e| {
                StorageError::config(format!("Failed to parse {}: {}", path.display(), e))
            })?;
            merge_tables(&mut merged, table);
        }
        Self::from_table(merged)
    }

    pub fn from_toml_str(content: &str) -> StorageResult<Self> {
        let table: toml::Table = toml::from_str(content)
            .map_err(|e| StorageError::config(format!("Failed to parse settings: {}", e)))?;
        Self::from_table(table)
    }

    fn from_table(table: toml::Table) -> StorageResult<Self> {
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| StorageError::config(format!("Invalid settings: {}", e)))
    }

    /// Apply `FRESH_AIR_*` overrides; unrelated variables are ignored.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(key) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match key.to_ascii_uppercase().as_str() {
                "STORAGE__USE_STORAGE" => self.storage.use_storage = value,
                "STORAGE__LOCAL__BASE_DIR" => self.storage.local.base_dir = value,
                "STORAGE__LOCAL__FORMAT" => self.storage.local.format = value,
                "STORAGE__LOCAL__CODEC" => self.storage.local.codec = value,
                "STORAGE__LOCAL__LOCKING" => {
                    self.storage.local.locking = parse_bool(&value).ok_or_else(|| {
                        StorageError::config(format!(
                            "Invalid boolean for {}{}: '{}'",
                            ENV_PREFIX, key, value
                        ))
                    })?
                }
                "STORAGE__BIGQUERY__PROJECT_ID" => self.storage.bigquery.project_id = Some(value),
                "STORAGE__BIGQUERY__LOCATION" => self.storage.bigquery.location = Some(value),
                "STORAGE__BIGQUERY__ENDPOINT" => self.storage.bigquery.endpoint = value,
                "CREDENTIALS__ACCESS_TOKEN" => self.credentials.access_token = Some(value),
                "CREDENTIALS__ETL_SERVICE_ACCOUNT_JSON" => {
                    self.credentials.etl_service_account_json = Some(value)
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Local base directory with `~` expanded.
    pub fn local_base_dir(&self) -> PathBuf {
        expand_home(&self.storage.local.base_dir)
    }

    /// Service-account key file with `~` expanded, if configured.
    pub fn service_account_key_path(&self) -> Option<PathBuf> {
        self.credentials
            .etl_service_account_json
            .as_deref()
            .map(expand_home)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
