//! Configuration loader and validator for the list synchronizer.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::SyncTarget;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub azure: Azure,
    pub bulk: Bulk,
    pub sync: Extraction,
    pub upload: Upload,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub token_file: String,
}

/// Tenant identity and the remote site/drive/list this tool operates on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Azure {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub site_id: String,
    pub drive_id: String,
    pub list_id: String,
    #[serde(default = "default_authority")]
    pub authority: String,
    #[serde(default = "default_graph_base")]
    pub graph_base: String,
    #[serde(default = "default_scope")]
    pub scope: String,
}

/// Bulk create/delete settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bulk {
    #[serde(default = "default_n_requests")]
    pub n_requests: usize,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    pub add_file: String,
    pub remove_file: String,
    #[serde(default = "default_remove_key_column")]
    pub remove_key_column: String,
    #[serde(default = "default_match_field")]
    pub match_field: String,
    pub error_log: String,
}

/// Delta extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Extraction {
    pub watermark_file: String,
    pub output_file: String,
    pub columns: Vec<String>,
    pub status_column: String,
    #[serde(default = "default_done_value")]
    pub done_value: String,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub targets: Vec<SyncTarget>,
}

/// Chunked upload settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Upload {
    pub remote_folder: String,
    #[serde(default)]
    pub files: Vec<UploadFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadFile {
    pub local_path: String,
    /// Name on the drive; defaults to the local file name.
    #[serde(default)]
    pub remote_name: Option<String>,
}

impl UploadFile {
    pub fn remote_name(&self) -> Option<String> {
        self.remote_name.clone().or_else(|| {
            Path::new(&self.local_path)
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
        })
    }
}

fn default_authority() -> String {
    "https://login.microsoftonline.com/".into()
}

fn default_graph_base() -> String {
    "https://graph.microsoft.com/v1.0/".into()
}

fn default_scope() -> String {
    "https://graph.microsoft.com/.default".into()
}

fn default_n_requests() -> usize {
    200
}

fn default_cooldown_secs() -> u64 {
    10
}

fn default_remove_key_column() -> String {
    "CodeBarre".into()
}

fn default_match_field() -> String {
    "Title".into()
}

fn default_done_value() -> String {
    "terminé".into()
}

impl Config {
    /// Ensure required directories exist: `app.data_dir` and the parents of
    /// every file this tool writes.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if !self.app.data_dir.trim().is_empty() {
            fs::create_dir_all(&self.app.data_dir)?;
        }
        for file in [
            &self.app.token_file,
            &self.bulk.error_log,
            &self.sync.watermark_file,
            &self.sync.output_file,
        ] {
            if let Some(parent) = Path::new(file).parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.bulk.cooldown_secs)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.token_file.trim().is_empty() {
        return Err(ConfigError::Invalid("app.token_file must be non-empty"));
    }

    let az = &cfg.azure;
    if az.tenant_id.trim().is_empty() {
        return Err(ConfigError::Invalid("azure.tenant_id must be non-empty"));
    }
    if az.client_id.trim().is_empty() {
        return Err(ConfigError::Invalid("azure.client_id must be non-empty"));
    }
    if az.client_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("azure.client_secret must be non-empty"));
    }
    if az.site_id.trim().is_empty() {
        return Err(ConfigError::Invalid("azure.site_id must be non-empty"));
    }
    if az.drive_id.trim().is_empty() {
        return Err(ConfigError::Invalid("azure.drive_id must be non-empty"));
    }
    if az.list_id.trim().is_empty() {
        return Err(ConfigError::Invalid("azure.list_id must be non-empty"));
    }
    if !az.graph_base.ends_with('/') || !az.authority.ends_with('/') {
        return Err(ConfigError::Invalid(
            "azure.graph_base and azure.authority must end with '/'",
        ));
    }

    if cfg.bulk.n_requests == 0 {
        return Err(ConfigError::Invalid("bulk.n_requests must be > 0"));
    }
    if cfg.bulk.match_field.trim().is_empty() {
        return Err(ConfigError::Invalid("bulk.match_field must be non-empty"));
    }

    let sync = &cfg.sync;
    if sync.columns.is_empty() {
        return Err(ConfigError::Invalid("sync.columns must list at least one column"));
    }
    if !sync.columns.contains(&sync.status_column) {
        return Err(ConfigError::Invalid("sync.status_column must be one of sync.columns"));
    }
    if sync.page_size == Some(0) {
        return Err(ConfigError::Invalid("sync.page_size must be > 0"));
    }
    if sync.targets.iter().any(|t| t.list_id.trim().is_empty()) {
        return Err(ConfigError::Invalid("sync.targets[].list_id must be non-empty"));
    }

    if cfg.upload.files.iter().any(|f| f.remote_name().is_none()) {
        return Err(ConfigError::Invalid("upload.files[] needs a file name"));
    }

    Ok(())
}

/// Returns a complete example configuration document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  token_file: "./tokens.json"

azure:
  tenant_id: "YOUR_TENANT_ID"
  client_id: "YOUR_CLIENT_ID"
  client_secret: "YOUR_CLIENT_SECRET"
  site_id: "contoso.sharepoint.com,site-guid,web-guid"
  drive_id: "YOUR_DRIVE_ID"
  list_id: "YOUR_LIST_ID"

bulk:
  n_requests: 200
  cooldown_secs: 10
  add_file: "./data/brut/ajout.csv"
  remove_file: "./data/brut/suppression.csv"
  remove_key_column: "CodeBarre"
  match_field: "Title"
  error_log: "./data/logs/erreurs.log"

sync:
  watermark_file: "./data/logs/derniere_extraction.log"
  output_file: "./data/brut/extraction.csv"
  columns: ["col1", "col2", "col3"]
  status_column: "col3"
  done_value: "terminé"
  targets:
    - name: "decisions"
      list_id: "DECISIONS_LIST_ID"

upload:
  remote_folder: "donnees/vitalisation"
  files:
    - local_path: "./data/livrable/livrable.csv"
"#
}
