use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::export::ExportFormat;
use crate::model::gemini::{DEFAULT_ENDPOINT, DEFAULT_MODEL, ModelConfig};
use crate::rate_limit::RetryPolicy;

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub model: Option<ModelSection>,
    pub extraction: Option<ExtractionSection>,
    pub storage: Option<StorageSection>,
    pub server: Option<ServerSection>,
    pub users: Option<Vec<UserConfig>>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ModelSection {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_secs: Option<u64>,
    /// Enables the adaptive throttle in front of the model client.
    pub requests_per_second: Option<u32>,
}

impl std::fmt::Debug for ModelSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSection")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("requests_per_second", &self.requests_per_second)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionSection {
    pub max_retries: Option<u32>,
    pub backoff_base: Option<u32>,
    pub max_wait_secs: Option<u64>,
    pub channel_capacity: Option<usize>,
    pub join_grace_secs: Option<u64>,
    pub cancel_grace_secs: Option<u64>,
    pub raster_dpi: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSection {
    pub history_path: Option<String>,
    pub artifact_dir: Option<String>,
    pub export_format: Option<ExportFormat>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSection {
    pub bind: Option<String>,
    pub max_upload_mb: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    /// Lowercase or uppercase hex SHA-256 of the password.
    pub password_sha256: String,
    #[serde(default)]
    pub admin: bool,
}

pub const DEFAULT_BIND: &str = "0.0.0.0:5000";
pub const DEFAULT_MAX_UPLOAD_MB: u64 = 500;
pub const DEFAULT_RASTER_DPI: u32 = 200;

/// Platform config directory path: `<config_dir>/pagefield/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("pagefield").join("config.toml"))
}

/// Load config by cascading CWD `.pagefield.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".pagefield.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed; parse failures are logged.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable config file");
            None
        }
    }
}

fn pick<S, T>(overlay: Option<&S>, base: Option<&S>, field: impl Fn(&S) -> Option<T>) -> Option<T> {
    overlay.and_then(&field).or_else(|| base.and_then(&field))
}

/// Merge two configs: `overlay` values take precedence over `base`.
/// The user list is replaced wholesale, never merged.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let (bm, om) = (base.model.as_ref(), overlay.model.as_ref());
    let (be, oe) = (base.extraction.as_ref(), overlay.extraction.as_ref());
    let (bs, os) = (base.storage.as_ref(), overlay.storage.as_ref());
    let (bv, ov) = (base.server.as_ref(), overlay.server.as_ref());

    ConfigFile {
        model: Some(ModelSection {
            endpoint: pick(om, bm, |m| m.endpoint.clone()),
            model: pick(om, bm, |m| m.model.clone()),
            api_key: pick(om, bm, |m| m.api_key.clone()),
            request_timeout_secs: pick(om, bm, |m| m.request_timeout_secs),
            requests_per_second: pick(om, bm, |m| m.requests_per_second),
        }),
        extraction: Some(ExtractionSection {
            max_retries: pick(oe, be, |e| e.max_retries),
            backoff_base: pick(oe, be, |e| e.backoff_base),
            max_wait_secs: pick(oe, be, |e| e.max_wait_secs),
            channel_capacity: pick(oe, be, |e| e.channel_capacity),
            join_grace_secs: pick(oe, be, |e| e.join_grace_secs),
            cancel_grace_secs: pick(oe, be, |e| e.cancel_grace_secs),
            raster_dpi: pick(oe, be, |e| e.raster_dpi),
        }),
        storage: Some(StorageSection {
            history_path: pick(os, bs, |s| s.history_path.clone()),
            artifact_dir: pick(os, bs, |s| s.artifact_dir.clone()),
            export_format: pick(os, bs, |s| s.export_format),
        }),
        server: Some(ServerSection {
            bind: pick(ov, bv, |s| s.bind.clone()),
            max_upload_mb: pick(ov, bv, |s| s.max_upload_mb),
        }),
        users: overlay.users.or(base.users),
    }
}

impl ConfigFile {
    /// Override file values from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("PAGEFIELD_MODEL_API_KEY") {
            self.model.get_or_insert_with(Default::default).api_key = Some(key);
        }
        if let Some(model) = lookup("PAGEFIELD_MODEL") {
            self.model.get_or_insert_with(Default::default).model = Some(model);
        }
        if let Some(path) = lookup("PAGEFIELD_HISTORY_PATH") {
            self.storage.get_or_insert_with(Default::default).history_path = Some(path);
        }
        if let Some(dir) = lookup("PAGEFIELD_ARTIFACT_DIR") {
            self.storage.get_or_insert_with(Default::default).artifact_dir = Some(dir);
        }
        if let Some(bind) = lookup("PAGEFIELD_BIND") {
            self.server.get_or_insert_with(Default::default).bind = Some(bind);
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        let e = self.extraction.as_ref();
        RetryPolicy {
            max_retries: e.and_then(|e| e.max_retries).unwrap_or(defaults.max_retries),
            backoff_base: e.and_then(|e| e.backoff_base).unwrap_or(defaults.backoff_base),
            max_wait: e
                .and_then(|e| e.max_wait_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_wait),
        }
    }

    /// Pipeline settings for [`crate::orchestrator::JobOrchestrator`].
    pub fn pipeline_config(&self) -> crate::Config {
        let defaults = crate::Config::default();
        let e = self.extraction.as_ref();
        crate::Config {
            retry: self.retry_policy(),
            channel_capacity: e
                .and_then(|e| e.channel_capacity)
                .unwrap_or(defaults.channel_capacity),
            join_grace: e
                .and_then(|e| e.join_grace_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.join_grace),
            cancel_grace: e
                .and_then(|e| e.cancel_grace_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.cancel_grace),
        }
    }

    pub fn model_config(&self) -> ModelConfig {
        let m = self.model.as_ref();
        ModelConfig {
            endpoint: m
                .and_then(|m| m.endpoint.clone())
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            model: m
                .and_then(|m| m.model.clone())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key: m.and_then(|m| m.api_key.clone()).unwrap_or_default(),
            request_timeout: m
                .and_then(|m| m.request_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or_else(|| ModelConfig::default().request_timeout),
        }
    }

    pub fn requests_per_second(&self) -> Option<u32> {
        self.model
            .as_ref()
            .and_then(|m| m.requests_per_second)
            .filter(|n| *n > 0)
    }

    pub fn raster_dpi(&self) -> u32 {
        self.extraction
            .as_ref()
            .and_then(|e| e.raster_dpi)
            .unwrap_or(DEFAULT_RASTER_DPI)
    }

    /// Defaults to `<data_dir>/pagefield/history.db`.
    pub fn history_path(&self) -> PathBuf {
        self.storage
            .as_ref()
            .and_then(|s| s.history_path.as_ref())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(std::env::temp_dir)
                    .join("pagefield")
                    .join("history.db")
            })
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.storage
            .as_ref()
            .and_then(|s| s.artifact_dir.as_ref())
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("pagefield"))
    }

    pub fn export_format(&self) -> ExportFormat {
        self.storage
            .as_ref()
            .and_then(|s| s.export_format)
            .unwrap_or_default()
    }

    pub fn bind(&self) -> String {
        self.server
            .as_ref()
            .and_then(|s| s.bind.clone())
            .unwrap_or_else(|| DEFAULT_BIND.to_string())
    }

    pub fn max_upload_bytes(&self) -> usize {
        let mb = self
            .server
            .as_ref()
            .and_then(|s| s.max_upload_mb)
            .unwrap_or(DEFAULT_MAX_UPLOAD_MB);
        (mb as usize).saturating_mul(1024 * 1024)
    }

    pub fn users(&self) -> Vec<UserConfig> {
        self.users.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_file() {
        let toml_str = r#"
            [model]
            model = "gemini-2.0-flash"
            requests_per_second = 4

            [extraction]
            max_retries = 3
            max_wait_secs = 10

            [storage]
            export_format = "json"

            [[users]]
            username = "admin"
            password_sha256 = "abc"
            admin = true

            [[users]]
            username = "alice"
            password_sha256 = "def"
        "#;
        let parsed: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(parsed.model_config().model, "gemini-2.0-flash");
        assert_eq!(parsed.requests_per_second(), Some(4));
        let retry = parsed.retry_policy();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.backoff_base, 2);
        assert_eq!(retry.max_wait, Duration::from_secs(10));
        assert_eq!(parsed.export_format(), ExportFormat::Json);
        let users = parsed.users();
        assert_eq!(users.len(), 2);
        assert!(users[0].admin);
        assert!(!users[1].admin);
    }

    #[test]
    fn defaults_when_empty() {
        let config = ConfigFile::default();
        assert_eq!(config.bind(), DEFAULT_BIND);
        assert_eq!(config.max_upload_bytes(), 500 * 1024 * 1024);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.model_config().model, DEFAULT_MODEL);
        assert_eq!(config.raster_dpi(), DEFAULT_RASTER_DPI);
        assert_eq!(config.export_format(), ExportFormat::Csv);
        assert!(config.requests_per_second().is_none());
    }

    #[test]
    fn merge_overlay_wins_field_by_field() {
        let base = ConfigFile {
            model: Some(ModelSection {
                model: Some("base-model".into()),
                api_key: Some("base-key".into()),
                ..Default::default()
            }),
            users: Some(vec![UserConfig {
                username: "base".into(),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let overlay = ConfigFile {
            model: Some(ModelSection {
                model: Some("overlay-model".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = merge(base, overlay);
        let model = merged.model_config();
        assert_eq!(model.model, "overlay-model");
        assert_eq!(model.api_key, "base-key");
        assert_eq!(merged.users()[0].username, "base");
    }

    #[test]
    fn env_overrides_file() {
        let mut config: ConfigFile = toml::from_str("[server]\nbind = \"127.0.0.1:80\"\n").unwrap();
        config.apply_env_from(|key| match key {
            "PAGEFIELD_BIND" => Some("127.0.0.1:9000".into()),
            "PAGEFIELD_MODEL_API_KEY" => Some("env-key".into()),
            _ => None,
        });
        assert_eq!(config.bind(), "127.0.0.1:9000");
        assert_eq!(config.model_config().api_key, "env-key");
    }

    #[test]
    fn unparseable_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[model\nmodel = ").unwrap();
        assert!(load_from_path(&path).is_none());
        assert!(load_from_path(&dir.path().join("missing.toml")).is_none());
    }

    #[test]
    fn debug_redacts_api_key() {
        let section = ModelSection {
            api_key: Some("sk-live".into()),
            ..Default::default()
        };
        assert!(!format!("{section:?}").contains("sk-live"));
    }
}
