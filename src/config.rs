use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::path_util::{absolutize_path, home_dir};

#[derive(Debug, Default, Deserialize, Clone)]
struct PartialConfig {
    #[serde(default)]
    sync_server: Option<String>,
    #[serde(default)]
    sync_server_storage_id: Option<String>,
    #[serde(default)]
    sync_enabled: Option<bool>,
    #[serde(default)]
    defaults: Option<PartialDefaults>,
    #[serde(default)]
    sync: Option<PartialSyncSettings>,
    #[serde(default)]
    artifact_directories: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize, Clone)]
struct PartialDefaults {
    #[serde(default)]
    exclude_patterns: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize, Clone)]
struct PartialSyncSettings {
    #[serde(default)]
    move_detection_threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub sync_server: Option<String>,
    pub sync_server_storage_id: Option<String>,
    pub sync_enabled: bool,
    pub exclude_patterns: Vec<String>,
    pub move_detection_threshold: f64,
    pub artifact_directories: Vec<String>,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub sync_server: Option<String>,
    pub sync_server_storage_id: Option<String>,
    pub sync_enabled: Option<bool>,
}

impl Config {
    pub fn default_exclude_patterns() -> Vec<String> {
        crate::filters::DEFAULT_EXCLUDE_PATTERNS
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    pub fn default_move_detection_threshold() -> f64 {
        0.7
    }

    pub fn default_log_file_path(root: &Path) -> PathBuf {
        root.join(".pushwork").join("pushwork.log")
    }

    pub fn global_config_path() -> PathBuf {
        home_dir().join(".pushwork").join("config.json")
    }

    pub fn local_config_path(root: &Path) -> PathBuf {
        root.join(".pushwork").join("config.json")
    }

    fn load_partial(path: &Path) -> Result<PartialConfig> {
        if !path.exists() {
            return Ok(PartialConfig::default());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&data).context("parse config json")
    }

    /// Merges built-in defaults < global file < local file < explicit overrides.
    pub fn load_with_overrides(root: &Path, overrides: ConfigOverrides) -> Result<Self> {
        Self::load_with_overrides_from(root, None, overrides)
    }

    /// As [`Config::load_with_overrides`], but reads the local layer from
    /// `local_path` instead of `<root>/.pushwork/config.json` when given
    /// (backs the CLI's `--config` flag).
    pub fn load_with_overrides_from(
        root: &Path,
        local_path: Option<&Path>,
        overrides: ConfigOverrides,
    ) -> Result<Self> {
        let global = Self::load_partial(&Self::global_config_path())?;
        let local_config_path = local_path
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| Self::local_config_path(root));
        let local = Self::load_partial(&local_config_path)?;

        let sync_server = overrides
            .sync_server
            .or(local.sync_server)
            .or(global.sync_server);
        let sync_server_storage_id = overrides
            .sync_server_storage_id
            .or(local.sync_server_storage_id)
            .or(global.sync_server_storage_id);
        let sync_enabled = overrides
            .sync_enabled
            .or(local.sync_enabled)
            .or(global.sync_enabled)
            .unwrap_or(true);
        let exclude_patterns = local
            .defaults
            .and_then(|d| d.exclude_patterns)
            .or_else(|| global.defaults.clone().and_then(|d| d.exclude_patterns))
            .unwrap_or_else(Self::default_exclude_patterns);
        let move_detection_threshold = local
            .sync
            .and_then(|s| s.move_detection_threshold)
            .or_else(|| global.sync.clone().and_then(|s| s.move_detection_threshold))
            .unwrap_or_else(Self::default_move_detection_threshold);
        let artifact_directories = local
            .artifact_directories
            .or(global.artifact_directories)
            .unwrap_or_default();

        let cfg = Config {
            sync_server,
            sync_server_storage_id,
            sync_enabled,
            exclude_patterns,
            move_detection_threshold,
            artifact_directories,
            config_path: Some(local_config_path),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            anyhow::bail!("config_path missing");
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(self).context("serialize config")?;
        std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.move_detection_threshold) {
            anyhow::bail!(
                "sync.move_detection_threshold must be in [0, 1], got {}",
                self.move_detection_threshold
            );
        }
        if let Some(url) = &self.sync_server {
            validate_sync_server_url(url)?;
        }
        Ok(())
    }
}

fn validate_sync_server_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw).with_context(|| format!("sync_server: invalid url {raw}"))?;
    if url.scheme() != "ws" && url.scheme() != "wss" && url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("sync_server must use ws(s):// or http(s)://, got {raw}");
    }
    Ok(())
}

pub(crate) fn resolve_root(flag_path: Option<&Path>) -> PathBuf {
    match flag_path {
        Some(p) => absolutize_path(p),
        None => absolutize_path(Path::new(".")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    fn tmp_dir(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn defaults_apply_when_no_files_present() {
        let root = tmp_dir("pushwork-config-defaults");
        let cfg = Config::load_with_overrides(&root, ConfigOverrides::default()).unwrap();
        assert!(cfg.sync_enabled);
        assert_eq!(cfg.move_detection_threshold, 0.7);
        assert!(cfg.exclude_patterns.contains(&".git".to_string()));
    }

    #[test]
    fn local_file_overrides_defaults() {
        let root = tmp_dir("pushwork-config-local");
        let control = root.join(".pushwork");
        fs::create_dir_all(&control).unwrap();
        fs::write(
            control.join("config.json"),
            r#"{"sync_server":"wss://relay.example.com","sync":{"move_detection_threshold":0.9}}"#,
        )
        .unwrap();
        let cfg = Config::load_with_overrides(&root, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.sync_server.as_deref(), Some("wss://relay.example.com"));
        assert_eq!(cfg.move_detection_threshold, 0.9);
    }

    #[test]
    fn explicit_override_beats_local_file() {
        let root = tmp_dir("pushwork-config-override");
        let control = root.join(".pushwork");
        fs::create_dir_all(&control).unwrap();
        fs::write(control.join("config.json"), r#"{"sync_server":"wss://from-file"}"#).unwrap();
        let overrides = ConfigOverrides {
            sync_server: Some("wss://from-flag".to_string()),
            ..Default::default()
        };
        let cfg = Config::load_with_overrides(&root, overrides).unwrap();
        assert_eq!(cfg.sync_server.as_deref(), Some("wss://from-flag"));
    }

    #[test]
    fn rejects_threshold_out_of_range() {
        let root = tmp_dir("pushwork-config-bad-threshold");
        let control = root.join(".pushwork");
        fs::create_dir_all(&control).unwrap();
        fs::write(
            control.join("config.json"),
            r#"{"sync":{"move_detection_threshold":1.5}}"#,
        )
        .unwrap();
        let err = Config::load_with_overrides(&root, ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("move_detection_threshold"));
    }

    #[test]
    fn rejects_non_websocket_http_scheme() {
        let root = tmp_dir("pushwork-config-bad-scheme");
        let control = root.join(".pushwork");
        fs::create_dir_all(&control).unwrap();
        fs::write(control.join("config.json"), r#"{"sync_server":"ftp://bad"}"#).unwrap();
        let err = Config::load_with_overrides(&root, ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("sync_server"));
    }
}
