//! Settings loading, saving, and environment variable interpolation.
//!
//! The `SettingsManager` handles:
//! - Loading settings from `~/.gantry/settings.toml`
//! - Resolving `$VAR` and `${VAR}` environment variable references
//! - Atomic file writes with temp file + rename
//! - Defaults when the file is absent

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Get the path to the global settings file.
pub fn settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gantry")
        .join("settings.toml")
}

/// Default data directory for store files (`~/.gantry`).
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gantry")
}

/// Top-level settings schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GantrySettings {
    /// Directory holding the workflow and credential store files.
    /// Defaults to `~/.gantry` when unset.
    pub data_dir: Option<String>,

    /// Environment variable holding the credential master key.
    pub master_key_env: String,

    pub engine: EngineSettings,
    pub credentials: CredentialSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Scheduler tick interval in milliseconds.
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialSettings {
    /// Lease expiry sweep interval in milliseconds.
    pub lease_sweep_interval_ms: u64,
}

impl Default for GantrySettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            master_key_env: "GANTRY_MASTER_KEY".to_string(),
            engine: EngineSettings::default(),
            credentials: CredentialSettings::default(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
        }
    }
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            lease_sweep_interval_ms: 60_000,
        }
    }
}

impl GantrySettings {
    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir)
    }
}

/// Manages settings loading, interpolation, and persistence.
pub struct SettingsManager {
    /// Cached settings (with env vars resolved)
    settings: RwLock<GantrySettings>,

    /// Path to the settings file
    path: PathBuf,
}

impl SettingsManager {
    /// Create a new SettingsManager, loading from disk if available.
    pub async fn new() -> Result<Self> {
        Self::at_path(settings_path()).await
    }

    /// Create a SettingsManager backed by a specific file.
    pub async fn at_path(path: PathBuf) -> Result<Self> {
        let settings = Self::load_from_path(&path).await?;
        Ok(Self {
            settings: RwLock::new(settings),
            path,
        })
    }

    async fn load_from_path(path: &PathBuf) -> Result<GantrySettings> {
        if !path.exists() {
            tracing::debug!("Settings file not found at {:?}, using defaults", path);
            return Ok(GantrySettings::default());
        }

        let contents = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read settings file")?;

        let mut settings: GantrySettings =
            toml::from_str(&contents).context("Failed to deserialize settings")?;

        Self::resolve_env_vars(&mut settings);

        tracing::info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Resolve $ENV_VAR references in string fields.
    fn resolve_env_vars(settings: &mut GantrySettings) {
        if let Some(dir) = &settings.data_dir {
            if let Some(resolved) = resolve_env_ref(dir) {
                settings.data_dir = Some(resolved);
            }
        }
    }

    /// Get the current settings (read-only).
    pub async fn get(&self) -> GantrySettings {
        self.settings.read().await.clone()
    }

    /// Update settings and persist to disk.
    pub async fn update(&self, new_settings: GantrySettings) -> Result<()> {
        *self.settings.write().await = new_settings.clone();

        let toml_string =
            toml::to_string_pretty(&new_settings).context("Failed to serialize settings")?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, toml_string).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::debug!("Saved settings to {:?}", self.path);
        Ok(())
    }
}

/// Resolve a `$VAR` or `${VAR}` reference to its environment value.
/// Returns `None` when the value is not a reference or the variable is
/// unset.
fn resolve_env_ref(value: &str) -> Option<String> {
    let name = if let Some(rest) = value.strip_prefix("${") {
        rest.strip_suffix('}')?
    } else {
        value.strip_prefix('$')?
    };

    if name.is_empty() {
        return None;
    }
    std::env::var(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_env_ref_forms() {
        std::env::set_var("GANTRY_TEST_SETTING", "/tmp/gantry-test");

        assert_eq!(
            resolve_env_ref("$GANTRY_TEST_SETTING").as_deref(),
            Some("/tmp/gantry-test")
        );
        assert_eq!(
            resolve_env_ref("${GANTRY_TEST_SETTING}").as_deref(),
            Some("/tmp/gantry-test")
        );
        assert_eq!(resolve_env_ref("/plain/path"), None);
        assert_eq!(resolve_env_ref("$GANTRY_TEST_UNSET_VAR"), None);
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SettingsManager::at_path(dir.path().join("settings.toml"))
            .await
            .unwrap();

        let settings = manager.get().await;
        assert_eq!(settings.master_key_env, "GANTRY_MASTER_KEY");
        assert_eq!(settings.engine.tick_interval_ms, 5_000);
        assert_eq!(settings.credentials.lease_sweep_interval_ms, 60_000);
    }

    #[tokio::test]
    async fn update_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");

        let manager = SettingsManager::at_path(path.clone()).await.unwrap();
        let mut settings = manager.get().await;
        settings.engine.tick_interval_ms = 1_000;
        manager.update(settings).await.unwrap();

        let reloaded = SettingsManager::at_path(path).await.unwrap();
        assert_eq!(reloaded.get().await.engine.tick_interval_ms, 1_000);
    }
}
