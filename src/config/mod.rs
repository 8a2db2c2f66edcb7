//! Configuration loading.
//!
//! Lookup order: `--config <path>`, then `$VOXROOM_CONFIG`, then
//! `<config_dir>/voxroom/config.toml`. Credential-like strings accept
//! `$VAR` / `${VAR}` so secrets can stay in the environment.

pub mod schema;

use std::path::{Path, PathBuf};

use anyhow::Context;
use directories::ProjectDirs;

pub use schema::{BridgeSettings, BrowserSettings, Config, OfficeSettings};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "VOXROOM_CONFIG";

impl Config {
    /// Resolve, read, expand and validate.
    pub fn load(cli_path: Option<&Path>) -> anyhow::Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let path = resolve_path(cli_path, env_path)?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.config_path = path.to_path_buf();
        tracing::debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let mut config: Self = toml::from_str(contents).context("Failed to parse config")?;
        config.expand_env()?;
        config.validate()?;
        Ok(config)
    }

    fn expand_env(&mut self) -> anyhow::Result<()> {
        expand_in_place(&mut self.voice.api_key, "voice.api_key")?;
        if let Some(endpoint) = self.voice.endpoint.as_mut() {
            expand_in_place(endpoint, "voice.endpoint")?;
        }
        expand_in_place(&mut self.office.url, "office.url")?;
        expand_in_place(&mut self.office.email, "office.email")?;
        expand_in_place(&mut self.office.password, "office.password")?;
        for (path, key) in [
            (self.browser.executable.as_mut(), "browser.executable"),
            (self.browser.user_data_dir.as_mut(), "browser.user_data_dir"),
        ] {
            if let Some(path) = path {
                let raw = path.to_string_lossy().into_owned();
                let expanded = shellexpand::full(&raw)
                    .map_err(|e| anyhow::anyhow!("Failed to expand {key}: {e}"))?;
                *path = PathBuf::from(expanded.as_ref());
            }
        }
        Ok(())
    }

    /// Checks that do not depend on the selected provider. Provider fields
    /// are checked when the voice client is built.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.office.url.trim().is_empty() {
            anyhow::bail!("office.url is required");
        }
        let bridge = &self.bridge;
        if bridge.locator_timeout_ms == 0 {
            anyhow::bail!("bridge.locator_timeout_ms must be greater than 0");
        }
        if bridge.ready_timeout_ms == 0 {
            anyhow::bail!("bridge.ready_timeout_ms must be greater than 0");
        }
        if bridge.held_audio_cap == 0 {
            anyhow::bail!("bridge.held_audio_cap must be greater than 0");
        }
        if self.office.element_timeout_ms == 0 {
            anyhow::bail!("office.element_timeout_ms must be greater than 0");
        }
        if let Some(selector) = &bridge.audio_selector {
            if selector.trim().is_empty() {
                anyhow::bail!("bridge.audio_selector cannot be empty; omit it to skip");
            }
        }
        Ok(())
    }
}

fn expand_in_place(value: &mut String, key: &str) -> anyhow::Result<()> {
    if !value.contains('$') {
        return Ok(());
    }
    let expanded = shellexpand::env(value.as_str())
        .map_err(|e| anyhow::anyhow!("Failed to expand {key}: {e}"))?
        .into_owned();
    *value = expanded;
    Ok(())
}

/// Pick the config file: explicit path, then the environment, then the
/// platform config directory.
pub fn resolve_path(cli_path: Option<&Path>, env_path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = cli_path {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = env_path.filter(|p| !p.as_os_str().is_empty()) {
        return Ok(path);
    }
    default_path()
}

pub fn default_path() -> anyhow::Result<PathBuf> {
    ProjectDirs::from("", "", "voxroom")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .ok_or_else(|| anyhow::anyhow!("Could not determine the config directory; pass --config"))
}
