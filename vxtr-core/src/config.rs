use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use config::Config as ConfigLoader;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::gateway::GatewaySettings;
use crate::schema::SchemaOverride;

/// Embedded template used to bootstrap the on-disk configuration when the
/// tool runs for the first time.
pub const DEFAULT_CONFIG_TEMPLATE: &str = include_str!("../templates/config.toml");

/// Loaded configuration plus the resolved runtime paths it applies to.
#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub config: AppConfig,
    pub paths: AppPaths,
}

impl ConfigBundle {
    /// Gateway settings with the transcript directory resolved against the
    /// runtime paths. Transcripts stay off unless `[logging]` turns them on.
    pub fn gateway_settings(&self) -> Result<GatewaySettings> {
        let transcript_dir = if self.config.logging.transcripts {
            Some(match self.config.logging.transcript_dir.as_deref() {
                Some(value) => resolve_path_value(value, &self.paths.config_dir)?,
                None => self.paths.state_dir.join("transcripts"),
            })
        } else {
            None
        };

        Ok(GatewaySettings {
            model: self.config.gateway.model.clone(),
            base_url: self.config.gateway.base_url.clone(),
            timeout: Duration::from_millis(self.config.gateway.timeout_ms),
            connect_timeout: Duration::from_millis(self.config.gateway.connect_timeout_ms),
            concurrency: self.config.gateway.concurrency,
            num_predict: self.config.gateway.num_predict,
            transcript_dir,
        })
    }
}

/// Resolve paths for `app_name`, materialize the default config file on
/// first run, and load it with `APP__SECTION__KEY` environment overrides
/// layered on top.
pub fn load_or_initialize_config(app_name: impl AsRef<str>) -> Result<ConfigBundle> {
    let app_name = app_name.as_ref();
    let mut paths = AppPaths::discover(app_name)?;
    paths.ensure_config_dir()?;

    if !paths.config_file.exists() {
        fs::write(&paths.config_file, DEFAULT_CONFIG_TEMPLATE).with_context(|| {
            format!(
                "failed to seed default config at {}",
                paths.config_file.display()
            )
        })?;
    }

    let env_prefix = app_name.replace('-', "_").to_ascii_uppercase();
    let loaded = ConfigLoader::builder()
        .add_source(File::from(paths.config_file.clone()))
        .add_source(
            Environment::with_prefix(&env_prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| {
            format!(
                "failed to parse configuration at {}",
                paths.config_file.display()
            )
        })?;

    let mut config: AppConfig = loaded
        .try_deserialize()
        .context("configuration does not match the expected shape")?;

    paths = paths.apply_storage_overrides(&config.storage)?;
    paths.ensure_runtime_dirs()?;
    config.normalize()?;

    Ok(ConfigBundle { config, paths })
}

/// Persistent runtime paths derived from XDG environment variables or
/// sensible fallbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub app_name: String,
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl AppPaths {
    pub fn discover(app_name: impl Into<String>) -> Result<Self> {
        let app_name = app_name.into();
        let home = home_dir().context("cannot locate a home directory for XDG path resolution")?;

        let config_dir = xdg_dir("XDG_CONFIG_HOME", &home, ".config").join(&app_name);
        let data_dir = xdg_dir("XDG_DATA_HOME", &home, ".local/share").join(&app_name);
        let state_base = xdg_dir("XDG_STATE_HOME", &home, ".local/state");
        let cache_dir = match env::var("XDG_CACHE_HOME") {
            Ok(value) if !value.is_empty() => PathBuf::from(value).join(&app_name),
            _ => state_base.join("cache").join(&app_name),
        };
        let state_dir = state_base.join(&app_name);
        let config_file = config_dir.join("config.toml");

        Ok(Self {
            app_name,
            config_dir,
            config_file,
            data_dir,
            state_dir,
            cache_dir,
        })
    }

    pub fn ensure_config_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.config_dir)
            .with_context(|| format!("failed to create {}", self.config_dir.display()))
    }

    pub fn ensure_runtime_dirs(&self) -> Result<()> {
        for dir in [&self.data_dir, &self.state_dir, &self.cache_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create runtime dir {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn apply_storage_overrides(&self, storage: &StorageSettings) -> Result<Self> {
        let mut next = self.clone();

        if let Some(dir) = storage.data_dir.as_deref() {
            next.data_dir = resolve_path_value(dir, &self.config_dir)?;
        }
        if let Some(dir) = storage.state_dir.as_deref() {
            next.state_dir = resolve_path_value(dir, &self.config_dir)?;
        }
        match storage.cache_dir.as_deref() {
            Some(dir) => next.cache_dir = resolve_path_value(dir, &self.config_dir)?,
            // Cache follows the state directory unless pinned explicitly.
            None => next.cache_dir = next.state_dir.join("cache"),
        }

        Ok(next)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub extraction: ExtractionSettings,
    pub gateway: GatewaySection,
    pub schemas: HashMap<String, SchemaOverride>,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

impl AppConfig {
    pub fn normalize(&mut self) -> Result<()> {
        if self.extraction.max_attempts == 0 {
            bail!("extraction.max_attempts must be at least 1");
        }
        if self.gateway.concurrency == 0 {
            bail!("gateway.concurrency must be at least 1");
        }
        if self.gateway.model.trim().is_empty() {
            bail!("gateway.model must name a model");
        }
        if self.gateway.base_url.trim().is_empty() {
            bail!("gateway.base_url must point at a backend");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    /// Attempt budget per request, shared between transport retries and
    /// validation repairs.
    pub max_attempts: u32,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub model: String,
    pub base_url: String,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub concurrency: usize,
    pub num_predict: u32,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            model: "qwen2.5vl:3b".to_string(),
            base_url: "http://localhost:11434".to_string(),
            timeout_ms: 120_000,
            connect_timeout_ms: 5_000,
            concurrency: 1,
            num_predict: 512,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: Option<String>,
    pub state_dir: Option<String>,
    pub cache_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Write every gateway call as a JSON transcript file.
    pub transcripts: bool,
    /// Where transcripts land; defaults to `<state_dir>/transcripts`.
    pub transcript_dir: Option<String>,
}

fn xdg_dir(var: &str, home: &Path, fallback_suffix: &str) -> PathBuf {
    match env::var(var) {
        Ok(value) if !value.is_empty() => PathBuf::from(value),
        _ => home.join(fallback_suffix),
    }
}

pub fn resolve_path_value(value: &str, base_dir: &Path) -> Result<PathBuf> {
    let expanded = expand_path(value)?;
    let path = PathBuf::from(&expanded);
    if path.is_absolute() {
        // Normalize away any doubled separators left over from expansion.
        Ok(path.components().collect())
    } else {
        Ok(base_dir.join(path))
    }
}

fn expand_path(value: &str) -> Result<String> {
    let home = home_dir();
    let home_utf8 = home
        .as_ref()
        .map(|path| {
            path.to_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("home directory contains invalid UTF-8"))
        })
        .transpose()?;

    let expanded = shellexpand::full_with_context(
        value,
        || home_utf8.as_deref(),
        |var| Ok(env::var(var).ok()),
    )
    .map_err(|error: shellexpand::LookupError<std::env::VarError>| {
        anyhow!("failed to expand '{value}': {error}")
    })?;
    Ok(expanded.into_owned())
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("USERPROFILE").map(PathBuf::from))
}
