use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::store::StoreConfig;

const APP_DOMAIN: &str = "io";
const APP_ORG: &str = "Notecal";
const APP_NAME: &str = "notecal";

/// Browsers commonly allow about this much local storage per origin.
const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

pub struct ConfigLoader {
    paths: ConfigPaths,
}

impl ConfigLoader {
    pub fn discover() -> Result<Self> {
        let paths = ConfigPaths::discover()?;
        Ok(Self { paths })
    }

    pub fn with_paths(paths: ConfigPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    pub fn load_or_init(&self) -> Result<AppConfig> {
        self.paths.ensure_directories()?;
        if !self.paths.config_file.exists() {
            let mut default_cfg = AppConfig::default();
            default_cfg.post_load(&self.paths)?;
            self.write_default_config(&default_cfg)?;
            return Ok(default_cfg);
        }

        self.load()
    }

    pub fn load(&self) -> Result<AppConfig> {
        let raw = fs::read_to_string(&self.paths.config_file)
            .with_context(|| format!("reading config {}", self.paths.config_file.display()))?;
        let mut cfg: AppConfig = toml::from_str(&raw).context("parsing config toml")?;
        cfg.post_load(&self.paths)?;
        Ok(cfg)
    }

    fn write_default_config(&self, cfg: &AppConfig) -> Result<()> {
        let toml = toml::to_string_pretty(cfg).context("serializing default config")?;
        if let Some(parent) = self.paths.config_file.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = fs::File::create(&self.paths.config_file)
            .with_context(|| format!("creating config {}", self.paths.config_file.display()))?;
        file.write_all(toml.as_bytes())
            .context("writing default config")?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub shared_dir: PathBuf,
}

impl ConfigPaths {
    pub fn discover() -> Result<Self> {
        let override_config = env::var("NOTECAL_CONFIG").ok().map(PathBuf::from);
        let override_data = env::var("NOTECAL_DATA").ok().map(PathBuf::from);

        let project_dirs = ProjectDirs::from(APP_DOMAIN, APP_ORG, APP_NAME)
            .context("resolving XDG project directories")?;

        let config_dir = override_config
            .clone()
            .map(|p| {
                if p.is_dir() {
                    p
                } else {
                    p.parent().map(Path::to_path_buf).unwrap_or(p)
                }
            })
            .unwrap_or_else(|| project_dirs.config_dir().to_path_buf());

        let config_file = override_config
            .filter(|p| p.is_file() || p.extension().is_some())
            .unwrap_or_else(|| config_dir.join("config.toml"));

        let data_root = override_data.unwrap_or_else(|| project_dirs.data_dir().to_path_buf());
        Ok(Self::rooted(config_dir, config_file, data_root))
    }

    pub fn rooted(config_dir: PathBuf, config_file: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            database_path: data_dir.join("calendar.db"),
            shared_dir: data_dir.join("shared"),
            config_dir,
            config_file,
            data_dir,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.data_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating application directory {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Fixed identity; when unset a generated id is kept in local storage.
    pub user_id: Option<String>,
    pub storage: StorageOptions,
    pub remote: RemoteOptions,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            storage: StorageOptions::default(),
            remote: RemoteOptions::default(),
        }
    }
}

impl AppConfig {
    fn post_load(&mut self, paths: &ConfigPaths) -> Result<()> {
        self.remote.resolve(paths);
        if let Some(user) = &self.user_id {
            if user.trim().is_empty() {
                tracing::warn!("empty user_id in config, using the generated identity");
                self.user_id = None;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    pub quota_bytes: usize,
    pub wal_autocheckpoint: u32,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            quota_bytes: DEFAULT_QUOTA_BYTES,
            wal_autocheckpoint: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteOptions {
    pub enabled: bool,
    /// Root of the shared-directory remote (defaults to `<data>/shared`).
    pub shared_dir: Option<PathBuf>,
    pub collection: String,
    pub poll_interval_ms: u64,
    pub token_timeout_ms: u64,
    pub watch_interval_ms: u64,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            shared_dir: None,
            collection: "calendar".to_string(),
            poll_interval_ms: 100,
            token_timeout_ms: 3000,
            watch_interval_ms: 500,
        }
    }
}

impl RemoteOptions {
    fn resolve(&mut self, paths: &ConfigPaths) {
        if self.shared_dir.is_none() {
            self.shared_dir = Some(paths.shared_dir.clone());
        }
        if self.collection.trim().is_empty() {
            tracing::warn!("empty remote collection name in config, falling back to 'calendar'");
            self.collection = "calendar".to_string();
        }
        if self.poll_interval_ms == 0 {
            tracing::warn!("remote.poll_interval_ms must be positive, using 100");
            self.poll_interval_ms = 100;
        }
        if self.watch_interval_ms == 0 {
            tracing::warn!("remote.watch_interval_ms must be positive, using 500");
            self.watch_interval_ms = 500;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_millis(self.token_timeout_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            collection: self.collection.clone(),
            poll_interval: self.poll_interval(),
            token_timeout: self.token_timeout(),
        }
    }
}
