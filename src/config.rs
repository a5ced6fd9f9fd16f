use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Persisted appliance settings. The recorder core only ever needs a current
/// snapshot of these two fields at each decision point.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub audio_device: String,
    pub auto_record: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio_device: "plughw:0,0".to_string(),
            auto_record: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new() -> Result<Self> {
        let base = BaseDirs::new().context("unable to resolve home directory")?;
        let path = base.home_dir().join(".config").join("picorder.yaml");
        Ok(Self { path })
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Config> {
        if !self.path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read config {}", self.path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn save(&self, config: &Config) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create config dir {}", parent.display()))?;
        }
        let contents = serde_yaml::to_string(config)?;
        fs::write(&self.path, contents)
            .with_context(|| format!("write config {}", self.path.display()))?;
        Ok(())
    }
}

/// TTL cache over the store. The monitor reloads config every poll cycle and
/// the settings screen may rewrite it at any time; a one-second cache keeps
/// that from hammering the SD card without going visibly stale.
#[derive(Debug)]
pub struct ConfigCache {
    store: ConfigStore,
    ttl: Duration,
    cached: Mutex<Option<(Config, Instant)>>,
}

impl ConfigCache {
    pub fn new(store: ConfigStore) -> Self {
        Self::with_ttl(store, Duration::from_secs(1))
    }

    pub fn with_ttl(store: ConfigStore, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Loads the config, serving from cache within the TTL. Read errors fall
    /// back to defaults so a corrupt config file cannot take the monitor down.
    pub fn load(&self) -> Config {
        {
            let cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((config, at)) = cached.as_ref() {
                if at.elapsed() < self.ttl {
                    return config.clone();
                }
            }
        }
        let config = match self.store.load() {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "cannot load config, using defaults");
                Config::default()
            }
        };
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((config.clone(), Instant::now()));
        config
    }

    /// Persists and invalidates, so the next `load` sees the new values.
    pub fn save(&self, config: &Config) -> Result<()> {
        self.store.save(config)?;
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        let store = ConfigStore::at(dir.path().join("picorder.yaml"));
        let cfg = Config {
            audio_device: "plughw:2,0".to_string(),
            auto_record: false,
        };
        store.save(&cfg)?;
        assert_eq!(store.load()?, cfg);
        Ok(())
    }

    #[test]
    fn missing_file_yields_defaults() -> Result<()> {
        let dir = tempdir()?;
        let store = ConfigStore::at(dir.path().join("picorder.yaml"));
        let cfg = store.load()?;
        assert_eq!(cfg, Config::default());
        assert!(cfg.auto_record);
        Ok(())
    }

    #[test]
    fn cache_serves_stale_reads_within_ttl() -> Result<()> {
        let dir = tempdir()?;
        let store = ConfigStore::at(dir.path().join("picorder.yaml"));
        let cache = ConfigCache::with_ttl(store.clone(), Duration::from_secs(60));

        let first = cache.load();
        let mut changed = first.clone();
        changed.audio_device = "plughw:9,0".to_string();
        store.save(&changed)?;
        // Written behind the cache's back, so the cached copy still wins.
        assert_eq!(cache.load(), first);
        Ok(())
    }

    #[test]
    fn save_through_cache_invalidates() -> Result<()> {
        let dir = tempdir()?;
        let store = ConfigStore::at(dir.path().join("picorder.yaml"));
        let cache = ConfigCache::with_ttl(store, Duration::from_secs(60));

        cache.load();
        let changed = Config {
            audio_device: "plughw:3,0".to_string(),
            auto_record: false,
        };
        cache.save(&changed)?;
        assert_eq!(cache.load(), changed);
        Ok(())
    }
}
