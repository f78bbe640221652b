use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::models::HttpConfig;
use crate::storage::{CacheConfig, ThrottleConfig, TransferConfig};

const CONFIG_FILE: &str = "settings.json";
const MANIFEST_FILE: &str = "models.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Overrides the platform data directory when set.
    pub models_root: Option<PathBuf>,
    pub models_subdir: String,
    /// Extra catalog entries; relative paths resolve against the config dir.
    pub catalog_manifest: PathBuf,
    pub transfer: TransferConfig,
    pub throttle: ThrottleConfig,
    pub cache: CacheConfig,
    pub http: HttpConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            models_root: None,
            models_subdir: "models".into(),
            catalog_manifest: PathBuf::from(MANIFEST_FILE),
            transfer: TransferConfig::default(),
            throttle: ThrottleConfig::default(),
            cache: CacheConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

/// Settings backed by a JSON file.
pub struct SettingsManager {
    path: PathBuf,
    inner: RwLock<Settings>,
}

impl SettingsManager {
    /// Loads from the platform config directory.
    pub fn new() -> Result<Self> {
        Self::open(resolve_config_path()?)
    }

    /// Loads `path`, falling back to defaults when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = load_settings(&path)?;
        Ok(Self {
            path,
            inner: RwLock::new(settings),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Settings {
        self.inner.read().clone()
    }

    pub fn write(&self, settings: Settings) -> Result<()> {
        let mut guard = self.inner.write();
        persist_settings(&self.path, &settings)?;
        *guard = settings;
        Ok(())
    }

    pub fn manifest_path(&self) -> PathBuf {
        let manifest = &self.inner.read().catalog_manifest;
        if manifest.is_absolute() {
            return manifest.clone();
        }
        match self.path.parent() {
            Some(dir) => dir.join(manifest),
            None => manifest.clone(),
        }
    }
}

fn resolve_config_path() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("com", "ModelDepot", "ModelDepot")
        .context("missing project directories")?;
    let dir = project_dirs.config_dir();
    fs::create_dir_all(dir).context("creating config directory failed")?;
    Ok(dir.join(CONFIG_FILE))
}

fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let bytes = fs::read(path).with_context(|| format!("failed reading {path:?}"))?;
    serde_json::from_slice(&bytes).context("settings json could not be parsed")
}

fn persist_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
    }
    let serialized =
        serde_json::to_vec_pretty(settings).context("serialize settings to json failed")?;
    fs::write(path, serialized).with_context(|| format!("write settings to {path:?}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let manager = SettingsManager::open(dir.path().join("settings.json")).unwrap();
        assert_eq!(manager.read(), Settings::default());
        assert_eq!(manager.manifest_path(), dir.path().join("models.json"));
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            br#"{"modelsSubdir":"weights","throttle":{"percentStep":5}}"#,
        )
        .unwrap();

        let settings = SettingsManager::open(&path).unwrap().read();
        assert_eq!(settings.models_subdir, "weights");
        assert_eq!(settings.throttle.percent_step, 5);
        assert_eq!(settings.throttle.interval, Duration::from_millis(200));
        assert_eq!(settings.transfer, TransferConfig::default());
    }

    #[test]
    fn written_settings_survive_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let manager = SettingsManager::open(&path).unwrap();

        let mut settings = manager.read();
        settings.models_root = Some(dir.path().join("store"));
        settings.cache.quick_ttl = Duration::from_secs(5);
        settings.catalog_manifest = dir.path().join("custom.json");
        manager.write(settings.clone()).unwrap();

        let reloaded = SettingsManager::open(&path).unwrap();
        assert_eq!(reloaded.read(), settings);
        assert_eq!(reloaded.manifest_path(), dir.path().join("custom.json"));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(SettingsManager::open(&path).is_err());
    }
}
