use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::models::{
    notification_channel, resolve_model_dir, DownloadManager, EventReceiver, HttpTransport,
    KnownModel, ManagerConfig, ModelCatalog, Transport,
};
use crate::storage::{ChunkedTransfer, FileStatCache};

use super::settings::{Settings, SettingsManager};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ModelStatus {
    NotInstalled,
    Downloading { progress: f64 },
    Installed { size: u64 },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    pub model: KnownModel,
    pub path: PathBuf,
    pub status: ModelStatus,
}

/// Everything the rest of the application needs to reach downloaded models.
pub struct DepotContext {
    settings: Arc<SettingsManager>,
    models_dir: PathBuf,
    cache: Arc<FileStatCache>,
    downloads: DownloadManager,
}

impl DepotContext {
    /// Context rooted in the platform config and data directories.
    pub fn new() -> Result<Self> {
        let settings = SettingsManager::new()?;
        let current = settings.read();
        let models_dir = match current.models_root {
            Some(root) => root.join(&current.models_subdir),
            None => resolve_model_dir(&current.models_subdir)?,
        };
        let (sender, receiver) = notification_channel();
        let transport = HttpTransport::new(current.http, sender);
        Self::build(settings, models_dir, Box::new(transport), receiver)
    }

    /// Context keeping settings, manifest and models below `root`.
    pub fn with_root(root: &Path) -> Result<Self> {
        let settings = SettingsManager::open(root.join("settings.json"))?;
        let (sender, receiver) = notification_channel();
        let transport = HttpTransport::new(settings.read().http, sender);
        Self::with_transport(settings, root, Box::new(transport), receiver)
    }

    /// Like [`with_root`](Self::with_root) with downloads going through `transport`.
    pub fn with_transport(
        settings: SettingsManager,
        root: &Path,
        transport: Box<dyn Transport>,
        events: EventReceiver,
    ) -> Result<Self> {
        let current = settings.read();
        let models_dir = current
            .models_root
            .unwrap_or_else(|| root.to_path_buf())
            .join(&current.models_subdir);
        Self::build(settings, models_dir, transport, events)
    }

    fn build(
        settings: SettingsManager,
        models_dir: PathBuf,
        transport: Box<dyn Transport>,
        events: EventReceiver,
    ) -> Result<Self> {
        let current = settings.read();
        let catalog = ModelCatalog::load(&settings.manifest_path())?;
        let cache = Arc::new(FileStatCache::new(current.cache.clone()));
        let downloads = DownloadManager::new(
            manager_config(&current, models_dir.clone()),
            catalog,
            transport,
            events,
            cache.clone(),
        );
        info!("depot_ready: {}", models_dir.display());
        Ok(Self {
            settings: Arc::new(settings),
            models_dir,
            cache,
            downloads,
        })
    }

    pub fn settings_manager(&self) -> Arc<SettingsManager> {
        self.settings.clone()
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn cache(&self) -> Arc<FileStatCache> {
        self.cache.clone()
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    pub fn downloads_mut(&mut self) -> &mut DownloadManager {
        &mut self.downloads
    }

    pub fn catalog(&self) -> &ModelCatalog {
        self.downloads.catalog()
    }

    pub fn model_path(&self, name: &str) -> Result<PathBuf> {
        let model = self
            .catalog()
            .find(name)
            .ok_or_else(|| anyhow!("unknown model {name}"))?;
        Ok(model.path(&self.models_dir))
    }

    /// True once the final file exists and no download for it is running.
    pub fn is_model_ready(&self, name: &str) -> bool {
        matches!(self.model_status(name), Ok(ModelStatus::Installed { .. }))
    }

    pub fn model_status(&self, name: &str) -> Result<ModelStatus> {
        let path = self.model_path(name)?;
        if let Some(active) = self
            .downloads
            .active_downloads()
            .into_iter()
            .find(|info| info.file_name == name)
        {
            let progress = active
                .last_progress
                .map(|progress| progress.percentage())
                .unwrap_or(0.0);
            return Ok(ModelStatus::Downloading { progress });
        }

        let info = self.cache.info(&path);
        if info.exists && info.size > 0 {
            Ok(ModelStatus::Installed { size: info.size })
        } else {
            Ok(ModelStatus::NotInstalled)
        }
    }

    pub fn list_models(&self) -> Vec<ModelEntry> {
        self.catalog()
            .models()
            .iter()
            .map(|model| ModelEntry {
                model: model.clone(),
                path: model.path(&self.models_dir),
                status: self
                    .model_status(&model.name)
                    .unwrap_or(ModelStatus::NotInstalled),
            })
            .collect()
    }

    /// Hashes the installed file against the recorded checksum, if any.
    pub fn verify_model(&self, name: &str) -> Result<bool> {
        let model = self
            .catalog()
            .find(name)
            .ok_or_else(|| anyhow!("unknown model {name}"))?;
        let path = model.path(&self.models_dir);
        if !self.cache.exists_quick(&path) {
            bail!("model {name} is not installed");
        }
        let Some(expected) = model.checksum.as_deref() else {
            debug!("verify_skipped: {name} has no checksum");
            return Ok(true);
        };
        let transfer = ChunkedTransfer::new(self.settings.read().transfer);
        let actual = transfer
            .checksum(&path)
            .with_context(|| format!("hash model {name}"))?;
        Ok(actual.eq_ignore_ascii_case(expected))
    }

    /// Drops expired cache entries and abandoned `.temp` files.
    pub fn housekeeping(&self) -> (usize, usize) {
        let expired = self.cache.cleanup_expired();
        let swept = self.downloads.sweep_temp_files();
        if swept > 0 {
            self.cache.invalidate_pattern(&self.models_dir.to_string_lossy());
        }
        (expired, swept)
    }

    pub fn shutdown(self) {
        self.downloads.dispose();
        self.cache.clear();
    }
}

fn manager_config(settings: &Settings, models_dir: PathBuf) -> ManagerConfig {
    ManagerConfig {
        models_dir,
        transfer: settings.transfer.clone(),
        throttle: settings.throttle.clone(),
    }
}
