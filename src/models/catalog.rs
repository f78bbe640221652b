use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use super::metadata::parse_size_label;

pub const TEMP_SUFFIX: &str = ".temp";

/// Metadata for a model the application knows how to fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KnownModel {
    /// Canonical on-disk file name, also the lookup key.
    pub name: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl KnownModel {
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            size_bytes: None,
            size_label: None,
            checksum: None,
        }
    }

    /// Exact byte count when recorded, otherwise parsed from the size label.
    #[must_use]
    pub fn expected_size(&self) -> Option<u64> {
        self.size_bytes
            .filter(|size| *size > 0)
            .or_else(|| self.size_label.as_deref().and_then(parse_size_label))
    }

    #[must_use]
    pub fn path(&self, models_dir: &Path) -> PathBuf {
        models_dir.join(&self.name)
    }

    #[must_use]
    pub fn temp_path(&self, models_dir: &Path) -> PathBuf {
        temp_path_for(&self.path(models_dir))
    }
}

#[must_use]
pub fn temp_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: Vec<KnownModel>,
}

impl ModelCatalog {
    pub fn with_defaults() -> Self {
        Self {
            models: default_models(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in models merged with the entries of a JSON manifest, if present.
    pub fn load(manifest: &Path) -> Result<Self> {
        let mut catalog = Self::with_defaults();
        if manifest.exists() {
            let file = File::open(manifest)
                .with_context(|| format!("open model manifest {}", manifest.display()))?;
            let models: Vec<KnownModel> =
                serde_json::from_reader(file).context("parse model manifest")?;
            for model in models {
                catalog.register(model);
            }
        }
        Ok(catalog)
    }

    pub fn save(&self, manifest: &Path) -> Result<()> {
        if let Some(parent) = manifest.parent() {
            fs::create_dir_all(parent).context("create manifest directory")?;
        }
        let file = File::create(manifest).context("create model manifest")?;
        serde_json::to_writer_pretty(file, &self.models).context("write model manifest")?;
        Ok(())
    }

    pub fn register(&mut self, model: KnownModel) {
        if let Some(existing) = self
            .models
            .iter_mut()
            .find(|current| current.name == model.name)
        {
            *existing = model;
        } else {
            self.models.push(model);
        }
    }

    pub fn find(&self, name: &str) -> Option<&KnownModel> {
        self.models.iter().find(|model| model.name == name)
    }

    pub fn find_by_uri(&self, uri: &str) -> Option<&KnownModel> {
        self.models.iter().find(|model| model.uri == uri)
    }

    pub fn models(&self) -> &[KnownModel] {
        &self.models
    }
}

pub fn resolve_model_dir(subdir: &str) -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("com", "ModelDepot", "ModelDepot")
        .context("missing project directories")?;
    let dir = project_dirs.data_dir().join(subdir);
    fs::create_dir_all(&dir).context("create models dir")?;
    Ok(dir)
}

/// Last path segment of a URL with query and fragment removed.
pub fn file_name_from_uri(uri: &str) -> Option<String> {
    let url = reqwest::Url::parse(uri).ok()?;
    let last_segment = url.path_segments()?.last()?.trim();
    if last_segment.is_empty() {
        None
    } else {
        Some(last_segment.to_string())
    }
}

fn default_models() -> Vec<KnownModel> {
    vec![
        KnownModel {
            name: "tinyllama-1.1b-chat-q4_k_m.gguf".into(),
            uri: "https://huggingface.co/TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF/resolve/main/tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf?download=1"
                .into(),
            size_bytes: None,
            size_label: Some("669 MB".into()),
            checksum: None,
        },
        KnownModel {
            name: "qwen2.5-0.5b-instruct-q4_k_m.gguf".into(),
            uri: "https://huggingface.co/Qwen/Qwen2.5-0.5B-Instruct-GGUF/resolve/main/qwen2.5-0.5b-instruct-q4_k_m.gguf"
                .into(),
            size_bytes: None,
            size_label: Some("491 MB".into()),
            checksum: None,
        },
        KnownModel {
            name: "phi-3-mini-4k-instruct-q4.gguf".into(),
            uri: "https://huggingface.co/microsoft/Phi-3-mini-4k-instruct-gguf/resolve/main/Phi-3-mini-4k-instruct-q4.gguf"
                .into(),
            size_bytes: None,
            size_label: Some("2.39 GB".into()),
            checksum: None,
        },
    ]
}
