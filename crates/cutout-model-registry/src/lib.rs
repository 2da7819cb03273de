use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const LOCKFILE_NAME: &str = "cutout-model-lock.json";
pub const SCHEMA_VERSION: u32 = 1;
pub const RELEASE_TAG: &str = "v0.0.0";
const RELEASE_BASE_URL: &str = "https://github.com/danielgatis/rembg/releases/download";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownModel {
    U2net,
    U2netp,
    IsnetGeneralUse,
}

impl KnownModel {
    pub fn model_id(self) -> &'static str {
        match self {
            Self::U2net => "u2net",
            Self::U2netp => "u2netp",
            Self::IsnetGeneralUse => "isnet-general-use",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Self::U2net => "u2net.onnx",
            Self::U2netp => "u2netp.onnx",
            Self::IsnetGeneralUse => "isnet-general-use.onnx",
        }
    }

    pub fn all() -> [KnownModel; 3] {
        [KnownModel::U2net, KnownModel::U2netp, KnownModel::IsnetGeneralUse]
    }

    pub fn from_model_id(model_id: &str) -> Option<Self> {
        Self::all().into_iter().find(|m| m.model_id() == model_id)
    }
}

impl Display for KnownModel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.model_id())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockFileEntry {
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockModel {
    pub model_id: String,
    pub revision: String,
    pub source: String,
    pub files: Vec<LockFileEntry>,
}

impl LockModel {
    pub fn file(&self, path: &str) -> Option<&LockFileEntry> {
        self.files.iter().find(|f| f.path == path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelLock {
    pub schema_version: u32,
    pub generated_at: String,
    pub models: Vec<LockModel>,
}

impl ModelLock {
    pub fn find(&self, model: KnownModel) -> Option<&LockModel> {
        self.models.iter().find(|m| m.model_id == model.model_id())
    }
}

#[derive(Debug, Clone)]
pub struct ModelManifest {
    pub model_id: String,
    pub revision: String,
    pub url: String,
}

pub fn manifest_for(model: KnownModel) -> ModelManifest {
    ModelManifest {
        model_id: model.model_id().to_string(),
        revision: RELEASE_TAG.to_string(),
        url: format!("{}/{}/{}", RELEASE_BASE_URL, RELEASE_TAG, model.file_name()),
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("could not determine a default model directory")]
    NoDefaultModelDir,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub root: PathBuf,
    pub manifests_dir: PathBuf,
    pub models_dir: PathBuf,
    pub cache_downloads_dir: PathBuf,
}

pub fn default_model_dir() -> Result<PathBuf, RegistryError> {
    let home = dirs::home_dir().ok_or(RegistryError::NoDefaultModelDir)?;
    Ok(home.join(".cutout").join("models"))
}

pub fn resolve_model_paths(model_dir: Option<&Path>) -> Result<ModelPaths, RegistryError> {
    let root = if let Some(dir) = model_dir {
        dir.to_path_buf()
    } else {
        default_model_dir()?
    };

    Ok(ModelPaths {
        manifests_dir: root.join("manifests"),
        models_dir: root.join("models"),
        cache_downloads_dir: root.join("cache").join("downloads"),
        root,
    })
}

pub fn ensure_layout(paths: &ModelPaths) -> Result<(), RegistryError> {
    fs::create_dir_all(&paths.manifests_dir)?;
    fs::create_dir_all(&paths.models_dir)?;
    fs::create_dir_all(&paths.cache_downloads_dir)?;
    Ok(())
}

pub fn model_revision_dir(paths: &ModelPaths, model: KnownModel, revision: &str) -> PathBuf {
    paths.models_dir.join(model.model_id()).join(revision)
}

pub fn model_file_path(paths: &ModelPaths, model: KnownModel) -> PathBuf {
    model_revision_dir(paths, model, RELEASE_TAG).join(model.file_name())
}

pub fn lockfile_path(paths: &ModelPaths) -> PathBuf {
    paths.manifests_dir.join(LOCKFILE_NAME)
}

pub fn write_lockfile(paths: &ModelPaths, lock: &ModelLock) -> Result<(), RegistryError> {
    ensure_layout(paths)?;
    let data = serde_json::to_vec_pretty(lock)?;
    fs::write(lockfile_path(paths), data)?;
    Ok(())
}

pub fn read_lockfile(paths: &ModelPaths) -> Result<ModelLock, RegistryError> {
    let data = fs::read(lockfile_path(paths))?;
    Ok(serde_json::from_slice(&data)?)
}

pub fn merge_lock_models(existing: Option<ModelLock>, updates: Vec<LockModel>, generated_at: String) -> ModelLock {
    let mut by_id = std::collections::BTreeMap::new();
    if let Some(lock) = existing {
        for model in lock.models {
            by_id.insert(model.model_id.clone(), model);
        }
    }
    for model in updates {
        by_id.insert(model.model_id.clone(), model);
    }
    ModelLock {
        schema_version: SCHEMA_VERSION,
        generated_at,
        models: by_id.into_values().collect(),
    }
}
