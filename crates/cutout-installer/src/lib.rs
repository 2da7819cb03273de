use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use cutout_model_registry::{
    ensure_layout, lockfile_path, manifest_for, merge_lock_models, model_file_path, read_lockfile, resolve_model_paths,
    write_lockfile, KnownModel, LockFileEntry, LockModel, ModelLock, ModelManifest, ModelPaths, RegistryError,
};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Lockfile entry and file on disk agree.
    Cached,
    /// File was present but untracked; it is now recorded.
    Adopted,
    Downloaded,
}

#[derive(Debug, Clone)]
pub struct InstalledModel {
    pub model: KnownModel,
    pub path: PathBuf,
    pub outcome: InstallOutcome,
}

/// Makes sure the ONNX file for `model` is available locally and returns its
/// path, downloading it from the release assets on first use.
pub fn ensure_model(model: KnownModel, model_dir: Option<&Path>) -> Result<InstalledModel> {
    ensure_model_from(model, model_dir, &manifest_for(model), &http_client()?)
}

fn ensure_model_from(
    model: KnownModel,
    model_dir: Option<&Path>,
    manifest: &ModelManifest,
    client: &Client,
) -> Result<InstalledModel> {
    let paths = resolve_model_paths(model_dir)?;
    ensure_layout(&paths)?;

    let model_path = model_file_path(&paths, model);
    let existing = load_existing_lock(&paths)?;
    let locked = existing
        .as_ref()
        .and_then(|lock| lock.find(model))
        .and_then(|entry| entry.file(model.file_name()))
        .cloned();
    let on_disk = fs::metadata(&model_path).ok().filter(|m| m.is_file()).map(|m| m.len());

    let (outcome, entry) = match (locked, on_disk) {
        (Some(entry), Some(len)) if entry.size == len => {
            debug!(model = %model, path = %model_path.display(), "model already installed");
            return Ok(InstalledModel {
                model,
                path: model_path,
                outcome: InstallOutcome::Cached,
            });
        }
        (Some(entry), Some(len)) => {
            warn!(model = %model, expected = entry.size, actual = len, "model file size mismatch, downloading again");
            fs::remove_file(&model_path)?;
            (InstallOutcome::Downloaded, download_model(client, &paths, manifest, &model_path)?)
        }
        (None, Some(_)) => {
            info!(model = %model, path = %model_path.display(), "recording untracked model file");
            (InstallOutcome::Adopted, entry_for_existing(&model_path, model)?)
        }
        (_, None) => (InstallOutcome::Downloaded, download_model(client, &paths, manifest, &model_path)?),
    };

    record_lock(&paths, existing, manifest, entry)?;
    Ok(InstalledModel {
        model,
        path: model_path,
        outcome,
    })
}

/// A missing lockfile means nothing is recorded yet. Any other failure is
/// surfaced so a damaged lockfile is never silently overwritten.
fn load_existing_lock(paths: &ModelPaths) -> Result<Option<ModelLock>> {
    match read_lockfile(paths) {
        Ok(lock) => Ok(Some(lock)),
        Err(RegistryError::Io(e)) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading model lockfile {}", lockfile_path(paths).display())),
    }
}

fn record_lock(paths: &ModelPaths, existing: Option<ModelLock>, manifest: &ModelManifest, entry: LockFileEntry) -> Result<()> {
    let generated_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string());
    let update = LockModel {
        model_id: manifest.model_id.clone(),
        revision: manifest.revision.clone(),
        source: manifest.url.clone(),
        files: vec![entry],
    };
    let lock = merge_lock_models(existing, vec![update], generated_at);
    write_lockfile(paths, &lock)?;
    Ok(())
}

fn entry_for_existing(path: &Path, model: KnownModel) -> Result<LockFileEntry> {
    let size = fs::metadata(path)?.len();
    Ok(LockFileEntry {
        path: model.file_name().to_string(),
        size,
        sha256: sha256_file(path)?,
    })
}

fn http_client() -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static("cutout-installer/0.1"));
    Ok(Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(30))
        .timeout(Option::<Duration>::None)
        .build()?)
}

fn download_model(
    client: &Client,
    paths: &ModelPaths,
    manifest: &ModelManifest,
    destination: &Path,
) -> Result<LockFileEntry> {
    let file_name = destination
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("invalid model destination {}", destination.display()))?
        .to_string();
    let partial_path = paths.cache_downloads_dir.join(format!("{}.part", file_name));
    info!(model = %manifest.model_id, url = %manifest.url, "downloading model");

    let (size, sha256) = download_file(client, &manifest.url, &partial_path)?;

    let parent = destination
        .parent()
        .ok_or_else(|| anyhow!("invalid model destination {}", destination.display()))?;
    fs::create_dir_all(parent)?;
    fs::rename(&partial_path, destination)
        .with_context(|| format!("moving downloaded model into {}", destination.display()))?;
    info!(model = %manifest.model_id, size, "model installed");

    Ok(LockFileEntry {
        path: file_name,
        size,
        sha256,
    })
}

/// Streams `url` into `partial_path`, resuming from an existing partial file
/// when the server honours range requests.
fn download_file(client: &Client, url: &str, partial_path: &Path) -> Result<(u64, String)> {
    let resume_from = fs::metadata(partial_path).map(|m| m.len()).unwrap_or(0);
    let mut response = if resume_from > 0 {
        debug!(resume_from, "resuming partial download");
        client.get(url).header(RANGE, format!("bytes={}-", resume_from)).send()?
    } else {
        client.get(url).send()?
    };
    let resumed = resume_from > 0 && response.status().as_u16() == 206;
    if resume_from > 0 && !resumed {
        let _ = fs::remove_file(partial_path);
        response = client.get(url).send()?;
    }
    if !response.status().is_success() {
        return Err(anyhow!("failed downloading {}: {}", url, response.status()));
    }

    let mut hasher = Sha256::new();
    let mut file = if resumed {
        hash_into(&mut hasher, partial_path)?;
        fs::OpenOptions::new().append(true).open(partial_path)?
    } else {
        File::create(partial_path)?
    };
    let mut buf = [0u8; 16 * 1024];
    loop {
        let read = response.read(&mut buf)?;
        if read == 0 {
            break;
        }
        file.write_all(&buf[..read])?;
        hasher.update(&buf[..read]);
    }
    file.flush()?;
    drop(file);

    let total_size = fs::metadata(partial_path)?.len();
    Ok((total_size, hex::encode(hasher.finalize())))
}

fn hash_into(hasher: &mut Sha256, path: &Path) -> Result<()> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; 16 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    hash_into(&mut hasher, path)?;
    Ok(hex::encode(hasher.finalize()))
}
