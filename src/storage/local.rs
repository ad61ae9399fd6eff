use std::path::{Component, Path, PathBuf};

use anyhow::{Result, anyhow};
use tokio::fs;
use walkdir::WalkDir;

/// Key/value storage over a directory tree. Keys are `/`-separated relative paths.
#[derive(Clone, Debug)]
pub struct LocalFileStorage {
    base_dir: PathBuf,
    base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
}

impl LocalFileStorage {
    pub fn new(base_dir: PathBuf, base_url: String) -> Self {
        Self { base_dir, base_url }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, data).await?;
        Ok(())
    }

    /// Writes through a sibling temp file and renames it into place, so readers
    /// never observe a half-written document.
    pub async fn put_atomic(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(".{}.tmp", std::process::id()));
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, data).await?;
        if let Err(err) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve_path(key)?;
        match fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns `false` when there was nothing to delete.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.resolve_path(key)?;
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let path = if prefix.is_empty() {
            self.base_dir.clone()
        } else {
            self.resolve_path(prefix)?
        };
        match fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Lists every file below `prefix` (a directory key, may be empty).
    pub async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let root = if prefix.is_empty() {
            self.base_dir.clone()
        } else {
            self.resolve_path(prefix)?
        };
        let base_dir = self.base_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<StoredObject>> {
            let mut objects = Vec::new();
            if !root.exists() {
                return Ok(objects);
            }
            for entry in WalkDir::new(&root) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if name.ends_with(".tmp") {
                    continue;
                }
                let relative = entry.path().strip_prefix(&base_dir)?;
                let key = relative
                    .components()
                    .map(|part| part.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                objects.push(StoredObject {
                    key,
                    size: entry.metadata()?.len(),
                });
            }
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
        .await?
    }

    pub fn get_public_url(&self, key: &str) -> String {
        let trimmed = self.base_url.trim_end_matches('/');
        let key = key.trim_start_matches('/');
        format!("{trimmed}/{key}")
    }

    /// Maps a key onto the base directory, refusing anything that would escape it.
    pub fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        let normalized = Path::new(key.trim_start_matches('/'));
        for component in normalized.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(anyhow!("invalid storage key: {key}")),
            }
        }
        Ok(self.base_dir.join(normalized))
    }
}
