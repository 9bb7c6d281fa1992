/// Filesystem object store
/// Keys map to paths under a root directory; versions are content hashes
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ObjectStore, Precondition, StoreCapabilities, Version, VersionedContent, WriteOutcome};
use crate::error::{CollectorError, Result};

/// Partial files start with this so listings never see them
const PARTIAL_MARKER: &str = ".partial-";

pub struct LocalStore {
    root: PathBuf,
    /// Serializes every mutation; the process is the only writer
    write_lock: Mutex<()>,
}

impl LocalStore {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(LocalStore {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            return Err(CollectorError::InvalidRecord(format!("invalid object key: {:?}", key)));
        }
        Ok(self.root.join(key))
    }

    fn version_of(bytes: &[u8]) -> Version {
        let digest = Sha256::digest(bytes);
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Version::new(hex)
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn precondition_holds(current: Option<&[u8]>, precondition: &Precondition) -> bool {
        match precondition {
            Precondition::None => true,
            Precondition::MustNotExist => current.is_none(),
            Precondition::Matches(expected) => current.map(Self::version_of).as_ref() == Some(expected),
        }
    }

    /// Write through a sibling partial file and rename into place
    async fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CollectorError::InternalError(format!("no file name in {}", path.display())))?;
        let partial = path.with_file_name(format!("{}{}.{}", PARTIAL_MARKER, file_name, uuid::Uuid::new_v4().simple()));

        let mut file = fs::File::create(&partial).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&partial, path).await?;
        Ok(())
    }

    async fn conditional_write(&self, key: &str, bytes: Vec<u8>, precondition: &Precondition) -> Result<WriteOutcome> {
        let path = self.path_for(key)?;
        let current = Self::read_optional(&path).await?;
        if !Self::precondition_holds(current.as_deref(), precondition) {
            return Ok(WriteOutcome::VersionConflict);
        }
        Self::replace_file(&path, &bytes).await?;
        Ok(WriteOutcome::Written(Self::version_of(&bytes)))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            server_compose: true,
            native_append: true,
            max_compose_sources: usize::MAX,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.path_for(key)?).await?)
    }

    async fn read_versioned(&self, key: &str) -> Result<VersionedContent> {
        let path = self.path_for(key)?;
        Ok(match Self::read_optional(&path).await? {
            Some(bytes) => {
                let version = Self::version_of(&bytes);
                VersionedContent {
                    bytes,
                    version: Some(version),
                }
            }
            None => VersionedContent::default(),
        })
    }

    async fn write_whole(&self, key: &str, bytes: Vec<u8>, precondition: Precondition) -> Result<WriteOutcome> {
        let _guard = self.write_lock.lock().await;
        self.conditional_write(key, bytes, &precondition).await
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with(PARTIAL_MARKER) {
                    continue;
                }
                let key = if rel.is_empty() { name } else { format!("{}/{}", rel, name) };
                if entry.file_type().await?.is_dir() {
                    // Only descend where the prefix can still match
                    let as_dir = format!("{}/", key);
                    if as_dir.starts_with(prefix) || prefix.starts_with(&as_dir) {
                        pending.push((entry.path(), key));
                    }
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn compose_into(&self, dest: &str, sources: &[String], precondition: Precondition) -> Result<WriteOutcome> {
        let _guard = self.write_lock.lock().await;
        let mut combined = Vec::new();
        for source in sources {
            let bytes = Self::read_optional(&self.path_for(source)?).await?.ok_or_else(|| {
                CollectorError::StoreRequest {
                    status: 404,
                    message: format!("compose source not found: {}", source),
                }
            })?;
            combined.extend_from_slice(&bytes);
        }
        self.conditional_write(dest, combined, &precondition).await
    }

    async fn copy(&self, source: &str, dest: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let bytes = Self::read_optional(&self.path_for(source)?).await?.ok_or_else(|| {
            CollectorError::StoreRequest {
                status: 404,
                message: format!("copy source not found: {}", source),
            }
        })?;
        Self::replace_file(&self.path_for(dest)?, &bytes).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Delete of absent key ignored: {}", key);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn modified_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        match fs::metadata(self.path_for(key)?).await {
            Ok(meta) => Ok(Some(DateTime::<Utc>::from(meta.modified()?))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_line(&self, key: &str, line: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
        // One write call per line keeps lines whole
        file.write_all(format!("{}\n", line).as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }
}
