//! Content-addressable artifact store
//!
//! Artifacts are immutable byte blobs addressed by the SHA-256 digest of
//! their content. The on-disk layout is append-only:
//!
//! ```text
//! <root>/objects/<hh>/<hash>   # committed artifacts (hh = first digest byte)
//! <root>/tmp/                  # in-flight ingests, renamed into place
//! ```
//!
//! Ingests write to a temp file and rename into `objects/`, so concurrent
//! writers of distinct handles never observe partial data, and two writers
//! of the same content converge on the same object file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::handle::ArtifactHandle;

const INGEST_BUF_SIZE: usize = 64 * 1024;

static INGEST_SEQ: AtomicU64 = AtomicU64::new(0);

/// Index entry for a committed artifact
#[derive(Debug, Clone)]
struct ObjectEntry {
    size: u64,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

/// Content-addressable store for run artifacts.
///
/// All operations are idempotent given the same handle: re-writing identical
/// bytes returns the same handle, and re-reading never mutates the artifact.
/// Artifacts are destroyed only by explicit [`remove`](ArtifactStore::remove)
/// or [`gc`](ArtifactStore::gc) at pipeline teardown.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    index: DashMap<String, ObjectEntry>,
}

impl ArtifactStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// Existing objects under `root/objects` are re-indexed, so a store
    /// directory survives process restarts.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("objects")).await?;
        fs::create_dir_all(root.join("tmp")).await?;

        let store = Self {
            root,
            index: DashMap::new(),
        };
        store.rebuild_index().await?;

        debug!(
            root = %store.root.display(),
            objects = store.index.len(),
            "artifact store opened"
        );
        Ok(store)
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of committed artifacts
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Ingest a local file and return its handle.
    pub async fn write(&self, local_path: impl AsRef<Path>) -> Result<ArtifactHandle> {
        let local_path = local_path.as_ref();
        let mut file = fs::File::open(local_path).await.map_err(|e| {
            let msg = format!("Cannot read source {}: {}", local_path.display(), e);
            StoreError::io(msg).with_source(e)
        })?;

        let (tmp_path, mut tmp) = self.open_tmp().await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; INGEST_BUF_SIZE];
        let mut size: u64 = 0;

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n]).await?;
            size += n as u64;
        }

        self.commit_tmp(tmp_path, tmp, hasher, size).await
    }

    /// Store a byte slice directly.
    pub async fn write_bytes(&self, bytes: &[u8]) -> Result<ArtifactHandle> {
        let (tmp_path, mut tmp) = self.open_tmp().await?;
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        tmp.write_all(bytes).await?;
        self.commit_tmp(tmp_path, tmp, hasher, bytes.len() as u64)
            .await
    }

    /// Materialize an artifact at `local_path`.
    pub async fn read(&self, handle: &ArtifactHandle, local_path: impl AsRef<Path>) -> Result<()> {
        let object = self.object_path_checked(handle)?;
        fs::copy(&object, local_path.as_ref()).await?;
        Ok(())
    }

    /// Read an artifact fully into memory.
    pub async fn read_bytes(&self, handle: &ArtifactHandle) -> Result<Vec<u8>> {
        let object = self.object_path_checked(handle)?;
        Ok(fs::read(&object).await?)
    }

    /// Stream multiple artifacts, in order, into one new artifact.
    ///
    /// Byte-exact: the result is the concatenation of the inputs in the
    /// given order. An empty input list yields the empty artifact.
    pub async fn concatenate(&self, handles: &[ArtifactHandle]) -> Result<ArtifactHandle> {
        // Resolve everything up front so a dangling handle fails before any I/O.
        let mut sources = Vec::with_capacity(handles.len());
        for handle in handles {
            sources.push(self.object_path_checked(handle)?);
        }

        let (tmp_path, mut tmp) = self.open_tmp().await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; INGEST_BUF_SIZE];
        let mut size: u64 = 0;

        for source in &sources {
            let mut file = fs::File::open(source).await?;
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                tmp.write_all(&buf[..n]).await?;
                size += n as u64;
            }
        }

        let handle = self.commit_tmp(tmp_path, tmp, hasher, size).await?;
        debug!(inputs = handles.len(), output = %handle, "concatenated artifacts");
        Ok(handle)
    }

    /// Ingest an external input file at run start.
    pub async fn import_file(&self, path: impl AsRef<Path>) -> Result<ArtifactHandle> {
        let path = path.as_ref();
        let handle = self.write(path).await?;
        info!(path = %path.display(), handle = %handle, "imported input file");
        Ok(handle)
    }

    /// Export an artifact to an external destination at run completion.
    pub async fn export_file(
        &self,
        handle: &ArtifactHandle,
        path: impl AsRef<Path>,
    ) -> Result<()> {
        let path = path.as_ref();
        self.read(handle, path).await?;
        info!(path = %path.display(), handle = %handle, "exported output file");
        Ok(())
    }

    /// Whether the handle refers to a committed artifact.
    pub fn contains(&self, handle: &ArtifactHandle) -> bool {
        self.index.contains_key(handle.hash())
    }

    /// Size in bytes of a committed artifact.
    pub fn size_of(&self, handle: &ArtifactHandle) -> Result<u64> {
        self.index
            .get(handle.hash())
            .map(|e| e.size)
            .ok_or_else(|| StoreError::not_found(handle))
    }

    /// Remove one artifact. Only teardown-time collection should call this.
    pub async fn remove(&self, handle: &ArtifactHandle) -> Result<()> {
        let object = self.object_path_checked(handle)?;
        fs::remove_file(&object).await?;
        self.index.remove(handle.hash());
        Ok(())
    }

    /// Remove every committed artifact. Returns the number removed.
    pub async fn gc(&self) -> Result<usize> {
        let hashes: Vec<String> = self.index.iter().map(|e| e.key().clone()).collect();
        let count = hashes.len();
        for hash in hashes {
            let path = self.object_path(&hash);
            if let Err(e) = fs::remove_file(&path).await {
                warn!(hash = %hash, error = %e, "failed to remove object during gc");
            }
            self.index.remove(&hash);
        }
        info!(removed = count, "store garbage collected");
        Ok(count)
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        self.root.join("objects").join(&hash[..2]).join(hash)
    }

    fn object_path_checked(&self, handle: &ArtifactHandle) -> Result<PathBuf> {
        if !self.index.contains_key(handle.hash()) {
            return Err(StoreError::not_found(handle));
        }
        Ok(self.object_path(handle.hash()))
    }

    async fn open_tmp(&self) -> Result<(PathBuf, fs::File)> {
        let seq = INGEST_SEQ.fetch_add(1, Ordering::Relaxed);
        let name = format!("ingest-{}-{}", std::process::id(), seq);
        let path = self.root.join("tmp").join(name);
        let file = fs::File::create(&path).await?;
        Ok((path, file))
    }

    async fn commit_tmp(
        &self,
        tmp_path: PathBuf,
        mut tmp: fs::File,
        hasher: Sha256,
        size: u64,
    ) -> Result<ArtifactHandle> {
        tmp.flush().await?;
        tmp.sync_all().await?;
        drop(tmp);

        let hash = to_hex(&hasher.finalize());
        let object = self.object_path(&hash);

        if let Some(parent) = object.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&tmp_path, &object).await?;

        self.index.insert(
            hash.clone(),
            ObjectEntry {
                size,
                created_at: Utc::now(),
            },
        );
        Ok(ArtifactHandle::new(hash, size))
    }

    async fn rebuild_index(&self) -> Result<()> {
        let objects = self.root.join("objects");
        let mut fanout = fs::read_dir(&objects).await?;
        while let Some(dir) = fanout.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if !meta.is_file() {
                    continue;
                }
                let hash = entry.file_name().to_string_lossy().into_owned();
                self.index.insert(
                    hash,
                    ObjectEntry {
                        size: meta.len(),
                        created_at: Utc::now(),
                    },
                );
            }
        }
        Ok(())
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        // Writing to a String cannot fail.
        let _ = write!(out, "{:02x}", b);
    }
    out
}
