//! Shared persistence primitive for the stateful services.
//!
//! Each store is a single JSON document on disk. Writes go through a
//! temp-file-then-rename so concurrent readers always observe either the
//! old or the new complete file. Reads of missing, malformed, or
//! version-mismatched files yield the document's default value and never
//! error; a corrupt store degrades to empty rather than wedging the
//! process.
//!
//! Serialization: a process-wide registry hands out one async mutex per
//! absolute store path. Every read-modify-write runs inside
//! [`JsonStore::update`] while holding that mutex, so all operations on
//! a given store file are totally ordered, within and across service
//! instances in the same process.
//!
//! Audit entries append as JSONL to a sibling `<path>.audit` file.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::error::Result;

/// A document persisted through [`JsonStore`].
///
/// `VERSION` is the schema version the current code writes; any other
/// version found on disk is treated as unreadable and reset to default.
pub trait StoreDocument: Default + Serialize + DeserializeOwned + Send + 'static {
    const VERSION: u32;

    /// The version recorded inside the document.
    fn version(&self) -> u32;
}

static STORE_LOCKS: OnceLock<parking_lot::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>> =
    OnceLock::new();

/// One mutex per absolute path, shared by every store instance in the
/// process that points at the same file.
fn lock_for(path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    let key = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let registry = STORE_LOCKS.get_or_init(|| parking_lot::Mutex::new(HashMap::new()));
    let mut map = registry.lock();
    map.entry(key)
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

/// Typed JSON store over a single file.
pub struct JsonStore<D: StoreDocument> {
    path: PathBuf,
    audit_path: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
    _doc: PhantomData<D>,
}

impl<D: StoreDocument> JsonStore<D> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let audit_path = {
            let mut os = path.clone().into_os_string();
            os.push(".audit");
            PathBuf::from(os)
        };
        let lock = lock_for(&path);
        Self {
            path,
            audit_path,
            lock,
            _doc: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current document. Missing or unreadable files come back
    /// as `D::default()`.
    pub async fn read(&self) -> D {
        let _guard = self.lock.lock().await;
        Self::load(&self.path).await
    }

    /// Read-modify-write under the store lock. If the closure errors the
    /// document is not persisted.
    pub async fn update<R, F>(&self, mutate: F) -> Result<R>
    where
        F: FnOnce(&mut D) -> Result<R>,
    {
        let _guard = self.lock.lock().await;
        let mut doc = Self::load(&self.path).await;
        let out = mutate(&mut doc)?;
        Self::persist(&self.path, &doc).await?;
        Ok(out)
    }

    async fn load(path: &Path) -> D {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(_) => return D::default(),
        };

        match serde_json::from_str::<D>(&contents) {
            Ok(doc) if doc.version() == D::VERSION => doc,
            Ok(doc) => {
                tracing::warn!(
                    path = %path.display(),
                    found = doc.version(),
                    expected = D::VERSION,
                    "store schema version mismatch, resetting to empty"
                );
                D::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "malformed store file, resetting to empty");
                D::default()
            }
        }
    }

    async fn persist(path: &Path, doc: &D) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(doc)?;
        let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, json.as_bytes()).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Append one audit entry as a JSONL line to `<path>.audit`.
    pub async fn append_audit<E: Serialize>(&self, entry: &E) -> Result<()> {
        if let Some(parent) = self.audit_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Tail up to `limit` audit entries, newest last. Unparseable lines
    /// are skipped.
    pub async fn read_audit(&self, limit: usize) -> Vec<serde_json::Value> {
        let contents = match tokio::fs::read_to_string(&self.audit_path).await {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        let entries: Vec<serde_json::Value> = contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        let skip = entries.len().saturating_sub(limit);
        entries.into_iter().skip(skip).collect()
    }
}
