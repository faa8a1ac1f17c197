//! Storage collaborator for the receiving side
//!
//! The receiver engine never touches the disk itself; it drives a
//! [`TransferStore`]. Task state is not tracked in memory anywhere - it is
//! derived from what the store holds, so a receiver restart picks up exactly
//! where the cache left off.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::message::{SessionKey, TransferRequest};
use crate::protocol::ResultCode;

/// Receiver-side view of one transfer key, derived from storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// No cache exists; the key was never admitted (or was cancelled).
    Nonexistent,
    /// Cache exists but the staged bytes fall short of the total length.
    Transmitting,
    /// Staged bytes cover the total length.
    Completed,
}

/// Staging backend consumed by the receiver engine.
///
/// Implementations must uphold: at most one admitted task per key (the
/// engine serializes `create_cache` calls per connection, but a store shared
/// across connections must guard itself), and no appends once a key has
/// verified complete.
pub trait TransferStore: Send + Sync {
    /// Create staging storage for `key`. `Ok(false)` or an error both reject
    /// the demand; the error's text travels back as diagnostic message.
    fn create_cache(&self, key: &SessionKey) -> Result<bool>;

    /// Derive the task state for `key` from storage.
    fn task_state(&self, key: &SessionKey) -> TaskState;

    /// Append one validated segment. On the final segment, verify the staged
    /// bytes against the key and return `Completed` or `Md5Mismatching`;
    /// otherwise return `Continue`.
    fn append_segment(&self, request: &TransferRequest) -> Result<ResultCode>;

    /// Delete staging storage for `key`. Returns whether anything was
    /// removed.
    fn cancel_cache(&self, key: &SessionKey) -> bool;
}

/// Filesystem-backed store: one directory per key under `root`, named by
/// `SessionKey::id()`, holding a single staged file of the same name.
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn cache_dir(&self, key: &SessionKey) -> PathBuf {
        self.root.join(key.id())
    }

    /// Path of the staged (and, once verified, completed) file for `key`.
    pub fn cached_file(&self, key: &SessionKey) -> PathBuf {
        self.cache_dir(key).join(key.id())
    }
}

impl TransferStore for DirectoryStore {
    fn create_cache(&self, key: &SessionKey) -> Result<bool> {
        fs::create_dir_all(self.cache_dir(key))
            .with_context(|| format!("failed to create cache for {}", key))?;
        Ok(true)
    }

    fn task_state(&self, key: &SessionKey) -> TaskState {
        if !self.cache_dir(key).is_dir() {
            return TaskState::Nonexistent;
        }
        match fs::metadata(self.cached_file(key)) {
            Ok(meta) if meta.len() >= key.total_length as u64 => TaskState::Completed,
            _ => TaskState::Transmitting,
        }
    }

    fn append_segment(&self, request: &TransferRequest) -> Result<ResultCode> {
        let key = &request.key;
        let path = self.cached_file(key);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open cache file for {}", key))?;
        file.write_all(&request.data)
            .with_context(|| format!("failed to append segment for {}", key))?;
        drop(file);

        if !request.is_last_segment() {
            return Ok(ResultCode::Continue);
        }

        // Last segment: re-verify the staged bytes end to end.
        let meta = fs::metadata(&path)
            .with_context(|| format!("failed to stat cache file for {}", key))?;
        if meta.len() != key.total_length as u64 {
            return Ok(ResultCode::Md5Mismatching);
        }
        if file_md5(&path)? != key.md5 {
            return Ok(ResultCode::Md5Mismatching);
        }
        Ok(ResultCode::Completed)
    }

    fn cancel_cache(&self, key: &SessionKey) -> bool {
        fs::remove_dir_all(self.cache_dir(key)).is_ok()
    }
}

fn file_md5(path: &Path) -> Result<[u8; 16]> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("failed to open {} for hashing", path.display()))?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(ctx.compute().0)
}
