//! # Storage Module - Snapshot Persistence
//!
//! Loads the group registry and board store at startup and writes them back at
//! shutdown (and on the optional autosave tick). Each lives in its own JSON file under
//! the configured data directory:
//!
//! ```text
//! data/
//! ├── groups.json   ← group name → member list
//! └── boards.json   ← group name → messages
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use groupbbs::config::StorageConfig;
//! use groupbbs::storage::Storage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = Storage::new(&StorageConfig::default()).await?;
//!     let snapshot = storage.load_state().await;
//!     storage.save_state(&snapshot).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Failure handling
//!
//! A missing file is a fresh start. An unreadable or corrupt file is logged and replaced
//! by an empty structure so the server still comes up; the next save overwrites it.
//! Writes go through an exclusively locked temp file that is renamed over the target,
//! so a crash mid-save never leaves a truncated snapshot.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use crate::bbs::state::{BoardStore, GroupRegistry, StateSnapshot};
use crate::config::StorageConfig;

/// Snapshot file locations.
#[derive(Debug, Clone)]
pub struct Storage {
    data_dir: PathBuf,
    groups_path: PathBuf,
    boards_path: PathBuf,
}

impl Storage {
    /// Create the data directory if needed.
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|e| anyhow!("Failed to create data directory {}: {}", config.data_dir, e))?;
        Ok(Storage {
            data_dir: PathBuf::from(&config.data_dir),
            groups_path: config.groups_path(),
            boards_path: config.boards_path(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn groups_path(&self) -> &Path {
        &self.groups_path
    }

    pub fn boards_path(&self) -> &Path {
        &self.boards_path
    }

    /// Whether either snapshot file is present.
    pub async fn snapshot_exists(&self) -> bool {
        fs::try_exists(&self.groups_path).await.unwrap_or(false)
            || fs::try_exists(&self.boards_path).await.unwrap_or(false)
    }

    pub async fn load_groups(&self) -> Result<Option<GroupRegistry>> {
        read_json(&self.groups_path).await
    }

    pub async fn load_boards(&self) -> Result<Option<BoardStore>> {
        read_json(&self.boards_path).await
    }

    pub async fn save_groups(&self, groups: &GroupRegistry) -> Result<()> {
        write_json(&self.groups_path, groups).await
    }

    pub async fn save_boards(&self, boards: &BoardStore) -> Result<()> {
        write_json(&self.boards_path, boards).await
    }

    /// Load both snapshots, substituting empty structures for missing or corrupt files.
    pub async fn load_state(&self) -> StateSnapshot {
        let groups = match self.load_groups().await {
            Ok(Some(groups)) => groups,
            Ok(None) => {
                warn!("No group snapshot at {}; starting fresh", self.groups_path.display());
                GroupRegistry::new()
            }
            Err(e) => {
                warn!("Ignoring unreadable group snapshot: {:#}", e);
                GroupRegistry::new()
            }
        };
        let boards = match self.load_boards().await {
            Ok(Some(boards)) => boards,
            Ok(None) => {
                warn!("No board snapshot at {}; starting fresh", self.boards_path.display());
                BoardStore::new()
            }
            Err(e) => {
                warn!("Ignoring unreadable board snapshot: {:#}", e);
                BoardStore::new()
            }
        };
        debug!(
            "Loaded {} groups and {} boards from {}",
            groups.len(),
            boards.len(),
            self.data_dir.display()
        );
        StateSnapshot { groups, boards }
    }

    /// Write both snapshots. Both writes are attempted; the first failure is returned.
    pub async fn save_state(&self, snapshot: &StateSnapshot) -> Result<()> {
        let groups = self.save_groups(&snapshot.groups).await;
        let boards = self.save_boards(&snapshot.boards).await;
        groups.and(boards)?;
        debug!(
            "Saved {} groups and {} boards to {}",
            snapshot.groups.len(),
            snapshot.boards.len(),
            self.data_dir.display()
        );
        Ok(())
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(anyhow!("Failed to read {}: {}", path.display(), e)),
    };
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_file_locked(&path, &content))
        .await
        .map_err(|e| anyhow!("Snapshot writer task failed: {}", e))?
}

/// Replace `path` with `content`: write and fsync a sibling temp file, rename it over
/// the target, then fsync the directory so the rename itself is durable. The target is
/// held under an exclusive lock for the whole sequence. Any failure, including either
/// fsync, is returned and the temp file is removed.
fn write_file_locked(path: &Path, content: &str) -> Result<()> {
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    FileExt::lock_exclusive(&lock_file).with_context(|| format!("Failed to lock {}", path.display()))?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let tmp_path = write_temp_file(dir, path, content)?;
    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(anyhow!("Failed to replace {}: {}", path.display(), e));
    }
    sync_dir(dir)?;
    FileExt::unlock(&lock_file).with_context(|| format!("Failed to unlock {}", path.display()))
}

/// Create a fresh `.<name>.tmp-<pid>-<n>` next to `target` holding `content`, fsynced.
fn write_temp_file(dir: &Path, target: &Path, content: &str) -> Result<PathBuf> {
    use std::io::{ErrorKind, Write};

    let base = target
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("snapshot.json");
    for attempt in 0u32.. {
        let tmp_path = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), attempt));
        let mut tmp = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create {}", tmp_path.display()))
            }
        };
        let written = tmp
            .write_all(content.as_bytes())
            .and_then(|()| tmp.sync_all());
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e).with_context(|| format!("Failed to write {}", tmp_path.display()));
        }
        return Ok(tmp_path);
    }
    Err(anyhow!("No free temp file name in {}", dir.display()))
}

fn sync_dir(dir: &Path) -> Result<()> {
    std::fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .with_context(|| format!("Failed to sync directory {}", dir.display()))
}
