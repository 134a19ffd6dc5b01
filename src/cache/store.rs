//! Cache file on disk and the lock file guarding it
//!
//! The cache file is gzip-compressed JSON. A process that creates
//! `<file>.lock` owns the file and may rewrite it; every other process opens
//! the store read-only and never saves. The lock is advisory: nothing stops a
//! process that ignores it.

use crate::entity::ContainerSnapshot;
use crate::error::{NitrateError, NitrateResult};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Current cache file layout
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything in one cache file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    /// Keyed by class name
    #[serde(default)]
    pub classes: BTreeMap<String, ClassSection>,
}

impl Snapshot {
    pub fn entry_count(&self) -> usize {
        self.classes.values().map(|s| s.entries.len()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassSection {
    #[serde(default)]
    pub entries: BTreeMap<i64, EntryDump>,
}

/// One persisted entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDump {
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<ContainerSnapshot>,
}

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub token: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreMode {
    /// This process holds the lock
    ReadWrite,
    /// Another process holds the lock
    ReadOnly,
}

#[derive(Debug)]
pub struct PersistentStore {
    path: PathBuf,
    lock_path: PathBuf,
    token: Option<Uuid>,
}

impl PersistentStore {
    /// Open the store at `path`, taking the lock if nobody holds it
    pub fn open(path: impl Into<PathBuf>) -> NitrateResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                NitrateError::io(format!("creating cache directory {}", parent.display()), e)
            })?;
        }

        let lock_path = Self::lock_path_for(&path);
        let token = Self::acquire(&lock_path)?;
        Ok(Self {
            path,
            lock_path,
            token,
        })
    }

    fn acquire(lock_path: &Path) -> NitrateResult<Option<Uuid>> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                match Self::lock_owner(lock_path) {
                    Ok(Some(owner)) => info!(
                        "Cache is locked by pid {} since {}; opening read-only",
                        owner.pid, owner.created_at
                    ),
                    _ => info!("Cache is locked by another process; opening read-only"),
                }
                return Ok(None);
            }
            Err(e) => {
                return Err(NitrateError::io(
                    format!("creating lock file {}", lock_path.display()),
                    e,
                ))
            }
        };

        let info = LockInfo {
            pid: std::process::id(),
            token: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        let contents = serde_json::to_vec(&info)?;
        file.write_all(&contents)
            .map_err(|e| NitrateError::io(format!("writing lock file {}", lock_path.display()), e))?;
        debug!("Acquired cache lock {}", lock_path.display());
        Ok(Some(info.token))
    }

    /// `<file>.lock` next to the cache file
    pub fn lock_path_for(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        path.with_file_name(name)
    }

    /// Who holds the lock at `lock_path`, if anyone
    pub fn lock_owner(lock_path: &Path) -> NitrateResult<Option<LockInfo>> {
        match fs::read(lock_path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(NitrateError::io(
                format!("reading lock file {}", lock_path.display()),
                e,
            )),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn mode(&self) -> StoreMode {
        if self.token.is_some() {
            StoreMode::ReadWrite
        } else {
            StoreMode::ReadOnly
        }
    }

    pub fn is_owner(&self) -> bool {
        self.token.is_some()
    }

    /// Read the cache file; `None` when there is none yet
    pub fn load(&self) -> NitrateResult<Option<Snapshot>> {
        Self::peek(&self.path)
    }

    /// Read a cache file without touching its lock
    pub fn peek(path: &Path) -> NitrateResult<Option<Snapshot>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No cache file at {}", path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(NitrateError::io(
                    format!("reading cache file {}", path.display()),
                    e,
                ))
            }
        };

        let snapshot = decode(&bytes).map_err(|reason| NitrateError::StoreCorrupt {
            path: path.to_path_buf(),
            reason,
        })?;
        debug!(
            "Read {} entries from {}",
            snapshot.entry_count(),
            path.display()
        );
        Ok(Some(snapshot))
    }

    /// Write the cache file; returns false without writing when read-only
    pub fn save(&self, snapshot: &Snapshot) -> NitrateResult<bool> {
        if !self.is_owner() {
            debug!("Cache is read-only, not saving {}", self.path.display());
            return Ok(false);
        }
        Self::write_snapshot(&self.path, snapshot)?;
        info!(
            "Saved {} cache entries to {}",
            snapshot.entry_count(),
            self.path.display()
        );
        Ok(true)
    }

    /// Write via a temporary file renamed into place
    pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> NitrateResult<()> {
        let bytes = encode(snapshot)?;
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);

        fs::write(&tmp, &bytes)
            .map_err(|e| NitrateError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, path)
            .map_err(|e| NitrateError::io(format!("replacing {}", path.display()), e))?;
        Ok(())
    }

    /// Delete the cache file; only the lock owner may
    pub fn discard(&self) -> NitrateResult<()> {
        if !self.is_owner() {
            return Err(NitrateError::LockContention(self.path.clone()));
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Removed cache file {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NitrateError::io(
                format!("removing cache file {}", self.path.display()),
                e,
            )),
        }
    }

    /// Give up the lock if this process still holds it
    pub fn release(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };

        match Self::lock_owner(&self.lock_path) {
            Ok(Some(owner)) if owner.token == token => {
                if let Err(e) = fs::remove_file(&self.lock_path) {
                    warn!("Failed to remove lock {}: {}", self.lock_path.display(), e);
                } else {
                    debug!("Released cache lock {}", self.lock_path.display());
                }
            }
            Ok(_) => warn!(
                "Lock {} no longer belongs to this process; leaving it",
                self.lock_path.display()
            ),
            Err(e) => warn!("Failed to read lock {}: {}", self.lock_path.display(), e),
        }
    }
}

impl Drop for PersistentStore {
    fn drop(&mut self) {
        self.release();
    }
}

fn encode(snapshot: &Snapshot) -> NitrateResult<Vec<u8>> {
    let json = serde_json::to_vec(snapshot)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| NitrateError::io("compressing cache snapshot", e))?;
    encoder
        .finish()
        .map_err(|e| NitrateError::io("compressing cache snapshot", e))
}

fn decode(bytes: &[u8]) -> Result<Snapshot, String> {
    let mut decoder = GzDecoder::new(bytes);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| format!("not a gzip stream: {}", e))?;
    let snapshot: Snapshot = serde_json::from_slice(&json).map_err(|e| e.to_string())?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(format!(
            "unsupported version {} (expected {})",
            snapshot.version, SNAPSHOT_VERSION
        ));
    }
    Ok(snapshot)
}
