//! Content-addressed module cache.
//!
//! One directory per cache key (scheme + location + resolved version),
//! published atomically: content is staged under `tmp/` and renamed into
//! place only once fully fetched and verified, so the cache never holds a
//! half-populated entry. A sidecar `<key>.entry.json` records the entry
//! metadata; a directory without its sidecar is treated as absent and
//! reclaimed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::reference::Scheme;

/// Filesystem-safe cache key derived from a resolved coordinate.
///
/// Pinned versions only: callers hash the resolved digest or commit, never
/// a floating tag or branch, so a hit is always trusted as correct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from a scheme, location, and resolved (pinned) version.
    pub fn new(scheme: Scheme, location: &str, resolved_version: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(scheme.as_str().as_bytes());
        hasher.update(&[0x00]);
        hasher.update(location.as_bytes());
        hasher.update(&[0x00]);
        hasher.update(resolved_version.as_bytes());
        // 16 bytes is plenty for key collision resistance at cache scale.
        Self(hasher.finalize().to_hex()[..32].to_string())
    }

    /// Hex form used as the directory name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Metadata recorded next to each cached entry. Never mutated after the
/// entry is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Scheme of the cached reference.
    pub scheme: Scheme,
    /// Location of the cached reference.
    pub location: String,
    /// The pinned version this content was resolved to (digest or commit).
    pub resolved_version: String,
    /// When the entry was first fetched.
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Entry for content fetched just now.
    pub fn new(scheme: Scheme, location: impl Into<String>, resolved: impl Into<String>) -> Self {
        Self {
            scheme,
            location: location.into(),
            resolved_version: resolved.into(),
            fetched_at: Utc::now(),
        }
    }

    /// The key this entry is stored under.
    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.scheme, &self.location, &self.resolved_version)
    }
}

/// On-disk module cache rooted at one directory, shared across process
/// invocations.
#[derive(Debug)]
pub struct ModuleCache {
    root: PathBuf,
}

impl ModuleCache {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["tmp", "locks"] {
            let dir = root.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::io(format!("failed to create cache directory {}", dir.display()), e)
            })?;
        }
        Ok(Self { root })
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn content_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.entry.json", key.as_str()))
    }

    /// Return the cached content directory for `key`, if fully published.
    pub fn lookup(&self, key: &CacheKey) -> Option<PathBuf> {
        let dir = self.content_dir(key);
        if dir.is_dir() && self.entry_path(key).is_file() {
            debug!(key = key.as_str(), "cache hit");
            Some(dir)
        } else {
            None
        }
    }

    /// Read the metadata recorded for `key`, if any.
    pub fn entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(key);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("failed to read cache entry {}", path.display()), e))?;
        let entry = serde_json::from_str(&raw).map_err(|e| {
            Error::io(
                format!("corrupt cache entry {}", path.display()),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        Ok(Some(entry))
    }

    /// Allocate a staging directory under the cache root, on the same
    /// filesystem so the final publish rename is atomic.
    pub fn stage_dir(&self) -> Result<tempfile::TempDir> {
        tempfile::TempDir::new_in(self.root.join("tmp"))
            .map_err(|e| Error::io("failed to create cache staging directory", e))
    }

    /// Atomically publish fully-fetched content for `key`.
    ///
    /// `content` must live under this cache's staging area. If another
    /// invocation won the race, the staged copy is discarded and the
    /// existing entry is returned.
    pub fn publish(&self, key: &CacheKey, entry: &CacheEntry, content: &Path) -> Result<PathBuf> {
        let dest = self.content_dir(key);

        // A directory without its sidecar is a leftover from an interrupted
        // publish; reclaim it.
        if dest.exists() && !self.entry_path(key).is_file() {
            warn!(key = key.as_str(), "reclaiming incomplete cache entry");
            std::fs::remove_dir_all(&dest).map_err(|e| {
                Error::io(format!("failed to remove stale cache entry {}", dest.display()), e)
            })?;
        }

        if !dest.exists() {
            match std::fs::rename(content, &dest) {
                Ok(()) => {
                    let json = serde_json::to_string_pretty(entry).map_err(|e| {
                        Error::io(
                            "failed to encode cache entry",
                            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                        )
                    })?;
                    let path = self.entry_path(key);
                    std::fs::write(&path, json).map_err(|e| {
                        Error::io(format!("failed to write cache entry {}", path.display()), e)
                    })?;
                    debug!(key = key.as_str(), dest = %dest.display(), "published cache entry");
                    return Ok(dest);
                }
                // Lost the rename race; fall through to use the winner.
                Err(e) if dest.exists() => {
                    debug!(key = key.as_str(), error = %e, "lost cache publish race");
                }
                Err(e) => {
                    return Err(Error::io(
                        format!("failed to publish cache entry {}", dest.display()),
                        e,
                    ));
                }
            }
        }

        let _ = std::fs::remove_dir_all(content);
        Ok(dest)
    }

    /// Take the exclusive fetch lock for `key`, waiting for a concurrent
    /// invocation fetching the same coordinate to finish.
    ///
    /// Lock files record the owning PID; locks from dead processes are
    /// reclaimed. `wait` bounds the time spent waiting for a live owner.
    pub fn lock(&self, key: &CacheKey, wait: Duration) -> Result<CacheLock> {
        let path = self.root.join("locks").join(format!("{}.lock", key.as_str()));
        let deadline = std::time::Instant::now() + wait;

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    use std::io::Write;
                    let mut file = file;
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(CacheLock { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(pid) = read_lock_pid(&path)
                        && pid != std::process::id()
                        && !is_process_alive(pid)
                    {
                        warn!(key = key.as_str(), pid, "reclaiming lock from dead process");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if std::time::Instant::now() >= deadline {
                        return Err(Error::Timeout {
                            coordinate: format!("cache lock for key {}", key.as_str()),
                            seconds: wait.as_secs(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(200));
                }
                Err(e) => {
                    return Err(Error::io(
                        format!("failed to create lock file {}", path.display()),
                        e,
                    ));
                }
            }
        }
    }
}

/// Held for the duration of one fetch-and-extract; removed on drop.
#[derive(Debug)]
pub struct CacheLock {
    path: PathBuf,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn read_lock_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Conservative liveness check for the PID recorded in a lock file.
fn is_process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("ps")
            .args(["-p", &pid.to_string()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(true)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        // Assume alive where we cannot tell; the wait deadline still bounds us.
        let _ = pid;
        true
    }
}
