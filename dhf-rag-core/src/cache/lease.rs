//! Cross-process rebuild lease
//!
//! A lease is a small JSON file `{ownerId, acquiredAt}` created with
//! exclusive create-if-absent. A lease older than its TTL belongs to a
//! crashed or stuck owner and may be reclaimed.

use super::record::write_atomic;
use crate::error::DhfError;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const INITIAL_BACKOFF: Duration = Duration::from_millis(25);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseFile {
    owner_id: String,
    /// Milliseconds since the Unix epoch
    acquired_at: u64,
}

/// Process-unique lease owner id
pub fn new_owner_id() -> String {
    format!("{}-{}", std::process::id(), uuid::Uuid::new_v4().simple())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A held lease; released on drop.
#[derive(Debug)]
pub struct Lease {
    path: PathBuf,
    owner_id: String,
    ttl: Duration,
    last_refresh: Cell<Instant>,
}

impl Lease {
    /// Acquire the lease at `path`, retrying with exponential backoff until
    /// `timeout` has elapsed.
    pub fn acquire(
        path: &Path,
        owner_id: &str,
        ttl: Duration,
        timeout: Duration,
        project: &Path,
    ) -> crate::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| DhfError::io_at(dir, e))?;
        }

        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if try_create(path, owner_id)? {
                tracing::debug!(lease = %path.display(), owner = owner_id, "lease acquired");
                return Ok(Self {
                    path: path.to_path_buf(),
                    owner_id: owner_id.to_string(),
                    ttl,
                    last_refresh: Cell::new(Instant::now()),
                });
            }

            if let Some(observed) = stale_contents(path, ttl) {
                if reclaim(path, &observed) {
                    tracing::info!(lease = %path.display(), "reclaimed stale lease");
                    continue;
                }
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(DhfError::LockTimeout {
                    project: project.to_path_buf(),
                    waited,
                });
            }
            let pause = backoff.min(timeout - waited);
            tracing::debug!(lease = %path.display(), ?pause, "lease held elsewhere, backing off");
            std::thread::sleep(pause);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Rewrite `acquiredAt` once a third of the TTL has passed, so a long
    /// rebuild is not mistaken for a dead one.
    pub fn heartbeat(&self) -> crate::Result<()> {
        if self.last_refresh.get().elapsed() < self.ttl / 3 {
            return Ok(());
        }
        let Some(current) = read_lease(&self.path).filter(|l| l.owner_id == self.owner_id) else {
            tracing::warn!(lease = %self.path.display(), "lease lost during rebuild");
            return Ok(());
        };
        // Past the TTL another process may be reclaiming it right now;
        // renaming over the file could clobber its fresh lease.
        if now_millis().saturating_sub(current.acquired_at) >= self.ttl.as_millis() as u64 {
            tracing::warn!(lease = %self.path.display(), "lease expired before heartbeat, not refreshing");
            return Ok(());
        }

        let body = serde_json::to_vec(&LeaseFile {
            owner_id: self.owner_id.clone(),
            acquired_at: now_millis(),
        })?;
        write_atomic(&self.path, &body)?;
        self.last_refresh.set(Instant::now());
        if !self.is_held() {
            tracing::warn!(lease = %self.path.display(), "lease changed hands during heartbeat");
        }
        Ok(())
    }

    /// Whether the lease file still names this owner.
    pub fn is_held(&self) -> bool {
        read_lease(&self.path).is_some_and(|l| l.owner_id == self.owner_id)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // Never remove a lease another process reclaimed from us
        if self.is_held() {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!(lease = %self.path.display(), error = %e, "failed to release lease");
                }
            }
        }
    }
}

/// Exclusive create; `Ok(false)` when the file already exists.
fn try_create(path: &Path, owner_id: &str) -> crate::Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(DhfError::io_at(path, e)),
    };
    let body = serde_json::to_vec(&LeaseFile {
        owner_id: owner_id.to_string(),
        acquired_at: now_millis(),
    })?;
    if let Err(e) = file.write_all(&body).and_then(|_| file.sync_all()) {
        let _ = fs::remove_file(path);
        return Err(DhfError::io_at(path, e));
    }
    Ok(true)
}

fn read_lease(path: &Path) -> Option<LeaseFile> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Raw contents of the lease when it is stale, `None` when it is live or gone.
///
/// An unparseable lease (a writer died mid-write) is judged by file mtime.
fn stale_contents(path: &Path, ttl: Duration) -> Option<Vec<u8>> {
    let bytes = fs::read(path).ok()?;
    let stale = match serde_json::from_slice::<LeaseFile>(&bytes) {
        Ok(lease) => now_millis().saturating_sub(lease.acquired_at) > ttl.as_millis() as u64,
        Err(_) => fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age > ttl),
    };
    stale.then_some(bytes)
}

/// Move a stale lease aside. If the file turns out to have been replaced by
/// a live lease in the meantime, put it back.
fn reclaim(path: &Path, observed: &[u8]) -> bool {
    let tomb = path.with_extension(format!("stale-{}", uuid::Uuid::new_v4().simple()));
    if fs::rename(path, &tomb).is_err() {
        return false;
    }
    let moved = fs::read(&tomb).unwrap_or_default();
    let reclaimed = moved == observed;
    if !reclaimed {
        // Fails if someone else already created a fresh lease; theirs wins
        let _ = fs::hard_link(&tomb, path);
    }
    let _ = fs::remove_file(&tomb);
    reclaimed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn write_foreign(path: &Path, acquired_at: u64) {
        let body = serde_json::to_vec(&LeaseFile {
            owner_id: "other-process".to_string(),
            acquired_at,
        })
        .unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locks").join("p.lease");
        let lease = Lease::acquire(&path, "me", Duration::from_secs(60), Duration::from_secs(1), dir.path())
            .unwrap();
        assert!(lease.is_held());
        let on_disk = read_lease(&path).unwrap();
        assert_eq!(on_disk.owner_id, "me");
        drop(lease);
        assert!(!path.exists());
    }

    #[test]
    fn fresh_foreign_lease_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.lease");
        write_foreign(&path, now_millis());

        let started = Instant::now();
        let err = Lease::acquire(&path, "me", Duration::from_secs(60), Duration::from_millis(150), dir.path())
            .unwrap_err();
        assert!(matches!(err, DhfError::LockTimeout { .. }));
        assert!(err.is_retriable());
        assert!(started.elapsed() >= Duration::from_millis(150));
        // The foreign lease is untouched
        assert_eq!(read_lease(&path).unwrap().owner_id, "other-process");
    }

    #[test]
    fn stale_lease_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.lease");
        write_foreign(&path, now_millis() - 120_000);

        let lease = Lease::acquire(&path, "me", Duration::from_secs(60), Duration::from_millis(200), dir.path())
            .unwrap();
        assert_eq!(lease.owner_id(), "me");
        assert_eq!(read_lease(&path).unwrap().owner_id, "me");
    }

    #[test]
    fn unparseable_lease_is_judged_by_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.lease");
        fs::write(&path, b"{\"ownerId\": \"half").unwrap();

        let ttl = Duration::from_secs(60);
        assert!(stale_contents(&path, ttl).is_none());

        let file = File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(120)).unwrap();
        drop(file);
        assert!(stale_contents(&path, ttl).is_some());

        let lease = Lease::acquire(&path, "me", ttl, Duration::from_millis(200), dir.path()).unwrap();
        assert!(lease.is_held());
    }

    #[test]
    fn drop_does_not_remove_reclaimed_lease() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.lease");
        let lease = Lease::acquire(&path, "me", Duration::from_secs(60), Duration::from_secs(1), dir.path())
            .unwrap();
        write_foreign(&path, now_millis());
        assert!(!lease.is_held());
        drop(lease);
        assert_eq!(read_lease(&path).unwrap().owner_id, "other-process");
    }

    #[test]
    fn heartbeat_refreshes_acquired_at() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.lease");
        let lease = Lease::acquire(&path, "me", Duration::from_millis(600), Duration::from_secs(1), dir.path())
            .unwrap();
        let first = read_lease(&path).unwrap().acquired_at;
        std::thread::sleep(Duration::from_millis(250));
        lease.heartbeat().unwrap();
        let second = read_lease(&path).unwrap();
        assert_eq!(second.owner_id, "me");
        assert!(second.acquired_at > first);
    }

    #[test]
    fn heartbeat_leaves_expired_lease_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.lease");
        let lease = Lease::acquire(&path, "me", Duration::from_millis(40), Duration::from_secs(1), dir.path())
            .unwrap();
        let before = fs::read(&path).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        lease.heartbeat().unwrap();
        assert_eq!(fs::read(&path).unwrap(), before);

        // A contender can still reclaim it, and the heartbeat does not undo that
        let other = Lease::acquire(&path, "other", Duration::from_millis(40), Duration::from_millis(200), dir.path())
            .unwrap();
        lease.heartbeat().unwrap();
        assert!(other.is_held());
        assert!(!lease.is_held());
    }
}
