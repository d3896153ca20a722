//! Single-flight lease for runs that touch a table.
//!
//! Two decode runs over the same raw table would read the same checkpoint
//! and append the same records twice; two ingests would each rewrite the
//! raw table and one batch would be lost. A run therefore holds
//! `<data_dir>/<key>.lock` for its whole duration.
//!
//! The lease JSON is written to a private temp file first and then
//! hard-linked into place, so the lock file never exists without its
//! contents. A lease older than its TTL is treated as abandoned and taken
//! over. A lock file that cannot be parsed is judged by its mtime instead.
//! Release only removes the file while it still holds this run's lease.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Contents of a lease file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Lease {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// What is currently on disk at a lease path.
#[derive(Debug)]
enum Holder {
    Lease(Lease),
    /// Present but unparsable; carries the file's mtime.
    Unreadable(DateTime<Utc>),
    Vacant,
}

impl Holder {
    fn read(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::Vacant),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        if let Ok(lease) = serde_json::from_str::<Lease>(&data) {
            return Ok(Self::Lease(lease));
        }
        match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => Ok(Self::Unreadable(modified.into())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::Vacant),
            Err(e) => Err(e).with_context(|| format!("inspecting {}", path.display())),
        }
    }
}

/// A held lease. Dropping it releases the lease file.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    lease: Lease,
}

impl RunLock {
    /// Take the lease `<dir>/<key>.lock`.
    ///
    /// # Errors
    ///
    /// Returns an error if another live run holds the lease or the file
    /// cannot be written.
    pub fn acquire(dir: &Path, key: &str, ttl: TimeDelta) -> Result<Self> {
        Self::acquire_at(dir, key, ttl, Utc::now())
    }

    fn acquire_at(dir: &Path, key: &str, ttl: TimeDelta, now: DateTime<Utc>) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(format!("{key}.lock"));
        let lease = Lease {
            pid: std::process::id(),
            acquired_at: now,
        };

        let tmp = dir.join(format!("{key}.lock.{}.tmp", lease.pid));
        std::fs::write(&tmp, serde_json::to_string(&lease)?)
            .with_context(|| format!("writing {}", tmp.display()))?;
        let claimed = Self::claim(&tmp, &path, ttl, now);
        if let Err(e) = std::fs::remove_file(&tmp) {
            tracing::warn!(path = %tmp.display(), error = %e, "failed to remove lease temp file");
        }
        claimed?;

        tracing::debug!(path = %path.display(), "lease acquired");
        Ok(Self { path, lease })
    }

    /// Link `tmp` to `path`, taking over an abandoned lease at most once.
    fn claim(tmp: &Path, path: &Path, ttl: TimeDelta, now: DateTime<Utc>) -> Result<()> {
        for _ in 0..2 {
            match std::fs::hard_link(tmp, path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e).with_context(|| format!("creating {}", path.display())),
            }

            let holder = Holder::read(path)?;
            match holder {
                Holder::Lease(held) if now - held.acquired_at < ttl => {
                    bail!(
                        "{} is held by pid {} since {}",
                        path.display(),
                        held.pid,
                        held.acquired_at
                    );
                }
                Holder::Unreadable(modified) if now - modified < ttl => {
                    bail!(
                        "{} is held (unreadable lease written at {modified})",
                        path.display()
                    );
                }
                Holder::Lease(held) => {
                    tracing::warn!(path = %path.display(), pid = held.pid, acquired_at = %held.acquired_at, "taking over expired lease");
                }
                Holder::Unreadable(modified) => {
                    tracing::warn!(path = %path.display(), %modified, "taking over unreadable lease");
                }
                Holder::Vacant => continue,
            }
            remove_if_unchanged(path, &holder)?;
        }
        bail!("{} was re-taken by another run", path.display())
    }

    /// Path of the lease file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Remove the lease file unless another run replaced it since `seen`.
fn remove_if_unchanged(path: &Path, seen: &Holder) -> Result<()> {
    let unchanged = match (Holder::read(path)?, seen) {
        (Holder::Lease(now), Holder::Lease(then)) => now == *then,
        (Holder::Unreadable(now), Holder::Unreadable(then)) => now == *then,
        _ => false,
    };
    if !unchanged {
        return Ok(());
    }
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match Holder::read(&self.path) {
            Ok(Holder::Lease(held)) if held == self.lease => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to release lease");
                }
            }
            Ok(Holder::Lease(held)) => {
                tracing::warn!(path = %self.path.display(), pid = held.pid, acquired_at = %held.acquired_at, "lease was taken over, leaving it in place");
            }
            Ok(_) => {
                tracing::warn!(path = %self.path.display(), "lease file missing or replaced, leaving it in place");
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to release lease");
            }
        }
    }
}
