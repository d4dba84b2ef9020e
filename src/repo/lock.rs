// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository-level advisory locking.
//!
//! OSTree clients (the OS updater, Flatpak installs) take an open file
//! description `fcntl` lock on the `.lock` file at the top level of a
//! repository before touching it. This module takes the same kind of lock, so
//! holding it excludes them. Exclusive holders exclude everybody else, shared
//! holders only exclude exclusive holders.
//!
//! OFD locks belong to the open file, not the process. Two separate
//! acquisitions conflict even inside one process, and a child process such as
//! `ostree prune` conflicts with a lock its parent still holds. Release the
//! guard before running one.
//!
//! The lock is released when the [`RepoLock`] guard is dropped, so every exit
//! path of the caller releases it, including early returns through `?`.

use rustix::{
    fs::{fcntl_lock, FlockOperation},
    io::Errno,
};
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, instrument};

/// Name of the lock file inside a repository.
pub const LOCK_FILE: &str = ".lock";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Kind of repository lock to hold.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Other processes may hold shared locks at the same time.
    Shared,

    /// No other process may hold any lock at the same time.
    #[default]
    Exclusive,
}

/// Held lock on a repository.
#[derive(Debug)]
pub struct RepoLock {
    path: PathBuf,
    file: Option<File>,
}

impl RepoLock {
    /// Acquire lock on repository at `repo_path`.
    ///
    /// Keeps retrying until `timeout` runs out. A zero timeout means exactly
    /// one attempt.
    ///
    /// # Errors
    ///
    /// - Return [`LockError::Open`] if the lock file cannot be opened.
    /// - Return [`LockError::Contended`] if another process keeps holding a
    ///   conflicting lock past the timeout.
    /// - Return [`LockError::Acquire`] if the OS refuses the lock.
    #[instrument(skip(repo_path), level = "debug")]
    pub fn acquire(repo_path: &Path, kind: LockKind, timeout: Duration) -> Result<Self> {
        let path = repo_path.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| LockError::Open {
                source: err,
                path: path.clone(),
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            let operation = match kind {
                LockKind::Shared => FlockOperation::NonBlockingLockShared,
                LockKind::Exclusive => FlockOperation::NonBlockingLockExclusive,
            };

            match fcntl_lock(&file, operation) {
                Ok(()) => {
                    debug!("acquired {kind:?} lock on {:?}", repo_path.display());
                    return Ok(Self {
                        path,
                        file: Some(file),
                    });
                }
                Err(errno) if is_contended(errno) => {
                    if Instant::now() >= deadline {
                        return Err(LockError::Contended { path, timeout });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(errno) => {
                    return Err(LockError::Acquire {
                        source: errno.into(),
                        path,
                    });
                }
            }
        }
    }

    /// Path to the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if lock is still held.
    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Release lock before the guard goes out of scope.
    ///
    /// # Errors
    ///
    /// - Return [`LockError::Release`] if the OS fails to drop the lock.
    pub fn release(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            fcntl_lock(&file, FlockOperation::Unlock).map_err(|errno| LockError::Release {
                source: errno.into(),
                path: self.path.clone(),
            })?;
        }

        Ok(())
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fcntl_lock(&file, FlockOperation::Unlock);
        }
    }
}

fn is_contended(errno: Errno) -> bool {
    errno == Errno::AGAIN || errno == Errno::ACCESS
}

/// Repository lock error types.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Lock file cannot be opened or created.
    #[error("failed to open lock file {:?}", path.display())]
    Open {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Another process holds a conflicting lock.
    #[error("repository lock {:?} still held by another process after {timeout:?}", path.display())]
    Contended { path: PathBuf, timeout: Duration },

    /// Lock cannot be acquired for some other reason.
    #[error("failed to acquire repository lock {:?}", path.display())]
    Acquire {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Lock cannot be released.
    #[error("failed to release repository lock {:?}", path.display())]
    Release {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
type Result<T, E = LockError> = std::result::Result<T, E>;
