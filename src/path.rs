// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine where the repositories and the Flatpak data directory live on a
//! given system, and resolve the symlinks between them.
//!
//! # System Layout
//!
//! ```text
//! <sysroot>/ostree/repo          OS repository, always a real directory
//! <sysroot>/var/lib/flatpak      Flatpak data directory
//! <flatpak dir>/repo             Flatpak repository
//! ```
//!
//! Before the split, the Flatpak data directory is a symlink into shared
//! storage next to the OS repository, and its `repo` entry is a symlink to
//! the OS repository. After the split, both are real directories.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Command,
};
use tracing::debug;

/// Repository and Flatpak directory locations of one system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    os_repo: PathBuf,
    flatpak_dir: PathBuf,
}

impl Layout {
    /// Construct new layout from explicit paths.
    pub fn new(os_repo: impl Into<PathBuf>, flatpak_dir: impl Into<PathBuf>) -> Self {
        Self {
            os_repo: os_repo.into(),
            flatpak_dir: flatpak_dir.into(),
        }
    }

    /// Construct default layout below `sysroot`.
    pub fn under(sysroot: impl AsRef<Path>) -> Self {
        let sysroot = sysroot.as_ref();
        Self::new(
            sysroot.join("ostree").join("repo"),
            sysroot.join("var").join("lib").join("flatpak"),
        )
    }

    /// Path to the OS repository.
    pub fn os_repo(&self) -> &Path {
        &self.os_repo
    }

    /// Path to the Flatpak data directory.
    pub fn flatpak_dir(&self) -> &Path {
        &self.flatpak_dir
    }

    /// Path to the Flatpak repository.
    pub fn flatpak_repo(&self) -> PathBuf {
        self.flatpak_dir.join("repo")
    }
}

/// Resolve path to its real absolute path.
///
/// # Errors
///
/// - Return [`PathError::Resolve`] if path cannot be resolved.
pub fn real_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    fs::canonicalize(path.as_ref()).map_err(|err| PathError::Resolve {
        source: err,
        path: path.as_ref().to_path_buf(),
    })
}

/// Check if path itself is a symlink, without following it.
///
/// # Errors
///
/// - Return [`PathError::Inspect`] if path cannot be inspected.
pub fn is_symlink(path: impl AsRef<Path>) -> Result<bool> {
    match fs::symlink_metadata(path.as_ref()) {
        Ok(meta) => Ok(meta.file_type().is_symlink()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(PathError::Inspect {
            source: err,
            path: path.as_ref().to_path_buf(),
        }),
    }
}

/// Flush every filesystem to disk.
///
/// # Errors
///
/// - Return [`PathError::Sync`] if sync cannot be run or fails.
pub fn full_sync() -> Result<()> {
    debug!("flush filesystems");
    let status = Command::new("sync").status().map_err(PathError::Sync)?;
    if !status.success() {
        return Err(PathError::Sync(std::io::Error::other(format!(
            "command \"sync\" failed: {status}"
        ))));
    }

    Ok(())
}

/// Path resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    /// Path cannot be resolved.
    #[error("failed to resolve {:?}", path.display())]
    Resolve {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Path cannot be inspected.
    #[error("failed to inspect {:?}", path.display())]
    Inspect {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Filesystems cannot be flushed.
    #[error("failed to flush filesystems")]
    Sync(#[source] std::io::Error),
}

/// Friendly result alias :3
pub type Result<T, E = PathError> = std::result::Result<T, E>;
