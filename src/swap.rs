// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Atomic symlink to directory swap.
//!
//! Replaces a symlink with a real directory such that the symlink path is
//! bound to something at every instant: first the old symlink, then the new
//! directory. Nothing in between may leave the path dangling or absent for
//! longer than one rename.
//!
//! # Swap Sequence
//!
//! 1. Rename the symlink to a temporary sibling name. Both names live in the
//!    same directory, so the rename is atomic.
//! 2. Rename the new directory to the original symlink name. If this fails,
//!    rename the temporary name back, making the whole swap a no-op.
//! 3. Remove the temporary name. Failure here only leaves a harmless stale
//!    symlink behind, which [`cleanup_stale`] removes later.
//!
//! A crash between step 1 and 2 leaves the symlink under its temporary name.
//! Call [`recover`] before looking at the symlink path again to put it back.
//!
//! Callers must flush the filesystem after each swap before doing anything
//! that assumes the swap survived a crash.

use std::{
    ffi::OsString,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

const TEMP_SUFFIX: &str = ".swap";

/// Replace symlink at `link` with directory at `new_target`.
///
/// Afterwards `new_target` no longer exists, and `link` is the real
/// directory.
///
/// # Errors
///
/// - Return [`SwapError::NotASymlink`] if `link` is not a symlink.
/// - Return [`SwapError::Rename`] if step 1 or step 2 fails. A failed step 2
///   is rolled back before returning.
/// - Return [`SwapError::Rollback`] if a failed step 2 cannot be rolled
///   back.
#[instrument(skip(link, new_target), level = "debug")]
pub fn replace_symlink_with_path(link: impl AsRef<Path>, new_target: impl AsRef<Path>) -> Result<()> {
    let link = link.as_ref();
    let new_target = new_target.as_ref();
    info!("swap symlink {:?} for {:?}", link.display(), new_target.display());

    let is_symlink = fs::symlink_metadata(link)
        .map(|meta| meta.file_type().is_symlink())
        .map_err(|err| SwapError::Inspect {
            source: err,
            path: link.to_path_buf(),
        })?;
    if !is_symlink {
        return Err(SwapError::NotASymlink(link.to_path_buf()));
    }

    let temp = temp_path(link)?;
    rename(link, &temp)?;

    if let Err(err) = rename(new_target, link) {
        warn!("roll back swap of {:?}", link.display());
        fs::rename(&temp, link).map_err(|rollback| SwapError::Rollback {
            source: rollback,
            temp: temp.clone(),
            link: link.to_path_buf(),
        })?;
        return Err(err);
    }

    if let Err(err) = fs::remove_file(&temp) {
        warn!("cannot remove old symlink {:?}: {err}", temp.display());
    }

    Ok(())
}

/// Undo a swap interrupted between its first and second step.
///
/// Returns `true` if the old symlink had to be moved back into place.
///
/// # Errors
///
/// - Return [`SwapError::Inspect`] if paths cannot be inspected.
/// - Return [`SwapError::Rename`] if the symlink cannot be moved back.
#[instrument(skip(link), level = "debug")]
pub fn recover(link: impl AsRef<Path>) -> Result<bool> {
    let link = link.as_ref();
    if exists_no_follow(link)? {
        return Ok(false);
    }

    let temp = temp_path(link)?;
    if !exists_no_follow(&temp)? {
        return Ok(false);
    }

    warn!("recover interrupted swap of {:?}", link.display());
    rename(&temp, link)?;

    Ok(true)
}

/// Remove symlinks left behind by swaps in `dir`.
///
/// Only symlinks matching the temporary naming scheme are removed. Returns
/// the removed paths.
///
/// # Errors
///
/// - Return [`SwapError::Pattern`] if `dir` cannot be turned into a glob.
/// - Return [`SwapError::Remove`] if a stale symlink cannot be removed.
#[instrument(skip(dir), level = "debug")]
pub fn cleanup_stale(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let pattern = format!(
        "{}/.*{TEMP_SUFFIX}",
        glob::Pattern::escape(&dir.to_string_lossy())
    );

    let mut removed = Vec::new();
    for entry in glob::glob(&pattern)? {
        let path = match entry {
            Ok(path) => path,
            Err(err) => {
                warn!("cannot inspect swap leftover {:?}: {err}", err.path().display());
                continue;
            }
        };

        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_symlink() => {}
            Ok(_) => continue,
            Err(err) => {
                warn!("cannot inspect swap leftover {:?}: {err}", path.display());
                continue;
            }
        }

        debug!("remove stale swap leftover {:?}", path.display());
        fs::remove_file(&path).map_err(|err| SwapError::Remove {
            source: err,
            path: path.clone(),
        })?;
        removed.push(path);
    }

    Ok(removed)
}

fn temp_path(link: &Path) -> Result<PathBuf> {
    let name = link
        .file_name()
        .ok_or_else(|| SwapError::NoFileName(link.to_path_buf()))?;
    let mut temp = OsString::from(".");
    temp.push(name);
    temp.push(TEMP_SUFFIX);

    Ok(link.with_file_name(temp))
}

fn exists_no_follow(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(SwapError::Inspect {
            source: err,
            path: path.to_path_buf(),
        }),
    }
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    debug!("rename {:?} to {:?}", from.display(), to.display());
    fs::rename(from, to).map_err(|err| SwapError::Rename {
        source: err,
        from: from.to_path_buf(),
        to: to.to_path_buf(),
    })
}

/// Swap error types.
#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    /// Path to swap is not a symlink.
    #[error("{:?} is not a symlink", .0.display())]
    NotASymlink(PathBuf),

    /// Path to swap has no file name.
    #[error("{:?} has no file name", .0.display())]
    NoFileName(PathBuf),

    /// Path cannot be inspected.
    #[error("failed to inspect {:?}", path.display())]
    Inspect {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Rename fails.
    #[error("failed to rename {:?} to {:?}", from.display(), to.display())]
    Rename {
        #[source]
        source: std::io::Error,
        from: PathBuf,
        to: PathBuf,
    },

    /// Failed swap cannot be rolled back.
    #[error("failed to restore symlink {:?} from {:?}", link.display(), temp.display())]
    Rollback {
        #[source]
        source: std::io::Error,
        temp: PathBuf,
        link: PathBuf,
    },

    /// Stale swap leftover cannot be removed.
    #[error("failed to remove stale symlink {:?}", path.display())]
    Remove {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Directory cannot be searched for leftovers.
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
}

/// Friendly result alias :3
pub type Result<T, E = SwapError> = std::result::Result<T, E>;
