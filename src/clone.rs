// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository duplication.
//!
//! Produces an independent copy of a repository tree without paying for a
//! full copy of its objects. Everything under `objects/` and `deltas/` is
//! content-addressed and never modified once written, so those files are hard
//! linked into the copy. Everything else (config, refs, state, the lock file)
//! is mutable and gets copied, so edits to one repository never leak into the
//! other. The lock file especially must not be shared, or locking one
//! repository would lock both.
//!
//! Hard links only work within one filesystem, so the destination must live
//! on the same filesystem as the source.

use ignore::WalkBuilder;
use std::{
    fs::{self, Metadata},
    io::ErrorKind,
    os::unix::fs::{lchown, symlink, MetadataExt},
    path::{Component, Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Top-level directories whose files are immutable once written.
pub const SHARED_DIRS: [&str; 2] = ["objects", "deltas"];

/// Statistics about a finished duplication.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CloneStats {
    /// Number of hard linked files.
    pub linked: usize,

    /// Number of copied files.
    pub copied: usize,

    /// Number of recreated symlinks.
    pub symlinks: usize,

    /// Number of created directories.
    pub dirs: usize,
}

/// Duplicate repository tree at `source` into `dest`.
///
/// Anything already at `dest` is removed first. A symlink is unlinked rather
/// than followed. If duplication fails halfway, `dest` is left behind in a
/// state that can simply be removed, and `source` is untouched. The caller
/// retries from scratch, which removes the partial copy automatically.
///
/// # Errors
///
/// - Return [`CloneError::Walk`] if source tree cannot be traversed.
/// - Return [`CloneError::Io`] if any file operation fails.
#[instrument(skip(source, dest), level = "debug")]
pub fn duplicate(source: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<CloneStats> {
    let source = source.as_ref();
    let dest = dest.as_ref();
    info!("duplicate {:?} into {:?}", source.display(), dest.display());

    remove_stale(dest)?;
    mkdirp::mkdirp(dest).map_err(|err| io_error(err, "create", dest))?;
    let root_meta = fs::metadata(source).map_err(|err| io_error(err, "stat", source))?;
    copy_metadata(&root_meta, dest)?;

    let mut stats = CloneStats::default();
    let walker = WalkBuilder::new(source)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();
    for entry in walker {
        let entry = entry?;
        if entry.depth() == 0 {
            continue;
        }

        let path = entry.path();
        let Ok(relative) = path.strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);
        let meta = fs::symlink_metadata(path).map_err(|err| io_error(err, "stat", path))?;
        let kind = meta.file_type();

        if kind.is_dir() {
            fs::create_dir(&target).map_err(|err| io_error(err, "create", &target))?;
            copy_metadata(&meta, &target)?;
            stats.dirs += 1;
        } else if kind.is_symlink() {
            let link = fs::read_link(path).map_err(|err| io_error(err, "read link", path))?;
            symlink(&link, &target).map_err(|err| io_error(err, "symlink", &target))?;
            lchown(&target, Some(meta.uid()), Some(meta.gid()))
                .map_err(|err| io_error(err, "chown", &target))?;
            stats.symlinks += 1;
        } else if is_shared(relative) {
            fs::hard_link(path, &target).map_err(|err| io_error(err, "hard link", &target))?;
            stats.linked += 1;
        } else {
            fs::copy(path, &target).map_err(|err| io_error(err, "copy", &target))?;
            copy_metadata(&meta, &target)?;
            stats.copied += 1;
        }
    }

    debug!("duplication finished: {stats:?}");
    Ok(stats)
}

/// Check if path relative to repository root holds immutable content.
pub fn is_shared(relative: &Path) -> bool {
    match relative.components().next() {
        Some(Component::Normal(top)) => SHARED_DIRS.iter().any(|dir| top == *dir),
        _ => false,
    }
}

fn remove_stale(dest: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(dest) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(io_error(err, "stat", dest)),
    };

    debug!("remove stale clone destination {:?}", dest.display());
    if meta.is_dir() {
        fs::remove_dir_all(dest).map_err(|err| io_error(err, "remove", dest))
    } else {
        fs::remove_file(dest).map_err(|err| io_error(err, "remove", dest))
    }
}

fn copy_metadata(meta: &Metadata, target: &Path) -> Result<()> {
    fs::set_permissions(target, meta.permissions())
        .map_err(|err| io_error(err, "set permissions on", target))?;
    lchown(target, Some(meta.uid()), Some(meta.gid()))
        .map_err(|err| io_error(err, "chown", target))
}

fn io_error(source: std::io::Error, action: &'static str, path: &Path) -> CloneError {
    CloneError::Io {
        source,
        action,
        path: path.to_path_buf(),
    }
}

/// Repository duplication error types.
#[derive(Debug, thiserror::Error)]
pub enum CloneError {
    /// Source tree cannot be traversed.
    #[error(transparent)]
    Walk(#[from] ignore::Error),

    /// File operation fails.
    #[error("failed to {action} {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        action: &'static str,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = CloneError> = std::result::Result<T, E>;
