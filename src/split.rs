// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository split state machine.
//!
//! Splits the combined repository into an OS repository and a Flatpak
//! repository, then turns the Flatpak data directory symlink into a real
//! directory.
//!
//! # States
//!
//! ```text
//! Unsplit -> RepoSplitting -> RepoSplit -> DirSplitting -> Complete
//! ```
//!
//! The current state is always derived from what is on disk, never stored.
//! Running the split again after a crash picks up where the last run left
//! off, and running it on a system that is already split changes nothing.
//!
//! - __Unsplit__: the OS repository and the Flatpak repository resolve to the
//!   same real path.
//! - __RepoSplit__: both repositories are separate, but the Flatpak data
//!   directory is still a symlink into shared storage.
//! - __Complete__: both repositories are separate, and the Flatpak data
//!   directory is a real directory.
//!
//! # Cutover
//!
//! The new Flatpak repository only becomes visible through the Flatpak
//! repository path once it has been fully prepared and flushed to disk. Any
//! reader resolving that path before the swap sees the combined repository,
//! any reader after sees the split one.

use crate::{
    classify::{self, ClassifyError, RemoteSet, DEFAULT_OS_REMOTE_OPTION},
    clone::{self, CloneError},
    config::{Settings, DEFAULT_FLATPAK_REPO_MODE},
    path::{self, Layout, PathError},
    repo::{keyfile::CORE_GROUP, lock::LockKind, refs::Refspec, Repo, RepoError},
    swap::{self, SwapError},
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Name of the fresh Flatpak repository before it is swapped into place.
pub const NEW_REPO_NAME: &str = "repo.split-tmp";

/// Split progress derived from on-disk state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitState {
    /// Both paths still lead to one combined repository.
    Unsplit,

    /// Combined repository is being split.
    RepoSplitting,

    /// Repositories are separate, Flatpak data directory is still a symlink.
    RepoSplit,

    /// Flatpak data directory is being moved into place.
    DirSplitting,

    /// Nothing left to do.
    Complete,
}

impl Display for SplitState {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Unsplit => "unsplit",
            Self::RepoSplitting => "repo splitting",
            Self::RepoSplit => "repo split",
            Self::DirSplitting => "dir splitting",
            Self::Complete => "complete",
        };
        fmt.write_str(name)
    }
}

/// Knobs for a split run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOptions {
    /// Prune unreachable objects from both repositories afterwards.
    pub prune: bool,

    /// Boolean remote option marking remotes that serve OS content.
    pub os_remote_option: String,

    /// Storage mode to give the new Flatpak repository.
    pub flatpak_repo_mode: String,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            prune: false,
            os_remote_option: DEFAULT_OS_REMOTE_OPTION.into(),
            flatpak_repo_mode: DEFAULT_FLATPAK_REPO_MODE.into(),
        }
    }
}

impl From<&Settings> for SplitOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            prune: false,
            os_remote_option: settings.split.os_remote_option.clone(),
            flatpak_repo_mode: settings.split.flatpak_repo_mode.clone(),
        }
    }
}

/// Drives the split of one system.
#[derive(Debug, Clone)]
pub struct Splitter {
    layout: Layout,
    options: SplitOptions,
}

impl Splitter {
    /// Construct new splitter.
    pub fn new(layout: Layout, options: SplitOptions) -> Self {
        Self { layout, options }
    }

    /// Determine current split state from disk.
    ///
    /// # Errors
    ///
    /// - Return [`SplitError::Path`] if repository paths cannot be resolved.
    pub fn state(&self) -> Result<SplitState> {
        let os_repo = path::real_path(self.layout.os_repo())?;
        let flatpak_repo = path::real_path(self.layout.flatpak_repo())?;
        if os_repo == flatpak_repo {
            return Ok(SplitState::Unsplit);
        }

        if path::is_symlink(self.layout.flatpak_dir())? {
            return Ok(SplitState::RepoSplit);
        }

        Ok(SplitState::Complete)
    }

    /// Run split to completion.
    ///
    /// Returns `false` if the system was already split and nothing changed.
    ///
    /// # Errors
    ///
    /// - Return [`SplitError`] if any step fails. Every lock and transaction
    ///   opened by the failing step is released or aborted first. Run again
    ///   to resume.
    #[instrument(skip(self), level = "debug")]
    pub fn run(&self) -> Result<bool> {
        self.housekeeping()?;

        let mut state = self.state()?;
        info!("split state: {state}");
        let mut changed = false;

        if state == SplitState::Unsplit {
            debug!("enter state: {}", SplitState::RepoSplitting);
            self.split_repos()?;
            changed = true;
            state = self.state()?;
        } else if self.clean_os_repo()? {
            // INVARIANT: Finish a split that stopped right after the cutover.
            changed = true;
        }

        if state == SplitState::RepoSplit {
            debug!("enter state: {}", SplitState::DirSplitting);
            self.split_dir()?;
            changed = true;
        }

        if changed {
            info!("split state: {}", SplitState::Complete);
        } else {
            info!("repositories already split, nothing to do");
        }

        Ok(changed)
    }

    fn housekeeping(&self) -> Result<()> {
        let flatpak_dir = self.layout.flatpak_dir();
        swap::recover(flatpak_dir)?;
        if let Some(parent) = flatpak_dir.parent() {
            swap::cleanup_stale(parent)?;
        }

        let flatpak_repo = self.layout.flatpak_repo();
        swap::recover(&flatpak_repo)?;
        swap::cleanup_stale(flatpak_dir)?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn split_repos(&self) -> Result<()> {
        let link = self.layout.flatpak_repo();
        if !path::is_symlink(&link)? {
            return Err(SplitError::NotASymlink(link));
        }

        let source = Repo::open(self.layout.os_repo())?;
        {
            let _source_lock = source.lock(LockKind::Exclusive)?;
            info!("split combined repository {:?}", source.path().display());

            let remotes = classify::gather_remotes(&source, &self.options.os_remote_option)?;
            let partition = classify::gather_refs(&source, &remotes)?;
            info!(
                "{} os refs, {} flatpak refs, {} other refs",
                partition.os.len(),
                partition.flatpak.len(),
                partition.other.len()
            );

            // INVARIANT: New repository lands next to the link it replaces.
            let new_path = path::real_path(self.layout.flatpak_dir())?.join(NEW_REPO_NAME);
            clone::duplicate(source.path(), &new_path)?;

            self.prepare_flatpak_repo(&new_path, remotes.os(), partition.not_flatpak())?;

            path::full_sync()?;
            swap::replace_symlink_with_path(&link, &new_path)?;
            path::full_sync()?;
            info!("flatpak repository now at {:?}", link.display());

            strip_flatpak_content(&source, &remotes, partition.not_os())?;
        }

        // INVARIANT: Prune runs its own ostree process, which takes the lock.
        if self.options.prune {
            source.prune()?;
        }

        Ok(())
    }

    fn prepare_flatpak_repo<'a>(
        &self,
        new_path: &Path,
        os_remotes: impl IntoIterator<Item = &'a str>,
        os_refs: impl IntoIterator<Item = &'a Refspec>,
    ) -> Result<()> {
        let repo = Repo::open(new_path)?;
        {
            let _lock = repo.lock(LockKind::Exclusive)?;
            for remote in os_remotes {
                repo.remove_remote(remote)?;
            }
            repo.transaction(|txn| -> Result<()> {
                txn.remove_refs(os_refs);
                Ok(())
            })?;
        }

        if self.options.prune {
            repo.prune()?;
        }

        let _lock = repo.lock(LockKind::Exclusive)?;
        let mut config = repo.read_config()?;
        config.set(CORE_GROUP, "mode", self.options.flatpak_repo_mode.as_str());
        repo.write_config(&config)?;
        info!(
            "prepared flatpak repository {:?} in {} mode",
            repo.path().display(),
            self.options.flatpak_repo_mode
        );

        Ok(())
    }

    /// Drop Flatpak content left in the OS repository of a split system.
    ///
    /// Flatpak remotes are the remotes of the split Flatpak repository plus
    /// any remote of the OS repository not marked as OS content. A remote
    /// marked as OS content always stays, and so do refs of no Flatpak remote
    /// that are not Flatpak refs themselves. Writes nothing if the OS
    /// repository is already clean.
    #[instrument(skip(self), level = "debug")]
    fn clean_os_repo(&self) -> Result<bool> {
        let flatpak_remotes = Repo::open(self.layout.flatpak_repo())?.list_remotes()?;
        let source = Repo::open(self.layout.os_repo())?;

        let changed = {
            let _lock = source.lock(LockKind::Exclusive)?;
            let gathered = classify::gather_remotes(&source, &self.options.os_remote_option)?;
            let os: Vec<&str> = gathered.os().collect();
            let flatpak = gathered
                .flatpak()
                .chain(flatpak_remotes.iter().map(String::as_str))
                .filter(|remote| !os.contains(remote));
            let remotes = RemoteSet::new(os.iter().copied(), flatpak);
            let partition = classify::gather_refs(&source, &remotes)?;

            // INVARIANT: Other refs survive unless a Flatpak remote owns them.
            let owned = partition.other.iter().filter(|refspec| {
                refspec
                    .remote_name()
                    .is_some_and(|remote| remotes.flatpak().any(|flatpak| flatpak == remote))
            });
            strip_flatpak_content(&source, &remotes, partition.flatpak.iter().chain(owned))?
        };

        if changed {
            info!("removed leftover flatpak content from {:?}", source.path().display());
            if self.options.prune {
                source.prune()?;
            }
        }

        Ok(changed)
    }

    #[instrument(skip(self), level = "debug")]
    fn split_dir(&self) -> Result<()> {
        let link = self.layout.flatpak_dir();
        let target = path::real_path(link)?;
        info!("move {:?} into place at {:?}", target.display(), link.display());

        swap::replace_symlink_with_path(link, &target)?;
        path::full_sync()?;

        Ok(())
    }
}

/// Remove Flatpak remotes, Flatpak refs, and other refs from OS repository.
///
/// Caller holds the repository lock. Returns `true` if anything was removed.
fn strip_flatpak_content<'a>(
    source: &Repo,
    remotes: &RemoteSet,
    stale: impl IntoIterator<Item = &'a Refspec>,
) -> Result<bool> {
    let mut changed = false;
    for remote in remotes.flatpak() {
        changed |= source.remove_remote(remote)?;
    }

    let stale: Vec<&Refspec> = stale.into_iter().collect();
    if !stale.is_empty() {
        changed = true;
        source.transaction(|txn| -> Result<()> {
            txn.remove_refs(stale);
            Ok(())
        })?;
    }

    Ok(changed)
}

/// Split error types.
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    /// Flatpak repository path is not a symlink to the combined repository.
    #[error("flatpak repository {:?} is not a symlink", .0.display())]
    NotASymlink(PathBuf),

    /// Paths cannot be resolved or flushed.
    #[error(transparent)]
    Path(#[from] PathError),

    /// Repository operation fails.
    #[error(transparent)]
    Repo(#[from] RepoError),

    /// Repository duplication fails.
    #[error(transparent)]
    Clone(#[from] CloneError),

    /// Content classification fails.
    #[error(transparent)]
    Classify(#[from] ClassifyError),

    /// Symlink swap fails.
    #[error(transparent)]
    Swap(#[from] SwapError),
}

/// Friendly result alias :3
pub type Result<T, E = SplitError> = std::result::Result<T, E>;
