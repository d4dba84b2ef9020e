// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository handle.
//!
//! A __repository__ is an OSTree content-addressed store. Before the split,
//! one repository holds both base-OS commits and Flatpak application
//! commits. Afterwards, there are two repositories with the same on-disk
//! format, each serving only one kind of content.
//!
//! # Repository Layout
//!
//! ```text
//! repo/
//! ├── .lock       advisory lock file shared by every OSTree client
//! ├── config      repository configuration, see [`keyfile`]
//! ├── objects/    immutable content-addressed objects
//! ├── deltas/     immutable static deltas
//! ├── refs/       ref table, see [`refs`]
//! ├── state/
//! └── tmp/
//! ```
//!
//! [`Repo`] only covers the narrow set of operations needed to rearrange refs
//! and remotes between repositories: locking, ref transactions, config
//! access, remote and ref enumeration, and pruning. Object storage itself is
//! never touched here. Pruning is left to the `ostree` binary.

pub mod keyfile;
pub mod lock;
pub mod refs;
pub mod transaction;

use crate::repo::{
    keyfile::{remote_group, remote_name, KeyFile, CORE_GROUP},
    lock::{LockKind, RepoLock},
    refs::{Checksum, Refspec},
    transaction::Transaction,
};

use std::{
    collections::BTreeMap,
    ffi::OsStr,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// Lock wait used when the repository does not configure one.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to an on-disk repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    path: PathBuf,
}

impl Repo {
    /// Open existing repository.
    ///
    /// Resolves `path` to its real absolute path, so a handle opened through
    /// a symlink keeps pointing at the same repository even if the symlink is
    /// swapped later.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::Resolve`] if path cannot be resolved.
    /// - Return [`RepoError::NotARepo`] if there is no repository config.
    #[instrument(skip(path), level = "debug")]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = fs::canonicalize(path.as_ref()).map_err(|err| RepoError::Resolve {
            source: err,
            path: path.as_ref().to_path_buf(),
        })?;
        if !path.join("config").is_file() {
            return Err(RepoError::NotARepo(path));
        }

        debug!("open repository {:?}", path.display());
        Ok(Self { path })
    }

    /// Resolved absolute path of repository.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire repository lock.
    ///
    /// Waits for at most `core.lock-timeout-secs` seconds, or
    /// [`DEFAULT_LOCK_TIMEOUT`] if unset or negative.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::Lock`] if lock cannot be acquired in time.
    /// - Return [`RepoError::KeyFile`] if the timeout setting is malformed.
    pub fn lock(&self, kind: LockKind) -> Result<RepoLock> {
        let timeout = match self.read_config()?.get_int(CORE_GROUP, "lock-timeout-secs")? {
            Some(secs) if secs >= 0 => Duration::from_secs(secs.unsigned_abs()),
            _ => DEFAULT_LOCK_TIMEOUT,
        };

        Ok(RepoLock::acquire(&self.path, kind, timeout)?)
    }

    /// Run `body` inside a ref transaction.
    ///
    /// Staged mutations are committed if `body` succeeds. If `body` fails,
    /// the transaction is aborted without applying anything, and the error
    /// is handed back as-is.
    ///
    /// # Errors
    ///
    /// - Return whatever `body` fails with.
    /// - Return [`RepoError::Transaction`] if commit fails.
    pub fn transaction<T, E, F>(&self, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> std::result::Result<T, E>,
        E: From<RepoError>,
    {
        let mut txn = Transaction::new(&self.path);
        match body(&mut txn) {
            Ok(value) => {
                txn.commit().map_err(|err| E::from(RepoError::from(err)))?;
                Ok(value)
            }
            Err(err) => {
                warn!(
                    "abort transaction on {:?}, {} staged changes dropped",
                    self.path.display(),
                    txn.staged_removals().len()
                );
                Err(err)
            }
        }
    }

    /// Read repository configuration.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::ReadConfig`] if config file cannot be read.
    /// - Return [`RepoError::KeyFile`] if config file is malformed.
    pub fn read_config(&self) -> Result<KeyFile> {
        let path = self.config_path();
        let data = fs::read_to_string(&path)
            .map_err(|err| RepoError::ReadConfig { source: err, path })?;

        Ok(data.parse()?)
    }

    /// Replace repository configuration.
    ///
    /// The new contents are written to a temporary file that is synced and
    /// then renamed over the old config, so readers see either the old or
    /// the new config in full.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::WriteConfig`] if config file cannot be replaced.
    #[instrument(skip(self, config), level = "debug")]
    pub fn write_config(&self, config: &KeyFile) -> Result<()> {
        let path = self.config_path();
        let tmp_path = self.path.join(".config.tmp");
        let to_error = |err| RepoError::WriteConfig {
            source: err,
            path: path.clone(),
        };

        let mut file = File::create(&tmp_path).map_err(to_error)?;
        file.write_all(config.to_string().as_bytes()).map_err(to_error)?;
        file.sync_all().map_err(to_error)?;
        fs::rename(&tmp_path, &path).map_err(to_error)?;
        debug!("wrote config {:?}", path.display());

        Ok(())
    }

    /// List names of configured remotes in sorted order.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::ReadConfig`] if config file cannot be read.
    /// - Return [`RepoError::KeyFile`] if config file is malformed.
    pub fn list_remotes(&self) -> Result<Vec<String>> {
        let config = self.read_config()?;
        let mut remotes = config
            .groups()
            .filter_map(remote_name)
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        remotes.sort();

        Ok(remotes)
    }

    /// Get raw value of option of remote.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::NoSuchRemote`] if remote is not configured.
    /// - Return [`RepoError::ReadConfig`] if config file cannot be read.
    /// - Return [`RepoError::KeyFile`] if config file is malformed.
    pub fn remote_option(&self, remote: &str, key: &str) -> Result<Option<String>> {
        let config = self.read_config()?;
        let group = remote_group(remote);
        if !config.has_group(&group) {
            return Err(RepoError::NoSuchRemote(remote.into()));
        }

        Ok(config.get(&group, key).map(ToString::to_string))
    }

    /// Get boolean option of remote, where a missing option means `false`.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::NoSuchRemote`] if remote is not configured.
    /// - Return [`RepoError::KeyFile`] if option is not a boolean.
    pub fn remote_bool_option(&self, remote: &str, key: &str) -> Result<bool> {
        let config = self.read_config()?;
        let group = remote_group(remote);
        if !config.has_group(&group) {
            return Err(RepoError::NoSuchRemote(remote.into()));
        }

        Ok(config.get_bool(&group, key)?.unwrap_or(false))
    }

    /// Remove remote from configuration.
    ///
    /// Removing a remote that does not exist is a no-op. Refs fetched from
    /// the remote are left alone, use a [`Transaction`] for those.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::ReadConfig`] if config file cannot be read.
    /// - Return [`RepoError::WriteConfig`] if config file cannot be replaced.
    #[instrument(skip(self), level = "debug")]
    pub fn remove_remote(&self, remote: &str) -> Result<bool> {
        let mut config = self.read_config()?;
        if !config.remove_group(&remote_group(remote)) {
            debug!("remote {remote:?} not configured in {:?}", self.path.display());
            return Ok(false);
        }

        self.write_config(&config)?;
        info!("removed remote {remote:?} from {:?}", self.path.display());

        Ok(true)
    }

    /// List full ref table.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::Refs`] if the ref table cannot be read.
    pub fn list_refs(&self) -> Result<BTreeMap<Refspec, Checksum>> {
        Ok(refs::read_refs(&self.path)?)
    }

    /// Storage mode of repository, e.g., "bare" or "bare-user-only".
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::ReadConfig`] if config file cannot be read.
    /// - Return [`RepoError::KeyFile`] if config file is malformed.
    pub fn mode(&self) -> Result<Option<String>> {
        Ok(self.read_config()?.get(CORE_GROUP, "mode").map(ToString::to_string))
    }

    /// Turn off free space reservation for repository.
    ///
    /// Sets both `core.min-free-space-size` and `core.min-free-space-percent`
    /// to zero, so installs are not refused on nearly full disks.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::ReadConfig`] if config file cannot be read.
    /// - Return [`RepoError::WriteConfig`] if config file cannot be replaced.
    #[instrument(skip(self), level = "debug")]
    pub fn disable_min_free_space(&self) -> Result<()> {
        let mut config = self.read_config()?;
        config.set(CORE_GROUP, "min-free-space-size", "0MB");
        config.set(CORE_GROUP, "min-free-space-percent", "0");
        self.write_config(&config)?;
        info!("disabled free space reservation of {:?}", self.path.display());

        Ok(())
    }

    /// Delete objects that are no longer reachable from any ref.
    ///
    /// Delegates to `ostree prune`, returning its output.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::Syscall`] if `ostree` cannot be run or fails.
    #[instrument(skip(self), level = "debug")]
    pub fn prune(&self) -> Result<String> {
        info!("prune {:?}", self.path.display());
        let repo_arg = format!("--repo={}", self.path.display());
        let output = syscall_non_interactive("ostree", ["prune", repo_arg.as_str(), "--refs-only"])?;
        info!("{output}");

        Ok(output)
    }

    fn config_path(&self) -> PathBuf {
        self.path.join("config")
    }
}

fn syscall_non_interactive(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<String> {
    let output = Command::new(cmd.as_ref())
        .args(args)
        .output()
        .map_err(RepoError::Syscall)?;
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();
    let mut message = String::new();

    if !stdout.is_empty() {
        message.push_str(format!("stdout: {stdout}").as_str());
    }

    if !stderr.is_empty() {
        message.push_str(format!("stderr: {stderr}").as_str());
    }

    // INVARIANT: Chomp trailing newlines.
    let message = message.trim_end_matches(['\r', '\n']).to_string();

    if !output.status.success() {
        return Err(RepoError::Syscall(std::io::Error::other(format!(
            "command {:?} failed:\n{message}",
            cmd.as_ref()
        ))));
    }

    Ok(message)
}

/// All possible error types for repository interaction.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Repository path cannot be resolved.
    #[error("failed to resolve repository path {:?}", path.display())]
    Resolve {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Path does not hold a repository.
    #[error("no repository at {:?}", .0.display())]
    NotARepo(PathBuf),

    /// Repository config cannot be read.
    #[error("failed to read repository config {:?}", path.display())]
    ReadConfig {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Repository config cannot be written.
    #[error("failed to write repository config {:?}", path.display())]
    WriteConfig {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Remote is not configured.
    #[error("remote {0:?} not found")]
    NoSuchRemote(String),

    /// Repository config is malformed.
    #[error(transparent)]
    KeyFile(#[from] keyfile::KeyFileError),

    /// Repository lock cannot be acquired.
    #[error(transparent)]
    Lock(#[from] lock::LockError),

    /// Ref table cannot be read.
    #[error(transparent)]
    Refs(#[from] refs::RefError),

    /// Ref transaction cannot be committed.
    #[error(transparent)]
    Transaction(#[from] transaction::TransactionError),

    /// External command fails.
    #[error(transparent)]
    Syscall(std::io::Error),
}

/// Friendly result alias :3
pub type Result<T, E = RepoError> = std::result::Result<T, E>;
