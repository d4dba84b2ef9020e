// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Scoped ref transactions.
//!
//! A [`Transaction`] only stages ref mutations. Nothing touches the ref table
//! until the scope that owns the transaction finishes successfully, at which
//! point every staged mutation is applied. Dropping a transaction without
//! committing it discards everything that was staged.

use crate::repo::refs::Refspec;

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Open write transaction on a repository.
#[derive(Debug)]
pub struct Transaction<'repo> {
    repo_path: &'repo Path,
    removals: Vec<Refspec>,
}

impl<'repo> Transaction<'repo> {
    pub(crate) fn new(repo_path: &'repo Path) -> Self {
        Self {
            repo_path,
            removals: Vec::new(),
        }
    }

    /// Stage removal of a ref.
    pub fn remove_ref(&mut self, refspec: &Refspec) {
        debug!("stage removal of {refspec}");
        self.removals.push(refspec.clone());
    }

    /// Stage removal of many refs.
    pub fn remove_refs<'a>(&mut self, refspecs: impl IntoIterator<Item = &'a Refspec>) {
        for refspec in refspecs {
            self.remove_ref(refspec);
        }
    }

    /// Refs currently staged for removal.
    pub fn staged_removals(&self) -> &[Refspec] {
        &self.removals
    }

    /// Apply all staged mutations.
    ///
    /// Returns number of refs actually removed. Refs that are already gone
    /// are skipped.
    ///
    /// # Errors
    ///
    /// - Return [`TransactionError::RemoveRef`] if a ref file cannot be
    ///   removed.
    #[instrument(skip(self), level = "debug")]
    pub(crate) fn commit(self) -> Result<usize> {
        let mut removed = 0;
        for refspec in &self.removals {
            let path = self.repo_path.join(refspec.relative_path());
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("ref {refspec} already removed");
                }
                Err(err) => {
                    return Err(TransactionError::RemoveRef {
                        source: err,
                        refspec: refspec.to_string(),
                        path,
                    });
                }
            }
        }

        debug!(
            "committed transaction on {:?}: {removed} refs removed",
            self.repo_path.display()
        );

        Ok(removed)
    }
}

/// Transaction error types.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// Ref file cannot be removed.
    #[error("failed to remove ref {refspec} at {:?}", path.display())]
    RemoveRef {
        #[source]
        source: std::io::Error,
        refspec: String,
        path: PathBuf,
    },
}

/// Friendly result alias :3
type Result<T, E = TransactionError> = std::result::Result<T, E>;
