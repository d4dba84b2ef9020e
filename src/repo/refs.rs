// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Ref table handling.
//!
//! OSTree keeps refs as plain files under the `refs/` directory of a
//! repository. Local refs live under `refs/heads/`, and refs fetched from a
//! remote live under `refs/remotes/<remote>/`. Ref names are slash-separated,
//! so every slash becomes a directory level. Each ref file contains the
//! checksum of the commit it points at.

use ignore::WalkBuilder;
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Remote-qualified or local ref name.
///
/// Text form is `remote:ref` for remote refs, or just `ref` for local refs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Refspec {
    remote: Option<String>,
    name: String,
}

impl Refspec {
    /// Construct new refspec.
    pub fn new(remote: Option<impl Into<String>>, name: impl Into<String>) -> Self {
        Self {
            remote: remote.map(Into::into),
            name: name.into(),
        }
    }

    /// Construct new local refspec.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            remote: None,
            name: name.into(),
        }
    }

    /// Construct new remote refspec.
    pub fn remote(remote: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            remote: Some(remote.into()),
            name: name.into(),
        }
    }

    /// Name of remote, if any.
    pub fn remote_name(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    /// Local ref name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First slash-delimited segment of the ref name.
    pub fn prefix(&self) -> &str {
        self.name.split('/').next().unwrap_or_default()
    }

    /// Location of the ref file relative to the repository root.
    pub(crate) fn relative_path(&self) -> PathBuf {
        let base = match &self.remote {
            Some(remote) => Path::new("refs").join("remotes").join(remote),
            None => Path::new("refs").join("heads"),
        };
        self.name.split('/').fold(base, |path, segment| path.join(segment))
    }
}

impl Display for Refspec {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match &self.remote {
            Some(remote) => write!(fmt, "{remote}:{}", self.name),
            None => fmt.write_str(&self.name),
        }
    }
}

impl FromStr for Refspec {
    type Err = RefError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let (remote, name) = match data.split_once(':') {
            Some((remote, name)) => (Some(remote), name),
            None => (None, data),
        };

        let valid_name = !name.is_empty()
            && name
                .split('/')
                .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
        let valid_remote = remote.is_none_or(|r| !r.is_empty() && !r.contains('/'));
        if !valid_name || !valid_remote {
            return Err(RefError::InvalidRefspec(data.into()));
        }

        Ok(Self::new(remote, name))
    }
}

/// Commit checksum a ref points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum(String);

impl FromStr for Checksum {
    type Err = RefError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let data = data.trim();
        if data.len() != 64 || !data.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(RefError::InvalidChecksum(data.into()));
        }

        Ok(Self(data.into()))
    }
}

impl Display for Checksum {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.0)
    }
}

/// Read full ref table of repository at `repo_path`.
///
/// # Errors
///
/// - Return [`RefError::Walk`] if the refs directory cannot be traversed.
/// - Return [`RefError::Read`] if a ref file cannot be read.
/// - Return [`RefError::InvalidChecksum`] if a ref file is corrupt.
pub(crate) fn read_refs(repo_path: &Path) -> Result<BTreeMap<Refspec, Checksum>> {
    let mut refs = BTreeMap::new();

    let heads = repo_path.join("refs").join("heads");
    for (name, checksum) in read_ref_dir(&heads)? {
        refs.insert(Refspec::local(name), checksum);
    }

    let remotes = repo_path.join("refs").join("remotes");
    if remotes.is_dir() {
        let entries = fs::read_dir(&remotes).map_err(|err| RefError::Read {
            source: err,
            path: remotes.clone(),
        })?;
        for entry in entries {
            let entry = entry.map_err(|err| RefError::Read {
                source: err,
                path: remotes.clone(),
            })?;
            let remote = entry.file_name().to_string_lossy().into_owned();
            for (name, checksum) in read_ref_dir(&entry.path())? {
                refs.insert(Refspec::remote(remote.clone(), name), checksum);
            }
        }
    }

    Ok(refs)
}

fn read_ref_dir(dir: &Path) -> Result<Vec<(String, Checksum)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut refs = Vec::new();
    let walker = WalkBuilder::new(dir)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_some_and(|kind| kind.is_file()) {
            continue;
        }

        let path = entry.path();
        let Ok(relative) = path.strip_prefix(dir) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let content = fs::read_to_string(path).map_err(|err| RefError::Read {
            source: err,
            path: path.to_path_buf(),
        })?;
        refs.push((name, content.parse()?));
    }

    Ok(refs)
}

/// Ref table error types.
#[derive(Debug, thiserror::Error)]
pub enum RefError {
    /// Refspec text is malformed.
    #[error("invalid refspec {0:?}")]
    InvalidRefspec(String),

    /// Ref file does not hold a commit checksum.
    #[error("invalid commit checksum {0:?}")]
    InvalidChecksum(String),

    /// Ref file or directory cannot be read.
    #[error("failed to read ref at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Ref directory cannot be traversed.
    #[error(transparent)]
    Walk(#[from] ignore::Error),
}

/// Friendly result alias :3
type Result<T, E = RefError> = std::result::Result<T, E>;
