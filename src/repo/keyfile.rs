// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository configuration layout.
//!
//! OSTree stores repository configuration in a single `config` file at the
//! top-level of the repository. The file uses the GKeyFile format, i.e., a
//! simple INI dialect made up of `[group]` headers followed by `key=value`
//! lines. Settings for the repository itself live in the `core` group, and
//! every remote gets its own group named `remote "NAME"`.
//!
//! # Example
//!
//! ```text
//! [core]
//! repo_version=1
//! mode=bare
//!
//! [remote "flathub"]
//! url=https://dl.flathub.org/repo/
//! xa.disable=false
//! ```
//!
//! Comments and blank lines are kept as-is so rewriting the file after a small
//! edit does not churn unrelated lines. Values are stored verbatim; escape
//! sequences are never interpreted, because nothing we read or write needs
//! them.

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

/// Name of the group holding repository-wide settings.
pub const CORE_GROUP: &str = "core";

/// Parsed repository configuration file.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct KeyFile {
    preamble: Vec<String>,
    groups: Vec<Group>,
}

#[derive(Debug, PartialEq, Eq, Clone)]
struct Group {
    name: String,
    lines: Vec<Line>,
}

#[derive(Debug, PartialEq, Eq, Clone)]
enum Line {
    Entry { key: String, value: String },
    Verbatim(String),
}

impl KeyFile {
    /// Construct new empty key file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Iterate through group names in file order.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|group| group.name.as_str())
    }

    /// Check if group exists.
    pub fn has_group(&self, group: &str) -> bool {
        self.find_group(group).is_some()
    }

    /// Get raw value of key in group.
    pub fn get(&self, group: &str, key: &str) -> Option<&str> {
        self.find_group(group)?
            .lines
            .iter()
            .find_map(|line| match line {
                Line::Entry { key: k, value } if k == key => Some(value.as_str()),
                _ => None,
            })
    }

    /// Get value of key in group as a boolean.
    ///
    /// Accepts the same spellings GLib does: "true", "false", "1", and "0".
    ///
    /// # Errors
    ///
    /// - Return [`KeyFileError::InvalidBool`] if value is not a boolean.
    pub fn get_bool(&self, group: &str, key: &str) -> Result<Option<bool>> {
        let Some(value) = self.get(group, key) else {
            return Ok(None);
        };

        match value {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" => Ok(Some(false)),
            _ => Err(KeyFileError::InvalidBool {
                group: group.into(),
                key: key.into(),
                value: value.into(),
            }),
        }
    }

    /// Get value of key in group as an integer.
    ///
    /// # Errors
    ///
    /// - Return [`KeyFileError::InvalidInt`] if value is not an integer.
    pub fn get_int(&self, group: &str, key: &str) -> Result<Option<i64>> {
        let Some(value) = self.get(group, key) else {
            return Ok(None);
        };

        value
            .parse::<i64>()
            .map(Some)
            .map_err(|_| KeyFileError::InvalidInt {
                group: group.into(),
                key: key.into(),
                value: value.into(),
            })
    }

    /// Set key in group to value.
    ///
    /// Overwrites existing key in place. Otherwise appends key after the last
    /// entry of the group, creating the group at the end of the file if it is
    /// missing.
    pub fn set(&mut self, group: &str, key: &str, value: impl Into<String>) {
        let value = value.into();
        let index = match self.groups.iter().position(|g| g.name == group) {
            Some(index) => index,
            None => self.push_group(group),
        };
        let lines = &mut self.groups[index].lines;

        for line in lines.iter_mut() {
            if let Line::Entry { key: k, value: v } = line {
                if k == key {
                    *v = value;
                    return;
                }
            }
        }

        let at = lines
            .iter()
            .rposition(|line| matches!(line, Line::Entry { .. }))
            .map(|pos| pos + 1)
            .unwrap_or(0);
        lines.insert(
            at,
            Line::Entry {
                key: key.into(),
                value,
            },
        );
    }

    /// Remove entire group.
    ///
    /// Returns `false` if there was nothing to remove.
    pub fn remove_group(&mut self, group: &str) -> bool {
        let before = self.groups.len();
        self.groups.retain(|g| g.name != group);
        before != self.groups.len()
    }

    fn find_group(&self, group: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == group)
    }

    fn push_group(&mut self, group: &str) -> usize {
        // INVARIANT: Keep a blank line between groups.
        if let Some(last) = self.groups.last_mut() {
            if !matches!(last.lines.last(), Some(Line::Verbatim(line)) if line.trim().is_empty()) {
                last.lines.push(Line::Verbatim(String::new()));
            }
        }

        self.groups.push(Group {
            name: group.into(),
            lines: Vec::new(),
        });
        self.groups.len() - 1
    }
}

/// Name of the group that holds the options of a remote.
pub fn remote_group(remote: &str) -> String {
    format!("remote \"{remote}\"")
}

/// Extract remote name out of a remote group name.
pub fn remote_name(group: &str) -> Option<&str> {
    group.strip_prefix("remote \"")?.strip_suffix('"')
}

impl FromStr for KeyFile {
    type Err = KeyFileError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut keyfile = KeyFile::new();

        for (index, raw) in data.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                match keyfile.groups.last_mut() {
                    Some(group) => group.lines.push(Line::Verbatim(raw.into())),
                    None => keyfile.preamble.push(raw.into()),
                }
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                keyfile.groups.push(Group {
                    name: name.into(),
                    lines: Vec::new(),
                });
                continue;
            }

            let (Some(group), Some((key, value))) = (keyfile.groups.last_mut(), line.split_once('='))
            else {
                return Err(KeyFileError::Syntax {
                    line: index + 1,
                    content: raw.into(),
                });
            };

            group.lines.push(Line::Entry {
                key: key.trim().into(),
                value: value.trim().into(),
            });
        }

        Ok(keyfile)
    }
}

impl Display for KeyFile {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for line in &self.preamble {
            writeln!(fmt, "{line}")?;
        }

        for group in &self.groups {
            writeln!(fmt, "[{}]", group.name)?;
            for line in &group.lines {
                match line {
                    Line::Entry { key, value } => writeln!(fmt, "{key}={value}")?,
                    Line::Verbatim(line) => writeln!(fmt, "{line}")?,
                }
            }
        }

        Ok(())
    }
}

/// Key file error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum KeyFileError {
    /// Line is neither a group header, an entry, nor a comment.
    #[error("invalid key file syntax at line {line}: {content:?}")]
    Syntax { line: usize, content: String },

    /// Value cannot be read as a boolean.
    #[error("key {key:?} of group [{group}] is not a boolean: {value:?}")]
    InvalidBool {
        group: String,
        key: String,
        value: String,
    },

    /// Value cannot be read as an integer.
    #[error("key {key:?} of group [{group}] is not an integer: {value:?}")]
    InvalidInt {
        group: String,
        key: String,
        value: String,
    },
}

/// Friendly result alias :3
type Result<T, E = KeyFileError> = std::result::Result<T, E>;
