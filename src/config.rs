// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the optional settings file read by the splitting
//! tool. Every field has a default that matches a stock system, so the tool
//! runs without any settings file at all. The file is TOML:
//!
//! ```toml
//! [layout]
//! sysroot = "$SYSROOT"
//! os_repo = "ostree/repo"
//! flatpak_dir = "var/lib/flatpak"
//!
//! [split]
//! os_remote_option = "xa.disable"
//! flatpak_repo_mode = "bare-user-only"
//! ```
//!
//! Layout paths are relative to the sysroot, which may use shell expansion.

use crate::{classify::DEFAULT_OS_REMOTE_OPTION, path::Layout};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Storage mode for the split-out Flatpak repository.
pub const DEFAULT_FLATPAK_REPO_MODE: &str = "bare-user-only";

/// Settings for the splitting tool.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Where things live on disk.
    pub layout: LayoutSettings,

    /// How content gets split.
    pub split: SplitSettings,
}

impl Settings {
    /// Load settings from file at `path`.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file is malformed.
    /// - Return [`ConfigError::ShellExpansion`] if sysroot cannot be
    ///   expanded.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref()).map_err(|err| ConfigError::Read {
            source: err,
            path: path.as_ref().to_path_buf(),
        })?;

        data.parse()
    }

    /// Concrete system layout described by settings.
    pub fn layout(&self) -> Layout {
        let sysroot = &self.layout.sysroot;
        Layout::new(
            sysroot.join(&self.layout.os_repo),
            sysroot.join(&self.layout.flatpak_dir),
        )
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: Settings = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on sysroot field.
        settings.layout.sysroot = PathBuf::from(
            shellexpand::full(settings.layout.sysroot.to_string_lossy().as_ref())
                .map_err(ConfigError::ShellExpansion)?
                .into_owned(),
        );

        Ok(settings)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// On-disk locations.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LayoutSettings {
    /// Root of the system to operate on.
    pub sysroot: PathBuf,

    /// OS repository, relative to sysroot.
    pub os_repo: PathBuf,

    /// Flatpak data directory, relative to sysroot.
    pub flatpak_dir: PathBuf,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            sysroot: PathBuf::from("/"),
            os_repo: PathBuf::from("ostree/repo"),
            flatpak_dir: PathBuf::from("var/lib/flatpak"),
        }
    }
}

/// Content split rules.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SplitSettings {
    /// Boolean remote option marking remotes that serve OS content.
    pub os_remote_option: String,

    /// Storage mode to give the split-out Flatpak repository.
    pub flatpak_repo_mode: String,
}

impl Default for SplitSettings {
    fn default() -> Self {
        Self {
            os_remote_option: DEFAULT_OS_REMOTE_OPTION.into(),
            flatpak_repo_mode: DEFAULT_FLATPAK_REPO_MODE.into(),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read settings file.
    #[error("failed to read settings from {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("SYSROOT", "/sysroot")])]
    fn deserialize_settings() -> anyhow::Result<()> {
        let result: Settings = r#"
            [layout]
            sysroot = "$SYSROOT"
            flatpak_dir = "ostree/deploy/eos/var/lib/flatpak"

            [split]
            os_remote_option = "xa.os"
        "#
        .parse()?;

        let expect = Settings {
            layout: LayoutSettings {
                sysroot: PathBuf::from("/sysroot"),
                os_repo: PathBuf::from("ostree/repo"),
                flatpak_dir: PathBuf::from("ostree/deploy/eos/var/lib/flatpak"),
            },
            split: SplitSettings {
                os_remote_option: "xa.os".into(),
                flatpak_repo_mode: "bare-user-only".into(),
            },
        };
        assert_eq!(result, expect);
        assert_eq!(
            result.layout(),
            Layout::new(
                "/sysroot/ostree/repo",
                "/sysroot/ostree/deploy/eos/var/lib/flatpak"
            )
        );

        Ok(())
    }

    #[test]
    fn empty_settings_use_defaults() -> anyhow::Result<()> {
        let result: Settings = "".parse()?;
        assert_eq!(result, Settings::default());
        assert_eq!(result.layout(), Layout::under("/"));

        Ok(())
    }

    #[test]
    fn serialize_settings() {
        let result = Settings::default().to_string();
        let expect = indoc! {r#"
            [layout]
            sysroot = "/"
            os_repo = "ostree/repo"
            flatpak_dir = "var/lib/flatpak"

            [split]
            os_remote_option = "xa.disable"
            flatpak_repo_mode = "bare-user-only"
        "#};

        assert_eq!(result, expect);
    }
}
