// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Split a combined OSTree repository into an OS repository and a Flatpak
//! repository.
//!
//! Older systems keep OS content and Flatpak content in one repository, with
//! the Flatpak repository path symlinked to the OS repository. This crate
//! moves such a system to two independent repositories without ever leaving
//! either path unusable, and without copying object data.
//!
//! The entry point is [`split::Splitter`]. Everything it builds on is exposed
//! too:
//!
//! - [`repo`]: minimal repository access, locking, and ref transactions.
//! - [`clone`]: cheap hard-link duplication of a repository tree.
//! - [`classify`]: sorting of remotes and refs into OS and Flatpak content.
//! - [`swap`]: atomic replacement of a symlink by a real directory.

pub mod classify;
pub mod clone;
pub mod config;
pub mod path;
pub mod repo;
pub mod report;
pub mod split;
pub mod swap;

pub use repo::{Repo, RepoError};
pub use split::{SplitError, SplitOptions, SplitState, Splitter};
