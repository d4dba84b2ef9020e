// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use ostree_split::{
    path::Layout,
    repo::lock::LockKind,
    report::{FailureEvent, FailureSink, LogSink},
    Repo,
};

use anyhow::{Context, Result};
use clap::Parser;
use std::{path::PathBuf, process::exit};
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const TOOL: &str = "ostree-free-space-off";

/// Turn off the free space reservation of an OSTree repository.
#[derive(Debug, Clone, Parser)]
#[command(about, override_usage = "ostree-free-space-off [options]", version)]
struct Cli {
    /// Show debug output.
    #[arg(short, long)]
    pub debug: bool,

    /// Repository to operate on instead of the system OS repository.
    #[arg(short, long, value_name = "path")]
    pub repo: Option<PathBuf>,
}

impl Cli {
    fn run(self) -> Result<()> {
        let path = match self.repo {
            Some(path) => path,
            None => Layout::under("/").os_repo().to_path_buf(),
        };

        let repo = Repo::open(&path)?;
        let _lock = repo.lock(LockKind::Exclusive)?;
        repo.disable_min_free_space()
            .with_context(|| format!("failed to update config of {:?}", path.display()))?;

        Ok(())
    }
}

fn main() {
    let cli = Cli::parse();

    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let default_level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = cli.run() {
        LogSink.record(&FailureEvent::migration(TOOL, &error));
        debug!("{error:?}");
        exit(1);
    }

    exit(0)
}
