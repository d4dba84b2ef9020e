// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use ostree_split::{
    config::Settings,
    report::{FailureEvent, FailureSink, LogSink},
    SplitOptions, Splitter,
};

use anyhow::{Context, Result};
use clap::Parser;
use std::{path::PathBuf, process::exit};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const TOOL: &str = "ostree-split";

/// Split combined OSTree repository into separate OS and Flatpak
/// repositories.
#[derive(Debug, Clone, Parser)]
#[command(about, override_usage = "ostree-split [options]", version)]
struct Cli {
    /// Prune unreachable objects from both repositories afterwards.
    #[arg(long)]
    pub prune: bool,

    /// Show debug output.
    #[arg(short, long)]
    pub debug: bool,

    /// Path to settings file.
    #[arg(short, long, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Root of the system to operate on, overriding settings.
    #[arg(short, long, value_name = "path")]
    pub sysroot: Option<PathBuf>,
}

impl Cli {
    fn run(self) -> Result<()> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        if let Some(sysroot) = self.sysroot {
            settings.layout.sysroot = sysroot;
        }

        let mut options = SplitOptions::from(&settings);
        options.prune = self.prune;

        let splitter = Splitter::new(settings.layout(), options);
        let changed = splitter
            .run()
            .context("failed to split repositories")?;
        if changed {
            info!("repositories split");
        }

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
