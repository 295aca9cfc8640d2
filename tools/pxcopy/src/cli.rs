// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Command-line front end for `pxcopy`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use proxy::{ProxyConfig, Registry};

use crate::{exchange_files, CopyError, Endpoints};

/// Exchanges two files through one proxy instance.
#[derive(Debug, Parser)]
#[command(name = "pxcopy", version, about)]
pub struct Args {
    /// File the east peer sends.
    #[arg(long)]
    pub east_in: PathBuf,
    /// Where the east peer stores what it receives.
    #[arg(long)]
    pub east_out: PathBuf,
    /// File the west peer sends.
    #[arg(long)]
    pub west_in: PathBuf,
    /// Where the west peer stores what it receives.
    #[arg(long)]
    pub west_out: PathBuf,
    /// Instance (minor number) to connect both peers to.
    #[arg(long, default_value_t = 0)]
    pub instance: usize,
    /// Configuration file; falls back to `PROXY_CONFIG`, then the defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Overrides the configured direction buffer size.
    #[arg(long)]
    pub buffer_size: Option<usize>,
}

impl Args {
    /// Resolves the effective configuration.
    pub fn config(&self) -> Result<ProxyConfig, CopyError> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::load(path)?,
            None => ProxyConfig::from_env()?,
        };
        if let Some(buffer_size) = self.buffer_size {
            config.buffer_size = buffer_size;
        }
        Ok(config)
    }
}

/// Runs one exchange and returns the summary line.
pub fn execute(args: &Args) -> Result<String, CopyError> {
    let registry = Arc::new(Registry::new(args.config()?)?);
    let east = Endpoints { input: args.east_in.clone(), output: args.east_out.clone() };
    let west = Endpoints { input: args.west_in.clone(), output: args.west_out.clone() };
    let (e, w) = exchange_files(&registry, args.instance, &east, &west)?;
    if let Ok(registry) = Arc::try_unwrap(registry) {
        registry.shutdown();
    }
    Ok(format!(
        "east sent {} received {}; west sent {} received {}",
        e.sent, e.received, w.sent, w.received
    ))
}

/// Parses `std::env::args`, installs the logger and prints the execution result.
pub fn run() -> std::process::ExitCode {
    let args = Args::parse();
    let filter = match args.config() {
        Ok(config) => config.log_filter(),
        Err(err) => {
            eprintln!("pxcopy: {err}");
            return std::process::ExitCode::FAILURE;
        }
    };
    env_logger::Builder::new().filter_level(filter).parse_default_env().init();

    match execute(&args) {
        Ok(summary) => {
            println!("{summary}");
            std::process::ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("pxcopy: {err}");
            eprintln!("pxcopy: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}
