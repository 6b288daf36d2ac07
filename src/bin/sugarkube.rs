// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use sugarkube::{
    config::Settings,
    manifest::{parse_manifests, validate_manifests},
    path::{default_cache_dir, default_config_path},
    Cacher,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::MultiProgress;
use std::{io::IsTerminal, path::PathBuf, process::exit};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  sugarkube [options] <sugarkube-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        match self.command {
            Command::Cache(opts) => run_cache(opts).await,
            Command::Validate(opts) => run_validate(opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Fetch kapps of manifests into the local cache.
    #[command(override_usage = "sugarkube cache [options] <manifest>...")]
    Cache(CacheOptions),

    /// Check manifests without touching the cache.
    #[command(override_usage = "sugarkube validate <manifest>...")]
    Validate(ValidateOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CacheOptions {
    /// Manifest files, or glob patterns matching them.
    #[arg(required = true, value_name = "manifest")]
    pub manifests: Vec<String>,

    /// Path to settings file.
    #[arg(short, long, value_name = "file")]
    pub config: Option<PathBuf>,

    /// Root directory of the cache, overriding settings.
    #[arg(long, value_name = "dir")]
    pub cache_dir: Option<PathBuf>,

    /// Only create directories, and log what would be fetched and linked.
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ValidateOptions {
    /// Manifest files, or glob patterns matching them.
    #[arg(required = true, value_name = "manifest")]
    pub manifests: Vec<String>,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

async fn run_cache(opts: CacheOptions) -> Result<()> {
    let config_path = match opts.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let settings = Settings::load(&config_path)?;

    let cache_dir = match (opts.cache_dir, settings.cache_dir.as_ref()) {
        (Some(dir), _) => dir,
        (None, Some(dir)) => dir.as_path().to_path_buf(),
        (None, None) => default_cache_dir()?,
    };

    let manifests = parse_manifests(expand_patterns(&opts.manifests)?)?;
    let mut cacher = Cacher::new(&cache_dir)
        .dry_run(opts.dry_run)
        .git_binary(settings.git.binary.as_str())
        .fetch_timeout(settings.git.fetch_timeout());
    if std::io::stderr().is_terminal() {
        cacher = cacher.progress(MultiProgress::new());
    }

    cacher.cache_manifests(&manifests).await?;
    info!(
        "cached {} manifest(s) into {:?}",
        manifests.len(),
        cache_dir.display()
    );

    Ok(())
}

fn run_validate(opts: ValidateOptions) -> Result<()> {
    let manifests = parse_manifests(expand_patterns(&opts.manifests)?)?;
    validate_manifests(&manifests)?;
    for manifest in &manifests {
        info!("{} ({}) is valid", manifest.id, manifest.uri);
    }

    Ok(())
}

// A pattern matching nothing is kept as a literal path, so that a missing
// manifest is reported as such.
fn expand_patterns(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        let mut matches = glob::glob(pattern)
            .with_context(|| format!("invalid manifest pattern {pattern:?}"))?
            .collect::<Result<Vec<_>, _>>()?;

        if matches.is_empty() {
            paths.push(PathBuf::from(pattern));
        } else {
            matches.sort();
            paths.append(&mut matches);
        }
    }

    Ok(paths)
}
