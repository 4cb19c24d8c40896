//! Thin command-line front-end over the resolver/store/build engine.
//!
//! Per the core's own scoping, the CLI is an external collaborator invoked
//! through narrow interfaces: it parses arguments, wires up configuration,
//! and hands off to the library crates for everything that actually matters
//! (resolution, storage, checks, command construction, plan execution). It
//! does not itself know how dependency resolution or the build DAG work.

mod commands;
mod probe;

use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use pm_diagnostics::PmError;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pm", version, about = "Package resolver and native build driver", propagate_version = true)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug, Clone)]
struct GlobalOptions {
    /// Override the content-addressed store root (defaults to the
    /// platform data directory, or `pm.toml`/`PM_STORE_ROOT`).
    #[arg(long, global = true)]
    store_root: Option<PathBuf>,

    /// Override the remote package index base URL.
    #[arg(long, global = true)]
    index_url: Option<String>,

    /// Increase log verbosity; repeat for more (`-v`, `-vv`, `-vvv`).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve and install a set of package requests (`path` or `path@range`).
    Install {
        #[arg(required = true)]
        requests: Vec<String>,
    },
    /// List package paths and cached versions known to the local index.
    Tree {
        /// Substring filter over package paths; lists everything if omitted.
        pattern: Option<String>,
    },
    /// Remove installed packages whose path matches a regular expression.
    Clean {
        filter: String,
        /// Also remove packages that depend on a matched package.
        #[arg(long)]
        cascade: bool,
    },
    /// Redirect a package path/version onto a local source directory.
    Override {
        /// `path@version` of the package to override.
        request: String,
        /// Local source directory to use instead of the installed package.
        dir: PathBuf,
    },
    /// Load a build-description plug-in and build its targets.
    Build {
        /// Path to the dynamically loaded build-description module.
        plugin: PathBuf,
        #[arg(long)]
        release: bool,
        #[arg(long)]
        jobs: Option<usize>,
    },
    /// Load a build-description plug-in and run its checks only.
    Check {
        plugin: PathBuf,
        #[arg(long)]
        release: bool,
    },
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.global.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn")))
        .without_time()
        .init();
    pm_diagnostics::setup();

    let cwd = std::env::current_dir().into_diagnostic()?;
    let mut config = pm_config::Config::load(&cwd).map_err(|e| PmError::filesystem(e.to_string()))?;
    config.verbosity = cli.global.verbose;
    if let Some(root) = cli.global.store_root {
        config.store_root = root;
    }
    if let Some(url) = cli.global.index_url {
        config.index_url = url;
    }

    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;

    match cli.command {
        Commands::Install { requests } => runtime.block_on(commands::install(&config, requests)),
        Commands::Tree { pattern } => commands::tree(&config, pattern),
        Commands::Clean { filter, cascade } => commands::clean(&config, &filter, cascade),
        Commands::Override { request, dir } => commands::override_package(&config, &request, dir),
        Commands::Build { plugin, release, jobs } => commands::build(&config, plugin, release, jobs),
        Commands::Check { plugin, release } => commands::check(&config, plugin, release),
    }
}
