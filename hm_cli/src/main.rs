//! hermit CLI - hermetic installs of pinned dependency manifests.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use hm_core::{Error, InstallerConfig};
use hm_io::{CommandBackend, FetchCache, HttpFetcher, Installer};

mod commands;
mod display;

use display::print_error;

#[derive(Parser)]
#[command(name = "hm")]
#[command(about = "hermit - build and install a tool into an isolated environment")]
#[command(version)]
struct Cli {
    /// Installer configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Fetch cache directory [default: $HOME/.cache/hermit]
    #[arg(long, env = "HM_CACHE_DIR", global = true)]
    cache_dir: Option<PathBuf>,

    /// Maximum number of parallel fetches
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Enable debug logging (overridden by HM_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a manifest into a new environment
    Install {
        /// Path to the manifest (JSON)
        manifest: PathBuf,

        /// Environment root to create
        #[arg(long = "env")]
        env: PathBuf,

        /// Skip the post-install smoke test
        #[arg(long)]
        no_smoke_test: bool,
    },

    /// Check a local file against a sha256 digest
    Verify {
        file: PathBuf,
        sha256: String,
    },

    /// Show resources and entry points of an environment
    List {
        env: PathBuf,
    },

    /// Run an installed entry point as a smoke test
    Smoke {
        env: PathBuf,

        entry_point: String,

        /// Arguments for the entry point (default: --help)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Inspect or manage the fetch cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Clone, Copy)]
pub enum CacheAction {
    /// List cached payloads
    List,
    /// Show total cache size
    Size,
    /// Remove every cached payload
    Clear,
    /// Remove leftovers of interrupted fetches
    Cleanup,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        print_error(&e);
        std::process::exit(e.exit_code());
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("HM_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), Error> {
    let config = load_config(cli.config.as_deref(), cli.concurrency)?;

    match cli.command {
        Commands::Install {
            manifest,
            env,
            no_smoke_test,
        } => {
            let installer = create_installer(cli.cache_dir, config)?;
            commands::install::run(&installer, &manifest, &env, !no_smoke_test).await
        }

        Commands::Verify { file, sha256 } => commands::verify::run(&file, &sha256),

        Commands::List { env } => commands::list::run(&env),

        Commands::Smoke {
            env,
            entry_point,
            args,
        } => commands::smoke::run(&env, &entry_point, args, config.smoke_timeout()).await,

        Commands::Cache { action } => {
            let installer = create_installer(cli.cache_dir, config)?;
            commands::cache::run(installer.fetch_cache(), action)
        }
    }
}

/// Defaults, then the config file, then command line flags.
fn load_config(path: Option<&Path>, concurrency: Option<usize>) -> Result<InstallerConfig, Error> {
    let mut config = match path {
        Some(path) => InstallerConfig::load(path)?,
        None => InstallerConfig::default(),
    };
    if let Some(concurrency) = concurrency {
        if concurrency == 0 {
            return Err(Error::validation("--concurrency must be at least 1"));
        }
        config.fetch_concurrency = concurrency;
    }
    Ok(config)
}

fn default_cache_dir() -> Result<PathBuf, Error> {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".cache").join("hermit"))
        .ok_or_else(|| Error::validation("HOME is not set; pass --cache-dir"))
}

fn create_installer(cache_dir: Option<PathBuf>, config: InstallerConfig) -> Result<Installer, Error> {
    let cache_dir = match cache_dir {
        Some(dir) => dir,
        None => default_cache_dir()?,
    };
    debug!(cache_dir = %cache_dir.display(), "using fetch cache");

    let fetcher = Arc::new(HttpFetcher::new(config.fetch_timeout()));
    let cache = FetchCache::new(&cache_dir, fetcher, &config)?;
    let backend = Arc::new(CommandBackend::from_config(&config));
    Ok(Installer::new(Arc::new(cache), backend, config))
}
