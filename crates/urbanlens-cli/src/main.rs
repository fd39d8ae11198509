//! UrbanLens CLI - cached, authenticated reads against the UrbanLens backend.
//!
//! Shows cached data immediately, then refreshes it from the network, the
//! same way the dashboards do.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use urbanlens_core::config::{FileConfig, TokenStoreKind};
use urbanlens_core::{
    ApiClient, CachedFetchClient, Config, ConfigOverrides, FileTokenStore, KeyringTokenStore,
    Subscription, TokenStore, ViewStatus,
};

/// Log file name prefix inside `--log-dir`
const LOG_FILE_PREFIX: &str = "urbanlens.log";

#[derive(Parser, Debug)]
#[command(name = "urbanlens", version, about = "Cached reads against the UrbanLens backend API")]
struct Cli {
    /// Backend base URL (overrides URBANLENS_API_URL and the config file)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Cache directory (defaults to the platform cache dir)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Also write logs to a daily-rolling file in this directory
    #[arg(long, global = true, env = "URBANLENS_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch one or more endpoints, serving cache first
    Get {
        #[arg(required = true)]
        endpoints: Vec<String>,

        /// Issue a second background refresh after the first fetch settles
        #[arg(long)]
        revalidate: bool,
    },
    /// Inspect or clear the local cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Store a bearer token for later requests
    Login { token: String },
    /// Forget the stored bearer token
    Logout,
    /// Print the resolved configuration
    Config {
        /// Write the resolved base URL to the config file
        #[arg(long)]
        save: bool,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Show the stored entry for an endpoint without touching the network
    Show { endpoint: String },
    /// Clear one endpoint, or everything when none is given
    Clear { endpoint: Option<String> },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn open_token_store(config: &Config) -> Arc<dyn TokenStore> {
    match config.token_store {
        TokenStoreKind::File => Arc::new(FileTokenStore::open(&config.cache_dir)),
        TokenStoreKind::Keyring => Arc::new(KeyringTokenStore::new(config.keyring_account.clone())),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_ref());

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::resolve(ConfigOverrides {
        api_base_url: cli.api_url,
        cache_dir: cli.cache_dir,
    })?;
    debug!(?config, "Configuration resolved");

    let tokens = open_token_store(&config);

    match cli.command {
        Command::Login { token } => {
            tokens.set_token(token.trim()).context("Failed to store token")?;
            info!("Token stored");
            eprintln!("Signed in.");
            Ok(ExitCode::SUCCESS)
        }
        Command::Logout => {
            tokens.clear().context("Failed to clear token")?;
            eprintln!("Signed out.");
            Ok(ExitCode::SUCCESS)
        }
        Command::Config { save } => {
            if save {
                let mut file = FileConfig::load()?;
                file.api_base_url = Some(config.api_base_url.clone());
                let path = file.save().context("Failed to save config")?;
                eprintln!("Saved {}", path.display());
            }
            println!("api_base_url      = {}", config.api_base_url);
            println!("cache_dir         = {}", config.cache_dir.display());
            println!("cache_ttl         = {}s", config.cache_ttl.as_secs());
            println!("request_timeout   = {}s", config.request_timeout.as_secs());
            println!("max_retries       = {}", config.max_retries);
            println!("retry_backoff     = {}ms", config.retry_backoff.as_millis());
            println!("coalesce_requests = {}", config.coalesce_requests);
            println!("token_store       = {:?}", config.token_store);
            println!("signed_in         = {}", tokens.is_authenticated());
            Ok(ExitCode::SUCCESS)
        }
        Command::Cache { action } => {
            let client = build_client(&config, tokens)?;
            cache_command(&client, action)
        }
        Command::Get { endpoints, revalidate } => {
            let client = build_client(&config, tokens)?;
            get_command(&client, &endpoints, revalidate).await
        }
    }
}

fn build_client(config: &Config, tokens: Arc<dyn TokenStore>) -> Result<CachedFetchClient> {
    let api = ApiClient::from_config(config, tokens).context("Failed to create API client")?;
    CachedFetchClient::from_config(config, api).context("Failed to open cache")
}

fn cache_command(client: &CachedFetchClient, action: CacheAction) -> Result<ExitCode> {
    let store = client.store();
    match action {
        CacheAction::Show { endpoint } => {
            let key = client.resolve_key(&endpoint);
            match store.get(&key) {
                Some(entry) => {
                    let freshness = if store.is_fresh(&entry) { "fresh" } else { "stale" };
                    eprintln!("{} ({}, {})", key, entry.age_display(store.now()), freshness);
                    println!("{}", serde_json::to_string_pretty(&entry.data)?);
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("{}: not cached", key);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        CacheAction::Clear { endpoint } => {
            match endpoint {
                Some(endpoint) => {
                    let key = client.resolve_key(&endpoint);
                    store.clear(Some(&key));
                    eprintln!("Cleared {}", key);
                }
                None => {
                    store.clear(None);
                    eprintln!("Cache cleared");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Print what a view would render before the network answers.
fn report_initial(sub: &Subscription<Value>, client: &CachedFetchClient) {
    let key = sub.key().unwrap_or_default();
    let state = sub.snapshot();
    let store = client.store();
    match (state.status(), store.get(key)) {
        (ViewStatus::Loading, None) => eprintln!("{}: loading...", key),
        (status, Some(entry)) if state.data.is_some() => {
            eprintln!("{}: cached {} ({:?})", key, entry.age_display(store.now()), status);
        }
        (status, _) => eprintln!("{}: {:?}", key, status),
    }
}

async fn get_command(client: &CachedFetchClient, endpoints: &[String], revalidate: bool) -> Result<ExitCode> {
    let subscriptions: Vec<Subscription<Value>> = endpoints
        .iter()
        .map(|endpoint| client.subscribe::<Value>(endpoint))
        .collect();

    for sub in &subscriptions {
        report_initial(sub, client);
    }

    futures::future::join_all(subscriptions.iter().map(|sub| sub.settled())).await;

    if revalidate {
        for sub in &subscriptions {
            sub.revalidate();
        }
        futures::future::join_all(subscriptions.iter().map(|sub| sub.settled())).await;
    }

    let mut failed = false;
    for sub in &subscriptions {
        let key = sub.key().unwrap_or_default();
        let state = sub.snapshot();
        match state.status() {
            ViewStatus::SessionExpired => {
                eprintln!("{}: session expired, run `urbanlens login <token>`", key);
                failed = true;
            }
            ViewStatus::Failed => {
                if let Some(err) = &state.error {
                    eprintln!("{}: couldn't load ({})", key, err);
                }
                failed = true;
            }
            _ => {}
        }
        if let Some(data) = &state.data {
            if subscriptions.len() > 1 {
                println!("# {}", key);
            }
            println!("{}", serde_json::to_string_pretty(data)?);
        }
    }

    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}
