use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tabsync::error::{with_retry, RetryPolicy};
use tabsync::remote::{HttpAuthority, OfflineAuthority, SettingsAuthority, StaticToken};
use tabsync::settings::LoadSource;
use tabsync::sync::remote::connect_relay;
use tabsync::{
    logging, server, BroadcastHub, ClientContext, MemoryCache, PersistentCache, SessionSnapshot,
    SettingKey, SettingValue, SettingsStore, SqliteCache, SyncConfig,
};

#[derive(Parser)]
#[command(name = "tabsync")]
#[command(
    about = "Session and settings synchronization across tabs, with a broadcast relay",
    version
)]
struct Cli {
    /// TOML configuration file (TABSYNC_* variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write logs to a daily file in this directory instead of stderr
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the broadcast relay for tabs in separate processes
    Relay {
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },

    /// Read or write settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Run a tab: keep its session in sync until Ctrl-C
    Tab {
        /// Refresh the session at this interval (seconds), as user activity would
        #[arg(long, value_name = "SECS")]
        refresh_every: Option<u64>,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Show one setting, or the whole record
    Get { key: Option<String> },

    /// Change a setting through the authority
    Set { key: String, value: String },

    /// Re-fetch the record from the authority
    Refresh,

    /// Forget the cached record
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = logging::init(cli.verbose, cli.log_dir.as_deref())?;

    let config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)?.with_env_overrides()?,
        None => SyncConfig::from_env()?,
    };

    match cli.command {
        Commands::Relay { port } => {
            println!(
                "{}",
                format!("🌐 Starting relay on port {}...", port).cyan().bold()
            );
            server::start(port).await?;
        }

        Commands::Settings { action } => {
            let store = SettingsStore::new(open_cache(&config)?, open_authority(&config)?);
            run_settings(&store, action).await?;
        }

        Commands::Tab { refresh_every } => run_tab(&config, refresh_every).await?,
    }

    Ok(())
}

async fn run_settings(store: &SettingsStore, action: SettingsAction) -> Result<()> {
    if let SettingsAction::Clear = action {
        store.clear_cache()?;
        println!("{} settings cache cleared", "✓".green());
        return Ok(());
    }

    let source = store.load().await;
    if source != LoadSource::Remote {
        println!(
            "{} authority unreachable, showing {} values",
            "!".yellow(),
            format!("{source:?}").to_lowercase()
        );
    }

    match action {
        SettingsAction::Get { key: Some(key) } => {
            let key: SettingKey = key.parse()?;
            println!("{} = {}", key.as_str().bright_white(), store.get_setting(key));
        }
        SettingsAction::Get { key: None } => print_record(store),
        SettingsAction::Set { key, value } => {
            let key: SettingKey = key.parse()?;
            let value = SettingValue::parse_for(key, &value)?;
            let _sub = store.on_key_changed(key, |event| {
                println!("{} {} {}", "→".bright_blue(), event.name(), event.detail());
            });

            if store.update_setting(key, value).await {
                println!("{} {} = {}", "✓".green(), key, store.get_setting(key));
            } else {
                println!(
                    "{} {} unchanged ({})",
                    "✗".red(),
                    key,
                    store.get_setting(key)
                );
            }
        }
        SettingsAction::Refresh => {
            with_retry(&RetryPolicy::default(), move || store.refresh_settings()).await?;
            print_record(store);
        }
        SettingsAction::Clear => {}
    }

    Ok(())
}

fn print_record(store: &SettingsStore) {
    println!("{}", "Settings".cyan().bold());
    println!("{}", "═".repeat(40).bright_black());
    for key in SettingKey::ALL {
        println!("{:<20} {}", key.as_str().bright_white(), store.get_setting(key));
    }
}

async fn run_tab(config: &SyncConfig, refresh_every: Option<u64>) -> Result<()> {
    let hub = BroadcastHub::new();
    let relay = match &config.relay_url {
        Some(url) => match connect_relay(url, hub.clone(), &config.channel_name).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                println!("{} relay unavailable: {}", "!".yellow(), e);
                None
            }
        },
        None => None,
    };

    let tab = ClientContext::start(
        config,
        open_cache(config)?,
        open_authority(config)?,
        Some(&hub),
    );
    println!(
        "{} tab {} running on channel {}",
        "✓".green(),
        tab.transport().id().to_string().bright_yellow(),
        config.channel_name.bright_white()
    );
    print_session(&tab.session().snapshot());

    let mut changes = tab.session().subscribe();
    let mut refresher = refresh_every.map(|secs| tokio::time::interval(Duration::from_secs(secs)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = *changes.borrow_and_update();
                print_session(&snapshot);
            }
            _ = async {
                match refresher.as_mut() {
                    Some(interval) => { interval.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if !tab.session().refresh_session() {
                    tracing::debug!("Refresh skipped (debounced)");
                }
            }
        }
    }

    if let Some(handle) = relay {
        handle.abort();
    }
    tab.shutdown();
    println!("{}", "Tab closed".bright_black());
    Ok(())
}

fn print_session(snapshot: &SessionSnapshot) {
    let state = if snapshot.expired {
        "expired".red()
    } else {
        "active".green()
    };
    let started = chrono::DateTime::from_timestamp_millis(snapshot.start_time)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| snapshot.start_time.to_string());

    println!(
        "{} session {} (started {})",
        "•".bright_blue(),
        state.bold(),
        started.bright_black()
    );
}

fn open_cache(config: &SyncConfig) -> Result<Arc<dyn PersistentCache>> {
    Ok(match &config.cache_path {
        Some(path) => Arc::new(SqliteCache::open(path)?),
        None => Arc::new(MemoryCache::new()),
    })
}

fn open_authority(config: &SyncConfig) -> Result<Arc<dyn SettingsAuthority>> {
    let Some(url) = &config.remote_url else {
        return Ok(Arc::new(OfflineAuthority));
    };

    let mut authority = HttpAuthority::new(url.clone(), config.request_timeout())
        .context("Failed to build authority client")?;
    if let Ok(token) = std::env::var("TABSYNC_TOKEN") {
        authority = authority.with_token(Arc::new(StaticToken(token)));
    }
    Ok(Arc::new(authority))
}
