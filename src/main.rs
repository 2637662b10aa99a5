// SPDX-License-Identifier: GPL-3.0-only
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::{GlassConfig, GlassId, Settings};
use crate::console::{ConsoleCommand, Reply};
use crate::display::{ControlLoop, LifecycleHandle, StartupPolicy};
use crate::store::{ConfigStore, JsonFileStore, MemoryStore};

#[macro_use]
extern crate tracing;

mod backends;
mod config;
mod console;
mod display;
mod error;
mod store;

#[derive(Parser)]
#[command(name = "looking-glass", version, about = "Virtual display manager")]
struct Cli {
    /// Directory holding glass_configs.json and settings.json
    #[arg(long, global = true, value_name = "DIR")]
    config_dir: Option<PathBuf>,
    /// Keep everything in memory; nothing is read from or written to disk
    #[arg(long, global = true, conflicts_with = "config_dir")]
    ephemeral: bool,
    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the display manager (default)
    Run(RunArgs),
    /// List display entries
    List,
    /// Add a display entry
    Add {
        #[arg(long)]
        name: Option<String>,
    },
    /// Delete a display entry
    Delete { id: GlassId },
    /// Show or change settings
    Settings {
        /// Unregister displays automatically after the delay
        #[arg(long, value_name = "on|off")]
        auto_expiry: Option<Toggle>,
        /// Automatic unregister delay in seconds
        #[arg(long, value_name = "SECS")]
        delay: Option<f64>,
    },
}

#[derive(Args, Default)]
struct RunArgs {
    /// Start with every display unregistered instead of restoring the last run
    #[arg(long)]
    no_restore: bool,
    /// Register a display on start
    #[arg(long, value_name = "ID")]
    register: Vec<GlassId>,
    /// Register and activate a display on start
    #[arg(long, value_name = "ID")]
    activate: Vec<GlassId>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

fn setup_logs() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    // stdout belongs to the console
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new(format!(
        "warn,{}=info",
        env!("CARGO_CRATE_NAME")
    )));

    let registry = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer);

    #[cfg(feature = "journald")]
    registry.with(tracing_journald::layer().ok()).init();
    #[cfg(not(feature = "journald"))]
    registry.init();
}

fn open_store(cli: &Cli) -> Box<dyn ConfigStore> {
    if cli.ephemeral {
        info!("Using in-memory configuration");
        return Box::new(MemoryStore::new(Vec::new(), Settings::default()));
    }
    let store = match &cli.config_dir {
        Some(dir) => JsonFileStore::new(dir),
        None => JsonFileStore::in_config_dir(),
    };
    debug!("Configuration directory {:?}", store.dir());
    Box::new(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logs();

    let cli = Cli::parse();
    let mut store = open_store(&cli);

    match cli.command {
        None => run(store, RunArgs::default()).await,
        Some(Cmd::Run(args)) => run(store, args).await,
        Some(Cmd::List) => list(store.as_ref()),
        Some(Cmd::Add { name }) => add(store.as_mut(), name),
        Some(Cmd::Delete { id }) => delete(store.as_mut(), &id),
        Some(Cmd::Settings { auto_expiry, delay }) => {
            settings(store.as_mut(), auto_expiry, delay)
        }
    }
}

async fn run(store: Box<dyn ConfigStore>, args: RunArgs) -> Result<()> {
    let policy = if args.no_restore {
        StartupPolicy::Reset
    } else {
        StartupPolicy::Restore
    };
    let (control, handle) = ControlLoop::new(store, backends::headless::backend(), policy);
    let task = control.spawn();

    let startup = args
        .register
        .into_iter()
        .map(ConsoleCommand::Register)
        .chain(args.activate.into_iter().map(ConsoleCommand::Activate))
        .chain(std::iter::once(ConsoleCommand::List));
    for command in startup {
        respond(&handle, command).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for interrupt")?;
                break;
            }
            line = lines.next_line() => match line.context("failed to read stdin")? {
                Some(line) => match console::parse(&line) {
                    Ok(Some(command)) => {
                        if !respond(&handle, command).await {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => eprintln!("{err:#}"),
                },
                None => {
                    // No console attached, keep serving until interrupted
                    tokio::signal::ctrl_c()
                        .await
                        .context("failed to listen for interrupt")?;
                    break;
                }
            },
        }
    }

    info!("Shutting down");
    handle
        .shutdown()
        .await
        .context("failed to shut down the control loop")?;
    task.await.context("control loop panicked")?;
    Ok(())
}

/// Run one console command and print its outcome. Returns false on quit.
async fn respond(handle: &LifecycleHandle, command: ConsoleCommand) -> bool {
    match console::execute(handle, command).await {
        Ok(Reply::Text(text)) => println!("{text}"),
        Ok(Reply::Quit) => return false,
        Err(err) => eprintln!("error: {err:#}"),
    }
    true
}

fn list(store: &dyn ConfigStore) -> Result<()> {
    let configs = store.load().context("failed to load display entries")?;
    if configs.is_empty() {
        println!("no display entries");
    }
    for config in configs {
        let mode = config
            .display_config
            .display_modes
            .first()
            .map(|m| format!("{}x{}@{}", m.width_pixels, m.height_pixels, m.refresh_rate_hz))
            .unwrap_or_default();
        let flags = match (config.registered, config.active) {
            (_, true) => "active",
            (true, false) => "registered",
            _ => "",
        };
        println!(
            "{:<24} {:<12} {:<16} {}",
            config.id,
            flags,
            mode,
            config.window_title(None)
        );
    }
    Ok(())
}

fn add(store: &mut dyn ConfigStore, name: Option<String>) -> Result<()> {
    let mut configs = store.load().context("failed to load display entries")?;
    let config = GlassConfig::new_display(name);
    println!("{}", config.id);
    configs.push(config);
    store.save(&configs).context("failed to save display entries")?;
    Ok(())
}

fn delete(store: &mut dyn ConfigStore, id: &str) -> Result<()> {
    let mut configs = store.load().context("failed to load display entries")?;
    config::remove_config(&mut configs, id).ok_or_else(|| anyhow!("no display entry {id}"))?;
    config::ensure_not_empty(&mut configs);
    store.save(&configs).context("failed to save display entries")?;
    Ok(())
}

fn settings(
    store: &mut dyn ConfigStore,
    auto_expiry: Option<Toggle>,
    delay: Option<f64>,
) -> Result<()> {
    let mut settings = store.load_settings().context("failed to load settings")?;
    if auto_expiry.is_some() || delay.is_some() {
        if let Some(toggle) = auto_expiry {
            settings.automatic_unregister_enabled = matches!(toggle, Toggle::On);
        }
        if let Some(delay) = delay {
            settings.automatic_unregister_delay_in_seconds = delay;
        }
        settings.validate()?;
        store
            .save_settings(&settings)
            .context("failed to save settings")?;
    }
    println!(
        "automatic unregister: {}\ndelay: {}s",
        if settings.automatic_unregister_enabled { "on" } else { "off" },
        settings.automatic_unregister_delay_in_seconds
    );
    Ok(())
}
