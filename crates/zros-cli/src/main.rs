//! `zros` – command line front-end for the ROS ⇄ ZeroMQ bridge.
//!
//! 1. Loads the bridge configuration (`~/.zros/config.toml` unless
//!    `--config` / `ZROS_CONFIG` says otherwise).
//! 2. Connects to the robotics bus through rosbridge, or to an in-process
//!    loopback bus with `--loopback`.
//! 3. Starts every configured channel and drops the operator into a REPL
//!    (`/status`, `/channels`, `/call`, …).
//! 4. Intercepts **Ctrl-C** and shuts the bridge down cleanly.

mod config;
mod repl;
mod telemetry;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{error, warn};
use zros_middleware::{Bridge, BusAdapter, Fabric, LoopbackBus, RosbridgeAdapter, validate_settings};
use zros_types::BridgeSettings;

#[derive(Debug, Parser)]
#[command(name = "zros", version, about = "Bridge a ROS graph onto ZeroMQ sockets")]
struct Cli {
    /// Configuration file (.toml, .json, .yaml).
    #[arg(short, long, global = true, env = "ZROS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the bridge (the default).
    Run {
        /// Use an in-process bus instead of connecting to rosbridge.
        #[arg(long)]
        loopback: bool,
        /// Run until Ctrl-C without the interactive shell.
        #[arg(long)]
        no_repl: bool,
    },
    /// Validate the configuration and list its channels.
    Check,
    /// Write a starter configuration.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print the JSON schema of the configuration file.
    Schema,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(config::config_path);

    match cli.command.unwrap_or(Command::Run { loopback: false, no_repl: false }) {
        Command::Run { loopback, no_repl } => run(&path, loopback, no_repl),
        Command::Check => check(&path),
        Command::Init { force } => init(&path, force),
        Command::Schema => schema(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subcommands
// ─────────────────────────────────────────────────────────────────────────────

fn run(path: &Path, loopback: bool, no_repl: bool) -> ExitCode {
    let _tracing = telemetry::init_tracing("zros");
    print_banner();

    let settings = match config::load_from(path) {
        Ok(Some(settings)) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            settings
        }
        Ok(None) => {
            println!(
                "  {} Run `{}` to create one.",
                format!("No config at {}.", path.display()).yellow(),
                "zros init".bold()
            );
            let mut settings = BridgeSettings::default();
            config::apply_env_overrides(&mut settings);
            settings
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build the tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let bus: Arc<dyn BusAdapter> = if loopback {
        println!("  Bus: {}", "in-process loopback".dimmed());
        Arc::new(LoopbackBus::default())
    } else {
        print!("\n  Connecting to rosbridge at {} … ", settings.rosbridge.url.dimmed());
        match rt.block_on(RosbridgeAdapter::connect(&settings.rosbridge)) {
            Ok(adapter) => {
                println!("{}", "online".green());
                Arc::new(adapter)
            }
            Err(e) => {
                println!("{}", "offline".red());
                println!("  {}  Use `{}` to run without ROS.", e.to_string().dimmed(), "--loopback".bold());
                return ExitCode::FAILURE;
            }
        }
    };

    let bridge = match rt.block_on(Bridge::start(settings, bus, Arc::new(Fabric::new()))) {
        Ok(bridge) => bridge,
        Err(e) => {
            println!("{}: {}", "Bridge failed to start".red(), e);
            return ExitCode::FAILURE;
        }
    };
    println!("  {} {} channel(s) running", "✓".green().bold(), bridge.channels().len());

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting the bridge down …".yellow().bold());
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    if no_repl {
        while !shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(200));
        }
    } else {
        println!();
        println!("  Type {} for a list of commands.\n", "/help".bold().cyan());
        repl::run(&rt, &bridge, path, Arc::clone(&shutdown));
    }

    rt.block_on(bridge.shutdown());
    println!("{}", "  ✓ Bridge stopped.".green());
    ExitCode::SUCCESS
}

fn check(path: &Path) -> ExitCode {
    let settings = match config::load_from(path) {
        Ok(Some(settings)) => settings,
        Ok(None) => {
            println!("{} {}", "No config at".red(), path.display());
            return ExitCode::FAILURE;
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = validate_settings(&settings) {
        println!("{}: {}", "Invalid configuration".red(), e);
        return ExitCode::FAILURE;
    }
    println!("{} {}", "✓ Valid configuration:".green(), path.display().to_string().bold());
    for c in &settings.channels {
        println!("    • {:<16} {:<20} {}", c.key.bold(), c.direction.to_string(), c.bus_name);
    }
    ExitCode::SUCCESS
}

fn init(path: &Path, force: bool) -> ExitCode {
    if path.exists() && !force {
        println!(
            "{} {} (use {} to overwrite)",
            "Config already exists:".yellow(),
            path.display(),
            "--force".bold()
        );
        return ExitCode::FAILURE;
    }
    match config::save_to(&config::sample_settings(), path) {
        Ok(()) => {
            println!("  {} Config saved to {}", "✓".green().bold(), path.display().to_string().bold());
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("{}: {}", "Error saving config".red(), e);
            ExitCode::FAILURE
        }
    }
}

fn schema() -> ExitCode {
    let schema = schemars::schema_for!(BridgeSettings);
    match serde_json::to_string_pretty(&schema) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {}", "Schema error".red(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"  ____ _ __ ___  ___ "#.bold().cyan());
    println!("{}", r#" |_  /| '__/ _ \/ __|"#.bold().cyan());
    println!("{}", r#"  / / | | | (_) \__ \"#.bold().cyan());
    println!("{}", r#" /___||_|  \___/|___/"#.bold().cyan());
    println!();
    println!("  {} {}", "zros".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  ROS ⇄ ZeroMQ bridge");
    println!();
}
