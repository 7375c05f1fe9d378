//! `fleetlockd` – the fleet control-plane daemon.
//!
//! 1. Loads `~/.fleetlock/config.toml`, writing the defaults on first run.
//! 2. Opens the action ledger (a SQLite file, or in-memory when no
//!    `ledger_path` is configured).
//! 3. Starts the background sweeper and the agent/operator gateway.
//! 4. Intercepts **Ctrl-C** to stop the sweeper and exit cleanly.

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use fleetlock_gateway::{Gateway, GatewayServer};
use fleetlock_middleware::EventBus;
use fleetlock_runtime::{ControlPlane, Sweeper, init_tracing};
use fleetlock_store::ActionLedger;
use fleetlock_types::SystemClock;
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    // Held until exit so buffered spans are flushed.
    let _telemetry = init_tracing("fleetlockd");

    print_banner();

    let cfg = load_config();

    // ── Action ledger ─────────────────────────────────────────────────────
    let ledger = match &cfg.ledger_path {
        Some(path) => ActionLedger::open(path),
        None => ActionLedger::open_in_memory(),
    };
    let ledger = match ledger {
        Ok(ledger) => ledger,
        Err(e) => {
            println!("{}: {}", "Ledger error".red(), e);
            error!(error = %e, "could not open action ledger");
            return ExitCode::FAILURE;
        }
    };
    match &cfg.ledger_path {
        Some(path) => println!("  Action ledger: {}", path.bold()),
        None => println!(
            "  Action ledger: {} {}",
            "in-memory".bold(),
            "(set ledger_path to persist)".dimmed()
        ),
    }

    // ── Control plane ─────────────────────────────────────────────────────
    let plane = Arc::new(ControlPlane::new(
        ledger,
        cfg.dispatch_config(),
        EventBus::new(cfg.event_bus_capacity),
        Arc::new(SystemClock),
    ));
    let sweeper = Sweeper::new(Arc::clone(&plane), cfg.sweep_interval()).spawn();
    info!(
        interval_secs = cfg.sweep_interval().as_secs(),
        "sweeper running"
    );

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!(
            "{}",
            "⚠  Ctrl-C received – initiating graceful shutdown …".yellow().bold()
        );
        shutdown_signal.notify_one();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    // ── Gateway ───────────────────────────────────────────────────────────
    let server = GatewayServer::new(Arc::new(Gateway::new(Arc::clone(&plane))))
        .with_port(cfg.listen_port);
    println!(
        "  Gateway: {}  (health: {})\n",
        format!("ws://0.0.0.0:{}", server.port()).bold().cyan(),
        format!("http://localhost:{}/", server.port()).dimmed()
    );

    let code = tokio::select! {
        result = server.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                println!("{}: {}", "Gateway error".red(), e);
                error!(error = %e, "gateway stopped");
                ExitCode::FAILURE
            }
        },
        _ = shutdown.notified() => ExitCode::SUCCESS,
    };

    sweeper.shutdown().await;
    println!("{}", "  ✓ Sweeper stopped.".green());
    println!("{}", "  ✓ Exiting fleetlockd.".green());
    code
}

/// Load the config, writing the defaults on first run.
fn load_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ______          __  __             __  "#.bold().cyan());
    println!("{}", r#"  / __/ /__ ___ __/ /_/ /  ___  ____ / /__"#.bold().cyan());
    println!("{}", r#" / _// / -_) -_) __/ / /__/ _ \/ __//  '_/"#.bold().cyan());
    println!("{}", r#"/_/ /_/\__/\__/\__/_/____/\___/\__//_/\_\ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "fleetlockd".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Endpoint fleet control plane");
    println!();
}
