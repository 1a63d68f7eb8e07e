//! TRIANGULUM: triangular arbitrage engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores persisted tasks, serves the dashboard API and logs a status
//! line on an interval until Ctrl+C.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use triangulum::clock::{Clock, SystemClock};
use triangulum::config;
use triangulum::dashboard::spawn_dashboard;
use triangulum::exchange::sandbox::SandboxConnector;
use triangulum::service::ArbitrageService;
use triangulum::storage::TaskStore;

const BANNER: &str = r#"
 _____ ____  ___    _    _   _  ____ _   _ _    _   _ __  __
|_   _|  _ \|_ _|  / \  | \ | |/ ___| | | | |  | | | |  \/  |
  | | | |_) || |  / _ \ |  \| | |  _| | | | |  | | | | |\/| |
  | | |  _ < | | / ___ \| |\  | |_| | |_| | |__| |_| | |  | |
  |_| |_| \_\___/_/   \_\_| \_|\____|\___/|_____\___/|_|  |_|

  Triangular arbitrage engine
  v0.1.0 / sandbox exchange
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load_or_default("config.toml")?;

    init_logging();

    println!("{BANNER}");
    info!(
        engine_name = %cfg.engine.name,
        chain_lengths = format!("{}..={}", cfg.scan.min_chain_length, cfg.scan.max_chain_length),
        rate_staleness_secs = cfg.execution.rate_staleness_secs,
        "TRIANGULUM starting up"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let connector = Arc::new(SandboxConnector::new(&cfg.sandbox, clock.clone()));

    // -- Restore persisted tasks -----------------------------------------

    let (store, restored) = if cfg.storage.enabled {
        let store = TaskStore::open(&cfg.storage.tasks_dir)?;
        let tasks = match store.load_all() {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to load persisted tasks; starting empty");
                Vec::new()
            }
        };
        (Some(store), tasks)
    } else {
        (None, Vec::new())
    };

    let service = Arc::new(ArbitrageService::from_config(&cfg, connector, clock, store));
    if !restored.is_empty() {
        let count = service.scheduler().restore(restored).await;
        info!(count, "Restored tasks from disk");
    }

    if cfg.dashboard.enabled {
        if let Err(e) = spawn_dashboard(service.clone(), cfg.dashboard.port).await {
            error!(error = %e, "Dashboard failed to start; continuing without it");
        }
    }

    // -- Main loop -------------------------------------------------------

    let mut interval = tokio::time::interval(Duration::from_secs(cfg.engine.status_interval_secs.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.engine.status_interval_secs,
        "Engine ready. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let status = service.status().await;
                info!(
                    tasks = status.tasks,
                    running = status.running_tasks,
                    known_chains = status.known_chains,
                    manual_executions = status.manual_executions,
                    uptime_secs = status.uptime_secs,
                    "Status"
                );
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    service.shutdown().await;
    info!("TRIANGULUM shut down cleanly.");

    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("triangulum=info"));

    if std::env::var("TRIANGULUM_LOG_JSON").is_ok() {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
