//! Engine binary: load the configuration, assemble the engine, and serve
//! until a shutdown signal arrives.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use floe::config::EngineConfig;
use floe::engine::Engine;

#[derive(Parser)]
#[command(name = "floe", about = "Embedded engine for declarative flow execution")]
struct Cli {
    /// Engine configuration file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = EngineConfig::load_from_file(&cli.config).unwrap_or_else(|| {
        let config = EngineConfig::default_config();
        eprintln!(
            "configuration file '{}' not found, using defaults",
            cli.config.display()
        );
        config
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.tracing_filter())),
        )
        .init();

    let engine = Engine::new(config, HashMap::new());
    engine.start();

    wait_for_shutdown().await;

    engine.stop();
    Ok(())
}

/// Block until HUP, INT, TERM, or QUIT; any of them exits with code 0
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot install SIGHUP handler");
            return;
        }
    };
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot install SIGTERM handler");
            return;
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot install SIGQUIT handler");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = hup.recv() => {}
        _ = term.recv() => {}
        _ = quit.recv() => {}
    }
}
