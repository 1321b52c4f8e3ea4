//! SMStoXMPP dispatcher entry point.
//!
//! Loads the configuration, sets up logging, starts the supervisor and
//! waits for SIGINT or SIGTERM to run the shutdown sequence.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use smstoxmpp::chat::console::ConsoleConnector;
use smstoxmpp::chat::xmpp::XmppConnector;
use smstoxmpp::chat::ChatConnector;
use smstoxmpp::config::{load_config, resolve_config_path};
use smstoxmpp::contacts::{CardDavClient, DirectoryClient};
use smstoxmpp::gateway::GatewayRegistry;
use smstoxmpp::supervisor::{Collaborators, Supervisor};

/// SMStoXMPP: relay SMS from gateway devices to chat, and back.
#[derive(Parser)]
#[command(name = "smstoxmpp", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Also log human-readable output to stderr.
    #[arg(short, long)]
    verbose: bool,

    /// Log at debug level.
    #[arg(short, long)]
    debug: bool,

    /// Use stdin/stdout instead of the XMPP server.
    #[arg(long)]
    console: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref(), |key| std::env::var(key).ok())?;
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let _logging_guard =
        smstoxmpp::logging::init_production(&config.dispatcher.log_dir, cli.verbose, cli.debug)?;
    info!(
        config = %config_path.display(),
        devices = config.devices.len(),
        "starting {}",
        smstoxmpp::app::identity()
    );

    let directory: Option<Arc<dyn DirectoryClient>> = if config.contacts.enabled {
        let client = CardDavClient::new(
            &config.contacts.url,
            &config.contacts.username,
            &config.contacts.password,
        )
        .context("invalid contacts configuration")?;
        Some(Arc::new(client))
    } else {
        None
    };

    let connector: Arc<dyn ChatConnector> = if cli.console {
        info!("console chat sessions selected");
        Arc::new(ConsoleConnector::new())
    } else {
        Arc::new(XmppConnector::new())
    };

    let collaborators = Collaborators {
        connector,
        registry: Arc::new(GatewayRegistry::with_builtin()),
        directory,
    };

    let supervisor = Supervisor::start(&config, collaborators)
        .await
        .context("failed to start dispatcher")?;

    wait_for_signal().await;
    info!("received shutdown signal, draining workers");

    let report = supervisor
        .shutdown()
        .await
        .context("shutdown did not complete cleanly")?;
    info!(
        workers = report.workers_stopped,
        failed = report.workers_failed,
        log_records = report.log_records,
        "shutdown complete"
    );
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM where supported.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "SIGTERM handler unavailable"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
}
