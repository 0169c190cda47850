//! semaphored entry point.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::signal;

mod audit;
mod config;
mod error;
mod rate_limit;
mod receiver;
mod reconcile;
mod runtime;
mod scheduler;
mod token_store;
mod types;

use audit::AuditLog;
use config::Config;
use rate_limit::{Authenticator, RateLimiter};
use receiver::ReceiverState;
use reconcile::Reconciler;
use runtime::{ComposeStack, DockerRuntime};
use scheduler::{Cadence, Scheduler};
use token_store::TokenStore;

#[derive(Debug, Parser)]
#[command(version, about = "Out-of-band update signals for a compose-managed container stack")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept update signals over HTTP until interrupted.
    Serve,
    /// Run a single reconciliation pass.
    Update,
    /// Run reconciliation passes every INTERVAL_MINUTES; negative runs once.
    Schedule {
        #[arg(allow_negative_numbers = true)]
        interval_minutes: Option<f64>,
    },
    /// Print the pending signals, one per line.
    Respond,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let cli = Cli::parse();
    let cfg = Config::load()?;

    match cli.command {
        Command::Serve => serve(&cfg).await,
        Command::Update => schedule(&cfg, Cadence::Once).await,
        Command::Schedule { interval_minutes } => {
            let minutes = interval_minutes
                .or(cfg.reconciliation_interval_minutes)
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "No interval given and reconciliation_interval_minutes is not configured"
                    )
                })?;
            schedule(&cfg, Cadence::from_minutes(minutes)?).await
        }
        Command::Respond => respond(&cfg).await,
    }
}

async fn serve(cfg: &Config) -> anyhow::Result<()> {
    let state = ReceiverState::new(
        RateLimiter::new(cfg.rate_limit(), cfg.tracked_clients),
        Authenticator::new(&cfg.resolve_secret()),
        Arc::new(TokenStore::new(&cfg.token_store_path)),
        cfg.max_body_bytes,
    );
    receiver::serve(cfg.bind, state, shutdown_signal()).await?;
    info!("Shutdown complete.");
    Ok(())
}

async fn schedule(cfg: &Config, cadence: Cadence) -> anyhow::Result<()> {
    let prefix = cfg.resolve_container_prefix()?;
    let stack = ComposeStack {
        files: cfg.resolve_compose_files()?,
        env_file: cfg.env_file.clone(),
    };
    info!(
        "Managing containers prefixed {:?} from {} compose file(s)",
        prefix,
        stack.files.len()
    );

    let reconciler = Reconciler::new(
        DockerRuntime::connect()?,
        Arc::new(TokenStore::new(&cfg.token_store_path)),
        stack,
        prefix,
        cfg.runtime_timeout(),
    );
    let audit = AuditLog::new(&cfg.audit_log_path, cfg.log_line_ceiling);
    let mut scheduler = Scheduler::new(reconciler, audit, cadence, cfg.poll_interval());
    scheduler.run(shutdown_signal()).await;
    info!(
        "Scheduler {:?} after {} pass(es)",
        scheduler.state(),
        scheduler.passes()
    );
    Ok(())
}

async fn respond(cfg: &Config) -> anyhow::Result<()> {
    let snapshot = TokenStore::new(&cfg.token_store_path).snapshot().await?;
    for token in snapshot.tokens {
        println!("{token}");
    }
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            // Without a signal handler there is nothing to wait for.
            std::future::pending::<()>().await;
        }
    }
}
