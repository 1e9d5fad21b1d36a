//! fleetplane controller
//!
//! Runs the game server controllers, the allocation service and the SDK
//! socket for one cluster. With leader election on, only the lease holder
//! runs the controllers; every replica serves allocations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use fleetplane_controller::{
    allocation::{Allocator, HttpPeerClient},
    api,
    config::Config,
    context::Context,
    leader::{LeaderElector, LeaderError},
    manager::Manager,
    runtime::SimulatedPodRuntime,
    sdk::{serve_unix, SdkService},
    state::AppState,
};
use fleetplane_reconcile::SystemClock;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "controller", version, about = "fleetplane controller manager")]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "FLEETPLANE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    // Prefer RUST_LOG, fall back to the configured level.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        cluster = %config.cluster_name,
        listen_addr = %config.listen_addr,
        "Starting fleetplane controller"
    );

    let (ctx, scheduler) = Context::simulated(config, Arc::new(SystemClock));
    let config = ctx.config.clone();

    let peers = Arc::new(HttpPeerClient::new(
        config.allocation.peer_dial_timeout(),
        config.allocation.timeout(),
    ));
    let allocator = Arc::new(Allocator::new(ctx.clone(), peers));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (leading_tx, leading_rx) = watch::channel(false);

    let mut election = if config.leader_election.enabled {
        let elector =
            LeaderElector::from_config(&config, ctx.store.leases.clone(), ctx.clock.clone());
        info!(identity = %elector.identity(), "Leader election enabled");
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { elector.run(leading_tx, shutdown).await })
    } else {
        info!("Leader election disabled, running controllers unconditionally");
        leading_tx.send_replace(true);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            wait_until(&mut shutdown, true).await;
            drop(leading_tx);
            Ok::<(), LeaderError>(())
        })
    };

    let controllers = tokio::spawn(run_controllers(
        ctx.clone(),
        scheduler,
        leading_rx.clone(),
        shutdown_rx.clone(),
    ));

    let sdk_handle = tokio::spawn({
        let service = SdkService::new(ctx.clone());
        let path = config.sdk.socket_path.clone();
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(e) = serve_unix(service, &path, shutdown).await {
                error!(error = %e, "SDK server failed");
            }
        }
    });

    let app = api::create_router(AppState::new(ctx.clone(), allocator, leading_rx));
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let mut server_handle = tokio::spawn({
        let mut shutdown = shutdown_rx.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    wait_until(&mut shutdown, true).await;
                    info!("HTTP server shutting down");
                })
                .await
        }
    });

    let mut leadership_lost = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut election => {
            match result {
                Ok(Ok(())) => info!("Leader election stopped"),
                Ok(Err(e)) => {
                    error!(error = %e, "Leadership lost");
                    leadership_lost = true;
                }
                Err(e) => {
                    error!(error = %e, "Leader election task panicked");
                    leadership_lost = true;
                }
            }
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    shutdown_tx.send_replace(true);

    // Queues get the grace period to drain; anything left is abandoned.
    let grace = config.shutdown_grace() + std::time::Duration::from_secs(1);
    if tokio::time::timeout(grace, controllers).await.is_err() {
        warn!("Controllers did not stop in time");
    }
    if !election.is_finished() {
        if let Ok(Ok(Err(e))) = tokio::time::timeout(grace, election).await {
            warn!(error = %e, "Releasing leadership failed");
        }
    }
    if tokio::time::timeout(grace, sdk_handle).await.is_err() {
        warn!("SDK server did not stop in time");
    }
    if !server_handle.is_finished()
        && tokio::time::timeout(grace, server_handle).await.is_err()
    {
        warn!("HTTP server did not stop in time");
    }

    if leadership_lost {
        bail!("leadership lost; exiting so a fresh process can campaign again");
    }
    info!("Controller shutdown complete");
    Ok(())
}

/// Run the controller manager while this process leads. Stops when
/// leadership goes away or on shutdown.
async fn run_controllers(
    ctx: Context,
    scheduler: Arc<SimulatedPodRuntime>,
    mut leading: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let acquired = tokio::select! {
        acquired = wait_until(&mut leading, true) => acquired,
        _ = wait_until(&mut shutdown, true) => false,
    };
    if !acquired {
        return;
    }

    // The previous leader's index is gone; rebuild from recorded ports.
    if let Err(e) = ctx.ports.rebuild(&ctx.store, &ctx.recorder, ctx.now()) {
        error!(error = %e, "Port allocator rebuild failed");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let manager = tokio::spawn(Manager::new(ctx, Some(scheduler)).run(stop_rx));

    tokio::select! {
        _ = wait_until(&mut leading, false) => {
            warn!("Not leading anymore, stopping controllers");
        }
        _ = wait_until(&mut shutdown, true) => {}
    }
    stop_tx.send_replace(true);
    if let Err(e) = manager.await {
        error!(error = %e, "Controller manager task panicked");
    }
}

/// Wait for a flag to reach `want`. False if the sender went away first.
async fn wait_until(flag: &mut watch::Receiver<bool>, want: bool) -> bool {
    flag.wait_for(|value| *value == want).await.is_ok()
}
