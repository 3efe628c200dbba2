mod admit;
mod config;
mod error;
mod handlers;
mod metrics;
mod rate_limit;
mod state;

use axum::{Router, http::StatusCode, routing::any};
use clap::Parser; // for cli
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admit::{Admitter, AllowSet, DryRun, IpsetCommand};
use crate::config::Args;
use crate::handlers::{default_handler, knock_handler, metrics_handler, not_found_handler};
use crate::rate_limit::{Limiter, sweeper};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,knock_gate=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // parse cli arguments
    let args = Args::parse();
    let gate = Arc::new(args.gate_config()?);

    // a corrupt blacklist file stops us here
    let limiter = Arc::new(Limiter::new(args.limiter_config()?)?);

    let backend: Arc<dyn AllowSet> = if args.dry_run {
        Arc::new(DryRun)
    } else {
        Arc::new(IpsetCommand::new(gate.ipset_binary.clone()))
    };

    let state = AppState {
        limiter: limiter.clone(),
        admitter: Arc::new(Admitter::new(gate.clone(), backend)),
    };

    // spawn the access table sweeper
    let sweep_every = limiter.config().access_timeout;
    tokio::spawn(sweeper(limiter.clone(), sweep_every));

    let mut app = Router::new()
        .route("/", any(default_handler))
        .route(&format!("/{}", gate.request_name), any(knock_handler))
        .route("/404", any(not_found_handler))
        .route("/favicon.ico", any(|| async { StatusCode::NOT_FOUND }));
    if args.metrics {
        app = app.route("/metrics", any(metrics_handler));
    }
    let app = app.fallback(not_found_handler).with_state(state);

    let listener = tokio::net::TcpListener::bind(gate.listen_address).await?;

    tracing::info!("Listen on {}", gate.listen_address);
    tracing::info!("apiname is {}", gate.request_name);
    tracing::info!("Allow-sets: {} / {} (timeout {}s)", gate.set_v4, gate.set_v6, gate.timeout_secs);
    tracing::info!(
        "Rate limit: {} knocks per {} seconds, blacklist {}",
        args.max_accesses,
        args.access_timeout,
        if args.blacklist.is_empty() { "in memory" } else { args.blacklist.as_str() }
    );
    if args.dry_run {
        tracing::warn!("Dry run: addresses are logged, not added to any set");
    }

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
