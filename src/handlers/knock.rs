use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::time::Instant;
use crate::metrics::{ADMIT_LATENCY, KNOCK_ADMITTED, KNOCK_DENIED, KNOCK_FAILED, KNOCK_REQUESTS};
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnockOutcome {
    Ok,
    Failed,
}

impl IntoResponse for KnockOutcome {
    fn into_response(self) -> Response {
        match self {
            KnockOutcome::Ok => "OK".into_response(),
            KnockOutcome::Failed => "Failed".into_response(),
        }
    }
}

// The limiter lock is released before the blocking admit starts
pub async fn handle_admission(state: &AppState, address: String) -> KnockOutcome {
    KNOCK_REQUESTS.inc();

    if !state.limiter.is_allowed(&address) {
        // every denial means the address is blacklisted by now
        KNOCK_DENIED.inc();
        tracing::warn!("Knock from blacklisted {} denied", address);
        return KnockOutcome::Failed;
    }

    let start_time = Instant::now();
    let admitter = state.admitter.clone();
    let result = tokio::task::spawn_blocking(move || admitter.admit(&address)).await;
    ADMIT_LATENCY.observe(start_time.elapsed().as_secs_f64());

    match result {
        Ok(Ok(())) => {
            KNOCK_ADMITTED.inc();
            KnockOutcome::Ok
        }
        // already logged by the admitter
        Ok(Err(_)) => {
            KNOCK_FAILED.inc();
            KnockOutcome::Failed
        }
        Err(e) => {
            tracing::error!("Admission task did not finish: {}", e);
            KNOCK_FAILED.inc();
            KnockOutcome::Failed
        }
    }
}

pub async fn knock_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> KnockOutcome {
    // v4 clients on a dual-stack socket show up as ::ffff:a.b.c.d
    let address = peer.ip().to_canonical().to_string();
    handle_admission(&state, address).await
}
