//! `GET /healthz` and `GET /metrics` (§6 Observable surface, SPEC_FULL §4.10
//! [ADD]). Both are served over `axum`, the web framework the teacher's
//! `call-engine` crate already depends on for its own admin/supervisor
//! surface, even though that surface itself is only stubbed there.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tracing::info;

use crate::engine::Engine;

/// `GET /healthz` body (§6: "PBX-connected, transport ready, active-call
/// count, provider-ready").
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub pbx_connected: bool,
    pub rtp_ready: bool,
    pub audiosocket_ready: bool,
    pub active_calls: usize,
    pub provider_ready: bool,
}

impl HealthSnapshot {
    /// Overall readiness: the PBX control plane must be connected and at
    /// least one media transport must be bound for the process to usefully
    /// accept a call.
    fn is_healthy(&self) -> bool {
        self.pbx_connected && (self.rtp_ready || self.audiosocket_ready) && self.provider_ready
    }
}

async fn healthz(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    let snapshot = engine.health_snapshot();
    let status = if snapshot.is_healthy() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(snapshot))
}

async fn metrics(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        engine.metrics().render_prometheus(),
    )
}

fn router(engine: Arc<Engine>) -> Router {
    Router::new().route("/healthz", get(healthz)).route("/metrics", get(metrics)).with_state(engine)
}

/// Serve `/healthz` on `health_addr` and `/metrics` on `metrics_addr`. Both
/// routes are present on both listeners; two ports are bound only because
/// operators commonly firewall the metrics scrape endpoint separately from
/// the liveness probe port.
pub async fn serve(engine: Arc<Engine>, health_addr: SocketAddr, metrics_addr: SocketAddr) -> std::io::Result<()> {
    let health_router = router(engine.clone());
    let metrics_router = router(engine);

    let health_listener = tokio::net::TcpListener::bind(health_addr).await?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(%health_addr, %metrics_addr, "observability endpoints listening");

    let health_server = axum::serve(health_listener, health_router);
    let metrics_server = axum::serve(metrics_listener, metrics_router);

    tokio::try_join!(health_server, metrics_server)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unhealthy_when_pbx_disconnected() {
        let snapshot = HealthSnapshot {
            pbx_connected: false,
            rtp_ready: true,
            audiosocket_ready: true,
            active_calls: 0,
            provider_ready: true,
        };
        assert!(!snapshot.is_healthy());
    }

    #[test]
    fn healthy_when_pbx_connected_and_one_transport_ready() {
        let snapshot = HealthSnapshot {
            pbx_connected: true,
            rtp_ready: false,
            audiosocket_ready: true,
            active_calls: 2,
            provider_ready: true,
        };
        assert!(snapshot.is_healthy());
    }
}
