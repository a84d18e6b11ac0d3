//! Debug HTTP endpoint (§4.K, ambient).
//!
//! Intentionally minimal: one route, no auth, no CORS — `pprof`-style
//! runtime profiling is named a non-core external collaborator (spec.md
//! §1) and is out of scope. `GET /debug/vars` is implemented because it's
//! directly testable and cheap, mirroring the shape spec.md §6 names.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use crate::dnscache::DnsCache;

#[derive(Clone)]
struct AppState {
    cache: Arc<DnsCache>,
    started_at: Instant,
}

async fn debug_vars(State(state): State<AppState>) -> Json<Value> {
    let metrics = state.cache.metrics();
    Json(json!({
        "cache_metrics": {
            "hit_mfa": metrics.hit_mfa,
            "miss_mfa": metrics.miss_mfa,
            "hit_lru": metrics.hit_lru,
            "miss_lru": metrics.miss_lru,
            "miss": metrics.miss,
            "recently_evicted_miss": metrics.recently_evicted_miss,
        },
        "cache_len": state.cache.len(),
        "cache_cap": state.cache.cap(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

fn build_router(cache: Arc<DnsCache>, started_at: Instant) -> Router {
    Router::new()
        .route("/debug/vars", get(debug_vars))
        .with_state(AppState { cache, started_at })
}

/// Binds `127.0.0.1:<port>` and serves until the process exits. Errors are
/// logged and swallowed — the debug endpoint is diagnostic, not load-bearing;
/// a bind failure here should never take down DNS serving.
pub async fn serve(port: u16, cache: Arc<DnsCache>, started_at: Instant) {
    let addr = format!("127.0.0.1:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!(%addr, error = %e, "debug endpoint failed to bind, disabling it");
            return;
        }
    };
    info!(%addr, "debug endpoint listening");
    if let Err(e) = axum::serve(listener, build_router(cache, started_at)).await {
        tracing::warn!(error = %e, "debug endpoint server exited");
    }
}
