//! HTTP trigger for external schedulers
//!
//! `GET|POST /api/cron/github-sync` runs one reconciliation, authorized by a
//! shared bearer secret. `GET /healthz` answers `ok`.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::sync::{SyncReconciler, SyncSummary};

pub const TRIGGER_PATH: &str = "/api/cron/github-sync";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub reconciler: SyncReconciler,
    pub cron_secret: Option<String>,
    /// Cancelled on shutdown; in-flight runs stop between projects
    pub shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    success: bool,
    synced: usize,
    hidden: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

impl From<SyncSummary> for SyncResponse {
    fn from(summary: SyncSummary) -> Self {
        Self {
            success: true,
            synced: summary.synced,
            hidden: summary.hidden,
            errors: summary.errors,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(TRIGGER_PATH, get(trigger_sync).post(trigger_sync))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let addr = listener.local_addr().context("Failed to read listener address")?;
    info!("Trigger endpoint listening on http://{}{}", addr, TRIGGER_PATH);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")
}

async fn healthz() -> &'static str {
    "ok"
}

async fn trigger_sync(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(secret) = state.cron_secret.as_deref().filter(|s| !s.is_empty()) else {
        warn!("Sync trigger called but no cron secret is configured");
        return failure("CRON_SECRET is not configured");
    };

    if !is_authorized(&headers, secret) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Unauthorized" })),
        )
            .into_response();
    }

    match state.reconciler.run_stored(&state.shutdown.child_token()).await {
        Ok(summary) => (StatusCode::OK, Json(SyncResponse::from(summary))).into_response(),
        Err(e) => {
            warn!("Triggered sync failed: {}", e);
            failure(&e.to_string())
        }
    }
}

fn failure(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": message })),
    )
        .into_response()
}

fn is_authorized(headers: &HeaderMap, secret: &str) -> bool {
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(presented) = value.strip_prefix("Bearer ") else {
        return false;
    };
    constant_time_eq(presented.trim().as_bytes(), secret.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &'static str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(AUTHORIZATION, HeaderValue::from_static(value));
        map
    }

    #[test]
    fn bearer_secret_must_match() {
        assert!(is_authorized(&headers("Bearer s3cret"), "s3cret"));
        assert!(!is_authorized(&headers("Bearer s3cre"), "s3cret"));
        assert!(!is_authorized(&headers("Basic s3cret"), "s3cret"));
        assert!(!is_authorized(&HeaderMap::new(), "s3cret"));
    }

    #[test]
    fn errors_omitted_when_empty() {
        let body = serde_json::to_value(SyncResponse::from(SyncSummary {
            synced: 3,
            hidden: 1,
            ..SyncSummary::default()
        }))
        .unwrap();
        assert_eq!(body, json!({ "success": true, "synced": 3, "hidden": 1 }));

        let body = serde_json::to_value(SyncResponse::from(SyncSummary {
            errors: vec!["octo/a: request timed out".to_string()],
            ..SyncSummary::default()
        }))
        .unwrap();
        assert_eq!(body["errors"][0], "octo/a: request timed out");
    }
}
