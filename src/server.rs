//! HTTP monitoring endpoint.
//!
//! Exposes the client's health and stats for an external monitor:
//! - `GET /health` answers 200 when the active backend responds, 503 otherwise,
//!   with a body like `{"networked": true}`
//! - `GET /stats` answers with the backend-specific stats record

use crate::client::DatabaseClient;
use crate::error::{DbError, DbResult};
use crate::models::{BackendStats, HealthStatus};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

/// Grace period for open requests once a shutdown signal arrives.
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct MonitorServer {
    client: Arc<DatabaseClient>,
    /// Host to bind to
    host: String,
    /// Port to bind to
    port: u16,
}

impl MonitorServer {
    pub fn new(client: Arc<DatabaseClient>, host: impl Into<String>, port: u16) -> Self {
        Self {
            client,
            host: host.into(),
            port,
        }
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Serve until SIGINT/SIGTERM, then close every database driver.
    pub async fn run(&self) -> DbResult<()> {
        let bind_addr = self.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            DbError::configuration(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        info!(addr = %bind_addr, "Monitoring endpoint ready");

        let app = router(Arc::clone(&self.client));

        let shutdown_notify = Arc::new(tokio::sync::Notify::new());
        let shutdown_notify_clone = shutdown_notify.clone();
        let shutdown_signal = async move {
            wait_for_signal().await;
            shutdown_notify_clone.notify_one();
        };

        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal);

        tokio::select! {
            result = server => {
                match result {
                    Ok(()) => info!("HTTP server stopped"),
                    Err(e) => {
                        error!(error = %e, "HTTP server error");
                        self.client.close_all().await;
                        return Err(DbError::internal(format!("HTTP server error: {}", e)));
                    }
                }
            }
            _ = async {
                shutdown_notify.notified().await;
                tokio::select! {
                    _ = tokio::time::sleep(GRACEFUL_TIMEOUT) => {
                        warn!("Graceful shutdown timeout, forcing exit");
                    }
                    _ = wait_for_signal() => {
                        warn!("Received second signal, forcing immediate exit");
                    }
                }
            } => {}
        }

        info!("Closing database connections");
        self.client.close_all().await;
        Ok(())
    }
}

/// Build the monitoring router over a shared client.
pub fn router(client: Arc<DatabaseClient>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(client)
}

async fn health(State(client): State<Arc<DatabaseClient>>) -> (StatusCode, Json<HealthStatus>) {
    let status = client.health_check().await;
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

async fn stats(State(client): State<Arc<DatabaseClient>>) -> Json<BackendStats> {
    Json(client.stats().await)
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddedConfig;

    #[test]
    fn test_bind_addr() {
        let client = Arc::new(DatabaseClient::embedded(EmbeddedConfig::in_memory()));
        let server = MonitorServer::new(client, "0.0.0.0", 3000);
        assert_eq!(server.bind_addr(), "0.0.0.0:3000");
    }

    #[tokio::test]
    async fn test_health_handler_reports_status_code() {
        let client = Arc::new(DatabaseClient::embedded(EmbeddedConfig::in_memory()));
        let (code, Json(body)) = health(State(Arc::clone(&client))).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({ "embedded-file": true })
        );

        client.close_all().await;
        let (code, Json(body)) = health(State(client)).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.is_healthy());
    }

    #[tokio::test]
    async fn test_stats_handler() {
        let client = Arc::new(DatabaseClient::embedded(EmbeddedConfig::in_memory()));
        let Json(body) = stats(State(client)).await;
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["backend"], "embedded-file");
        assert_eq!(json["path"], ":memory:");
    }
}
