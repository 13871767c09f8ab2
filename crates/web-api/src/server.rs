use crate::handlers;
use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use botfleet_orchestrator::FleetController;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub struct ApiServer {
    controller: Arc<FleetController>,
}

impl ApiServer {
    #[must_use]
    pub const fn new(controller: Arc<FleetController>) -> Self {
        Self { controller }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/get-active-bots-status", get(handlers::get_active_bots_status))
            .route("/get-bot-status/:bot_name", get(handlers::get_bot_status))
            .route("/get-bot-history/:bot_name", get(handlers::get_bot_history))
            .route("/start-bot", post(handlers::start_bot))
            .route("/stop-bot", post(handlers::stop_bot))
            .route("/import-strategy", post(handlers::import_strategy))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.controller))
    }

    /// Serves the API on `addr` until `shutdown` resolves.
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the address or serve requests.
    pub async fn serve<F>(self, addr: &str, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        tracing::info!("Web API listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .context("Web API server error")?;

        Ok(())
    }
}
