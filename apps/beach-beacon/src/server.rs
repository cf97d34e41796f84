use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::{net::TcpListener, signal, sync::mpsc, time::timeout};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::SignalingDispatcher;
use crate::engine::webrtc::WebRtcEngineFactory;
use crate::engine::EngineFactory;
use crate::registry::{ConnectionRegistry, RegistryError};
use crate::websocket::websocket_handler;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: SignalingDispatcher,
    page: Arc<PathBuf>,
    fatal: mpsc::UnboundedSender<RegistryError>,
}

impl AppState {
    pub fn new(
        dispatcher: SignalingDispatcher,
        page: PathBuf,
        fatal: mpsc::UnboundedSender<RegistryError>,
    ) -> Self {
        Self {
            dispatcher,
            page: Arc::new(page),
            fatal,
        }
    }

    /// Hands an unrecoverable engine failure to the server loop.
    pub fn report_fatal(&self, err: RegistryError) {
        if self.fatal.send(err).is_err() {
            warn!("server already stopping; fatal error not forwarded");
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(page_handler))
        .route("/index.html", get(page_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn page_handler(State(state): State<AppState>) -> Response {
    match tokio::fs::read_to_string(state.page.as_path()).await {
        Ok(body) => Html(body).into_response(),
        Err(err) => {
            warn!(page = %state.page.display(), error = %err, "could not read page");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "sessions": state.dispatcher.registry().len(),
    }))
}

/// Runs the signaling server with the WebRTC engine until a signal or a
/// fatal engine failure.
pub async fn run(config: ServerConfig) -> Result<()> {
    let factory = WebRtcEngineFactory::new(config.engine.clone());
    run_with_factory(config, Arc::new(factory)).await
}

pub async fn run_with_factory(config: ServerConfig, factory: Arc<dyn EngineFactory>) -> Result<()> {
    let registry = ConnectionRegistry::new(factory);
    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
    let state = AppState::new(
        SignalingDispatcher::new(registry.clone()),
        config.page.clone(),
        fatal_tx,
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let local_addr = listener.local_addr().context("listener has no local address")?;
    info!(listen_addr = %local_addr, "signaling server ready; open http://{local_addr}/");

    let fatal_slot = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&fatal_slot);
    let shutdown = async move {
        if let Some(err) = shutdown_signal(fatal_rx).await {
            *slot.lock() = Some(err);
        }
    };

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("signaling server failed")?;

    if timeout(config.shutdown_grace, registry.shutdown()).await.is_err() {
        warn!(
            remaining = registry.len(),
            "sessions still closing after shutdown grace period"
        );
    }
    info!("signaling server stopped");

    let fatal = fatal_slot.lock().take();
    match fatal {
        Some(err) => Err(anyhow::Error::new(err).context("media engine failure")),
        None => Ok(()),
    }
}

async fn shutdown_signal(mut fatal: mpsc::UnboundedReceiver<RegistryError>) -> Option<RegistryError> {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received ctrl-c; shutting down");
            None
        }
        _ = terminate => {
            info!("received SIGTERM; shutting down");
            None
        }
        Some(err) = fatal.recv() => {
            error!(error = %err, "fatal media engine error; shutting down");
            Some(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::engine::mock::MockEngineFactory;

    fn state(page: PathBuf) -> AppState {
        let registry = ConnectionRegistry::new(Arc::new(MockEngineFactory::new()));
        let (fatal, _rx) = mpsc::unbounded_channel();
        AppState::new(SignalingDispatcher::new(registry), page, fatal)
    }

    async fn get_path(app: Router, path: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::get(path).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn serves_page_on_root_and_index() {
        let page = std::env::temp_dir().join(format!("beach-beacon-{}.html", uuid::Uuid::new_v4()));
        tokio::fs::write(&page, "<html>beacon</html>").await.expect("write page");
        let app = router(state(page.clone()));

        for path in ["/", "/index.html"] {
            let (status, body) = get_path(app.clone(), path).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "<html>beacon</html>");
        }
        let _ = tokio::fs::remove_file(&page).await;
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let app = router(state(PathBuf::from("static/index.html")));
        let (status, _) = get_path(app, "/favicon.ico").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_page_is_a_server_error() {
        let app = router(state(PathBuf::from("/nonexistent/beacon/index.html")));
        let (status, _) = get_path(app, "/").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn health_reports_session_count() {
        let app = router(state(PathBuf::from("static/index.html")));
        let (status, body) = get_path(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(value, json!({ "status": "ok", "sessions": 0 }));
    }
}
