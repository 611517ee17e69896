//! Alice message bus service.
//!
//! Hosts the WebSocket broker and runs the dispatcher and skill manager as local
//! participants. Ctrl-C drains queued messages and closes every connection.

mod logging;

use alice_bus::{ws, MessageBus};
use alice_core::{messages, AliceConfig, Engine};
use anyhow::Context;
use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long to wait for the actors to drain after the listener stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[alice-messagebus] .env not loaded: {} (using system environment)", e);
    }

    let config = AliceConfig::load().context("loading configuration")?;

    // --print-config: show the effective configuration (file + environment) and exit
    if std::env::args().any(|a| a == "--print-config") {
        println!("{}", toml::to_string_pretty(&config).context("rendering configuration")?);
        return Ok(());
    }

    let _log_guard = logging::init(&config.log);

    let bus = MessageBus::new(config.bus.clone())?;
    let engine = Engine::new(&config);
    let dispatcher = engine
        .dispatcher(&config)
        .spawn(bus.connect_local("dispatcher", messages::DISPATCHER_SUBSCRIPTIONS)?);
    let skill_manager = engine
        .skill_manager(&config)
        .spawn(bus.connect_local("skill-manager", messages::SKILL_MANAGER_SUBSCRIPTIONS)?);
    let reaper = bus.spawn_reaper();

    let addr = config.bus.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(
        %addr,
        route = %config.bus.route,
        queue_capacity = config.bus.queue_capacity,
        "message bus listening"
    );

    let shutdown_bus = Arc::clone(&bus);
    axum::serve(listener, app(Arc::clone(&bus)))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested; draining");
            shutdown_bus.shutdown();
        })
        .await
        .context("serving")?;

    bus.shutdown();
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        let _ = dispatcher.await;
        let _ = skill_manager.await;
        let _ = reaper.await;
    })
    .await;
    if drained.is_err() {
        warn!("actors did not stop within the drain timeout");
    }
    info!(stats = ?bus.stats(), "message bus stopped");
    Ok(())
}

/// Bus WebSocket route plus health and status endpoints.
fn app(bus: Arc<MessageBus>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(Arc::clone(&bus))
        .merge(ws::router(bus))
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(bus): State<Arc<MessageBus>>) -> Json<Value> {
    Json(json!({
        "stats": bus.stats(),
        "connections": bus.connections(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alice_bus::BusConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn get_body(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn test_health() {
        let bus = MessageBus::new(BusConfig::default()).unwrap();
        let (status, body) = get_body(app(bus), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
    }

    #[tokio::test]
    async fn test_status_lists_connections() {
        let bus = MessageBus::new(BusConfig::default()).unwrap();
        let _dispatcher = bus
            .connect_local("dispatcher", messages::DISPATCHER_SUBSCRIPTIONS)
            .unwrap();
        let (status, body) = get_body(app(Arc::clone(&bus)), "/status").await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["stats"]["connections"], 1);
        assert_eq!(json["stats"]["accepting"], true);
        assert_eq!(json["connections"][0]["label"], "dispatcher");
    }

    #[tokio::test]
    async fn test_bus_route_requires_upgrade() {
        let bus = MessageBus::new(BusConfig::default()).unwrap();
        let (status, _) = get_body(app(bus), "/core").await;
        assert!(status.is_client_error());
    }
}
