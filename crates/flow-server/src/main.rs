mod error;
mod handlers;
mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post, put};
use axum::Router;
use flow_core::{MemoryStore, Store};
use flow_runtime::{DelayScheduler, HttpChannelDispatcher, NodeWalker, Orchestrator};
use tower_http::trace::TraceLayer;
use tracing::info;

use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let node_process_url = std::env::var("WHATSAPP_NODE_PROCESS_URL")
        .unwrap_or_else(|_| "http://localhost:8080/agentflow/node/process".to_string());

    let poll_interval_secs: u64 = std::env::var("DELAY_SCHEDULER_POLL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(HttpChannelDispatcher::new(node_process_url));
    let walker = NodeWalker::new(store.clone(), dispatcher);
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), walker));

    let scheduler = Arc::new(DelayScheduler::new(
        store.clone(),
        orchestrator.clone(),
        Duration::from_secs(poll_interval_secs),
    ));
    let stop = scheduler.stop_handle();
    let scheduler_handle = tokio::spawn(scheduler.run());

    let state = AppState { store, orchestrator };

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/webhook/message", post(handlers::webhook_message))
        .route("/flow/create", post(handlers::create_flow))
        .route("/flow/update/:flow_id", put(handlers::update_flow))
        .route("/flow/list", get(handlers::list_flows))
        .route("/flow/detail/:flow_id", get(handlers::flow_detail))
        .route("/flow/status/:flow_id", post(handlers::set_flow_status))
        .route("/node-details/list", get(handlers::node_details_list))
        .route("/node-details/:node_type", get(handlers::node_detail))
        .route("/node-details/category/:category", get(handlers::node_details_by_category))
        .route("/agentflow/node/process", post(handlers::agentflow_node_process))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "flow-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("stopping delay scheduler");
    stop.notify_one();
    scheduler_handle.await.ok();

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
