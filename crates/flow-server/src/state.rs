use std::sync::Arc;

use flow_core::Store;
use flow_runtime::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub orchestrator: Arc<Orchestrator>,
}
