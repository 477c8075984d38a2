use berth_core::ContainerManager;
use std::sync::Arc;

/// Shared application state for handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ContainerManager>,
}
