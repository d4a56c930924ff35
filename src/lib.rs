pub mod api;
pub mod auth;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod identity;
pub mod store;
pub mod ws;

use std::sync::Arc;

use config::Config;
use coordinator::DeviceCoordinator;
use store::Store;
use ws::provider::ProviderRegistry;

/// Shared application state passed to every request handler and background task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    /// Live provider sessions, keyed by provider session id.
    pub providers: Arc<ProviderRegistry>,
    pub coordinator: Arc<DeviceCoordinator>,
    pub started_at: std::time::Instant,
}
