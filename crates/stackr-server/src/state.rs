use stackr_core::config::Config;
use stackr_core::deploy::Deployer;
use stackr_core::stack::Resolver;
use std::sync::Arc;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub resolver: Resolver,
    pub deployer: Arc<Deployer>,
}

impl AppState {
    pub fn new(config: Arc<Config>, deployer: Arc<Deployer>) -> Self {
        Self {
            resolver: Resolver::from_config(&config),
            config,
            deployer,
        }
    }
}
