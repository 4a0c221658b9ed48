//! Shared Application State

use crate::config::Config;
use std::sync::Arc;

/// Created once at startup and shared by every session. Read-only: sessions
/// share no mutable state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn has_credential(&self) -> bool {
        self.config.openai_api_key.is_some()
    }
}
