//! Shared state handed to every request handler

use crate::config::SharedConfig;
use crate::rag::RagEngine;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    engine: Arc<RagEngine>,
    config: SharedConfig,
}

impl AppState {
    pub fn new(engine: RagEngine, config: SharedConfig) -> Self {
        AppState {
            engine: Arc::new(engine),
            config,
        }
    }

    pub fn engine(&self) -> &RagEngine {
        &self.engine
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }
}
