use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::extract::{Embedder, Extractor};

/// Shared handler state. Everything except the extractor's inference permit
/// is read-only after startup.
#[derive(Clone)]
pub struct AppState {
    pub extractor: Extractor,
    /// Threshold for compare requests that omit one.
    pub default_threshold: f64,
    pub extract_timeout: Duration,
    pub max_upload_bytes: usize,
    pub enable_cors: bool,
}

impl AppState {
    pub fn new(embedder: Arc<dyn Embedder>, config: &Config) -> Self {
        Self {
            extractor: Extractor::new(embedder),
            default_threshold: config.threshold,
            extract_timeout: config.extract_timeout(),
            max_upload_bytes: config.max_upload_bytes(),
            enable_cors: config.enable_cors,
        }
    }
}
