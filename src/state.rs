//! Application state management

use std::sync::Arc;

use crate::service::BlobService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    service: BlobService,
}

impl AppState {
    pub fn new(service: BlobService) -> Self {
        Self {
            inner: Arc::new(AppStateInner { service }),
        }
    }

    /// Get the blob service
    pub fn service(&self) -> &BlobService {
        &self.inner.service
    }

    /// Flush the catalog before exit
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down application state...");
        self.inner.service.shutdown().await;
    }
}
