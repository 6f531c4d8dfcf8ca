use crate::middleware::auth::AuthProvider;
use mcpod_core::McpBackend;
use std::sync::{Arc, OnceLock};

/// Application state shared across handlers.
///
/// The backend is filled in exactly once, when adapter initialization
/// finishes; until then the HTTP surface answers 503.
pub struct AppState {
    backend: OnceLock<Arc<dyn McpBackend>>,
    pub auth: Arc<dyn AuthProvider>,
}

impl AppState {
    pub fn new(auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            backend: OnceLock::new(),
            auth,
        }
    }

    /// The ready backend, if initialization has finished
    pub fn backend(&self) -> Option<Arc<dyn McpBackend>> {
        self.backend.get().cloned()
    }

    /// Install the backend; returns false if one was already installed
    pub fn set_backend(&self, backend: Arc<dyn McpBackend>) -> bool {
        self.backend.set(backend).is_ok()
    }
}
