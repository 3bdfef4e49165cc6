//! ClientSession - Per-connection state management
//!
//! Each connection to the mock has its own session that tracks which host
//! instance it speaks to. The attached host is the connection identity the
//! router dispatches on.

use std::sync::Arc;

use crate::instance::MockServerInstance;

/// Unique identifier for a client connection
pub type ClientId = usize;

/// Session state for a client connection
///
/// Created when a client connects and destroyed when it disconnects.
pub struct ClientSession {
    /// Unique client ID for this connection
    pub id: ClientId,
    /// Currently attached host (None until the client attaches)
    pub current_host: Option<Arc<MockServerInstance>>,
}

impl ClientSession {
    pub fn new(id: ClientId) -> Self {
        Self { id, current_host: None }
    }

    /// Attach to a host instance
    ///
    /// Connection accounting is done here so a detach always balances it.
    pub fn attach(&mut self, host: Arc<MockServerInstance>) {
        self.detach();
        host.add_connection();
        self.current_host = Some(host);
    }

    /// Detach from the current host, if any
    pub fn detach(&mut self) {
        if let Some(host) = self.current_host.take() {
            host.remove_connection();
        }
    }

    pub fn current_host_name(&self) -> Option<&str> {
        self.current_host.as_ref().map(|h| h.host.as_str())
    }

    pub fn has_host(&self) -> bool {
        self.current_host.is_some()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.detach();
    }
}
