//! HostRouter - Thread-safe registry of mock server instances
//!
//! A logical query in a sharded test fans out to one search backend per
//! shard or replica member. The router owns one `MockServerInstance` per host
//! identity and forwards each request to the instance of the connection it
//! arrived on. Its only job is to prevent cross-talk: a history registered on
//! host A is never visible to a request arriving at host B, even when the
//! handles collide numerically.
//!
//! # Usage
//!
//! ```no_run
//! use search_mock::router::HostRouter;
//! use search_mock::instance::InstanceOptions;
//! use serde_json::json;
//!
//! let router = HostRouter::new(InstanceOptions::default());
//! router.create_host("shard0").unwrap();
//! router.create_host("shard1").unwrap();
//!
//! let reply = router.dispatch("shard0", &json!({"continue": 123, "collection": "c"}));
//! assert!(reply.is_err()); // nothing registered yet
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{MockError, Result};
use crate::instance::{InstanceInfo, InstanceOptions, MockServerInstance};
use crate::matcher::Document;
use crate::response::WireEnvelope;

pub struct HostRouter {
    /// All live instances by host identity
    hosts: RwLock<HashMap<String, Arc<MockServerInstance>>>,
    /// Applied to every instance created through this router
    options: InstanceOptions,
}

impl HostRouter {
    pub fn new(options: InstanceOptions) -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            options,
        }
    }

    pub fn options(&self) -> InstanceOptions {
        self.options
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<MockServerInstance>>> {
        self.hosts.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<MockServerInstance>>> {
        self.hosts.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate host name
    ///
    /// Allowed characters: [a-zA-Z0-9_.:-] (covers `host:port` forms)
    /// Length: 1-255 characters
    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > 255 {
            return Err(MockError::InvalidHostName("Name must be 1-255 characters".to_string()));
        }

        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));

        if !valid {
            return Err(MockError::InvalidHostName(
                "Name can only contain a-z, A-Z, 0-9, _, -, ., :".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a new, empty instance for `name`.
    pub fn create_host(&self, name: &str) -> Result<Arc<MockServerInstance>> {
        Self::validate_name(name)?;

        let mut hosts = self.write();
        if hosts.contains_key(name) {
            return Err(MockError::HostExists(name.to_string()));
        }

        let instance = Arc::new(MockServerInstance::new(name, self.options));
        hosts.insert(name.to_string(), Arc::clone(&instance));
        tracing::info!(host = name, "created mock host");
        Ok(instance)
    }

    pub fn get_host(&self, name: &str) -> Result<Arc<MockServerInstance>> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| MockError::HostNotFound(name.to_string()))
    }

    pub fn host_exists(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Drop an instance (must not be in use)
    pub fn drop_host(&self, name: &str) -> Result<()> {
        let mut hosts = self.write();

        let instance = hosts
            .get(name)
            .ok_or_else(|| MockError::HostNotFound(name.to_string()))?;

        if instance.is_in_use() {
            return Err(MockError::HostInUse(name.to_string()));
        }

        hosts.remove(name);
        tracing::info!(host = name, "dropped mock host");
        Ok(())
    }

    /// List all instances, sorted by host name
    pub fn list_hosts(&self) -> Vec<InstanceInfo> {
        let mut infos: Vec<InstanceInfo> = self.read().values().map(|i| i.info()).collect();
        infos.sort_by(|a, b| a.host.cmp(&b.host));
        infos
    }

    /// Forward `request` to the instance owned by `host`.
    pub fn dispatch(&self, host: &str, request: &Document) -> Result<WireEnvelope> {
        // Release the map lock before the instance takes its own
        let instance = self.get_host(host)?;
        instance.handle(request)
    }

    /// Teardown check over every instance; one entry per failing host.
    pub fn check_all_unused(&self) -> Vec<MockError> {
        let mut instances: Vec<Arc<MockServerInstance>> = self.read().values().cloned().collect();
        instances.sort_by(|a, b| a.host.cmp(&b.host));
        instances.iter().filter_map(|i| i.check_unused().err()).collect()
    }
}
