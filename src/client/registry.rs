//! Driver registry
//!
//! Maps a scheme name to a factory producing a client driver. The in-memory
//! driver is registered out of the box; protocol drivers linked into the
//! final binary register themselves at startup.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use super::memory::{MemoryClient, MemoryServer};
use super::{Account, Client, ClientError, ClientResult};

/// Factory function type for creating client drivers.
pub type ClientFactory = Arc<dyn Fn(&Account) -> ClientResult<Arc<dyn Client>> + Send + Sync>;

pub struct ClientRegistry {
    factories: RwLock<HashMap<String, ClientFactory>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        let registry = Self {
            factories: RwLock::new(HashMap::new()),
        };
        registry.register("memory", Arc::new(|account| {
            let server = MemoryServer::new();
            server.mkdir_all(&account.workdir);
            Ok(Arc::new(MemoryClient::new(server)) as Arc<dyn Client>)
        }));
        registry
    }

    pub fn register(&self, scheme: impl Into<String>, factory: ClientFactory) {
        self.factories.write().insert(scheme.into(), factory);
    }

    pub fn is_registered(&self, scheme: &str) -> bool {
        self.factories.read().contains_key(scheme)
    }

    pub fn list_schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Resolve a driver for the account. The scheme is the part of the
    /// host before `://`; a bare hostname selects the native driver.
    pub fn create(&self, account: &Account) -> ClientResult<Arc<dyn Client>> {
        let scheme = scheme_of(&account.host);
        let factory = self.factories.read().get(scheme).cloned();
        match factory {
            Some(factory) => factory(account),
            None => Err(ClientError::InvalidArgument(format!(
                "no driver for '{}' (available: {})",
                scheme,
                self.list_schemes().join(", ")
            ))),
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn scheme_of(host: &str) -> &str {
    match host.split_once("://") {
        Some((scheme, _)) => scheme,
        None if host == "memory" => "memory",
        None => "irods",
    }
}

static GLOBAL_REGISTRY: Lazy<ClientRegistry> = Lazy::new(ClientRegistry::new);

/// The process-wide registry used by the binary.
pub fn global_registry() -> &'static ClientRegistry {
    &GLOBAL_REGISTRY
}
