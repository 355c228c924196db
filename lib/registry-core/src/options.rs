//! Registry, registration and watch options

use std::time::Duration;

/// Default timeout applied to the connection with the backing store
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection settings of a registry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// Connect/write timeout of the underlying client. Reads are not bounded
    /// so long-lived watches can sit idle.
    pub timeout: Duration,
    /// Restrict lookups to one namespace; `None` spans all namespaces
    pub namespace: Option<String>,
}

impl Options {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            namespace: None,
        }
    }
}

/// Per-registration settings
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    /// How long the registration stays visible. Backends whose entries are
    /// owned by an external system ignore it.
    pub ttl: Option<Duration>,
}

impl RegisterOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Watch settings
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Only deliver events for this service
    pub service: Option<String>,
}

impl WatchOptions {
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service: Some(name.into()),
        }
    }
}
