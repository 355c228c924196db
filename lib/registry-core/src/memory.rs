//! In-memory registry backend

use crate::{
    watch, Action, Options, RegisterOptions, Registry, RegistryError, Result, Service,
    WatchOptions, WatchResult, Watcher,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 64;

/// MemoryRegistry keeps registrations in process memory
pub struct MemoryRegistry {
    // Map of service name to its latest registration
    services: Arc<RwLock<HashMap<String, Entry>>>,
    events: broadcast::Sender<WatchResult>,
    options: Options,
}

#[derive(Clone, Debug)]
struct Entry {
    service: Service,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > now)
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            events,
            options,
        }
    }

    /// Get count of live registrations
    pub async fn service_count(&self) -> usize {
        let now = Instant::now();
        let services = self.services.read().await;
        services.values().filter(|entry| entry.is_live(now)).count()
    }

    fn publish(&self, action: Action, service: Service) {
        // No subscribers is not an error
        let _ = self.events.send(WatchResult::new(action, service));
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn init(&mut self, options: Options) -> Result<()> {
        self.options = options;
        Ok(())
    }

    fn options(&self) -> &Options {
        &self.options
    }

    async fn register(&self, service: &Service, options: RegisterOptions) -> Result<()> {
        let now = Instant::now();
        let entry = Entry {
            service: service.clone(),
            expires_at: options.ttl.map(|ttl| now + ttl),
        };

        let previous = {
            let mut services = self.services.write().await;
            services.insert(service.name.clone(), entry)
        };

        let action = match previous {
            Some(previous) if previous.is_live(now) => Action::Update,
            _ => Action::Create,
        };
        debug!("Registered service: {} ({})", service.name, action);
        self.publish(action, service.clone());
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        let removed = {
            let mut services = self.services.write().await;
            services.remove(&service.name)
        };

        match removed {
            Some(entry) => {
                debug!("Deregistered service: {}", service.name);
                self.publish(Action::Delete, entry.service);
                Ok(())
            }
            None => Err(RegistryError::NotFound {
                selector: service.name.clone(),
            }),
        }
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        let now = Instant::now();
        let services = self.services.read().await;
        services
            .get(name)
            .filter(|entry| entry.is_live(now))
            .map(|entry| vec![entry.service.clone()])
            .ok_or_else(|| RegistryError::NotFound {
                selector: name.to_string(),
            })
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let now = Instant::now();
        let services = self.services.read().await;
        let mut live: Vec<Service> = services
            .values()
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.service.clone())
            .collect();
        live.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(live)
    }

    async fn watch(&self, options: WatchOptions) -> Result<Box<dyn Watcher>> {
        let mut events = self.events.subscribe();
        let (mut sender, watcher) = watch::channel();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = sender.stopped() => break,
                    event = events.recv() => event,
                };

                match event {
                    Ok(result) => {
                        if let Some(name) = &options.service {
                            if &result.service.name != name {
                                continue;
                            }
                        }
                        if !sender.send(result).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Memory watcher lagged, skipped {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Box::new(watcher))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
