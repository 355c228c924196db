//! The discovery contract every registry backend implements

use crate::{Options, RegisterOptions, Result, Service, WatchOptions, Watcher};
use async_trait::async_trait;

/// Register, look up and watch services.
///
/// Backends are chosen when the application is assembled; callers only see
/// this trait.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Apply new options, reconnecting to the backing store if needed
    async fn init(&mut self, options: Options) -> Result<()>;

    /// Current options
    fn options(&self) -> &Options;

    /// Make a service discoverable, replacing any previous registration
    async fn register(&self, service: &Service, options: RegisterOptions) -> Result<()>;

    /// Withdraw a registration made by [`Registry::register`].
    ///
    /// Withdrawing a service that is not registered is an error, so a
    /// repeated deregister fails rather than doing nothing.
    async fn deregister(&self, service: &Service) -> Result<()>;

    /// Look up a service by name. Registries holding several instances of a
    /// service return one entry per instance.
    async fn get_service(&self, name: &str) -> Result<Vec<Service>>;

    /// All currently registered services
    async fn list_services(&self) -> Result<Vec<Service>>;

    /// Subscribe to registration changes
    async fn watch(&self, options: WatchOptions) -> Result<Box<dyn Watcher>>;

    /// Short backend name
    fn name(&self) -> &'static str;
}
