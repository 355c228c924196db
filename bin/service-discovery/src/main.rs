use anyhow::{Context, Result};
use registry_core::{Options, Registry, RegistryError, WatchOptions, Watcher};
use registry_kubernetes::KubernetesRegistry;
use std::env;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const NAMESPACE_ENV: &str = "DISCOVERY_NAMESPACE";
const TIMEOUT_ENV: &str = "DISCOVERY_TIMEOUT_SECS";
const REWATCH_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting service-discovery daemon...");

    let options = options_from_env()?;
    let registry = KubernetesRegistry::connect(options)
        .await
        .context("failed to reach the Kubernetes API")?;
    info!("Using {} registry", registry);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    // Watches do not survive the API server closing them; start a fresh one
    // and re-list so nothing missed in between goes unnoticed.
    loop {
        log_catalogue(&registry).await;

        match registry.watch(WatchOptions::default()).await {
            Ok(watcher) => {
                let interrupted = tokio::select! {
                    _ = &mut shutdown => true,
                    _ = log_changes(watcher.as_ref()) => false,
                };
                watcher.stop();
                if interrupted {
                    break;
                }
                warn!("Watch closed, restarting in {:?}", REWATCH_DELAY);
            }
            Err(e) => error!("Error opening watch: {}", e),
        }

        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(REWATCH_DELAY) => {}
        }
    }

    info!("Shutdown signal received, exiting...");
    Ok(())
}

fn options_from_env() -> Result<Options> {
    let mut options = Options::default();
    if let Ok(namespace) = env::var(NAMESPACE_ENV) {
        options = options.with_namespace(namespace);
    }
    if let Ok(timeout) = env::var(TIMEOUT_ENV) {
        let secs: u64 = timeout
            .parse()
            .with_context(|| format!("{} must be a number of seconds", TIMEOUT_ENV))?;
        options = options.with_timeout(Duration::from_secs(secs));
    }
    Ok(options)
}

async fn log_catalogue(registry: &dyn Registry) {
    match registry.list_services().await {
        Ok(services) => {
            info!("Registry has {} services", services.len());
            for service in services {
                let addresses: Vec<&str> = service
                    .endpoints
                    .iter()
                    .map(|endpoint| endpoint.address.as_str())
                    .collect();
                debug!("  {} {} {:?}", service.name, service.version, addresses);
            }
        }
        Err(RegistryError::NotFound { selector }) => {
            info!("No services tagged with {}", selector);
        }
        Err(e) => error!("Error listing services: {}", e),
    }
}

async fn log_changes(watcher: &dyn Watcher) {
    loop {
        match watcher.next().await {
            Ok(result) => info!(
                "{} {} ({} endpoints)",
                result.action,
                result.service.name,
                result.service.endpoints.len()
            ),
            Err(RegistryError::StreamClosed) => return,
            Err(e) => {
                error!("Error reading watch: {}", e);
                return;
            }
        }
    }
}
