//! Translation of Kubernetes watch events into registry changes

use crate::client::{EventStream, ServiceApi};
use crate::codec;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service as K8sService;
use k8s_openapi::Resource;
use kube::api::{DynamicObject, WatchEvent};
use registry_core::watch::{self, ChannelWatcher, WatchSender};
use registry_core::{Action, RegistryError, Result, WatchResult, WatchState, Watcher};
use tracing::{debug, warn};

/// Watcher fed by a Kubernetes watch on tagged services.
///
/// A background task reads the upstream watch one event at a time and hands
/// each translated change over once the caller asks for it. There is no
/// reconnection: when the API server ends the watch the watcher closes.
pub struct KubernetesWatcher {
    inner: ChannelWatcher,
}

impl KubernetesWatcher {
    /// Open the upstream watch and start translating its events
    pub async fn start<A: ServiceApi + ?Sized>(api: &A, label_selector: &str) -> Result<Self> {
        let events = api.watch(label_selector).await.map_err(|e| {
            RegistryError::api(
                format!("error watching services with selector {}", label_selector),
                e,
            )
        })?;

        let (sender, inner) = watch::channel();
        tokio::spawn(forward(events, sender));
        Ok(Self { inner })
    }

    pub fn state(&self) -> WatchState {
        self.inner.state()
    }
}

#[async_trait]
impl Watcher for KubernetesWatcher {
    async fn next(&self) -> Result<WatchResult> {
        self.inner.next().await
    }

    fn stop(&self) {
        self.inner.stop()
    }
}

async fn forward(mut events: EventStream, mut sender: WatchSender) {
    loop {
        let event = tokio::select! {
            biased;
            _ = sender.stopped() => {
                debug!("K8s watcher: stop requested");
                break;
            }
            event = events.next() => event,
        };

        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!("K8s watcher: error reading watch stream: {}", e);
                continue;
            }
            None => {
                debug!("K8s watcher: upstream watch ended");
                break;
            }
        };

        if let Some(result) = translate(event) {
            if !sender.send(result).await {
                break;
            }
        }
    }

    // Dropping the stream cancels the upstream request
    drop(events);
    drop(sender);
}

/// Map one watch event to a registry change. Events that carry no usable
/// service are dropped.
pub fn translate(event: WatchEvent<DynamicObject>) -> Option<WatchResult> {
    let (action, object) = match event {
        WatchEvent::Added(object) => (Action::Create, object),
        WatchEvent::Modified(object) => (Action::Update, object),
        WatchEvent::Deleted(object) => (Action::Delete, object),
        WatchEvent::Bookmark(_) => return None,
        WatchEvent::Error(e) => {
            debug!("K8s watcher: ignoring error event: {}", e.message);
            return None;
        }
    };

    let resource = match to_service(object) {
        Ok(resource) => resource,
        Err(e) => {
            warn!("K8s watcher: {}", e);
            return None;
        }
    };

    match codec::decode_resource(&resource) {
        Ok(service) => Some(WatchResult::new(action, service)),
        Err(e) => {
            warn!("K8s watcher: cannot decode service: {}", e);
            None
        }
    }
}

/// Convert an untyped watch object into a core/v1 Service
pub fn to_service(object: DynamicObject) -> Result<K8sService> {
    if let Some(types) = &object.types {
        if types.kind != K8sService::KIND || types.api_version != K8sService::API_VERSION {
            return Err(RegistryError::TypeConversion(format!(
                "expected {}/{}, got {}/{}",
                K8sService::API_VERSION,
                K8sService::KIND,
                types.api_version,
                types.kind
            )));
        }
    }

    let value = serde_json::to_value(&object)?;
    serde_json::from_value(value).map_err(|e| RegistryError::TypeConversion(e.to_string()))
}
