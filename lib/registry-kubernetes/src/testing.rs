//! In-process stand-in for the Kubernetes API used by tests

use crate::client::{EventStream, ServiceApi};
use crate::{codec, SERVICE_LABEL, STATUS_ANNOTATION};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Service as K8sService, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DynamicObject, WatchEvent};
use kube::core::ErrorResponse;
use registry_core::{Options, Service};
use std::collections::BTreeMap;
use std::sync::Mutex;

type EventSender = mpsc::UnboundedSender<kube::Result<WatchEvent<DynamicObject>>>;
type EventReceiver = mpsc::UnboundedReceiver<kube::Result<WatchEvent<DynamicObject>>>;

/// Services held in memory; patches are applied for real
#[derive(Default)]
pub struct FakeCluster {
    services: Mutex<Vec<K8sService>>,
    patches: Mutex<Vec<(String, String, json_patch::Patch)>>,
    events: Mutex<Option<EventReceiver>>,
    selectors: Mutex<Vec<String>>,
    configured: Mutex<Vec<Options>>,
    reject_patches: bool,
}

impl FakeCluster {
    pub fn with_services(services: Vec<K8sService>) -> Self {
        Self {
            services: Mutex::new(services),
            ..Default::default()
        }
    }

    pub fn rejecting_patches(mut self) -> Self {
        self.reject_patches = true;
        self
    }

    /// Prepare the stream handed out by the next watch
    pub fn event_sender(&self) -> EventSender {
        let (tx, rx) = mpsc::unbounded();
        *self.events.lock().unwrap() = Some(rx);
        tx
    }

    pub fn patches(&self) -> Vec<(String, String, json_patch::Patch)> {
        self.patches.lock().unwrap().clone()
    }

    pub fn service(&self, name: &str) -> Option<K8sService> {
        self.services
            .lock()
            .unwrap()
            .iter()
            .find(|svc| svc.metadata.name.as_deref() == Some(name))
            .cloned()
    }

    pub fn watched_selectors(&self) -> Vec<String> {
        self.selectors.lock().unwrap().clone()
    }

    pub fn configured(&self) -> Vec<Options> {
        self.configured.lock().unwrap().clone()
    }
}

fn matches_selector(resource: &K8sService, selector: &str) -> bool {
    let labels = resource.metadata.labels.clone().unwrap_or_default();
    match selector.split_once('=') {
        Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
        None => labels.contains_key(selector),
    }
}

#[async_trait]
impl ServiceApi for FakeCluster {
    async fn list(&self, label_selector: &str) -> kube::Result<Vec<K8sService>> {
        let services = self.services.lock().unwrap();
        Ok(services
            .iter()
            .filter(|svc| matches_selector(svc, label_selector))
            .cloned()
            .collect())
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> kube::Result<K8sService> {
        if self.reject_patches {
            return Err(api_error(403, "patch forbidden"));
        }

        let mut services = self.services.lock().unwrap();
        let svc = services
            .iter_mut()
            .find(|svc| {
                svc.metadata.name.as_deref() == Some(name)
                    && svc.metadata.namespace.as_deref().unwrap_or("default") == namespace
            })
            .ok_or_else(|| api_error(404, "service not found"))?;

        let mut doc = serde_json::to_value(&*svc).map_err(kube::Error::SerdeError)?;
        json_patch::patch(&mut doc, &patch.0).map_err(|e| api_error(422, &e.to_string()))?;
        *svc = serde_json::from_value(doc).map_err(kube::Error::SerdeError)?;
        let next = svc
            .metadata
            .resource_version
            .as_deref()
            .and_then(|version| version.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        svc.metadata.resource_version = Some(next.to_string());

        self.patches
            .lock()
            .unwrap()
            .push((namespace.to_string(), name.to_string(), patch.clone()));
        Ok(svc.clone())
    }

    async fn watch(&self, label_selector: &str) -> kube::Result<EventStream> {
        self.selectors.lock().unwrap().push(label_selector.to_string());
        let events = self
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| api_error(500, "watch unavailable"))?;
        Ok(events.boxed())
    }

    async fn configure(&self, options: &Options) -> kube::Result<()> {
        self.configured.lock().unwrap().push(options.clone());
        Ok(())
    }
}

pub fn api_error(code: u16, message: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "Testing".to_string(),
        code,
    })
}

/// A service carrying the registry tag, with the given `(name, port)` pairs
pub fn tagged(name: &str, service_name: &str, ports: &[(Option<&str>, i32)]) -> K8sService {
    let ports = ports
        .iter()
        .map(|(port_name, port)| ServicePort {
            name: port_name.map(str::to_string),
            port: *port,
            ..Default::default()
        })
        .collect::<Vec<_>>();

    K8sService {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            resource_version: Some("1".to_string()),
            labels: Some(BTreeMap::from([(
                SERVICE_LABEL.to_string(),
                service_name.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: (!ports.is_empty()).then_some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn untagged(name: &str) -> K8sService {
    K8sService {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn with_label(mut resource: K8sService, key: &str, value: &str) -> K8sService {
    resource
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
    resource
}

pub fn with_annotation(mut resource: K8sService, key: &str, value: &str) -> K8sService {
    resource
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
    resource
}

pub fn with_resource_version(mut resource: K8sService, version: &str) -> K8sService {
    resource.metadata.resource_version = Some(version.to_string());
    resource
}

/// A tagged service whose status annotation already holds `service`
pub fn registered(name: &str, service: &Service) -> K8sService {
    let status = codec::encode(service).unwrap();
    with_annotation(tagged(name, &service.name, &[(None, 80)]), STATUS_ANNOTATION, &status)
}

/// The untyped form a watch would deliver
pub fn dynamic(resource: &K8sService) -> DynamicObject {
    serde_json::from_value(serde_json::to_value(resource).unwrap()).unwrap()
}
