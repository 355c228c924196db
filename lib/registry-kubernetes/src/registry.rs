//! Registry operations over tagged Kubernetes services

use crate::client::{KubeServiceApi, ServiceApi};
use crate::codec::{self, PatchOperation};
use crate::watcher::KubernetesWatcher;
use crate::{SERVICE_LABEL, SERVICE_PORT_LABEL};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service as K8sService;
use registry_core::{
    Endpoint, Options, RegisterOptions, Registry, RegistryError, Result, Service, WatchOptions,
    Watcher,
};
use std::fmt;
use tracing::{debug, info};

/// KubernetesRegistry stores registrations in annotations of existing services
pub struct KubernetesRegistry<A = KubeServiceApi> {
    api: A,
    options: Options,
}

impl KubernetesRegistry<KubeServiceApi> {
    /// Connect to the cluster described by the ambient Kubernetes configuration
    pub async fn connect(options: Options) -> Result<Self> {
        let api = KubeServiceApi::connect(&options)
            .await
            .map_err(|e| RegistryError::api("error loading kubernetes config", e))?;
        Ok(Self::with_api(api, options))
    }
}

impl<A: ServiceApi> KubernetesRegistry<A> {
    pub fn with_api(api: A, options: Options) -> Self {
        Self { api, options }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Find the resource tagged with a service name.
    ///
    /// When several resources carry the same tag the first one in API server
    /// order wins. That order is not guaranteed to be stable.
    pub async fn find_by_tag(&self, name: &str) -> Result<K8sService> {
        let selector = service_selector(name);
        let mut resources = self.list(&selector).await?;
        if resources.len() > 1 {
            debug!(
                "{} services match selector {}, using the first",
                resources.len(),
                selector
            );
        }
        Ok(resources.swap_remove(0))
    }

    /// Find every resource carrying the service tag
    pub async fn find_all_tagged(&self) -> Result<Vec<K8sService>> {
        self.list(SERVICE_LABEL).await
    }

    async fn list(&self, selector: &str) -> Result<Vec<K8sService>> {
        let resources = self
            .api
            .list(selector)
            .await
            .map_err(|e| RegistryError::api("error loading services list", e))?;

        if resources.is_empty() {
            return Err(RegistryError::NotFound {
                selector: selector.to_string(),
            });
        }
        Ok(resources)
    }

    async fn patch_status(&self, resource: &K8sService, operations: &[PatchOperation]) -> Result<()> {
        let name = resource_name(resource);
        let namespace = resource
            .metadata
            .namespace
            .as_deref()
            .or(self.options.namespace.as_deref())
            .unwrap_or("default");
        let patch = codec::patch_document(operations)?;

        self.api
            .patch(namespace, &name, &patch)
            .await
            .map_err(|source| RegistryError::Patch {
                resource: name,
                source,
            })?;
        Ok(())
    }
}

/// Label selector matching the resource tagged for one service
pub fn service_selector(name: &str) -> String {
    format!("{}={}", SERVICE_LABEL, name)
}

fn resource_name(resource: &K8sService) -> String {
    resource.metadata.name.clone().unwrap_or_default()
}

/// Pick the port a service is reached on.
///
/// The port named by the port label wins; without the label the first
/// declared port is used.
pub fn resolve_port(resource: &K8sService) -> Result<i32> {
    let ports = resource
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_deref())
        .unwrap_or_default();
    let selected = resource
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(SERVICE_PORT_LABEL));

    match selected {
        Some(port_name) => ports
            .iter()
            .find(|port| port.name.as_deref() == Some(port_name.as_str()))
            .map(|port| port.port)
            .ok_or_else(|| RegistryError::PortNotFound {
                resource: resource_name(resource),
                port: port_name.clone(),
            }),
        None => ports
            .first()
            .map(|port| port.port)
            .ok_or_else(|| RegistryError::NoPorts {
                resource: resource_name(resource),
            }),
    }
}

impl<A> fmt::Display for KubernetesRegistry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("kubernetes")
    }
}

#[async_trait]
impl<A: ServiceApi + 'static> Registry for KubernetesRegistry<A> {
    async fn init(&mut self, options: Options) -> Result<()> {
        self.api
            .configure(&options)
            .await
            .map_err(|e| RegistryError::api("error loading kubernetes config", e))?;
        self.options = options;
        Ok(())
    }

    fn options(&self) -> &Options {
        &self.options
    }

    async fn register(&self, service: &Service, _options: RegisterOptions) -> Result<()> {
        let resource = self.find_by_tag(&service.name).await?;
        let port = resolve_port(&resource)?;
        let name = resource_name(&resource);

        let mut registered = service.clone();
        registered.endpoints = vec![Endpoint {
            id: name.clone(),
            address: format!("{}:{}", name, port),
            metadata: service.metadata.clone(),
        }];

        // Creating the annotation map replaces any map added after the list,
        // so that write is pinned to the version it was decided on.
        let mut operations = Vec::with_capacity(3);
        if resource.metadata.annotations.is_none() {
            if let Some(version) = resource.metadata.resource_version.as_deref() {
                operations.push(codec::resource_version_guard(version));
            }
            operations.push(codec::ensure_annotations_patch());
        }
        operations.push(codec::build_replace_patch(&registered)?);
        self.patch_status(&resource, &operations).await?;

        info!("Registered service {} on {}:{}", service.name, name, port);
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        let resource = self.find_by_tag(&service.name).await?;
        self.patch_status(&resource, &[codec::build_delete_patch()])
            .await?;

        info!("Deregistered service {} from {}", service.name, resource_name(&resource));
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        let resource = self.find_by_tag(name).await?;
        let service = codec::decode_resource(&resource)?;
        Ok(vec![service])
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let resources = self.find_all_tagged().await?;

        let services = resources
            .iter()
            .filter_map(|resource| match codec::decode_resource(resource) {
                Ok(service) => Some(service),
                Err(e) => {
                    debug!("Skipping service: {}", e);
                    None
                }
            })
            .collect();
        Ok(services)
    }

    async fn watch(&self, options: WatchOptions) -> Result<Box<dyn Watcher>> {
        let selector = match &options.service {
            Some(name) => service_selector(name),
            None => SERVICE_LABEL.to_string(),
        };
        let watcher = KubernetesWatcher::start(&self.api, &selector).await?;
        Ok(Box::new(watcher))
    }

    fn name(&self) -> &'static str {
        "kubernetes"
    }
}
