//! Kubernetes API operations used by the registry

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service as K8sService;
use kube::api::{
    Api, ApiResource, DynamicObject, ListParams, Patch, PatchParams, WatchEvent, WatchParams,
};
use kube::{Client, Config};
use registry_core::Options;
use tokio::sync::RwLock;
use tracing::debug;

/// Raw watch events for tagged services
pub type EventStream = BoxStream<'static, kube::Result<WatchEvent<DynamicObject>>>;

/// The slice of the Kubernetes API the registry needs.
///
/// Watch events are left untyped so that payloads which are not services
/// can be told apart from transport failures.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceApi: Send + Sync {
    /// List services matching a label selector, in API server order
    async fn list(&self, label_selector: &str) -> kube::Result<Vec<K8sService>>;

    /// Apply a JSON patch to one service
    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> kube::Result<K8sService>;

    /// Open a watch on services matching a label selector
    async fn watch(&self, label_selector: &str) -> kube::Result<EventStream>;

    /// Rebuild the connection with new options
    async fn configure(&self, options: &Options) -> kube::Result<()>;
}

/// ServiceApi backed by a live cluster
pub struct KubeServiceApi {
    scope: RwLock<Scope>,
}

#[derive(Clone)]
struct Scope {
    client: Client,
    namespace: Option<String>,
}

impl Scope {
    async fn connect(options: &Options) -> kube::Result<Self> {
        // Honours KUBECONFIG, then ~/.kube/config, then in-cluster settings
        let mut config = Config::infer().await.map_err(kube::Error::InferConfig)?;
        // The read timeout is left alone so idle watches are not cut short
        config.connect_timeout = Some(options.timeout);
        config.write_timeout = Some(options.timeout);

        let client = Client::try_from(config)?;
        Ok(Self {
            client,
            namespace: options.namespace.clone(),
        })
    }

    fn services(&self) -> Api<K8sService> {
        match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    fn dynamic_services(&self) -> Api<DynamicObject> {
        let resource = ApiResource::erase::<K8sService>(&());
        match &self.namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

impl KubeServiceApi {
    /// Connect using the ambient Kubernetes configuration
    pub async fn connect(options: &Options) -> kube::Result<Self> {
        let scope = Scope::connect(options).await?;
        Ok(Self {
            scope: RwLock::new(scope),
        })
    }

    /// Wrap an existing client
    pub fn from_client(client: Client, namespace: Option<String>) -> Self {
        Self {
            scope: RwLock::new(Scope { client, namespace }),
        }
    }

    async fn scope(&self) -> Scope {
        self.scope.read().await.clone()
    }
}

#[async_trait]
impl ServiceApi for KubeServiceApi {
    async fn list(&self, label_selector: &str) -> kube::Result<Vec<K8sService>> {
        let services = self.scope().await.services();
        let list = services
            .list(&ListParams::default().labels(label_selector))
            .await?;

        debug!("Listed {} services with selector {}", list.items.len(), label_selector);
        Ok(list.items)
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> kube::Result<K8sService> {
        let scope = self.scope().await;
        let services: Api<K8sService> = Api::namespaced(scope.client, namespace);
        services
            .patch(name, &PatchParams::default(), &Patch::Json::<()>(patch.clone()))
            .await
    }

    async fn watch(&self, label_selector: &str) -> kube::Result<EventStream> {
        let services = self.scope().await.dynamic_services();
        let params = WatchParams::default().labels(label_selector);
        let stream = services.watch(&params, "0").await?;

        debug!("Opened watch with selector {}", label_selector);
        Ok(stream.boxed())
    }

    async fn configure(&self, options: &Options) -> kube::Result<()> {
        let scope = Scope::connect(options).await?;
        *self.scope.write().await = scope;
        Ok(())
    }
}
