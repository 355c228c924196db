//! Kubernetes-backed service registry
//!
//! Services are not stored by this crate. Each logical service is anchored on
//! an existing Kubernetes `Service` carrying the [`SERVICE_LABEL`] label, and
//! its registration lives in the [`STATUS_ANNOTATION`] annotation of that
//! resource:
//! - `codec`: annotation payload and JSON patch construction
//! - `client`: the Kubernetes API operations the registry relies on
//! - `registry`: register, deregister, lookup and listing
//! - `watcher`: translation of Kubernetes watch events into registry changes

pub mod client;
pub mod codec;
pub mod registry;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use client::{EventStream, KubeServiceApi, ServiceApi};
pub use codec::CodecError;
pub use registry::KubernetesRegistry;
pub use watcher::KubernetesWatcher;

/// Label whose value is the name of the service a resource anchors
pub const SERVICE_LABEL: &str = "kubernetes.micro.mu/service";
/// Label naming the declared port that should be exposed
pub const SERVICE_PORT_LABEL: &str = "kubernetes.micro.mu/service-port";
/// Annotation holding the encoded service
pub const STATUS_ANNOTATION: &str = "kubernetes.micro.mu/service-status";
