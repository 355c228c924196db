//! Encoding of services into the status annotation
//!
//! The whole service is stored as one JSON string. Updates are expressed as
//! RFC 6902 JSON patch operations against the annotation's path, whose key
//! has to be escaped as a JSON pointer token because it contains a `/`.

use crate::STATUS_ANNOTATION;
use k8s_openapi::api::core::v1::Service as K8sService;
use registry_core::{RegistryError, Service};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

const ANNOTATIONS_PATH: &str = "/metadata/annotations";
const RESOURCE_VERSION_PATH: &str = "/metadata/resourceVersion";

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("annotation {0} is not set")]
    Missing(&'static str),

    #[error("malformed service status: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// JSON patch operation kinds used against annotations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
    Test,
}

/// A single JSON patch instruction
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PatchOperation {
    pub op: PatchOp,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Serialize a service into the annotation payload
pub fn encode(service: &Service) -> Result<String, serde_json::Error> {
    serde_json::to_string(service)
}

/// Parse an annotation payload back into a service
pub fn decode(status: Option<&str>) -> Result<Service, CodecError> {
    let status = status.ok_or(CodecError::Missing(STATUS_ANNOTATION))?;
    Ok(serde_json::from_str(status)?)
}

/// Decode the service stored on a Kubernetes resource
pub fn decode_resource(resource: &K8sService) -> Result<Service, RegistryError> {
    let status = resource
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(STATUS_ANNOTATION))
        .map(String::as_str);

    decode(status).map_err(|e| RegistryError::Decode {
        resource: resource.metadata.name.clone().unwrap_or_default(),
        reason: e.to_string(),
    })
}

/// Escape a key for use as a single JSON pointer token (RFC 6901)
pub fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// JSON pointer to the status annotation
pub fn status_annotation_path() -> String {
    format!("{}/{}", ANNOTATIONS_PATH, escape_pointer_token(STATUS_ANNOTATION))
}

/// Set the status annotation to the encoded service.
///
/// `add` on an object member overwrites the current value and also works
/// when the annotation is not there yet, unlike `replace`.
pub fn build_replace_patch(service: &Service) -> Result<PatchOperation, serde_json::Error> {
    Ok(PatchOperation {
        op: PatchOp::Add,
        path: status_annotation_path(),
        value: Some(Value::String(encode(service)?)),
    })
}

/// Remove the status annotation
pub fn build_delete_patch() -> PatchOperation {
    PatchOperation {
        op: PatchOp::Remove,
        path: status_annotation_path(),
        value: None,
    }
}

/// Create an empty annotation map, for resources that have none
pub fn ensure_annotations_patch() -> PatchOperation {
    PatchOperation {
        op: PatchOp::Add,
        path: ANNOTATIONS_PATH.to_string(),
        value: Some(Value::Object(Default::default())),
    }
}

/// Make the patch apply only to the resource version that was read.
///
/// The API server rejects the whole patch when the resource changed since,
/// so operations decided from a stale copy never reach a newer object.
pub fn resource_version_guard(resource_version: &str) -> PatchOperation {
    PatchOperation {
        op: PatchOp::Test,
        path: RESOURCE_VERSION_PATH.to_string(),
        value: Some(Value::String(resource_version.to_string())),
    }
}

/// Turn operations into the patch document sent to the API server
pub fn patch_document(operations: &[PatchOperation]) -> Result<json_patch::Patch, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(operations)?)
}
