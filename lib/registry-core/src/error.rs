use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no services found with selector {selector}")]
    NotFound { selector: String },

    #[error("service {resource} has no port {port} defined")]
    PortNotFound { resource: String, port: String },

    #[error("service {resource} has no ports")]
    NoPorts { resource: String },

    #[error("error updating service {resource}: {source}")]
    Patch {
        resource: String,
        #[source]
        source: kube::Error,
    },

    #[error("could not decode service status of {resource}: {reason}")]
    Decode { resource: String, reason: String },

    #[error("could not convert watch object to service: {0}")]
    TypeConversion(String),

    #[error("result stream closed")]
    StreamClosed,

    #[error("{context}: {source}")]
    Api {
        context: String,
        #[source]
        source: kube::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RegistryError {
    /// Wrap a Kubernetes API failure with the operation it interrupted
    pub fn api(context: impl Into<String>, source: kube::Error) -> Self {
        Self::Api {
            context: context.into(),
            source,
        }
    }
}
