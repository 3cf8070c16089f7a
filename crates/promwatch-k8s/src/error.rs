//! Error types for promwatch Kubernetes operations

use std::fmt;
use std::time::Duration;

use promwatch_types::ResourceDescriptor;
use thiserror::Error;

/// Client-side operation that failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Get,
    Create,
    Replace,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "get",
            Self::Create => "create",
            Self::Replace => "replace",
            Self::Delete => "delete",
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Target object does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// Create attempted on an existing object
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// Descriptor is not one of the registered kinds
    #[error("no informer registered for resource {0}")]
    UnknownResource(ResourceDescriptor),

    /// Request failed in transport, auth, or on the server
    #[error("failed to {operation} {kind} {namespace}/{name}: {source}")]
    Transport {
        operation: Operation,
        kind: &'static str,
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("{operation} {kind} {namespace}/{name} timed out after {timeout:?}")]
    Timeout {
        operation: Operation,
        kind: &'static str,
        namespace: String,
        name: String,
        timeout: Duration,
    },

    /// Watch loop ended before the initial listing completed
    #[error("informer for {0} stopped before syncing")]
    InformerStopped(ResourceDescriptor),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_unknown_resource(&self) -> bool {
        matches!(self, Self::UnknownResource(_))
    }
}

/// Result type alias for promwatch Kubernetes operations
pub type Result<T> = std::result::Result<T, Error>;

/// Identity of the object an operation targets, used to wrap kube errors
#[derive(Clone, Copy, Debug)]
pub(crate) struct Target<'a> {
    pub operation: Operation,
    pub kind: &'static str,
    pub namespace: &'a str,
    pub name: &'a str,
}

impl Target<'_> {
    /// Map a kube error onto the taxonomy: 404 is NotFound, 409 on create
    /// is AlreadyExists, anything else is Transport
    pub fn wrap(self, err: kube::Error) -> Error {
        let code = match &err {
            kube::Error::Api(response) => Some(response.code),
            _ => None,
        };

        match (code, self.operation) {
            (Some(404), _) => Error::NotFound {
                kind: self.kind,
                namespace: self.namespace.to_string(),
                name: self.name.to_string(),
            },
            (Some(409), Operation::Create) => Error::AlreadyExists {
                kind: self.kind,
                namespace: self.namespace.to_string(),
                name: self.name.to_string(),
            },
            _ => Error::Transport {
                operation: self.operation,
                kind: self.kind,
                namespace: self.namespace.to_string(),
                name: self.name.to_string(),
                source: err,
            },
        }
    }

    pub fn timeout(self, timeout: Duration) -> Error {
        Error::Timeout {
            operation: self.operation,
            kind: self.kind,
            namespace: self.namespace.to_string(),
            name: self.name.to_string(),
            timeout,
        }
    }
}
