//! Realises a kubepress stack
//!
//! A thin call sequence: each declaration maps to a handful of Azure Resource
//! Manager, Microsoft Graph or Kubernetes API calls. There is no diffing and
//! no reconciliation; apply issues idempotent create-or-update requests in
//! plan order and records the outputs later declarations read.

pub mod auth;
pub mod azure;
pub mod client;
pub mod context;
pub mod identity;
pub mod kubernetes;
pub mod provisioner;
pub mod vm;

pub use auth::{Credential, Scope};
pub use client::{ClientError, RestClient};
pub use context::{DeployContext, Timeouts};
pub use provisioner::{Deployer, Provisioner};

use thiserror::Error;

/// Deployment errors
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Stack(#[from] kubepress_common::Error),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("No provisioner registered for {0}")]
    NoProvisioner(String),

    #[error("{resource}: unexpected response: {message}")]
    UnexpectedResponse { resource: String, message: String },

    #[error("{0} is not connected; apply its Kubernetes provider first")]
    NotConnected(String),

    #[error("Invalid kubeconfig: {0}")]
    InvalidKubeconfig(String),

    #[cfg(feature = "kubernetes")]
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Kubernetes support not enabled in this build")]
    KubernetesDisabled,

    #[error("Group {group} failed: {}", .failures.iter().map(|(id, e)| format!("{}: {}", id, e)).collect::<Vec<_>>().join("; "))]
    GroupFailed {
        group: usize,
        failures: Vec<(String, String)>,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeployError {
    pub(crate) fn unexpected(resource: impl ToString, message: impl Into<String>) -> Self {
        DeployError::UnexpectedResponse {
            resource: resource.to_string(),
            message: message.into(),
        }
    }

    /// The target is already gone
    pub fn is_not_found(&self) -> bool {
        match self {
            DeployError::Client(e) => e.is_not_found(),
            #[cfg(feature = "kubernetes")]
            DeployError::Kube(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;
