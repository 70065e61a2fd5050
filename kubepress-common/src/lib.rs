//! Common types shared between kubepress-deploy and kubepress-cli
//!
//! Declares the desired state of the WordPress-on-AKS stack as typed
//! records, the dependency edges between them, and the order in which
//! they can be realised.

pub mod azure;
pub mod graph;
pub mod quantity;
pub mod resource;
pub mod stack;
pub mod vm;
pub mod workloads;

pub use graph::{Plan, PlanGroup, Stack};
pub use resource::{
    Declaration, DesiredState, Input, OutputRef, Outputs, ResourceId, ResourceKind,
    ResourceOptions, ResourceSpec,
};
pub use stack::{wordpress_stack, StackSettings};

/// Declaration and planning errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Resource declared twice: {0}")]
    DuplicateResource(String),

    #[error("{from} refers to undeclared resource {to}")]
    DanglingReference { from: String, to: String },

    #[error("Kubernetes object {0} has no Kubernetes provider")]
    MissingProvider(String),

    #[error("Dependency cycle between: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("Output {0} has not been recorded yet")]
    UnresolvedOutput(String),

    #[error("Invalid resource id: {0}")]
    InvalidResourceId(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Shorthand for building a `Validation` error for a named resource
pub(crate) fn invalid(resource: &str, message: impl AsRef<str>) -> Error {
    Error::Validation(format!("{}: {}", resource, message.as_ref()))
}
