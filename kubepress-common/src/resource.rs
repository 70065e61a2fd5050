//! Desired-state declarations
//!
//! A declaration is a resource identity, a typed spec of literal values and
//! output references, and ordering options. Output references are the
//! implicit edges of the dependency graph; `depends_on` and `provider` are
//! the explicit ones.

use crate::azure::{
    Application, KubernetesCluster, ManagedDisk, ResourceGroup, ServicePrincipal,
    ServicePrincipalPassword, StorageAccount,
};
use crate::workloads::{
    Deployment, HorizontalPodAutoscaler, Ingress, KubernetesProvider, PersistentVolume,
    PersistentVolumeClaim, Service,
};
use crate::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Kind of a declared resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    ResourceGroup,
    Application,
    ServicePrincipal,
    ServicePrincipalPassword,
    KubernetesCluster,
    KubernetesProvider,
    HorizontalPodAutoscaler,
    StorageAccount,
    ManagedDisk,
    PersistentVolume,
    PersistentVolumeClaim,
    Deployment,
    Service,
    Ingress,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 14] = [
        ResourceKind::ResourceGroup,
        ResourceKind::Application,
        ResourceKind::ServicePrincipal,
        ResourceKind::ServicePrincipalPassword,
        ResourceKind::KubernetesCluster,
        ResourceKind::KubernetesProvider,
        ResourceKind::HorizontalPodAutoscaler,
        ResourceKind::StorageAccount,
        ResourceKind::ManagedDisk,
        ResourceKind::PersistentVolume,
        ResourceKind::PersistentVolumeClaim,
        ResourceKind::Deployment,
        ResourceKind::Service,
        ResourceKind::Ingress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceGroup => "resource-group",
            Self::Application => "application",
            Self::ServicePrincipal => "service-principal",
            Self::ServicePrincipalPassword => "service-principal-password",
            Self::KubernetesCluster => "cluster",
            Self::KubernetesProvider => "kubernetes-provider",
            Self::HorizontalPodAutoscaler => "horizontal-pod-autoscaler",
            Self::StorageAccount => "storage-account",
            Self::ManagedDisk => "disk",
            Self::PersistentVolume => "persistent-volume",
            Self::PersistentVolumeClaim => "persistent-volume-claim",
            Self::Deployment => "deployment",
            Self::Service => "service",
            Self::Ingress => "ingress",
        }
    }

    /// Objects that live inside the cluster and are applied through a provider
    pub fn is_kubernetes_object(&self) -> bool {
        matches!(
            self,
            Self::HorizontalPodAutoscaler
                | Self::PersistentVolume
                | Self::PersistentVolumeClaim
                | Self::Deployment
                | Self::Service
                | Self::Ingress
        )
    }

    /// `apiVersion` of the rendered manifest
    pub fn api_version(&self) -> Option<&'static str> {
        match self {
            Self::HorizontalPodAutoscaler => Some("autoscaling/v2"),
            Self::PersistentVolume | Self::PersistentVolumeClaim | Self::Service => Some("v1"),
            Self::Deployment => Some("apps/v1"),
            Self::Ingress => Some("networking.k8s.io/v1"),
            _ => None,
        }
    }

    /// `kind` of the rendered manifest
    pub fn manifest_kind(&self) -> Option<&'static str> {
        match self {
            Self::HorizontalPodAutoscaler => Some("HorizontalPodAutoscaler"),
            Self::PersistentVolume => Some("PersistentVolume"),
            Self::PersistentVolumeClaim => Some("PersistentVolumeClaim"),
            Self::Deployment => Some("Deployment"),
            Self::Service => Some("Service"),
            Self::Ingress => Some("Ingress"),
            _ => None,
        }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        matches!(self, Self::PersistentVolume)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::InvalidResourceId(format!("unknown kind '{}'", s)))
    }
}

/// Logical identity of a declaration, unique within a stack
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Reference to one of this resource's outputs
    pub fn output(&self, field: &str) -> OutputRef {
        OutputRef {
            resource: self.clone(),
            field: field.to_string(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, name) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidResourceId(s.to_string()))?;
        if name.is_empty() {
            return Err(Error::InvalidResourceId(s.to_string()));
        }
        Ok(Self::new(kind.parse()?, name))
    }
}

// Serialized as "kind/name" so ids can key JSON maps
impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Reference to an output field of another resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    pub resource: ResourceId,
    pub field: String,
}

impl OutputRef {
    /// Text shown in place of a value that is only known after apply
    pub fn placeholder(&self) -> String {
        format!("${{{}}}", self)
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.field)
    }
}

/// A field value: either a literal or another resource's output
#[derive(Debug, Clone, PartialEq)]
pub enum Input<T> {
    Value(T),
    Output(OutputRef),
}

impl<T> Input<T> {
    pub fn output_ref(&self) -> Option<&OutputRef> {
        match self {
            Input::Output(r) => Some(r),
            Input::Value(_) => None,
        }
    }

    pub fn literal(&self) -> Option<&T> {
        match self {
            Input::Value(v) => Some(v),
            Input::Output(_) => None,
        }
    }
}

impl<T: Clone + Serialize + DeserializeOwned> Input<T> {
    /// Resolve against recorded outputs
    pub fn resolve(&self, outputs: &Outputs) -> Result<T> {
        match self {
            Input::Value(v) => Ok(v.clone()),
            Input::Output(r) => {
                let value = outputs
                    .get(r)
                    .filter(|v| !v.is_null())
                    .ok_or_else(|| Error::UnresolvedOutput(r.to_string()))?;
                Ok(serde_json::from_value(value.clone())?)
            }
        }
    }

    /// Render for a desired-state document, falling back to a placeholder
    pub fn render(&self, outputs: &Outputs) -> Value {
        match self {
            Input::Value(v) => serde_json::to_value(v).unwrap_or(Value::Null),
            Input::Output(r) => match outputs.get(r) {
                Some(v) if !v.is_null() => v.clone(),
                _ => Value::String(r.placeholder()),
            },
        }
    }
}

impl<T> From<OutputRef> for Input<T> {
    fn from(r: OutputRef) -> Self {
        Input::Output(r)
    }
}

impl From<&str> for Input<String> {
    fn from(s: &str) -> Self {
        Input::Value(s.to_string())
    }
}

impl From<String> for Input<String> {
    fn from(s: String) -> Self {
        Input::Value(s)
    }
}

/// Output fields that never appear unmasked in listings
pub const SENSITIVE_FIELDS: &[&str] = &["value", "kube_config_raw", "client_secret"];

pub fn is_sensitive(field: &str) -> bool {
    SENSITIVE_FIELDS.contains(&field)
}

/// Output fields recorded for realised resources
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outputs {
    resources: BTreeMap<ResourceId, BTreeMap<String, Value>>,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outputs of a realised resource, replacing earlier ones
    pub fn record(&mut self, id: ResourceId, fields: BTreeMap<String, Value>) {
        self.resources.insert(id, fields);
    }

    pub fn get(&self, output: &OutputRef) -> Option<&Value> {
        self.resources
            .get(&output.resource)
            .and_then(|fields| fields.get(&output.field))
    }

    pub fn fields(&self, id: &ResourceId) -> Option<&BTreeMap<String, Value>> {
        self.resources.get(id)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.resources.contains_key(id)
    }

    pub fn remove(&mut self, id: &ResourceId) -> Option<BTreeMap<String, Value>> {
        self.resources.remove(id)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, &BTreeMap<String, Value>)> {
        self.resources.iter()
    }
}

/// Ordering options of a declaration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceOptions {
    /// Resources that must be realised before this one
    pub depends_on: Vec<ResourceId>,
    /// Kubernetes provider that applies this object
    pub provider: Option<ResourceId>,
}

impl ResourceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: &ResourceId) -> Self {
        self.provider = Some(provider.clone());
        self
    }

    pub fn with_depends_on(mut self, ids: &[&ResourceId]) -> Self {
        self.depends_on.extend(ids.iter().map(|id| (*id).clone()));
        self
    }
}

/// Behaviour shared by every typed spec
pub trait DesiredState {
    /// Outputs of other resources this spec reads
    fn references(&self) -> Vec<&OutputRef> {
        Vec::new()
    }

    /// Check literal values; `name` is the declaration's logical name
    fn validate(&self, name: &str) -> Result<()>;

    /// Desired-state document: an ARM/Graph request body or a Kubernetes manifest
    fn render(&self, outputs: &Outputs) -> Value;
}

/// Typed spec of a declaration
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSpec {
    ResourceGroup(ResourceGroup),
    Application(Application),
    ServicePrincipal(ServicePrincipal),
    ServicePrincipalPassword(ServicePrincipalPassword),
    KubernetesCluster(KubernetesCluster),
    KubernetesProvider(KubernetesProvider),
    HorizontalPodAutoscaler(HorizontalPodAutoscaler),
    StorageAccount(StorageAccount),
    ManagedDisk(ManagedDisk),
    PersistentVolume(PersistentVolume),
    PersistentVolumeClaim(PersistentVolumeClaim),
    Deployment(Deployment),
    Service(Service),
    Ingress(Ingress),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::ResourceGroup(_) => ResourceKind::ResourceGroup,
            Self::Application(_) => ResourceKind::Application,
            Self::ServicePrincipal(_) => ResourceKind::ServicePrincipal,
            Self::ServicePrincipalPassword(_) => ResourceKind::ServicePrincipalPassword,
            Self::KubernetesCluster(_) => ResourceKind::KubernetesCluster,
            Self::KubernetesProvider(_) => ResourceKind::KubernetesProvider,
            Self::HorizontalPodAutoscaler(_) => ResourceKind::HorizontalPodAutoscaler,
            Self::StorageAccount(_) => ResourceKind::StorageAccount,
            Self::ManagedDisk(_) => ResourceKind::ManagedDisk,
            Self::PersistentVolume(_) => ResourceKind::PersistentVolume,
            Self::PersistentVolumeClaim(_) => ResourceKind::PersistentVolumeClaim,
            Self::Deployment(_) => ResourceKind::Deployment,
            Self::Service(_) => ResourceKind::Service,
            Self::Ingress(_) => ResourceKind::Ingress,
        }
    }

    pub fn as_desired_state(&self) -> &dyn DesiredState {
        match self {
            Self::ResourceGroup(s) => s,
            Self::Application(s) => s,
            Self::ServicePrincipal(s) => s,
            Self::ServicePrincipalPassword(s) => s,
            Self::KubernetesCluster(s) => s,
            Self::KubernetesProvider(s) => s,
            Self::HorizontalPodAutoscaler(s) => s,
            Self::StorageAccount(s) => s,
            Self::ManagedDisk(s) => s,
            Self::PersistentVolume(s) => s,
            Self::PersistentVolumeClaim(s) => s,
            Self::Deployment(s) => s,
            Self::Service(s) => s,
            Self::Ingress(s) => s,
        }
    }

    /// In-cluster object name, for Kubernetes kinds
    pub fn object_name(&self) -> Option<&str> {
        match self {
            Self::HorizontalPodAutoscaler(s) => Some(&s.metadata.name),
            Self::PersistentVolume(s) => Some(&s.metadata.name),
            Self::PersistentVolumeClaim(s) => Some(&s.metadata.name),
            Self::Deployment(s) => Some(&s.metadata.name),
            Self::Service(s) => Some(&s.metadata.name),
            Self::Ingress(s) => Some(&s.metadata.name),
            _ => None,
        }
    }

    /// Namespace the object is applied to; `None` for cluster-scoped and Azure kinds
    pub fn object_namespace(&self) -> Option<&str> {
        let metadata = match self {
            Self::HorizontalPodAutoscaler(s) => &s.metadata,
            Self::PersistentVolumeClaim(s) => &s.metadata,
            Self::Deployment(s) => &s.metadata,
            Self::Service(s) => &s.metadata,
            Self::Ingress(s) => &s.metadata,
            _ => return None,
        };
        Some(metadata.namespace.as_deref().unwrap_or("default"))
    }
}

/// A declared resource
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub id: ResourceId,
    pub spec: ResourceSpec,
    pub options: ResourceOptions,
}

impl Declaration {
    pub fn new(name: &str, spec: ResourceSpec) -> Self {
        Self {
            id: ResourceId::new(spec.kind(), name),
            spec,
            options: ResourceOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ResourceOptions) -> Self {
        self.options = options;
        self
    }

    /// Every resource that must be realised first: explicit hints, the
    /// provider, and the owners of referenced outputs
    pub fn dependencies(&self) -> BTreeSet<ResourceId> {
        let mut deps: BTreeSet<ResourceId> = self.options.depends_on.iter().cloned().collect();
        if let Some(provider) = &self.options.provider {
            deps.insert(provider.clone());
        }
        for output in self.spec.as_desired_state().references() {
            deps.insert(output.resource.clone());
        }
        deps.remove(&self.id);
        deps
    }

    pub fn validate(&self) -> Result<()> {
        self.spec.as_desired_state().validate(&self.id.name)
    }

    pub fn render(&self, outputs: &Outputs) -> Value {
        self.spec.as_desired_state().render(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_id() -> ResourceId {
        ResourceId::new(ResourceKind::KubernetesCluster, "myAKSCluster")
    }

    #[test]
    fn test_resource_id_display_and_parse() {
        let id = cluster_id();
        assert_eq!(id.to_string(), "cluster/myAKSCluster");

        let parsed: ResourceId = "cluster/myAKSCluster".parse().unwrap();
        assert_eq!(parsed, id);

        assert!("cluster".parse::<ResourceId>().is_err());
        assert!("cluster/".parse::<ResourceId>().is_err());
        assert!("widget/foo".parse::<ResourceId>().is_err());
    }

    #[test]
    fn test_kinds_round_trip_through_names() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_kubernetes_kinds_have_manifest_types() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.is_kubernetes_object(), kind.api_version().is_some());
            assert_eq!(kind.is_kubernetes_object(), kind.manifest_kind().is_some());
        }
        assert!(ResourceKind::PersistentVolume.is_cluster_scoped());
        assert!(!ResourceKind::PersistentVolumeClaim.is_cluster_scoped());
    }

    #[test]
    fn test_input_resolution() {
        let kubeconfig = cluster_id().output("kube_config_raw");
        let input: Input<String> = kubeconfig.clone().into();

        let mut outputs = Outputs::new();
        assert!(matches!(
            input.resolve(&outputs),
            Err(Error::UnresolvedOutput(_))
        ));
        assert_eq!(
            input.render(&outputs),
            Value::String("${cluster/myAKSCluster.kube_config_raw}".to_string())
        );

        let mut fields = BTreeMap::new();
        fields.insert("kube_config_raw".to_string(), Value::String("apiVersion: v1".into()));
        outputs.record(cluster_id(), fields);

        assert_eq!(input.resolve(&outputs).unwrap(), "apiVersion: v1");
        assert_eq!(Input::from("eastus").resolve(&outputs).unwrap(), "eastus");
    }

    #[test]
    fn test_null_output_is_unresolved() {
        let ip = ResourceId::new(ResourceKind::Service, "wordpress-service").output("load_balancer_ip");
        let mut outputs = Outputs::new();
        let mut fields = BTreeMap::new();
        fields.insert("load_balancer_ip".to_string(), Value::Null);
        outputs.record(ip.resource.clone(), fields);

        let input: Input<String> = ip.into();
        assert!(input.resolve(&outputs).is_err());
    }

    #[test]
    fn test_outputs_serialize_with_string_keys() {
        let mut outputs = Outputs::new();
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), Value::String("/subscriptions/x".into()));
        outputs.record(ResourceId::new(ResourceKind::ResourceGroup, "myResourceGroup"), fields);

        let json = serde_json::to_value(&outputs).unwrap();
        assert!(json["resources"]["resource-group/myResourceGroup"]["id"].is_string());

        let back: Outputs = serde_json::from_value(json).unwrap();
        assert_eq!(back, outputs);
    }

    #[test]
    fn test_sensitive_fields() {
        assert!(is_sensitive("kube_config_raw"));
        assert!(is_sensitive("value"));
        assert!(!is_sensitive("id"));
    }
}
