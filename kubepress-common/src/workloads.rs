//! Kubernetes declarations
//!
//! Simplified representations of the objects the stack applies to the
//! cluster. `render` emits the full manifest with the Kubernetes API's
//! field names.

use crate::quantity::parse_quantity;
use crate::resource::{DesiredState, Input, OutputRef, Outputs, ResourceKind};
use crate::{invalid, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};

/// Object name, namespace and labels
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn in_namespace(mut self, namespace: Option<&str>) -> Self {
        self.namespace = namespace.map(String::from);
        self
    }

    fn validate(&self, resource: &str) -> Result<()> {
        validate_dns_subdomain(resource, &self.name)?;
        if let Some(ns) = &self.namespace {
            validate_dns_label(resource, ns)?;
        }
        Ok(())
    }

    fn render(&self) -> Value {
        let mut meta = Map::new();
        meta.insert("name".into(), json!(self.name));
        if let Some(ns) = &self.namespace {
            meta.insert("namespace".into(), json!(ns));
        }
        if !self.labels.is_empty() {
            meta.insert("labels".into(), json!(self.labels));
        }
        Value::Object(meta)
    }
}

fn manifest(kind: ResourceKind, metadata: &ObjectMeta, spec: Value) -> Value {
    json!({
        "apiVersion": kind.api_version(),
        "kind": kind.manifest_kind(),
        "metadata": metadata.render(),
        "spec": spec,
    })
}

/// Kubernetes API client bound to a cluster's kubeconfig
#[derive(Debug, Clone, PartialEq)]
pub struct KubernetesProvider {
    pub kubeconfig: Input<String>,
}

impl DesiredState for KubernetesProvider {
    fn references(&self) -> Vec<&OutputRef> {
        self.kubeconfig.output_ref().into_iter().collect()
    }

    fn validate(&self, name: &str) -> Result<()> {
        match self.kubeconfig.literal() {
            Some(k) if k.trim().is_empty() => Err(invalid(name, "kubeconfig is empty")),
            _ => Ok(()),
        }
    }

    fn render(&self, _outputs: &Outputs) -> Value {
        // The kubeconfig carries credentials; only its source is shown
        let source = match &self.kubeconfig {
            Input::Output(r) => r.placeholder(),
            Input::Value(_) => "(inline kubeconfig)".to_string(),
        };
        json!({ "kubeconfig": source })
    }
}

/// Workload an autoscaler resizes
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleTargetRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

/// Resource utilisation target of an autoscaler
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceMetric {
    /// `cpu` or `memory`
    pub resource: String,
    /// Average utilisation in percent of the request
    pub average_utilization: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HorizontalPodAutoscaler {
    pub metadata: ObjectMeta,
    pub scale_target_ref: ScaleTargetRef,
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub metrics: Vec<ResourceMetric>,
}

impl DesiredState for HorizontalPodAutoscaler {
    fn validate(&self, name: &str) -> Result<()> {
        self.metadata.validate(name)?;
        if self.min_replicas < 1 {
            return Err(invalid(name, "minReplicas must be at least 1"));
        }
        if self.min_replicas > self.max_replicas {
            return Err(invalid(
                name,
                format!(
                    "minReplicas {} is greater than maxReplicas {}",
                    self.min_replicas, self.max_replicas
                ),
            ));
        }
        if self.scale_target_ref.name.is_empty() || self.scale_target_ref.kind.is_empty() {
            return Err(invalid(name, "scaleTargetRef needs a kind and a name"));
        }

        let mut seen = HashSet::new();
        for metric in &self.metrics {
            if !["cpu", "memory"].contains(&metric.resource.as_str()) {
                return Err(invalid(name, format!("unsupported metric '{}'", metric.resource)));
            }
            if !seen.insert(metric.resource.as_str()) {
                return Err(invalid(name, format!("metric '{}' listed twice", metric.resource)));
            }
            if !(1..=100).contains(&metric.average_utilization) {
                return Err(invalid(
                    name,
                    format!(
                        "{} utilization {} is outside 1..=100",
                        metric.resource, metric.average_utilization
                    ),
                ));
            }
        }
        Ok(())
    }

    fn render(&self, _outputs: &Outputs) -> Value {
        let metrics: Vec<Value> = self
            .metrics
            .iter()
            .map(|m| {
                json!({
                    "type": "Resource",
                    "resource": {
                        "name": m.resource,
                        "target": {
                            "type": "Utilization",
                            "averageUtilization": m.average_utilization,
                        }
                    }
                })
            })
            .collect();

        manifest(
            ResourceKind::HorizontalPodAutoscaler,
            &self.metadata,
            json!({
                "scaleTargetRef": {
                    "apiVersion": self.scale_target_ref.api_version,
                    "kind": self.scale_target_ref.kind,
                    "name": self.scale_target_ref.name,
                },
                "minReplicas": self.min_replicas,
                "maxReplicas": self.max_replicas,
                "metrics": metrics,
            }),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
    ReadWriteOncePod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReclaimPolicy {
    Retain,
    Delete,
    Recycle,
}

/// Azure managed disk mounted through the in-tree `azureDisk` source
#[derive(Debug, Clone, PartialEq)]
pub struct AzureDiskSource {
    pub disk_name: Input<String>,
    pub disk_uri: Input<String>,
    pub kind: String,
    pub caching_mode: String,
    pub fs_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistentVolume {
    pub metadata: ObjectMeta,
    pub capacity: String,
    pub access_modes: Vec<AccessMode>,
    pub reclaim_policy: ReclaimPolicy,
    pub storage_class_name: Option<String>,
    pub azure_disk: AzureDiskSource,
}

impl PersistentVolume {
    pub fn capacity_bytes(&self) -> Result<u64> {
        parse_quantity(&self.capacity)
    }
}

impl DesiredState for PersistentVolume {
    fn references(&self) -> Vec<&OutputRef> {
        [&self.azure_disk.disk_name, &self.azure_disk.disk_uri]
            .into_iter()
            .filter_map(|i| i.output_ref())
            .collect()
    }

    fn validate(&self, name: &str) -> Result<()> {
        self.metadata.validate(name)?;
        if self.metadata.namespace.is_some() {
            return Err(invalid(name, "persistent volumes are cluster-scoped"));
        }
        if self.capacity_bytes()? == 0 {
            return Err(invalid(name, "capacity must be positive"));
        }
        if self.access_modes.is_empty() {
            return Err(invalid(name, "at least one access mode is required"));
        }
        let disk = &self.azure_disk;
        if !["Shared", "Dedicated", "Managed"].contains(&disk.kind.as_str()) {
            return Err(invalid(name, format!("unknown azureDisk kind '{}'", disk.kind)));
        }
        if !["None", "ReadOnly", "ReadWrite"].contains(&disk.caching_mode.as_str()) {
            return Err(invalid(
                name,
                format!("unknown cachingMode '{}'", disk.caching_mode),
            ));
        }
        if disk.fs_type.is_empty() {
            return Err(invalid(name, "fsType is required"));
        }
        Ok(())
    }

    fn render(&self, outputs: &Outputs) -> Value {
        let mut spec = json!({
            "capacity": { "storage": self.capacity },
            "accessModes": self.access_modes,
            "persistentVolumeReclaimPolicy": self.reclaim_policy,
            "azureDisk": {
                "diskName": self.azure_disk.disk_name.render(outputs),
                "diskURI": self.azure_disk.disk_uri.render(outputs),
                "kind": self.azure_disk.kind,
                "cachingMode": self.azure_disk.caching_mode,
                "fsType": self.azure_disk.fs_type,
            }
        });
        if let Some(class) = &self.storage_class_name {
            spec["storageClassName"] = json!(class);
        }
        manifest(ResourceKind::PersistentVolume, &self.metadata, spec)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistentVolumeClaim {
    pub metadata: ObjectMeta,
    pub access_modes: Vec<AccessMode>,
    pub storage_request: String,
    pub storage_class_name: Option<String>,
    /// Pre-provisioned volume to bind to
    pub volume_name: Option<String>,
}

impl PersistentVolumeClaim {
    pub fn request_bytes(&self) -> Result<u64> {
        parse_quantity(&self.storage_request)
    }

    /// Check that this claim can bind to `volume`
    pub fn fits(&self, volume: &PersistentVolume) -> Result<()> {
        let name = &self.metadata.name;
        if self.request_bytes()? > volume.capacity_bytes()? {
            return Err(invalid(
                name,
                format!(
                    "requests {} but volume {} holds {}",
                    self.storage_request, volume.metadata.name, volume.capacity
                ),
            ));
        }
        if let Some(mode) = self
            .access_modes
            .iter()
            .find(|m| !volume.access_modes.contains(m))
        {
            return Err(invalid(
                name,
                format!("volume {} does not offer {:?}", volume.metadata.name, mode),
            ));
        }
        Ok(())
    }
}

impl DesiredState for PersistentVolumeClaim {
    fn validate(&self, name: &str) -> Result<()> {
        self.metadata.validate(name)?;
        if self.request_bytes()? == 0 {
            return Err(invalid(name, "storage request must be positive"));
        }
        if self.access_modes.is_empty() {
            return Err(invalid(name, "at least one access mode is required"));
        }
        Ok(())
    }

    fn render(&self, _outputs: &Outputs) -> Value {
        let mut spec = json!({
            "accessModes": self.access_modes,
            "resources": {
                "requests": { "storage": self.storage_request }
            }
        });
        if let Some(class) = &self.storage_class_name {
            spec["storageClassName"] = json!(class);
        }
        if let Some(volume) = &self.volume_name {
            spec["volumeName"] = json!(volume);
        }
        manifest(ResourceKind::PersistentVolumeClaim, &self.metadata, spec)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerPort {
    pub container_port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub env: Vec<EnvVar>,
    pub ports: Vec<ContainerPort>,
    pub volume_mounts: Vec<VolumeMount>,
}

impl Container {
    fn render(&self) -> Value {
        let mut container = json!({
            "name": self.name,
            "image": self.image,
        });
        if !self.env.is_empty() {
            container["env"] = json!(self.env);
        }
        if !self.ports.is_empty() {
            let ports: Vec<Value> = self
                .ports
                .iter()
                .map(|p| json!({ "containerPort": p.container_port }))
                .collect();
            container["ports"] = json!(ports);
        }
        if !self.volume_mounts.is_empty() {
            let mounts: Vec<Value> = self
                .volume_mounts
                .iter()
                .map(|m| json!({ "name": m.name, "mountPath": m.mount_path }))
                .collect();
            container["volumeMounts"] = json!(mounts);
        }
        container
    }
}

/// Pod volume backed by a claim
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub name: String,
    pub claim_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    pub metadata: ObjectMeta,
    pub replicas: i32,
    /// Selector and pod template labels
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<Container>,
    pub volumes: Vec<Volume>,
}

impl DesiredState for Deployment {
    fn validate(&self, name: &str) -> Result<()> {
        self.metadata.validate(name)?;
        if self.replicas < 0 {
            return Err(invalid(name, "replicas cannot be negative"));
        }
        if self.labels.is_empty() {
            return Err(invalid(name, "a selector label is required"));
        }
        if self.containers.is_empty() {
            return Err(invalid(name, "at least one container is required"));
        }

        let volumes: HashSet<&str> = self.volumes.iter().map(|v| v.name.as_str()).collect();
        if volumes.len() != self.volumes.len() {
            return Err(invalid(name, "volume names must be unique"));
        }
        let mut containers = HashSet::new();
        for container in &self.containers {
            validate_dns_label(name, &container.name)?;
            if !containers.insert(container.name.as_str()) {
                return Err(invalid(name, format!("container '{}' listed twice", container.name)));
            }
            if container.image.trim().is_empty() {
                return Err(invalid(name, format!("container '{}' has no image", container.name)));
            }
            let mut env = HashSet::new();
            for var in &container.env {
                if !is_env_name(&var.name) || !env.insert(var.name.as_str()) {
                    return Err(invalid(name, format!("bad or repeated env var '{}'", var.name)));
                }
            }
            if container.ports.iter().any(|p| p.container_port == 0) {
                return Err(invalid(name, "container port 0 is not valid"));
            }
            for mount in &container.volume_mounts {
                if !volumes.contains(mount.name.as_str()) {
                    return Err(invalid(
                        name,
                        format!("mount '{}' names no declared volume", mount.name),
                    ));
                }
                if !mount.mount_path.starts_with('/') {
                    return Err(invalid(
                        name,
                        format!("mount path '{}' must be absolute", mount.mount_path),
                    ));
                }
            }
        }
        Ok(())
    }

    fn render(&self, _outputs: &Outputs) -> Value {
        let containers: Vec<Value> = self.containers.iter().map(Container::render).collect();
        let mut pod_spec = json!({ "containers": containers });
        if !self.volumes.is_empty() {
            let volumes: Vec<Value> = self
                .volumes
                .iter()
                .map(|v| {
                    json!({
                        "name": v.name,
                        "persistentVolumeClaim": { "claimName": v.claim_name }
                    })
                })
                .collect();
            pod_spec["volumes"] = json!(volumes);
        }

        manifest(
            ResourceKind::Deployment,
            &self.metadata,
            json!({
                "replicas": self.replicas,
                "selector": { "matchLabels": self.labels },
                "template": {
                    "metadata": { "labels": self.labels },
                    "spec": pod_spec,
                }
            }),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    #[serde(rename = "ClusterIP")]
    ClusterIp,
    NodePort,
    LoadBalancer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServicePort {
    pub protocol: Protocol,
    pub port: u16,
    pub target_port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub metadata: ObjectMeta,
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<ServicePort>,
    pub service_type: ServiceType,
}

impl Service {
    pub fn exposes(&self, port: u16) -> bool {
        self.ports.iter().any(|p| p.port == port)
    }
}

impl DesiredState for Service {
    fn validate(&self, name: &str) -> Result<()> {
        self.metadata.validate(name)?;
        validate_dns_label(name, &self.metadata.name)?;
        if self.selector.is_empty() {
            return Err(invalid(name, "a selector is required"));
        }
        if self.ports.is_empty() {
            return Err(invalid(name, "at least one port is required"));
        }
        let mut seen = HashSet::new();
        for port in &self.ports {
            if port.port == 0 || port.target_port == 0 {
                return Err(invalid(name, "port 0 is not valid"));
            }
            if !seen.insert((port.port, port.protocol)) {
                return Err(invalid(name, format!("port {} listed twice", port.port)));
            }
        }
        Ok(())
    }

    fn render(&self, _outputs: &Outputs) -> Value {
        let ports: Vec<Value> = self
            .ports
            .iter()
            .map(|p| {
                json!({
                    "protocol": p.protocol,
                    "port": p.port,
                    "targetPort": p.target_port,
                })
            })
            .collect();
        manifest(
            ResourceKind::Service,
            &self.metadata,
            json!({
                "selector": self.selector,
                "ports": ports,
                "type": self.service_type,
            }),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathType {
    Prefix,
    Exact,
    ImplementationSpecific,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngressPath {
    pub path: String,
    pub path_type: PathType,
    pub service_name: String,
    pub service_port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngressRule {
    pub host: Option<String>,
    pub paths: Vec<IngressPath>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ingress {
    pub metadata: ObjectMeta,
    pub ingress_class_name: Option<String>,
    pub rules: Vec<IngressRule>,
}

impl Ingress {
    pub fn backends(&self) -> impl Iterator<Item = &IngressPath> {
        self.rules.iter().flat_map(|r| r.paths.iter())
    }
}

impl DesiredState for Ingress {
    fn validate(&self, name: &str) -> Result<()> {
        self.metadata.validate(name)?;
        if self.rules.is_empty() {
            return Err(invalid(name, "at least one rule is required"));
        }
        for rule in &self.rules {
            if let Some(host) = &rule.host {
                let bare = host.strip_prefix("*.").unwrap_or(host);
                validate_dns_subdomain(name, bare)?;
            }
            if rule.paths.is_empty() {
                return Err(invalid(name, "every rule needs at least one path"));
            }
            for path in &rule.paths {
                if !path.path.starts_with('/') {
                    return Err(invalid(name, format!("path '{}' must start with '/'", path.path)));
                }
                if path.service_port == 0 {
                    return Err(invalid(name, "backend port 0 is not valid"));
                }
            }
        }
        Ok(())
    }

    fn render(&self, _outputs: &Outputs) -> Value {
        let rules: Vec<Value> = self
            .rules
            .iter()
            .map(|r| {
                let paths: Vec<Value> = r
                    .paths
                    .iter()
                    .map(|p| {
                        json!({
                            "path": p.path,
                            "pathType": p.path_type,
                            "backend": {
                                "service": {
                                    "name": p.service_name,
                                    "port": { "number": p.service_port }
                                }
                            }
                        })
                    })
                    .collect();
                let mut rule = json!({ "http": { "paths": paths } });
                if let Some(host) = &r.host {
                    rule["host"] = json!(host);
                }
                rule
            })
            .collect();

        let mut spec = json!({ "rules": rules });
        if let Some(class) = &self.ingress_class_name {
            spec["ingressClassName"] = json!(class);
        }
        manifest(ResourceKind::Ingress, &self.metadata, spec)
    }
}

/// RFC 1123 subdomain: lowercase alphanumerics, '-' and '.', at most 253 characters
fn validate_dns_subdomain(resource: &str, value: &str) -> Result<()> {
    let ok = !value.is_empty()
        && value.len() <= 253
        && value.split('.').all(is_dns_label);
    if !ok {
        return Err(invalid(resource, format!("'{}' is not a valid DNS subdomain", value)));
    }
    Ok(())
}

fn validate_dns_label(resource: &str, value: &str) -> Result<()> {
    if !is_dns_label(value) {
        return Err(invalid(resource, format!("'{}' is not a valid DNS label", value)));
    }
    Ok(())
}

fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && value.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn is_env_name(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with(|c: char| c.is_ascii_digit())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}
