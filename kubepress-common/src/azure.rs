//! Azure declarations: resource group, AD identity, AKS cluster, storage
//!
//! `render` produces the Azure Resource Manager (or Microsoft Graph) request
//! body. Names and resource groups travel in the request path, not the body.

use crate::resource::{DesiredState, Input, OutputRef, Outputs};
use crate::{invalid, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Azure resource group
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceGroup {
    pub location: String,
}

impl DesiredState for ResourceGroup {
    fn validate(&self, name: &str) -> Result<()> {
        validate_location(name, &self.location)?;
        if name.is_empty() || name.len() > 90 || name.ends_with('.') {
            return Err(invalid(name, "resource group names are 1-90 characters and cannot end with '.'"));
        }
        Ok(())
    }

    fn render(&self, _outputs: &Outputs) -> Value {
        json!({ "location": self.location })
    }
}

/// Azure AD application registration
#[derive(Debug, Clone, PartialEq)]
pub struct Application {
    pub display_name: String,
}

impl DesiredState for Application {
    fn validate(&self, name: &str) -> Result<()> {
        if self.display_name.trim().is_empty() {
            return Err(invalid(name, "display_name is required"));
        }
        Ok(())
    }

    fn render(&self, _outputs: &Outputs) -> Value {
        json!({ "displayName": self.display_name })
    }
}

/// Service principal for an application
#[derive(Debug, Clone, PartialEq)]
pub struct ServicePrincipal {
    pub application_id: Input<String>,
}

impl DesiredState for ServicePrincipal {
    fn references(&self) -> Vec<&OutputRef> {
        self.application_id.output_ref().into_iter().collect()
    }

    fn validate(&self, name: &str) -> Result<()> {
        require_literal(name, "application_id", &self.application_id)
    }

    fn render(&self, outputs: &Outputs) -> Value {
        json!({ "appId": self.application_id.render(outputs) })
    }
}

/// Client secret of a service principal
#[derive(Debug, Clone, PartialEq)]
pub struct ServicePrincipalPassword {
    pub service_principal_id: Input<String>,
    pub display_name: String,
    /// RFC 3339 expiry
    pub end_date: String,
}

impl DesiredState for ServicePrincipalPassword {
    fn references(&self) -> Vec<&OutputRef> {
        self.service_principal_id.output_ref().into_iter().collect()
    }

    fn validate(&self, name: &str) -> Result<()> {
        require_literal(name, "service_principal_id", &self.service_principal_id)?;
        let end = chrono::DateTime::parse_from_rfc3339(&self.end_date)
            .map_err(|e| invalid(name, format!("end_date '{}': {}", self.end_date, e)))?;
        if end <= chrono::Utc::now() {
            return Err(invalid(name, format!("end_date {} is in the past", self.end_date)));
        }
        Ok(())
    }

    fn render(&self, _outputs: &Outputs) -> Value {
        json!({
            "passwordCredential": {
                "displayName": self.display_name,
                "endDateTime": self.end_date,
            }
        })
    }
}

/// AKS default node pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePool {
    pub name: String,
    pub node_count: u32,
    pub vm_size: String,
    pub enable_auto_scaling: bool,
    pub min_count: Option<u32>,
    pub max_count: Option<u32>,
}

impl NodePool {
    fn validate(&self, cluster: &str) -> Result<()> {
        let valid_name = !self.name.is_empty()
            && self.name.len() <= 12
            && self.name.starts_with(|c: char| c.is_ascii_lowercase())
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        if !valid_name {
            return Err(invalid(
                cluster,
                format!("node pool name '{}' must be 1-12 lowercase alphanumerics", self.name),
            ));
        }
        if self.vm_size.trim().is_empty() {
            return Err(invalid(cluster, "node pool vm_size is required"));
        }

        if self.enable_auto_scaling {
            let (min, max) = match (self.min_count, self.max_count) {
                (Some(min), Some(max)) => (min, max),
                _ => {
                    return Err(invalid(
                        cluster,
                        "min_count and max_count are required when auto scaling is enabled",
                    ))
                }
            };
            if min == 0 {
                return Err(invalid(cluster, "min_count must be at least 1"));
            }
            if min > max {
                return Err(invalid(
                    cluster,
                    format!("min_count {} is greater than max_count {}", min, max),
                ));
            }
            if self.node_count < min || self.node_count > max {
                return Err(invalid(
                    cluster,
                    format!(
                        "node_count {} is outside the auto scaling range {}..={}",
                        self.node_count, min, max
                    ),
                ));
            }
        } else {
            if self.min_count.is_some() || self.max_count.is_some() {
                return Err(invalid(
                    cluster,
                    "min_count and max_count require enable_auto_scaling",
                ));
            }
            if self.node_count == 0 {
                return Err(invalid(cluster, "node_count must be at least 1"));
            }
        }
        Ok(())
    }

    fn render(&self) -> Value {
        let mut profile = json!({
            "name": self.name,
            "count": self.node_count,
            "vmSize": self.vm_size,
            "mode": "System",
            "type": "VirtualMachineScaleSets",
            "osType": "Linux",
            "enableAutoScaling": self.enable_auto_scaling,
        });
        if let Some(min) = self.min_count {
            profile["minCount"] = json!(min);
        }
        if let Some(max) = self.max_count {
            profile["maxCount"] = json!(max);
        }
        profile
    }
}

/// Admin access to the cluster's Linux nodes
#[derive(Debug, Clone, PartialEq)]
pub struct LinuxProfile {
    pub admin_username: String,
    /// OpenSSH public key
    pub ssh_key: String,
}

const RESERVED_ADMIN_NAMES: &[&str] = &["admin", "administrator", "root", "guest", "user"];

const SSH_KEY_TYPES: &[&str] = &[
    "ssh-rsa",
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
];

impl LinuxProfile {
    fn validate(&self, cluster: &str) -> Result<()> {
        if self.admin_username.is_empty()
            || RESERVED_ADMIN_NAMES.contains(&self.admin_username.to_lowercase().as_str())
        {
            return Err(invalid(
                cluster,
                format!("admin username '{}' is not allowed", self.admin_username),
            ));
        }
        validate_ssh_key(cluster, &self.ssh_key)
    }
}

pub(crate) fn validate_ssh_key(resource: &str, key: &str) -> Result<()> {
    let mut parts = key.split_whitespace();
    let key_type = parts.next().unwrap_or_default();
    let body = parts.next().unwrap_or_default();
    if !SSH_KEY_TYPES.contains(&key_type) || body.is_empty() {
        return Err(invalid(resource, "ssh key must be an OpenSSH public key"));
    }
    Ok(())
}

/// How the cluster authenticates against Azure
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterIdentity {
    ServicePrincipal {
        client_id: Input<String>,
        client_secret: Input<String>,
    },
    SystemAssigned,
}

/// Optional cluster network settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkProfile {
    pub network_plugin: String,
    #[serde(default)]
    pub network_policy: Option<String>,
    #[serde(default)]
    pub load_balancer_sku: Option<String>,
}

impl NetworkProfile {
    fn validate(&self, cluster: &str) -> Result<()> {
        if !["azure", "kubenet", "none"].contains(&self.network_plugin.as_str()) {
            return Err(invalid(
                cluster,
                format!("unknown network plugin '{}'", self.network_plugin),
            ));
        }
        if let Some(policy) = &self.network_policy {
            if !["azure", "calico", "cilium"].contains(&policy.as_str()) {
                return Err(invalid(cluster, format!("unknown network policy '{}'", policy)));
            }
        }
        if let Some(sku) = &self.load_balancer_sku {
            if !["standard", "basic"].contains(&sku.to_lowercase().as_str()) {
                return Err(invalid(cluster, format!("unknown load balancer sku '{}'", sku)));
            }
        }
        Ok(())
    }

    fn render(&self) -> Value {
        let mut profile = Map::new();
        profile.insert("networkPlugin".into(), json!(self.network_plugin));
        if let Some(policy) = &self.network_policy {
            profile.insert("networkPolicy".into(), json!(policy));
        }
        if let Some(sku) = &self.load_balancer_sku {
            profile.insert("loadBalancerSku".into(), json!(sku.to_lowercase()));
        }
        Value::Object(profile)
    }
}

/// Managed Kubernetes cluster
#[derive(Debug, Clone, PartialEq)]
pub struct KubernetesCluster {
    pub resource_group_name: Input<String>,
    pub location: Input<String>,
    pub dns_prefix: String,
    pub kubernetes_version: Option<String>,
    pub default_node_pool: NodePool,
    pub linux_profile: LinuxProfile,
    pub identity: ClusterIdentity,
    pub network_profile: Option<NetworkProfile>,
}

impl DesiredState for KubernetesCluster {
    fn references(&self) -> Vec<&OutputRef> {
        let mut refs: Vec<&OutputRef> = [&self.resource_group_name, &self.location]
            .into_iter()
            .filter_map(|i| i.output_ref())
            .collect();
        if let ClusterIdentity::ServicePrincipal {
            client_id,
            client_secret,
        } = &self.identity
        {
            refs.extend(client_id.output_ref());
            refs.extend(client_secret.output_ref());
        }
        refs
    }

    fn validate(&self, name: &str) -> Result<()> {
        require_literal(name, "resource_group_name", &self.resource_group_name)?;
        if let Some(location) = self.location.literal() {
            validate_location(name, location)?;
        }

        let prefix_ok = !self.dns_prefix.is_empty()
            && self.dns_prefix.len() <= 54
            && self.dns_prefix.starts_with(|c: char| c.is_ascii_alphanumeric())
            && self.dns_prefix.ends_with(|c: char| c.is_ascii_alphanumeric())
            && self
                .dns_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !prefix_ok {
            return Err(invalid(name, format!("invalid dns_prefix '{}'", self.dns_prefix)));
        }

        self.default_node_pool.validate(name)?;
        self.linux_profile.validate(name)?;
        if let ClusterIdentity::ServicePrincipal {
            client_id,
            client_secret,
        } = &self.identity
        {
            require_literal(name, "client_id", client_id)?;
            require_literal(name, "client_secret", client_secret)?;
        }
        if let Some(network) = &self.network_profile {
            network.validate(name)?;
        }
        Ok(())
    }

    fn render(&self, outputs: &Outputs) -> Value {
        let mut properties = json!({
            "dnsPrefix": self.dns_prefix,
            "agentPoolProfiles": [self.default_node_pool.render()],
            "linuxProfile": {
                "adminUsername": self.linux_profile.admin_username,
                "ssh": {
                    "publicKeys": [{ "keyData": self.linux_profile.ssh_key }]
                }
            }
        });
        if let Some(version) = &self.kubernetes_version {
            properties["kubernetesVersion"] = json!(version);
        }
        if let Some(network) = &self.network_profile {
            properties["networkProfile"] = network.render();
        }

        let mut body = json!({ "location": self.location.render(outputs) });
        match &self.identity {
            ClusterIdentity::ServicePrincipal {
                client_id,
                client_secret,
            } => {
                properties["servicePrincipalProfile"] = json!({
                    "clientId": client_id.render(outputs),
                    "secret": client_secret.render(outputs),
                });
            }
            ClusterIdentity::SystemAssigned => {
                body["identity"] = json!({ "type": "SystemAssigned" });
            }
        }
        body["properties"] = properties;
        body
    }
}

/// Storage account performance tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountTier {
    Standard,
    Premium,
}

/// Storage account replication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplicationType {
    Lrs,
    Zrs,
    Grs,
    Ragrs,
    Gzrs,
    Ragzrs,
}

impl ReplicationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lrs => "LRS",
            Self::Zrs => "ZRS",
            Self::Grs => "GRS",
            Self::Ragrs => "RAGRS",
            Self::Gzrs => "GZRS",
            Self::Ragzrs => "RAGZRS",
        }
    }
}

/// General purpose v2 storage account
#[derive(Debug, Clone, PartialEq)]
pub struct StorageAccount {
    pub resource_group_name: Input<String>,
    pub location: Input<String>,
    pub account_tier: AccountTier,
    pub account_replication_type: ReplicationType,
}

impl StorageAccount {
    /// ARM sku name, e.g. `Standard_LRS`
    pub fn sku_name(&self) -> String {
        format!("{:?}_{}", self.account_tier, self.account_replication_type.as_str())
    }
}

impl DesiredState for StorageAccount {
    fn references(&self) -> Vec<&OutputRef> {
        [&self.resource_group_name, &self.location]
            .into_iter()
            .filter_map(|i| i.output_ref())
            .collect()
    }

    fn validate(&self, name: &str) -> Result<()> {
        require_literal(name, "resource_group_name", &self.resource_group_name)?;
        let name_ok = (3..=24).contains(&name.len())
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        if !name_ok {
            return Err(invalid(
                name,
                "storage account names are 3-24 lowercase letters and digits",
            ));
        }
        if self.account_tier == AccountTier::Premium
            && !matches!(
                self.account_replication_type,
                ReplicationType::Lrs | ReplicationType::Zrs
            )
        {
            return Err(invalid(name, "Premium accounts support only LRS and ZRS"));
        }
        Ok(())
    }

    fn render(&self, outputs: &Outputs) -> Value {
        json!({
            "location": self.location.render(outputs),
            "kind": "StorageV2",
            "sku": { "name": self.sku_name() },
            "properties": {
                "minimumTlsVersion": "TLS1_2",
                "supportsHttpsTrafficOnly": true,
            }
        })
    }
}

/// How a managed disk is populated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateOption {
    Empty,
    Import,
    Copy,
}

/// Azure managed disk
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedDisk {
    pub resource_group_name: Input<String>,
    pub location: Input<String>,
    pub create_option: CreateOption,
    pub disk_size_gb: u32,
}

impl DesiredState for ManagedDisk {
    fn references(&self) -> Vec<&OutputRef> {
        [&self.resource_group_name, &self.location]
            .into_iter()
            .filter_map(|i| i.output_ref())
            .collect()
    }

    fn validate(&self, name: &str) -> Result<()> {
        require_literal(name, "resource_group_name", &self.resource_group_name)?;
        if self.create_option == CreateOption::Empty && self.disk_size_gb == 0 {
            return Err(invalid(name, "an empty disk needs disk_size_gb of at least 1"));
        }
        if self.disk_size_gb > 32_767 {
            return Err(invalid(name, "disk_size_gb exceeds 32767"));
        }
        Ok(())
    }

    fn render(&self, outputs: &Outputs) -> Value {
        json!({
            "location": self.location.render(outputs),
            "properties": {
                "creationData": { "createOption": self.create_option },
                "diskSizeGB": self.disk_size_gb,
            }
        })
    }
}

fn validate_location(resource: &str, location: &str) -> Result<()> {
    if location.is_empty()
        || !location
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(invalid(
            resource,
            format!("location '{}' must be a region name such as eastus", location),
        ));
    }
    Ok(())
}

fn require_literal(resource: &str, field: &str, input: &Input<String>) -> Result<()> {
    match input.literal() {
        Some(v) if v.trim().is_empty() => Err(invalid(resource, format!("{} is empty", field))),
        _ => Ok(()),
    }
}
