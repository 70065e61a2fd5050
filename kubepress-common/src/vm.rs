//! Helper VM placed next to the cluster's nodes

use crate::azure::validate_ssh_key;
use crate::{invalid, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// Marketplace image, written as a `publisher:offer:sku:version` URN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    pub version: String,
}

impl ImageReference {
    pub fn from_urn(urn: &str) -> Result<Self> {
        let parts: Vec<&str> = urn.split(':').collect();
        match parts.as_slice() {
            [publisher, offer, sku, version] if parts.iter().all(|p| !p.trim().is_empty()) => {
                Ok(Self {
                    publisher: publisher.to_string(),
                    offer: offer.to_string(),
                    sku: sku.to_string(),
                    version: version.to_string(),
                })
            }
            _ => Err(Error::InvalidConfig(format!(
                "image '{}' is not a publisher:offer:sku:version URN",
                urn
            ))),
        }
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_urn(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.publisher, self.offer, self.sku, self.version)
    }
}

pub const DEFAULT_VM_SIZE: &str = "Standard_B2s";
pub const DEFAULT_IMAGE: &str = "Canonical:UbuntuServer:18.04-LTS:latest";

#[derive(Debug, Clone, PartialEq)]
pub struct VmSpec {
    pub name: String,
    pub vm_size: String,
    pub image: ImageReference,
    pub admin_username: String,
    pub ssh_key: String,
    /// Resource group holding the cluster
    pub resource_group: String,
    pub cluster_name: String,
    /// Virtual network in the node resource group; the first one found when unset
    pub virtual_network: Option<String>,
    pub subnet: Option<String>,
}

impl VmSpec {
    pub fn nic_name(&self) -> String {
        format!("{}-nic", self.name)
    }

    pub fn validate(&self) -> Result<()> {
        let name = &self.name;
        if name.is_empty()
            || name.len() > 64
            || name.starts_with('-')
            || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(invalid(name, "VM names are 1-64 letters, digits or '-'"));
        }
        if !self.vm_size.starts_with("Standard_") && !self.vm_size.starts_with("Basic_") {
            return Err(invalid(name, format!("unknown VM size '{}'", self.vm_size)));
        }
        if self.resource_group.is_empty() || self.cluster_name.is_empty() {
            return Err(invalid(name, "resource group and cluster name are required"));
        }
        if self.admin_username.is_empty() {
            return Err(invalid(name, "admin username is required"));
        }
        validate_ssh_key(name, &self.ssh_key)
    }

    /// Network interface request body
    pub fn nic_body(&self, subnet_id: &str, location: &str) -> Value {
        json!({
            "location": location,
            "properties": {
                "ipConfigurations": [{
                    "name": "ipconfig1",
                    "properties": {
                        "privateIPAllocationMethod": "Dynamic",
                        "subnet": { "id": subnet_id }
                    }
                }]
            }
        })
    }

    /// Virtual machine request body
    pub fn vm_body(&self, nic_id: &str, location: &str) -> Value {
        json!({
            "location": location,
            "properties": {
                "hardwareProfile": { "vmSize": self.vm_size },
                "storageProfile": {
                    "imageReference": {
                        "publisher": self.image.publisher,
                        "offer": self.image.offer,
                        "sku": self.image.sku,
                        "version": self.image.version,
                    },
                    "osDisk": {
                        "createOption": "FromImage",
                        "managedDisk": { "storageAccountType": "Standard_LRS" }
                    }
                },
                "osProfile": {
                    "computerName": self.name,
                    "adminUsername": self.admin_username,
                    "linuxConfiguration": {
                        "disablePasswordAuthentication": true,
                        "ssh": {
                            "publicKeys": [{
                                "path": format!("/home/{}/.ssh/authorized_keys", self.admin_username),
                                "keyData": self.ssh_key,
                            }]
                        }
                    }
                },
                "networkProfile": {
                    "networkInterfaces": [{ "id": nic_id, "properties": { "primary": true } }]
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VmSpec {
        VmSpec {
            name: "jumpbox".to_string(),
            vm_size: DEFAULT_VM_SIZE.to_string(),
            image: DEFAULT_IMAGE.parse().unwrap(),
            admin_username: "adminuser".to_string(),
            ssh_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHb0 ops@example.com".to_string(),
            resource_group: "myResourceGroup".to_string(),
            cluster_name: "myAKSCluster".to_string(),
            virtual_network: None,
            subnet: None,
        }
    }

    #[test]
    fn test_image_urn() {
        let image = ImageReference::from_urn(DEFAULT_IMAGE).unwrap();
        assert_eq!(image.publisher, "Canonical");
        assert_eq!(image.offer, "UbuntuServer");
        assert_eq!(image.sku, "18.04-LTS");
        assert_eq!(image.version, "latest");
        assert_eq!(image.to_string(), DEFAULT_IMAGE);

        assert!(ImageReference::from_urn("Canonical:UbuntuServer:18.04-LTS").is_err());
        assert!(ImageReference::from_urn("Canonical::18.04-LTS:latest").is_err());
        assert!(ImageReference::from_urn("a:b:c:d:e").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(spec().validate().is_ok());

        let mut bad = spec();
        bad.name = "jump box".to_string();
        assert!(bad.validate().is_err());

        let mut bad = spec();
        bad.ssh_key = "not-a-key".to_string();
        assert!(bad.validate().is_err());

        let mut bad = spec();
        bad.cluster_name.clear();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_bodies() {
        let vm = spec();
        let nic = vm.nic_body("/subnets/aks-subnet", "eastus");
        assert_eq!(
            nic["properties"]["ipConfigurations"][0]["properties"]["subnet"]["id"],
            "/subnets/aks-subnet"
        );

        let body = vm.vm_body("/nics/jumpbox-nic", "eastus");
        assert_eq!(body["location"], "eastus");
        assert_eq!(body["properties"]["hardwareProfile"]["vmSize"], "Standard_B2s");
        assert_eq!(
            body["properties"]["storageProfile"]["imageReference"]["sku"],
            "18.04-LTS"
        );
        assert_eq!(
            body["properties"]["networkProfile"]["networkInterfaces"][0]["id"],
            "/nics/jumpbox-nic"
        );
        assert_eq!(vm.nic_name(), "jumpbox-nic");
    }
}
