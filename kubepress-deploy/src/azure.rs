//! Azure Resource Manager provisioners
//!
//! Every resource is a `PUT` of the rendered body followed by polling
//! `provisioningState`. Deletion goes through the recorded resource id.

use crate::context::DeployContext;
use crate::provisioner::{expect_spec, field_str, Fields, Provisioner};
use crate::{DeployError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use kubepress_common::{Declaration, Outputs, ResourceKind};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const RESOURCE_GROUP_API: &str = "2021-04-01";
pub const STORAGE_API: &str = "2023-01-01";
pub const DISK_API: &str = "2023-04-02";
pub const CLUSTER_API: &str = "2024-02-01";

pub(crate) async fn put_and_wait(ctx: &DeployContext, path: &str, body: &Value) -> Result<Value> {
    debug!(path, "PUT");
    let _: Value = ctx.arm.put(path, body).await?;
    Ok(ctx
        .arm
        .wait_for_provisioning(path, ctx.timeouts.provisioning)
        .await?)
}

/// Delete the resource at its recorded id and wait until it is gone
async fn delete_by_id(ctx: &DeployContext, recorded: &Fields, api_version: &str) -> Result<()> {
    let id = field_str(recorded, "id")
        .ok_or_else(|| DeployError::unexpected("delete", "no recorded resource id"))?;
    let path = format!("{}?api-version={}", id, api_version);
    ctx.arm.delete(&path).await?;
    ctx.arm
        .wait_for_deletion(&path, ctx.timeouts.deletion)
        .await?;
    info!(id, "Deleted");
    Ok(())
}

pub(crate) fn string_field(resource: &Value, pointer: &str) -> Value {
    resource
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(|s| json!(s))
        .unwrap_or(Value::Null)
}

pub struct ResourceGroupProvisioner;

#[async_trait]
impl Provisioner for ResourceGroupProvisioner {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ResourceGroup
    }

    async fn create_or_update(
        &self,
        ctx: &DeployContext,
        declaration: &Declaration,
        outputs: &Outputs,
    ) -> Result<Fields> {
        let spec = expect_spec!(declaration, ResourceGroup);
        let path = format!(
            "{}?api-version={}",
            ctx.resource_group_path(&declaration.id.name),
            RESOURCE_GROUP_API
        );
        let group = put_and_wait(ctx, &path, &declaration.render(outputs)).await?;

        Ok(BTreeMap::from([
            ("id".to_string(), string_field(&group, "/id")),
            ("name".to_string(), json!(declaration.id.name)),
            ("location".to_string(), json!(spec.location)),
        ]))
    }

    async fn delete(
        &self,
        ctx: &DeployContext,
        _declaration: &Declaration,
        recorded: &Fields,
        _outputs: &Outputs,
    ) -> Result<()> {
        delete_by_id(ctx, recorded, RESOURCE_GROUP_API).await
    }
}

pub struct StorageAccountProvisioner;

#[async_trait]
impl Provisioner for StorageAccountProvisioner {
    fn kind(&self) -> ResourceKind {
        ResourceKind::StorageAccount
    }

    async fn create_or_update(
        &self,
        ctx: &DeployContext,
        declaration: &Declaration,
        outputs: &Outputs,
    ) -> Result<Fields> {
        let spec = expect_spec!(declaration, StorageAccount);
        let group = spec.resource_group_name.resolve(outputs)?;
        let path = ctx.resource_path(
            &group,
            "Microsoft.Storage/storageAccounts",
            &declaration.id.name,
            STORAGE_API,
        );
        let account = put_and_wait(ctx, &path, &declaration.render(outputs)).await?;

        Ok(BTreeMap::from([
            ("id".to_string(), string_field(&account, "/id")),
            ("name".to_string(), json!(declaration.id.name)),
            (
                "primary_blob_endpoint".to_string(),
                string_field(&account, "/properties/primaryEndpoints/blob"),
            ),
        ]))
    }

    async fn delete(
        &self,
        ctx: &DeployContext,
        _declaration: &Declaration,
        recorded: &Fields,
        _outputs: &Outputs,
    ) -> Result<()> {
        delete_by_id(ctx, recorded, STORAGE_API).await
    }
}

pub struct ManagedDiskProvisioner;

#[async_trait]
impl Provisioner for ManagedDiskProvisioner {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ManagedDisk
    }

    async fn create_or_update(
        &self,
        ctx: &DeployContext,
        declaration: &Declaration,
        outputs: &Outputs,
    ) -> Result<Fields> {
        let spec = expect_spec!(declaration, ManagedDisk);
        let group = spec.resource_group_name.resolve(outputs)?;
        let path = ctx.resource_path(&group, "Microsoft.Compute/disks", &declaration.id.name, DISK_API);
        let disk = put_and_wait(ctx, &path, &declaration.render(outputs)).await?;

        Ok(BTreeMap::from([
            ("id".to_string(), string_field(&disk, "/id")),
            ("name".to_string(), json!(declaration.id.name)),
        ]))
    }

    async fn delete(
        &self,
        ctx: &DeployContext,
        _declaration: &Declaration,
        recorded: &Fields,
        _outputs: &Outputs,
    ) -> Result<()> {
        delete_by_id(ctx, recorded, DISK_API).await
    }
}

pub struct ClusterProvisioner;

impl ClusterProvisioner {
    /// User kubeconfig of a running cluster, decoded from base64
    async fn kubeconfig(ctx: &DeployContext, cluster_id: &str) -> Result<String> {
        let path = format!(
            "{}/listClusterUserCredential?api-version={}",
            cluster_id, CLUSTER_API
        );
        let credentials: Value = ctx.arm.post(&path, &json!({})).await?;
        let encoded = credentials
            .pointer("/kubeconfigs/0/value")
            .and_then(Value::as_str)
            .ok_or_else(|| DeployError::unexpected(cluster_id, "no kubeconfig in credential list"))?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| DeployError::InvalidKubeconfig(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| DeployError::InvalidKubeconfig(e.to_string()))
    }
}

#[async_trait]
impl Provisioner for ClusterProvisioner {
    fn kind(&self) -> ResourceKind {
        ResourceKind::KubernetesCluster
    }

    async fn create_or_update(
        &self,
        ctx: &DeployContext,
        declaration: &Declaration,
        outputs: &Outputs,
    ) -> Result<Fields> {
        let spec = expect_spec!(declaration, KubernetesCluster);
        let group = spec.resource_group_name.resolve(outputs)?;
        let path = ctx.resource_path(
            &group,
            "Microsoft.ContainerService/managedClusters",
            &declaration.id.name,
            CLUSTER_API,
        );
        info!(cluster = %declaration.id.name, "Creating cluster; this takes several minutes");
        let cluster = put_and_wait(ctx, &path, &declaration.render(outputs)).await?;

        let id = cluster
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| DeployError::unexpected(&declaration.id, "cluster has no id"))?;
        let kubeconfig = Self::kubeconfig(ctx, id).await?;

        Ok(BTreeMap::from([
            ("id".to_string(), json!(id)),
            ("name".to_string(), json!(declaration.id.name)),
            ("fqdn".to_string(), string_field(&cluster, "/properties/fqdn")),
            (
                "node_resource_group".to_string(),
                string_field(&cluster, "/properties/nodeResourceGroup"),
            ),
            ("kube_config_raw".to_string(), json!(kubeconfig)),
        ]))
    }

    async fn delete(
        &self,
        ctx: &DeployContext,
        _declaration: &Declaration,
        recorded: &Fields,
        _outputs: &Outputs,
    ) -> Result<()> {
        delete_by_id(ctx, recorded, CLUSTER_API).await
    }
}
