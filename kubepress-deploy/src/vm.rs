//! Helper virtual machine attached to a cluster's node network

use crate::azure::{put_and_wait, CLUSTER_API};
use crate::context::DeployContext;
use crate::{DeployError, Result};
use kubepress_common::vm::VmSpec;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

pub const NETWORK_API: &str = "2023-09-01";
pub const COMPUTE_API: &str = "2023-09-01";

/// What `create_vm` reports back
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmCreated {
    pub vm_id: String,
    pub nic_id: String,
    pub private_ip: Option<String>,
}

fn required<'a>(object: &'a Value, pointer: &str, what: &str) -> Result<&'a str> {
    object
        .pointer(pointer)
        .and_then(Value::as_str)
        .ok_or_else(|| DeployError::unexpected(what, format!("response has no {}", pointer)))
}

/// Pick the subnet id from a `virtualNetworks` listing
fn select_subnet(networks: &Value, vnet: Option<&str>, subnet: Option<&str>) -> Result<String> {
    let networks = networks
        .get("value")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let network = match vnet {
        Some(name) => networks
            .iter()
            .find(|n| n.get("name").and_then(Value::as_str) == Some(name))
            .ok_or_else(|| DeployError::unexpected(name, "virtual network not found"))?,
        None => networks
            .first()
            .ok_or_else(|| DeployError::unexpected("node resource group", "no virtual network"))?,
    };

    let subnets = network
        .pointer("/properties/subnets")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let chosen = match subnet {
        Some(name) => subnets
            .iter()
            .find(|s| s.get("name").and_then(Value::as_str) == Some(name)),
        None => subnets.first(),
    }
    .ok_or_else(|| {
        DeployError::unexpected(
            network.get("name").and_then(Value::as_str).unwrap_or("virtual network"),
            format!("subnet {} not found", subnet.unwrap_or("(any)")),
        )
    })?;

    Ok(required(chosen, "/id", "subnet")?.to_string())
}

/// Create a NIC on the cluster's node subnet and a Linux VM using it
pub async fn create_vm(ctx: &DeployContext, spec: &VmSpec) -> Result<VmCreated> {
    spec.validate()?;

    let cluster_path = ctx.resource_path(
        &spec.resource_group,
        "Microsoft.ContainerService/managedClusters",
        &spec.cluster_name,
        CLUSTER_API,
    );
    let cluster: Value = ctx.arm.get(&cluster_path).await?;
    let location = required(&cluster, "/location", &spec.cluster_name)?;
    let node_group = required(&cluster, "/properties/nodeResourceGroup", &spec.cluster_name)?;
    debug!(node_group, "Looking up node network");

    let networks: Value = ctx
        .arm
        .get(&format!(
            "{}/providers/Microsoft.Network/virtualNetworks?api-version={}",
            ctx.resource_group_path(node_group),
            NETWORK_API
        ))
        .await?;
    let subnet_id = select_subnet(
        &networks,
        spec.virtual_network.as_deref(),
        spec.subnet.as_deref(),
    )?;

    let nic_path = ctx.resource_path(
        &spec.resource_group,
        "Microsoft.Network/networkInterfaces",
        &spec.nic_name(),
        NETWORK_API,
    );
    let nic = put_and_wait(ctx, &nic_path, &spec.nic_body(&subnet_id, location)).await?;
    let nic_id = required(&nic, "/id", "network interface")?.to_string();
    let private_ip = nic
        .pointer("/properties/ipConfigurations/0/properties/privateIPAddress")
        .and_then(Value::as_str)
        .map(str::to_string);
    info!(nic = %nic_id, "Network interface ready");

    let vm_path = ctx.resource_path(
        &spec.resource_group,
        "Microsoft.Compute/virtualMachines",
        &spec.name,
        COMPUTE_API,
    );
    let vm = put_and_wait(ctx, &vm_path, &spec.vm_body(&nic_id, location)).await?;
    let vm_id = required(&vm, "/id", &spec.name)?.to_string();
    info!(vm = %vm_id, "Virtual machine ready");

    Ok(VmCreated {
        vm_id,
        nic_id,
        private_ip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{PollSettings, RestClient};
    use axum::extract::State;
    use axum::routing::get;
    use axum::{Json, Router};
    use kubepress_common::vm::ImageReference;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const GROUP: &str = "/subscriptions/sub/resourceGroups/myResourceGroup";
    const NODE_GROUP: &str = "/subscriptions/sub/resourceGroups/MC_myResourceGroup_myAKSCluster_eastus";

    #[derive(Clone, Default)]
    struct FakeArm {
        puts: Arc<Mutex<Vec<Value>>>,
    }

    fn networks() -> Value {
        json!({
            "value": [{
                "name": "aks-vnet-1234",
                "properties": {
                    "subnets": [
                        { "name": "aks-subnet", "id": format!("{}/subnets/aks-subnet", NODE_GROUP) },
                        { "name": "other", "id": format!("{}/subnets/other", NODE_GROUP) }
                    ]
                }
            }]
        })
    }

    async fn fake_arm() -> (DeployContext, FakeArm) {
        let state = FakeArm::default();
        let nic = format!("{}/providers/Microsoft.Network/networkInterfaces/jumpbox-nic", GROUP);
        let vm = format!("{}/providers/Microsoft.Compute/virtualMachines/jumpbox", GROUP);
        let nic_id = nic.clone();
        let vm_id = vm.clone();

        let app = Router::new()
            .route(
                &format!("{}/providers/Microsoft.ContainerService/managedClusters/myAKSCluster", GROUP),
                get(|| async {
                    Json(json!({
                        "location": "eastus",
                        "properties": {
                            "nodeResourceGroup": "MC_myResourceGroup_myAKSCluster_eastus"
                        }
                    }))
                }),
            )
            .route(
                &format!("{}/providers/Microsoft.Network/virtualNetworks", NODE_GROUP),
                get(|| async { Json(networks()) }),
            )
            .route(
                &nic,
                get(move || {
                    let id = nic_id.clone();
                    async move {
                        Json(json!({
                            "id": id,
                            "properties": {
                                "provisioningState": "Succeeded",
                                "ipConfigurations": [{
                                    "properties": { "privateIPAddress": "10.224.0.9" }
                                }]
                            }
                        }))
                    }
                })
                .put(|State(s): State<FakeArm>, Json(body): Json<Value>| async move {
                    s.puts.lock().unwrap().push(body);
                    Json(json!({}))
                }),
            )
            .route(
                &vm,
                get(move || {
                    let id = vm_id.clone();
                    async move {
                        Json(json!({ "id": id, "properties": { "provisioningState": "Succeeded" } }))
                    }
                })
                .put(|State(s): State<FakeArm>, Json(body): Json<Value>| async move {
                    s.puts.lock().unwrap().push(body);
                    Json(json!({}))
                }),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let url = format!("http://{}", addr);
        let poll = PollSettings {
            initial: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        let arm = RestClient::new(&url).unwrap().with_poll_settings(poll);
        (DeployContext::new(arm, RestClient::new(&url).unwrap(), "sub"), state)
    }

    fn jumpbox() -> VmSpec {
        VmSpec {
            name: "jumpbox".to_string(),
            vm_size: "Standard_B2s".to_string(),
            image: ImageReference::from_urn("Canonical:UbuntuServer:18.04-LTS:latest").unwrap(),
            admin_username: "adminuser".to_string(),
            ssh_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHb0".to_string(),
            resource_group: "myResourceGroup".to_string(),
            cluster_name: "myAKSCluster".to_string(),
            virtual_network: None,
            subnet: None,
        }
    }

    #[tokio::test]
    async fn test_create_vm() {
        let (ctx, state) = fake_arm().await;
        let created = create_vm(&ctx, &jumpbox()).await.unwrap();

        assert!(created.vm_id.ends_with("/virtualMachines/jumpbox"));
        assert!(created.nic_id.ends_with("/networkInterfaces/jumpbox-nic"));
        assert_eq!(created.private_ip.as_deref(), Some("10.224.0.9"));

        let puts = state.puts.lock().unwrap();
        assert_eq!(puts.len(), 2);
        assert_eq!(
            puts[0]["properties"]["ipConfigurations"][0]["properties"]["subnet"]["id"],
            format!("{}/subnets/aks-subnet", NODE_GROUP)
        );
        assert_eq!(puts[0]["location"], "eastus");
        assert_eq!(
            puts[1]["properties"]["networkProfile"]["networkInterfaces"][0]["id"],
            created.nic_id.as_str()
        );
    }

    #[tokio::test]
    async fn test_invalid_spec_rejected_before_calls() {
        let ctx = DeployContext::new(
            RestClient::new("http://127.0.0.1:9").unwrap(),
            RestClient::new("http://127.0.0.1:9").unwrap(),
            "sub",
        );
        let mut spec = jumpbox();
        spec.vm_size = "huge".to_string();
        assert!(matches!(
            create_vm(&ctx, &spec).await,
            Err(DeployError::Stack(_))
        ));
    }

    #[test]
    fn test_select_subnet() {
        let networks = networks();
        assert!(select_subnet(&networks, None, Some("other"))
            .unwrap()
            .ends_with("/subnets/other"));
        assert!(select_subnet(&networks, Some("aks-vnet-1234"), None)
            .unwrap()
            .ends_with("/subnets/aks-subnet"));
        assert!(select_subnet(&networks, Some("missing"), None).is_err());
        assert!(select_subnet(&networks, None, Some("missing")).is_err());
        assert!(select_subnet(&json!({ "value": [] }), None, None).is_err());
    }
}
