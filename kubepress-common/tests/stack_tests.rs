//! WordPress Stack Tests
//! Declared values, dependency ordering and rendered documents of the stock stack

use kubepress_common::resource::{Outputs, ResourceId, ResourceKind, ResourceSpec};
use kubepress_common::stack::IdentityMode;
use kubepress_common::{wordpress_stack, Error, Stack, StackSettings};
use serde_json::json;
use std::collections::BTreeMap;

fn stock() -> Stack {
    wordpress_stack(&StackSettings::default()).unwrap()
}

fn id(kind: ResourceKind, name: &str) -> ResourceId {
    ResourceId::new(kind, name)
}

// ============== Declarations ==============

#[test]
fn test_declaration_order() {
    let stack = stock();
    let ids: Vec<String> = stack
        .declarations()
        .iter()
        .map(|d| d.id.to_string())
        .collect();
    assert_eq!(
        ids,
        vec![
            "resource-group/myResourceGroup",
            "application/aks",
            "service-principal/aksSp",
            "service-principal-password/aksSpPassword",
            "cluster/myAKSCluster",
            "kubernetes-provider/k8sProvider",
            "horizontal-pod-autoscaler/myHPA",
            "storage-account/mystorageccount",
            "disk/myDisk",
            "persistent-volume/myPV",
            "persistent-volume-claim/myPVC",
            "deployment/mysql",
            "service/mysql",
            "deployment/wordpress",
            "service/wordpress-service",
            "ingress/wordpress-ingress",
        ]
    );
}

#[test]
fn test_stock_stack_validates() {
    let stack = stock();
    stack.validate().unwrap();
}

#[test]
fn test_literal_values() {
    let stack = stock();

    let cluster = stack
        .get(&id(ResourceKind::KubernetesCluster, "myAKSCluster"))
        .unwrap();
    let ResourceSpec::KubernetesCluster(cluster) = &cluster.spec else {
        panic!("unexpected spec");
    };
    let pool = &cluster.default_node_pool;
    assert_eq!(pool.name, "default");
    assert_eq!(pool.node_count, 1);
    assert_eq!(pool.vm_size, "Standard_B2s");
    assert!(pool.enable_auto_scaling);
    assert_eq!((pool.min_count, pool.max_count), (Some(1), Some(3)));
    assert_eq!(cluster.dns_prefix, "myaks");
    assert_eq!(cluster.linux_profile.admin_username, "adminuser");

    let disk = stack.get(&id(ResourceKind::ManagedDisk, "myDisk")).unwrap();
    let ResourceSpec::ManagedDisk(disk) = &disk.spec else {
        panic!("unexpected spec");
    };
    assert_eq!(disk.disk_size_gb, 2);

    let outputs = Outputs::new();
    let pv = stack
        .get(&id(ResourceKind::PersistentVolume, "myPV"))
        .unwrap()
        .render(&outputs);
    assert_eq!(pv["spec"]["capacity"]["storage"], "2Gi");

    let hpa = stack
        .get(&id(ResourceKind::HorizontalPodAutoscaler, "myHPA"))
        .unwrap()
        .render(&outputs);
    assert_eq!(hpa["metadata"]["name"], "myhpa");
    assert_eq!(hpa["spec"]["metrics"][0]["resource"]["name"], "cpu");
    assert_eq!(hpa["spec"]["metrics"][0]["resource"]["target"]["averageUtilization"], 70);
    assert_eq!(hpa["spec"]["metrics"][1]["resource"]["name"], "memory");
    assert_eq!(hpa["spec"]["metrics"][1]["resource"]["target"]["averageUtilization"], 80);

    let ingress = stack
        .get(&id(ResourceKind::Ingress, "wordpress-ingress"))
        .unwrap()
        .render(&outputs);
    assert_eq!(ingress["spec"]["rules"][0]["host"], "wordpress.example.com");

    let mysql = stack
        .get(&id(ResourceKind::Service, "mysql"))
        .unwrap()
        .render(&outputs);
    assert_eq!(mysql["spec"]["type"], "ClusterIP");
    let wordpress = stack
        .get(&id(ResourceKind::Service, "wordpress-service"))
        .unwrap()
        .render(&outputs);
    assert_eq!(wordpress["spec"]["type"], "LoadBalancer");
}

#[test]
fn test_environment_variables() {
    let stack = stock();
    let outputs = Outputs::new();

    let env = |name: &str| -> BTreeMap<String, String> {
        let manifest = stack
            .get(&id(ResourceKind::Deployment, name))
            .unwrap()
            .render(&outputs);
        manifest["spec"]["template"]["spec"]["containers"][0]["env"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| {
                (
                    e["name"].as_str().unwrap().to_string(),
                    e["value"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    };

    let mysql = env("mysql");
    assert_eq!(mysql["MYSQL_ROOT_PASSWORD"], "tob0lz");
    assert_eq!(mysql["MYSQL_USER"], "tobolz");
    assert_eq!(mysql["MYSQL_PASSWORD"], "tobolz");
    assert_eq!(mysql["MYSQL_DATABASE"], "wordpress");

    let wordpress = env("wordpress");
    assert_eq!(wordpress["WORDPRESS_DB_HOST"], "mysql");
    assert_eq!(wordpress["WORDPRESS_DB_USER"], "tobolz");
    assert_eq!(wordpress["WORDPRESS_DB_PASSWORD"], "tobolz");
    assert_eq!(wordpress["WORDPRESS_DB_NAME"], "wordpress");
}

// ============== Ordering ==============

#[test]
fn test_plan_respects_dependencies() {
    let stack = stock();
    let plan = stack.plan().unwrap();

    let group = |kind, name| plan.group_of(&id(kind, name)).unwrap();
    let rg = group(ResourceKind::ResourceGroup, "myResourceGroup");
    let app = group(ResourceKind::Application, "aks");
    let sp = group(ResourceKind::ServicePrincipal, "aksSp");
    let password = group(ResourceKind::ServicePrincipalPassword, "aksSpPassword");
    let cluster = group(ResourceKind::KubernetesCluster, "myAKSCluster");
    let provider = group(ResourceKind::KubernetesProvider, "k8sProvider");

    assert_eq!(rg, 0);
    assert_eq!(app, 0);
    assert!(sp > app);
    assert!(password > sp);
    assert!(cluster > rg && cluster > password);
    assert!(provider > cluster);

    for declaration in stack.declarations() {
        let own = plan.group_of(&declaration.id).unwrap();
        for dependency in declaration.dependencies() {
            assert!(
                plan.group_of(&dependency).unwrap() < own,
                "{} must come after {}",
                declaration.id,
                dependency
            );
        }
        if declaration.id.kind.is_kubernetes_object() {
            assert!(own > provider);
        }
    }

    assert_eq!(plan.len(), 16);
    assert_eq!(plan.creation_order().len(), 16);
    let deletion = plan.deletion_order();
    assert_eq!(deletion.last().unwrap().kind, ResourceKind::ResourceGroup);
}

#[test]
fn test_storage_depends_only_on_resource_group() {
    let stack = stock();
    let plan = stack.plan().unwrap();
    assert_eq!(
        plan.group_of(&id(ResourceKind::StorageAccount, "mystorageccount")),
        Some(1)
    );
    assert_eq!(plan.group_of(&id(ResourceKind::ManagedDisk, "myDisk")), Some(1));
}

#[test]
fn test_explicit_ordering_hints() {
    let stack = stock();
    let plan = stack.plan().unwrap();
    let group = |kind, name| plan.group_of(&id(kind, name)).unwrap();

    assert!(
        group(ResourceKind::Deployment, "mysql")
            > group(ResourceKind::PersistentVolumeClaim, "myPVC")
    );
    assert!(group(ResourceKind::Service, "mysql") > group(ResourceKind::Deployment, "mysql"));
    assert!(
        group(ResourceKind::Ingress, "wordpress-ingress")
            > group(ResourceKind::Service, "wordpress-service")
    );
}

// ============== Exports ==============

#[test]
fn test_exports() {
    let stack = stock();
    let exports = stack.exports();
    assert_eq!(exports.len(), 2);
    assert_eq!(exports["kubeconfig"].to_string(), "cluster/myAKSCluster.kube_config_raw");
    assert_eq!(
        exports["public_ip"].to_string(),
        "service/wordpress-service.load_balancer_ip"
    );
}

#[test]
fn test_render_resolves_recorded_outputs() {
    let stack = stock();
    let mut outputs = Outputs::new();
    outputs.record(
        id(ResourceKind::ManagedDisk, "myDisk"),
        BTreeMap::from([
            ("name".to_string(), json!("myDisk")),
            ("id".to_string(), json!("/subscriptions/s/resourceGroups/r/providers/Microsoft.Compute/disks/myDisk")),
        ]),
    );

    let pv = stack
        .get(&id(ResourceKind::PersistentVolume, "myPV"))
        .unwrap()
        .render(&outputs);
    assert_eq!(pv["spec"]["azureDisk"]["diskName"], "myDisk");

    let cluster = stack
        .get(&id(ResourceKind::KubernetesCluster, "myAKSCluster"))
        .unwrap()
        .render(&Outputs::new());
    assert_eq!(cluster["location"], "${resource-group/myResourceGroup.location}");
}

// ============== Settings ==============

#[test]
fn test_settings_from_toml() {
    let settings: StackSettings = toml::from_str(
        r#"
        name = "staging"
        location = "westeurope"

        [cluster]
        identity = "system-assigned"

        [cluster.network_profile]
        network_plugin = "azure"
        network_policy = "calico"

        [wordpress]
        namespace = "blog"
        host = "blog.example.com"
        "#,
    )
    .unwrap();

    let stack = wordpress_stack(&settings).unwrap();
    stack.validate().unwrap();
    assert_eq!(stack.name, "staging");
    assert_eq!(stack.len(), 13);
    assert!(stack
        .get(&id(ResourceKind::Application, "aks"))
        .is_none());

    let cluster = stack
        .get(&id(ResourceKind::KubernetesCluster, "myAKSCluster"))
        .unwrap()
        .render(&Outputs::new());
    assert_eq!(cluster["identity"]["type"], "SystemAssigned");
    assert_eq!(cluster["properties"]["networkProfile"]["networkPolicy"], "calico");

    let ingress = stack
        .get(&id(ResourceKind::Ingress, "wordpress-ingress"))
        .unwrap()
        .render(&Outputs::new());
    assert_eq!(ingress["metadata"]["namespace"], "blog");
    assert_eq!(ingress["spec"]["rules"][0]["host"], "blog.example.com");
}

#[test]
fn test_invalid_settings_rejected() {
    let mut settings = StackSettings::default();
    settings.cluster.node_pool.min_count = Some(4);
    let stack = wordpress_stack(&settings).unwrap();
    assert!(matches!(stack.validate(), Err(Error::Validation(_))));

    let mut settings = StackSettings::default();
    settings.storage.disk_size_gb = 1;
    let stack = wordpress_stack(&settings).unwrap();
    // Claim and volume shrink together, so the stack is still consistent
    stack.validate().unwrap();

    let mut settings = StackSettings::default();
    settings.cluster.identity = IdentityMode::ServicePrincipal;
    settings.identity.password_end_date = "2001-01-01T00:00:00Z".to_string();
    let stack = wordpress_stack(&settings).unwrap();
    assert!(stack.validate().is_err());
}
