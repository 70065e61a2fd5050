//! The WordPress-on-AKS stack

use crate::azure::{
    AccountTier, Application, ClusterIdentity, CreateOption, KubernetesCluster, LinuxProfile,
    ManagedDisk, NetworkProfile, NodePool, ReplicationType, ResourceGroup, ServicePrincipal,
    ServicePrincipalPassword, StorageAccount,
};
use crate::graph::Stack;
use crate::quantity::gibibytes;
use crate::resource::{Declaration, ResourceOptions, ResourceSpec};
use crate::workloads::{
    AccessMode, AzureDiskSource, Container, ContainerPort, Deployment, EnvVar,
    HorizontalPodAutoscaler, Ingress, IngressPath, IngressRule, KubernetesProvider, ObjectMeta,
    PathType, PersistentVolume, PersistentVolumeClaim, Protocol, ReclaimPolicy, ResourceMetric,
    ScaleTargetRef, Service, ServicePort, ServiceType, Volume, VolumeMount,
};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DEFAULT_SSH_KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAACAQDmjIDHPOHhTnYYccEaBgNZJs9P1PJ8kguQsIIHtqniTj51NZ5zwDI7OL0U3Uj1PZRau7Q4F+9hME7KC6BHaGRZ1bFUpvkqO29yAZvpL/SdP1UtKPxc5vIfItRGYUgeMoeYJLOg7zdU+naKuIqYmKoybf7BSlLxRLTv+2uzpzeb+2u2oDqvMeaf1MagfQYQ5pZJrzMzytsjZlQomEk4tcLW6vvnETjFlP7I8FtW4fq5mwIIKCoOFI0IzwCLjjayzErsC6yODfsojxu6Vxpb1ZvG1sNe6WNcbfK0hf/xSiCqB1Yvna+g9Vjy8R88R9kTfS3uBjdBD2XZN1v3GegKm/Pwuey4O16WnI9tSAVIcjeTpZj4ooiws1aOCmAMhi9aWyDedlLs/a7b2GkKquK29A8xxNx1CJq9qg2tcWdROmUt5OzMmzv85ueI9X6tjQ0ijv4xX3eqh6GLRwXXPJS2OwJKbhBvm/OZHm0CQ8YlPdtvR0VTLpRl5lOVo65icsZ1zj+kkt9EzCLMjUM+DXUp2BrFptYygrzQjPhcAR0ef7qDoG6gp5cm8xZjM+T2D0oouQxvGhLpWp9yRgHqwc5t8FwMWVKmzGG8KHcaoOglirq8rIXnrSROcbs2JnTSqXVSnxIEXPzQ0VxFY40ozDzgnS70F4p9cU3hNSYRK5obie0OhQ== char.lice@outlook.com";

/// How the cluster authenticates against Azure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityMode {
    /// Dedicated AD application, service principal and password
    ServicePrincipal,
    /// Managed identity; no AD objects are declared
    SystemAssigned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub name: String,
    pub dns_prefix: String,
    pub kubernetes_version: Option<String>,
    pub node_pool: NodePool,
    pub admin_username: String,
    pub ssh_key: String,
    pub identity: IdentityMode,
    pub network_profile: Option<NetworkProfile>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            name: "myAKSCluster".to_string(),
            dns_prefix: "myaks".to_string(),
            kubernetes_version: None,
            node_pool: NodePool {
                name: "default".to_string(),
                node_count: 1,
                vm_size: "Standard_B2s".to_string(),
                enable_auto_scaling: true,
                min_count: Some(1),
                max_count: Some(3),
            },
            admin_username: "adminuser".to_string(),
            ssh_key: DEFAULT_SSH_KEY.to_string(),
            identity: IdentityMode::ServicePrincipal,
            network_profile: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    pub application_name: String,
    pub service_principal_name: String,
    pub password_name: String,
    /// RFC 3339 expiry of the generated client secret
    pub password_end_date: String,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            application_name: "aks".to_string(),
            service_principal_name: "aksSp".to_string(),
            password_name: "aksSpPassword".to_string(),
            password_end_date: "2099-01-01T00:00:00Z".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub account_name: String,
    pub account_tier: AccountTier,
    pub replication: ReplicationType,
    pub disk_name: String,
    pub disk_size_gb: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            account_name: "mystorageccount".to_string(),
            account_tier: AccountTier::Standard,
            replication: ReplicationType::Lrs,
            disk_name: "myDisk".to_string(),
            disk_size_gb: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerSettings {
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub cpu_utilization: i32,
    pub memory_utilization: i32,
}

impl Default for AutoscalerSettings {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            max_replicas: 5,
            cpu_utilization: 70,
            memory_utilization: 80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WordpressSettings {
    /// Namespace for every namespaced object; `default` when unset
    pub namespace: Option<String>,
    pub host: String,
    pub mysql_image: String,
    pub wordpress_image: String,
    pub db_root_password: String,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
}

impl Default for WordpressSettings {
    fn default() -> Self {
        Self {
            namespace: None,
            host: "wordpress.example.com".to_string(),
            mysql_image: "mysql:latest".to_string(),
            wordpress_image: "wordpress:latest".to_string(),
            db_root_password: "tob0lz".to_string(),
            db_user: "tobolz".to_string(),
            db_password: "tobolz".to_string(),
            db_name: "wordpress".to_string(),
        }
    }
}

/// Tunables of the WordPress stack; every field defaults to the stock topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackSettings {
    pub name: String,
    pub resource_group: String,
    pub location: String,
    pub identity: IdentitySettings,
    pub cluster: ClusterSettings,
    pub autoscaler: AutoscalerSettings,
    pub storage: StorageSettings,
    pub wordpress: WordpressSettings,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            name: "wordpress".to_string(),
            resource_group: "myResourceGroup".to_string(),
            location: "eastus".to_string(),
            identity: IdentitySettings::default(),
            cluster: ClusterSettings::default(),
            autoscaler: AutoscalerSettings::default(),
            storage: StorageSettings::default(),
            wordpress: WordpressSettings::default(),
        }
    }
}

fn app_labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), app.to_string())])
}

/// Declare the WordPress stack
pub fn wordpress_stack(settings: &StackSettings) -> Result<Stack> {
    let mut stack = Stack::new(&settings.name);
    let namespace = settings.wordpress.namespace.as_deref();
    let wp = &settings.wordpress;

    let resource_group = stack.declare(Declaration::new(
        &settings.resource_group,
        ResourceSpec::ResourceGroup(ResourceGroup {
            location: settings.location.clone(),
        }),
    ))?;

    let identity = match settings.cluster.identity {
        IdentityMode::ServicePrincipal => {
            let application = stack.declare(Declaration::new(
                &settings.identity.application_name,
                ResourceSpec::Application(Application {
                    display_name: settings.identity.application_name.clone(),
                }),
            ))?;
            let service_principal = stack.declare(Declaration::new(
                &settings.identity.service_principal_name,
                ResourceSpec::ServicePrincipal(ServicePrincipal {
                    application_id: application.output("application_id").into(),
                }),
            ))?;
            let password = stack.declare(Declaration::new(
                &settings.identity.password_name,
                ResourceSpec::ServicePrincipalPassword(ServicePrincipalPassword {
                    service_principal_id: service_principal.output("id").into(),
                    display_name: settings.identity.password_name.clone(),
                    end_date: settings.identity.password_end_date.clone(),
                }),
            ))?;
            ClusterIdentity::ServicePrincipal {
                client_id: application.output("application_id").into(),
                client_secret: password.output("value").into(),
            }
        }
        IdentityMode::SystemAssigned => ClusterIdentity::SystemAssigned,
    };

    let cluster = stack.declare(Declaration::new(
        &settings.cluster.name,
        ResourceSpec::KubernetesCluster(KubernetesCluster {
            resource_group_name: resource_group.output("name").into(),
            location: resource_group.output("location").into(),
            dns_prefix: settings.cluster.dns_prefix.clone(),
            kubernetes_version: settings.cluster.kubernetes_version.clone(),
            default_node_pool: settings.cluster.node_pool.clone(),
            linux_profile: LinuxProfile {
                admin_username: settings.cluster.admin_username.clone(),
                ssh_key: settings.cluster.ssh_key.clone(),
            },
            identity,
            network_profile: settings.cluster.network_profile.clone(),
        }),
    ))?;
    stack.export("kubeconfig", cluster.output("kube_config_raw"));

    let provider = stack.declare(Declaration::new(
        "k8sProvider",
        ResourceSpec::KubernetesProvider(KubernetesProvider {
            kubeconfig: cluster.output("kube_config_raw").into(),
        }),
    ))?;
    let on_cluster = || ResourceOptions::new().with_provider(&provider);

    stack.declare(
        Declaration::new(
            "myHPA",
            ResourceSpec::HorizontalPodAutoscaler(HorizontalPodAutoscaler {
                metadata: ObjectMeta::named("myhpa").in_namespace(namespace),
                scale_target_ref: ScaleTargetRef {
                    api_version: "apps/v1".to_string(),
                    kind: "Deployment".to_string(),
                    name: "wordpress".to_string(),
                },
                min_replicas: settings.autoscaler.min_replicas,
                max_replicas: settings.autoscaler.max_replicas,
                metrics: vec![
                    ResourceMetric {
                        resource: "cpu".to_string(),
                        average_utilization: settings.autoscaler.cpu_utilization,
                    },
                    ResourceMetric {
                        resource: "memory".to_string(),
                        average_utilization: settings.autoscaler.memory_utilization,
                    },
                ],
            }),
        )
        .with_options(on_cluster()),
    )?;

    stack.declare(Declaration::new(
        &settings.storage.account_name,
        ResourceSpec::StorageAccount(StorageAccount {
            resource_group_name: resource_group.output("name").into(),
            location: resource_group.output("location").into(),
            account_tier: settings.storage.account_tier,
            account_replication_type: settings.storage.replication,
        }),
    ))?;

    let disk = stack.declare(Declaration::new(
        &settings.storage.disk_name,
        ResourceSpec::ManagedDisk(ManagedDisk {
            resource_group_name: resource_group.output("name").into(),
            location: resource_group.output("location").into(),
            create_option: CreateOption::Empty,
            disk_size_gb: settings.storage.disk_size_gb,
        }),
    ))?;

    let disk_quantity = gibibytes(settings.storage.disk_size_gb);
    let pv = stack.declare(
        Declaration::new(
            "myPV",
            ResourceSpec::PersistentVolume(PersistentVolume {
                metadata: ObjectMeta::named("my-pv"),
                capacity: disk_quantity.clone(),
                access_modes: vec![AccessMode::ReadWriteOnce],
                reclaim_policy: ReclaimPolicy::Retain,
                storage_class_name: Some(String::new()),
                azure_disk: AzureDiskSource {
                    disk_name: disk.output("name").into(),
                    disk_uri: disk.output("id").into(),
                    kind: "Managed".to_string(),
                    caching_mode: "None".to_string(),
                    fs_type: "ext4".to_string(),
                },
            }),
        )
        .with_options(on_cluster()),
    )?;

    let pvc = stack.declare(
        Declaration::new(
            "myPVC",
            ResourceSpec::PersistentVolumeClaim(PersistentVolumeClaim {
                metadata: ObjectMeta::named("my-pvc").in_namespace(namespace),
                access_modes: vec![AccessMode::ReadWriteOnce],
                storage_request: disk_quantity,
                // Empty class plus a volume name binds statically to my-pv
                storage_class_name: Some(String::new()),
                volume_name: Some("my-pv".to_string()),
            }),
        )
        .with_options(on_cluster().with_depends_on(&[&pv])),
    )?;

    let mysql = stack.declare(
        Declaration::new(
            "mysql",
            ResourceSpec::Deployment(Deployment {
                metadata: ObjectMeta::named("mysql").in_namespace(namespace),
                replicas: 1,
                labels: app_labels("mysql"),
                containers: vec![Container {
                    name: "mysql".to_string(),
                    image: wp.mysql_image.clone(),
                    env: vec![
                        EnvVar::new("MYSQL_ROOT_PASSWORD", &wp.db_root_password),
                        EnvVar::new("MYSQL_USER", &wp.db_user),
                        EnvVar::new("MYSQL_PASSWORD", &wp.db_password),
                        EnvVar::new("MYSQL_DATABASE", &wp.db_name),
                    ],
                    ports: vec![ContainerPort { container_port: 3306 }],
                    volume_mounts: Vec::new(),
                }],
                volumes: Vec::new(),
            }),
        )
        .with_options(on_cluster().with_depends_on(&[&pv, &pvc])),
    )?;

    stack.declare(
        Declaration::new(
            "mysql",
            ResourceSpec::Service(Service {
                metadata: ObjectMeta::named("mysql").in_namespace(namespace),
                selector: app_labels("mysql"),
                ports: vec![ServicePort {
                    protocol: Protocol::Tcp,
                    port: 3306,
                    target_port: 3306,
                }],
                service_type: ServiceType::ClusterIp,
            }),
        )
        .with_options(on_cluster().with_depends_on(&[&mysql])),
    )?;

    let wordpress = stack.declare(
        Declaration::new(
            "wordpress",
            ResourceSpec::Deployment(Deployment {
                metadata: ObjectMeta::named("wordpress").in_namespace(namespace),
                replicas: 1,
                labels: app_labels("wordpress"),
                containers: vec![Container {
                    name: "wordpress".to_string(),
                    image: wp.wordpress_image.clone(),
                    env: vec![
                        EnvVar::new("WORDPRESS_DB_HOST", "mysql"),
                        EnvVar::new("WORDPRESS_DB_USER", &wp.db_user),
                        EnvVar::new("WORDPRESS_DB_PASSWORD", &wp.db_password),
                        EnvVar::new("WORDPRESS_DB_NAME", &wp.db_name),
                    ],
                    ports: vec![ContainerPort { container_port: 80 }],
                    volume_mounts: vec![VolumeMount {
                        name: "html-volume".to_string(),
                        mount_path: "/var/www/html".to_string(),
                    }],
                }],
                volumes: vec![Volume {
                    name: "html-volume".to_string(),
                    claim_name: "my-pvc".to_string(),
                }],
            }),
        )
        .with_options(on_cluster().with_depends_on(&[&pvc])),
    )?;

    let wordpress_service = stack.declare(
        Declaration::new(
            "wordpress-service",
            ResourceSpec::Service(Service {
                metadata: ObjectMeta::named("wordpress-service").in_namespace(namespace),
                selector: app_labels("wordpress"),
                ports: vec![ServicePort {
                    protocol: Protocol::Tcp,
                    port: 80,
                    target_port: 80,
                }],
                service_type: ServiceType::LoadBalancer,
            }),
        )
        .with_options(on_cluster().with_depends_on(&[&wordpress])),
    )?;

    stack.declare(
        Declaration::new(
            "wordpress-ingress",
            ResourceSpec::Ingress(Ingress {
                metadata: ObjectMeta::named("wordpress-ingress").in_namespace(namespace),
                ingress_class_name: None,
                rules: vec![IngressRule {
                    host: Some(wp.host.clone()),
                    paths: vec![IngressPath {
                        path: "/".to_string(),
                        path_type: PathType::Prefix,
                        service_name: "wordpress-service".to_string(),
                        service_port: 80,
                    }],
                }],
            }),
        )
        .with_options(on_cluster().with_depends_on(&[&wordpress_service])),
    )?;

    stack.export("public_ip", wordpress_service.output("load_balancer_ip"));

    Ok(stack)
}
