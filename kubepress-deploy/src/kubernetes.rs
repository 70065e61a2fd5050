//! Kubernetes provider and object provisioners
//!
//! Objects are applied with server-side apply under the `kubepress` field
//! manager. The rendered manifest is first deserialized into the typed
//! k8s-openapi object so malformed manifests fail before reaching the API
//! server.

#[cfg(feature = "kubernetes")]
use kube::{Client, Config};

use crate::context::DeployContext;
use crate::provisioner::{expect_spec, Fields, Provisioner};
use crate::{DeployError, Result};
use async_trait::async_trait;
use kubepress_common::workloads::ServiceType;
use kubepress_common::{Declaration, Outputs, ResourceId, ResourceKind, ResourceSpec};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Field manager recorded on every applied object
pub const FIELD_MANAGER: &str = "kubepress";

/// API client for one cluster, built from its kubeconfig
#[derive(Clone)]
pub struct ClusterClient {
    #[cfg(feature = "kubernetes")]
    inner: Client,
    api_server: String,
}

impl ClusterClient {
    /// Build a client from kubeconfig YAML using its current context
    #[cfg(feature = "kubernetes")]
    pub async fn from_kubeconfig(kubeconfig_yaml: &str) -> Result<Self> {
        use kube::config::{KubeConfigOptions, Kubeconfig};

        let kubeconfig = Kubeconfig::from_yaml(kubeconfig_yaml)
            .map_err(|e| DeployError::InvalidKubeconfig(format!("Failed to parse: {}", e)))?;
        let api_server = api_server(&kubeconfig)?;

        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| DeployError::InvalidKubeconfig(format!("Failed to load: {}", e)))?;
        let inner = Client::try_from(config).map_err(|e| {
            DeployError::InvalidKubeconfig(format!("Failed to create client: {}", e))
        })?;

        Ok(Self { inner, api_server })
    }

    pub fn api_server(&self) -> &str {
        &self.api_server
    }

    /// Server-side apply a rendered manifest; returns the object as stored
    #[cfg(feature = "kubernetes")]
    pub async fn apply(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        manifest: Value,
    ) -> Result<Value> {
        use k8s_openapi::api::apps::v1::Deployment;
        use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
        use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Service};
        use k8s_openapi::api::networking::v1::Ingress;
        use kube::Api;

        let ns = namespace.unwrap_or("default");
        let client = self.inner.clone();
        match kind {
            ResourceKind::HorizontalPodAutoscaler => {
                apply_with(Api::<HorizontalPodAutoscaler>::namespaced(client, ns), name, manifest)
                    .await
            }
            ResourceKind::PersistentVolume => {
                apply_with(Api::<PersistentVolume>::all(client), name, manifest).await
            }
            ResourceKind::PersistentVolumeClaim => {
                apply_with(Api::<PersistentVolumeClaim>::namespaced(client, ns), name, manifest)
                    .await
            }
            ResourceKind::Deployment => {
                apply_with(Api::<Deployment>::namespaced(client, ns), name, manifest).await
            }
            ResourceKind::Service => {
                apply_with(Api::<Service>::namespaced(client, ns), name, manifest).await
            }
            ResourceKind::Ingress => {
                apply_with(Api::<Ingress>::namespaced(client, ns), name, manifest).await
            }
            other => Err(not_an_object(other, name)),
        }
    }

    /// Delete an object; an object that is already gone counts as deleted
    #[cfg(feature = "kubernetes")]
    pub async fn delete(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Result<()> {
        use k8s_openapi::api::apps::v1::Deployment;
        use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
        use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Service};
        use k8s_openapi::api::networking::v1::Ingress;
        use kube::Api;

        let ns = namespace.unwrap_or("default");
        let client = self.inner.clone();
        match kind {
            ResourceKind::HorizontalPodAutoscaler => {
                delete_with(Api::<HorizontalPodAutoscaler>::namespaced(client, ns), name).await
            }
            ResourceKind::PersistentVolume => {
                delete_with(Api::<PersistentVolume>::all(client), name).await
            }
            ResourceKind::PersistentVolumeClaim => {
                delete_with(Api::<PersistentVolumeClaim>::namespaced(client, ns), name).await
            }
            ResourceKind::Deployment => {
                delete_with(Api::<Deployment>::namespaced(client, ns), name).await
            }
            ResourceKind::Service => {
                delete_with(Api::<Service>::namespaced(client, ns), name).await
            }
            ResourceKind::Ingress => {
                delete_with(Api::<Ingress>::namespaced(client, ns), name).await
            }
            other => Err(not_an_object(other, name)),
        }
    }

    /// Wait for a `LoadBalancer` service to be given an external address.
    /// `None` when the timeout elapses first.
    #[cfg(feature = "kubernetes")]
    pub async fn wait_for_load_balancer(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        use k8s_openapi::api::core::v1::Service;
        use kube::runtime::wait::await_condition;
        use kube::Api;

        let api: Api<Service> = Api::namespaced(self.inner.clone(), namespace);
        let has_address = |service: Option<&Service>| load_balancer_address(service).is_some();

        match tokio::time::timeout(timeout, await_condition(api, name, has_address)).await {
            Ok(Ok(service)) => Ok(load_balancer_address(service.as_ref())),
            Ok(Err(e)) => Err(DeployError::unexpected(name, e.to_string())),
            Err(_) => Ok(None),
        }
    }

    // Stub implementations when kubernetes feature is not enabled
    #[cfg(not(feature = "kubernetes"))]
    pub async fn from_kubeconfig(_kubeconfig_yaml: &str) -> Result<Self> {
        Err(DeployError::KubernetesDisabled)
    }

    #[cfg(not(feature = "kubernetes"))]
    pub async fn apply(
        &self,
        _kind: ResourceKind,
        _namespace: Option<&str>,
        _name: &str,
        _manifest: Value,
    ) -> Result<Value> {
        Err(DeployError::KubernetesDisabled)
    }

    #[cfg(not(feature = "kubernetes"))]
    pub async fn delete(
        &self,
        _kind: ResourceKind,
        _namespace: Option<&str>,
        _name: &str,
    ) -> Result<()> {
        Err(DeployError::KubernetesDisabled)
    }

    #[cfg(not(feature = "kubernetes"))]
    pub async fn wait_for_load_balancer(
        &self,
        _namespace: &str,
        _name: &str,
        _timeout: Duration,
    ) -> Result<Option<String>> {
        Err(DeployError::KubernetesDisabled)
    }
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("api_server", &self.api_server)
            .finish()
    }
}

/// API server of the kubeconfig's current context
#[cfg(feature = "kubernetes")]
fn api_server(kubeconfig: &kube::config::Kubeconfig) -> Result<String> {
    let context_name = kubeconfig
        .current_context
        .as_deref()
        .ok_or_else(|| DeployError::InvalidKubeconfig("no current-context".into()))?;

    let cluster_name = kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == context_name)
        .and_then(|c| c.context.as_ref())
        .map(|c| c.cluster.as_str())
        .ok_or_else(|| {
            DeployError::InvalidKubeconfig(format!("context '{}' not found", context_name))
        })?;

    kubeconfig
        .clusters
        .iter()
        .find(|c| c.name == cluster_name)
        .and_then(|c| c.cluster.as_ref())
        .and_then(|c| c.server.clone())
        .ok_or_else(|| {
            DeployError::InvalidKubeconfig(format!("cluster '{}' has no server", cluster_name))
        })
}

#[cfg(feature = "kubernetes")]
async fn apply_with<K>(api: kube::Api<K>, name: &str, manifest: Value) -> Result<Value>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + serde::de::DeserializeOwned
        + serde::Serialize,
{
    use kube::api::{Patch, PatchParams};

    let object: K = serde_json::from_value(manifest)?;
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let applied = api.patch(name, &params, &Patch::Apply(&object)).await?;
    Ok(serde_json::to_value(&applied)?)
}

#[cfg(feature = "kubernetes")]
async fn delete_with<K>(api: kube::Api<K>, name: &str) -> Result<()>
where
    K: kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    use kube::api::DeleteParams;

    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => {
            debug!(name, "Object already deleted");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(feature = "kubernetes")]
fn load_balancer_address(service: Option<&k8s_openapi::api::core::v1::Service>) -> Option<String> {
    service?
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .find_map(|ingress| ingress.ip.clone().or_else(|| ingress.hostname.clone()))
}

#[cfg(feature = "kubernetes")]
fn not_an_object(kind: ResourceKind, name: &str) -> DeployError {
    DeployError::unexpected(name, format!("{} is not a Kubernetes object", kind))
}

/// Connects to a cluster; later objects reach it through the context
pub struct ProviderProvisioner;

impl ProviderProvisioner {
    async fn register(
        ctx: &DeployContext,
        declaration: &Declaration,
        outputs: &Outputs,
    ) -> Result<String> {
        let spec = expect_spec!(declaration, KubernetesProvider);
        let kubeconfig = spec.kubeconfig.resolve(outputs)?;
        let client = ClusterClient::from_kubeconfig(&kubeconfig).await?;
        let api_server = client.api_server().to_string();
        ctx.register_cluster(declaration.id.clone(), client).await;
        info!(provider = %declaration.id, api_server = %api_server, "Connected to cluster");
        Ok(api_server)
    }
}

#[async_trait]
impl Provisioner for ProviderProvisioner {
    fn kind(&self) -> ResourceKind {
        ResourceKind::KubernetesProvider
    }

    async fn create_or_update(
        &self,
        ctx: &DeployContext,
        declaration: &Declaration,
        outputs: &Outputs,
    ) -> Result<Fields> {
        let api_server = Self::register(ctx, declaration, outputs).await?;
        Ok(BTreeMap::from([("api_server".to_string(), json!(api_server))]))
    }

    async fn delete(
        &self,
        ctx: &DeployContext,
        declaration: &Declaration,
        _recorded: &Fields,
        _outputs: &Outputs,
    ) -> Result<()> {
        ctx.remove_cluster(&declaration.id).await;
        Ok(())
    }

    async fn connect(
        &self,
        ctx: &DeployContext,
        declaration: &Declaration,
        outputs: &Outputs,
    ) -> Result<()> {
        Self::register(ctx, declaration, outputs).await.map(|_| ())
    }
}

/// Applies one kind of Kubernetes object through its provider's cluster
pub struct ObjectProvisioner {
    kind: ResourceKind,
}

impl ObjectProvisioner {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind }
    }

    fn target<'a>(declaration: &'a Declaration) -> Result<(&'a ResourceId, &'a str)> {
        let provider = declaration
            .options
            .provider
            .as_ref()
            .ok_or_else(|| DeployError::unexpected(&declaration.id, "no Kubernetes provider"))?;
        let name = declaration
            .spec
            .object_name()
            .ok_or_else(|| DeployError::unexpected(&declaration.id, "not a Kubernetes object"))?;
        Ok((provider, name))
    }
}

/// Outputs every applied object records
fn object_fields(applied: &Value, namespace: Option<&str>) -> Fields {
    let pointer = |path: &str| applied.pointer(path).cloned().unwrap_or(Value::Null);
    BTreeMap::from([
        ("name".to_string(), pointer("/metadata/name")),
        ("namespace".to_string(), json!(namespace)),
        ("uid".to_string(), pointer("/metadata/uid")),
    ])
}

#[async_trait]
impl Provisioner for ObjectProvisioner {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn create_or_update(
        &self,
        ctx: &DeployContext,
        declaration: &Declaration,
        outputs: &Outputs,
    ) -> Result<Fields> {
        let (provider, name) = Self::target(declaration)?;
        let client = ctx.cluster(provider).await?;
        let namespace = declaration.spec.object_namespace();

        let applied = client
            .apply(self.kind, namespace, name, declaration.render(outputs))
            .await?;
        info!(resource = %declaration.id, "Applied");

        let mut fields = object_fields(&applied, namespace);
        if let ResourceSpec::Service(service) = &declaration.spec {
            fields.insert(
                "cluster_ip".to_string(),
                applied.pointer("/spec/clusterIP").cloned().unwrap_or(Value::Null),
            );

            let mut address = Value::Null;
            if service.service_type == ServiceType::LoadBalancer {
                let timeout = ctx.timeouts.load_balancer;
                match client
                    .wait_for_load_balancer(namespace.unwrap_or("default"), name, timeout)
                    .await?
                {
                    Some(ip) => {
                        info!(resource = %declaration.id, ip = %ip, "Load balancer ready");
                        address = json!(ip);
                    }
                    None => warn!(
                        resource = %declaration.id,
                        "No load balancer address after {}s",
                        timeout.as_secs()
                    ),
                }
            }
            fields.insert("load_balancer_ip".to_string(), address);
        }

        Ok(fields)
    }

    async fn delete(
        &self,
        ctx: &DeployContext,
        declaration: &Declaration,
        _recorded: &Fields,
        _outputs: &Outputs,
    ) -> Result<()> {
        let (provider, name) = Self::target(declaration)?;
        let client = ctx.cluster(provider).await?;
        client
            .delete(self.kind, declaration.spec.object_namespace(), name)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RestClient;
    use kubepress_common::{wordpress_stack, StackSettings};

    fn context() -> DeployContext {
        DeployContext::new(
            RestClient::new("http://127.0.0.1:9").unwrap(),
            RestClient::new("http://127.0.0.1:9").unwrap(),
            "sub",
        )
    }

    #[test]
    fn test_object_fields() {
        let applied = json!({
            "metadata": { "name": "my-pvc", "namespace": "default", "uid": "1234" },
            "spec": {}
        });
        let fields = object_fields(&applied, Some("default"));
        assert_eq!(fields["name"], "my-pvc");
        assert_eq!(fields["namespace"], "default");
        assert_eq!(fields["uid"], "1234");

        let fields = object_fields(&json!({ "metadata": { "name": "my-pv" } }), None);
        assert_eq!(fields["namespace"], Value::Null);
        assert_eq!(fields["uid"], Value::Null);
    }

    #[tokio::test]
    async fn test_object_requires_connected_provider() {
        let ctx = context();
        let stack = wordpress_stack(&StackSettings::default()).unwrap();
        let deployment = stack
            .declarations()
            .iter()
            .find(|d| d.id.kind == ResourceKind::Deployment)
            .unwrap();

        let result = ObjectProvisioner::new(ResourceKind::Deployment)
            .create_or_update(&ctx, deployment, &Outputs::new())
            .await;
        assert!(matches!(result, Err(DeployError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_provider_needs_kubeconfig_output() {
        let ctx = context();
        let stack = wordpress_stack(&StackSettings::default()).unwrap();
        let provider = stack
            .declarations()
            .iter()
            .find(|d| d.id.kind == ResourceKind::KubernetesProvider)
            .unwrap();

        let result = ProviderProvisioner
            .create_or_update(&ctx, provider, &Outputs::new())
            .await;
        assert!(matches!(
            result,
            Err(DeployError::Stack(kubepress_common::Error::UnresolvedOutput(_)))
        ));
    }

    #[cfg(feature = "kubernetes")]
    mod typed {
        use super::*;
        use k8s_openapi::api::apps::v1::Deployment;
        use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
        use k8s_openapi::api::core::v1::{
            LoadBalancerIngress, LoadBalancerStatus, PersistentVolume, Service, ServiceStatus,
        };
        use k8s_openapi::api::networking::v1::Ingress;

        const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: myAKSCluster
clusters:
- name: myAKSCluster
  cluster:
    server: https://myaks-abc123.hcp.eastus.azmk8s.io:443
contexts:
- name: myAKSCluster
  context:
    cluster: myAKSCluster
    user: clusterUser
users:
- name: clusterUser
  user:
    token: secret
"#;

        fn manifest(kind: ResourceKind, name: &str, outputs: &Outputs) -> Value {
            let stack = wordpress_stack(&StackSettings::default()).unwrap();
            stack
                .get(&ResourceId::new(kind, name))
                .unwrap()
                .render(outputs)
        }

        #[test]
        fn test_api_server_from_current_context() {
            let kubeconfig = kube::config::Kubeconfig::from_yaml(KUBECONFIG).unwrap();
            assert_eq!(
                api_server(&kubeconfig).unwrap(),
                "https://myaks-abc123.hcp.eastus.azmk8s.io:443"
            );

            let mut missing = kubeconfig.clone();
            missing.current_context = Some("other".to_string());
            assert!(matches!(
                api_server(&missing),
                Err(DeployError::InvalidKubeconfig(_))
            ));
        }

        #[test]
        fn test_manifests_deserialize_into_typed_objects() {
            let outputs = Outputs::new();

            let deployment: Deployment =
                serde_json::from_value(manifest(ResourceKind::Deployment, "wordpress", &outputs))
                    .unwrap();
            let pod = deployment.spec.unwrap().template.spec.unwrap();
            assert_eq!(pod.containers[0].image.as_deref(), Some("wordpress:latest"));
            let volume = &pod.volumes.unwrap()[0];
            assert_eq!(
                volume.persistent_volume_claim.as_ref().unwrap().claim_name,
                "my-pvc"
            );

            let service: Service = serde_json::from_value(manifest(
                ResourceKind::Service,
                "wordpress-service",
                &outputs,
            ))
            .unwrap();
            assert_eq!(service.spec.unwrap().type_.as_deref(), Some("LoadBalancer"));

            let hpa: HorizontalPodAutoscaler = serde_json::from_value(manifest(
                ResourceKind::HorizontalPodAutoscaler,
                "myHPA",
                &outputs,
            ))
            .unwrap();
            let hpa = hpa.spec.unwrap();
            assert_eq!(hpa.max_replicas, 5);
            assert_eq!(hpa.metrics.unwrap().len(), 2);

            let ingress: Ingress = serde_json::from_value(manifest(
                ResourceKind::Ingress,
                "wordpress-ingress",
                &outputs,
            ))
            .unwrap();
            assert_eq!(ingress.spec.unwrap().rules.unwrap().len(), 1);
        }

        #[test]
        fn test_persistent_volume_uses_disk_outputs() {
            let disk = ResourceId::new(ResourceKind::ManagedDisk, "myDisk");
            let mut outputs = Outputs::new();
            outputs.record(
                disk,
                BTreeMap::from([
                    ("id".to_string(), json!("/subscriptions/s/disks/myDisk")),
                    ("name".to_string(), json!("myDisk")),
                ]),
            );

            let pv: PersistentVolume =
                serde_json::from_value(manifest(ResourceKind::PersistentVolume, "myPV", &outputs))
                    .unwrap();
            let source = pv.spec.unwrap().azure_disk.unwrap();
            assert_eq!(source.disk_name, "myDisk");
            assert_eq!(source.disk_uri, "/subscriptions/s/disks/myDisk");
        }

        #[test]
        fn test_load_balancer_address() {
            let mut service = Service::default();
            assert_eq!(load_balancer_address(Some(&service)), None);
            assert_eq!(load_balancer_address(None), None);

            service.status = Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some("20.1.2.3".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            });
            assert_eq!(load_balancer_address(Some(&service)).as_deref(), Some("20.1.2.3"));
        }
    }
}
