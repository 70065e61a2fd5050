//! Provisioner trait and the deployer that drives a plan

use crate::context::DeployContext;
use crate::{azure, identity, kubernetes, DeployError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use kubepress_common::{Declaration, Outputs, Plan, PlanGroup, ResourceId, ResourceKind, Stack};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Output fields of one realised resource
pub type Fields = BTreeMap<String, Value>;

/// Realises one kind of declaration
#[async_trait]
pub trait Provisioner: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Create the resource or bring it to the declared state, returning its outputs
    async fn create_or_update(
        &self,
        ctx: &DeployContext,
        declaration: &Declaration,
        outputs: &Outputs,
    ) -> Result<Fields>;

    /// Delete the resource; `recorded` holds the outputs of the last apply
    async fn delete(
        &self,
        ctx: &DeployContext,
        declaration: &Declaration,
        recorded: &Fields,
        outputs: &Outputs,
    ) -> Result<()>;

    /// Restore session state (such as API clients) from recorded outputs
    async fn connect(
        &self,
        _ctx: &DeployContext,
        _declaration: &Declaration,
        _outputs: &Outputs,
    ) -> Result<()> {
        Ok(())
    }
}

/// Holds one provisioner per resource kind
pub struct Deployer {
    provisioners: HashMap<ResourceKind, Box<dyn Provisioner>>,
}

impl Deployer {
    /// Deployer without any provisioners
    pub fn new() -> Self {
        Self {
            provisioners: HashMap::new(),
        }
    }

    /// Deployer for every kind the stack can declare
    pub fn with_defaults() -> Self {
        let mut deployer = Self::new();
        deployer.register(Box::new(azure::ResourceGroupProvisioner));
        deployer.register(Box::new(azure::StorageAccountProvisioner));
        deployer.register(Box::new(azure::ManagedDiskProvisioner));
        deployer.register(Box::new(azure::ClusterProvisioner));
        deployer.register(Box::new(identity::ApplicationProvisioner));
        deployer.register(Box::new(identity::ServicePrincipalProvisioner));
        deployer.register(Box::new(identity::PasswordProvisioner));
        deployer.register(Box::new(kubernetes::ProviderProvisioner));
        for kind in ResourceKind::ALL {
            if kind.is_kubernetes_object() {
                deployer.register(Box::new(kubernetes::ObjectProvisioner::new(kind)));
            }
        }
        deployer
    }

    /// Register a provisioner, replacing any earlier one for the same kind
    pub fn register(&mut self, provisioner: Box<dyn Provisioner>) {
        self.provisioners.insert(provisioner.kind(), provisioner);
    }

    fn provisioner(&self, kind: ResourceKind) -> Result<&dyn Provisioner> {
        self.provisioners
            .get(&kind)
            .map(|p| p.as_ref())
            .ok_or_else(|| DeployError::NoProvisioner(kind.to_string()))
    }

    /// Realise every group of `plan` in order
    pub async fn apply(
        &self,
        ctx: &DeployContext,
        stack: &Stack,
        plan: &Plan,
        outputs: &mut Outputs,
    ) -> Result<()> {
        stack.validate()?;
        for group in &plan.groups {
            self.apply_group(ctx, stack, group, outputs).await?;
        }
        info!(stack = %stack.name, resources = plan.len(), "Apply complete");
        Ok(())
    }

    /// Realise one group concurrently and record the outputs of every
    /// member that succeeded. Fails if any member failed.
    pub async fn apply_group(
        &self,
        ctx: &DeployContext,
        stack: &Stack,
        group: &PlanGroup,
        outputs: &mut Outputs,
    ) -> Result<()> {
        debug!(group = group.index, resources = group.resources.len(), "Applying group");

        let results = {
            let recorded: &Outputs = outputs;
            let tasks = group.resources.iter().map(|id| async move {
                let result = self.apply_one(ctx, stack, id, recorded).await;
                (id.clone(), result)
            });
            join_all(tasks).await
        };

        let mut failures = Vec::new();
        for (id, result) in results {
            match result {
                Ok(fields) => {
                    info!(resource = %id, "Resource realised");
                    outputs.record(id, fields);
                }
                Err(e) => {
                    warn!(resource = %id, error = %e, "Resource failed");
                    failures.push((id.to_string(), e.to_string()));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DeployError::GroupFailed {
                group: group.index,
                failures,
            })
        }
    }

    async fn apply_one(
        &self,
        ctx: &DeployContext,
        stack: &Stack,
        id: &ResourceId,
        outputs: &Outputs,
    ) -> Result<Fields> {
        let declaration = stack
            .get(id)
            .ok_or_else(|| kubepress_common::Error::DanglingReference {
                from: stack.name.clone(),
                to: id.to_string(),
            })?;
        for reference in declaration.spec.as_desired_state().references() {
            if outputs.get(reference).map_or(true, Value::is_null) {
                return Err(kubepress_common::Error::UnresolvedOutput(reference.to_string()).into());
            }
        }
        self.provisioner(id.kind)?
            .create_or_update(ctx, declaration, outputs)
            .await
    }

    /// Delete recorded resources in reverse plan order
    ///
    /// Resources without recorded outputs were never realised and are
    /// skipped. A resource that is already gone counts as deleted.
    pub async fn destroy(
        &self,
        ctx: &DeployContext,
        stack: &Stack,
        plan: &Plan,
        outputs: &mut Outputs,
    ) -> Result<()> {
        for declaration in stack.declarations() {
            if outputs.contains(&declaration.id) {
                self.provisioner(declaration.id.kind)?
                    .connect(ctx, declaration, outputs)
                    .await?;
            }
        }

        for group in plan.groups.iter().rev() {
            debug!(group = group.index, "Destroying group");
            let results = {
                let recorded: &Outputs = outputs;
                let tasks = group
                    .resources
                    .iter()
                    .rev()
                    .filter(|id| recorded.contains(id))
                    .map(|id| async move {
                        let result = self.destroy_one(ctx, stack, id, recorded).await;
                        (id.clone(), result)
                    });
                join_all(tasks).await
            };

            let mut failures = Vec::new();
            for (id, result) in results {
                match result {
                    Ok(()) => {
                        info!(resource = %id, "Resource deleted");
                        outputs.remove(&id);
                    }
                    Err(e) if e.is_not_found() => {
                        warn!(resource = %id, "Resource already gone");
                        outputs.remove(&id);
                    }
                    Err(e) => failures.push((id.to_string(), e.to_string())),
                }
            }
            if !failures.is_empty() {
                return Err(DeployError::GroupFailed {
                    group: group.index,
                    failures,
                });
            }
        }
        info!(stack = %stack.name, "Destroy complete");
        Ok(())
    }

    async fn destroy_one(
        &self,
        ctx: &DeployContext,
        stack: &Stack,
        id: &ResourceId,
        outputs: &Outputs,
    ) -> Result<()> {
        let (Some(declaration), Some(recorded)) = (stack.get(id), outputs.fields(id)) else {
            return Ok(());
        };
        self.provisioner(id.kind)?
            .delete(ctx, declaration, recorded, outputs)
            .await
    }

    /// Exported values; `None` where the output is not recorded yet
    pub fn exports(stack: &Stack, outputs: &Outputs) -> BTreeMap<String, Option<Value>> {
        stack
            .exports()
            .iter()
            .map(|(name, output)| {
                let value = outputs.get(output).filter(|v| !v.is_null()).cloned();
                (name.clone(), value)
            })
            .collect()
    }
}

impl Default for Deployer {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Find the typed spec of a declaration or fail
macro_rules! expect_spec {
    ($declaration:expr, $variant:ident) => {
        match &$declaration.spec {
            kubepress_common::ResourceSpec::$variant(spec) => spec,
            other => {
                return Err($crate::DeployError::unexpected(
                    &$declaration.id,
                    format!("expected a {} spec, got {}", stringify!($variant), other.kind()),
                ))
            }
        }
    };
}
pub(crate) use expect_spec;

/// Read a string output field
pub(crate) fn field_str(fields: &Fields, key: &str) -> Option<String> {
    fields.get(key).and_then(|v| v.as_str()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, RestClient};
    use kubepress_common::azure::{
        AccountTier, ManagedDisk, CreateOption, ReplicationType, ResourceGroup, StorageAccount,
    };
    use kubepress_common::ResourceSpec;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct MockProvisioner {
        kind: ResourceKind,
        log: Log,
        fail: bool,
        missing_on_delete: bool,
    }

    impl MockProvisioner {
        fn new(kind: ResourceKind, log: &Log) -> Self {
            Self {
                kind,
                log: log.clone(),
                fail: false,
                missing_on_delete: false,
            }
        }
    }

    #[async_trait]
    impl Provisioner for MockProvisioner {
        fn kind(&self) -> ResourceKind {
            self.kind
        }

        async fn create_or_update(
            &self,
            _ctx: &DeployContext,
            declaration: &Declaration,
            outputs: &Outputs,
        ) -> Result<Fields> {
            self.log
                .lock()
                .unwrap()
                .push(format!("create {}", declaration.id));
            if self.fail {
                return Err(DeployError::unexpected(&declaration.id, "boom"));
            }
            // The rendered body must see resolved outputs, not placeholders
            let body = declaration.render(outputs);
            assert!(!body.to_string().contains("${"), "unresolved body {}", body);
            Ok(BTreeMap::from([
                ("id".to_string(), json!(format!("/ids/{}", declaration.id.name))),
                ("name".to_string(), json!(declaration.id.name)),
                ("location".to_string(), json!("eastus")),
            ]))
        }

        async fn delete(
            &self,
            _ctx: &DeployContext,
            declaration: &Declaration,
            recorded: &Fields,
            _outputs: &Outputs,
        ) -> Result<()> {
            assert!(recorded.contains_key("id"));
            self.log
                .lock()
                .unwrap()
                .push(format!("delete {}", declaration.id));
            if self.missing_on_delete {
                return Err(ClientError::NotFound(declaration.id.to_string()).into());
            }
            Ok(())
        }
    }

    fn context() -> DeployContext {
        DeployContext::new(
            RestClient::new("http://127.0.0.1:9").unwrap(),
            RestClient::new("http://127.0.0.1:9").unwrap(),
            "sub",
        )
    }

    fn stack() -> Stack {
        let mut stack = Stack::new("test");
        let rg = stack
            .declare(Declaration::new(
                "rg",
                ResourceSpec::ResourceGroup(ResourceGroup {
                    location: "eastus".to_string(),
                }),
            ))
            .unwrap();
        let store = stack
            .declare(Declaration::new(
                "store",
                ResourceSpec::StorageAccount(StorageAccount {
                    resource_group_name: rg.output("name").into(),
                    location: rg.output("location").into(),
                    account_tier: AccountTier::Standard,
                    account_replication_type: ReplicationType::Lrs,
                }),
            ))
            .unwrap();
        stack
            .declare(Declaration::new(
                "disk",
                ResourceSpec::ManagedDisk(ManagedDisk {
                    resource_group_name: rg.output("name").into(),
                    location: rg.output("location").into(),
                    create_option: CreateOption::Empty,
                    disk_size_gb: 2,
                }),
            ))
            .unwrap();
        stack.export("store_id", store.output("id"));
        stack
    }

    fn deployer(log: &Log, configure: impl Fn(&mut MockProvisioner)) -> Deployer {
        let mut deployer = Deployer::new();
        for kind in [
            ResourceKind::ResourceGroup,
            ResourceKind::StorageAccount,
            ResourceKind::ManagedDisk,
        ] {
            let mut mock = MockProvisioner::new(kind, log);
            configure(&mut mock);
            deployer.register(Box::new(mock));
        }
        deployer
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_apply_records_outputs_in_order() {
        let log = Log::default();
        let deployer = deployer(&log, |_| {});
        let stack = stack();
        let plan = stack.plan().unwrap();
        let mut outputs = Outputs::new();

        deployer
            .apply(&context(), &stack, &plan, &mut outputs)
            .await
            .unwrap();

        let log = entries(&log);
        assert_eq!(log[0], "create resource-group/rg");
        assert_eq!(log.len(), 3);
        assert_eq!(outputs.len(), 3);

        let exports = Deployer::exports(&stack, &outputs);
        assert_eq!(exports["store_id"], Some(json!("/ids/store")));
    }

    #[tokio::test]
    async fn test_failed_group_stops_apply() {
        let log = Log::default();
        let mut deployer = deployer(&log, |_| {});
        let mut failing = MockProvisioner::new(ResourceKind::StorageAccount, &log);
        failing.fail = true;
        deployer.register(Box::new(failing));

        let stack = stack();
        let plan = stack.plan().unwrap();
        let mut outputs = Outputs::new();
        let err = deployer
            .apply(&context(), &stack, &plan, &mut outputs)
            .await
            .unwrap_err();

        match err {
            DeployError::GroupFailed { group, failures } => {
                assert_eq!(group, 1);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "storage-account/store");
            }
            other => panic!("unexpected error {:?}", other),
        }
        // The disk in the same group still ran and was recorded
        let disk = ResourceId::new(ResourceKind::ManagedDisk, "disk");
        assert!(outputs.contains(&disk));
        assert_eq!(Deployer::exports(&stack, &outputs)["store_id"], None);
    }

    #[tokio::test]
    async fn test_missing_provisioner() {
        let deployer = Deployer::new();
        let stack = stack();
        let plan = stack.plan().unwrap();
        let mut outputs = Outputs::new();
        let err = deployer
            .apply(&context(), &stack, &plan, &mut outputs)
            .await
            .unwrap_err();
        match err {
            DeployError::GroupFailed { failures, .. } => {
                assert!(failures[0].1.contains("No provisioner"))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_destroy_reverses_and_tolerates_missing() {
        let log = Log::default();
        let stack = stack();
        let plan = stack.plan().unwrap();
        let mut outputs = Outputs::new();
        deployer(&log, |_| {})
            .apply(&context(), &stack, &plan, &mut outputs)
            .await
            .unwrap();
        log.lock().unwrap().clear();

        deployer(&log, |m| m.missing_on_delete = m.kind == ResourceKind::ManagedDisk)
            .destroy(&context(), &stack, &plan, &mut outputs)
            .await
            .unwrap();

        let log = entries(&log);
        assert_eq!(log.len(), 3);
        assert_eq!(log.last().unwrap(), "delete resource-group/rg");
        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_skips_unrecorded() {
        let log = Log::default();
        let stack = stack();
        let plan = stack.plan().unwrap();
        let mut outputs = Outputs::new();
        outputs.record(
            ResourceId::new(ResourceKind::ResourceGroup, "rg"),
            BTreeMap::from([("id".to_string(), json!("/ids/rg"))]),
        );

        deployer(&log, |_| {})
            .destroy(&context(), &stack, &plan, &mut outputs)
            .await
            .unwrap();
        assert_eq!(entries(&log), vec!["delete resource-group/rg"]);
    }
}
