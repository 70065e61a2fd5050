//! Stack of declarations and the order they are realised in
//!
//! Groups are computed with Kahn's algorithm: every member of group N has
//! all of its dependencies in groups 0..N-1, so members of one group can be
//! realised concurrently.

use crate::resource::{Declaration, OutputRef, ResourceId, ResourceKind, ResourceSpec};
use crate::workloads::{Deployment, PersistentVolume, PersistentVolumeClaim, Service};
use crate::{invalid, Error, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Named set of declarations and exported outputs
#[derive(Debug, Clone, Default)]
pub struct Stack {
    pub name: String,
    declarations: Vec<Declaration>,
    index: HashMap<ResourceId, usize>,
    exports: BTreeMap<String, OutputRef>,
}

impl Stack {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Add a declaration; each id may be declared once
    pub fn declare(&mut self, declaration: Declaration) -> Result<ResourceId> {
        let id = declaration.id.clone();
        if self.index.contains_key(&id) {
            return Err(Error::DuplicateResource(id.to_string()));
        }
        self.index.insert(id.clone(), self.declarations.len());
        self.declarations.push(declaration);
        Ok(id)
    }

    /// Export an output under `name`, replacing an earlier export of the same name
    pub fn export(&mut self, name: &str, output: OutputRef) {
        self.exports.insert(name.to_string(), output);
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Declaration> {
        self.index.get(id).map(|&i| &self.declarations[i])
    }

    pub fn declarations(&self) -> &[Declaration] {
        &self.declarations
    }

    pub fn exports(&self) -> &BTreeMap<String, OutputRef> {
        &self.exports
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    /// Check every declaration and every edge between them
    pub fn validate(&self) -> Result<()> {
        for declaration in &self.declarations {
            declaration.validate()?;
        }
        self.check_references()?;
        self.check_providers()?;
        self.check_object_links()?;
        self.plan().map(|_| ())
    }

    fn check_references(&self) -> Result<()> {
        for declaration in &self.declarations {
            for dependency in declaration.dependencies() {
                if !self.index.contains_key(&dependency) {
                    return Err(Error::DanglingReference {
                        from: declaration.id.to_string(),
                        to: dependency.to_string(),
                    });
                }
            }
        }
        for (name, output) in &self.exports {
            if !self.index.contains_key(&output.resource) {
                return Err(Error::DanglingReference {
                    from: format!("export '{}'", name),
                    to: output.resource.to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_providers(&self) -> Result<()> {
        for declaration in &self.declarations {
            let provider = &declaration.options.provider;
            if declaration.id.kind.is_kubernetes_object() {
                match provider {
                    Some(p) if p.kind == ResourceKind::KubernetesProvider => {}
                    _ => return Err(Error::MissingProvider(declaration.id.to_string())),
                }
            } else if let Some(p) = provider {
                return Err(invalid(
                    &declaration.id.name,
                    format!("{} is not a Kubernetes object but names provider {}", declaration.id, p),
                ));
            }
        }
        Ok(())
    }

    /// Objects inside the cluster refer to each other by Kubernetes name
    /// rather than by output; check that those names line up.
    fn check_object_links(&self) -> Result<()> {
        let mut deployments = Vec::new();
        let mut services = Vec::new();
        let mut volumes = Vec::new();
        let mut claims = Vec::new();
        for declaration in &self.declarations {
            match &declaration.spec {
                ResourceSpec::Deployment(d) => deployments.push(d),
                ResourceSpec::Service(s) => services.push(s),
                ResourceSpec::PersistentVolume(v) => volumes.push(v),
                ResourceSpec::PersistentVolumeClaim(c) => claims.push(c),
                _ => {}
            }
        }

        let namespace = |ns: &Option<String>| ns.clone().unwrap_or_else(|| "default".to_string());

        for declaration in &self.declarations {
            let name = &declaration.id.name;
            match &declaration.spec {
                ResourceSpec::HorizontalPodAutoscaler(hpa) => {
                    let target = &hpa.scale_target_ref;
                    let ns = namespace(&hpa.metadata.namespace);
                    let found = target.kind == "Deployment"
                        && deployments.iter().any(|d| {
                            d.metadata.name == target.name && namespace(&d.metadata.namespace) == ns
                        });
                    if !found {
                        return Err(invalid(
                            name,
                            format!("scale target {} '{}' is not declared", target.kind, target.name),
                        ));
                    }
                }
                ResourceSpec::Deployment(deployment) => {
                    let ns = namespace(&deployment.metadata.namespace);
                    for volume in &deployment.volumes {
                        let found = claims.iter().any(|c| {
                            c.metadata.name == volume.claim_name
                                && namespace(&c.metadata.namespace) == ns
                        });
                        if !found {
                            return Err(invalid(
                                name,
                                format!("claim '{}' is not declared", volume.claim_name),
                            ));
                        }
                    }
                }
                ResourceSpec::Service(service) => {
                    if !deployments
                        .iter()
                        .any(|d| selects(service, d, &namespace))
                    {
                        return Err(invalid(name, "selector matches no declared deployment"));
                    }
                }
                ResourceSpec::Ingress(ingress) => {
                    let ns = namespace(&ingress.metadata.namespace);
                    for backend in ingress.backends() {
                        let service = services.iter().find(|s| {
                            s.metadata.name == backend.service_name
                                && namespace(&s.metadata.namespace) == ns
                        });
                        match service {
                            None => {
                                return Err(invalid(
                                    name,
                                    format!("backend service '{}' is not declared", backend.service_name),
                                ))
                            }
                            Some(s) if !s.exposes(backend.service_port) => {
                                return Err(invalid(
                                    name,
                                    format!(
                                        "service '{}' does not expose port {}",
                                        backend.service_name, backend.service_port
                                    ),
                                ))
                            }
                            Some(_) => {}
                        }
                    }
                }
                ResourceSpec::PersistentVolumeClaim(claim) => {
                    check_binding(claim, &volumes)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Order the declarations into groups of mutually independent resources
    pub fn plan(&self) -> Result<Plan> {
        let total = self.declarations.len();
        let dependencies: Vec<Vec<usize>> = self
            .declarations
            .iter()
            .map(|d| {
                d.dependencies()
                    .iter()
                    .filter_map(|id| self.index.get(id).copied())
                    .collect()
            })
            .collect();

        let mut placed = vec![false; total];
        let mut placed_count = 0;
        let mut groups: Vec<PlanGroup> = Vec::new();

        while placed_count < total {
            // Scan in declaration order so ties stay deterministic
            let ready: Vec<usize> = (0..total)
                .filter(|&i| !placed[i] && dependencies[i].iter().all(|&d| placed[d]))
                .collect();

            if ready.is_empty() {
                let stuck = (0..total)
                    .filter(|&i| !placed[i])
                    .map(|i| self.declarations[i].id.to_string())
                    .collect();
                return Err(Error::DependencyCycle(stuck));
            }

            for &i in &ready {
                placed[i] = true;
            }
            placed_count += ready.len();

            let group = PlanGroup {
                index: groups.len(),
                resources: ready
                    .into_iter()
                    .map(|i| self.declarations[i].id.clone())
                    .collect(),
            };
            debug!(group = group.index, resources = group.resources.len(), "Computed plan group");
            groups.push(group);
        }

        info!(
            stack = %self.name,
            groups = groups.len(),
            resources = total,
            "Computed plan"
        );
        Ok(Plan { groups })
    }
}

fn selects(
    service: &Service,
    deployment: &Deployment,
    namespace: &dyn Fn(&Option<String>) -> String,
) -> bool {
    namespace(&service.metadata.namespace) == namespace(&deployment.metadata.namespace)
        && service
            .selector
            .iter()
            .all(|(k, v)| deployment.labels.get(k) == Some(v))
}

fn check_binding(claim: &PersistentVolumeClaim, volumes: &[&PersistentVolume]) -> Result<()> {
    let Some(volume_name) = &claim.volume_name else {
        return Ok(());
    };
    let volume = volumes
        .iter()
        .find(|v| &v.metadata.name == volume_name)
        .ok_or_else(|| {
            invalid(
                &claim.metadata.name,
                format!("volume '{}' is not declared", volume_name),
            )
        })?;
    claim.fits(volume)
}

/// Resources that can be realised concurrently
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanGroup {
    pub index: usize,
    pub resources: Vec<ResourceId>,
}

/// Ordered groups of a stack
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub groups: Vec<PlanGroup>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.resources.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn creation_order(&self) -> Vec<ResourceId> {
        self.groups
            .iter()
            .flat_map(|g| g.resources.iter().cloned())
            .collect()
    }

    /// Reverse of creation order
    pub fn deletion_order(&self) -> Vec<ResourceId> {
        self.groups
            .iter()
            .rev()
            .flat_map(|g| g.resources.iter().rev().cloned())
            .collect()
    }

    /// Index of the group holding `id`
    pub fn group_of(&self, id: &ResourceId) -> Option<usize> {
        self.groups
            .iter()
            .find(|g| g.resources.contains(id))
            .map(|g| g.index)
    }
}
