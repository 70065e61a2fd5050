//! validate, plan and render

use super::Session;
use crate::output::{self, OutputFormat};
use anyhow::{Context, Result};
use kubepress_common::{Outputs, Plan, ResourceId, Stack};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tabled::Tabled;

#[derive(Tabled, Serialize)]
struct PlanRow {
    group: usize,
    resource: String,
    #[tabled(rename = "depends on")]
    depends_on: String,
}

fn plan_rows(stack: &Stack, plan: &Plan) -> Vec<PlanRow> {
    plan.groups
        .iter()
        .flat_map(|group| {
            group.resources.iter().map(move |id| {
                let depends_on = stack
                    .get(id)
                    .map(|d| {
                        d.dependencies()
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                PlanRow {
                    group: group.index + 1,
                    resource: id.to_string(),
                    depends_on,
                }
            })
        })
        .collect()
}

pub fn handle_validate(session: &Session) -> Result<()> {
    let (_, stack) = session.load_stack()?;
    stack
        .validate()
        .with_context(|| format!("stack '{}' is invalid", stack.name))?;
    let plan = stack.plan()?;
    output::print_success(&format!(
        "Stack '{}' is valid: {} resources in {} groups",
        stack.name,
        plan.len(),
        plan.groups.len()
    ));
    Ok(())
}

pub fn handle_plan(session: &Session) -> Result<()> {
    let (_, stack) = session.load_stack()?;
    stack
        .validate()
        .with_context(|| format!("stack '{}' is invalid", stack.name))?;
    let plan = stack.plan()?;

    let mut rows = plan_rows(&stack, &plan);
    if session.format == OutputFormat::Table {
        for row in &mut rows {
            row.depends_on = output::truncate(&row.depends_on, 80);
        }
    }
    output::print_output(rows, session.format)
}

/// `deployment-wordpress.yaml`
fn document_file_name(id: &ResourceId) -> String {
    format!("{}-{}.yaml", id.kind, id.name)
}

#[derive(Serialize)]
struct RenderedDocument {
    resource: String,
    document: Value,
}

/// Print or write every desired-state document in creation order
///
/// Values owned by resources that were already applied are filled in from
/// their recorded outputs; the rest show as `${kind/name.field}`.
pub fn handle_render(session: &Session, out_dir: Option<&Path>) -> Result<()> {
    let (_, stack) = session.load_stack()?;
    let plan = stack.plan()?;
    let outputs = match session.store().and_then(|store| store.load(&stack.name)) {
        Ok(outputs) => outputs,
        Err(e) => {
            tracing::warn!(error = %e, "No recorded outputs; rendering placeholders");
            Outputs::new()
        }
    };

    let declarations: Vec<_> = plan
        .creation_order()
        .iter()
        .filter_map(|id| stack.get(id))
        .collect();

    if let Some(dir) = out_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        for declaration in &declarations {
            let path = dir.join(document_file_name(&declaration.id));
            let yaml = serde_yaml::to_string(&declaration.render(&outputs))?;
            std::fs::write(&path, yaml).with_context(|| format!("writing {}", path.display()))?;
        }
        output::print_success(&format!(
            "Wrote {} documents to {}",
            declarations.len(),
            dir.display()
        ));
        return Ok(());
    }

    let documents: Vec<RenderedDocument> = declarations
        .iter()
        .map(|declaration| RenderedDocument {
            resource: declaration.id.to_string(),
            document: declaration.render(&outputs),
        })
        .collect();

    match session.format {
        OutputFormat::Json => output::print_json(&documents),
        _ => {
            for rendered in &documents {
                println!("---");
                println!("# {}", rendered.resource);
                output::print_yaml(&rendered.document)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubepress_common::{wordpress_stack, ResourceKind, StackSettings};

    #[test]
    fn test_plan_rows() {
        let stack = wordpress_stack(&StackSettings::default()).unwrap();
        let plan = stack.plan().unwrap();
        let rows = plan_rows(&stack, &plan);

        assert_eq!(rows.len(), stack.len());
        assert_eq!(rows[0].group, 1);
        assert_eq!(rows[0].resource, "resource-group/myResourceGroup");
        assert_eq!(rows[0].depends_on, "");

        let provider = rows
            .iter()
            .find(|r| r.resource == "kubernetes-provider/k8sProvider")
            .unwrap();
        assert_eq!(provider.depends_on, "cluster/myAKSCluster");
        assert!(rows.windows(2).all(|w| w[0].group <= w[1].group));
    }

    #[test]
    fn test_document_file_name() {
        let id = ResourceId::new(ResourceKind::PersistentVolumeClaim, "myPVC");
        assert_eq!(document_file_name(&id), "persistent-volume-claim-myPVC.yaml");
    }
}
