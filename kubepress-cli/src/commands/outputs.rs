//! Stack exports

use super::Session;
use crate::output::{self, OutputFormat};
use anyhow::Result;
use kubepress_common::resource::is_sensitive;
use kubepress_common::{Outputs, Stack};
use kubepress_deploy::Deployer;
use serde::Serialize;
use tabled::Tabled;

#[derive(Tabled, Serialize)]
struct ExportRow {
    name: String,
    value: String,
}

fn export_rows(stack: &Stack, outputs: &Outputs, show_secrets: bool) -> Vec<ExportRow> {
    let values = Deployer::exports(stack, outputs);
    stack
        .exports()
        .iter()
        .map(|(name, output)| {
            let value = match values.get(name).and_then(Option::as_ref) {
                None => "(not recorded)".to_string(),
                Some(value) => {
                    let shown = output::display_value(value);
                    if is_sensitive(&output.field) && !show_secrets {
                        output::mask(&shown)
                    } else {
                        shown
                    }
                }
            };
            ExportRow {
                name: name.clone(),
                value,
            }
        })
        .collect()
}

/// Print a stack's exports, masking secrets unless asked not to
pub fn print_exports(
    stack: &Stack,
    outputs: &Outputs,
    show_secrets: bool,
    format: OutputFormat,
) -> Result<()> {
    output::print_output(export_rows(stack, outputs, show_secrets), format)
}

pub fn handle_outputs(session: &Session, show_secrets: bool) -> Result<()> {
    let (_, stack) = session.load_stack()?;
    let outputs = session.store()?.load(&stack.name)?;
    if outputs.is_empty() {
        output::print_info(&format!(
            "No outputs recorded for stack '{}'; run apply first",
            stack.name
        ));
        return Ok(());
    }
    print_exports(&stack, &outputs, show_secrets, session.format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubepress_common::{wordpress_stack, ResourceId, ResourceKind, StackSettings};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn recorded() -> (Stack, Outputs) {
        let stack = wordpress_stack(&StackSettings::default()).unwrap();
        let mut outputs = Outputs::new();
        outputs.record(
            ResourceId::new(ResourceKind::KubernetesCluster, "myAKSCluster"),
            BTreeMap::from([("kube_config_raw".to_string(), json!("apiVersion: v1"))]),
        );
        (stack, outputs)
    }

    #[test]
    fn test_secrets_masked_by_default() {
        let (stack, outputs) = recorded();
        let rows = export_rows(&stack, &outputs, false);

        let kubeconfig = rows.iter().find(|r| r.name == "kubeconfig").unwrap();
        assert_eq!(kubeconfig.value, "[secret, 14 chars]");
        let ip = rows.iter().find(|r| r.name == "public_ip").unwrap();
        assert_eq!(ip.value, "(not recorded)");
    }

    #[test]
    fn test_show_secrets() {
        let (stack, outputs) = recorded();
        let rows = export_rows(&stack, &outputs, true);
        let kubeconfig = rows.iter().find(|r| r.name == "kubeconfig").unwrap();
        assert_eq!(kubeconfig.value, "apiVersion: v1");
    }
}
