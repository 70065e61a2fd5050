//! apply and destroy

use super::{confirm, outputs, Session};
use crate::output;
use anyhow::{Context, Result};
use kubepress_common::{Outputs, Stack};
use kubepress_deploy::Deployer;
use std::time::Instant;

/// Recorded resources the stack no longer declares
fn stale_resources(stack: &Stack, recorded: &Outputs) -> Vec<String> {
    recorded
        .iter()
        .filter(|(id, _)| stack.get(id).is_none())
        .map(|(id, _)| id.to_string())
        .collect()
}

pub async fn handle_apply(session: &Session, yes: bool) -> Result<()> {
    let (_, stack) = session.load_stack()?;
    stack
        .validate()
        .with_context(|| format!("stack '{}' is invalid", stack.name))?;
    let plan = stack.plan()?;

    output::print_info(&format!(
        "Stack '{}': {} resources in {} groups",
        stack.name,
        plan.len(),
        plan.groups.len()
    ));
    if !confirm(&format!("Apply stack '{}'?", stack.name), yes)? {
        output::print_warning("Apply cancelled");
        return Ok(());
    }

    let ctx = session.connect().await?;
    let store = session.store()?;
    let mut recorded = store.load(&stack.name)?;
    for stale in stale_resources(&stack, &recorded) {
        output::print_warning(&format!("{} is recorded but no longer declared", stale));
    }

    let deployer = Deployer::with_defaults();
    let started = Instant::now();
    let total = plan.groups.len();
    for group in &plan.groups {
        let names: Vec<String> = group.resources.iter().map(ToString::to_string).collect();
        let spinner = output::spinner(format!(
            "Group {}/{}: {}",
            group.index + 1,
            total,
            names.join(", ")
        ));

        let result = deployer
            .apply_group(&ctx, &stack, group, &mut recorded)
            .await;
        // Whatever succeeded is kept so a re-run or destroy can see it
        store.save(&stack.name, &recorded)?;

        match result {
            Ok(()) => spinner.finish_with_message(format!("Group {}/{} ready", group.index + 1, total)),
            Err(e) => {
                spinner.abandon_with_message(format!("Group {}/{} failed", group.index + 1, total));
                return Err(e).context("apply stopped; outputs of realised resources were recorded");
            }
        }
    }

    output::print_success(&format!(
        "Applied {} resources in {} (finished {})",
        plan.len(),
        output::format_duration(started.elapsed().as_secs()),
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    ));
    outputs::print_exports(&stack, &recorded, false, session.format)
}

pub async fn handle_destroy(session: &Session, yes: bool) -> Result<()> {
    let (_, stack) = session.load_stack()?;
    let plan = stack.plan()?;
    let store = session.store()?;
    let mut recorded = store.load(&stack.name)?;

    if recorded.is_empty() {
        output::print_info(&format!("Nothing recorded for stack '{}'", stack.name));
        return Ok(());
    }
    for stale in stale_resources(&stack, &recorded) {
        output::print_warning(&format!("{} is recorded but not declared; it is left alone", stale));
    }
    if !confirm(
        &format!("Destroy {} resources of stack '{}'?", recorded.len(), stack.name),
        yes,
    )? {
        output::print_warning("Destroy cancelled");
        return Ok(());
    }

    let ctx = session.connect().await?;
    let spinner = output::spinner(format!("Destroying stack '{}'", stack.name));
    let result = Deployer::with_defaults()
        .destroy(&ctx, &stack, &plan, &mut recorded)
        .await;
    store.save(&stack.name, &recorded)?;

    match result {
        Ok(()) => {
            spinner.finish_and_clear();
            output::print_success(&format!("Stack '{}' destroyed", stack.name));
            Ok(())
        }
        Err(e) => {
            spinner.abandon_with_message("Destroy failed".to_string());
            Err(e).context(format!("{} resources are still recorded", recorded.len()))
        }
    }
}
