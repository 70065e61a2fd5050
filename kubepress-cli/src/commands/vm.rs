//! Helper VM commands

use super::Session;
use crate::output;
use anyhow::{Context, Result};
use clap::Subcommand;
use kubepress_common::vm::{ImageReference, VmSpec, DEFAULT_IMAGE, DEFAULT_VM_SIZE};
use kubepress_common::StackSettings;
use kubepress_deploy::vm::create_vm;

#[derive(Subcommand)]
pub enum VmCommands {
    /// Create a Linux VM on the cluster's node network
    Create {
        /// VM name
        #[arg(short, long)]
        name: String,
        /// Cluster name (defaults to the stack's cluster)
        #[arg(short, long)]
        cluster: Option<String>,
        /// Resource group of the cluster (defaults to the stack's group)
        #[arg(short, long)]
        resource_group: Option<String>,
        /// VM size
        #[arg(long, default_value = DEFAULT_VM_SIZE)]
        size: String,
        /// Image URN (publisher:offer:sku:version)
        #[arg(long, default_value = DEFAULT_IMAGE)]
        image: String,
        /// Virtual network in the node resource group
        #[arg(long)]
        vnet: Option<String>,
        /// Subnet of that network
        #[arg(long)]
        subnet: Option<String>,
    },
}

/// Build the VM spec; admin user and SSH key come from the stack's cluster
fn vm_spec(command: VmCommands, settings: &StackSettings) -> Result<VmSpec> {
    let VmCommands::Create {
        name,
        cluster,
        resource_group,
        size,
        image,
        vnet,
        subnet,
    } = command;

    let image: ImageReference = image
        .parse()
        .with_context(|| format!("invalid image '{}'", image))?;
    let spec = VmSpec {
        name,
        vm_size: size,
        image,
        admin_username: settings.cluster.admin_username.clone(),
        ssh_key: settings.cluster.ssh_key.clone(),
        resource_group: resource_group.unwrap_or_else(|| settings.resource_group.clone()),
        cluster_name: cluster.unwrap_or_else(|| settings.cluster.name.clone()),
        virtual_network: vnet,
        subnet,
    };
    spec.validate()?;
    Ok(spec)
}

pub async fn handle_vm_command(command: VmCommands, session: &Session) -> Result<()> {
    let settings = session.settings()?;
    let spec = vm_spec(command, &settings)?;

    let ctx = session.connect().await?;
    let spinner = output::spinner(format!("Creating VM '{}'", spec.name));
    match create_vm(&ctx, &spec).await {
        Ok(created) => {
            spinner.finish_and_clear();
            output::print_success(&format!("VM '{}' created", spec.name));
            output::print_single(&created, session.format)
        }
        Err(e) => {
            spinner.abandon_with_message(format!("VM '{}' failed", spec.name));
            Err(e).context("creating VM")
        }
    }
}
