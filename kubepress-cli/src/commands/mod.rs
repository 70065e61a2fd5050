//! Command handlers

pub mod apply;
pub mod config;
pub mod outputs;
pub mod plan;
pub mod vm;

use crate::config::{load_settings, Config};
use crate::output::OutputFormat;
use crate::state::OutputStore;
use anyhow::{bail, Context, Result};
use kubepress_common::{wordpress_stack, Stack, StackSettings};
use kubepress_deploy::DeployContext;
use std::io::IsTerminal;
use std::path::PathBuf;

/// Everything a command needs from flags and config
pub struct Session {
    pub config: Config,
    pub stack_file: Option<PathBuf>,
    pub format: OutputFormat,
}

impl Session {
    pub fn settings(&self) -> Result<StackSettings> {
        load_settings(self.stack_file.as_deref())
    }

    pub fn load_stack(&self) -> Result<(StackSettings, Stack)> {
        let settings = self.settings()?;
        let stack = wordpress_stack(&settings).context("building stack")?;
        Ok((settings, stack))
    }

    pub fn store(&self) -> Result<OutputStore> {
        Ok(OutputStore::new(self.config.outputs_dir()?))
    }

    pub async fn connect(&self) -> Result<DeployContext> {
        let subscription = self.config.subscription()?;
        let credential = self.config.credential()?;
        DeployContext::connect(&credential, subscription)
            .await
            .context("connecting to Azure")
    }
}

/// Ask before a mutating call; `--yes` skips the prompt
pub fn confirm(prompt: &str, yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        bail!("not a terminal; pass --yes to proceed without confirmation");
    }
    Ok(dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}
