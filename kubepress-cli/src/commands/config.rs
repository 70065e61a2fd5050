//! CLI configuration commands

use super::Session;
use crate::config::Config;
use crate::output;
use anyhow::{bail, Result};
use clap::Subcommand;
use dialoguer::Input;
use std::io::IsTerminal;

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration (file plus environment)
    Show,
    /// Write a configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the configuration file path
    Path,
}

fn prompt(label: &str, current: Option<&str>) -> Result<Option<String>> {
    let mut input = Input::<String>::new().with_prompt(label).allow_empty(true);
    if let Some(current) = current {
        input = input.default(current.to_string());
    }
    let value = input.interact_text()?;
    Ok(Some(value).filter(|v| !v.trim().is_empty()))
}

pub fn handle_config_command(command: ConfigCommands, session: &Session) -> Result<()> {
    match command {
        ConfigCommands::Show => output::print_single(&session.config, session.format)?,

        ConfigCommands::Path => println!("{}", Config::config_path()?.display()),

        ConfigCommands::Init { force } => {
            let path = Config::config_path()?;
            if path.exists() && !force {
                bail!("{} already exists; pass --force to overwrite", path.display());
            }

            let mut config = session.config.clone();
            if std::io::stdin().is_terminal() {
                config.subscription_id =
                    prompt("Subscription id", config.subscription_id.as_deref())?;
                config.tenant_id = prompt("Tenant id", config.tenant_id.as_deref())?;
                config.client_id = prompt("Client id", config.client_id.as_deref())?;
            }

            let path = config.save()?;
            output::print_success(&format!("Wrote {}", path.display()));
            output::print_info("Client secrets are never stored; set AZURE_CLIENT_SECRET or enter it when asked");
        }
    }
    Ok(())
}
