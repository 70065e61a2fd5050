//! kubepress CLI
//!
//! Plans, applies and tears down the AKS-hosted WordPress stack

mod commands;
mod config;
mod logging;
mod output;
mod state;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::config::ConfigCommands;
use commands::vm::VmCommands;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Stack settings file (TOML); built-in defaults when omitted
    #[arg(short, long, env = "KUBEPRESS_STACK", global = true)]
    stack: Option<PathBuf>,

    /// Output format (table, json, yaml)
    #[arg(short, long, global = true)]
    output: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the stack and check it for problems
    Validate,
    /// Show the order resources are created in
    Plan,
    /// Print each desired-state document
    Render {
        /// Write one YAML file per resource here instead of printing
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Create or update every resource
    Apply {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Delete every recorded resource in reverse order
    Destroy {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Show the stack's exports
    Outputs {
        /// Print secret values in full
        #[arg(long)]
        show_secrets: bool,
    },
    /// Helper virtual machines
    Vm {
        #[command(subcommand)]
        command: VmCommands,
    },
    /// CLI configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match config::Config::load() {
        Ok(config) => config,
        Err(e) => {
            output::print_warning(&format!("Ignoring config file: {:#}", e));
            config::Config::default().with_env(|key| std::env::var(key).ok())
        }
    };

    let _guard = logging::LoggingConfig::new(&config.log_level, cli.verbose, config.log_dir.clone())
        .init()?;

    let format = output::OutputFormat::parse(cli.output.as_deref().unwrap_or(&config.default_output));
    let session = commands::Session {
        stack_file: cli.stack.clone().or_else(|| config.stack_file.clone()),
        config,
        format,
    };

    match cli.command {
        Commands::Validate => commands::plan::handle_validate(&session)?,
        Commands::Plan => commands::plan::handle_plan(&session)?,
        Commands::Render { out_dir } => {
            commands::plan::handle_render(&session, out_dir.as_deref())?
        }
        Commands::Apply { yes } => commands::apply::handle_apply(&session, yes).await?,
        Commands::Destroy { yes } => commands::apply::handle_destroy(&session, yes).await?,
        Commands::Outputs { show_secrets } => {
            commands::outputs::handle_outputs(&session, show_secrets)?
        }
        Commands::Vm { command } => commands::vm::handle_vm_command(command, &session).await?,
        Commands::Config { command } => {
            commands::config::handle_config_command(command, &session)?
        }
        Commands::Completions { shell } => {
            generate_completions(shell);
        }
    }

    Ok(())
}

/// Generate shell completions
fn generate_completions(shell: clap_complete::Shell) {
    use clap::CommandFactory;
    use clap_complete::generate;
    use std::io;

    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();

    generate(shell, &mut cmd, name, &mut io::stdout());
}
