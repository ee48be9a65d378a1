use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use switchyard::config::{Config, GatewaySettings};
use switchyard::Gateway;

use crate::commands::routes::{handle_classify, handle_validate};
use crate::commands::run::{handle_run, load_request};
use crate::commands::tools::handle_list;
use crate::logging::setup_logging;

/// Reads `$SWITCHYARD_CONFIG_PATH`, else `config.yaml` in the platform config directory.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one turn and print its events as JSON lines
    Run {
        /// A JSON file holding either a turn request or a bare list of messages
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Use this model instead of routing
        #[arg(short, long)]
        model: Option<String>,

        /// Do not offer tools to the model
        #[arg(long)]
        no_tools: bool,
    },

    /// Inspect the routing policy
    Routes {
        #[command(subcommand)]
        command: RoutesCommand,
    },

    /// Inspect the configured tool servers
    Tools {
        #[command(subcommand)]
        command: ToolsCommand,
    },
}

#[derive(Subcommand)]
enum RoutesCommand {
    /// Check a policy file and list its routes
    Validate {
        #[arg(value_name = "POLICY")]
        path: PathBuf,
    },
    /// Show which route and candidates a conversation would get
    Classify {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum ToolsCommand {
    /// List the functions a turn would be offered
    List,
}

fn load_gateway() -> Result<Gateway> {
    let settings = GatewaySettings::from_config(Config::global())?;
    Gateway::from_settings(&settings)
}

pub async fn cli() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            file,
            model,
            no_tools,
        } => {
            setup_logging(Some("run"))?;
            let mut request = load_request(&file)?;
            if model.is_some() {
                request.model = model;
            }
            if no_tools {
                request.tools_enabled = false;
            }
            let gateway = load_gateway()?;
            handle_run(&gateway, request).await
        }
        Command::Routes { command } => {
            setup_logging(Some("routes"))?;
            match command {
                RoutesCommand::Validate { path } => {
                    let known: Vec<String> = GatewaySettings::from_config(Config::global())
                        .map(|settings| settings.models.into_iter().map(|m| m.id).collect())
                        .unwrap_or_default();
                    handle_validate(&path, &known)
                }
                RoutesCommand::Classify { file } => {
                    let gateway = load_gateway()?;
                    handle_classify(&gateway, &file).await
                }
            }
        }
        Command::Tools { command } => {
            setup_logging(Some("tools"))?;
            match command {
                ToolsCommand::List => {
                    let gateway = load_gateway()?;
                    handle_list(&gateway).await
                }
            }
        }
    }
}
