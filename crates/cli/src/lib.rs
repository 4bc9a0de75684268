//! Folder-as-a-service CLI
//!
//! A command-line tool for analyzing folders and managing the services
//! deployed from them.

pub mod client;
pub mod commands;
pub mod config;
pub mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::{analyze, observe, services};
use config::{Config, Settings};
use output::{print_info, print_json, print_success, OutputFormat};

/// Folder-as-a-service CLI
#[derive(Debug, Parser)]
#[command(name = "fas")]
#[command(author, version, about = "CLI for the folder-as-a-service controller", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via FAS_API_URL env var)
    #[arg(long, env = "FAS_API_URL")]
    pub api_url: Option<String>,

    /// Team that owns the services (can also be set via FAS_TEAM env var)
    #[arg(long, env = "FAS_TEAM")]
    pub team: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(flatten)]
    Api(ApiCommands),

    /// Show or change the saved CLI configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Commands that talk to the controller
#[derive(Debug, Subcommand)]
pub enum ApiCommands {
    /// Analyze a workspace folder and recommend services
    Analyze {
        /// Workspace id
        workspace: String,
        /// Folder relative to the workspace
        folder: String,
    },

    /// Manage services
    #[command(subcommand)]
    Services(ServicesCommands),

    /// Build and deploy a service
    Start {
        /// Service id or name
        service: String,
    },

    /// Stop a service
    Stop {
        /// Service id or name
        service: String,
    },

    /// Restart a running service, or redeploy a stopped or failed one
    Restart {
        /// Service id or name
        service: String,
    },

    /// Change the replica count of a running service
    Scale {
        /// Service id or name
        service: String,
        /// Desired replica count
        replicas: u32,
    },

    /// Show lifecycle status
    Status {
        /// Service id or name
        service: String,
    },

    /// Show container logs
    Logs {
        /// Service id or name
        service: String,
        /// Number of trailing lines
        #[arg(long, short = 'n', default_value_t = 100)]
        lines: usize,
    },

    /// Show the latest resource utilization
    Metrics {
        /// Service id or name
        service: String,
    },

    /// Show health checks
    Health {
        /// Service id or name
        service: String,
    },

    /// Show the deployment event log
    Events {
        /// Service id or name
        service: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ServicesCommands {
    /// List the team's services
    List,

    /// Show one service
    Get {
        /// Service id or name
        service: String,
    },

    /// Register a folder as a service; the controller analyzes it first
    Create {
        /// Workspace id
        workspace: String,
        /// Folder relative to the workspace
        folder: String,
        /// Service name (defaults to the folder name)
        #[arg(long)]
        name: Option<String>,
        /// Environment variable override (KEY=VALUE), repeatable
        #[arg(long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,
        /// Port override (HOST:CONTAINER), repeatable
        #[arg(long = "port", value_parser = parse_port)]
        ports: Vec<(u16, u16)>,
        /// Memory limit in MB
        #[arg(long)]
        memory_mb: Option<u32>,
        /// CPU limit in cores
        #[arg(long)]
        cpu_cores: Option<f32>,
    },

    /// Delete a service
    Delete {
        /// Service id or name
        service: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Print the effective settings
    Show,

    /// Save defaults to the config file
    Set {
        #[arg(long)]
        api_url: Option<String>,
        #[arg(long)]
        team: Option<String>,
        #[arg(long)]
        default_format: Option<OutputFormat>,
    },
}

/// Parse a KEY=VALUE pair
pub fn parse_env(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err("environment variable name must not be empty".to_string());
    }
    Ok((key.to_string(), value.to_string()))
}

/// Parse HOST:CONTAINER into (container port, host port)
pub fn parse_port(s: &str) -> Result<(u16, u16), String> {
    let (host, container) = s
        .split_once(':')
        .ok_or_else(|| format!("expected HOST:CONTAINER, got '{}'", s))?;
    let host: u16 = host.parse().map_err(|_| format!("invalid host port '{}'", host))?;
    let container: u16 = container
        .parse()
        .map_err(|_| format!("invalid container port '{}'", container))?;
    Ok((container, host))
}

/// Execute a parsed command line
pub async fn run(cli: Cli) -> Result<()> {
    let file_config = Config::load()?;
    let settings = Settings::resolve(cli.api_url, cli.team, cli.format, &file_config);

    match cli.command {
        Commands::Config(command) => run_config(command, &settings, file_config),
        Commands::Api(command) => {
            let client = client::ApiClient::new(&settings.api_url)?;
            dispatch(&client, &settings, command).await
        }
    }
}

async fn dispatch(client: &client::ApiClient, settings: &Settings, command: ApiCommands) -> Result<()> {
    let format = settings.format;
    match command {
        ApiCommands::Analyze { workspace, folder } => {
            analyze::analyze(client, &workspace, &folder, format).await
        }
        ApiCommands::Services(command) => {
            let team = settings.team()?;
            match command {
                ServicesCommands::List => services::list_services(client, team, format).await,
                ServicesCommands::Get { service } => {
                    services::get_service(client, team, &service, format).await
                }
                ServicesCommands::Create {
                    workspace,
                    folder,
                    name,
                    env,
                    ports,
                    memory_mb,
                    cpu_cores,
                } => {
                    let options = services::CreateOptions {
                        workspace,
                        folder,
                        name,
                        env,
                        ports,
                        memory_mb,
                        cpu_cores,
                    };
                    services::create_service(client, team, &options, format).await
                }
                ServicesCommands::Delete { service } => {
                    services::delete_service(client, team, &service, format).await
                }
            }
        }
        ApiCommands::Start { service } => {
            services::run_action(client, settings.team()?, &service, services::Action::Start, format).await
        }
        ApiCommands::Stop { service } => {
            services::run_action(client, settings.team()?, &service, services::Action::Stop, format).await
        }
        ApiCommands::Restart { service } => {
            services::run_action(client, settings.team()?, &service, services::Action::Restart, format).await
        }
        ApiCommands::Scale { service, replicas } => {
            services::scale_service(client, settings.team()?, &service, replicas, format).await
        }
        ApiCommands::Status { service } => observe::show_status(client, settings.team()?, &service, format).await,
        ApiCommands::Logs { service, lines } => {
            observe::show_logs(client, settings.team()?, &service, lines, format).await
        }
        ApiCommands::Metrics { service } => observe::show_metrics(client, settings.team()?, &service, format).await,
        ApiCommands::Health { service } => observe::show_health(client, settings.team()?, &service, format).await,
        ApiCommands::Events { service } => observe::show_events(client, settings.team()?, &service, format).await,
    }
}

fn run_config(command: ConfigCommands, settings: &Settings, mut file_config: Config) -> Result<()> {
    match command {
        ConfigCommands::Show => match settings.format {
            OutputFormat::Json => print_json(&serde_json::json!({
                "api_url": settings.api_url,
                "team": settings.team,
                "format": format!("{:?}", settings.format).to_lowercase(),
            }))?,
            OutputFormat::Table => {
                println!("API URL:  {}", settings.api_url);
                println!("Team:     {}", settings.team.as_deref().unwrap_or("-"));
                println!("Format:   {:?}", settings.format);
                print_info(&format!(
                    "Config file: {}",
                    Config::config_path()?.display()
                ));
            }
        },
        ConfigCommands::Set {
            api_url,
            team,
            default_format,
        } => {
            if let Some(url) = api_url {
                url::Url::parse(&url).context("Invalid API URL")?;
                file_config.api_url = Some(url);
            }
            if team.is_some() {
                file_config.team = team;
            }
            if let Some(format) = default_format {
                file_config.default_format = Some(format!("{:?}", format).to_lowercase());
            }
            let path = file_config.save()?;
            print_success(&format!("Saved {}", path.display()));
        }
    }
    Ok(())
}
