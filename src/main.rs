use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;
use winmount_client::config::AppConfig;
use winmount_client::logging::{self, LogConfig};
use winmount_client::rpc::CLIENT_VERSION;
use winmount_client::{Client, Error};

#[derive(Parser)]
#[command(name = "wmctl")]
#[command(about = "Command-line client for the WinMount daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args, Serialize)]
struct GlobalArgs {
    /// Configuration file (defaults to ./wmctl.toml)
    #[serde(skip)]
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,

    /// Daemon host
    #[serde(rename = "daemon_host", skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    host: Option<String>,

    /// Daemon port
    #[serde(rename = "daemon_port", skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    port: Option<u16>,

    #[serde(skip_serializing_if = "is_false")]
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[serde(skip_serializing_if = "is_false")]
    #[arg(long, global = true)]
    json_logs: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Subcommand)]
enum Commands {
    /// Prints client and daemon versions
    Version,
    /// Asks the running daemon to exit
    StopDaemon,
    /// Lists filesystems or shows one in detail
    ListFs {
        #[arg(short, long)]
        id: Option<Uuid>,
    },
    /// Lists filesystem providers or shows one
    ListFsp {
        #[arg(short, long)]
        id: Option<Uuid>,
    },
    /// Lists filesystem servers or shows one in detail
    ListFsrv {
        #[arg(short, long)]
        id: Option<Uuid>,
    },
    /// Lists filesystem server providers or shows one
    ListFsrvp {
        #[arg(short, long)]
        id: Option<Uuid>,
    },
    /// Creates a filesystem
    CreateFs {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        provider: Uuid,
        /// Provider configuration as JSON
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Creates a filesystem server
    CreateFsrv {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        provider: Uuid,
        #[arg(short, long)]
        input_fs: Uuid,
        /// Provider configuration as JSON
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Deletes a filesystem
    RemoveFs {
        #[arg(short, long)]
        id: Uuid,
    },
    /// Deletes a filesystem server
    RemoveFsrv {
        #[arg(short, long)]
        id: Uuid,
    },
    /// Starts a filesystem
    StartFs {
        #[arg(short, long)]
        id: Uuid,
    },
    /// Starts a filesystem server
    StartFsrv {
        #[arg(short, long)]
        id: Uuid,
    },
    /// Stops a filesystem
    StopFs {
        #[arg(short, long)]
        id: Uuid,
    },
    /// Stops a filesystem server
    StopFsrv {
        #[arg(short, long)]
        id: Uuid,
    },
    /// Renames or reconfigures a filesystem
    UpdateFs {
        #[arg(short, long)]
        id: Uuid,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Renames or reconfigures a filesystem server
    UpdateFsrv {
        #[arg(short, long)]
        id: Uuid,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.global.config_file.as_deref(), Some(&cli.global))
        .context("Failed to load configuration")?;
    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    })
    .context("Failed to initialize logging")?;

    if let Commands::StopDaemon = cli.command {
        return stop_daemon(&config).await.context("Failed to stop daemon");
    }

    let url = config.ws_url();
    let client = Client::connect(&url)
        .await
        .with_context(|| format!("Failed to connect to daemon at {url}"))?;
    let result = run_command(&client, cli.command).await;
    client.close();
    result
}

async fn stop_daemon(config: &AppConfig) -> Result<()> {
    let response = reqwest::get(config.shutdown_url()).await?;
    response.error_for_status()?;
    println!("Daemon is shutting down");
    Ok(())
}

fn parse_config(config: Option<String>) -> Result<Option<Value>> {
    config
        .map(|text| serde_json::from_str(&text).context("Config is not valid JSON"))
        .transpose()
}

async fn run_command(client: &Client, command: Commands) -> Result<()> {
    match command {
        Commands::Version => {
            println!("Client version: {CLIENT_VERSION}");
            println!("Daemon version: {}", client.daemon_version());
        }
        Commands::StopDaemon => anyhow::bail!("stop-daemon does not use a session"),
        Commands::ListFs { id: Some(id) } => {
            let info = client.get_fs_info(id).await?;
            println!("Name: {}", info.name);
            println!("Kind Id: {}", info.kind_id);
            println!("Is Running: {}", info.is_running);
            println!("Config: {}", info.config);
        }
        Commands::ListFs { id: None } => {
            println!("Id | Name | Kind Id | Is Running | Is Global");
            for fs in client.list_fs().await? {
                println!(
                    "{} | {} | {} | {} | {}",
                    fs.id, fs.name, fs.kind_id, fs.is_running, fs.is_global
                );
            }
        }
        Commands::ListFsp { id: Some(id) } => {
            let provider = client
                .list_fsp()
                .await?
                .into_iter()
                .find(|p| p.id == id)
                .ok_or_else(|| anyhow!("filesystem provider {id} not found"))?;
            println!("Name: {}", provider.name);
            if let Some(version) = provider.version {
                println!("Version: {version}");
            }
            println!("Template Config: {}", provider.template_config);
        }
        Commands::ListFsp { id: None } => {
            println!("Id | Name");
            for p in client.list_fsp().await? {
                println!("{} | {}", p.id, p.name);
            }
        }
        Commands::ListFsrv { id: Some(id) } => {
            let info = client.get_fsrv_info(id).await?;
            println!("Name: {}", info.name);
            println!("Kind Id: {}", info.kind_id);
            println!("Is Running: {}", info.is_running);
            println!("Input Filesystem Id: {}", info.in_fs_id);
            println!("Config: {}", info.config);
        }
        Commands::ListFsrv { id: None } => {
            println!("Id | Name | Kind Id | Input Fs Id | Is Running");
            for s in client.list_fsrv().await? {
                println!(
                    "{} | {} | {} | {} | {}",
                    s.id, s.name, s.kind_id, s.in_fs_id, s.is_running
                );
            }
        }
        Commands::ListFsrvp { id: Some(id) } => {
            let provider = client
                .list_fsrvp()
                .await?
                .into_iter()
                .find(|p| p.id == id)
                .ok_or_else(|| anyhow!("filesystem server provider {id} not found"))?;
            println!("Name: {}", provider.name);
            if let Some(version) = provider.version {
                println!("Version: {version}");
            }
            println!("Template Config: {}", provider.template_config);
        }
        Commands::ListFsrvp { id: None } => {
            println!("Id | Name");
            for p in client.list_fsrvp().await?.into_iter().filter(|p| !p.is_hidden) {
                println!("{} | {}", p.id, p.name);
            }
        }
        Commands::CreateFs {
            name,
            provider,
            config,
        } => {
            let id = client
                .create_fs(&name, provider, parse_config(config)?)
                .await
                .map_err(explain)?;
            println!("Created a new filesystem with id {id}");
        }
        Commands::CreateFsrv {
            name,
            provider,
            input_fs,
            config,
        } => {
            let id = client
                .create_fsrv(&name, provider, input_fs, parse_config(config)?)
                .await
                .map_err(explain)?;
            println!("Created a new filesystem server with id {id}");
        }
        Commands::RemoveFs { id } => client.remove_fs(id).await.map_err(explain)?,
        Commands::RemoveFsrv { id } => client.remove_fsrv(id).await.map_err(explain)?,
        Commands::StartFs { id } => report(client.start_fs(id).await?, "started"),
        Commands::StartFsrv { id } => report(client.start_fsrv(id).await?, "started"),
        Commands::StopFs { id } => report(client.stop_fs(id).await?, "stopped"),
        Commands::StopFsrv { id } => report(client.stop_fsrv(id).await?, "stopped"),
        Commands::UpdateFs { id, name, config } => client
            .update_fs_info(id, name.as_deref(), parse_config(config)?)
            .await
            .map_err(explain)?,
        Commands::UpdateFsrv { id, name, config } => client
            .update_fsrv_info(id, name.as_deref(), parse_config(config)?)
            .await
            .map_err(explain)?,
    }
    Ok(())
}

fn report(changed: bool, verb: &str) {
    if changed {
        println!("Successfully {verb}");
    } else {
        println!("Already {verb}");
    }
}

/// Application errors are expected business failures; anything else points at
/// the environment.
fn explain(err: Error) -> anyhow::Error {
    if err.is_application() {
        anyhow::Error::new(err).context("Daemon refused the request")
    } else {
        anyhow::Error::new(err).context("Request did not complete")
    }
}
