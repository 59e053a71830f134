use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use droidbench::{
    Config, ContainerManager, TaskRuntime, ToolBridgeClient,
    api::{ApiServer, AppState},
    tasks::{ArtifactStore, TaskRegistry},
};

#[derive(Parser)]
#[command(name = "droidbench", version, about = "Android emulator benchmark harness")]
struct Cli {
    /// YAML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage emulator containers.
    Env {
        #[command(subcommand)]
        command: EnvCommands,
    },
    /// Inspect registered tasks.
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
enum EnvCommands {
    Launch {
        #[arg(long, default_value_t = 1)]
        count: usize,
        #[arg(long)]
        start_index: Option<u32>,
        #[arg(long)]
        image: Option<String>,
        /// Wait for every launched container to become ready.
        #[arg(long)]
        wait: bool,
    },
    List,
    Info {
        name: String,
    },
    /// Remove the named containers, or all of them when none are given.
    Remove {
        names: Vec<String>,
    },
    Restart {
        name: String,
    },
    Wait {
        names: Vec<String>,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Check the host can run emulator containers.
    Check,
}

#[derive(Subcommand)]
enum TaskCommands {
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::Env { command } => env(config, command).await,
        Commands::Tasks {
            command: TaskCommands::List,
        } => print_json(&TaskRegistry::with_builtin().describe()),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(config: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    let manager = ContainerManager::connect(config.containers.clone())
        .context("connecting to the container runtime")?;
    let tools = ToolBridgeClient::from_endpoints(config.tools.endpoint_set(), config.tools.call_timeout());
    let runtime = TaskRuntime::new(
        TaskRegistry::with_builtin(),
        Arc::new(tools),
        ArtifactStore::new(&config.artifacts_root),
        config.tasks.clone(),
    );
    tracing::info!(
        tasks = runtime.registry().len(),
        artifacts = %config.artifacts_root.display(),
        "task runtime ready"
    );

    let state = AppState::new(Arc::new(manager), Arc::new(runtime));
    let host = host.unwrap_or(config.server.host);
    let port = port.unwrap_or(config.server.port);
    ApiServer::new(state, &host, port).start_server().await?;
    Ok(())
}

async fn env(config: Config, command: EnvCommands) -> Result<()> {
    let manager = ContainerManager::connect(config.containers)
        .context("connecting to the container runtime")?;

    match command {
        EnvCommands::Launch {
            count,
            start_index,
            image,
            wait,
        } => {
            let outcomes = if wait {
                manager
                    .launch_and_wait(count, start_index, image.as_deref())
                    .await?
            } else {
                manager
                    .launch_containers(count, start_index, image.as_deref())
                    .await?
            };
            print_json(&outcomes)?;
            if outcomes.iter().any(|outcome| !outcome.launched) {
                bail!("some containers failed to launch");
            }
        }
        EnvCommands::List => print_json(&manager.list_containers().await?)?,
        EnvCommands::Info { name } => {
            let name = manager.resolve_container_name(&name).await?;
            match manager.get_container_info(&name).await? {
                Some(info) => print_json(&info)?,
                None => bail!("container `{name}` not found"),
            }
        }
        EnvCommands::Remove { names } => {
            let names = (!names.is_empty()).then_some(names);
            let report = manager.remove_containers(names).await;
            print_json(&report)?;
            if !report.failed.is_empty() {
                bail!("failed to remove {} container(s)", report.failed.len());
            }
        }
        EnvCommands::Restart { name } => {
            let name = manager.resolve_container_name(&name).await?;
            if !manager.restart_server_in_container(&name).await {
                bail!("failed to restart the server in `{name}`");
            }
            tracing::info!(container = %name, "server restarted");
        }
        EnvCommands::Wait {
            names,
            timeout_secs,
        } => {
            let mut resolved = Vec::with_capacity(names.len());
            for name in &names {
                resolved.push(manager.resolve_container_name(name).await?);
            }
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| manager.settings().ready_timeout());
            let ready = manager
                .wait_for_containers_ready(&resolved, timeout, manager.settings().poll_interval())
                .await;
            print_json(&ready)?;
            if ready.values().any(|ready| !ready) {
                bail!("not every container became ready within {timeout:?}");
            }
        }
        EnvCommands::Check => {
            let report = manager.check_prerequisites().await;
            print_json(&report)?;
            if !report.all_passed {
                bail!("prerequisite checks failed");
            }
        }
    }
    Ok(())
}
