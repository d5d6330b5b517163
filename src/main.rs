use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use meshherd::config::MeshherdConfig;
use meshherd::directory::{HttpMeshDirectory, MeshDirectory};
use meshherd::shutdown::ShutdownCoordinator;
use meshherd::supervisor::{QuarantineStore, Supervisor};
use meshherd::telemetry::{init_telemetry, init_worker_telemetry};
use meshherd::worker::runtime::WorkerRuntime;
use meshherd::worker::MeshWorkerConfig;

#[derive(Parser)]
#[command(name = "meshherd")]
#[command(about = "Keeps one isolated worker process connected to each mesh")]
#[command(long_about = "meshherd supervises a fleet of worker processes, one per mesh, \
                       reconciling the fleet against the mesh directory. Each worker owns \
                       one persistent socket session; the supervisor owns restart, health \
                       and quarantine policy.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervisor daemon
    Run,
    /// Internal worker entry point, spawned by the supervisor
    #[command(hide = true)]
    Worker {
        /// Worker configuration as a JSON document
        #[arg(long)]
        config: String,
    },
    /// Show resolved configuration and the current blocklist
    Status,
    /// Inspect or edit the quarantine blocklist
    Blocklist {
        #[command(subcommand)]
        action: BlocklistAction,
    },
}

#[derive(Subcommand)]
enum BlocklistAction {
    /// List all block entries
    List,
    /// Remove one mesh from the blocklist
    Unblock { mesh_id: String },
    /// Remove every expired entry
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run_supervisor().await,
        Commands::Worker { config } => run_worker(config).await,
        Commands::Status => status_command().await,
        Commands::Blocklist { action } => blocklist_command(action).await,
    }
}

async fn run_supervisor() -> Result<()> {
    let config = MeshherdConfig::load()?;
    init_telemetry(&config.observability)?;

    let directory: Arc<dyn MeshDirectory> = Arc::new(HttpMeshDirectory::new(
        config.service.api_base_url.clone(),
        config.service.auth_token.clone(),
    ));

    let coordinator = ShutdownCoordinator::new();
    let shutdown_rx = coordinator.subscribe();
    tokio::spawn(async move {
        if let Err(e) = coordinator.listen_for_signals().await {
            tracing::error!(error = %e, "Signal handler failed");
        }
    });

    let supervisor = Supervisor::new(config, directory, shutdown_rx).await?;
    supervisor.run().await
}

async fn run_worker(config_json: String) -> Result<()> {
    // Missing or unreadable host config falls back to defaults; the worker
    // contract only requires the per-mesh config from argv.
    let host_config = MeshherdConfig::load().unwrap_or_default();
    init_worker_telemetry(&host_config.observability)?;

    let worker_config: MeshWorkerConfig = serde_json::from_str(&config_json)
        .map_err(|e| anyhow::anyhow!("Invalid worker config argument: {e}"))?;

    let mesh_id = worker_config.mesh_id.clone();
    let runtime = WorkerRuntime::new(worker_config, host_config.session.clone());
    match runtime.run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(mesh_id = %mesh_id, error = %e, "Worker failed");
            std::process::exit(1);
        }
    }
}

async fn status_command() -> Result<()> {
    let config = MeshherdConfig::load()?;
    println!("meshherd configuration");
    println!("  directory API:      {}", config.service.api_base_url);
    println!("  owner:              {}", config.service.owner_id);
    println!("  list mode:          {}", config.service.list_mode);
    println!(
        "  discovery interval: {}s",
        config.supervisor.discovery_interval_secs
    );
    println!(
        "  restart budget:     {} (floor {})",
        config.supervisor.max_process_restarts,
        meshherd::MIN_PROCESS_RESTARTS
    );
    println!(
        "  connection budget:  {}",
        config.supervisor.max_connection_attempts
    );
    println!();

    let store = load_store(&config).await?;
    if store.is_empty() {
        println!("Blocklist is empty ({})", store.path().display());
    } else {
        println!("Blocklist ({}):", store.path().display());
        print_entries(&store);
    }
    Ok(())
}

async fn blocklist_command(action: BlocklistAction) -> Result<()> {
    let config = MeshherdConfig::load()?;
    let mut store = load_store(&config).await?;

    match action {
        BlocklistAction::List => {
            if store.is_empty() {
                println!("Blocklist is empty");
            } else {
                print_entries(&store);
            }
        }
        BlocklistAction::Unblock { mesh_id } => {
            if store.unblock(&mesh_id).await {
                println!("Unblocked {mesh_id}");
            } else {
                println!("{mesh_id} was not blocked");
            }
        }
        BlocklistAction::Sweep => {
            let removed = store.cleanup_expired().await;
            println!("Removed {removed} expired entries");
        }
    }
    Ok(())
}

async fn load_store(config: &MeshherdConfig) -> Result<QuarantineStore> {
    let store = QuarantineStore::load(
        &config.quarantine.file_path,
        chrono::Duration::seconds(config.quarantine.failure_block_secs as i64),
    )
    .await?;
    Ok(store)
}

fn print_entries(store: &QuarantineStore) {
    let mut entries: Vec<_> = store.entries().collect();
    entries.sort_by(|a, b| a.mesh_id.cmp(&b.mesh_id));
    for entry in entries {
        let until = entry
            .blocked_until
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "permanent".to_string());
        println!(
            "  {}  reason={:?}  blocked_at={}  until={}",
            entry.mesh_id,
            entry.reason,
            entry.blocked_at.to_rfc3339(),
            until
        );
    }
}
