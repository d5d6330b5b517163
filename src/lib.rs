// meshherd library - mesh worker fleet supervision
// This exposes the core components for testing and integration

pub mod config;
pub mod directory;
pub mod protocol;
pub mod shutdown;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

// Re-export key types for easy access
pub use config::{config, MeshherdConfig, MIN_PROCESS_RESTARTS};
pub use directory::{HttpMeshDirectory, ListMode, MeshDetails, MeshDirectory, MeshSummary, StaticMeshDirectory};
pub use protocol::{parse_line, IpcEnvelope, IpcPayload, WorkerCommand, WorkerEvent, WorkerStatus};
pub use shutdown::ShutdownCoordinator;
pub use supervisor::{
    diff, BlockEntry, BlockReason, FleetStats, HealthMonitor, MeshProcessManager, ProcessRecord,
    ProcessRegistry, ProcessState, QuarantineStore, ReconcileActions, Reconciler, Supervisor,
    SupervisorMsg,
};
pub use telemetry::{generate_correlation_id, init_telemetry, init_worker_telemetry};
pub use worker::runtime::WorkerRuntime;
pub use worker::session::{ConnectionSession, SessionEvent, SessionSettings, SessionState};
pub use worker::MeshWorkerConfig;
