//! clocklet: host-side core for the attendance sync desktop agent.
//!
//! Supervises a Python worker subprocess, correlates JSON-RPC-style calls
//! over its stdio, schedules periodic sync passes and relays lifecycle
//! events to the interface layer. The worker's internals (device
//! protocols, ERPNext, local persistence) stay behind the wire contract
//! in [`bridge::protocol`].

pub mod agent;
pub mod bridge;
pub mod config;
pub mod events;
pub mod locate;
pub mod router;
pub mod scheduler;
pub mod supervisor;

pub use agent::{AgentConfig, StartError, SyncAgent};
pub use bridge::{Bridge, BridgeConfig, CallError, DEFAULT_CALL_TIMEOUT};
pub use config::{
    ConfigError, ConfigStore, JsonFileConfigStore, MemoryConfigStore, SyncSettings,
};
pub use events::{AgentEvent, EventBus, NotificationSink, TracingNotifier, spawn_notifier};
pub use locate::{LocateError, ResolvedRuntime, RuntimeCandidate, RuntimeLocator};
pub use router::{
    CommandError, CommandRouter, DeviceDraft, DeviceProbe, DeviceUpdate, ErpnextProbe,
    ExportRequest, HistoryQuery, LogQuery, PunchDirection, ReportType, ShiftDraft, ShiftUpdate,
};
pub use scheduler::{SchedulerState, SyncRunner, SyncScheduler};
pub use supervisor::{SpawnError, WorkerConfig, WorkerStatus, WorkerSupervisor};

/// Install the default tracing subscriber for host binaries.
/// Filter comes from `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
