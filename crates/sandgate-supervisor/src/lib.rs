//! sandgate-supervisor — lifecycle of the single backend process.
//!
//! The backend is launched on demand, restored from durable storage
//! first, and only considered usable once its readiness endpoint answers.
//!
//! # Architecture
//!
//! ```text
//! Supervisor
//!   ├── ensure_running()   single-flight start attempt shared via watch
//!   │   ├── SyncEngine::restore()
//!   │   ├── Launcher::launch() → ComputeProcess
//!   │   └── ReadinessProbe (exponential backoff, bounded)
//!   └── run_watchdog()     HealthTracker → Ready → Absent on failure
//! ```
//!
//! State machine: `Absent → Starting → Ready`, `Starting → Crashed → Absent`
//! on failure, `Ready → Absent` on external termination.

pub mod error;
pub mod probe;
pub mod process;
pub mod supervisor;

pub use error::LifecycleError;
pub use probe::{HealthTracker, HttpProbe, Liveness, ProbeResult, ReadinessProbe, http_probe};
pub use process::{CommandLauncher, ComputeProcess, Launcher};
pub use supervisor::{ComputeState, StartPolicy, Supervisor};
