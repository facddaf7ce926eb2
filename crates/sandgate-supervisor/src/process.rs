//! Launching and terminating the backend process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use sandgate_core::BackendConfig;

/// A running backend instance.
#[async_trait]
pub trait ComputeProcess: Send + 'static {
    /// OS process id, if known.
    fn id(&self) -> Option<u32>;

    /// `Some(description)` once the process has exited. Never blocks.
    fn try_exited(&mut self) -> Option<String>;

    /// Stop the process and wait for it to go away.
    async fn terminate(&mut self);
}

/// Starts backend processes.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    async fn launch(&self) -> std::io::Result<Box<dyn ComputeProcess>>;
}

/// Launches the configured command as a child process.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        let mut parts = config.command.iter().cloned();
        let program = parts.next().unwrap_or_default();
        Self {
            program,
            args: parts.collect(),
            env: config.env.clone(),
            working_dir: config.working_dir.clone(),
        }
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self) -> std::io::Result<Box<dyn ComputeProcess>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn()?;
        info!(program = %self.program, pid = child.id(), "backend process spawned");
        Ok(Box::new(ChildProcess { child }))
    }
}

/// How long `terminate` waits for the child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl ComputeProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exited(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("wait failed: {e}")),
        }
    }

    async fn terminate(&mut self) {
        let pid = self.child.id();
        if let Err(e) = self.child.start_kill() {
            debug!(?pid, error = %e, "kill failed, process likely gone");
        }
        match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => debug!(?pid, %status, "backend process reaped"),
            Ok(Err(e)) => warn!(?pid, error = %e, "failed to reap backend process"),
            Err(_) => warn!(?pid, "backend process did not exit after kill"),
        }
    }
}
