use crate::config::TransportKind;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::debug;

/// What the supervisor tracks a running server by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessIdentifier {
    Pid(u32),
    Container { name: String, runtime: PathBuf },
}

/// Where a server's stderr ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    File(PathBuf),
    /// Forwarded line by line into the orchestrator's own log.
    Pipe,
}

/// One running tool-server process. Cheap to clone; owned by the supervisor.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    pub id: String,
    pub transport: TransportKind,
    pub process: ProcessIdentifier,
    /// PID of the process we spawned; for containers this is the runtime CLI.
    pub launcher_pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub log_sink: LogSink,
    pub(crate) exit: watch::Receiver<Option<String>>,
}

impl ServerHandle {
    /// Exit status description once the spawned process has been reaped.
    pub fn exit_status(&self) -> Option<String> {
        self.exit.borrow().clone()
    }

    pub(crate) fn launcher_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Best-effort liveness probe; a hint, not a guarantee.
    pub async fn check_alive(&self) -> bool {
        match &self.process {
            ProcessIdentifier::Pid(pid) => !self.launcher_exited() && pid_is_alive(*pid),
            ProcessIdentifier::Container { name, runtime } => {
                match container_is_running(runtime, name).await {
                    Some(true) => true,
                    // The launcher stays up while the runtime pulls the image
                    // and after the container is created, so it covers both the
                    // startup window and a runtime that cannot be queried.
                    Some(false) | None => !self.launcher_exited(),
                }
            }
        }
    }

    /// Resolves once the spawned process has exited.
    pub(crate) async fn wait_exit(&self) {
        let mut exit = self.exit.clone();
        let _ = exit.wait_for(|status| status.is_some()).await;
    }
}

/// Zero-effect existence probe against the process table. Zombies count as dead.
pub(crate) fn pid_is_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|process| process.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}

/// Sends SIGTERM. Returns `false` when the signal could not be delivered.
pub(crate) fn send_terminate(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .and_then(|process| process.kill_with(Signal::Term))
        .unwrap_or(false)
}

/// `Some(running)` when the runtime answered, `None` when it could not be asked.
pub(crate) async fn container_is_running(runtime: &Path, name: &str) -> Option<bool> {
    let output = Command::new(runtime)
        .args(["ps", "--filter"])
        .arg(format!("name=^{name}$"))
        .args(["--format", "{{.ID}}"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => {
            Some(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
        }
        Ok(output) => {
            debug!(container = name, status = %output.status, "Container runtime query failed");
            None
        }
        Err(err) => {
            debug!(container = name, %err, "Container runtime not available");
            None
        }
    }
}

/// Runs `<runtime> <args...>`; `Err` carries stderr or the spawn error.
pub(crate) async fn run_container_command(runtime: &Path, args: &[&str]) -> Result<(), String> {
    let output = Command::new(runtime)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|err| err.to_string())?;
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}
