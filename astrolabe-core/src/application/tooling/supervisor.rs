use super::error::ToolInvokeError;
use super::protocol::read_line_lossy;
use super::handle::{
    LogSink, ProcessIdentifier, ServerHandle, run_container_command, send_terminate,
};
use crate::config::{ServerConfig, TransportKind};
use crate::constants::{
    DEFAULT_LOG_DIR, SERVER_LOG_LEVEL_ENV, STARTUP_ACK_TIMEOUT, STOP_GRACE_PERIOD,
};
use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot, watch};
use tracing::{debug, info, warn};

/// Verbosity requested from tool servers through `MCP_LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerLogLevel {
    Debug,
    #[default]
    Info,
    Quiet,
}

impl ServerLogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerLogLevel::Debug => "debug",
            ServerLogLevel::Info => "info",
            ServerLogLevel::Quiet => "quiet",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Some(ServerLogLevel::Debug),
            "info" => Some(ServerLogLevel::Info),
            "quiet" | "off" => Some(ServerLogLevel::Quiet),
            _ => None,
        }
    }
}

impl fmt::Display for ServerLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub log_dir: PathBuf,
    pub log_level: ServerLogLevel,
    /// Forward server stderr into our own log instead of per-server files.
    pub interactive_logs: bool,
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            log_level: ServerLogLevel::default(),
            interactive_logs: false,
            startup_timeout: STARTUP_ACK_TIMEOUT,
            stop_grace: STOP_GRACE_PERIOD,
        }
    }
}

impl SupervisorOptions {
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_log_level(mut self, level: ServerLogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_interactive_logs(mut self, enabled: bool) -> Self {
        self.interactive_logs = enabled;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// The child's protocol pipes, handed to a protocol client exactly once.
pub struct StdioTransport {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

impl fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdioTransport").finish_non_exhaustive()
    }
}

struct ManagedServer {
    handle: ServerHandle,
    generation: u64,
    kill: Option<oneshot::Sender<()>>,
    transport: Option<StdioTransport>,
}

type ServerMap = Arc<AsyncMutex<HashMap<String, ManagedServer>>>;

/// Owns the tool-server processes and their handles.
pub struct ToolServerSupervisor {
    options: SupervisorOptions,
    servers: ServerMap,
    generation: AtomicU64,
}

impl Default for ToolServerSupervisor {
    fn default() -> Self {
        Self::new(SupervisorOptions::default())
    }
}

impl ToolServerSupervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        Self {
            options,
            servers: Arc::new(AsyncMutex::new(HashMap::new())),
            generation: AtomicU64::new(1),
        }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// Start a server, or return the handle of one already alive under this id.
    pub async fn start_server(&self, config: &ServerConfig) -> Result<ServerHandle, ToolInvokeError> {
        if let Some(existing) = self.current_handle(&config.id).await {
            if existing.check_alive().await {
                debug!(server = %config.id, "Tool server already running");
                return Ok(existing);
            }
            debug!(server = %config.id, "Discarding stale tool server handle");
            self.forget(&config.id, None).await;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let mut command = self.build_command(config);
        let mut child = command.spawn().map_err(|source| ToolInvokeError::Spawn {
            server: config.id.clone(),
            source,
        })?;

        let (stdin, stdout, stderr) = match take_pipes(&mut child) {
            Some(pipes) => pipes,
            None => {
                let _ = child.start_kill();
                return Err(ToolInvokeError::Transport {
                    server: config.id.clone(),
                    message: "failed to capture server stdio".to_string(),
                });
            }
        };

        let launcher_pid = child.id();
        let process = match config.transport {
            TransportKind::Container => ProcessIdentifier::Container {
                name: config.container_name(),
                runtime: config.command.clone(),
            },
            TransportKind::Stdio | TransportKind::DetachedProcess => {
                ProcessIdentifier::Pid(launcher_pid.unwrap_or_default())
            }
        };

        let (first_output_tx, first_output_rx) = oneshot::channel();
        let log_sink = self.attach_stderr(&config.id, stderr, first_output_tx).await;

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        let handle = ServerHandle {
            id: config.id.clone(),
            transport: config.transport,
            process,
            launcher_pid,
            started_at: Utc::now(),
            log_sink,
            exit: exit_rx,
        };

        {
            let mut servers = self.servers.lock().await;
            servers.insert(
                config.id.clone(),
                ManagedServer {
                    handle: handle.clone(),
                    generation,
                    kill: Some(kill_tx),
                    transport: Some(StdioTransport { stdin, stdout }),
                },
            );
        }

        tokio::spawn(watch_exit(
            Arc::clone(&self.servers),
            config.id.clone(),
            generation,
            child,
            kill_rx,
            exit_tx,
        ));

        match self.await_startup(&handle, first_output_rx).await {
            Ok(()) => {
                info!(
                    server = %config.id,
                    transport = %config.transport,
                    pid = ?launcher_pid,
                    "Tool server started"
                );
                Ok(handle)
            }
            Err(err) => {
                self.forget(&config.id, Some(generation)).await;
                Err(err)
            }
        }
    }

    /// Hand the child's stdio to a protocol client. `None` once taken.
    pub async fn take_transport(&self, id: &str) -> Option<StdioTransport> {
        let mut servers = self.servers.lock().await;
        servers.get_mut(id).and_then(|entry| entry.transport.take())
    }

    /// Stop a server gracefully, then forcefully. Unknown ids are a no-op.
    pub async fn stop_server(&self, id: &str) {
        let removed = {
            let mut servers = self.servers.lock().await;
            servers.remove(id)
        };
        let Some(mut entry) = removed else {
            debug!(server = id, "Stop requested for unknown tool server");
            return;
        };
        // Closing our end of stdin is often enough for stdio servers.
        drop(entry.transport.take());

        let grace = self.options.stop_grace;
        let handle = entry.handle;
        if let ProcessIdentifier::Container { name, runtime } = &handle.process {
            let seconds = grace.as_secs().max(1).to_string();
            if let Err(err) = run_container_command(runtime, &["stop", "-t", &seconds, name]).await {
                debug!(server = id, container = %name, %err, "Container stop failed");
            }
            if let Err(err) = run_container_command(runtime, &["rm", "-f", name]).await {
                debug!(server = id, container = %name, %err, "Container removal failed");
            }
        } else if let Some(pid) = handle.launcher_pid
            && !handle.launcher_exited()
            && !send_terminate(pid)
        {
            debug!(server = id, pid, "SIGTERM not delivered");
        }

        if tokio::time::timeout(grace, handle.wait_exit()).await.is_err() {
            warn!(server = id, "Tool server ignored termination; killing");
            if let Some(kill) = entry.kill.take() {
                let _ = kill.send(());
            }
            if tokio::time::timeout(grace, handle.wait_exit()).await.is_err() {
                warn!(server = id, "Tool server did not exit after kill");
            }
        }
        info!(server = id, status = ?handle.exit_status(), "Tool server stopped");
    }

    /// Stop every tracked server concurrently.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = {
            let servers = self.servers.lock().await;
            servers.keys().cloned().collect()
        };
        join_all(ids.iter().map(|id| self.stop_server(id))).await;
    }

    /// Hint only: the process may die right after this returns.
    pub async fn is_running(&self, id: &str) -> bool {
        match self.current_handle(id).await {
            Some(handle) => handle.check_alive().await,
            None => false,
        }
    }

    pub async fn list_running(&self) -> BTreeSet<String> {
        let servers = self.servers.lock().await;
        servers
            .iter()
            .filter(|(_, entry)| !entry.handle.launcher_exited())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn handle(&self, id: &str) -> Option<ServerHandle> {
        self.current_handle(id).await
    }

    async fn current_handle(&self, id: &str) -> Option<ServerHandle> {
        let servers = self.servers.lock().await;
        servers.get(id).map(|entry| entry.handle.clone())
    }

    async fn forget(&self, id: &str, generation: Option<u64>) {
        let removed = {
            let mut servers = self.servers.lock().await;
            let matches = servers
                .get(id)
                .is_some_and(|entry| generation.is_none_or(|g| entry.generation == g));
            if matches { servers.remove(id) } else { None }
        };
        if let Some(mut entry) = removed
            && let Some(kill) = entry.kill.take()
        {
            let _ = kill.send(());
        }
    }

    fn build_command(&self, config: &ServerConfig) -> Command {
        let mut command = Command::new(&config.command);
        command
            .args(launch_args(config))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env(SERVER_LOG_LEVEL_ENV, self.options.log_level.as_str())
            .envs(&config.env);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }
        match config.transport {
            TransportKind::DetachedProcess => {
                #[cfg(unix)]
                command.process_group(0);
            }
            TransportKind::Stdio | TransportKind::Container => {
                command.kill_on_drop(true);
            }
        }
        command
    }

    async fn attach_stderr(
        &self,
        id: &str,
        stderr: ChildStderr,
        first_output: oneshot::Sender<()>,
    ) -> LogSink {
        if !self.options.interactive_logs {
            let path = self.options.log_dir.join(format!("{id}.log"));
            match open_log_file(&path).await {
                Ok(file) => {
                    tokio::spawn(copy_to_file(id.to_string(), stderr, file, first_output));
                    return LogSink::File(path);
                }
                Err(err) => warn!(
                    server = id,
                    path = %path.display(),
                    %err,
                    "Cannot open server log file; forwarding stderr instead"
                ),
            }
        }
        tokio::spawn(forward_to_tracing(id.to_string(), stderr, first_output));
        LogSink::Pipe
    }

    /// Bounded wait for a sign of life.
    ///
    /// The first stderr byte counts as ready, an exit counts as failure and a
    /// quiet server is assumed healthy once the timeout passes.
    async fn await_startup(
        &self,
        handle: &ServerHandle,
        first_output: oneshot::Receiver<()>,
    ) -> Result<(), ToolInvokeError> {
        let spoke = async {
            if first_output.await.is_err() {
                // stderr closed silently; leave the verdict to the exit branch
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = spoke => Ok(()),
            _ = handle.wait_exit() => Err(ToolInvokeError::ExitedEarly {
                server: handle.id.clone(),
                status: handle.exit_status().unwrap_or_else(|| "unknown".to_string()),
            }),
            _ = tokio::time::sleep(self.options.startup_timeout) => {
                debug!(server = %handle.id, "No startup output; assuming the server is up");
                Ok(())
            }
        }
    }
}

/// Run arguments, with a deterministic `--name` injected for containers.
fn launch_args(config: &ServerConfig) -> Vec<String> {
    let mut args = config.args.clone();
    if config.transport != TransportKind::Container {
        return args;
    }
    let named = args
        .iter()
        .any(|arg| arg == "--name" || arg.starts_with("--name="));
    if !named && let Some(run) = args.iter().position(|arg| arg == "run") {
        args.insert(run + 1, "--name".to_string());
        args.insert(run + 2, config.container_name());
    }
    args
}

fn take_pipes(child: &mut Child) -> Option<(ChildStdin, ChildStdout, ChildStderr)> {
    Some((child.stdin.take()?, child.stdout.take()?, child.stderr.take()?))
}

async fn open_log_file(path: &std::path::Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

async fn copy_to_file<R>(
    id: String,
    mut stream: R,
    file: tokio::fs::File,
    first_output: oneshot::Sender<()>,
) where
    R: AsyncRead + Unpin,
{
    let mut first_output = Some(first_output);
    let mut file = Some(file);
    let mut buf = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(server = %id, %err, "Reading server stderr failed");
                break;
            }
        };
        if let Some(out) = file.as_mut() {
            let written = match out.write_all(&buf[..n]).await {
                Ok(()) => out.flush().await,
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                warn!(server = %id, %err, "Server log file is not writable; discarding further stderr");
                file = None;
            }
        }
        if let Some(tx) = first_output.take() {
            let _ = tx.send(());
        }
    }
}

async fn forward_to_tracing<R>(id: String, stream: R, first_output: oneshot::Sender<()>)
where
    R: AsyncRead + Unpin,
{
    let mut first_output = Some(first_output);
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        let line = match read_line_lossy(&mut reader, &mut buf).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                debug!(server = %id, %err, "Reading server stderr failed");
                break;
            }
        };
        if let Some(tx) = first_output.take() {
            let _ = tx.send(());
        }
        let line = line.trim_end();
        if !line.trim().is_empty() {
            info!(server = %id, "{line}");
        }
    }
}

async fn watch_exit(
    servers: ServerMap,
    id: String,
    generation: u64,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit: watch::Sender<Option<String>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let status = match status {
        Ok(status) => status.to_string(),
        Err(err) => format!("wait failed: {err}"),
    };
    exit.send_replace(Some(status.clone()));

    let mut servers = servers.lock().await;
    if servers
        .get(&id)
        .is_some_and(|entry| entry.generation == generation)
    {
        servers.remove(&id);
        info!(server = %id, %status, "Tool server exited");
    } else {
        debug!(server = %id, %status, "Tool server process reaped");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn options(log_dir: &std::path::Path) -> SupervisorOptions {
        SupervisorOptions::default()
            .with_log_dir(log_dir)
            .with_startup_timeout(Duration::from_millis(300))
            .with_stop_grace(Duration::from_millis(500))
    }

    fn shell(id: &str, script: &str) -> ServerConfig {
        ServerConfig::new(id, "/bin/sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn starting_twice_returns_the_same_process() {
        let dir = tempdir().expect("tempdir");
        let supervisor = ToolServerSupervisor::new(options(dir.path()));
        let config = shell("sleeper", "sleep 30");

        let first = supervisor.start_server(&config).await.expect("first start");
        let second = supervisor.start_server(&config).await.expect("second start");

        assert_eq!(first.process, second.process);
        assert_eq!(first.started_at, second.started_at);
        assert_eq!(supervisor.list_running().await.len(), 1);
        assert!(supervisor.is_running("sleeper").await);

        supervisor.stop_all().await;
        assert!(!supervisor.is_running("sleeper").await);
        assert!(supervisor.list_running().await.is_empty());
    }

    #[tokio::test]
    async fn early_exit_is_reported() {
        let dir = tempdir().expect("tempdir");
        let supervisor = ToolServerSupervisor::new(options(dir.path()));
        let err = supervisor
            .start_server(&shell("crasher", "exit 3"))
            .await
            .expect_err("exits immediately");
        assert!(matches!(err, ToolInvokeError::ExitedEarly { ref status, .. } if status.contains('3')));
        assert!(!supervisor.is_running("crasher").await);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempdir().expect("tempdir");
        let supervisor = ToolServerSupervisor::new(options(dir.path()));
        let err = supervisor
            .start_server(&ServerConfig::new("ghost", "/nonexistent/astrolabe-server"))
            .await
            .expect_err("no such binary");
        assert!(matches!(err, ToolInvokeError::Spawn { .. }));
    }

    #[tokio::test]
    async fn stderr_lands_in_the_log_file_with_log_level() {
        let dir = tempdir().expect("tempdir");
        let supervisor = ToolServerSupervisor::new(
            options(dir.path()).with_log_level(ServerLogLevel::Debug),
        );
        let handle = supervisor
            .start_server(&shell("chatty", "echo \"level=$MCP_LOG_LEVEL\" >&2; sleep 30"))
            .await
            .expect("start");

        let path = dir.path().join("chatty.log");
        assert_eq!(handle.log_sink, LogSink::File(path.clone()));
        supervisor.stop_server("chatty").await;

        let logged = std::fs::read_to_string(path).expect("log file");
        assert!(logged.contains("level=debug"));
    }

    #[tokio::test]
    async fn stop_kills_processes_that_ignore_sigterm() {
        let dir = tempdir().expect("tempdir");
        let supervisor = ToolServerSupervisor::new(options(dir.path()));
        let handle = supervisor
            .start_server(&shell("stubborn", "trap '' TERM; echo up >&2; while true; do sleep 1; done"))
            .await
            .expect("start");

        supervisor.stop_server("stubborn").await;
        assert!(handle.exit_status().is_some());
        assert!(!handle.check_alive().await);
    }

    #[tokio::test]
    async fn stopping_unknown_id_is_a_no_op() {
        let supervisor = ToolServerSupervisor::default();
        supervisor.stop_server("nobody").await;
        assert!(supervisor.list_running().await.is_empty());
    }

    #[tokio::test]
    async fn transport_is_handed_out_once() {
        let dir = tempdir().expect("tempdir");
        let supervisor = ToolServerSupervisor::new(options(dir.path()));
        supervisor
            .start_server(&shell("cat", "cat"))
            .await
            .expect("start");
        assert!(supervisor.take_transport("cat").await.is_some());
        assert!(supervisor.take_transport("cat").await.is_none());
        supervisor.stop_all().await;
    }

    #[test]
    fn container_launch_gets_a_stable_name() {
        let config = ServerConfig::new("git", "docker")
            .with_args(["run", "-i", "--rm", "mcp/git"])
            .with_transport(TransportKind::Container);
        assert_eq!(
            launch_args(&config),
            vec!["run", "--name", "astrolabe-git", "-i", "--rm", "mcp/git"]
        );

        let named = config.clone().with_args(["run", "--name", "mine", "img"]);
        assert_eq!(launch_args(&named), vec!["run", "--name", "mine", "img"]);
    }

    #[test]
    fn log_levels_parse_case_insensitively() {
        assert_eq!(ServerLogLevel::parse("DEBUG"), Some(ServerLogLevel::Debug));
        assert_eq!(ServerLogLevel::parse("off"), Some(ServerLogLevel::Quiet));
        assert_eq!(ServerLogLevel::parse("loud"), None);
    }

    /// Pushes far more than the pipe buffer through `server`, then hangs up.
    async fn flood(mut server: tokio::io::DuplexStream) {
        let filler = format!("{}\n", "x".repeat(63));
        for _ in 0..200 {
            server
                .write_all(filler.as_bytes())
                .await
                .expect("stderr is still being drained");
        }
    }

    #[tokio::test]
    async fn forwarded_stderr_survives_invalid_utf8() {
        let (mut server, ours) = tokio::io::duplex(64);
        let (tx, rx) = oneshot::channel();
        let drain = tokio::spawn(forward_to_tracing("noisy".into(), ours, tx));

        server.write_all(b"log \xff\xfe caf\xe9\n").await.expect("write");
        rx.await.expect("first output acknowledged");
        tokio::time::timeout(Duration::from_secs(5), flood(server))
            .await
            .expect("flood finishes");
        tokio::time::timeout(Duration::from_secs(5), drain)
            .await
            .expect("drain ends at EOF")
            .expect("join");
    }

    #[tokio::test]
    async fn unwritable_log_file_keeps_stderr_drained() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("readonly.log");
        std::fs::write(&path, b"").expect("create log");
        let file = tokio::fs::File::open(&path).await.expect("open read-only");

        let (server, ours) = tokio::io::duplex(64);
        let (tx, rx) = oneshot::channel();
        let drain = tokio::spawn(copy_to_file("readonly".into(), ours, file, tx));

        tokio::time::timeout(Duration::from_secs(5), flood(server))
            .await
            .expect("flood finishes");
        rx.await.expect("first output acknowledged");
        tokio::time::timeout(Duration::from_secs(5), drain)
            .await
            .expect("drain ends at EOF")
            .expect("join");
        assert!(std::fs::read(&path).expect("read log").is_empty());
    }
}
