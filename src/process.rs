//! Process supervisor for backend subprocesses.
//!
//! Backends are plain HTTP servers launched as children (llama-server,
//! whisper-server, koko, sd-server, flm, ryzenai-server). The supervisor
//! owns spawn, liveness, and teardown; it never interprets their protocol.
//!
//! Teardown is deliberately slow: after the child exits we wait two extra
//! seconds because Vulkan/ROCm drivers release device contexts after
//! process death, and a rapid reload deadlocks inside the driver otherwise.

use crate::error::{GatewayError, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long `stop` waits for a graceful exit before force-killing.
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Post-termination grace period for GPU driver context teardown.
const GPU_DRIVER_GRACE: Duration = Duration::from_secs(2);

/// Log lines dropped by the health-filter reader: health-probe request
/// spam and the FLM interactive banner.
fn is_health_noise(line: &str) -> bool {
    line.contains("GET /health")
        || line.contains("GET /v1/health")
        || line.contains("Enter 'exit' to stop the server")
}

/// Observer invoked with every output line of a supervised child (e.g.
/// llama-server's timing statistics).
pub type LineObserver = std::sync::Arc<dyn Fn(&str) + Send + Sync>;

/// Options for [`start`].
#[derive(Default)]
pub struct SpawnOptions {
    /// Working directory for the child (inherited when `None`).
    pub cwd: Option<std::path::PathBuf>,
    /// Let the child write to the gateway's stdout/stderr.
    pub inherit_output: bool,
    /// Pipe output through a reader that drops health-check noise.
    /// Only meaningful together with `inherit_output`.
    pub filter_health_logs: bool,
    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
    /// Sees every output line regardless of filtering. Setting this
    /// forces the output to be piped.
    pub line_observer: Option<LineObserver>,
}

/// A supervised backend subprocess.
#[derive(Debug)]
pub struct ChildProcess {
    child: Option<Child>,
    pid: Option<u32>,
    executable: String,
}

impl ChildProcess {
    /// Child PID, if the process was spawned successfully.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the child is still running.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Exit code if the child has terminated, `None` while running.
    pub fn exit_code(&mut self) -> Option<i32> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        }
    }

    /// Wait up to `timeout` for the child to exit; returns the exit code,
    /// or `None` on timeout.
    pub async fn wait(&mut self, timeout: Duration) -> Option<i32> {
        let child = self.child.as_mut()?;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            _ => None,
        }
    }

    /// Terminate the child: graceful signal, up to 5 s of polling, then a
    /// force-kill, then the GPU-driver grace sleep. Safe to call twice.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if matches!(child.try_wait(), Ok(Some(_))) {
            debug!("backend process already exited");
            return;
        }

        terminate_gracefully(&child);

        let mut exited = false;
        let deadline = tokio::time::Instant::now() + GRACEFUL_EXIT_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                exited = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if !exited {
            warn!(
                executable = %self.executable,
                "process did not respond to graceful terminate, killing"
            );
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        // GPU drivers (Vulkan/ROCm) release device contexts after the
        // process exits. Reloading before that completes hangs the next
        // backend inside the driver.
        info!("process terminated, waiting for GPU driver cleanup");
        tokio::time::sleep(GPU_DRIVER_GRACE).await;
    }
}

#[cfg(unix)]
fn terminate_gracefully(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain signal send to a PID we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(child: &Child) {
    // Windows has no SIGTERM equivalent for console-less children; the
    // force-kill path below handles termination.
    let _ = child.id();
}

/// Spawn a backend subprocess.
///
/// With `filter_health_logs`, stdout and stderr are piped through reader
/// tasks that drop health-probe noise before re-emitting lines; otherwise
/// output is inherited (when requested) or discarded.
///
/// # Errors
///
/// Returns [`GatewayError::Process`] when the executable cannot be spawned.
pub fn start(executable: &str, args: &[String], opts: SpawnOptions) -> Result<ChildProcess> {
    let mut command = Command::new(executable);
    command.args(args);
    command.kill_on_drop(true);

    if let Some(dir) = &opts.cwd {
        command.current_dir(dir);
    }
    for (key, value) in &opts.env {
        command.env(key, value);
    }

    let filter = opts.inherit_output && opts.filter_health_logs;
    let piped = filter || opts.line_observer.is_some();
    if piped {
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
    } else if opts.inherit_output {
        command.stdout(Stdio::inherit());
        command.stderr(Stdio::inherit());
    } else {
        command.stdout(Stdio::null());
        command.stderr(Stdio::null());
    }

    #[cfg(windows)]
    {
        // Backend servers must not pop console windows.
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        if !(opts.inherit_output && !opts.filter_health_logs) {
            command.creation_flags(CREATE_NO_WINDOW);
        }
    }

    info!(executable, ?args, "starting process");

    let mut child = command.spawn().map_err(|e| {
        GatewayError::Process(format!("failed to start process '{executable}': {e}"))
    })?;

    if piped {
        // Piped children echo to the gateway's streams only when output
        // inheritance was requested; the observer sees every line either
        // way.
        let echo = opts.inherit_output;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_piped_stream(
                stdout,
                false,
                echo,
                opts.line_observer.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_piped_stream(stderr, true, echo, opts.line_observer));
        }
    }

    let pid = child.id();
    info!(?pid, "process started");

    Ok(ChildProcess {
        child: Some(child),
        pid,
        executable: executable.to_owned(),
    })
}

async fn pump_piped_stream<R>(
    mut reader: R,
    to_stderr: bool,
    echo: bool,
    observer: Option<LineObserver>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::default();
    let mut buf = [0u8; 4096];
    let handle = |line: &str| {
        if let Some(observer) = &observer {
            observer(line);
        }
        if echo {
            emit_filtered(line, to_stderr);
        }
    };
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    handle(&line);
                }
            }
        }
    }
    if let Some(line) = splitter.flush() {
        handle(&line);
    }
}

fn emit_filtered(line: &str, to_stderr: bool) {
    if is_health_noise(line) {
        return;
    }
    if to_stderr {
        eprintln!("{line}");
    } else {
        println!("{line}");
    }
}

/// Run a process to completion, invoking `on_line` for every output line.
///
/// Lines are split on both `\n` and `\r` so in-place progress updates (the
/// `flm pull` download bar rewrites its line with carriage returns) arrive
/// one by one. The callback returning `false` kills the child and the call
/// reports exit code −1; so does exceeding `timeout`.
///
/// # Errors
///
/// Returns [`GatewayError::Process`] when the executable cannot be spawned.
pub async fn run_with_output<F>(
    executable: &str,
    args: &[String],
    cwd: Option<&Path>,
    mut on_line: F,
    timeout: Option<Duration>,
) -> Result<i32>
where
    F: FnMut(&str) -> bool + Send,
{
    let mut command = Command::new(executable);
    command.args(args);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    let mut child = command.spawn().map_err(|e| {
        GatewayError::Process(format!("failed to start process '{executable}': {e}"))
    })?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_lines(stderr, tx.clone()));
    }
    drop(tx);

    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    let mut killed = false;

    loop {
        let next = match deadline {
            Some(d) => match tokio::time::timeout_at(d, rx.recv()).await {
                Ok(line) => line,
                Err(_) => {
                    warn!(executable, "run_with_output timed out, killing child");
                    let _ = child.start_kill();
                    killed = true;
                    break;
                }
            },
            None => rx.recv().await,
        };
        let Some(line) = next else {
            break;
        };
        if line.is_empty() {
            continue;
        }
        if !on_line(&line) {
            let _ = child.start_kill();
            killed = true;
            break;
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| GatewayError::Process(format!("failed to wait for '{executable}': {e}")))?;

    if killed {
        return Ok(-1);
    }
    Ok(status.code().unwrap_or(-1))
}

async fn pump_lines<R>(mut reader: R, tx: tokio::sync::mpsc::UnboundedSender<String>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::default();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
            }
        }
    }
    if let Some(line) = splitter.flush() {
        let _ = tx.send(line);
    }
}

/// Probe a contiguous range of 1000 ports starting at `start_port` and
/// return the first that binds on loopback.
///
/// # Errors
///
/// Returns [`GatewayError::Process`] when no port in the range is free.
pub fn find_free_port(start_port: u16) -> Result<u16> {
    for offset in 0..1000u32 {
        let port = match u16::try_from(u32::from(start_port) + offset) {
            Ok(p) => p,
            Err(_) => break,
        };
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(GatewayError::Process(format!(
        "no free port found in range {start_port}..{}",
        u32::from(start_port) + 1000
    )))
}

/// Splits a byte stream into lines on `\n` and `\r`, treating `\r\n` as a
/// single delimiter.
#[derive(Debug, Default)]
struct LineSplitter {
    buffer: Vec<u8>,
    pending_cr: bool,
}

impl LineSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            match b {
                b'\n' => {
                    if self.pending_cr {
                        // \r\n pair: the \r already flushed the line.
                        self.pending_cr = false;
                    } else {
                        lines.push(self.take_line());
                    }
                }
                b'\r' => {
                    lines.push(self.take_line());
                    self.pending_cr = true;
                }
                _ => {
                    self.pending_cr = false;
                    self.buffer.push(b);
                }
            }
        }
        lines
    }

    fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitter_handles_newlines() {
        let mut s = LineSplitter::default();
        let lines = s.push(b"one\ntwo\n");
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn splitter_handles_carriage_returns() {
        let mut s = LineSplitter::default();
        let lines = s.push(b"progress 10%\rprogress 20%\rdone\n");
        assert_eq!(lines, vec!["progress 10%", "progress 20%", "done"]);
    }

    #[test]
    fn splitter_treats_crlf_as_one_delimiter() {
        let mut s = LineSplitter::default();
        let lines = s.push(b"one\r\ntwo\r\n");
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn splitter_flushes_partial_line() {
        let mut s = LineSplitter::default();
        assert!(s.push(b"partial").is_empty());
        assert_eq!(s.flush().as_deref(), Some("partial"));
        assert!(s.flush().is_none());
    }

    #[test]
    fn splitter_line_split_across_chunks() {
        let mut s = LineSplitter::default();
        assert!(s.push(b"hel").is_empty());
        let lines = s.push(b"lo\n");
        assert_eq!(lines, vec!["hello"]);
    }

    #[test]
    fn health_noise_matcher() {
        assert!(is_health_noise("127.0.0.1 GET /health 200"));
        assert!(is_health_noise("GET /v1/health"));
        assert!(is_health_noise("Enter 'exit' to stop the server"));
        assert!(!is_health_noise("GET /v1/chat/completions"));
    }

    #[test]
    fn find_free_port_returns_bindable_port() {
        let port = find_free_port(42000).expect("some port in range is free");
        assert!((42000..43000).contains(&port));
        // The port must actually bind.
        std::net::TcpListener::bind(("127.0.0.1", port)).expect("port binds");
    }

    #[tokio::test]
    async fn run_with_output_collects_lines() {
        if cfg!(windows) {
            return;
        }
        let mut lines = Vec::new();
        let code = run_with_output(
            "sh",
            &["-c".into(), "echo one; echo two".into()],
            None,
            |line| {
                lines.push(line.to_owned());
                true
            },
            Some(Duration::from_secs(10)),
        )
        .await
        .expect("sh spawns");
        assert_eq!(code, 0);
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn run_with_output_callback_false_kills() {
        if cfg!(windows) {
            return;
        }
        let code = run_with_output(
            "sh",
            &["-c".into(), "echo first; sleep 30; echo late".into()],
            None,
            |_line| false,
            Some(Duration::from_secs(10)),
        )
        .await
        .expect("sh spawns");
        assert_eq!(code, -1);
    }

    #[tokio::test]
    async fn run_with_output_nonzero_exit() {
        if cfg!(windows) {
            return;
        }
        let code = run_with_output(
            "sh",
            &["-c".into(), "exit 3".into()],
            None,
            |_| true,
            Some(Duration::from_secs(10)),
        )
        .await
        .expect("sh spawns");
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn start_and_stop_roundtrip() {
        if cfg!(windows) {
            return;
        }
        let mut child = start(
            "sh",
            &["-c".into(), "sleep 60".into()],
            SpawnOptions::default(),
        )
        .expect("sh spawns");
        assert!(child.is_running());
        // Pause the clock so the 2 s GPU grace does not slow the test.
        tokio::time::pause();
        child.stop().await;
        assert!(!child.is_running());
        // Idempotent.
        child.stop().await;
    }
}
