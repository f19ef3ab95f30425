//! Supervised execution of external tools.
//!
//! Every tool invocation runs with a bounded wait: when the deadline passes
//! the child is killed and reaped and the call fails with
//! [`Error::ToolTimeout`]. Output pipes are drained on helper threads that
//! forward complete lines (split on `\n` and `\r`, so progress meters come
//! through as separate updates) over a channel to the calling thread.

use std::collections::VecDeque;
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How often the supervisor wakes up to check the deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Number of trailing stderr lines kept for failure messages.
pub const STDERR_TAIL_LINES: usize = 20;

/// Which pipe a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One line of tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// Result of a tool that ran to completion within its deadline.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit status of the process.
    pub status: ExitStatus,
    /// Last lines written to stderr, oldest first.
    pub stderr_tail: Vec<String>,
    /// Wall-clock run time.
    pub elapsed: Duration,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Short description of a failed run for operator-facing messages.
    pub fn failure_summary(&self) -> String {
        let status = match self.status.code() {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };
        match self.stderr_tail.last() {
            Some(line) => format!("{}: {}", status, line),
            None => status,
        }
    }
}

#[derive(Debug, Clone)]
struct ToolArg {
    value: OsString,
    shown: Option<String>,
}

/// An external tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<ToolArg>,
    timeout: Option<Duration>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(ToolArg {
            value: arg.into(),
            shown: None,
        });
        self
    }

    /// Add an argument that must never appear in logs, shown as `shown` instead.
    pub fn secret_arg(mut self, arg: impl Into<OsString>, shown: impl Into<String>) -> Self {
        self.args.push(ToolArg {
            value: arg.into(),
            shown: Some(shown.into()),
        });
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the tool to completion, passing each output line to `on_output`.
    ///
    /// A non-zero exit status is not an error here; callers inspect
    /// [`ToolOutput::success`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tool`] if the process cannot be spawned or waited on,
    /// and [`Error::ToolTimeout`] if it outlives its timeout.
    pub fn run(&self, on_output: &mut dyn FnMut(&OutputLine)) -> Result<ToolOutput> {
        let started = Instant::now();
        let deadline = self.timeout.map(|t| started + t);

        debug!(command = %self, timeout = ?self.timeout, "spawning tool");

        let child = Command::new(&self.program)
            .args(self.args.iter().map(|a| &a.value))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::tool(&self.program, format!("failed to start: {}", e)))?;
        let mut guard = ChildGuard::new(child);

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = guard.child.stdout.take() {
            readers.push(spawn_reader(stdout, Stream::Stdout, tx.clone()));
        }
        if let Some(stderr) = guard.child.stderr.take() {
            readers.push(spawn_reader(stderr, Stream::Stderr, tx.clone()));
        }
        drop(tx);

        let mut stderr_tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

        // Pump output until both pipes close.
        loop {
            match rx.recv_timeout(poll_wait(deadline)) {
                Ok(line) => {
                    if line.stream == Stream::Stderr {
                        if stderr_tail.len() == STDERR_TAIL_LINES {
                            stderr_tail.pop_front();
                        }
                        stderr_tail.push_back(line.text.clone());
                    }
                    on_output(&line);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if is_past(deadline) {
                return Err(self.abort_timed_out(&mut guard));
            }
        }

        let status = loop {
            if let Some(status) = guard.try_wait(&self.program)? {
                break status;
            }
            if is_past(deadline) {
                return Err(self.abort_timed_out(&mut guard));
            }
            thread::sleep(poll_wait(deadline));
        };

        for reader in readers {
            let _ = reader.join();
        }

        let elapsed = started.elapsed();
        debug!(program = %self.program, ?status, ?elapsed, "tool exited");

        Ok(ToolOutput {
            status,
            stderr_tail: stderr_tail.into_iter().collect(),
            elapsed,
        })
    }

    fn abort_timed_out(&self, guard: &mut ChildGuard) -> Error {
        let timeout = self.timeout.unwrap_or_default();
        warn!(program = %self.program, ?timeout, "tool timed out, killing it");
        guard.kill_and_reap();
        Error::tool_timeout(&self.program, timeout)
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            match &arg.shown {
                Some(shown) => write!(f, " {}", shown)?,
                None => write!(f, " {}", arg.value.to_string_lossy())?,
            }
        }
        Ok(())
    }
}

/// Owns a child process and makes sure it never outlives the supervisor.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self {
            child,
            reaped: false,
        }
    }

    fn try_wait(&mut self, program: &str) -> Result<Option<ExitStatus>> {
        let status = self
            .child
            .try_wait()
            .map_err(|e| Error::tool(program, format!("failed to wait: {}", e)))?;
        if status.is_some() {
            self.reaped = true;
        }
        Ok(status)
    }

    fn kill_and_reap(&mut self) {
        if self.reaped {
            return;
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reaped = true;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.kill_and_reap();
    }
}

fn poll_wait(deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => deadline
            .saturating_duration_since(Instant::now())
            .min(POLL_INTERVAL),
        None => POLL_INTERVAL,
    }
}

fn is_past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn spawn_reader<R>(mut reader: R, stream: Stream, tx: Sender<OutputLine>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            for &byte in &buf[..n] {
                if byte == b'\n' || byte == b'\r' {
                    if !emit_line(&mut pending, stream, &tx) {
                        return;
                    }
                } else {
                    pending.push(byte);
                }
            }
        }
        emit_line(&mut pending, stream, &tx);
    })
}

/// Send the buffered line, if any. Returns `false` once the receiver is gone.
fn emit_line(pending: &mut Vec<u8>, stream: Stream, tx: &Sender<OutputLine>) -> bool {
    if pending.is_empty() {
        return true;
    }
    let text = String::from_utf8_lossy(pending).trim_end().to_string();
    pending.clear();
    if text.is_empty() {
        return true;
    }
    tx.send(OutputLine { stream, text }).is_ok()
}

/// Resolve `program` the way a shell would, returning its full path.
///
/// Programs given with a directory component are checked as-is.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let direct = Path::new(program);
    if direct.components().count() > 1 {
        return is_executable(direct).then(|| direct.to_path_buf());
    }

    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .flat_map(|dir| executable_names(program).map(move |name| dir.join(name)))
        .find(|candidate| is_executable(candidate))
}

#[cfg(windows)]
fn executable_names(program: &str) -> impl Iterator<Item = String> {
    [program.to_string(), format!("{}.exe", program)].into_iter()
}

#[cfg(not(windows))]
fn executable_names(program: &str) -> impl Iterator<Item = String> {
    std::iter::once(program.to_string())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
