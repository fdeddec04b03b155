//! Task executors.
//!
//! Executors never return errors: every failure (spawn, timeout, non-zero
//! exit, unknown type) becomes an `error` [`Outcome`] so it is reported back
//! to the server like any other result.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use taskd_common::{DispatchedTask, Outcome, TaskKind};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::shell::shell_command;

pub const DEFAULT_EXCERPT_LIMIT: usize = 400;

/// Bytes kept per output stream; the rest is read and discarded.
const CAPTURE_LIMIT: usize = 64 * 1024;

/// How long output readers may run after the process exited. Background
/// jobs can keep the pipes open indefinitely.
const OUTPUT_GRACE: Duration = Duration::from_millis(250);

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &DispatchedTask) -> Outcome;
}

/// Where message tasks are shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSurface {
    /// Structured log line plus a plain stderr line.
    Log,
    /// External notifier (e.g. `notify-send`); the payload is appended as
    /// the last argument.
    Command { program: String, args: Vec<String> },
}

pub struct MessageExecutor {
    surface: MessageSurface,
    timeout: Duration,
}

impl MessageExecutor {
    pub fn new(surface: MessageSurface, timeout: Duration) -> Self {
        Self { surface, timeout }
    }
}

#[async_trait]
impl TaskExecutor for MessageExecutor {
    async fn execute(&self, task: &DispatchedTask) -> Outcome {
        match &self.surface {
            MessageSurface::Log => {
                info!(task_id = %task.id, title = %task.title, "{}", task.payload);
                eprintln!("[taskd] {}: {}", task.title, task.payload);
                Outcome::success("message shown")
            }
            MessageSurface::Command { program, args } => {
                let mut command = Command::new(program);
                command
                    .args(args)
                    .arg(&task.payload)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true);

                let child = match command.spawn() {
                    Ok(child) => child,
                    Err(err) => return Outcome::error(format!("failed to start {program}: {err}")),
                };

                match run_to_exit(child, self.timeout).await {
                    Finished::TimedOut => Outcome::error(format!(
                        "{program} timed out after {}s",
                        self.timeout.as_secs()
                    )),
                    Finished::Failed(err) => Outcome::error(format!("{program} failed: {err}")),
                    Finished::Exited { status, .. } if status.success() => {
                        Outcome::success("message shown")
                    }
                    Finished::Exited { status, stderr, .. } => {
                        let stderr = make_excerpt(&decode(&stderr), DEFAULT_EXCERPT_LIMIT);
                        Outcome::error(with_excerpt(
                            format!("{program} exited with {}", describe_status(&status)),
                            &stderr,
                        ))
                    }
                }
            }
        }
    }
}

/// Runs the payload through the platform shell. Payloads are trusted as
/// given.
///
/// Completion is the shell's exit, not the end of its output: a payload
/// that starts a background job still finishes when the shell does.
pub struct CommandExecutor {
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, task: &DispatchedTask) -> Outcome {
        let mut command = shell_command(&task.payload);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => return Outcome::error(format!("failed to spawn command: {err}")),
        };

        let (status, stdout, stderr) = match run_to_exit(child, self.timeout).await {
            Finished::Exited {
                status,
                stdout,
                stderr,
            } => (status, stdout, stderr),
            Finished::Failed(err) => return Outcome::error(format!("command failed: {err}")),
            Finished::TimedOut => {
                warn!(task_id = %task.id, "command timed out, killed");
                return Outcome::error(format!(
                    "command timed out after {}s",
                    self.timeout.as_secs()
                ));
            }
        };

        let summary = format!("command exited with {}", describe_status(&status));
        if status.success() {
            let stdout = make_excerpt(&decode(&stdout), DEFAULT_EXCERPT_LIMIT);
            Outcome::success(with_excerpt(summary, &stdout))
        } else {
            let stderr = make_excerpt(&decode(&stderr), DEFAULT_EXCERPT_LIMIT);
            Outcome::error(with_excerpt(summary, &stderr))
        }
    }
}

enum Finished {
    Exited {
        status: ExitStatus,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    TimedOut,
    Failed(std::io::Error),
}

/// Waits for the process itself under `timeout` while its pipes are drained
/// on separate tasks.
async fn run_to_exit(mut child: Child, timeout: Duration) -> Finished {
    let stdout = Capture::spawn(child.stdout.take());
    let stderr = Capture::spawn(child.stderr.take());

    let status = match time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => return Finished::Failed(err),
        Err(_) => {
            if let Err(err) = child.kill().await {
                warn!("failed to kill timed out process: {err}");
            }
            return Finished::TimedOut;
        }
    };

    Finished::Exited {
        status,
        stdout: stdout.finish(OUTPUT_GRACE).await,
        stderr: stderr.finish(OUTPUT_GRACE).await,
    }
}

/// Output of one pipe, collected up to [`CAPTURE_LIMIT`] bytes.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl Capture {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let reader = pipe.map(|pipe| tokio::spawn(drain(pipe, Arc::clone(&buf))));
        Self { buf, reader }
    }

    /// Gives the reader `grace` to reach EOF, then stops it and returns what
    /// was read so far.
    async fn finish(mut self, grace: Duration) -> Vec<u8> {
        if let Some(reader) = self.reader.as_mut() {
            if time::timeout(grace, &mut *reader).await.is_err() {
                reader.abort();
            }
        }
        self.buf
            .lock()
            .map(|mut kept| std::mem::take(&mut *kept))
            .unwrap_or_default()
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(mut pipe: R, buf: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                if let Ok(mut kept) = buf.lock() {
                    let room = CAPTURE_LIMIT.saturating_sub(kept.len());
                    kept.extend_from_slice(&chunk[..read.min(room)]);
                }
            }
        }
    }
}

/// One executor per [`TaskKind`].
pub struct ExecutorSet {
    message: Box<dyn TaskExecutor>,
    command: Box<dyn TaskExecutor>,
}

impl ExecutorSet {
    pub fn new(message: impl TaskExecutor + 'static, command: impl TaskExecutor + 'static) -> Self {
        Self {
            message: Box::new(message),
            command: Box::new(command),
        }
    }

    pub fn executor_for(&self, kind: TaskKind) -> &dyn TaskExecutor {
        match kind {
            TaskKind::Message => self.message.as_ref(),
            TaskKind::Command => self.command.as_ref(),
        }
    }

    /// Total over any wire type: unknown types yield an error outcome.
    pub async fn execute(&self, task: &DispatchedTask) -> Outcome {
        match task.kind.parse::<TaskKind>() {
            Ok(kind) => self.executor_for(kind).execute(task).await,
            Err(err) => Outcome::error(err.to_string()),
        }
    }
}

fn describe_status(status: &std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("status {code}"),
        None => "no status (terminated by signal)".to_string(),
    }
}

fn with_excerpt(summary: String, excerpt: &str) -> String {
    if excerpt.is_empty() {
        summary
    } else {
        format!("{summary}: {excerpt}")
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn make_excerpt(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= limit {
        return trimmed.to_string();
    }
    format!("{}… [excerpt]", truncate(trimmed, limit))
}

fn truncate(input: &str, max: usize) -> &str {
    if input.len() <= max {
        return input;
    }
    let mut end = max;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskd_common::{TaskId, TerminalStatus};

    fn task(kind: &str, payload: &str) -> DispatchedTask {
        DispatchedTask {
            id: TaskId(42),
            title: "test".into(),
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    fn executors() -> ExecutorSet {
        ExecutorSet::new(
            MessageExecutor::new(MessageSurface::Log, Duration::from_secs(5)),
            CommandExecutor::new(Duration::from_secs(5)),
        )
    }

    #[tokio::test]
    async fn message_is_shown_on_log_surface() {
        let outcome = executors().execute(&task("message", "Backup done")).await;
        assert_eq!(outcome, Outcome::success("message shown"));
    }

    #[tokio::test]
    async fn unknown_type_is_an_error_outcome() {
        let outcome = executors().execute(&task("reboot", "now")).await;
        assert_eq!(outcome.status, TerminalStatus::Error);
        assert_eq!(outcome.message, "unsupported type: reboot");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_success_reports_stdout() {
        let outcome = executors().execute(&task("command", "echo hello")).await;
        assert_eq!(
            outcome,
            Outcome::success("command exited with status 0: hello")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_failure_reports_status_and_stderr() {
        let outcome = executors().execute(&task("command", "false")).await;
        assert_eq!(outcome, Outcome::error("command exited with status 1"));

        let outcome = executors()
            .execute(&task("command", "echo broken >&2; exit 3"))
            .await;
        assert_eq!(outcome, Outcome::error("command exited with status 3: broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_timeout_kills_child() {
        let set = ExecutorSet::new(
            MessageExecutor::new(MessageSurface::Log, Duration::from_secs(5)),
            CommandExecutor::new(Duration::from_millis(200)),
        );
        let started = std::time::Instant::now();
        let outcome = set.execute(&task("command", "sleep 30")).await;
        assert_eq!(outcome.status, TerminalStatus::Error);
        assert!(outcome.message.contains("timed out"), "{}", outcome.message);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn background_job_does_not_hold_the_command_open() {
        let set = ExecutorSet::new(
            MessageExecutor::new(MessageSurface::Log, Duration::from_secs(5)),
            CommandExecutor::new(Duration::from_secs(10)),
        );
        let started = std::time::Instant::now();
        let outcome = set
            .execute(&task("command", "sleep 20 & echo started"))
            .await;
        assert_eq!(
            outcome,
            Outcome::success("command exited with status 0: started")
        );
        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn large_output_is_capped_not_blocking() {
        let outcome = executors()
            .execute(&task("command", "head -c 200000 /dev/zero | tr '\\0' x; echo"))
            .await;
        assert!(outcome.is_success(), "{outcome:?}");
        assert!(outcome.message.ends_with("… [excerpt]"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn notifier_surface_appends_payload() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("shown.txt");
        let surface = MessageSurface::Command {
            program: "sh".into(),
            args: vec![
                "-c".into(),
                format!("printf '%s' \"$1\" > {}", out.display()),
                "notifier".into(),
            ],
        };
        let executor = MessageExecutor::new(surface, Duration::from_secs(5));
        let outcome = executor.execute(&task("message", "Meeting at 10")).await;
        assert_eq!(outcome, Outcome::success("message shown"));
        assert_eq!(std::fs::read_to_string(out).unwrap(), "Meeting at 10");

        let missing = MessageExecutor::new(
            MessageSurface::Command {
                program: "/nonexistent/notifier".into(),
                args: Vec::new(),
            },
            Duration::from_secs(5),
        );
        let outcome = missing.execute(&task("message", "hi")).await;
        assert_eq!(outcome.status, TerminalStatus::Error);
    }

    #[test]
    fn excerpts_are_trimmed_and_bounded() {
        assert_eq!(make_excerpt("  ok \n", 10), "ok");
        assert_eq!(make_excerpt("abcdefghij", 4), "abcd… [excerpt]");
        assert_eq!(truncate("héllo", 2), "h");
    }
}
