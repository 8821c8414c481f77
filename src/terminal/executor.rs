use super::protocol::{ServerMessage, Target, TerminalCommand};
use crate::config::HostMode;
use crate::history::HistoryRing;
use crate::metrics::Metrics;
use crate::now_unix;
use crate::stream::{stopped, Outbound};
use axum::extract::ws::Message;
use futures::Sink;
use std::fmt::Display;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

// Сколько ждать закрытия каналов после выхода оболочки.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);
const REAP_GRACE: Duration = Duration::from_millis(500);

type Captured = Arc<Mutex<String>>;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("некорректный запрос: {0}")]
    InvalidRequest(String),
    #[error("не удалось запустить команду: {0}")]
    Spawn(String),
    #[error("команда завершилась с ошибкой: {0}")]
    ExecutionFailure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Starting,
    Running,
    Complete,
    Failed,
}

impl Phase {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

#[derive(Debug)]
struct Job {
    record: TerminalCommand,
    phase: Phase,
}

impl Job {
    fn new(record: TerminalCommand) -> Self {
        Self {
            record,
            phase: Phase::Pending,
        }
    }

    fn advance(&mut self, next: Phase) {
        if self.phase.is_terminal() {
            warn!(command_id = %self.record.id, from = ?self.phase, to = ?next, "повторный переход из завершенного состояния");
            return;
        }
        debug!(command_id = %self.record.id, from = ?self.phase, to = ?next, "переход состояния команды");
        self.phase = next;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub host_mode: HostMode,
    pub helper_image: String,
    pub container_runtime: String,
    pub timeout: Duration,
}

pub struct CommandExecutor {
    settings: ExecutorSettings,
    history: Arc<HistoryRing<TerminalCommand>>,
    metrics: Arc<Metrics>,
}

enum Finish {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    Done,
    Grace,
    Deadline,
    Cancelled,
}

impl CommandExecutor {
    pub fn new(
        settings: ExecutorSettings,
        history: Arc<HistoryRing<TerminalCommand>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            settings,
            history,
            metrics,
        }
    }

    pub fn history(&self) -> &Arc<HistoryRing<TerminalCommand>> {
        &self.history
    }

    pub fn plan(&self, record: &TerminalCommand) -> Result<Invocation, ExecError> {
        if record.command.trim().is_empty() {
            return Err(ExecError::InvalidRequest("пустая команда".to_string()));
        }
        let target = record.target().ok_or_else(|| {
            ExecError::InvalidRequest(format!(
                "неизвестная цель '{}'",
                record.target.as_deref().unwrap_or_default()
            ))
        })?;

        let script = if record.use_sudo {
            format!("sudo {}", record.command)
        } else {
            record.command.clone()
        };

        let invocation = match target {
            Target::Host => match self.settings.host_mode {
                HostMode::Helper => Invocation {
                    program: self.settings.container_runtime.clone(),
                    args: vec![
                        "run".to_string(),
                        "--rm".to_string(),
                        "--privileged".to_string(),
                        "-v".to_string(),
                        "/:/host".to_string(),
                        self.settings.helper_image.clone(),
                        "chroot".to_string(),
                        "/host".to_string(),
                        "sh".to_string(),
                        "-c".to_string(),
                        script,
                    ],
                },
                HostMode::Direct => Invocation {
                    program: "sh".to_string(),
                    args: vec!["-c".to_string(), script],
                },
            },
            Target::Container => {
                let name = record.container_name().ok_or_else(|| {
                    ExecError::InvalidRequest(
                        "для цели container требуется имя контейнера".to_string(),
                    )
                })?;
                Invocation {
                    program: self.settings.container_runtime.clone(),
                    args: vec![
                        "exec".to_string(),
                        name.to_string(),
                        "sh".to_string(),
                        "-c".to_string(),
                        script,
                    ],
                }
            }
        };
        Ok(invocation)
    }

    pub async fn execute<S>(
        &self,
        request: TerminalCommand,
        outbound: &Outbound<S>,
        mut cancel: watch::Receiver<bool>,
    ) -> ServerMessage
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display,
    {
        let mut job = Job::new(request);
        let target = job.record.target().map(Target::as_str).unwrap_or("unknown");

        job.advance(Phase::Starting);
        let invocation = match self.plan(&job.record) {
            Ok(inv) => inv,
            Err(err) => return self.reject(job, target, err),
        };

        let mut child = match spawn(&invocation) {
            Ok(child) => child,
            Err(err) => return self.reject(job, target, err),
        };
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            terminate(&mut child);
            let _ = child.wait().await;
            return self.reject(job, target, ExecError::Spawn("каналы вывода не созданы".to_string()));
        };

        job.advance(Phase::Running);
        info!(command_id = %job.record.id, cmd_target = target, program = %invocation.program, "команда запущена");

        // id() пропадает после reap, а группа может пережить лидера
        let pid = child.id();
        let deadline = Instant::now() + self.settings.timeout;
        let stdout_buf = Captured::default();
        let stderr_buf = Captured::default();

        let mut stdout_task = tokio::spawn(stream_stdout(
            stdout,
            stdout_buf.clone(),
            outbound.clone(),
            job.record.id.clone(),
            job.record.command.clone(),
        ));
        let mut stderr_task = tokio::spawn(collect_lines(stderr, stderr_buf.clone()));

        let mut finish = self.wait(&mut child, deadline, &mut cancel).await;

        let child_exited = matches!(finish, Finish::Exited(_) | Finish::WaitFailed(_));
        let drained = drain_output(
            async {
                let _ = (&mut stdout_task).await;
                let _ = (&mut stderr_task).await;
            },
            child_exited,
            deadline,
            &mut cancel,
        )
        .await;

        if drained != Drain::Done {
            if let Some(pid) = pid {
                kill_group(pid);
            }
            let reaped = tokio::time::timeout(REAP_GRACE, async {
                let _ = (&mut stdout_task).await;
                let _ = (&mut stderr_task).await;
            })
            .await;
            if reaped.is_err() {
                warn!(command_id = %job.record.id, "каналы вывода не закрылись, чтение прервано");
                stdout_task.abort();
                stderr_task.abort();
            }
            match drained {
                Drain::Deadline => finish = Finish::TimedOut,
                Drain::Cancelled => finish = Finish::Cancelled,
                _ => debug!(command_id = %job.record.id, "фоновые процессы команды остановлены"),
            }
        }

        job.record.output = std::mem::take(&mut *stdout_buf.lock().await);
        job.record.error = std::mem::take(&mut *stderr_buf.lock().await);
        job.record.time = now_unix();

        let failure = match finish {
            Finish::Exited(status) if status.success() => {
                job.record.status = 0;
                None
            }
            Finish::Exited(status) => {
                job.record.status = status.code().unwrap_or(1);
                Some(format!("{status}"))
            }
            Finish::WaitFailed(err) => {
                job.record.status = 1;
                Some(err.to_string())
            }
            Finish::TimedOut => {
                job.record.status = 1;
                Some(format!(
                    "превышено время выполнения {}",
                    humantime::format_duration(self.settings.timeout)
                ))
            }
            Finish::Cancelled => {
                job.record.status = 1;
                Some("соединение закрыто, процесс остановлен".to_string())
            }
        };

        let outcome = match failure {
            None => {
                job.advance(Phase::Complete);
                "complete"
            }
            Some(reason) => {
                if job.record.error.is_empty() {
                    job.record.error = ExecError::ExecutionFailure(reason).to_string();
                }
                job.advance(Phase::Failed);
                "failed"
            }
        };

        let len = self.history.append(job.record.clone()).await;
        self.metrics.set_command_history_len(len);
        self.metrics.inc_command(target, outcome);
        info!(command_id = %job.record.id, status = job.record.status, outcome, "команда завершена");

        ServerMessage::Result {
            command: job.record,
        }
    }

    async fn wait(
        &self,
        child: &mut Child,
        deadline: Instant,
        cancel: &mut watch::Receiver<bool>,
    ) -> Finish {
        let finish = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => return Finish::Exited(status),
                Err(err) => return Finish::WaitFailed(err),
            },
            _ = sleep_until(deadline) => Finish::TimedOut,
            _ = stopped(cancel) => Finish::Cancelled,
        };

        terminate(child);
        if let Err(err) = child.wait().await {
            warn!(error = %err, "не удалось дождаться остановленного процесса");
        }
        finish
    }

    fn reject(&self, mut job: Job, target: &str, err: ExecError) -> ServerMessage {
        warn!(command_id = %job.record.id, error = %err, "команда отклонена");
        job.record.error = err.to_string();
        job.record.status = 1;
        job.record.time = now_unix();
        job.advance(Phase::Failed);
        self.metrics.inc_command(target, "rejected");
        ServerMessage::Error {
            command: job.record,
        }
    }
}

// Фоновые потомки оболочки держат каналы открытыми после ее выхода.
async fn drain_output<F>(
    readers: F,
    child_exited: bool,
    deadline: Instant,
    cancel: &mut watch::Receiver<bool>,
) -> Drain
where
    F: Future<Output = ()>,
{
    if !child_exited {
        return match tokio::time::timeout(OUTPUT_GRACE, readers).await {
            Ok(()) => Drain::Done,
            Err(_) => Drain::Grace,
        };
    }
    let grace_end = Instant::now() + OUTPUT_GRACE;
    tokio::select! {
        _ = readers => Drain::Done,
        _ = sleep_until(grace_end.min(deadline)) => {
            if grace_end < deadline { Drain::Grace } else { Drain::Deadline }
        }
        _ = stopped(cancel) => Drain::Cancelled,
    }
}

fn spawn(invocation: &Invocation) -> Result<Child, ExecError> {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn()
        .map_err(|err| ExecError::Spawn(format!("{}: {err}", invocation.program)))
}

fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        kill_group(pid);
    }
    if let Err(err) = child.start_kill() {
        debug!(error = %err, "процесс уже завершен");
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    // SAFETY: plain syscall on a group id we created via process_group(0).
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "kill группы процессов не удался");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

async fn stream_stdout<R, S>(
    stdout: R,
    output: Captured,
    outbound: Outbound<S>,
    id: String,
    command: String,
) where
    R: AsyncRead + Unpin,
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    let mut lines = BufReader::new(stdout).lines();
    let mut emitting = true;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let cumulative = {
                    let mut output = output.lock().await;
                    output.push_str(&line);
                    output.push('\n');
                    emitting.then(|| output.clone())
                };
                let Some(cumulative) = cumulative else {
                    continue;
                };
                let partial = ServerMessage::Partial {
                    command: TerminalCommand {
                        id: id.clone(),
                        command: command.clone(),
                        output: cumulative,
                        time: now_unix(),
                        ..TerminalCommand::default()
                    },
                };
                if let Err(err) = outbound.send_json(&partial).await {
                    // keep draining so the child never blocks on a full pipe
                    warn!(command_id = %id, error = %err, "частичный вывод не отправлен");
                    emitting = false;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(command_id = %id, error = %err, "ошибка чтения stdout");
                break;
            }
        }
    }
}

async fn collect_lines<R: AsyncRead + Unpin>(reader: R, out: Captured) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut out = out.lock().await;
        out.push_str(&line);
        out.push('\n');
    }
}
