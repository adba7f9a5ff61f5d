//! Local shell executor - runs `run` steps through `sh -c`

use crate::core::job::{Step, StepAction};
use crate::executor::{CancelSignal, ExecutorError, StepEnv, StepExecutor, StepOutcome};
use async_trait::async_trait;
use std::pin::pin;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long output is still collected after the shell exits
///
/// Background processes started by a step may keep the pipes open long after
/// the step itself is done.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Executor that runs commands in a local shell inside the workspace
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    /// Shell program
    shell: String,

    /// Arguments placed before the command
    shell_args: Vec<String>,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        if cfg!(windows) {
            Self::with_shell("cmd", ["/C"])
        } else {
            Self::with_shell("sh", ["-c"])
        }
    }
}

impl ShellExecutor {
    /// Create an executor using the platform shell
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an executor using a specific shell, e.g. `bash -eo pipefail -c`
    pub fn with_shell<I, S>(shell: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            shell: shell.into(),
            shell_args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }
}

/// Kill the step's process group, reaching processes it left in the background
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the group was created for this step
    if unsafe { libc::killpg(pid, libc::SIGKILL) } != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

fn forward_lines<R>(reader: R, prefix: &'static str, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = if prefix.is_empty() {
                line
            } else {
                format!("{}{}", prefix, line)
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

#[async_trait]
impl StepExecutor for ShellExecutor {
    async fn execute(
        &self,
        step: &Step,
        env: &StepEnv,
        mut cancel: CancelSignal,
    ) -> Result<StepOutcome, ExecutorError> {
        let command = match &step.action {
            StepAction::Run { command } => command,
            other => return Err(ExecutorError::Unsupported(other.default_name())),
        };

        info!(
            job = %env.job,
            step = %env.step,
            attempt = env.attempt,
            "starting step process"
        );
        debug!(job = %env.job, cmd = %command, "shell command");

        let mut cmd = Command::new(&self.shell);
        cmd.args(&self.shell_args)
            .arg(command)
            .current_dir(&env.workspace)
            .envs(&env.vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecutorError::Spawn(format!("{} ({})", e, self.shell)))?;
        let pid = child.id();

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, "", line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, "[stderr] ", line_tx.clone());
        }
        drop(line_tx);

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                info!(job = %env.job, step = %env.step, "cancellation requested; killing step process");
                kill_process_group(pid);
                if let Err(e) = child.kill().await {
                    warn!(job = %env.job, error = %e, "failed to kill step process");
                }
                return Err(ExecutorError::Cancelled);
            }
        };

        // Readers finish once both pipes reach EOF, unless a background
        // process still holds them
        let mut logs = Vec::new();
        let mut drain = pin!(tokio::time::sleep(OUTPUT_DRAIN_TIMEOUT));
        loop {
            tokio::select! {
                line = line_rx.recv() => match line {
                    Some(line) => logs.push(line),
                    None => break,
                },
                _ = &mut drain => {
                    debug!(job = %env.job, step = %env.step, "output still open after exit; leaving background processes");
                    break;
                }
                _ = cancel.cancelled() => {
                    info!(job = %env.job, step = %env.step, "cancellation requested; killing background processes");
                    kill_process_group(pid);
                    return Err(ExecutorError::Cancelled);
                }
            }
        }

        let exit_code = status.code().unwrap_or(-1);
        info!(
            job = %env.job,
            step = %env.step,
            exit_code,
            success = status.success(),
            "step process exited"
        );

        Ok(StepOutcome {
            exit_code,
            artifacts: Vec::new(),
            logs,
        })
    }
}
