//! Runs a tracking batch as a child process in the background.
//!
//! The batch and its caller share only the annotation/result files and a
//! channel of [`WorkerEvent`]s. At most one batch runs at a time; a request
//! made while one is in flight is rejected.

use crate::error::{Error, Result};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl BatchCommand {
    /// Command line of this executable for one annotation file.
    pub fn pipeline(annotations: &Path, output: &Path, extra: &[String]) -> Result<Self> {
        let program = std::env::current_exe()?;
        let mut args = vec![
            "--input".to_string(),
            annotations.display().to_string(),
            "--output".to_string(),
            output.display().to_string(),
        ];
        args.extend(extra.iter().cloned());
        Ok(Self {
            program,
            args,
            working_dir: None,
        })
    }
}

/// How a finished batch process ended. `exit_code` is `None` when the
/// process could not be started or was killed by a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl JobOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// One line of batch output.
    Progress(String),
    Finished(JobOutcome),
}

/// Clears the busy flag when the batch task ends, even by panic.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Default, Clone)]
pub struct BatchWorker {
    running: Arc<AtomicBool>,
}

impl BatchWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts `command` on a background task. The receiver yields progress
    /// lines and one final [`WorkerEvent::Finished`].
    pub fn submit(&self, command: BatchCommand) -> Result<mpsc::UnboundedReceiver<WorkerEvent>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::BatchInFlight);
        }
        let guard = RunningGuard(self.running.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let outcome = run_command(&command, &tx).await;
            if !outcome.success() {
                error!(
                    "batch {} failed: {}",
                    command.program.display(),
                    outcome.stderr.trim()
                );
            }
            drop(guard);
            let _ = tx.send(WorkerEvent::Finished(outcome));
        });

        Ok(rx)
    }
}

async fn run_command(command: &BatchCommand, tx: &mpsc::UnboundedSender<WorkerEvent>) -> JobOutcome {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);
    if let Some(dir) = &command.working_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    info!("start batch {} {}", command.program.display(), command.args.join(" "));

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return JobOutcome {
                exit_code: None,
                stdout: String::new(),
                stderr: e.to_string(),
            }
        }
    };

    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut bytes = vec![];
            if let Err(e) = stderr.read_to_end(&mut bytes).await {
                warn!("reading batch stderr failed: {e}");
            }
            String::from_utf8_lossy(&bytes).into_owned()
        })
    });

    let mut stdout = String::new();
    if let Some(out) = child.stdout.take() {
        let mut reader = BufReader::new(out);
        let mut buffer = vec![];
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    stdout.push_str(&line);
                    stdout.push('\n');
                    let _ = tx.send(WorkerEvent::Progress(line));
                }
                Err(e) => {
                    warn!("reading batch stdout failed: {e}");
                    break;
                }
            }
        }
    }

    let status = child.wait().await;
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    match status {
        Ok(status) => JobOutcome {
            exit_code: status.code(),
            stdout,
            stderr,
        },
        Err(e) => JobOutcome {
            exit_code: None,
            stdout,
            stderr: format!("{stderr}{e}"),
        },
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> BatchCommand {
        BatchCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
        }
    }

    async fn finish(mut rx: mpsc::UnboundedReceiver<WorkerEvent>) -> (Vec<String>, JobOutcome) {
        let mut progress = vec![];
        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::Progress(line) => progress.push(line),
                WorkerEvent::Finished(outcome) => return (progress, outcome),
            }
        }
        panic!("worker ended without a Finished event");
    }

    #[tokio::test]
    async fn reports_progress_and_stderr_verbatim() {
        let worker = BatchWorker::new();
        let rx = worker
            .submit(sh("echo 'tracking clip.mp4'; echo done; echo 'CUDA out of memory' >&2; exit 3"))
            .unwrap();
        let (progress, outcome) = finish(rx).await;
        assert_eq!(progress, ["tracking clip.mp4", "done"]);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stderr, "CUDA out of memory\n");
        assert!(!outcome.success());
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn invalid_utf8_stderr_is_kept() {
        let worker = BatchWorker::new();
        let rx = worker
            .submit(sh("printf 'caf\\351 failed: CUDA out of memory\\n' >&2; exit 1"))
            .unwrap();
        let (_, outcome) = finish(rx).await;
        assert_eq!(outcome.exit_code, Some(1));
        assert!(outcome.stderr.starts_with("caf\u{FFFD} failed"));
        assert!(outcome.stderr.contains("CUDA out of memory"));
    }

    #[tokio::test]
    async fn invalid_utf8_stdout_line_does_not_stop_reading() {
        let worker = BatchWorker::new();
        let rx = worker
            .submit(sh("printf 'frame \\377 done\\n'; echo after; exit 0"))
            .unwrap();
        let (progress, outcome) = finish(rx).await;
        assert_eq!(progress, ["frame \u{FFFD} done", "after"]);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout, "frame \u{FFFD} done\nafter\n");
    }

    #[tokio::test]
    async fn second_batch_is_rejected_while_running() {
        let worker = BatchWorker::new();
        let rx = worker.submit(sh("sleep 0.3")).unwrap();
        assert!(worker.is_running());
        assert!(matches!(worker.submit(sh("true")), Err(Error::BatchInFlight)));

        let (_, outcome) = finish(rx).await;
        assert!(outcome.success());

        let rx = worker.submit(sh("true")).unwrap();
        assert!(finish(rx).await.1.success());
    }

    #[tokio::test]
    async fn spawn_failure_is_a_finished_outcome() {
        let worker = BatchWorker::new();
        let rx = worker
            .submit(BatchCommand {
                program: PathBuf::from("/nonexistent/boxtrack-batch"),
                args: vec![],
                working_dir: None,
            })
            .unwrap();
        let (progress, outcome) = finish(rx).await;
        assert!(progress.is_empty());
        assert_eq!(outcome.exit_code, None);
        assert!(!outcome.stderr.is_empty());
        assert!(!worker.is_running());
    }

    #[test]
    fn pipeline_command_passes_file_handoff() {
        let command = BatchCommand::pipeline(
            Path::new("boxes.csv"),
            Path::new("tracking_results.csv"),
            &["--no-video".to_string()],
        )
        .unwrap();
        assert_eq!(
            command.args,
            ["--input", "boxes.csv", "--output", "tracking_results.csv", "--no-video"]
        );
    }
}
