//! Runs the external trainer and supervises its output.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::args::TrainingCommand;
use super::sniffer::FailureSniffer;
use crate::error::TrainingError;

/// What a successful run looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingReport {
    pub exit_code: Option<i32>,
    pub lines: u64,
}

pub struct TrainingInvoker {
    sniffer: Arc<dyn FailureSniffer>,
}

impl TrainingInvoker {
    pub fn new(sniffer: Arc<dyn FailureSniffer>) -> Self {
        Self { sniffer }
    }

    /// Spawns the trainer and waits for it. Combined stdout/stderr goes to the
    /// log file and to tracing, line by line. There is no timeout and no retry.
    ///
    /// A non-zero exit fails the run; so does exit 0 when a failure marker was
    /// seen in the output.
    pub async fn run(
        &self,
        command: &TrainingCommand,
        log_path: &Path,
    ) -> Result<TrainingReport, TrainingError> {
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TrainingError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await
            .map_err(|e| TrainingError::Io {
                path: log_path.to_path_buf(),
                source: e,
            })?;

        info!(argv = ?command.argv(), "Starting training process");

        let mut cmd = TokioCommand::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| TrainingError::Spawn {
            program: command.program.clone(),
            source: e,
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let mut marker = None;
        let mut lines = 0u64;
        let mut log_ok = true;
        while let Some(line) = rx.recv().await {
            lines += 1;
            info!(target: "trainer", "{}", line);
            if log_ok {
                let written = async {
                    log.write_all(line.as_bytes()).await?;
                    log.write_all(b"\n").await
                }
                .await;
                if let Err(e) = written {
                    warn!("Trainer log write failed, continuing without file log: {}", e);
                    log_ok = false;
                }
            }
            if marker.is_none() {
                marker = self.sniffer.inspect(&line);
            }
        }
        if let Err(e) = log.flush().await {
            warn!("Failed to flush trainer log: {}", e);
        }

        let status = child.wait().await.map_err(|e| TrainingError::Spawn {
            program: command.program.clone(),
            source: e,
        })?;

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(TrainingError::ExitStatus { code });
        }
        if let Some(marker) = marker {
            return Err(TrainingError::FailureMarker { marker });
        }

        Ok(TrainingReport {
            exit_code: status.code(),
            lines,
        })
    }
}

/// Reads `reader` to EOF, sending each line without its terminator.
/// Invalid UTF-8 is replaced rather than ending the stream.
async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut segments = BufReader::new(reader).split(b'\n');
    while let Ok(Some(segment)) = segments.next_segment().await {
        let line = String::from_utf8_lossy(&segment);
        if tx.send(line.trim_end_matches('\r').to_string()).is_err() {
            break;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::training::MarkerSniffer;

    fn shell(script: &str) -> TrainingCommand {
        TrainingCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            working_dir: None,
        }
    }

    fn invoker() -> TrainingInvoker {
        TrainingInvoker::new(Arc::new(MarkerSniffer::default()))
    }

    #[tokio::test]
    async fn test_success_streams_both_pipes_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs").join("sf_a.log");

        let report = invoker()
            .run(&shell("echo out-line; echo err-line 1>&2"), &log)
            .await
            .unwrap();

        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.lines, 2);
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("out-line"));
        assert!(content.contains("err-line"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = invoker()
            .run(&shell("echo boom; exit 3"), &dir.path().join("a.log"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrainingError::ExitStatus { ref code } if code == "3"));
        assert_eq!(err.to_string(), "Training process failed (exit=3)");
    }

    #[tokio::test]
    async fn test_marker_with_zero_exit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = invoker()
            .run(
                &shell("echo 'No data found. Please verify arguments' 1>&2; exit 0"),
                &dir.path().join("a.log"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TrainingError::FailureMarker { ref marker } if marker == "No data found"));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let command = TrainingCommand {
            program: "/definitely/not/a/trainer".into(),
            args: Vec::new(),
            working_dir: None,
        };
        let err = invoker()
            .run(&command, &dir.path().join("a.log"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrainingError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_log_is_appended_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("a.log");
        invoker().run(&shell("echo first"), &log).await.unwrap();
        invoker().run(&shell("echo second"), &log).await.unwrap();
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("first") && content.contains("second"));
    }
}
