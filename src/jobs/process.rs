use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::error::PipelineError;

/// Run one external command to completion, streaming its combined
/// stdout/stderr into `log_file`.
///
/// A header (command line, working directory) is appended before the process
/// starts and an `EXIT_CODE:` marker after it ends. Output is written one
/// complete line at a time and flushed, so a concurrent poller can tail the
/// log while the process is still running.
///
/// A spawn failure is reported as [`PipelineError::Launch`], distinct from a
/// nonzero exit code: the process never ran. When `cancel` flips to `true`
/// the child is killed and its (nonzero) exit status returned as usual.
pub async fn run_logged(
    command: &str,
    cwd: Option<&Path>,
    log_file: &Path,
    label: &str,
    cancel: &mut watch::Receiver<bool>,
) -> Result<i32, PipelineError> {
    if let Some(parent) = log_file.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineError::io(parent, e))?;
    }
    let mut log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .await
        .map_err(|e| PipelineError::io(log_file, e))?;

    let cwd_display = cwd.map(|p| p.display().to_string()).unwrap_or_default();
    let header = format!("==== {label} ====\nCOMMAND: {command}\nCWD: {cwd_display}\n\n");
    log.write_all(header.as_bytes())
        .await
        .map_err(|e| PipelineError::io(log_file, e))?;
    log.flush().await.map_err(|e| PipelineError::io(log_file, e))?;

    // bash -lc keeps the template semantics of the configured command lines.
    let mut cmd = Command::new("bash");
    cmd.arg("-lc")
        .arg(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|source| PipelineError::Launch {
        command: command.to_string(),
        source,
    })?;

    // Both pipes feed one channel so the log receives whole lines in order
    // of arrival, written by a single writer.
    let (tx, mut rx) = mpsc::channel::<String>(256);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_lines(stderr, tx.clone()));
    }
    drop(tx);

    let mut kill_armed = true;
    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    log.write_all(line.as_bytes())
                        .await
                        .map_err(|e| PipelineError::io(log_file, e))?;
                    log.write_all(b"\n")
                        .await
                        .map_err(|e| PipelineError::io(log_file, e))?;
                    log.flush().await.map_err(|e| PipelineError::io(log_file, e))?;
                }
                // Both pipes closed; the process is exiting.
                None => break,
            },
            changed = cancel.changed(), if kill_armed => {
                if changed.is_ok() && *cancel.borrow() {
                    warn!(command, "cancellation requested, killing child");
                    let _ = child.start_kill();
                }
                // Either we killed it or the sender is gone; stop polling.
                kill_armed = false;
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| PipelineError::io(log_file, e))?;
    let exit_code = status.code().unwrap_or(-1);

    log.write_all(format!("\nEXIT_CODE: {exit_code}\n").as_bytes())
        .await
        .map_err(|e| PipelineError::io(log_file, e))?;
    log.flush().await.map_err(|e| PipelineError::io(log_file, e))?;

    debug!(command, exit_code, "command finished");
    Ok(exit_code)
}

async fn pump_lines<R>(stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}
