//! Shared helper for invoking the registry/image tooling (`skopeo`, `umoci`,
//! `virt-make-fs`, `qemu-img`) and any other subprocess that should be
//! timed out, logged, and cancellation-aware.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("{program} cancelled")]
    Cancelled { program: String },
    #[error("{program} exited with status {status}: {stderr}")]
    NonZeroExit { program: String, status: i32, stderr: String },
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, #[source] source: std::io::Error },
}

/// Runs `program` with `args`, logging argv and exit status, enforcing
/// `timeout`, and killing the child if `cancel` fires first.
pub async fn run_logged(
    program: &str,
    args: &[&str],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), SubprocessError> {
    tracing::debug!(program, ?args, "invoking subprocess");
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| SubprocessError::Spawn { program: program.to_string(), source })?;

    let wait = child.wait_with_output();
    tokio::pin!(wait);

    tokio::select! {
        _ = cancel.cancelled() => {
            Err(SubprocessError::Cancelled { program: program.to_string() })
        }
        result = &mut wait => {
            let output = result.map_err(|source| SubprocessError::Spawn { program: program.to_string(), source })?;
            if output.status.success() {
                tracing::debug!(program, "subprocess succeeded");
                Ok(())
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                tracing::warn!(program, status = ?output.status, stderr, "subprocess failed");
                Err(SubprocessError::NonZeroExit {
                    program: program.to_string(),
                    status: output.status.code().unwrap_or(-1),
                    stderr,
                })
            }
        }
        _ = tokio::time::sleep(timeout) => {
            Err(SubprocessError::Timeout { program: program.to_string(), timeout })
        }
    }
}
