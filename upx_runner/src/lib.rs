use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_process::Command;
use async_std::future;
use async_std::io::ReadExt;

use error::UpxRunnerError;

pub mod error;
pub mod ops;

/// Upper bound on captured bytes per output stream. Anything past this is
/// drained and discarded so the child never blocks on a full pipe.
pub const OUTPUT_CAPTURE_LIMIT: usize = 16 * 1024;

/// How the external tool finished.
///
/// A nonzero exit is a normal outcome value here, not an error: only
/// spawn/IO problems surface as `UpxRunnerError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationStatus {
    Success,
    Failed { exit_code: Option<i32> },
    TimedOut,
}

/// Captured result of one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationOutcome {
    pub status: InvocationStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Asynchronous function to run UPX decompression against a target file.
///
/// # arguments
/// * `executable`: path to the UPX executable.
/// * `target`: the file to decompress in place.
/// * `timeout`: wall-clock limit for the invocation. On expiry the child is
///   killed and reaped before the outcome is reported as timed out.
///
/// # returns
/// * `Result<InvocationOutcome, UpxRunnerError>`: the captured outcome, or an
///   error if the process could not be started at all.
///
/// # errors
/// * `UpxRunnerError::TargetNotFound`: if the target file does not exist.
/// * `UpxRunnerError::ToolNotFound`: if the executable could not be started
///   because it does not exist.
/// * `UpxRunnerError::IoError`: if there is another IO error while running
///   the tool.
pub async fn run_upx_decompress(
    executable: &Path,
    target: &Path,
    timeout: Duration,
) -> Result<InvocationOutcome, UpxRunnerError> {
    if !target.exists() {
        return Err(UpxRunnerError::TargetNotFound);
    }

    let started = Instant::now();

    let mut command = Command::new(executable);
    command
        .arg("-d")
        .arg(target)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    tracing::debug!("Command to execute: {:?}", command);

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            UpxRunnerError::ToolNotFound(executable.display().to_string())
        } else {
            UpxRunnerError::IoError(format!("Failed to start UPX: {}", e))
        }
    })?;

    let stdout_task = child
        .stdout
        .take()
        .map(|stream| async_std::task::spawn(read_capped(stream)));
    let stderr_task = child
        .stderr
        .take()
        .map(|stream| async_std::task::spawn(read_capped(stream)));

    let wait_result = future::timeout(timeout, child.status()).await;
    let status = match wait_result {
        Ok(status_result) => {
            let exit_status = status_result.map_err(|e| {
                UpxRunnerError::IoError(format!("Failed to get status of UPX: {}", e))
            })?;
            if exit_status.success() {
                InvocationStatus::Success
            } else {
                InvocationStatus::Failed {
                    exit_code: exit_status.code(),
                }
            }
        }
        Err(_) => {
            tracing::warn!("UPX did not finish within {:?}, killing process", timeout);
            if let Err(e) = child.kill() {
                // the child may have exited right at the deadline
                tracing::debug!("Failed to kill UPX after timeout: {}", e);
            }
            // reap the child before reporting so no zombie is left behind
            let _ = child.status().await;
            InvocationStatus::TimedOut
        }
    };

    let stdout = match stdout_task {
        Some(task) => task.await,
        None => String::new(),
    };
    let stderr = match stderr_task {
        Some(task) => task.await,
        None => String::new(),
    };

    Ok(InvocationOutcome {
        status,
        stdout,
        stderr,
        elapsed: started.elapsed(),
    })
}

/// Reads a stream to EOF, keeping at most `OUTPUT_CAPTURE_LIMIT` bytes.
async fn read_capped<R: async_std::io::Read + Unpin>(mut stream: R) -> String {
    let mut captured = Vec::new();
    let mut buffer = [0u8; 8192];
    loop {
        match stream.read(&mut buffer).await {
            Ok(0) => break,
            Ok(bytes_read) => {
                if captured.len() < OUTPUT_CAPTURE_LIMIT {
                    let room = OUTPUT_CAPTURE_LIMIT - captured.len();
                    captured.extend_from_slice(&buffer[..bytes_read.min(room)]);
                }
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&captured).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();
        path
    }

    #[async_std::test]
    async fn test_successful_run_captures_stdout() {
        let temp_dir = tempdir().unwrap();
        let tool = write_script(
            temp_dir.path(),
            "fake-upx",
            "echo decompressed >> \"$2\"\necho 'Unpacked 1 file.'",
        );
        let target = temp_dir.path().join("sample.exe");
        std::fs::write(&target, b"packed bytes").unwrap();

        let outcome = run_upx_decompress(&tool, &target, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(outcome.status, InvocationStatus::Success);
        assert!(outcome.stdout.contains("Unpacked 1 file."));
        let content = std::fs::read(&target).unwrap();
        assert!(content.ends_with(b"decompressed\n"));
    }

    #[async_std::test]
    async fn test_nonzero_exit_is_an_outcome_not_an_error() {
        let temp_dir = tempdir().unwrap();
        let tool = write_script(
            temp_dir.path(),
            "fake-upx",
            "echo 'CantUnpackException: not packed' >&2\nexit 2",
        );
        let target = temp_dir.path().join("sample.exe");
        std::fs::write(&target, b"plain bytes").unwrap();

        let outcome = run_upx_decompress(&tool, &target, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(
            outcome.status,
            InvocationStatus::Failed { exit_code: Some(2) }
        );
        assert!(outcome.stderr.contains("CantUnpackException"));
    }

    #[async_std::test]
    async fn test_timeout_kills_the_child() {
        let temp_dir = tempdir().unwrap();
        let tool = write_script(temp_dir.path(), "fake-upx", "sleep 5");
        let target = temp_dir.path().join("sample.exe");
        std::fs::write(&target, b"packed bytes").unwrap();

        let outcome = run_upx_decompress(&tool, &target, Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(outcome.status, InvocationStatus::TimedOut);
        // the child was killed and reaped well before its 5 second sleep
        assert!(outcome.elapsed < Duration::from_secs(2));
    }

    #[async_std::test]
    async fn test_output_capture_is_bounded() {
        let temp_dir = tempdir().unwrap();
        let tool = write_script(
            temp_dir.path(),
            "fake-upx",
            "dd if=/dev/zero bs=1024 count=64 2>/dev/null | tr '\\0' 'a'",
        );
        let target = temp_dir.path().join("sample.exe");
        std::fs::write(&target, b"packed bytes").unwrap();

        let outcome = run_upx_decompress(&tool, &target, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(outcome.status, InvocationStatus::Success);
        assert_eq!(outcome.stdout.len(), OUTPUT_CAPTURE_LIMIT);
    }

    #[async_std::test]
    async fn test_missing_target_fails_before_spawn() {
        let temp_dir = tempdir().unwrap();
        let tool = write_script(temp_dir.path(), "fake-upx", "exit 0");

        let result = run_upx_decompress(
            &tool,
            &temp_dir.path().join("missing.exe"),
            Duration::from_secs(10),
        )
        .await;

        assert!(matches!(result, Err(UpxRunnerError::TargetNotFound)));
    }

    #[async_std::test]
    async fn test_missing_tool_is_tool_not_found() {
        let temp_dir = tempdir().unwrap();
        let target = temp_dir.path().join("sample.exe");
        std::fs::write(&target, b"packed bytes").unwrap();

        let result = run_upx_decompress(
            &temp_dir.path().join("no-such-upx"),
            &target,
            Duration::from_secs(10),
        )
        .await;

        assert!(matches!(result, Err(UpxRunnerError::ToolNotFound(_))));
    }
}
