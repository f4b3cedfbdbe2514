use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use core_types::{FailureKind, UnpackOutcome, UnpackResult, checksum_hex};
use tool_locator::ToolLocation;
use upx_runner::InvocationStatus;
use upx_runner::error::UpxRunnerError;
use upx_runner::ops::{DefaultUpxRunnerOps, UpxRunnerOps};
use utils::{file_util, signature};

use crate::error::Error;

/// Default wall-clock limit for a single UPX invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

/// Inserted before the extension when deriving an output file name.
const OUTPUT_NAME_MARKER: &str = "_unpacked";

/// Longest stderr tail carried into a process failure message.
const DIAGNOSTIC_TAIL_LIMIT: usize = 1024;

/// Drives the unpack workflow for one file at a time:
/// validate, signature gate, copy aside, invoke the tool on the copy,
/// verify by checksum comparison.
///
/// The tool location is resolved once, at construction, and shared
/// read-only across every file the service processes. Per-file problems
/// are captured in the returned `UnpackResult`, never raised.
pub struct UnpackService {
    tool: ToolLocation,
    tool_timeout: Duration,
    runner_ops: Arc<dyn UpxRunnerOps>,
}

impl UnpackService {
    pub fn new(tool: ToolLocation) -> Self {
        Self::new_with_ops(tool, DEFAULT_TOOL_TIMEOUT, Arc::new(DefaultUpxRunnerOps))
    }

    /// Resolves the tool location and builds a service with default ops.
    ///
    /// This is the one failure that short-circuits a whole run: without a
    /// usable tool no file can succeed, so the service refuses to build.
    pub fn with_located_tool(explicit: Option<&Path>) -> Result<Self, Error> {
        let tool = tool_locator::locate(explicit)?;
        Ok(Self::new(tool))
    }

    pub fn new_with_ops(
        tool: ToolLocation,
        tool_timeout: Duration,
        runner_ops: Arc<dyn UpxRunnerOps>,
    ) -> Self {
        Self {
            tool,
            tool_timeout,
            runner_ops,
        }
    }

    pub fn tool(&self) -> &ToolLocation {
        &self.tool
    }

    /// Unpacks a single file.
    ///
    /// The input is never mutated: its bytes are copied to the output path
    /// and the tool decompresses that copy in place. Success requires a
    /// clean tool exit and a changed checksum; a clean exit that alters
    /// nothing is reported as `Unchanged`.
    ///
    /// # Arguments
    /// * `input_path` - File to unpack
    /// * `output_path` - Where to place the unpacked copy; derived as
    ///   `<stem>_unpacked<ext>` alongside the input when not given
    /// * `force` - Skip the signature gate and attempt the unpack anyway
    pub async fn unpack_file(
        &self,
        input_path: &Path,
        output_path: Option<&Path>,
        force: bool,
    ) -> UnpackResult {
        let output_path = match output_path {
            Some(path) => path.to_path_buf(),
            None => derive_output_path(input_path),
        };

        if !input_path.exists() {
            return failed(
                input_path,
                output_path,
                FailureKind::InputNotFound,
                format!("Input file not found: {}", input_path.display()),
            );
        }

        if !force {
            match signature::is_upx_packed(input_path) {
                Ok(true) => {}
                Ok(false) => {
                    return failed(
                        input_path,
                        output_path,
                        FailureKind::NotPacked,
                        format!(
                            "File does not appear to be UPX-packed: {}",
                            input_path.display()
                        ),
                    );
                }
                Err(e) => {
                    return failed(
                        input_path,
                        output_path,
                        FailureKind::IoError,
                        format!("Error checking UPX signature: {}", e),
                    );
                }
            }
        }

        if let Err(e) = std::fs::copy(input_path, &output_path) {
            return failed(
                input_path,
                output_path,
                FailureKind::IoError,
                format!("Failed to copy file: {}", e),
            );
        }

        let original_checksum = match file_util::get_file_sha256(input_path) {
            Ok(checksum) => checksum,
            Err(e) => {
                return failed(
                    input_path,
                    output_path,
                    FailureKind::IoError,
                    format!("Failed to hash input file: {}", e),
                );
            }
        };

        tracing::debug!(
            "Running UPX on {} (timeout {:?})",
            output_path.display(),
            self.tool_timeout
        );
        let invocation = match self
            .runner_ops
            .decompress(self.tool.path(), &output_path, self.tool_timeout)
            .await
        {
            Ok(outcome) => outcome,
            Err(UpxRunnerError::ToolNotFound(_)) => {
                return failed(
                    input_path,
                    output_path,
                    FailureKind::ToolNotFound,
                    "UPX executable not found. Please install UPX or specify path.".to_string(),
                );
            }
            Err(e) => {
                return failed(
                    input_path,
                    output_path,
                    FailureKind::IoError,
                    format!("Error running UPX: {}", e),
                );
            }
        };

        match invocation.status {
            InvocationStatus::TimedOut => failed(
                input_path,
                output_path,
                FailureKind::Timeout,
                "UPX unpacking timed out".to_string(),
            ),
            InvocationStatus::Failed { exit_code } => {
                tracing::debug!(
                    "UPX exited with code {:?} after {:?}",
                    exit_code,
                    invocation.elapsed
                );
                // failed attempts leave no artifact behind
                if output_path.exists() {
                    if let Err(e) = std::fs::remove_file(&output_path) {
                        tracing::warn!(
                            "Failed to remove output file {}: {}",
                            output_path.display(),
                            e
                        );
                    }
                }
                let diagnostic = diagnostic_tail(&invocation.stderr);
                let message = if diagnostic.is_empty() {
                    "UPX unpacking failed: Unknown error".to_string()
                } else {
                    format!("UPX unpacking failed: {}", diagnostic)
                };
                failed(input_path, output_path, FailureKind::ProcessFailure, message)
            }
            InvocationStatus::Success => {
                let unpacked_checksum = match file_util::get_file_sha256(&output_path) {
                    Ok(checksum) => checksum,
                    Err(e) => {
                        return failed(
                            input_path,
                            output_path,
                            FailureKind::IoError,
                            format!("Failed to hash output file: {}", e),
                        );
                    }
                };
                if unpacked_checksum == original_checksum {
                    return failed(
                        input_path,
                        output_path,
                        FailureKind::Unchanged,
                        "File unchanged - may not have been UPX packed".to_string(),
                    );
                }
                tracing::info!("Successfully unpacked {}", input_path.display());
                UnpackResult {
                    input_path: input_path.to_path_buf(),
                    output_path,
                    outcome: UnpackOutcome::Unpacked {
                        original_checksum: checksum_hex(&original_checksum),
                        unpacked_checksum: checksum_hex(&unpacked_checksum),
                    },
                }
            }
        }
    }
}

fn failed(
    input_path: &Path,
    output_path: PathBuf,
    kind: FailureKind,
    message: String,
) -> UnpackResult {
    tracing::debug!("Unpack of {} failed ({}): {}", input_path.display(), kind, message);
    UnpackResult {
        input_path: input_path.to_path_buf(),
        output_path,
        outcome: UnpackOutcome::Failed { kind, message },
    }
}

/// Derives `<stem>_unpacked<ext>` alongside the input file.
fn derive_output_path(input_path: &Path) -> PathBuf {
    let mut file_name = input_path
        .file_stem()
        .map(OsStr::to_os_string)
        .unwrap_or_default();
    file_name.push(OUTPUT_NAME_MARKER);
    if let Some(extension) = input_path.extension() {
        file_name.push(".");
        file_name.push(extension);
    }
    input_path.with_file_name(file_name)
}

/// Keeps only the tail of very long diagnostics.
fn diagnostic_tail(stderr: &str) -> &str {
    let trimmed = stderr.trim();
    let mut start = trimmed.len().saturating_sub(DIAGNOSTIC_TAIL_LIMIT);
    while start > 0 && !trimmed.is_char_boundary(start) {
        start -= 1;
    }
    &trimmed[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use upx_runner::ops::{MockBehavior, MockUpxRunnerOps};
    use utils::test_utils;

    fn fake_tool(dir: &Path) -> ToolLocation {
        let tool_path = test_utils::write_fake_tool(dir, "upx");
        tool_locator::locate(Some(&tool_path)).unwrap()
    }

    fn service_with(tool: ToolLocation, mock: &MockUpxRunnerOps) -> UnpackService {
        UnpackService::new_with_ops(tool, Duration::from_secs(30), Arc::new(mock.clone()))
    }

    fn write_packed(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let mut content = b"MZ\x90\x00UPX!".to_vec();
        content.extend_from_slice(&[0x0d; 64]);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn write_plain(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"MZ\x90\x00 plain executable bytes").unwrap();
        path
    }

    #[async_std::test]
    async fn test_successful_unpack_carries_distinct_checksums() {
        let temp_dir = tempdir().unwrap();
        let input = write_packed(temp_dir.path(), "sample.exe");
        let original_content = std::fs::read(&input).unwrap();

        let mock =
            MockUpxRunnerOps::with_behavior(MockBehavior::RewriteTarget(b"unpacked body".to_vec()));
        let service = service_with(fake_tool(temp_dir.path()), &mock);

        let result = service.unpack_file(&input, None, false).await;

        assert!(result.is_success(), "unpack failed: {:?}", result);
        let (original_checksum, _) = test_utils::get_sha256_and_size(&original_content);
        let (unpacked_checksum, _) = test_utils::get_sha256_and_size(b"unpacked body");
        assert_eq!(
            result.outcome,
            UnpackOutcome::Unpacked {
                original_checksum: checksum_hex(&original_checksum),
                unpacked_checksum: checksum_hex(&unpacked_checksum),
            }
        );

        // the input is never mutated, only the copy is
        assert_eq!(std::fs::read(&input).unwrap(), original_content);
        assert_eq!(std::fs::read(&result.output_path).unwrap(), b"unpacked body");

        let calls = mock.decompress_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].target, result.output_path);
        assert_eq!(calls[0].timeout, Duration::from_secs(30));
    }

    #[async_std::test]
    async fn test_unchanged_output_is_a_failure() {
        let temp_dir = tempdir().unwrap();
        let input = write_packed(temp_dir.path(), "sample.exe");

        let mock = MockUpxRunnerOps::with_behavior(MockBehavior::LeaveUnchanged);
        let service = service_with(fake_tool(temp_dir.path()), &mock);

        let result = service.unpack_file(&input, None, false).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Unchanged));
        assert_eq!(result.message(), "File unchanged - may not have been UPX packed");
    }

    #[async_std::test]
    async fn test_not_packed_gate_blocks_before_invocation() {
        let temp_dir = tempdir().unwrap();
        let input = write_plain(temp_dir.path(), "plain.exe");

        let mock = MockUpxRunnerOps::with_behavior(MockBehavior::RewriteTarget(b"x".to_vec()));
        let service = service_with(fake_tool(temp_dir.path()), &mock);

        let result = service.unpack_file(&input, None, false).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::NotPacked));
        assert_eq!(mock.total_calls(), 0);
        // the gate fires before any copy is made
        assert!(!result.output_path.exists());
    }

    #[async_std::test]
    async fn test_force_bypasses_the_signature_gate() {
        let temp_dir = tempdir().unwrap();
        let input = write_plain(temp_dir.path(), "plain.exe");

        let mock =
            MockUpxRunnerOps::with_behavior(MockBehavior::RewriteTarget(b"unpacked".to_vec()));
        let service = service_with(fake_tool(temp_dir.path()), &mock);

        let result = service.unpack_file(&input, None, true).await;

        assert!(result.is_success(), "forced unpack failed: {:?}", result);
        assert_eq!(mock.total_calls(), 1);
    }

    #[async_std::test]
    async fn test_process_failure_removes_the_output_copy() {
        let temp_dir = tempdir().unwrap();
        let input = write_packed(temp_dir.path(), "sample.exe");

        let mock = MockUpxRunnerOps::with_behavior(MockBehavior::FailWith {
            exit_code: 2,
            stderr: "NotPackedException: not packed by UPX".to_string(),
        });
        let service = service_with(fake_tool(temp_dir.path()), &mock);

        let result = service.unpack_file(&input, None, false).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::ProcessFailure));
        assert!(result.message().contains("NotPackedException"));
        assert!(!result.output_path.exists());
    }

    #[async_std::test]
    async fn test_timeout_is_reported_as_timeout() {
        let temp_dir = tempdir().unwrap();
        let input = write_packed(temp_dir.path(), "sample.exe");

        let mock = MockUpxRunnerOps::with_behavior(MockBehavior::TimeOut);
        let service = service_with(fake_tool(temp_dir.path()), &mock);

        let result = service.unpack_file(&input, None, false).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));
        assert_eq!(result.message(), "UPX unpacking timed out");
    }

    #[async_std::test]
    async fn test_missing_input_is_reported_without_invocation() {
        let temp_dir = tempdir().unwrap();
        let mock = MockUpxRunnerOps::new();
        let service = service_with(fake_tool(temp_dir.path()), &mock);

        let result = service
            .unpack_file(&temp_dir.path().join("missing.exe"), None, false)
            .await;

        assert_eq!(result.failure_kind(), Some(FailureKind::InputNotFound));
        assert_eq!(mock.total_calls(), 0);
    }

    #[async_std::test]
    async fn test_explicit_output_path_is_honored() {
        let temp_dir = tempdir().unwrap();
        let input = write_packed(temp_dir.path(), "sample.exe");
        let explicit_output = temp_dir.path().join("custom-name.bin");

        let mock =
            MockUpxRunnerOps::with_behavior(MockBehavior::RewriteTarget(b"unpacked".to_vec()));
        let service = service_with(fake_tool(temp_dir.path()), &mock);

        let result = service
            .unpack_file(&input, Some(&explicit_output), false)
            .await;

        assert!(result.is_success());
        assert_eq!(result.output_path, explicit_output);
        assert!(explicit_output.exists());
    }

    #[async_std::test]
    async fn test_derived_output_name_inserts_marker_before_extension() {
        let temp_dir = tempdir().unwrap();
        let input = write_packed(temp_dir.path(), "sample.exe");

        let mock =
            MockUpxRunnerOps::with_behavior(MockBehavior::RewriteTarget(b"unpacked".to_vec()));
        let service = service_with(fake_tool(temp_dir.path()), &mock);

        let result = service.unpack_file(&input, None, false).await;

        assert_eq!(
            result.output_path,
            temp_dir.path().join("sample_unpacked.exe")
        );
    }

    #[cfg(unix)]
    #[async_std::test]
    async fn test_tool_vanishing_after_resolution_is_tool_not_found() {
        let temp_dir = tempdir().unwrap();
        let input = write_packed(temp_dir.path(), "sample.exe");

        let tool = fake_tool(temp_dir.path());
        std::fs::remove_file(tool.path()).unwrap();
        let service = UnpackService::new_with_ops(
            tool,
            Duration::from_secs(30),
            Arc::new(upx_runner::ops::DefaultUpxRunnerOps),
        );

        let result = service.unpack_file(&input, None, false).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::ToolNotFound));
    }

    #[async_std::test]
    async fn test_with_located_tool_short_circuits_on_missing_tool() {
        let temp_dir = tempdir().unwrap();
        let result = UnpackService::with_located_tool(Some(&temp_dir.path().join("missing-upx")));
        assert!(matches!(result, Err(Error::ToolNotFound(_))));
    }
}
