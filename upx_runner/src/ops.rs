use crate::error::UpxRunnerError;
use crate::{run_upx_decompress, InvocationOutcome, InvocationStatus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Trait for UPX invocation operations.
///
/// This trait abstracts the external tool execution to allow for different
/// implementations, including mocks for testing purposes.
#[async_trait::async_trait]
pub trait UpxRunnerOps: Send + Sync {
    /// Runs UPX decompression against the target file.
    ///
    /// # Arguments
    /// * `executable` - Path to the UPX executable
    /// * `target` - File to decompress in place
    /// * `timeout` - Wall-clock limit for the invocation
    ///
    /// # Returns
    /// * `Ok(InvocationOutcome)` with the captured exit status and output
    /// * `Err(UpxRunnerError)` if the process could not be started
    async fn decompress(
        &self,
        executable: &Path,
        target: &Path,
        timeout: Duration,
    ) -> Result<InvocationOutcome, UpxRunnerError>;
}

/// Default implementation that performs actual tool execution.
pub struct DefaultUpxRunnerOps;

impl DefaultUpxRunnerOps {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DefaultUpxRunnerOps {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl UpxRunnerOps for DefaultUpxRunnerOps {
    async fn decompress(
        &self,
        executable: &Path,
        target: &Path,
        timeout: Duration,
    ) -> Result<InvocationOutcome, UpxRunnerError> {
        run_upx_decompress(executable, target, timeout).await
    }
}

/// Represents a recorded call to a decompress operation.
///
/// Used by `MockUpxRunnerOps` to track and verify tool calls in tests.
#[derive(Debug, Clone)]
pub struct DecompressCall {
    /// Executable that was called
    pub executable: PathBuf,
    /// Target file passed to the tool
    pub target: PathBuf,
    /// Timeout the call was made with
    pub timeout: Duration,
}

/// What a mocked invocation does to the target file and reports back.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Exit cleanly after overwriting the target with the given bytes.
    RewriteTarget(Vec<u8>),
    /// Exit cleanly without touching the target.
    LeaveUnchanged,
    /// Exit with the given code and stderr text.
    FailWith { exit_code: i32, stderr: String },
    /// Report hitting the wall-clock deadline.
    TimeOut,
}

/// Mock implementation for testing tool invocations.
///
/// The mock tracks all decompress calls and can simulate a rewrite, a no-op,
/// a failing exit or a timeout, allowing comprehensive testing without the
/// real UPX executable. A per-file-name override makes mixed batches
/// possible.
#[derive(Clone)]
pub struct MockUpxRunnerOps {
    default_behavior: MockBehavior,
    behavior_overrides: Arc<Mutex<HashMap<String, MockBehavior>>>,
    decompress_calls: Arc<Mutex<Vec<DecompressCall>>>,
}

impl Default for MockUpxRunnerOps {
    fn default() -> Self {
        Self {
            default_behavior: MockBehavior::LeaveUnchanged,
            behavior_overrides: Arc::new(Mutex::new(HashMap::new())),
            decompress_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl MockUpxRunnerOps {
    /// Creates a new mock that exits cleanly without touching any target.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new mock with the given default behavior for all targets.
    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            default_behavior: behavior,
            ..Default::default()
        }
    }

    /// Creates a new mock that fails every invocation with exit code 1 and
    /// the given stderr text.
    pub fn with_failure(error_msg: impl Into<String>) -> Self {
        Self::with_behavior(MockBehavior::FailWith {
            exit_code: 1,
            stderr: error_msg.into(),
        })
    }

    /// Overrides the behavior for targets whose file name matches.
    pub fn set_behavior_for(&self, file_name: impl Into<String>, behavior: MockBehavior) {
        self.behavior_overrides
            .lock()
            .unwrap()
            .insert(file_name.into(), behavior);
    }

    /// Returns all calls made to the `decompress` method.
    pub fn decompress_calls(&self) -> Vec<DecompressCall> {
        self.decompress_calls.lock().unwrap().clone()
    }

    /// Returns the total number of decompress calls made.
    pub fn total_calls(&self) -> usize {
        self.decompress_calls.lock().unwrap().len()
    }

    fn behavior_for(&self, target: &Path) -> MockBehavior {
        let file_name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.behavior_overrides
            .lock()
            .unwrap()
            .get(&file_name)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone())
    }
}

#[async_trait::async_trait]
impl UpxRunnerOps for MockUpxRunnerOps {
    async fn decompress(
        &self,
        executable: &Path,
        target: &Path,
        timeout: Duration,
    ) -> Result<InvocationOutcome, UpxRunnerError> {
        let call = DecompressCall {
            executable: executable.to_path_buf(),
            target: target.to_path_buf(),
            timeout,
        };
        self.decompress_calls.lock().unwrap().push(call);

        let outcome = match self.behavior_for(target) {
            MockBehavior::RewriteTarget(bytes) => {
                std::fs::write(target, bytes)
                    .map_err(|e| UpxRunnerError::IoError(format!("Mock rewrite failed: {}", e)))?;
                InvocationOutcome {
                    status: InvocationStatus::Success,
                    stdout: "Unpacked 1 file.".to_string(),
                    stderr: String::new(),
                    elapsed: Duration::default(),
                }
            }
            MockBehavior::LeaveUnchanged => InvocationOutcome {
                status: InvocationStatus::Success,
                stdout: "Unpacked 1 file.".to_string(),
                stderr: String::new(),
                elapsed: Duration::default(),
            },
            MockBehavior::FailWith { exit_code, stderr } => InvocationOutcome {
                status: InvocationStatus::Failed {
                    exit_code: Some(exit_code),
                },
                stdout: String::new(),
                stderr,
                elapsed: Duration::default(),
            },
            MockBehavior::TimeOut => InvocationOutcome {
                status: InvocationStatus::TimedOut,
                stdout: String::new(),
                stderr: String::new(),
                elapsed: timeout,
            },
        };
        Ok(outcome)
    }
}
