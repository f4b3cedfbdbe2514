use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum UpxRunnerError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("UPX executable not found: {0}")]
    ToolNotFound(String),
    #[error("Target file not found")]
    TargetNotFound,
}
