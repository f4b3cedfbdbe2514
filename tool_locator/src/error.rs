use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ToolLocatorError {
    #[error("UPX executable not found: {0}")]
    ToolNotFound(String),
}
