use std::fmt::{Display, Formatter, Result};

use tool_locator::error::ToolLocatorError;

/// Errors that stop a whole run before any file is processed. Per-file
/// problems never surface here, they are captured in each `UnpackResult`.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    ToolNotFound(String),
    InvalidInput(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Error::ToolNotFound(message) => write!(f, "UPX executable not found: {}", message),
            Error::InvalidInput(message) => write!(f, "Invalid input: {}", message),
        }
    }
}

impl From<ToolLocatorError> for Error {
    fn from(err: ToolLocatorError) -> Self {
        match err {
            ToolLocatorError::ToolNotFound(path) => Error::ToolNotFound(path),
        }
    }
}
