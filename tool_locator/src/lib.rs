use std::env;
use std::path::{Path, PathBuf};

use error::ToolLocatorError;

pub mod error;

#[cfg(not(windows))]
const TOOL_FILE_NAME: &str = "upx";
#[cfg(windows)]
const TOOL_FILE_NAME: &str = "upx.exe";

/// Conventional install locations, probed in order after the PATH scan.
#[cfg(not(windows))]
const CONVENTIONAL_PATHS: [&str; 3] = ["/usr/bin/upx", "/usr/local/bin/upx", "./upx"];
#[cfg(windows)]
const CONVENTIONAL_PATHS: [&str; 3] = [
    "C:\\Program Files\\UPX\\upx.exe",
    "C:\\Program Files (x86)\\UPX\\upx.exe",
    ".\\upx.exe",
];

/// Validated location of the UPX executable.
///
/// Resolved once per run and shared read-only by everything that invokes
/// the tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolLocation {
    path: PathBuf,
}

impl ToolLocation {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Resolves the location of the UPX executable.
///
/// With an explicit path only that path is validated, no fallback search
/// happens. Otherwise each PATH entry is probed for the tool file name,
/// then the fixed conventional locations. First match wins.
pub fn locate(explicit: Option<&Path>) -> Result<ToolLocation, ToolLocatorError> {
    if let Some(path) = explicit {
        if is_executable_file(path) {
            return Ok(ToolLocation {
                path: path.to_path_buf(),
            });
        }
        return Err(ToolLocatorError::ToolNotFound(path.display().to_string()));
    }

    if let Some(path) = search_path().or_else(search_conventional) {
        tracing::debug!("Resolved UPX executable: {}", path.display());
        return Ok(ToolLocation { path });
    }

    Err(ToolLocatorError::ToolNotFound(TOOL_FILE_NAME.to_string()))
}

fn search_path() -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(TOOL_FILE_NAME))
        .find(|candidate| is_executable_file(candidate))
}

fn search_conventional() -> Option<PathBuf> {
    CONVENTIONAL_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|candidate| is_executable_file(candidate))
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}
