use std::path::{Path, PathBuf};

use core_types::{FileSize, Sha256Checksum};
use sha2::{Digest, Sha256};

pub fn get_sha256_and_size(data: &[u8]) -> (Sha256Checksum, FileSize) {
    let mut hasher = Sha256::new();
    hasher.update(data);

    let expected_checksum: Sha256Checksum = hasher.finalize().into();
    let expected_size: FileSize = data.len() as u64;
    (expected_checksum, expected_size)
}

/// Writes a dummy executable file so tests can resolve a tool location
/// without a real UPX install.
pub fn write_fake_tool(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();
    }
    path
}
