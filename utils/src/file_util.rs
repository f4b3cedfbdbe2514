use std::{
    fs::File,
    io::Read,
    path::Path,
};

use core_types::{FileSize, Sha256Checksum};

/// Calculates the SHA-256 checksum of a file, streaming it in 8 KB chunks
/// so memory stays bounded regardless of file size.
pub fn get_file_sha256(path: &Path) -> std::io::Result<Sha256Checksum> {
    use sha2::{Digest, Sha256};
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    let checksum: Sha256Checksum = hasher.finalize().into();
    Ok(checksum)
}

pub fn get_file_size(path: &Path) -> std::io::Result<FileSize> {
    Ok(std::fs::metadata(path)?.len())
}
