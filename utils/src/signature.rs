use std::{fs::File, io::Read, path::Path, sync::OnceLock};

use aho_corasick::AhoCorasick;

/// Marker byte sequences UPX leaves in packed executables: the magic itself
/// and the packer section names.
const UPX_MARKERS: [&[u8]; 6] = [b"UPX!", b"UPX0", b"UPX1", b"UPX2", b"UPX ", b"$Id: UPX"];

/// How many leading bytes of a file are scanned for markers.
const SCAN_WINDOW: usize = 4096;

fn marker_automaton() -> &'static AhoCorasick {
    static AUTOMATON: OnceLock<AhoCorasick> = OnceLock::new();
    AUTOMATON.get_or_init(|| {
        AhoCorasick::new(UPX_MARKERS).expect("UPX marker patterns are valid literals")
    })
}

/// Checks whether a file looks UPX-packed by scanning its first 4 KB for
/// any known marker, at any offset within that window.
///
/// A file that cannot be read yields an error, never a negative detection.
pub fn is_upx_packed(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    let mut window = Vec::with_capacity(SCAN_WINDOW);
    file.take(SCAN_WINDOW as u64).read_to_end(&mut window)?;
    Ok(marker_automaton().is_match(window.as_slice()))
}
