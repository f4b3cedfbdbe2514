use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use core_types::BatchSummary;
use walkdir::WalkDir;

use crate::error::Error;
use crate::unpack_service::UnpackService;

/// Applies the unpack workflow across file lists and directory trees.
///
/// Files are processed sequentially, one fully finished before the next
/// begins, so result ordering is deterministic. A failure on one file never
/// stops the batch; every outcome is retained in traversal order.
pub struct BatchService {
    unpack_service: Arc<UnpackService>,
}

impl BatchService {
    pub fn new(unpack_service: Arc<UnpackService>) -> Self {
        Self { unpack_service }
    }

    /// Unpacks every file in the given list.
    pub async fn process_list(&self, paths: &[PathBuf], force: bool) -> BatchSummary {
        let mut summary = BatchSummary::new();
        for path in paths {
            let result = self.unpack_service.unpack_file(path, None, force).await;
            if !result.is_success() {
                tracing::warn!("Unpack failed for {}: {}", path.display(), result.message());
            }
            summary.push(result);
        }
        summary
    }

    /// Unpacks every qualifying file under a directory.
    ///
    /// Only direct children are considered unless `recursive` is set. A file
    /// qualifies when its extension is a case-insensitive member of
    /// `extensions` (dotted, lowercase entries, e.g. ".exe").
    pub async fn process_directory(
        &self,
        root: &Path,
        recursive: bool,
        extensions: &HashSet<String>,
        force: bool,
    ) -> Result<BatchSummary, Error> {
        if !root.is_dir() {
            return Err(Error::InvalidInput(format!(
                "Directory not found: {}",
                root.display()
            )));
        }

        let candidates = collect_candidates(root, recursive, extensions);
        tracing::info!(
            "Processing {} candidate file(s) under {}",
            candidates.len(),
            root.display()
        );

        let mut summary = BatchSummary::new();
        for path in candidates {
            let result = self.unpack_service.unpack_file(&path, None, force).await;
            if !result.is_success() {
                tracing::warn!("Unpack failed for {}: {}", path.display(), result.message());
            }
            summary.push(result);
        }
        Ok(summary)
    }
}

fn collect_candidates(root: &Path, recursive: bool, extensions: &HashSet<String>) -> Vec<PathBuf> {
    let mut walker = WalkDir::new(root).follow_links(false).sort_by_file_name();
    if !recursive {
        walker = walker.max_depth(1);
    }
    walker
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Skipping unreadable directory entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| has_allowed_extension(path, extensions))
        .collect()
}

fn has_allowed_extension(path: &Path, extensions: &HashSet<String>) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|extension| extensions.contains(&format!(".{}", extension.to_lowercase())))
        .unwrap_or(false)
}
