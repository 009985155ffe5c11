//! On-disk artifact cache layout
//!
//! Artifacts are stored in the HuggingFace hub layout under a shared root:
//! ```text
//! <cache_root>/
//! ├── models--nvidia--canary-1b-v2/
//! │   ├── blobs/
//! │   ├── snapshots/
//! │   │   └── {revision}/
//! │   │       └── canary-1b-v2.nemo
//! │   └── refs/
//! │       └── main
//! └── models--pyannote--speaker-diarization-community-1/
//!     └── ...
//! ```
//! Only presence of the repo directory is used to decide whether a model is
//! downloaded.

use std::path::{Path, PathBuf};

/// Convert an artifact identifier to its cache directory name
///
/// e.g., "nvidia/canary-1b-v2" -> "models--nvidia--canary-1b-v2"
pub fn cache_dir_name(identifier: &str) -> String {
    format!("models--{}", identifier.replace('/', "--"))
}

/// Convert cache directory name back to an identifier
///
/// e.g., "models--nvidia--canary-1b-v2" -> "nvidia/canary-1b-v2"
fn cache_name_to_identifier(cache_name: &str) -> Option<String> {
    cache_name
        .strip_prefix("models--")
        .map(|s| s.replacen("--", "/", 1))
}

/// Expected cache directory for an artifact identifier
pub fn cache_repo_dir(cache_root: &Path, identifier: &str) -> PathBuf {
    cache_root.join(cache_dir_name(identifier))
}

/// Check if artifacts for an identifier are present on disk
pub fn is_repo_cached(cache_root: &Path, identifier: &str) -> bool {
    cache_repo_dir(cache_root, identifier).exists()
}

/// Get the snapshot directory holding the artifact files
///
/// Resolves `refs/main` first, then falls back to the first snapshot found.
pub fn snapshot_path(cache_root: &Path, identifier: &str) -> Option<PathBuf> {
    let repo_dir = cache_repo_dir(cache_root, identifier);

    let refs_main = repo_dir.join("refs/main");
    if let Ok(revision) = std::fs::read_to_string(&refs_main) {
        let snapshot = repo_dir.join("snapshots").join(revision.trim());
        if snapshot.is_dir() {
            return Some(snapshot);
        }
    }

    let snapshots_dir = repo_dir.join("snapshots");
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(&snapshots_dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Get the total size of an identifier's cached artifacts in bytes
pub fn cache_size(cache_root: &Path, identifier: &str) -> Option<u64> {
    let repo_dir = cache_repo_dir(cache_root, identifier);
    if !repo_dir.exists() {
        return None;
    }
    Some(dir_size(&repo_dir))
}

/// Recursively calculate directory size
///
/// Symlinks are not followed, so hub snapshots pointing into `blobs/` are
/// not counted twice.
pub fn dir_size(path: &Path) -> u64 {
    let mut size = 0;

    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                size += dir_size(&entry.path());
            } else if file_type.is_file()
                && let Ok(metadata) = entry.metadata()
            {
                size += metadata.len();
            }
        }
    }

    size
}

/// List identifiers of every artifact set present under the cache root
pub fn list_cached_models(cache_root: &Path) -> Vec<String> {
    let mut models = Vec::new();

    if let Ok(entries) = std::fs::read_dir(cache_root) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(identifier) = cache_name_to_identifier(&name) {
                models.push(identifier);
            }
        }
    }

    models.sort();
    models
}
