use crate::config::settings::MigrateConfig;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Explicit paths win; otherwise the primary sources list plus every
/// `*.list` file in the sources directory, sorted.
pub fn repository_files(config: &MigrateConfig, explicit: &[PathBuf]) -> Vec<PathBuf> {
    if !explicit.is_empty() {
        return explicit.to_vec();
    }

    let mut files = Vec::new();
    if config.sources_list.exists() {
        files.push(config.sources_list.clone());
    } else {
        debug!("{} does not exist, skipping", config.sources_list.display());
    }

    files.extend(list_files_in(&config.sources_dir));
    files
}

/// Base name used to prefix per-file diagnostics.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn list_files_in(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot read {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().map_or(false, |ext| ext == "list"))
        .collect();

    files.sort();
    files
}
