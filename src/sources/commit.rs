use crate::error::MigrateError;
use std::fs;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub enum CommitResult {
    Unchanged,
    Written { backup: PathBuf },
}

/// Replaces `path` with `content` unless they already match byte-for-byte.
/// The original is first copied to `backup`.
pub fn commit_file(
    path: &Path,
    original: &[u8],
    content: &[u8],
    backup: &Path,
) -> Result<CommitResult, MigrateError> {
    if original == content {
        return Ok(CommitResult::Unchanged);
    }

    let metadata = fs::metadata(path)?;

    fs::copy(path, backup)?;
    debug!("Backed up {} to {}", path.display(), backup.display());

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(content)?;
    staged.as_file().sync_all()?;
    fs::set_permissions(staged.path(), metadata.permissions())?;

    let staged_meta = staged.as_file().metadata()?;
    if staged_meta.uid() != metadata.uid() || staged_meta.gid() != metadata.gid() {
        std::os::unix::fs::chown(staged.path(), Some(metadata.uid()), Some(metadata.gid()))?;
    }

    staged.persist(path).map_err(|e| MigrateError::Io(e.error))?;
    info!("Rewrote {}", path.display());

    Ok(CommitResult::Written {
        backup: backup.to_path_buf(),
    })
}
