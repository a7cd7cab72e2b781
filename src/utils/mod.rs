//! Filesystem helpers for the config file and the snapshot store. Both hold
//! conversation data or settings, so everything written here is owner-only.

pub mod task_tracker;

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Root for config and snapshots: `$METALOOP_HOME`, else `~/.metaloop`.
pub fn metaloop_home() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os("METALOOP_HOME") {
        return Ok(PathBuf::from(home));
    }
    Ok(dirs::home_dir()
        .context("Could not determine home directory")?
        .join(".metaloop"))
}

/// Turn a directory from the config file into a path, expanding a leading `~`.
pub fn resolve_dir(configured: &str) -> PathBuf {
    let Some(rest) = configured.strip_prefix('~') else {
        return PathBuf::from(configured);
    };
    if !(rest.is_empty() || rest.starts_with('/')) {
        // `~user` forms are left alone
        return PathBuf::from(configured);
    }
    match dirs::home_dir() {
        Some(home) => home.join(rest.trim_start_matches('/')),
        None => PathBuf::from(configured),
    }
}

/// Create `path` and its parents. New directories are 0700 on unix.
pub fn ensure_private_dir(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    Ok(path.to_path_buf())
}

/// File name for a task's snapshot. Task ids come from callers and from
/// snapshot files, so anything outside `[A-Za-z0-9._-]` becomes `_` and a
/// leading dot is replaced to keep the file visible and inside the directory.
pub fn snapshot_file_name(task_id: &str) -> String {
    let mut name: String = task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.starts_with('.') || name.is_empty() {
        name.insert(0, '_');
    }
    name.push_str(".json");
    name
}

/// Replace `path` with `content` through a temp file and one rename, so readers
/// see the old file or the new one and never a partial write. The result is
/// 0600 on unix.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().context("Path has no parent directory")?;
    ensure_private_dir(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    tmp.write_all(content)
        .context("Failed to write to temp file")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .context("Failed to restrict temp file permissions")?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to atomically rename to {}", path.display()))?;
    Ok(())
}
