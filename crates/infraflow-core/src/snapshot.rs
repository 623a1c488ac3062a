//! Per-task copies of the working directory.

use std::fs;
use std::io;
use std::path::Path;

use tempfile::TempDir;

/// Directory names never copied into a snapshot.
const EXCLUDED: &[&str] = &[".git", ".terraform"];

/// Private copy of a working directory, deleted on drop.
#[derive(Debug)]
pub struct WorkspaceSnapshot {
    dir: TempDir,
}

impl WorkspaceSnapshot {
    /// Copy `source` into a fresh temporary directory.
    pub fn create(source: &Path) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("infraflow-scan-").tempdir()?;
        copy_tree(source, dir.path())?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_str().is_some_and(|n| EXCLUDED.contains(&n)) {
            continue;
        }
        let target = dst.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else if file_type.is_symlink() && entry.path().is_file() {
            // Links to directories are skipped so a loop cannot recurse forever.
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
