use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use uuid::Uuid;

use crate::constants::{ARTIFACT_FILE_NAME, RUN_DIR_NAME, SOURCE_FILE_NAME, WORKSPACE_PREFIX};

/// Per-request scratch directory. Removed when closed or dropped.
///
/// Layout:
/// ```text
/// <root>/cpp-harness-<uuid>-XXXX/
///     solution.cpp
///     solution.out
///     sandbox/        working directory of the run phase, empty
/// ```
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    dir: TempDir,
    run_dir: PathBuf,
}

impl Workspace {
    pub fn create(root: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(root)?;

        let id = Uuid::new_v4();
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}{}-", WORKSPACE_PREFIX, id))
            .tempdir_in(root)?;

        let run_dir = dir.path().join(RUN_DIR_NAME);
        fs::create_dir(&run_dir)?;

        Ok(Self { id, dir, run_dir })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn source_path(&self) -> PathBuf {
        self.dir.path().join(SOURCE_FILE_NAME)
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.dir.path().join(ARTIFACT_FILE_NAME)
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Replaces the run directory with an empty one, discarding whatever a previous run left.
    pub fn reset_run_dir(&self) -> std::io::Result<()> {
        match fs::remove_dir_all(&self.run_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::create_dir(&self.run_dir)
    }

    /// Removes the directory tree. Failures are logged, never returned.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => tracing::debug!("Removed workspace {}", path.display()),
            Err(e) => tracing::warn!("Failed to remove workspace {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspaces_are_isolated() {
        let root = tempfile::tempdir().unwrap();

        let first = Workspace::create(root.path()).unwrap();
        let second = Workspace::create(root.path()).unwrap();

        assert_ne!(first.path(), second.path());
        assert_ne!(first.id(), second.id());
        assert!(first.run_dir().is_dir());
        assert!(first.source_path().starts_with(first.path()));
        assert!(first.artifact_path().starts_with(first.path()));
        assert_eq!(fs::read_dir(first.run_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_close_removes_everything() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        fs::write(workspace.source_path(), "int main() {}").unwrap();
        fs::write(workspace.run_dir().join("scratch"), "x").unwrap();

        let path = workspace.path().to_path_buf();
        workspace.close();

        assert!(!path.exists());
    }

    #[test]
    fn test_reset_run_dir_empties_it() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        fs::write(workspace.source_path(), "int main() {}").unwrap();
        fs::create_dir(workspace.run_dir().join("nested")).unwrap();
        fs::write(workspace.run_dir().join("nested").join("state"), "1").unwrap();

        workspace.reset_run_dir().unwrap();

        assert!(workspace.run_dir().is_dir());
        assert_eq!(fs::read_dir(workspace.run_dir()).unwrap().count(), 0);
        assert!(workspace.source_path().exists());
    }

    #[test]
    fn test_create_fails_under_read_only_root() {
        // /proc does not accept new directories
        let result = Workspace::create(Path::new("/proc/cpp-harness-test"));
        assert!(result.is_err());
    }
}
