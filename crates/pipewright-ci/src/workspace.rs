//! Build-scoped working directories.

use pipewright_core::obs;
use pipewright_core::{BuildId, EngineError, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A fresh directory owned by one build: `<root>/<pipeline>/build-<id>`.
///
/// [`Workspace::destroy`] is the explicit, reporting release. Dropping an
/// undestroyed workspace still removes it.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    destroyed: bool,
}

impl Workspace {
    /// Create the workspace, wiping anything left by an earlier run.
    pub fn acquire(root: &Path, pipeline: &str, build_id: BuildId) -> Result<Self> {
        let path = root.join(pipeline).join(format!("build-{}", build_id));
        if path.exists() {
            debug!(path = %path.display(), "removing stale workspace");
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            destroyed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Remove the workspace tree.
    ///
    /// Entries that cannot be removed are reported and skipped; every other
    /// entry is still released. Returns the failures.
    pub fn destroy(&mut self) -> Vec<EngineError> {
        if self.destroyed {
            return Vec::new();
        }
        let mut errors = Vec::new();
        remove_tree(&self.path, &mut errors);
        self.destroyed = errors.is_empty();
        errors
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.destroyed {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

fn remove_tree(path: &Path, errors: &mut Vec<EngineError>) {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => {
            record(path, e, errors);
            return;
        }
    };

    if meta.is_dir() {
        match fs::read_dir(path) {
            Ok(entries) => {
                for entry in entries {
                    match entry {
                        Ok(entry) => remove_tree(&entry.path(), errors),
                        Err(e) => record(path, e, errors),
                    }
                }
            }
            Err(e) => record(path, e, errors),
        }
        if let Err(e) = fs::remove_dir(path) {
            if e.kind() != io::ErrorKind::NotFound {
                record(path, e, errors);
            }
        }
    } else if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            record(path, e, errors);
        }
    }
}

fn record(path: &Path, e: io::Error, errors: &mut Vec<EngineError>) {
    obs::emit_cleanup_error(&path.display().to_string(), &e);
    errors.push(EngineError::Io(io::Error::new(
        e.kind(),
        format!("{}: {}", path.display(), e),
    )));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_build_scoped() {
        let root = tempfile::tempdir().unwrap();
        let a = Workspace::acquire(root.path(), "etl", BuildId(1)).unwrap();
        let b = Workspace::acquire(root.path(), "etl", BuildId(2)).unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().ends_with("etl/build-1"));
    }

    #[test]
    fn test_acquire_wipes_previous_contents() {
        let root = tempfile::tempdir().unwrap();
        let stale = root.path().join("etl").join("build-3");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("leftover.txt"), "old").unwrap();

        let ws = Workspace::acquire(root.path(), "etl", BuildId(3)).unwrap();
        assert!(ws.path().exists());
        assert!(!ws.path().join("leftover.txt").exists());
    }

    #[test]
    fn test_destroy_removes_tree() {
        let root = tempfile::tempdir().unwrap();
        let mut ws = Workspace::acquire(root.path(), "etl", BuildId(1)).unwrap();
        fs::create_dir_all(ws.path().join("src/nested")).unwrap();
        fs::write(ws.path().join("src/nested/file.py"), "x").unwrap();

        let errors = ws.destroy();
        assert!(errors.is_empty());
        assert!(ws.is_destroyed());
        assert!(!ws.path().exists());
        assert!(ws.destroy().is_empty());
    }

    #[test]
    fn test_drop_releases_workspace() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let ws = Workspace::acquire(root.path(), "etl", BuildId(9)).unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
