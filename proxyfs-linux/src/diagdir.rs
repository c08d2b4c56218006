//! Publishes the diagnostic endpoints as read-only files.

use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use proxyfs_core::diag::{Diagnostics, Endpoint, DIAG_DIR};

use crate::Result;

/// `<parent>/proxyfs/` holding one file per endpoint. Removed on drop.
#[derive(Debug)]
pub struct DiagDir {
    dir: PathBuf,
    diagnostics: Diagnostics,
}

impl DiagDir {
    pub fn publish(parent: &Path, diagnostics: Diagnostics) -> Result<Self> {
        let dir = parent.join(DIAG_DIR);
        fs::create_dir_all(&dir)?;
        let diag = Self { dir, diagnostics };
        diag.refresh()?;
        debug!(dir = %diag.dir.display(), "Published diagnostic endpoints");
        Ok(diag)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn endpoint_path(&self, endpoint: Endpoint) -> PathBuf {
        self.dir.join(endpoint.name())
    }

    /// Rewrites every endpoint file.
    pub fn refresh(&self) -> Result<()> {
        for (endpoint, content) in self.diagnostics.snapshot() {
            let path = self.endpoint_path(endpoint);
            if path.exists() {
                fs::set_permissions(&path, Permissions::from_mode(0o644))?;
            }
            fs::write(&path, content)?;
            fs::set_permissions(&path, Permissions::from_mode(0o444))?;
        }
        Ok(())
    }

    fn remove(&self) {
        for endpoint in Endpoint::ALL {
            let path = self.endpoint_path(endpoint);
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove diagnostic file");
            }
        }
        if let Err(e) = fs::remove_dir(&self.dir) {
            debug!(dir = %self.dir.display(), error = %e, "Diagnostic directory left in place");
        }
    }
}

impl Drop for DiagDir {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_remove() {
        let parent = tempfile::tempdir().unwrap();
        let diag = DiagDir::publish(parent.path(), Diagnostics::new(25)).unwrap();

        let unit = diag.endpoint_path(Endpoint::UnitId);
        assert_eq!(fs::read_to_string(&unit).unwrap(), "25\n");
        assert_eq!(fs::metadata(&unit).unwrap().permissions().mode() & 0o777, 0o444);
        assert!(diag.endpoint_path(Endpoint::Filters).exists());
        assert!(diag.endpoint_path(Endpoint::Pids).exists());

        diag.refresh().unwrap();
        let dir = diag.path().to_path_buf();
        drop(diag);
        assert!(!dir.exists());
    }
}
