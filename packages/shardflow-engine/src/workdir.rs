//! Per-attempt scoped working directories
//!
//! Every job attempt gets its own scratch directory, passed explicitly in
//! the job context. The process working directory is never changed. The
//! directory is removed when the attempt ends, success or failure.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::Result;
use crate::job::JobId;

/// An isolated scratch directory tied to one job attempt.
///
/// Dropping the guard deletes the directory; a failed cleanup is logged and
/// otherwise ignored so it can never mask the attempt's own result.
#[derive(Debug)]
pub struct ScopedWorkDir {
    path: PathBuf,
}

impl ScopedWorkDir {
    pub fn create(scratch_root: &Path, job_id: JobId, attempt: u32) -> Result<Self> {
        let path = scratch_root.join(format!("job-{}-a{}", job_id, attempt));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedWorkDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove work dir");
        }
    }
}
