//! Disk image file management.

use crate::{HalError, HalResult};
use std::fs;
use std::path::Path;

/// Image file operations. The defaults act on the local filesystem, which is
/// where both the real and the fake backend keep their images.
pub trait ImageOps {
    /// Create a sparse image of `size_bytes` at `path`. Fails if `path` exists.
    fn create_image(&self, path: &Path, size_bytes: u64) -> HalResult<()> {
        create_sparse_file(path, size_bytes)
    }

    fn remove_image(&self, path: &Path) -> HalResult<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    /// Rename an image file. Refuses to overwrite an existing destination.
    fn rename_image(&self, from: &Path, to: &Path) -> HalResult<()> {
        rename_no_clobber(from, to)
    }
}

pub(crate) fn create_sparse_file(path: &Path, size_bytes: u64) -> HalResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.set_len(size_bytes)?;
    file.sync_all()?;
    Ok(())
}

pub(crate) fn rename_no_clobber(from: &Path, to: &Path) -> HalResult<()> {
    if to.exists() {
        return Err(HalError::ValidationFailed(format!(
            "refusing to overwrite {}",
            to.display()
        )));
    }
    fs::rename(from, to)?;
    Ok(())
}
