//! Mount operations trait.

use crate::HalResult;
use std::path::Path;

/// Trait for mounting and unmounting filesystems.
pub trait MountOps {
    /// Mount the filesystem `identifier` at `target`, creating `target` if needed.
    ///
    /// # Arguments
    /// * `identifier` - Filesystem UUID
    /// * `target` - Mount point path
    /// * `options` - Mount options
    fn mount(&self, identifier: &str, target: &Path, options: &MountOptions) -> HalResult<()>;

    /// Unmount the filesystem mounted at `target`.
    fn unmount(&self, target: &Path) -> HalResult<()>;

    /// Check if a path is currently a mount point.
    fn is_mounted(&self, path: &Path) -> HalResult<bool>;
}

/// Mount options and flags.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Additional mount options as a comma-separated string (e.g., "ro,noexec")
    pub options: Option<String>,
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: impl Into<String>) -> Self {
        Self {
            options: Some(options.into()),
        }
    }
}
