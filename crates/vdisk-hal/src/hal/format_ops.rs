//! Filesystem formatting operations trait.

use crate::HalResult;

/// Trait for creating filesystems on block devices.
pub trait FormatOps {
    /// Create a `fs_type` filesystem on `device` and return its new identifier.
    ///
    /// # Arguments
    /// * `device` - Kernel device name (e.g., `loop3`)
    /// * `fs_type` - Filesystem type (e.g., `"ext4"`)
    /// * `opts` - Formatting options including confirmation
    fn format(&self, device: &str, fs_type: &str, opts: &FormatOptions) -> HalResult<String>;
}

/// Options for formatting operations.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// If true, the user has confirmed the destructive operation
    pub confirmed: bool,
    /// Filesystem label, when the filesystem supports one
    pub label: Option<String>,
}

impl FormatOptions {
    pub fn new(confirmed: bool) -> Self {
        Self {
            confirmed,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}
