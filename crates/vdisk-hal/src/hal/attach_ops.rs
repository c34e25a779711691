//! Attach/detach primitive for disk image files.

use crate::HalResult;
use std::path::Path;
use std::time::Duration;

/// Result of asking the platform to attach an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The image was attached. Some backends report the device they picked;
    /// callers treat it as a hint and confirm it with a device snapshot diff.
    Attached { device_hint: Option<String> },
    /// The image was already attached before the call.
    AlreadyAttached { device: String },
}

pub trait AttachOps {
    /// Attach `image` as a bare block device. `label` is a human-readable tag
    /// for backends that support one.
    fn attach(&self, image: &Path, label: &str) -> HalResult<AttachOutcome>;

    /// Detach `image`. Must give up after `timeout`.
    fn detach(&self, image: &Path, timeout: Duration) -> HalResult<()>;

    /// Live attachment check: the device name `image` is attached as, if any.
    fn attached_device(&self, image: &Path) -> HalResult<Option<String>>;
}
