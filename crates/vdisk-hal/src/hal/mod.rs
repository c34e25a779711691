//! HAL trait definitions and implementations.
//!
//! This module defines the collaborator traits consumed by the lifecycle
//! engine and provides both real (LinuxHal) and fake (FakeHal) implementations.

pub mod attach_ops;
pub mod copy_ops;
pub mod fake_hal;
pub mod format_ops;
pub mod image_ops;
pub mod linux_hal;
pub mod mount_ops;
pub mod probe_ops;

pub use attach_ops::{AttachOps, AttachOutcome};
pub use copy_ops::{copy_tree_native, CopyOps, CopyOptions, CopyProgress};
pub use fake_hal::{FakeHal, Operation, FAKE_SYSTEM_DEVICES};
pub use format_ops::{FormatOps, FormatOptions};
pub use image_ops::ImageOps;
pub use linux_hal::LinuxHal;
pub use mount_ops::{MountOps, MountOptions};
pub use probe_ops::{BlockDevice, ProbeOps};

/// Complete HAL combining all collaborator traits.
pub trait DiskHal:
    AttachOps + ProbeOps + FormatOps + MountOps + CopyOps + ImageOps + Send + Sync
{
}

/// Automatically implement DiskHal for any type implementing all required traits.
impl<T> DiskHal for T where
    T: AttachOps + ProbeOps + FormatOps + MountOps + CopyOps + ImageOps + Send + Sync
{
}
