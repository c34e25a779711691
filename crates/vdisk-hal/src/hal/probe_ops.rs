//! Block-device enumeration (lsblk/blkid).

use crate::HalResult;
use std::path::PathBuf;

/// One block device as seen by the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// Kernel name without `/dev/` (e.g. `loop3`, `sdd`).
    pub name: String,
    /// Filesystem UUID; `None` for a blank device.
    pub identifier: Option<String>,
    pub fs_type: Option<String>,
    pub mount_points: Vec<PathBuf>,
}

/// Probing operations trait.
pub trait ProbeOps {
    /// Every block device currently known to the kernel.
    fn list_devices(&self) -> HalResult<Vec<BlockDevice>>;

    /// Every filesystem identifier currently visible.
    fn list_identifiers(&self) -> HalResult<Vec<String>> {
        Ok(self
            .list_devices()?
            .into_iter()
            .filter_map(|d| d.identifier)
            .collect())
    }

    /// Device currently carrying the filesystem `identifier`.
    fn device_for_identifier(&self, identifier: &str) -> HalResult<Option<String>> {
        Ok(self
            .list_devices()?
            .into_iter()
            .find(|d| d.identifier.as_deref() == Some(identifier))
            .map(|d| d.name))
    }

    /// Active mount points of the filesystem `identifier`.
    fn mount_points_for_identifier(&self, identifier: &str) -> HalResult<Vec<PathBuf>> {
        Ok(self
            .list_devices()?
            .into_iter()
            .find(|d| d.identifier.as_deref() == Some(identifier))
            .map(|d| d.mount_points)
            .unwrap_or_default())
    }
}
