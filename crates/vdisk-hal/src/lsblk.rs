//! Typed model of `lsblk --json` output.

use crate::{BlockDevice, HalError, HalResult};
use serde::Deserialize;
use std::path::PathBuf;

/// Columns requested from lsblk; keep in sync with [`LsblkDevice`].
pub const LSBLK_COLUMNS: &str = "NAME,UUID,FSTYPE,MOUNTPOINTS";

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    // util-linux >= 2.37 reports a list; older versions a single `mountpoint`.
    #[serde(default)]
    mountpoints: Option<Vec<Option<String>>>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

impl LsblkDevice {
    fn flatten_into(self, out: &mut Vec<BlockDevice>) {
        let mut mount_points: Vec<PathBuf> = self
            .mountpoints
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .chain(self.mountpoint)
            .filter(|m| !m.is_empty())
            .map(PathBuf::from)
            .collect();
        mount_points.sort();
        mount_points.dedup();

        out.push(BlockDevice {
            name: self.name,
            identifier: self.uuid.filter(|u| !u.is_empty()),
            fs_type: self.fstype.filter(|f| !f.is_empty()),
            mount_points,
        });
        for child in self.children {
            child.flatten_into(out);
        }
    }
}

/// Parse `lsblk -J -o NAME,UUID,FSTYPE,MOUNTPOINTS` output into a flat device list.
pub fn parse_lsblk_json(json: &str) -> HalResult<Vec<BlockDevice>> {
    let parsed: LsblkOutput =
        serde_json::from_str(json).map_err(|e| HalError::Parse(format!("lsblk json: {}", e)))?;
    let mut out = Vec::new();
    for dev in parsed.blockdevices {
        dev.flatten_into(&mut out);
    }
    Ok(out)
}
