//! On-disk shape of the tracking document.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const TRACKING_VERSION: u32 = 1;
pub const DETACH_HISTORY_LIMIT: usize = 50;
pub const PLACEHOLDER_PREFIX: &str = "auto:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingDocument {
    pub version: u32,
    #[serde(default, rename = "mappings")]
    pub disks: BTreeMap<String, DiskImageRecord>,
    /// Newest first, capped at [`DETACH_HISTORY_LIMIT`].
    #[serde(default)]
    pub detach_history: Vec<DetachEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskImageRecord {
    pub normalized_path: String,
    /// Path as the caller spelled it; `None` for placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<PathBuf>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub mount_points: Vec<PathBuf>,
    pub last_seen: u64,
    #[serde(default)]
    pub auto_discovered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachEvent {
    pub normalized_path: String,
    /// Path as the user spelled it, for display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<PathBuf>,
    pub identifier: Option<String>,
    pub device_name: Option<String>,
    pub detached_at: u64,
}

impl Default for TrackingDocument {
    fn default() -> Self {
        Self {
            version: TRACKING_VERSION,
            disks: BTreeMap::new(),
            detach_history: Vec::new(),
        }
    }
}

impl TrackingDocument {
    pub fn find_by_identifier(&self, identifier: &str) -> Option<&DiskImageRecord> {
        // A real record wins over a placeholder for the same identifier.
        let mut matches = self
            .disks
            .values()
            .filter(|r| r.identifier.as_deref() == Some(identifier));
        let first = matches.next()?;
        if first.auto_discovered {
            matches.find(|r| !r.auto_discovered).or(Some(first))
        } else {
            Some(first)
        }
    }

    pub fn find_by_device_name(&self, name: &str) -> Option<&DiskImageRecord> {
        self.disks
            .values()
            .find(|r| r.device_name.as_deref() == Some(name))
    }

    pub fn find_by_mount_point(&self, mount_point: &Path) -> Option<&DiskImageRecord> {
        self.disks
            .values()
            .find(|r| r.mount_points.iter().any(|mp| mp == mount_point))
    }

    /// Drop `device_name` and `mount_point` from every record other than
    /// `owner`; names are reused by the kernel.
    pub fn release_claims(&mut self, owner: &str, device_name: Option<&str>, mount_point: Option<&Path>) {
        for (key, record) in self.disks.iter_mut() {
            if key == owner {
                continue;
            }
            if device_name.is_some() && record.device_name.as_deref() == device_name {
                record.device_name = None;
                record.mount_points.clear();
            }
            if let Some(mp) = mount_point {
                record.mount_points.retain(|p| p != mp);
            }
        }
    }

    pub fn remove_placeholders_for(&mut self, identifier: &str) -> usize {
        let before = self.disks.len();
        self.disks
            .retain(|_, r| !(r.auto_discovered && r.identifier.as_deref() == Some(identifier)));
        before - self.disks.len()
    }

    pub fn push_detach_event(&mut self, event: DetachEvent) {
        self.detach_history.insert(0, event);
        self.detach_history.truncate(DETACH_HISTORY_LIMIT);
    }

    /// Map keys are authoritative; repair records edited by hand.
    pub(crate) fn sync_keys(&mut self) {
        for (key, record) in self.disks.iter_mut() {
            if record.normalized_path != *key {
                record.normalized_path = key.clone();
            }
        }
    }
}

impl DiskImageRecord {
    pub fn for_path(path: &Path, now: u64) -> Self {
        Self {
            normalized_path: normalize_path(path),
            original_path: Some(path.to_path_buf()),
            identifier: None,
            device_name: None,
            mount_points: Vec::new(),
            last_seen: now,
            auto_discovered: false,
        }
    }

    pub fn placeholder(identifier: &str, now: u64) -> Self {
        Self {
            normalized_path: placeholder_key(identifier),
            original_path: None,
            identifier: Some(identifier.to_string()),
            device_name: None,
            mount_points: Vec::new(),
            last_seen: now,
            auto_discovered: true,
        }
    }

    pub fn image_path(&self) -> Option<&Path> {
        if self.auto_discovered {
            None
        } else {
            self.original_path.as_deref()
        }
    }
}

/// Record key: lower-case, forward slashes.
pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").to_lowercase()
}

pub fn placeholder_key(identifier: &str) -> String {
    format!("{}{}", PLACEHOLDER_PREFIX, identifier)
}

pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
