use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use vdisk_hal::BlockDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    Absent,
    Detached,
    AttachedUnformatted,
    AttachedFormatted,
    Mounted,
}

impl LifecycleState {
    /// State of an attached block device as seen by the probe.
    pub fn of_device(device: &BlockDevice) -> Self {
        if device.identifier.is_none() {
            LifecycleState::AttachedUnformatted
        } else if device.mount_points.is_empty() {
            LifecycleState::AttachedFormatted
        } else {
            LifecycleState::Mounted
        }
    }

    pub fn is_attached(self) -> bool {
        matches!(
            self,
            LifecycleState::AttachedUnformatted
                | LifecycleState::AttachedFormatted
                | LifecycleState::Mounted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Absent => "absent",
            LifecycleState::Detached => "detached",
            LifecycleState::AttachedUnformatted => "attached-unformatted",
            LifecycleState::AttachedFormatted => "attached-formatted",
            LifecycleState::Mounted => "mounted",
        }
    }

    /// Precondition table for every lifecycle transition.
    pub fn require(self, transition: Transition) -> Guard {
        use LifecycleState::*;
        use Transition as T;

        match (transition, self) {
            (T::Create, Absent) => Guard::Proceed,
            (T::Create, _) => Guard::Reject(Rejection::Invalid("the image file already exists")),
            (_, Absent) => Guard::Reject(Rejection::NotFound),

            (T::Attach, Detached) => Guard::Proceed,
            (T::Attach, _) => Guard::AlreadyInState,

            (T::Format, Detached) => Guard::Reject(Rejection::Invalid("attach it first")),
            (T::Format, Mounted) => Guard::Reject(Rejection::Invalid("unmount it first")),
            (T::Format, _) => Guard::Proceed,

            (T::Mount, Detached) => Guard::AttachFirst,
            (T::Mount, AttachedUnformatted) => Guard::Reject(Rejection::NotFormatted),
            (T::Mount, AttachedFormatted) => Guard::Proceed,
            (T::Mount, Mounted) => Guard::AlreadyInState,

            (T::Unmount, Mounted) => Guard::Proceed,
            (T::Unmount, _) => Guard::AlreadyInState,

            (T::Detach, Detached) => Guard::AlreadyInState,
            (T::Detach, Mounted) => Guard::UnmountFirst,
            (T::Detach, _) => Guard::Proceed,

            (T::Delete, Detached) => Guard::Proceed,
            (T::Delete, _) => Guard::Reject(Rejection::Invalid("detach it first")),
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Attach,
    Format,
    Mount,
    Unmount,
    Detach,
    Delete,
    Create,
}

impl Transition {
    pub fn name(self) -> &'static str {
        match self {
            Transition::Attach => "attach",
            Transition::Format => "format",
            Transition::Mount => "mount",
            Transition::Unmount => "umount",
            Transition::Detach => "detach",
            Transition::Delete => "delete",
            Transition::Create => "create",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Proceed,
    AlreadyInState,
    /// Mount on a detached image: attach it as part of the operation.
    AttachFirst,
    /// Detach on a mounted disk: unmount it as part of the operation.
    UnmountFirst,
    Reject(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotFound,
    NotFormatted,
    Invalid(&'static str),
}

/// Live view of one disk after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskStatus {
    pub path: Option<PathBuf>,
    pub identifier: Option<String>,
    pub device: Option<String>,
    pub mount_points: Vec<PathBuf>,
    pub state: LifecycleState,
}

impl DiskStatus {
    pub fn absent(path: Option<PathBuf>, identifier: Option<String>) -> Self {
        Self {
            path,
            identifier,
            device: None,
            mount_points: Vec::new(),
            state: LifecycleState::Absent,
        }
    }

    pub fn detached(path: PathBuf, identifier: Option<String>) -> Self {
        Self {
            path: Some(path),
            identifier,
            device: None,
            mount_points: Vec::new(),
            state: LifecycleState::Detached,
        }
    }

    pub fn from_device(path: Option<PathBuf>, device: &BlockDevice) -> Self {
        Self {
            path,
            identifier: device.identifier.clone(),
            device: Some(device.name.clone()),
            mount_points: device.mount_points.clone(),
            state: LifecycleState::of_device(device),
        }
    }

    pub fn is_mounted_at(&self, target: &Path) -> bool {
        self.mount_points.iter().any(|mp| mp == target)
    }

    /// Human-readable subject for error messages.
    pub fn subject(&self) -> String {
        if let Some(path) = &self.path {
            format!("path {}", path.display())
        } else if let Some(id) = &self.identifier {
            format!("identifier {}", id)
        } else if let Some(device) = &self.device {
            format!("device {}", device)
        } else {
            "unknown disk".to_string()
        }
    }
}
