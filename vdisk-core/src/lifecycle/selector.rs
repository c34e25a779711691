use std::fmt;
use std::path::PathBuf;

/// The four ways a caller can name a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSelector {
    ByPath(PathBuf),
    ByIdentifier(String),
    ByDeviceName(String),
    ByMountPoint(PathBuf),
}

impl DiskSelector {
    /// Accepts `/dev/sdd` as well as `sdd`.
    pub fn device(name: &str) -> Self {
        DiskSelector::ByDeviceName(name.trim_start_matches("/dev/").to_string())
    }
}

impl fmt::Display for DiskSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskSelector::ByPath(path) => write!(f, "path {}", path.display()),
            DiskSelector::ByIdentifier(id) => write!(f, "identifier {}", id),
            DiskSelector::ByDeviceName(name) => write!(f, "device {}", name),
            DiskSelector::ByMountPoint(mp) => write!(f, "mount point {}", mp.display()),
        }
    }
}
