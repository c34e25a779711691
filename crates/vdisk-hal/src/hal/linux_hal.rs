//! Linux HAL implementation: loop devices, lsblk/blkid, mkfs and mount(2).

use super::{
    copy_tree_native, AttachOps, AttachOutcome, BlockDevice, CopyOps, CopyOptions, CopyProgress,
    FormatOps, FormatOptions, ImageOps, MountOps, MountOptions, ProbeOps,
};
use crate::lsblk::{parse_lsblk_json, LSBLK_COLUMNS};
use crate::process::stdout_with_timeout;
use crate::procfs::mountinfo::MountTable;
use crate::{HalError, HalResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Real HAL implementation for Linux systems.
#[derive(Debug, Clone, Default)]
pub struct LinuxHal;

impl LinuxHal {
    pub fn new() -> Self {
        Self
    }
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);
const FORMAT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const LOSETUP_TIMEOUT: Duration = Duration::from_secs(30);

fn dev_path(device: &str) -> PathBuf {
    if device.starts_with("/dev/") {
        PathBuf::from(device)
    } else {
        Path::new("/dev").join(device)
    }
}

fn device_name(raw: &str) -> String {
    raw.trim().trim_start_matches("/dev/").to_string()
}

fn map_nix_err(err: nix::errno::Errno) -> HalError {
    use nix::errno::Errno;
    match err {
        Errno::EBUSY => HalError::DeviceBusy,
        Errno::EACCES | Errno::EPERM => HalError::PermissionDenied,
        other => HalError::Nix(other),
    }
}

/// Wait for udev to publish new devices and identifiers. Missing udevadm is fine.
fn udev_settle() {
    let mut cmd = Command::new("udevadm");
    cmd.arg("settle");
    if let Err(err) = stdout_with_timeout("udevadm", &mut cmd, SETTLE_TIMEOUT) {
        log::debug!("udevadm settle skipped: {}", err);
    }
}

fn force_flag(fs_type: &str) -> Option<&'static str> {
    match fs_type {
        "ext2" | "ext3" | "ext4" => Some("-F"),
        "xfs" | "btrfs" => Some("-f"),
        _ => None,
    }
}

impl AttachOps for LinuxHal {
    fn attach(&self, image: &Path, label: &str) -> HalResult<AttachOutcome> {
        if let Some(device) = self.attached_device(image)? {
            return Ok(AttachOutcome::AlreadyAttached { device });
        }

        log::debug!("losetup attach {} ({})", image.display(), label);
        let mut cmd = Command::new("losetup");
        cmd.args(["--show", "-f"]).arg(image);
        let out = stdout_with_timeout("losetup", &mut cmd, LOSETUP_TIMEOUT)?;
        udev_settle();

        Ok(AttachOutcome::Attached {
            device_hint: Some(device_name(&out)).filter(|d| !d.is_empty()),
        })
    }

    fn detach(&self, image: &Path, timeout: Duration) -> HalResult<()> {
        let device = self
            .attached_device(image)?
            .ok_or_else(|| HalError::NotAttached(image.display().to_string()))?;

        let mut cmd = Command::new("losetup");
        cmd.arg("-d").arg(dev_path(&device));
        stdout_with_timeout("losetup", &mut cmd, timeout)?;
        Ok(())
    }

    fn attached_device(&self, image: &Path) -> HalResult<Option<String>> {
        if !image.exists() {
            return Ok(None);
        }
        let mut cmd = Command::new("losetup");
        cmd.args(["-n", "-O", "NAME", "-j"]).arg(image);
        let out = stdout_with_timeout("losetup", &mut cmd, LOSETUP_TIMEOUT)?;
        Ok(out.lines().next().map(device_name).filter(|d| !d.is_empty()))
    }
}

impl ProbeOps for LinuxHal {
    fn list_devices(&self) -> HalResult<Vec<BlockDevice>> {
        let mut cmd = Command::new("lsblk");
        cmd.args(["-J", "-o", LSBLK_COLUMNS]);
        let json = match stdout_with_timeout("lsblk", &mut cmd, PROBE_TIMEOUT) {
            Ok(json) => json,
            // util-linux < 2.37 has no MOUNTPOINTS column.
            Err(HalError::CommandFailed { .. }) => {
                let mut legacy = Command::new("lsblk");
                legacy.args(["-J", "-o", "NAME,UUID,FSTYPE,MOUNTPOINT"]);
                stdout_with_timeout("lsblk", &mut legacy, PROBE_TIMEOUT)?
            }
            Err(err) => return Err(err),
        };
        let mut devices = parse_lsblk_json(&json)?;

        // lsblk reads mounts from its own namespace view; fill gaps from ours.
        if let Ok(table) = MountTable::read() {
            for device in devices.iter_mut().filter(|d| d.mount_points.is_empty()) {
                device.mount_points = table.targets_of_device(&device.name);
            }
        }
        Ok(devices)
    }
}

impl FormatOps for LinuxHal {
    fn format(&self, device: &str, fs_type: &str, opts: &FormatOptions) -> HalResult<String> {
        if !opts.confirmed {
            return Err(HalError::SafetyLock);
        }

        let program = format!("mkfs.{}", fs_type);
        let mut args: Vec<String> = Vec::new();
        if let Some(flag) = force_flag(fs_type) {
            args.push(flag.to_string());
        }
        if let Some(label) = &opts.label {
            args.push("-L".to_string());
            args.push(label.clone());
        }
        args.push(dev_path(device).display().to_string());

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        stdout_with_timeout(&program, &mut cmd, FORMAT_TIMEOUT)?;
        udev_settle();

        // Low-level probe: bypasses the blkid cache, which still holds the old UUID.
        let mut probe = Command::new("blkid");
        probe
            .args(["-p", "-s", "UUID", "-o", "value"])
            .arg(dev_path(device));
        let uuid = stdout_with_timeout("blkid", &mut probe, PROBE_TIMEOUT)?;
        if uuid.is_empty() {
            return Err(HalError::Parse(format!("no UUID on {} after {}", device, program)));
        }
        Ok(uuid)
    }
}

impl MountOps for LinuxHal {
    fn mount(&self, identifier: &str, target: &Path, options: &MountOptions) -> HalResult<()> {
        let device = self
            .list_devices()?
            .into_iter()
            .find(|d| d.identifier.as_deref() == Some(identifier))
            .ok_or_else(|| HalError::UnknownIdentifier(identifier.to_string()))?;

        fs::create_dir_all(target)?;
        log::debug!(
            "mount /dev/{} ({}) -> {}",
            device.name,
            identifier,
            target.display()
        );

        let flags = nix::mount::MsFlags::empty();
        let data = options.options.as_deref();
        nix::mount::mount(
            Some(&dev_path(&device.name)),
            target,
            device.fs_type.as_deref(),
            flags,
            data,
        )
        .map_err(map_nix_err)?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> HalResult<()> {
        nix::mount::umount2(target, nix::mount::MntFlags::empty()).map_err(map_nix_err)?;
        Ok(())
    }

    fn is_mounted(&self, path: &Path) -> HalResult<bool> {
        Ok(MountTable::read()?.contains(path))
    }
}

impl CopyOps for LinuxHal {
    fn copy_tree(
        &self,
        src: &Path,
        dst: &Path,
        opts: &CopyOptions,
        on_progress: &mut dyn FnMut(CopyProgress) -> bool,
    ) -> HalResult<()> {
        copy_tree_native(src, dst, opts, on_progress)
    }
}

impl ImageOps for LinuxHal {}
