//! Fake HAL implementation for testing.
//!
//! Images are real files (so renames, deletes and existence checks behave like
//! production), but devices, identifiers and mounts are simulated in memory.
//! A "formatted" image carries a small header holding its filesystem type and
//! identifier, so identity survives detach, reattach and rename. Attached
//! images get `sdX` names starting at `sdd`, like dynamic disks in a nested
//! VM; `sda`..`sdc` are permanent system volumes.

use super::image_ops::{create_sparse_file, rename_no_clobber};
use super::{
    copy_tree_native, AttachOps, AttachOutcome, BlockDevice, CopyOps, CopyOptions, CopyProgress,
    FormatOps, FormatOptions, ImageOps, MountOps, MountOptions, ProbeOps,
};
use crate::{HalError, HalResult};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

/// Permanent system volumes present on every FakeHal.
pub const FAKE_SYSTEM_DEVICES: [(&str, &str); 3] = [
    ("sda", "5d1b7e9a-0000-4000-8000-00000000000a"),
    ("sdb", "5d1b7e9a-0000-4000-8000-00000000000b"),
    ("sdc", "5d1b7e9a-0000-4000-8000-00000000000c"),
];

const HEADER_MAGIC: &str = "VDISKFAKEFS";
const HEADER_LEN: usize = 128;

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Attach {
        image: PathBuf,
        device: String,
    },
    Detach {
        image: PathBuf,
        device: String,
    },
    Format {
        device: String,
        fs_type: String,
        identifier: String,
    },
    Mount {
        identifier: String,
        target: PathBuf,
        options: Option<String>,
    },
    Unmount {
        target: PathBuf,
    },
    CopyTree {
        src: PathBuf,
        dst: PathBuf,
    },
    CreateImage {
        path: PathBuf,
        size_bytes: u64,
    },
    RemoveImage {
        path: PathBuf,
    },
    RenameImage {
        from: PathBuf,
        to: PathBuf,
    },
}

#[derive(Debug, Clone)]
struct FakeDevice {
    /// Backing image as (path at attach time, inode). Inode matching keeps
    /// identity stable across renames, as losetup does.
    image: Option<(PathBuf, u64)>,
    /// Identifier for devices without a backing image (system/foreign disks).
    identifier: Option<String>,
    fs_type: Option<String>,
    mount_points: Vec<PathBuf>,
}

#[derive(Debug, Default)]
struct FakeHalState {
    operations: Vec<Operation>,
    devices: BTreeMap<String, FakeDevice>,
    identifiers_issued: u64,
    detach_times_out: bool,
    mount_fails: bool,
    copy_drops: usize,
    appear_on_next_attach: Vec<(String, Option<String>)>,
    misreported_format_id: Option<String>,
}

/// Fake HAL implementation that simulates devices without touching the kernel.
#[derive(Debug, Clone)]
pub struct FakeHal {
    state: Arc<Mutex<FakeHalState>>,
}

impl Default for FakeHal {
    fn default() -> Self {
        Self::new()
    }
}

fn inode(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.ino())
}

fn read_header(path: &Path) -> Option<(String, String)> {
    let mut buf = [0u8; HEADER_LEN];
    let mut file = fs::File::open(path).ok()?;
    let n = file.read(&mut buf).ok()?;
    let text = std::str::from_utf8(&buf[..n]).ok()?;
    let line = text.split('\n').next()?;
    let mut parts = line.splitn(3, ':');
    if parts.next()? != HEADER_MAGIC {
        return None;
    }
    let fs_type = parts.next()?.to_string();
    let identifier = parts.next()?.to_string();
    Some((fs_type, identifier))
}

fn write_header(path: &Path, fs_type: &str, identifier: &str) -> HalResult<()> {
    let line = format!("{}:{}:{}\n", HEADER_MAGIC, fs_type, identifier);
    let mut file = fs::OpenOptions::new().write(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn dynamic_name(index: usize) -> String {
    // sdd..sdz, then sdaa, sdab, ...
    let letters: Vec<char> = ('a'..='z').collect();
    let slot = index + 3;
    if slot < 26 {
        format!("sd{}", letters[slot])
    } else {
        let rest = slot - 26;
        format!("sd{}{}", letters[(rest / 26) % 26], letters[rest % 26])
    }
}

impl FakeHalState {
    fn device_for_image(&self, image: &Path) -> Option<String> {
        let ino = inode(image)?;
        self.devices
            .iter()
            .find(|(_, d)| d.image.as_ref().map(|(_, i)| *i) == Some(ino))
            .map(|(name, _)| name.clone())
    }

    fn free_name(&self) -> String {
        (0..)
            .map(dynamic_name)
            .find(|name| !self.devices.contains_key(name))
            .unwrap_or_else(|| "sdzz".to_string())
    }

    fn identity(&self, device: &FakeDevice) -> (Option<String>, Option<String>) {
        match &device.image {
            Some((path, ino)) if inode(path) == Some(*ino) => match read_header(path) {
                Some((fs_type, id)) => (Some(id), Some(fs_type)),
                None => (None, None),
            },
            // The backing file was renamed; find it by inode next to the original.
            Some((path, ino)) => path
                .parent()
                .and_then(|dir| fs::read_dir(dir).ok())
                .and_then(|entries| {
                    entries
                        .flatten()
                        .find(|e| e.metadata().map(|m| m.ino()).ok() == Some(*ino))
                })
                .and_then(|e| read_header(&e.path()))
                .map(|(fs_type, id)| (Some(id), Some(fs_type)))
                .unwrap_or((None, None)),
            None => (device.identifier.clone(), device.fs_type.clone()),
        }
    }

    fn next_identifier(&mut self) -> String {
        self.identifiers_issued += 1;
        let n = self.identifiers_issued;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        format!(
            "{:08x}-{:04x}-4{:03x}-a{:03x}-{:012x}",
            (nanos >> 32) as u32,
            (nanos >> 16) as u16,
            n & 0xfff,
            nanos & 0xfff,
            n
        )
    }
}

impl FakeHal {
    pub fn new() -> Self {
        let mut state = FakeHalState::default();
        for (name, id) in FAKE_SYSTEM_DEVICES {
            state.devices.insert(
                name.to_string(),
                FakeDevice {
                    image: None,
                    identifier: Some(id.to_string()),
                    fs_type: Some("ext4".to_string()),
                    mount_points: Vec::new(),
                },
            );
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().unwrap().operations.clone()
    }

    /// Get the number of operations recorded.
    pub fn operation_count(&self) -> usize {
        self.state.lock().unwrap().operations.len()
    }

    /// Check if a specific operation was recorded.
    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.state.lock().unwrap().operations.iter().any(check)
    }

    /// Clear recorded operations (simulated devices are kept).
    pub fn clear_operations(&self) {
        self.state.lock().unwrap().operations.clear();
    }

    /// Make every following detach fail with a timeout.
    pub fn set_detach_timeout(&self, enabled: bool) {
        self.state.lock().unwrap().detach_times_out = enabled;
    }

    /// Make every following mount fail.
    pub fn set_mount_failure(&self, enabled: bool) {
        self.state.lock().unwrap().mount_fails = enabled;
    }

    /// Delete `count` files from the destination of the next copy.
    pub fn drop_files_on_next_copy(&self, count: usize) {
        self.state.lock().unwrap().copy_drops = count;
    }

    /// Simulate a disk attached by someone else, right now.
    pub fn attach_foreign(&self, name: &str, identifier: Option<&str>) {
        self.state.lock().unwrap().devices.insert(
            name.to_string(),
            FakeDevice {
                image: None,
                identifier: identifier.map(String::from),
                fs_type: identifier.map(|_| "ext4".to_string()),
                mount_points: Vec::new(),
            },
        );
    }

    /// Simulate a disk attached by someone else while our next attach runs.
    pub fn appear_on_next_attach(&self, name: &str, identifier: Option<&str>) {
        self.state
            .lock()
            .unwrap()
            .appear_on_next_attach
            .push((name.to_string(), identifier.map(String::from)));
    }

    /// Make the next format report `identifier` instead of the one it wrote.
    pub fn misreport_next_format(&self, identifier: &str) {
        self.state.lock().unwrap().misreported_format_id = Some(identifier.to_string());
    }

    /// Simulate the platform dropping a device behind our back.
    pub fn vanish(&self, name: &str) {
        self.state.lock().unwrap().devices.remove(name);
    }

    fn record_operation(&self, op: Operation) {
        self.state.lock().unwrap().operations.push(op);
    }
}

impl AttachOps for FakeHal {
    fn attach(&self, image: &Path, label: &str) -> HalResult<AttachOutcome> {
        let ino = inode(image).ok_or_else(|| {
            HalError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such image: {}", image.display()),
            ))
        })?;

        let mut state = self.state.lock().unwrap();
        if let Some(device) = state.device_for_image(image) {
            return Ok(AttachOutcome::AlreadyAttached { device });
        }

        let name = state.free_name();
        log::info!("FAKE HAL: attach {} ({}) -> {}", image.display(), label, name);
        state.devices.insert(
            name.clone(),
            FakeDevice {
                image: Some((image.to_path_buf(), ino)),
                identifier: None,
                fs_type: None,
                mount_points: Vec::new(),
            },
        );
        let foreign = std::mem::take(&mut state.appear_on_next_attach);
        for (foreign_name, identifier) in foreign {
            state.devices.insert(
                foreign_name,
                FakeDevice {
                    image: None,
                    fs_type: identifier.as_ref().map(|_| "ext4".to_string()),
                    identifier,
                    mount_points: Vec::new(),
                },
            );
        }
        state.operations.push(Operation::Attach {
            image: image.to_path_buf(),
            device: name,
        });

        // Like a nested VM's attach primitive, the fake does not report the device.
        Ok(AttachOutcome::Attached { device_hint: None })
    }

    fn detach(&self, image: &Path, timeout: Duration) -> HalResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.detach_times_out {
            return Err(HalError::CommandTimeout {
                program: "fake-detach".to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }

        let name = state
            .device_for_image(image)
            .ok_or_else(|| HalError::NotAttached(image.display().to_string()))?;
        if state
            .devices
            .get(&name)
            .is_some_and(|d| !d.mount_points.is_empty())
        {
            return Err(HalError::DeviceBusy);
        }

        log::info!("FAKE HAL: detach {} ({})", image.display(), name);
        state.devices.remove(&name);
        state.operations.push(Operation::Detach {
            image: image.to_path_buf(),
            device: name,
        });
        Ok(())
    }

    fn attached_device(&self, image: &Path) -> HalResult<Option<String>> {
        Ok(self.state.lock().unwrap().device_for_image(image))
    }
}

impl ProbeOps for FakeHal {
    fn list_devices(&self) -> HalResult<Vec<BlockDevice>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .devices
            .iter()
            .map(|(name, device)| {
                let (identifier, fs_type) = state.identity(device);
                BlockDevice {
                    name: name.clone(),
                    identifier,
                    fs_type,
                    mount_points: device.mount_points.clone(),
                }
            })
            .collect())
    }
}

impl FormatOps for FakeHal {
    fn format(&self, device: &str, fs_type: &str, opts: &FormatOptions) -> HalResult<String> {
        if !opts.confirmed {
            return Err(HalError::SafetyLock);
        }

        let mut state = self.state.lock().unwrap();
        let dev = state
            .devices
            .get(device)
            .cloned()
            .ok_or_else(|| HalError::ValidationFailed(format!("no such device: {}", device)))?;
        if !dev.mount_points.is_empty() {
            return Err(HalError::DeviceBusy);
        }
        let (path, _) = dev.image.ok_or_else(|| {
            HalError::ValidationFailed(format!("{} is not backed by an image", device))
        })?;

        let identifier = state.next_identifier();
        write_header(&path, fs_type, &identifier)?;
        log::info!("FAKE HAL: mkfs.{} {} -> {}", fs_type, device, identifier);
        state.operations.push(Operation::Format {
            device: device.to_string(),
            fs_type: fs_type.to_string(),
            identifier: identifier.clone(),
        });
        Ok(state.misreported_format_id.take().unwrap_or(identifier))
    }
}

impl MountOps for FakeHal {
    fn mount(&self, identifier: &str, target: &Path, options: &MountOptions) -> HalResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.mount_fails {
            return Err(HalError::Other("injected mount failure".to_string()));
        }
        if state
            .devices
            .values()
            .any(|d| d.mount_points.iter().any(|m| m == target))
        {
            return Err(HalError::DeviceBusy);
        }

        let name = state
            .devices
            .iter()
            .find(|(_, d)| state.identity(d).0.as_deref() == Some(identifier))
            .map(|(name, _)| name.clone())
            .ok_or_else(|| HalError::UnknownIdentifier(identifier.to_string()))?;

        fs::create_dir_all(target)?;
        log::info!("FAKE HAL: mount {} ({}) -> {}", name, identifier, target.display());
        if let Some(dev) = state.devices.get_mut(&name) {
            dev.mount_points.push(target.to_path_buf());
        }
        state.operations.push(Operation::Mount {
            identifier: identifier.to_string(),
            target: target.to_path_buf(),
            options: options.options.clone(),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> HalResult<()> {
        let mut state = self.state.lock().unwrap();
        let dev = state
            .devices
            .values_mut()
            .find(|d| d.mount_points.iter().any(|m| m == target))
            .ok_or(HalError::Nix(nix::errno::Errno::EINVAL))?;
        dev.mount_points.retain(|m| m != target);
        log::info!("FAKE HAL: unmount {}", target.display());
        state.operations.push(Operation::Unmount {
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn is_mounted(&self, path: &Path) -> HalResult<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .devices
            .values()
            .any(|d| d.mount_points.iter().any(|m| m == path)))
    }
}

impl CopyOps for FakeHal {
    fn copy_tree(
        &self,
        src: &Path,
        dst: &Path,
        opts: &CopyOptions,
        on_progress: &mut dyn FnMut(CopyProgress) -> bool,
    ) -> HalResult<()> {
        self.record_operation(Operation::CopyTree {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        });
        copy_tree_native(src, dst, opts, on_progress)?;

        let drops = std::mem::take(&mut self.state.lock().unwrap().copy_drops);
        if drops > 0 {
            let mut files: Vec<PathBuf> = WalkDir::new(dst)
                .into_iter()
                .flatten()
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .collect();
            files.sort();
            for file in files.into_iter().take(drops) {
                log::info!("FAKE HAL: dropping {} from copy", file.display());
                fs::remove_file(&file)?;
            }
        }
        Ok(())
    }
}

impl ImageOps for FakeHal {
    fn create_image(&self, path: &Path, size_bytes: u64) -> HalResult<()> {
        create_sparse_file(path, size_bytes)?;
        self.record_operation(Operation::CreateImage {
            path: path.to_path_buf(),
            size_bytes,
        });
        Ok(())
    }

    fn remove_image(&self, path: &Path) -> HalResult<()> {
        fs::remove_file(path)?;
        self.record_operation(Operation::RemoveImage {
            path: path.to_path_buf(),
        });
        Ok(())
    }

    fn rename_image(&self, from: &Path, to: &Path) -> HalResult<()> {
        rename_no_clobber(from, to)?;
        self.record_operation(Operation::RenameImage {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn image(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        create_sparse_file(&path, 1024 * 1024).unwrap();
        path
    }

    #[test]
    fn system_devices_are_present() {
        let hal = FakeHal::new();
        let ids = hal.list_identifiers().unwrap();
        assert_eq!(ids.len(), FAKE_SYSTEM_DEVICES.len());
    }

    #[test]
    fn attach_assigns_dynamic_names_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        let a = image(dir.path(), "a.img");
        let b = image(dir.path(), "b.img");

        assert_eq!(
            hal.attach(&a, "a").unwrap(),
            AttachOutcome::Attached { device_hint: None }
        );
        hal.attach(&b, "b").unwrap();
        assert_eq!(hal.attached_device(&a).unwrap().as_deref(), Some("sdd"));
        assert_eq!(hal.attached_device(&b).unwrap().as_deref(), Some("sde"));
        assert_eq!(
            hal.attach(&a, "a").unwrap(),
            AttachOutcome::AlreadyAttached {
                device: "sdd".to_string()
            }
        );
    }

    #[test]
    fn format_identity_survives_reattach_and_rename() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        let a = image(dir.path(), "a.img");

        hal.attach(&a, "a").unwrap();
        let id = hal.format("sdd", "ext4", &FormatOptions::new(true)).unwrap();
        assert_eq!(hal.device_for_identifier(&id).unwrap().as_deref(), Some("sdd"));

        hal.detach(&a, Duration::from_secs(1)).unwrap();
        assert_eq!(hal.device_for_identifier(&id).unwrap(), None);

        let renamed = dir.path().join("renamed.img");
        hal.rename_image(&a, &renamed).unwrap();
        hal.attach(&renamed, "renamed").unwrap();
        assert_eq!(hal.device_for_identifier(&id).unwrap().as_deref(), Some("sdd"));
    }

    #[test]
    fn mount_unmount_tracks_mount_points() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        let a = image(dir.path(), "a.img");
        let target = dir.path().join("mnt");

        hal.attach(&a, "a").unwrap();
        let id = hal.format("sdd", "ext4", &FormatOptions::new(true)).unwrap();
        hal.mount(&id, &target, &MountOptions::new()).unwrap();
        assert!(hal.is_mounted(&target).unwrap());
        assert_eq!(hal.mount_points_for_identifier(&id).unwrap(), vec![target.clone()]);

        // Busy while mounted.
        assert!(matches!(
            hal.detach(&a, Duration::from_secs(1)),
            Err(HalError::DeviceBusy)
        ));

        hal.unmount(&target).unwrap();
        assert!(!hal.is_mounted(&target).unwrap());
        assert!(hal.unmount(&target).is_err());
    }

    #[test]
    fn fake_hal_requires_confirmation() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        let a = image(dir.path(), "a.img");
        hal.attach(&a, "a").unwrap();

        let err = hal.format("sdd", "ext4", &FormatOptions::new(false)).unwrap_err();
        assert!(matches!(err, HalError::SafetyLock));
    }

    #[test]
    fn detach_timeout_is_injected() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        let a = image(dir.path(), "a.img");
        hal.attach(&a, "a").unwrap();
        hal.set_detach_timeout(true);

        let err = hal.detach(&a, Duration::from_secs(7)).unwrap_err();
        assert!(err.is_timeout());
        assert!(hal.attached_device(&a).unwrap().is_some());
    }

    #[test]
    fn foreign_devices_appear_with_next_attach() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        let a = image(dir.path(), "a.img");
        hal.appear_on_next_attach("sdx", Some("foreign-id"));

        hal.attach(&a, "a").unwrap();
        let names: Vec<String> = hal.list_devices().unwrap().into_iter().map(|d| d.name).collect();
        assert!(names.contains(&"sdx".to_string()));
        assert!(names.contains(&"sdd".to_string()));
    }

    #[test]
    fn copy_drops_are_applied_once() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        for i in 0..4 {
            fs::write(src.path().join(format!("f{}", i)), b"x").unwrap();
        }
        let hal = FakeHal::new();
        hal.drop_files_on_next_copy(2);
        hal.copy_tree(src.path(), dst.path(), &CopyOptions::archive(), &mut |_| true)
            .unwrap();
        assert_eq!(fs::read_dir(dst.path()).unwrap().count(), 2);

        let dst2 = tempdir().unwrap();
        hal.copy_tree(src.path(), dst2.path(), &CopyOptions::archive(), &mut |_| true)
            .unwrap();
        assert_eq!(fs::read_dir(dst2.path()).unwrap().count(), 4);
    }

    #[test]
    fn dynamic_names_roll_over() {
        assert_eq!(dynamic_name(0), "sdd");
        assert_eq!(dynamic_name(22), "sdz");
        assert_eq!(dynamic_name(23), "sdaa");
    }
}
