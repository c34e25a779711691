//! Best-effort cleanup of images attached by an operation that did not
//! finish (error path or Ctrl+C / SIGTERM).

use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use vdisk_hal::{DiskHal, HalResult};

static HANDLER_SET: OnceLock<()> = OnceLock::new();

/// Exit status after an interrupt (128 + SIGINT).
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Clone)]
pub struct CleanupRegistry {
    hal: Arc<dyn DiskHal>,
    timeout: Duration,
    pending: Arc<Mutex<Vec<PathBuf>>>,
    cancelled: Arc<AtomicBool>,
}

impl CleanupRegistry {
    pub fn new(hal: Arc<dyn DiskHal>, timeout: Duration) -> Self {
        Self {
            hal,
            timeout,
            pending: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        // Cleanup must still run after a panic elsewhere.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, image: &Path) {
        let mut pending = self.lock();
        if !pending.iter().any(|p| p == image) {
            debug!("🧷 Cleanup registered for {}", image.display());
            pending.push(image.to_path_buf());
        }
    }

    pub fn unregister(&self, image: &Path) {
        self.lock().retain(|p| p != image);
    }

    pub fn pending(&self) -> Vec<PathBuf> {
        self.lock().clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Detach one registered image now and forget it. Failures are logged.
    pub fn release(&self, image: &Path) {
        self.unregister(image);
        if let Err(err) = self.detach_best_effort(image) {
            warn!("⚠️ Cleanup of {} failed: {}", image.display(), err);
        }
    }

    /// Detach everything still registered. Returns how many images were
    /// detached; failures are logged and swallowed.
    pub fn run(&self) -> usize {
        let images = std::mem::take(&mut *self.lock());
        let mut detached = 0;
        for image in images.iter().rev() {
            match self.detach_best_effort(image) {
                Ok(true) => detached += 1,
                Ok(false) => {}
                Err(err) => warn!("⚠️ Cleanup of {} failed: {}", image.display(), err),
            }
        }
        detached
    }

    fn detach_best_effort(&self, image: &Path) -> HalResult<bool> {
        let Some(device) = self.hal.attached_device(image)? else {
            debug!("Cleanup: {} is not attached", image.display());
            return Ok(false);
        };
        let mounts = self
            .hal
            .list_devices()?
            .into_iter()
            .find(|d| d.name == device)
            .map(|d| d.mount_points)
            .unwrap_or_default();
        for target in mounts {
            if let Err(err) = self.hal.unmount(&target) {
                warn!("⚠️ Cleanup could not unmount {}: {}", target.display(), err);
            }
        }
        self.hal.detach(image, self.timeout)?;
        info!("🧹 Detached {} ({}) during cleanup", image.display(), device);
        Ok(true)
    }
}

/// Route SIGINT/SIGTERM into the registry. Installed once per process.
pub fn install_signal_handler(registry: CleanupRegistry) -> anyhow::Result<()> {
    if HANDLER_SET.get().is_some() {
        return Ok(());
    }

    ctrlc::set_handler(move || {
        log::warn!("Interrupted; cleaning up.");
        registry.cancel();
        registry.run();
        std::process::exit(INTERRUPTED_EXIT_CODE);
    })?;

    let _ = HANDLER_SET.set(());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vdisk_hal::{AttachOps, FakeHal, FormatOps, ImageOps, MountOps, MountOptions, ProbeOps};

    fn registry(hal: &FakeHal) -> CleanupRegistry {
        CleanupRegistry::new(Arc::new(hal.clone()), Duration::from_secs(5))
    }

    #[test]
    fn run_detaches_registered_images() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        let img = dir.path().join("a.img");
        hal.create_image(&img, 1 << 20).unwrap();
        hal.attach(&img, "a").unwrap();

        let cleanup = registry(&hal);
        cleanup.register(&img);
        cleanup.register(&img);
        assert_eq!(cleanup.pending().len(), 1);

        assert_eq!(cleanup.run(), 1);
        assert!(hal.attached_device(&img).unwrap().is_none());
        assert!(cleanup.pending().is_empty());
    }

    #[test]
    fn run_unmounts_before_detaching() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        let img = dir.path().join("a.img");
        hal.create_image(&img, 1 << 20).unwrap();
        hal.attach(&img, "a").unwrap();
        let device = hal.attached_device(&img).unwrap().unwrap();
        let id = hal
            .format(&device, "ext4", &vdisk_hal::FormatOptions::new(true))
            .unwrap();
        let target = dir.path().join("mnt");
        hal.mount(&id, &target, &MountOptions::new()).unwrap();

        let cleanup = registry(&hal);
        cleanup.register(&img);
        assert_eq!(cleanup.run(), 1);
        assert!(!hal.is_mounted(&target).unwrap());
        assert_eq!(hal.list_devices().unwrap().len(), 3);
    }

    #[test]
    fn failures_are_swallowed() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        let img = dir.path().join("a.img");
        hal.create_image(&img, 1 << 20).unwrap();
        hal.attach(&img, "a").unwrap();
        hal.set_detach_timeout(true);

        let cleanup = registry(&hal);
        cleanup.register(&img);
        cleanup.register(&dir.path().join("never-attached.img"));
        assert_eq!(cleanup.run(), 0);
        assert!(cleanup.pending().is_empty());
    }

    #[test]
    fn unregistered_images_are_left_alone() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        let img = dir.path().join("a.img");
        hal.create_image(&img, 1 << 20).unwrap();
        hal.attach(&img, "a").unwrap();

        let cleanup = registry(&hal);
        cleanup.register(&img);
        cleanup.unregister(&img);
        assert_eq!(cleanup.run(), 0);
        assert!(hal.attached_device(&img).unwrap().is_some());
    }
}
