//! Grow a mounted disk by migrating its contents to a larger image.
//!
//! The original is never modified: it stays mounted until the copy on the
//! new image has been verified, and afterwards it is kept as a backup file.

use crate::config::Config;
use crate::errors::{DiskError, Result};
use crate::lifecycle::resolver::absolute;
use crate::lifecycle::{DiskManager, DiskStatus, LifecycleState};
use crate::tracking::now_unix_secs;
use anyhow::Context;
use log::{debug, info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use vdisk_hal::{CopyOptions, CopyProgress};
use walkdir::WalkDir;

const PROGRESS_LOG_EVERY: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePlan {
    pub data_bytes: u64,
    pub requested_bytes: u64,
    pub target_bytes: u64,
    pub size_substituted: bool,
}

impl ResizePlan {
    pub fn new(config: &Config, requested_bytes: u64, data_bytes: u64) -> Self {
        let minimum = config.minimum_resize_bytes(data_bytes);
        Self {
            data_bytes,
            requested_bytes,
            target_bytes: requested_bytes.max(minimum),
            size_substituted: requested_bytes < minimum,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeReport {
    pub image: PathBuf,
    pub mount_point: PathBuf,
    pub backup_path: PathBuf,
    pub old_identifier: Option<String>,
    pub new_identifier: Option<String>,
    pub data_bytes: u64,
    pub requested_bytes: u64,
    pub target_bytes: u64,
    pub size_substituted: bool,
    pub file_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Regular files and symlinks; directories are not counted.
    pub files: u64,
    /// Bytes in regular files.
    pub bytes: u64,
}

pub fn tree_stats(root: &Path) -> Result<TreeStats> {
    let mut stats = TreeStats::default();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let file_type = entry.file_type();
        if file_type.is_file() {
            stats.files += 1;
            stats.bytes += entry
                .metadata()
                .with_context(|| format!("Failed to stat {}", entry.path().display()))?
                .len();
        } else if file_type.is_symlink() {
            stats.files += 1;
        }
    }
    Ok(stats)
}

/// `<file>.bak`, or `<file>.bak.<unix-ts>` when that is taken.
pub fn backup_path(image: &Path) -> PathBuf {
    let name = file_name(image);
    let plain = image.with_file_name(format!("{}.bak", name));
    if !plain.exists() {
        return plain;
    }
    let stamp = now_unix_secs();
    let stamped = image.with_file_name(format!("{}.bak.{}", name, stamp));
    if !stamped.exists() {
        return stamped;
    }
    (1..)
        .map(|n| image.with_file_name(format!("{}.bak.{}.{}", name, stamp, n)))
        .find(|p| !p.exists())
        .unwrap_or(stamped)
}

/// Staging image and its temporary mount point, both beside the original.
pub fn staging_paths(image: &Path) -> (PathBuf, PathBuf) {
    let name = file_name(image);
    (
        image.with_file_name(format!("{}.resize-new", name)),
        image.with_file_name(format!(".{}.resize-mnt", name)),
    )
}

fn file_name(image: &Path) -> String {
    image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "disk.img".to_string())
}

impl DiskManager {
    pub fn resize(&self, mount_point: &Path, requested_bytes: u64) -> Result<ResizeReport> {
        let mount_point = absolute(mount_point);
        let source = self.resolver().resolve_mount_point(&mount_point)?;
        let subject = format!("mount point {}", mount_point.display());
        if source.state != LifecycleState::Mounted || !source.is_mounted_at(&mount_point) {
            return Err(DiskError::invalid(
                "resize",
                subject,
                source.state,
                "it must be mounted there to be resized",
            )
            .into());
        }
        let image = source.path.clone().ok_or_else(|| {
            DiskError::invalid(
                "resize",
                &subject,
                source.state,
                "its backing image is unknown",
            )
        })?;

        let before = tree_stats(&mount_point)?;
        let plan = ResizePlan::new(self.config(), requested_bytes, before.bytes);
        if plan.size_substituted {
            warn!(
                "⚠️ Requested {} bytes is too small for {} bytes of data; using {} bytes",
                plan.requested_bytes, plan.data_bytes, plan.target_bytes
            );
        }

        let (staged, staging_mount) = staging_paths(&image);
        if staged.exists() {
            return Err(DiskError::invalid(
                "resize",
                &subject,
                source.state,
                format!(
                    "a staging image from an earlier resize exists at {}; remove it first",
                    staged.display()
                ),
            )
            .into());
        }

        let fs_type = self.source_fs_type(&source);
        info!(
            "📏 Resizing {} ({} files, {} bytes) into {} bytes of {}",
            image.display(),
            before.files,
            before.bytes,
            plan.target_bytes,
            fs_type
        );

        let prepared = self
            .stage_image(&staged, &staging_mount, plan.target_bytes, &fs_type)
            .and_then(|new_status| {
                self.copy_and_verify(&mount_point, &staging_mount, before.files)?;
                Ok(new_status)
            });
        let new_status = match prepared {
            Ok(status) => status,
            Err(err) => {
                self.discard_staging(&staged, &staging_mount);
                return Err(err);
            }
        };

        let (backup, swapped) =
            self.swap_in(&source, &image, &staged, &staging_mount, &new_status, &mount_point)?;

        info!(
            "✅ {} resized; original kept at {}",
            image.display(),
            backup.display()
        );
        Ok(ResizeReport {
            image,
            mount_point,
            backup_path: backup,
            old_identifier: source.identifier,
            new_identifier: swapped.identifier,
            data_bytes: plan.data_bytes,
            requested_bytes: plan.requested_bytes,
            target_bytes: plan.target_bytes,
            size_substituted: plan.size_substituted,
            file_count: before.files,
        })
    }

    fn source_fs_type(&self, source: &DiskStatus) -> String {
        let probed = source.device.as_deref().and_then(|name| {
            self.hal()
                .list_devices()
                .ok()?
                .into_iter()
                .find(|d| d.name == name)
                .and_then(|d| d.fs_type)
        });
        probed.unwrap_or_else(|| self.config().default_fs_type.clone())
    }

    fn stage_image(
        &self,
        staged: &Path,
        staging_mount: &Path,
        size_bytes: u64,
        fs_type: &str,
    ) -> Result<DiskStatus> {
        self.hal()
            .create_image(staged, size_bytes)
            .map_err(|e| DiskError::external("resize", staged.display(), e))?;
        self.cleanup().register(staged);

        let attached = self.attach_image(staged)?;
        let formatted = self.format_device(&attached, fs_type)?;
        fs::create_dir_all(staging_mount).with_context(|| {
            format!("Failed to create staging mount {}", staging_mount.display())
        })?;
        self.mount_device(&formatted, staging_mount)
    }

    fn copy_and_verify(&self, src: &Path, dst: &Path, expected_files: u64) -> Result<()> {
        info!("📦 Copying {} -> {}", src.display(), dst.display());
        let cleanup = self.cleanup().clone();
        let mut next_log = PROGRESS_LOG_EVERY;
        let mut on_progress = |progress: CopyProgress| {
            if progress.files_copied >= next_log {
                debug!(
                    "Copied {}/{} files ({} bytes)",
                    progress.files_copied, progress.files_total, progress.bytes_copied
                );
                next_log += PROGRESS_LOG_EVERY;
            }
            !cleanup.is_cancelled()
        };
        self.hal()
            .copy_tree(src, dst, &CopyOptions::archive(), &mut on_progress)
            .map_err(|e| DiskError::external("resize", src.display(), e))?;

        let after = tree_stats(dst)?;
        if after.files != expected_files {
            return Err(DiskError::IntegrityFailure {
                operation: "resize",
                subject: src.display().to_string(),
                expected: expected_files,
                actual: after.files,
            }
            .into());
        }
        debug!("🔍 Verified {} files at {}", after.files, dst.display());
        Ok(())
    }

    /// Best-effort removal of a staging image that will not be used.
    fn discard_staging(&self, staged: &Path, staging_mount: &Path) {
        if self.hal().is_mounted(staging_mount).unwrap_or(false) {
            if let Err(err) = self.hal().unmount(staging_mount) {
                warn!("⚠️ Could not unmount {}: {}", staging_mount.display(), err);
            }
        }
        self.cleanup().release(staged);
        if staged.exists() {
            if let Err(err) = self.hal().remove_image(staged) {
                warn!("⚠️ Could not remove {}: {}", staged.display(), err);
            }
        }
        if let Err(err) = self.store().remove(staged) {
            warn!("⚠️ Could not drop record for {}: {:#}", staged.display(), err);
        }
        self.remove_staging_mount(staging_mount);
    }

    fn remove_staging_mount(&self, staging_mount: &Path) {
        if !staging_mount.exists() {
            return;
        }
        if self.hal().is_mounted(staging_mount).unwrap_or(true) {
            warn!(
                "⚠️ {} is still mounted; leaving it in place",
                staging_mount.display()
            );
            return;
        }
        if let Err(err) = fs::remove_dir_all(staging_mount) {
            warn!("⚠️ Could not remove {}: {}", staging_mount.display(), err);
        }
    }

    /// Put the original back online after a failed swap.
    fn restore_original(&self, image: &Path, mount_point: &Path) {
        let result = (|| -> Result<()> {
            let mut status = self.resolver().resolve_path(image)?;
            if status.state == LifecycleState::Detached {
                status = self.attach_image(image)?;
            }
            if status.state == LifecycleState::AttachedFormatted {
                self.mount_device(&status, mount_point)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => info!("↩️ Restored {} at {}", image.display(), mount_point.display()),
            Err(err) => warn!(
                "⚠️ Could not restore {} at {}: {:#}",
                image.display(),
                mount_point.display(),
                err
            ),
        }
    }

    fn swap_in(
        &self,
        source: &DiskStatus,
        image: &Path,
        staged: &Path,
        staging_mount: &Path,
        staged_status: &DiskStatus,
        mount_point: &Path,
    ) -> Result<(PathBuf, DiskStatus)> {
        // Staging image offline.
        let offline = self
            .unmount_all(staged_status)
            .and_then(|s| self.detach_image(staged, &s));
        if let Err(err) = offline {
            self.discard_staging(staged, staging_mount);
            return Err(err);
        }
        self.store().remove(staged)?;
        self.remove_staging_mount(staging_mount);

        // Original offline.
        let offline = self
            .unmount_all(source)
            .and_then(|s| self.detach_image(image, &s));
        if let Err(err) = offline {
            self.restore_original(image, mount_point);
            self.discard_staging(staged, staging_mount);
            return Err(err.context("resize: could not take the original offline"));
        }

        let backup = backup_path(image);
        if let Err(err) = self.hal().rename_image(image, &backup) {
            self.restore_original(image, mount_point);
            self.discard_staging(staged, staging_mount);
            return Err(DiskError::external("resize", image.display(), err).into());
        }
        if let Err(err) = self.hal().rename_image(staged, image) {
            match self.hal().rename_image(&backup, image) {
                Ok(()) => {
                    self.restore_original(image, mount_point);
                    self.discard_staging(staged, staging_mount);
                }
                Err(back) => warn!(
                    "⚠️ Could not move {} back: {}",
                    backup.display(),
                    back
                ),
            }
            return Err(anyhow::Error::from(DiskError::external(
                "resize",
                staged.display(),
                err,
            ))
            .context(format!(
                "resize: swap failed; original preserved at {}",
                backup.display()
            )));
        }

        // New image online where the old one was.
        self.cleanup().register(image);
        let online = self
            .attach_image(image)
            .and_then(|s| self.mount_device(&s, mount_point));
        match online {
            Ok(status) => {
                self.cleanup().unregister(image);
                Ok((backup, status))
            }
            Err(err) => {
                self.cleanup().release(image);
                Err(err.context(format!(
                    "resize: {} holds the migrated data but could not be mounted; original preserved at {}",
                    image.display(),
                    backup.display()
                )))
            }
        }
    }
}
