//! Identity resolution: turn a selector into a live `DiskStatus`.
//!
//! The probe is the source of truth. The store supplies what the probe
//! cannot know (which image backs which identifier) and is corrected
//! whenever it disagrees with what is live.

use super::selector::DiskSelector;
use super::state::{DiskStatus, LifecycleState};
use crate::config::Config;
use crate::errors::{DiskError, Result};
use crate::snapshot::{Discovery, SnapshotService};
use crate::tracking::{normalize_path, DiskImageRecord, TrackingStore};
use log::{debug, info};
use std::path::{Path, PathBuf};
use vdisk_hal::{BlockDevice, DiskHal};

pub struct Resolver<'a> {
    hal: &'a dyn DiskHal,
    store: &'a TrackingStore,
    config: &'a Config,
}

/// Absolute form of a user-supplied path; relative paths are taken from the
/// current directory.
pub fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

impl<'a> Resolver<'a> {
    pub fn new(hal: &'a dyn DiskHal, store: &'a TrackingStore, config: &'a Config) -> Self {
        Self { hal, store, config }
    }

    pub fn resolve(&self, selector: &DiskSelector) -> Result<DiskStatus> {
        debug!("🔎 Resolving {}", selector);
        match selector {
            DiskSelector::ByPath(path) => self.resolve_path(&absolute(path)),
            DiskSelector::ByIdentifier(id) => self.resolve_identifier(id),
            DiskSelector::ByDeviceName(name) => self.resolve_device(name),
            DiskSelector::ByMountPoint(mp) => self.resolve_mount_point(&absolute(mp)),
        }
    }

    /// Resolve `selector`, or with no selector fall back to the sole
    /// untracked dynamic disk.
    pub fn resolve_or_discover(
        &self,
        operation: &'static str,
        selector: Option<&DiskSelector>,
    ) -> Result<DiskStatus> {
        match selector {
            Some(selector) => self.resolve(selector),
            None => self.resolve_untracked(operation),
        }
    }

    fn devices(&self, operation: &'static str, subject: &dyn std::fmt::Display) -> Result<Vec<BlockDevice>> {
        self.hal
            .list_devices()
            .map_err(|e| DiskError::external(operation, subject, e).into())
    }

    pub fn resolve_path(&self, path: &Path) -> Result<DiskStatus> {
        let record = self.store.get(path)?;

        if !path.exists() {
            if record.is_some() {
                info!("🧹 {} no longer exists; dropping its record", path.display());
                self.store.remove(path)?;
            }
            return Ok(DiskStatus::absent(
                Some(path.to_path_buf()),
                record.and_then(|r| r.identifier),
            ));
        }

        let subject = path.display();
        let devices = self.devices("resolve", &subject)?;
        let live = self
            .hal
            .attached_device(path)
            .map_err(|e| DiskError::external("resolve", &subject, e))?;

        let device = match live {
            Some(name) => devices.iter().find(|d| d.name == name),
            None => None,
        };

        match device {
            None => {
                if let Some(rec) = &record {
                    if self.store.clear_attachment(&rec.normalized_path)? {
                        info!(
                            "🧹 {} was detached outside vdisk; record corrected",
                            path.display()
                        );
                    }
                }
                Ok(DiskStatus::detached(
                    path.to_path_buf(),
                    record.and_then(|r| r.identifier),
                ))
            }
            Some(dev) => {
                let status = DiskStatus::from_device(Some(path.to_path_buf()), dev);
                self.reconcile(path, record.as_ref(), &status)?;
                Ok(status)
            }
        }
    }

    /// Bring the record for an attached image in line with the probe.
    fn reconcile(&self, path: &Path, record: Option<&DiskImageRecord>, status: &DiskStatus) -> Result<()> {
        let in_sync = record.is_some_and(|r| {
            r.identifier == status.identifier
                && r.device_name == status.device
                && r.mount_points == status.mount_points
        });
        if in_sync {
            return Ok(());
        }
        debug!("📝 Updating record for {}", path.display());
        self.store.save(
            path,
            status.identifier.as_deref(),
            None,
            status.device.as_deref(),
        )?;
        self.store.update_mount_points(path, &status.mount_points)?;
        Ok(())
    }

    pub fn resolve_identifier(&self, identifier: &str) -> Result<DiskStatus> {
        let record = self.store.get_by_identifier(identifier)?;
        if let Some(path) = record.as_ref().and_then(|r| r.image_path()) {
            let status = self.resolve_path(path)?;
            // The image may have been reformatted since the record was written.
            if status.identifier.as_deref() == Some(identifier) || !status.state.is_attached() {
                return Ok(status);
            }
        }

        let subject = format!("identifier {}", identifier);
        let devices = self.devices("resolve", &subject)?;
        match devices
            .iter()
            .find(|d| d.identifier.as_deref() == Some(identifier))
        {
            Some(dev) => {
                // Attached, but the image behind it is unknown.
                let image = match record.as_ref().and_then(|r| r.image_path()) {
                    Some(path) if self.hal.attached_device(path).ok().flatten().as_deref() == Some(dev.name.as_str()) => {
                        Some(path.to_path_buf())
                    }
                    _ => None,
                };
                if image.is_none() {
                    self.store
                        .save_discovered(identifier, Some(&dev.name), &dev.mount_points)?;
                }
                Ok(DiskStatus::from_device(image, dev))
            }
            None => {
                if let Some(rec) = record.filter(|r| r.auto_discovered) {
                    info!("🧹 Placeholder {} is gone; dropping it", rec.normalized_path);
                    self.store.remove_key(&rec.normalized_path)?;
                }
                Ok(DiskStatus::absent(None, Some(identifier.to_string())))
            }
        }
    }

    pub fn resolve_device(&self, name: &str) -> Result<DiskStatus> {
        let name = name.trim_start_matches("/dev/");
        let subject = format!("device {}", name);
        let devices = self.devices("resolve", &subject)?;
        let Some(dev) = devices.iter().find(|d| d.name == name) else {
            if let Some(rec) = self.store.get_by_device_name(name)? {
                self.store.clear_attachment(&rec.normalized_path)?;
            }
            let mut status = DiskStatus::absent(None, None);
            status.device = Some(name.to_string());
            return Ok(status);
        };

        // Which image is behind this device? Ask the store, then confirm live.
        let candidates = [
            dev.identifier
                .as_deref()
                .map(|id| self.store.get_by_identifier(id))
                .transpose()?
                .flatten(),
            self.store.get_by_device_name(name)?,
        ];
        for record in candidates.into_iter().flatten() {
            if let Some(path) = record.image_path() {
                if self.hal.attached_device(path).ok().flatten().as_deref() == Some(name) {
                    return self.resolve_path(path);
                }
            }
        }

        match &dev.identifier {
            Some(id) => {
                self.store
                    .save_discovered(id, Some(&dev.name), &dev.mount_points)?;
                Ok(DiskStatus::from_device(None, dev))
            }
            None => Ok(DiskStatus::from_device(None, dev)),
        }
    }

    pub fn resolve_mount_point(&self, mount_point: &Path) -> Result<DiskStatus> {
        let subject = format!("mount point {}", mount_point.display());
        let devices = self.devices("resolve", &subject)?;
        if let Some(dev) = devices
            .iter()
            .find(|d| d.mount_points.iter().any(|mp| mp == mount_point))
        {
            return self.resolve_device(&dev.name);
        }

        // Nothing is mounted there now; report what the record points at.
        match self.store.get_by_mount_point(mount_point)? {
            Some(rec) => match rec.image_path() {
                Some(path) => self.resolve_path(path),
                None => {
                    self.store.remove_key(&rec.normalized_path)?;
                    Ok(DiskStatus::absent(None, rec.identifier))
                }
            },
            None => Ok(DiskStatus::absent(None, None)),
        }
    }

    /// No selector: the subject is the one dynamic disk nothing tracks.
    pub fn resolve_untracked(&self, operation: &'static str) -> Result<DiskStatus> {
        let records = self.store.list_all()?;
        let service = SnapshotService::new(self.hal);
        let discovery = service
            .sole_untracked_dynamic_device(&records, &self.config.dynamic_device_pattern)
            .map_err(|e| DiskError::external(operation, "untracked dynamic disks", e))?;
        match discovery {
            Discovery::Found(name) => {
                info!("🔎 Using the only untracked dynamic disk: {}", name);
                self.resolve_device(&name)
            }
            Discovery::Nothing => Err(DiskError::not_found(operation, "an untracked dynamic disk").into()),
            Discovery::Ambiguous(candidates) => Err(DiskError::AmbiguousIdentity {
                operation,
                subject: "untracked dynamic disks".to_string(),
                candidates,
            }
            .into()),
        }
    }

    /// Status for every record plus every untracked dynamic disk, after
    /// evicting records whose image vanished.
    pub fn resolve_all(&self) -> Result<Vec<DiskStatus>> {
        for evicted in self.store.cleanup_non_existent()? {
            info!("🧹 Evicted {} (image no longer exists)", evicted.normalized_path);
        }

        let mut statuses = Vec::new();
        for record in self.store.list_all()? {
            let status = match (record.image_path(), &record.identifier) {
                (Some(path), _) => self.resolve_path(path)?,
                (None, Some(id)) => self.resolve_identifier(id)?,
                (None, None) => continue,
            };
            if status.state != LifecycleState::Absent {
                statuses.push(status);
            }
        }

        let records = self.store.list_all()?;
        let untracked = SnapshotService::new(self.hal)
            .untracked_dynamic_devices(&records, &self.config.dynamic_device_pattern)
            .map_err(|e| DiskError::external("status", "dynamic disks", e))?;
        for dev in untracked {
            statuses.push(DiskStatus::from_device(None, &dev));
        }

        statuses.sort_by_key(|s| {
            (
                s.path.as_deref().map(normalize_path),
                s.device.clone(),
            )
        });
        statuses.dedup();
        Ok(statuses)
    }
}
