//! Lifecycle operations. Each one resolves its subject, checks the typed
//! guard for the transition, drives the HAL and records what it observed.

use super::resolver::{absolute, Resolver};
use super::selector::DiskSelector;
use super::state::{DiskStatus, Guard, LifecycleState, Rejection, Transition};
use crate::cleanup::CleanupRegistry;
use crate::config::Config;
use crate::errors::{DiskError, Result};
use crate::snapshot::{Discovery, SnapshotService};
use crate::tracking::{placeholder_key, TrackingStore};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vdisk_hal::{AttachOutcome, DiskHal, FormatOptions, HalError};

/// Successful result of a state-changing request. Asking for the state a
/// disk is already in is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Changed(DiskStatus),
    AlreadyInState(DiskStatus),
}

impl Outcome {
    pub fn status(&self) -> &DiskStatus {
        match self {
            Outcome::Changed(status) | Outcome::AlreadyInState(status) => status,
        }
    }

    pub fn into_status(self) -> DiskStatus {
        match self {
            Outcome::Changed(status) | Outcome::AlreadyInState(status) => status,
        }
    }

    pub fn changed(&self) -> bool {
        matches!(self, Outcome::Changed(_))
    }
}

pub struct DiskManager {
    hal: Arc<dyn DiskHal>,
    store: TrackingStore,
    config: Config,
    cleanup: CleanupRegistry,
}

/// Filesystem label derived from the image file name (fits ext4 and xfs).
pub fn image_label(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let label: String = stem
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(12)
        .collect();
    if label.is_empty() {
        "vdisk".to_string()
    } else {
        label
    }
}

impl DiskManager {
    pub fn new(hal: Arc<dyn DiskHal>, config: Config) -> Self {
        let cleanup = CleanupRegistry::new(hal.clone(), config.detach_timeout);
        Self::with_cleanup(hal, config, cleanup)
    }

    pub fn with_cleanup(hal: Arc<dyn DiskHal>, config: Config, cleanup: CleanupRegistry) -> Self {
        let store = TrackingStore::new(config.tracking_file.clone());
        Self {
            hal,
            store,
            config,
            cleanup,
        }
    }

    pub fn hal(&self) -> &dyn DiskHal {
        self.hal.as_ref()
    }

    pub fn store(&self) -> &TrackingStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cleanup(&self) -> &CleanupRegistry {
        &self.cleanup
    }

    pub fn resolver(&self) -> Resolver<'_> {
        Resolver::new(self.hal.as_ref(), &self.store, &self.config)
    }

    /// Run the guard for `transition`, turning rejections into errors.
    fn check(transition: Transition, status: &DiskStatus) -> Result<Guard> {
        let operation = transition.name();
        match status.state.require(transition) {
            Guard::Reject(Rejection::NotFound) => {
                Err(DiskError::not_found(operation, status.subject()).into())
            }
            Guard::Reject(Rejection::NotFormatted) => Err(DiskError::NotFormatted {
                operation,
                subject: status.subject(),
            }
            .into()),
            Guard::Reject(Rejection::Invalid(reason)) => {
                Err(DiskError::invalid(operation, status.subject(), status.state, reason).into())
            }
            guard => Ok(guard),
        }
    }

    fn required_path(transition: Transition, status: &DiskStatus) -> Result<PathBuf> {
        status.path.clone().ok_or_else(|| {
            DiskError::invalid(
                transition.name(),
                status.subject(),
                status.state,
                "its backing image is unknown; pass --path",
            )
            .into()
        })
    }

    fn touch(&self, status: &DiskStatus) -> Result<()> {
        if let Some(path) = &status.path {
            self.store.touch(path)?;
        }
        Ok(())
    }

    pub fn status(&self, selector: Option<&DiskSelector>) -> Result<DiskStatus> {
        let status = self.resolver().resolve_or_discover("status", selector)?;
        if status.state == LifecycleState::Absent {
            let subject = selector
                .map(|s| s.to_string())
                .unwrap_or_else(|| status.subject());
            return Err(DiskError::not_found("status", subject).into());
        }
        Ok(status)
    }

    pub fn status_all(&self) -> Result<Vec<DiskStatus>> {
        self.resolver().resolve_all()
    }

    pub fn attach(&self, selector: &DiskSelector) -> Result<Outcome> {
        let status = self.resolver().resolve(selector)?;
        if Self::check(Transition::Attach, &status)? == Guard::AlreadyInState {
            self.touch(&status)?;
            info!("Already attached: {}", status.subject());
            return Ok(Outcome::AlreadyInState(status));
        }

        let path = Self::required_path(Transition::Attach, &status)?;
        self.cleanup.register(&path);
        match self.attach_image(&path) {
            Ok(attached) => {
                self.cleanup.unregister(&path);
                Ok(Outcome::Changed(attached))
            }
            Err(err) => {
                self.cleanup.release(&path);
                Err(err)
            }
        }
    }

    /// Attach `path` and attribute the new device to it by snapshot diff.
    /// The caller owns cleanup registration.
    pub(crate) fn attach_image(&self, path: &Path) -> Result<DiskStatus> {
        let subject = format!("path {}", path.display());
        let ext = |e: HalError| DiskError::external("attach", &subject, e);
        let snapshots = SnapshotService::new(self.hal.as_ref());
        let before = snapshots.capture().map_err(ext)?;

        info!("🔗 Attaching {}", path.display());
        let hint = match self.hal.attach(path, &image_label(path)).map_err(ext)? {
            AttachOutcome::Attached { device_hint } => device_hint,
            AttachOutcome::AlreadyAttached { device } => {
                info!("{} is already attached as {}", path.display(), device);
                return self.resolver().resolve_path(path);
            }
        };

        let device = match snapshots.detect_new_device(&before.devices).map_err(ext)? {
            Discovery::Found(name) => name,
            Discovery::Ambiguous(candidates) => {
                return Err(DiskError::AmbiguousIdentity {
                    operation: "attach",
                    subject: subject.clone(),
                    candidates,
                }
                .into())
            }
            Discovery::Nothing => {
                let live = self.hal.attached_device(path).map_err(ext)?;
                match hint.or(live) {
                    Some(name) => name,
                    None => return Err(DiskError::not_found("attach", &subject).into()),
                }
            }
        };

        let devices = self.hal.list_devices().map_err(ext)?;
        let live = devices
            .iter()
            .find(|d| d.name == device)
            .ok_or_else(|| DiskError::not_found("attach", format!("device {}", device)))?;

        let identifier = match snapshots
            .detect_new_identifier(&before.identifiers)
            .map_err(ext)?
        {
            // The one new identifier must be the one on our device.
            Discovery::Found(id) if live.identifier.as_deref() == Some(id.as_str()) => Some(id),
            Discovery::Found(id) => {
                return Err(DiskError::AmbiguousIdentity {
                    operation: "attach",
                    subject: subject.clone(),
                    candidates: std::iter::once(id).chain(live.identifier.clone()).collect(),
                }
                .into())
            }
            Discovery::Ambiguous(candidates) => {
                return Err(DiskError::AmbiguousIdentity {
                    operation: "attach",
                    subject: subject.clone(),
                    candidates,
                }
                .into())
            }
            Discovery::Nothing => {
                if let Some(id) = &live.identifier {
                    warn!(
                        "⚠️ {} carries identifier {} that was already visible before attach",
                        device, id
                    );
                }
                live.identifier.clone()
            }
        };

        self.store
            .save(path, identifier.as_deref(), None, Some(&device))?;
        if !live.mount_points.is_empty() {
            self.store.update_mount_points(path, &live.mount_points)?;
        }

        let mut status = DiskStatus::from_device(Some(path.to_path_buf()), live);
        status.identifier = identifier;
        status.state = if status.identifier.is_none() {
            LifecycleState::AttachedUnformatted
        } else if status.mount_points.is_empty() {
            LifecycleState::AttachedFormatted
        } else {
            LifecycleState::Mounted
        };
        info!("✅ Attached {} as {} ({})", path.display(), device, status.state);
        Ok(status)
    }

    pub fn format(
        &self,
        selector: Option<&DiskSelector>,
        fs_type: Option<&str>,
        confirmed: bool,
    ) -> Result<Outcome> {
        let status = self.resolver().resolve_or_discover("format", selector)?;
        Self::check(Transition::Format, &status)?;
        if !confirmed {
            return Err(DiskError::ConfirmationRequired {
                operation: "format",
                subject: status.subject(),
            }
            .into());
        }
        let fs_type = fs_type.unwrap_or(&self.config.default_fs_type);
        Ok(Outcome::Changed(self.format_device(&status, fs_type)?))
    }

    /// Make a new filesystem on an attached, unmounted device. The identifier
    /// diff must agree with what the tool read back from the device; with an
    /// empty diff the report stands if the probe can see it.
    pub(crate) fn format_device(&self, status: &DiskStatus, fs_type: &str) -> Result<DiskStatus> {
        let subject = status.subject();
        let ext = |e: HalError| DiskError::external("format", &subject, e);
        let device = status
            .device
            .clone()
            .ok_or_else(|| DiskError::not_found("format", &subject))?;
        let label = status
            .path
            .as_deref()
            .map(image_label)
            .unwrap_or_else(|| device.clone());

        let snapshots = SnapshotService::new(self.hal.as_ref());
        let before = snapshots.current_identifiers().map_err(ext)?;

        info!("🧱 Formatting {} as {}", device, fs_type);
        let reported = self
            .hal
            .format(&device, fs_type, &FormatOptions::new(true).with_label(label))
            .map_err(ext)?;

        let identifier = match snapshots.detect_new_identifier(&before).map_err(ext)? {
            Discovery::Found(id) if id == reported => id,
            // mkfs read its id back from our device; a different new id is someone else's.
            Discovery::Found(id) => {
                return Err(DiskError::AmbiguousIdentity {
                    operation: "format",
                    subject: subject.clone(),
                    candidates: vec![id, reported],
                }
                .into())
            }
            Discovery::Nothing => {
                if snapshots.current_identifiers().map_err(ext)?.contains(&reported) {
                    reported
                } else {
                    let what = format!("the new filesystem on {}", device);
                    return Err(DiskError::not_found("format", what).into());
                }
            }
            Discovery::Ambiguous(candidates) => {
                return Err(DiskError::AmbiguousIdentity {
                    operation: "format",
                    subject: subject.clone(),
                    candidates,
                }
                .into())
            }
        };

        match &status.path {
            Some(path) => {
                self.store.save(path, Some(&identifier), None, Some(&device))?;
                self.store.update_mount_points(path, &[])?;
            }
            None => {
                if let Some(old) = &status.identifier {
                    self.store.remove_key(&placeholder_key(old))?;
                }
                self.store.save_discovered(&identifier, Some(&device), &[])?;
            }
        }

        info!("✅ {} now carries {} ({})", device, identifier, fs_type);
        Ok(DiskStatus {
            identifier: Some(identifier),
            mount_points: Vec::new(),
            state: LifecycleState::AttachedFormatted,
            ..status.clone()
        })
    }

    pub fn mount(&self, selector: Option<&DiskSelector>, mount_point: &Path) -> Result<Outcome> {
        let target = absolute(mount_point);
        let status = self.resolver().resolve_or_discover("mount", selector)?;

        match Self::check(Transition::Mount, &status)? {
            Guard::AlreadyInState if status.is_mounted_at(&target) => {
                self.touch(&status)?;
                info!("Already mounted at {}", target.display());
                Ok(Outcome::AlreadyInState(status))
            }
            Guard::AlreadyInState => {
                let current: Vec<String> = status
                    .mount_points
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
                Err(DiskError::invalid(
                    "mount",
                    status.subject(),
                    status.state,
                    format!("already mounted at {}", current.join(", ")),
                )
                .into())
            }
            Guard::AttachFirst => {
                let path = Self::required_path(Transition::Mount, &status)?;
                self.cleanup.register(&path);
                let result = self.attach_image(&path).and_then(|attached| {
                    if attached.state == LifecycleState::AttachedUnformatted {
                        return Err(DiskError::NotFormatted {
                            operation: "mount",
                            subject: attached.subject(),
                        }
                        .into());
                    }
                    self.mount_device(&attached, &target)
                });
                match result {
                    Ok(mounted) => {
                        self.cleanup.unregister(&path);
                        Ok(Outcome::Changed(mounted))
                    }
                    Err(err) => {
                        self.cleanup.release(&path);
                        Err(err)
                    }
                }
            }
            _ => Ok(Outcome::Changed(self.mount_device(&status, &target)?)),
        }
    }

    pub(crate) fn mount_device(&self, status: &DiskStatus, target: &Path) -> Result<DiskStatus> {
        let identifier = status.identifier.clone().ok_or_else(|| DiskError::NotFormatted {
            operation: "mount",
            subject: status.subject(),
        })?;

        info!("📂 Mounting {} at {}", identifier, target.display());
        self.hal
            .mount(&identifier, target, &self.config.mount_options())
            .map_err(|e| DiskError::external("mount", status.subject(), e))?;

        let mut mount_points = status.mount_points.clone();
        mount_points.push(target.to_path_buf());
        match &status.path {
            Some(path) => {
                self.store.save(
                    path,
                    Some(&identifier),
                    Some(target),
                    status.device.as_deref(),
                )?;
            }
            None => {
                self.store
                    .save_discovered(&identifier, status.device.as_deref(), &mount_points)?;
            }
        }

        Ok(DiskStatus {
            mount_points,
            state: LifecycleState::Mounted,
            ..status.clone()
        })
    }

    pub fn unmount(&self, selector: Option<&DiskSelector>) -> Result<Outcome> {
        let status = self.resolver().resolve_or_discover("umount", selector)?;
        if Self::check(Transition::Unmount, &status)? == Guard::AlreadyInState {
            self.touch(&status)?;
            info!("Not mounted: {}", status.subject());
            return Ok(Outcome::AlreadyInState(status));
        }
        Ok(Outcome::Changed(self.unmount_all(&status)?))
    }

    pub(crate) fn unmount_all(&self, status: &DiskStatus) -> Result<DiskStatus> {
        for target in &status.mount_points {
            info!("📤 Unmounting {}", target.display());
            self.hal
                .unmount(target)
                .map_err(|e| DiskError::external("umount", target.display(), e))?;
        }

        match (&status.path, &status.identifier) {
            (Some(path), _) => {
                self.store.update_mount_points(path, &[])?;
            }
            (None, Some(id)) => {
                self.store
                    .save_discovered(id, status.device.as_deref(), &[])?;
            }
            (None, None) => {}
        }

        Ok(DiskStatus {
            mount_points: Vec::new(),
            state: if status.identifier.is_some() {
                LifecycleState::AttachedFormatted
            } else {
                LifecycleState::AttachedUnformatted
            },
            ..status.clone()
        })
    }

    pub fn detach(&self, selector: Option<&DiskSelector>) -> Result<Outcome> {
        let status = self.resolver().resolve_or_discover("detach", selector)?;
        let guard = Self::check(Transition::Detach, &status)?;
        if guard == Guard::AlreadyInState {
            self.touch(&status)?;
            info!("Already detached: {}", status.subject());
            return Ok(Outcome::AlreadyInState(status));
        }

        let path = Self::required_path(Transition::Detach, &status)?;
        let status = if guard == Guard::UnmountFirst {
            self.unmount_all(&status)?
        } else {
            status
        };
        Ok(Outcome::Changed(self.detach_image(&path, &status)?))
    }

    pub(crate) fn detach_image(&self, path: &Path, status: &DiskStatus) -> Result<DiskStatus> {
        info!("🔌 Detaching {}", path.display());
        self.hal
            .detach(path, self.config.detach_timeout)
            .map_err(|e| DiskError::external("detach", status.subject(), e))?;
        if let Some(event) = self.store.mark_detached(path)? {
            debug!("Detach event recorded for {}", event.normalized_path);
        }
        self.cleanup.unregister(path);
        Ok(DiskStatus::detached(
            path.to_path_buf(),
            status.identifier.clone(),
        ))
    }

    /// Remove a detached image and its record. Destructive, so it needs
    /// confirmation like format.
    pub fn delete(&self, selector: &DiskSelector, confirmed: bool) -> Result<DiskStatus> {
        let status = self.resolver().resolve(selector)?;
        Self::check(Transition::Delete, &status)?;
        let path = Self::required_path(Transition::Delete, &status)?;
        if !confirmed {
            return Err(DiskError::ConfirmationRequired {
                operation: "delete",
                subject: status.subject(),
            }
            .into());
        }

        self.hal
            .remove_image(&path)
            .map_err(|e| DiskError::external("delete", status.subject(), e))?;
        self.store.remove(&path)?;
        info!("🗑️ Deleted {}", path.display());
        Ok(DiskStatus::absent(Some(path), status.identifier))
    }

    /// New image: create, attach, format and optionally mount. Anything that
    /// fails part way is rolled back, including the file itself.
    pub fn create(
        &self,
        path: &Path,
        size_bytes: u64,
        fs_type: Option<&str>,
        mount_point: Option<&Path>,
    ) -> Result<DiskStatus> {
        let path = absolute(path);
        let status = self.resolver().resolve_path(&path)?;
        Self::check(Transition::Create, &status)?;
        if size_bytes == 0 {
            return Err(DiskError::invalid(
                "create",
                status.subject(),
                status.state,
                "size must be greater than zero",
            )
            .into());
        }
        let fs_type = fs_type.unwrap_or(&self.config.default_fs_type);

        info!("🆕 Creating {} ({} bytes)", path.display(), size_bytes);
        self.hal
            .create_image(&path, size_bytes)
            .map_err(|e| DiskError::external("create", status.subject(), e))?;
        self.cleanup.register(&path);

        let result = (|| -> Result<DiskStatus> {
            let attached = self.attach_image(&path)?;
            let formatted = self.format_device(&attached, fs_type)?;
            match mount_point {
                Some(mp) => self.mount_device(&formatted, &absolute(mp)),
                None => Ok(formatted),
            }
        })();

        match result {
            Ok(created) => {
                self.cleanup.unregister(&path);
                Ok(created)
            }
            Err(err) => {
                self.cleanup.release(&path);
                if let Err(rm) = self.hal.remove_image(&path) {
                    warn!("⚠️ Could not remove {}: {}", path.display(), rm);
                }
                if let Err(rm) = self.store.remove(&path) {
                    warn!("⚠️ Could not drop record for {}: {:#}", path.display(), rm);
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_short_and_safe() {
        assert_eq!(image_label(Path::new("/srv/data.img")), "data");
        assert_eq!(
            image_label(Path::new("/srv/a very long name!.img")),
            "averylongnam"
        );
        assert_eq!(image_label(Path::new("/srv/!!!.img")), "vdisk");
    }

    #[test]
    fn outcome_accessors() {
        let status = DiskStatus::detached(PathBuf::from("/a.img"), None);
        let outcome = Outcome::AlreadyInState(status.clone());
        assert!(!outcome.changed());
        assert_eq!(outcome.status(), &status);
        assert_eq!(Outcome::Changed(status.clone()).into_status(), status);
    }
}
