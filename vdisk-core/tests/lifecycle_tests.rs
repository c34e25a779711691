use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use vdisk_core::errors::{exit_code, find_disk_error};
use vdisk_core::tracking::DETACH_HISTORY_LIMIT;
use vdisk_core::{
    Config, DiskError, DiskManager, DiskSelector, ErrorKind, LifecycleState, Outcome,
};
use vdisk_hal::{AttachOps, FakeHal, FormatOps, FormatOptions, ImageOps, MountOps, Operation};

const MB: u64 = 1024 * 1024;

struct Harness {
    dir: TempDir,
    hal: FakeHal,
    manager: DiskManager,
}

fn harness() -> Harness {
    let dir = tempdir().expect("tempdir");
    let hal = FakeHal::new();
    let config = Config::default().with_tracking_file(dir.path().join("state/tracking.json"));
    let manager = DiskManager::new(Arc::new(hal.clone()), config);
    Harness { dir, hal, manager }
}

impl Harness {
    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Raw, unformatted image that vdisk has never seen.
    fn raw_image(&self, name: &str) -> PathBuf {
        let path = self.path(name);
        self.hal.create_image(&path, 16 * MB).expect("create image");
        path
    }
}

fn by_path(path: &Path) -> DiskSelector {
    DiskSelector::ByPath(path.to_path_buf())
}

fn kind(err: &anyhow::Error) -> ErrorKind {
    find_disk_error(err).expect("disk error").kind()
}

#[test]
fn create_attaches_formats_and_mounts() {
    let h = harness();
    let img = h.path("data.img");
    let mnt = h.path("mnt/data");

    let status = h
        .manager
        .create(&img, 100 * MB, None, Some(&mnt))
        .expect("create");

    assert_eq!(status.state, LifecycleState::Mounted);
    assert_eq!(status.device.as_deref(), Some("sdd"));
    assert_eq!(status.mount_points, vec![mnt.clone()]);
    let id = status.identifier.clone().expect("identifier");

    let record = h.manager.store().get(&img).unwrap().expect("record");
    assert_eq!(record.identifier.as_deref(), Some(id.as_str()));
    assert_eq!(record.device_name.as_deref(), Some("sdd"));
    assert_eq!(record.mount_points, vec![mnt]);
    assert!(h.manager.cleanup().pending().is_empty());
    assert!(h.hal.has_operation(|op| matches!(
        op,
        Operation::Format { fs_type, .. } if fs_type == "ext4"
    )));
}

#[test]
fn full_lifecycle_is_idempotent() {
    let h = harness();
    let img = h.raw_image("disk.img");
    let mnt = h.path("mnt");
    let sel = by_path(&img);

    let attached = h.manager.attach(&sel).expect("attach");
    assert!(attached.changed());
    assert_eq!(attached.status().state, LifecycleState::AttachedUnformatted);
    assert_eq!(attached.status().device.as_deref(), Some("sdd"));

    let again = h.manager.attach(&sel).expect("attach again");
    assert!(matches!(again, Outcome::AlreadyInState(_)));

    let err = h.manager.format(Some(&sel), None, false).unwrap_err();
    assert!(matches!(
        find_disk_error(&err),
        Some(DiskError::ConfirmationRequired { .. })
    ));
    assert_eq!(exit_code(&err), 4);

    let formatted = h.manager.format(Some(&sel), Some("xfs"), true).expect("format");
    assert_eq!(formatted.status().state, LifecycleState::AttachedFormatted);
    let id = formatted.status().identifier.clone().expect("identifier");

    let mounted = h.manager.mount(Some(&sel), &mnt).expect("mount");
    assert!(mounted.changed());
    assert_eq!(mounted.status().state, LifecycleState::Mounted);
    assert!(h.hal.is_mounted(&mnt).unwrap());

    let again = h.manager.mount(Some(&sel), &mnt).expect("mount again");
    assert!(!again.changed());

    let unmounted = h.manager.unmount(Some(&sel)).expect("umount");
    assert!(unmounted.changed());
    assert_eq!(unmounted.status().state, LifecycleState::AttachedFormatted);
    assert!(!h.manager.unmount(Some(&sel)).expect("umount again").changed());

    let detached = h.manager.detach(Some(&sel)).expect("detach");
    assert!(detached.changed());
    assert_eq!(detached.status().state, LifecycleState::Detached);
    assert_eq!(detached.status().identifier.as_deref(), Some(id.as_str()));
    assert!(!h.manager.detach(Some(&sel)).expect("detach again").changed());
    assert_eq!(h.manager.store().detach_history().unwrap().len(), 1);

    let err = h.manager.delete(&sel, false).unwrap_err();
    assert_eq!(exit_code(&err), 4);
    assert!(img.exists());

    let deleted = h.manager.delete(&sel, true).expect("delete");
    assert_eq!(deleted.state, LifecycleState::Absent);
    assert!(!img.exists());
    assert!(h.manager.store().get(&img).unwrap().is_none());
}

#[test]
fn already_in_state_only_refreshes_last_seen() {
    let h = harness();
    let img = h.raw_image("disk.img");
    h.manager.attach(&by_path(&img)).expect("attach");
    h.hal.clear_operations();

    let before = h.manager.store().get(&img).unwrap().expect("record");
    let outcome = h.manager.attach(&by_path(&img)).expect("attach again");
    assert!(!outcome.changed());
    assert_eq!(h.hal.operation_count(), 0);

    let after = h.manager.store().get(&img).unwrap().expect("record");
    assert_eq!(before.identifier, after.identifier);
    assert_eq!(before.device_name, after.device_name);
    assert!(after.last_seen >= before.last_seen);
}

#[test]
fn mount_of_unformatted_disk_is_refused() {
    let h = harness();
    let img = h.raw_image("raw.img");
    h.manager.attach(&by_path(&img)).expect("attach");

    let err = h
        .manager
        .mount(Some(&by_path(&img)), &h.path("mnt"))
        .unwrap_err();
    assert!(matches!(
        find_disk_error(&err),
        Some(DiskError::NotFormatted { .. })
    ));
    assert_eq!(exit_code(&err), 4);
}

#[test]
fn mount_of_detached_image_attaches_first() {
    let h = harness();
    let img = h.path("data.img");
    h.manager.create(&img, 32 * MB, None, None).expect("create");
    h.manager.detach(Some(&by_path(&img))).expect("detach");

    let mnt = h.path("mnt");
    let outcome = h.manager.mount(Some(&by_path(&img)), &mnt).expect("mount");
    assert!(outcome.changed());
    assert_eq!(outcome.status().state, LifecycleState::Mounted);
    assert!(h.hal.attached_device(&img).unwrap().is_some());
    assert!(h.manager.cleanup().pending().is_empty());
}

#[test]
fn configured_mount_options_reach_the_mount_call() {
    let dir = tempdir().unwrap();
    let hal = FakeHal::new();
    let mut config = Config::default().with_tracking_file(dir.path().join("tracking.json"));
    config.mount_options = Some("noatime".to_string());
    let manager = DiskManager::new(Arc::new(hal.clone()), config);

    let img = dir.path().join("opts.img");
    let mnt = dir.path().join("mnt");
    manager.create(&img, 32 * MB, None, Some(&mnt)).expect("create");

    assert!(hal.has_operation(|op| matches!(
        op,
        Operation::Mount { target, options, .. }
            if target == &mnt && options.as_deref() == Some("noatime")
    )));
}

#[test]
fn failed_mount_detaches_the_image_it_attached() {
    let h = harness();
    let img = h.path("data.img");
    h.manager.create(&img, 32 * MB, None, None).expect("create");
    h.manager.detach(Some(&by_path(&img))).expect("detach");
    h.hal.set_mount_failure(true);

    let err = h
        .manager
        .mount(Some(&by_path(&img)), &h.path("mnt"))
        .unwrap_err();
    assert_eq!(kind(&err), ErrorKind::ExternalToolFailure);
    assert_eq!(exit_code(&err), 6);
    assert!(h.hal.attached_device(&img).unwrap().is_none());
    assert!(h.manager.cleanup().pending().is_empty());
}

#[test]
fn mount_elsewhere_while_mounted_is_invalid() {
    let h = harness();
    let img = h.path("data.img");
    h.manager
        .create(&img, 32 * MB, None, Some(&h.path("a")))
        .expect("create");

    let err = h
        .manager
        .mount(Some(&by_path(&img)), &h.path("b"))
        .unwrap_err();
    assert_eq!(kind(&err), ErrorKind::InvalidTransition);
}

#[test]
fn identity_survives_detach_and_reattach() {
    let h = harness();
    let img = h.path("data.img");
    let created = h.manager.create(&img, 32 * MB, None, None).expect("create");
    let id = created.identifier.expect("identifier");

    h.manager.detach(Some(&by_path(&img))).expect("detach");
    let status = h
        .manager
        .status(Some(&DiskSelector::ByIdentifier(id.clone())))
        .expect("status by identifier");
    assert_eq!(status.state, LifecycleState::Detached);
    assert_eq!(status.path.as_deref(), Some(img.as_path()));

    let outcome = h
        .manager
        .attach(&DiskSelector::ByIdentifier(id.clone()))
        .expect("attach by identifier");
    assert_eq!(outcome.status().state, LifecycleState::AttachedFormatted);
    assert_eq!(outcome.status().identifier.as_deref(), Some(id.as_str()));
}

#[test]
fn stale_attachment_resolves_as_detached_and_is_corrected() {
    let h = harness();
    let img = h.path("data.img");
    h.manager.create(&img, 32 * MB, None, None).expect("create");
    h.hal.vanish("sdd");

    let status = h.manager.status(Some(&by_path(&img))).expect("status");
    assert_eq!(status.state, LifecycleState::Detached);

    let record = h.manager.store().get(&img).unwrap().expect("record");
    assert!(record.device_name.is_none());
    assert!(record.mount_points.is_empty());
    assert!(record.identifier.is_some());
}

#[test]
fn vanished_image_is_evicted() {
    let h = harness();
    let img = h.path("data.img");
    h.manager.create(&img, 32 * MB, None, None).expect("create");
    h.manager.detach(Some(&by_path(&img))).expect("detach");
    fs::remove_file(&img).expect("remove image");

    let err = h.manager.status(Some(&by_path(&img))).unwrap_err();
    assert_eq!(exit_code(&err), 2);
    assert!(h.manager.store().get(&img).unwrap().is_none());
}

#[test]
fn live_identifier_without_record_gets_placeholder() {
    let h = harness();
    h.hal.attach_foreign("sdk", Some("f-1"));

    let status = h
        .manager
        .status(Some(&DiskSelector::ByIdentifier("f-1".into())))
        .expect("status");
    assert!(status.path.is_none());
    assert_eq!(status.device.as_deref(), Some("sdk"));
    assert_eq!(status.state, LifecycleState::AttachedFormatted);

    let placeholder = h
        .manager
        .store()
        .get_by_identifier("f-1")
        .unwrap()
        .expect("placeholder");
    assert!(placeholder.auto_discovered);
    assert_eq!(placeholder.normalized_path, "auto:f-1");

    let by_device = h
        .manager
        .status(Some(&DiskSelector::device("/dev/sdk")))
        .expect("status by device");
    assert_eq!(by_device.identifier.as_deref(), Some("f-1"));
}

#[test]
fn placeholder_folds_into_record_once_path_is_known() {
    let h = harness();
    let img = h.raw_image("outside.img");

    // Attached and formatted behind vdisk's back.
    h.hal.attach(&img, "outside").unwrap();
    let device = h.hal.attached_device(&img).unwrap().unwrap();
    let id = h
        .hal
        .format(&device, "ext4", &FormatOptions::new(true))
        .unwrap();

    h.manager
        .status(Some(&DiskSelector::ByIdentifier(id.clone())))
        .expect("status");
    assert!(h
        .manager
        .store()
        .get_by_identifier(&id)
        .unwrap()
        .unwrap()
        .auto_discovered);

    let outcome = h.manager.attach(&by_path(&img)).expect("attach");
    assert!(!outcome.changed());

    let records = h.manager.store().list_all().unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].auto_discovered);
    assert_eq!(records[0].identifier.as_deref(), Some(id.as_str()));
}

#[test]
fn ambiguous_attach_is_refused_and_rolled_back() {
    let h = harness();
    let img = h.raw_image("disk.img");
    h.hal.appear_on_next_attach("sdx", None);

    let err = h.manager.attach(&by_path(&img)).unwrap_err();
    assert!(matches!(
        find_disk_error(&err),
        Some(DiskError::AmbiguousIdentity { candidates, .. }) if candidates.len() == 2
    ));
    assert_eq!(exit_code(&err), 3);
    assert!(h.hal.attached_device(&img).unwrap().is_none());
    assert!(h.manager.store().get(&img).unwrap().is_none());
    assert!(h.manager.cleanup().pending().is_empty());
}

#[test]
fn identifier_appearing_on_another_disk_is_not_attributed() {
    let h = harness();
    let img = h.raw_image("blank.img");
    h.hal.attach_foreign("sdz", None);
    h.hal.appear_on_next_attach("sdz", Some("rogue"));

    let err = h.manager.attach(&by_path(&img)).unwrap_err();
    assert!(matches!(
        find_disk_error(&err),
        Some(DiskError::AmbiguousIdentity { candidates, .. }) if candidates == &vec!["rogue".to_string()]
    ));
    assert_eq!(exit_code(&err), 3);
    assert!(h.hal.attached_device(&img).unwrap().is_none());
    assert!(h.manager.store().get_by_identifier("rogue").unwrap().is_none());
    assert!(h.manager.store().get(&img).unwrap().is_none());
}

#[test]
fn format_refuses_identifier_the_tool_did_not_report() {
    let h = harness();
    let img = h.raw_image("disk.img");
    h.manager.attach(&by_path(&img)).expect("attach");
    h.hal.misreport_next_format("not-on-this-device");

    let err = h
        .manager
        .format(Some(&by_path(&img)), None, true)
        .unwrap_err();
    assert_eq!(kind(&err), ErrorKind::AmbiguousIdentity);
    assert_eq!(exit_code(&err), 3);
    let record = h.manager.store().get(&img).unwrap().expect("record");
    assert!(record.identifier.is_none());
}

#[test]
fn no_selector_uses_sole_untracked_dynamic_disk() {
    let h = harness();
    let err = h.manager.status(None).unwrap_err();
    assert_eq!(exit_code(&err), 2);

    h.hal.attach_foreign("sdd", Some("f-1"));
    let status = h.manager.status(None).expect("status");
    assert_eq!(status.device.as_deref(), Some("sdd"));
    // Still discoverable after a placeholder was written for it.
    assert_eq!(h.manager.status(None).expect("again").device.as_deref(), Some("sdd"));

    h.hal.attach_foreign("sde", Some("f-2"));
    let err = h.manager.status(None).unwrap_err();
    assert_eq!(kind(&err), ErrorKind::AmbiguousIdentity);

    // A tracked image does not count as untracked.
    let img = h.path("mine.img");
    h.manager.create(&img, 16 * MB, None, None).expect("create");
    let err = h.manager.status(None).unwrap_err();
    assert_eq!(kind(&err), ErrorKind::AmbiguousIdentity);
}

#[test]
fn detach_timeout_is_an_external_tool_failure() {
    let h = harness();
    let img = h.path("data.img");
    h.manager.create(&img, 16 * MB, None, None).expect("create");
    h.hal.set_detach_timeout(true);

    let err = h.manager.detach(Some(&by_path(&img))).unwrap_err();
    match find_disk_error(&err) {
        Some(DiskError::ExternalToolFailure { source, .. }) => assert!(source.is_timeout()),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(exit_code(&err), 6);
    let record = h.manager.store().get(&img).unwrap().expect("record");
    assert_eq!(record.device_name.as_deref(), Some("sdd"));
}

#[test]
fn detach_of_mounted_disk_unmounts_first() {
    let h = harness();
    let img = h.path("data.img");
    let mnt = h.path("mnt");
    h.manager.create(&img, 16 * MB, None, Some(&mnt)).expect("create");

    let outcome = h
        .manager
        .detach(Some(&DiskSelector::ByMountPoint(mnt.clone())))
        .expect("detach");
    assert_eq!(outcome.status().state, LifecycleState::Detached);
    assert!(!h.hal.is_mounted(&mnt).unwrap());

    let event = &h.manager.store().detach_history().unwrap()[0];
    assert_eq!(event.device_name.as_deref(), Some("sdd"));
}

#[test]
fn destructive_operations_respect_state() {
    let h = harness();
    let img = h.path("data.img");
    let mnt = h.path("mnt");
    h.manager.create(&img, 16 * MB, None, Some(&mnt)).expect("create");

    let err = h.manager.delete(&by_path(&img), true).unwrap_err();
    assert_eq!(kind(&err), ErrorKind::InvalidTransition);
    assert!(img.exists());

    let err = h.manager.format(Some(&by_path(&img)), None, true).unwrap_err();
    assert_eq!(kind(&err), ErrorKind::InvalidTransition);

    let err = h.manager.create(&img, 16 * MB, None, None).unwrap_err();
    assert_eq!(kind(&err), ErrorKind::InvalidTransition);
}

#[test]
fn missing_image_is_not_found() {
    let h = harness();
    let err = h.manager.attach(&by_path(&h.path("nope.img"))).unwrap_err();
    assert_eq!(exit_code(&err), 2);
}

#[test]
fn detach_history_is_capped() {
    let h = harness();
    let img = h.raw_image("cycle.img");
    for _ in 0..(DETACH_HISTORY_LIMIT + 5) {
        h.manager.attach(&by_path(&img)).expect("attach");
        h.manager.detach(Some(&by_path(&img))).expect("detach");
    }
    assert_eq!(
        h.manager.store().detach_history().unwrap().len(),
        DETACH_HISTORY_LIMIT
    );
}

#[test]
fn status_all_lists_tracked_and_untracked() {
    let h = harness();
    let a = h.path("a.img");
    let b = h.path("b.img");
    let gone = h.path("gone.img");
    h.manager.create(&a, 16 * MB, None, Some(&h.path("mnt-a"))).expect("create a");
    h.manager.create(&b, 16 * MB, None, None).expect("create b");
    h.manager.detach(Some(&by_path(&b))).expect("detach b");
    h.manager.create(&gone, 16 * MB, None, None).expect("create gone");
    h.manager.detach(Some(&by_path(&gone))).expect("detach gone");
    fs::remove_file(&gone).unwrap();
    h.hal.attach_foreign("sdk", Some("f-9"));

    let all = h.manager.status_all().expect("status all");
    assert_eq!(all.len(), 3);

    let find = |path: &Path| all.iter().find(|s| s.path.as_deref() == Some(path));
    assert_eq!(find(&a).unwrap().state, LifecycleState::Mounted);
    assert_eq!(find(&b).unwrap().state, LifecycleState::Detached);
    assert!(find(&gone).is_none());
    assert!(all
        .iter()
        .any(|s| s.path.is_none() && s.device.as_deref() == Some("sdk")));
    assert!(h.manager.store().get(&gone).unwrap().is_none());
}
