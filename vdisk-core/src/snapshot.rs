//! Before/after snapshots of the live device view.
//!
//! Attribution never guesses: a diff with more than one new element is
//! reported as ambiguous and the caller must refuse.

use crate::tracking::DiskImageRecord;
use regex::Regex;
use std::collections::BTreeSet;
use vdisk_hal::{BlockDevice, DiskHal, HalResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    Found(String),
    Nothing,
    Ambiguous(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub devices: BTreeSet<String>,
    pub identifiers: BTreeSet<String>,
}

/// The single element of `after \ before`, if there is exactly one.
pub fn diff(before: &BTreeSet<String>, after: &BTreeSet<String>) -> Discovery {
    let mut added: Vec<String> = after.difference(before).cloned().collect();
    match added.len() {
        0 => Discovery::Nothing,
        1 => Discovery::Found(added.remove(0)),
        _ => Discovery::Ambiguous(added),
    }
}

/// Sole-candidate policy over an already-filtered device list.
pub fn sole_candidate(candidates: &[BlockDevice]) -> Discovery {
    match candidates {
        [] => Discovery::Nothing,
        [only] => Discovery::Found(only.name.clone()),
        many => Discovery::Ambiguous(many.iter().map(|d| d.name.clone()).collect()),
    }
}

pub struct SnapshotService<'a> {
    hal: &'a dyn DiskHal,
}

impl<'a> SnapshotService<'a> {
    pub fn new(hal: &'a dyn DiskHal) -> Self {
        Self { hal }
    }

    pub fn current_device_names(&self) -> HalResult<BTreeSet<String>> {
        Ok(self
            .hal
            .list_devices()?
            .into_iter()
            .map(|d| d.name)
            .collect())
    }

    pub fn current_identifiers(&self) -> HalResult<BTreeSet<String>> {
        Ok(self.hal.list_identifiers()?.into_iter().collect())
    }

    pub fn capture(&self) -> HalResult<Snapshot> {
        let devices = self.hal.list_devices()?;
        Ok(Snapshot {
            identifiers: devices.iter().filter_map(|d| d.identifier.clone()).collect(),
            devices: devices.into_iter().map(|d| d.name).collect(),
        })
    }

    pub fn detect_new_identifier(&self, before: &BTreeSet<String>) -> HalResult<Discovery> {
        Ok(diff(before, &self.current_identifiers()?))
    }

    pub fn detect_new_device(&self, before: &BTreeSet<String>) -> HalResult<Discovery> {
        Ok(diff(before, &self.current_device_names()?))
    }

    /// Attached devices that look like dynamic disks and that no image
    /// record claims by device name or identifier. Placeholders do not
    /// count: their image is exactly what is unknown.
    pub fn untracked_dynamic_devices(
        &self,
        records: &[DiskImageRecord],
        pattern: &Regex,
    ) -> HalResult<Vec<BlockDevice>> {
        Ok(self
            .hal
            .list_devices()?
            .into_iter()
            .filter(|d| pattern.is_match(&d.name))
            .filter(|d| {
                !records.iter().filter(|r| !r.auto_discovered).any(|r| {
                    r.device_name.as_deref() == Some(d.name.as_str())
                        || (d.identifier.is_some() && r.identifier == d.identifier)
                })
            })
            .collect())
    }

    pub fn sole_untracked_dynamic_device(
        &self,
        records: &[DiskImageRecord],
        pattern: &Regex,
    ) -> HalResult<Discovery> {
        Ok(sole_candidate(
            &self.untracked_dynamic_devices(records, pattern)?,
        ))
    }
}
