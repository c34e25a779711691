//! Persistent tracking store.
//!
//! One JSON document maps normalized image paths to what was last observed
//! about them. Every mutation is lock, read, modify, write-temp, fsync,
//! rename; readers see either the old or the new document, never a torn one.
//! The store is a cache of observations: the live probe always wins.

pub mod document;
pub mod lock;

pub use document::{
    normalize_path, now_unix_secs, placeholder_key, DetachEvent, DiskImageRecord,
    TrackingDocument, DETACH_HISTORY_LIMIT, PLACEHOLDER_PREFIX, TRACKING_VERSION,
};
pub use lock::StoreLock;

use anyhow::{bail, Context, Result};
use log::debug;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct TrackingStore {
    path: PathBuf,
}

impl TrackingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file reads as an empty document. A document written by a
    /// newer version is refused rather than silently rewritten.
    pub fn load(&self) -> Result<TrackingDocument> {
        load_document(&self.path)
    }

    fn update<T>(&self, mutate: impl FnOnce(&mut TrackingDocument) -> T) -> Result<T> {
        let _lock = StoreLock::acquire(&self.path)?;
        let mut doc = self.load()?;
        let before = doc.clone();
        let out = mutate(&mut doc);
        if doc != before {
            save_document_atomic(&self.path, &doc)?;
        }
        Ok(out)
    }

    pub fn get(&self, path: &Path) -> Result<Option<DiskImageRecord>> {
        Ok(self.load()?.disks.remove(&normalize_path(path)))
    }

    pub fn get_by_identifier(&self, identifier: &str) -> Result<Option<DiskImageRecord>> {
        Ok(self.load()?.find_by_identifier(identifier).cloned())
    }

    pub fn get_by_device_name(&self, name: &str) -> Result<Option<DiskImageRecord>> {
        Ok(self.load()?.find_by_device_name(name).cloned())
    }

    pub fn get_by_mount_point(&self, mount_point: &Path) -> Result<Option<DiskImageRecord>> {
        Ok(self.load()?.find_by_mount_point(mount_point).cloned())
    }

    /// Upsert the record for `path`. Identifier and device name are replaced
    /// as given; `mount_point` is added when present. A placeholder carrying
    /// the same identifier is folded into this record.
    pub fn save(
        &self,
        path: &Path,
        identifier: Option<&str>,
        mount_point: Option<&Path>,
        device_name: Option<&str>,
    ) -> Result<DiskImageRecord> {
        let key = normalize_path(path);
        let now = now_unix_secs();
        self.update(|doc| {
            if let Some(id) = identifier {
                let folded = doc.remove_placeholders_for(id);
                if folded > 0 {
                    debug!("🧹 Folded placeholder for {} into {}", id, key);
                }
            }
            doc.release_claims(&key, device_name, mount_point);

            let record = doc
                .disks
                .entry(key.clone())
                .or_insert_with(|| DiskImageRecord::for_path(path, now));
            record.original_path = Some(path.to_path_buf());
            record.identifier = identifier.map(str::to_string);
            record.device_name = device_name.map(str::to_string);
            if let Some(mp) = mount_point {
                if !record.mount_points.iter().any(|p| p == mp) {
                    record.mount_points.push(mp.to_path_buf());
                }
            }
            record.last_seen = now;
            record.clone()
        })
    }

    /// Record a live identifier whose image path is unknown. Updates the
    /// owning record instead when one already carries the identifier.
    pub fn save_discovered(
        &self,
        identifier: &str,
        device_name: Option<&str>,
        mount_points: &[PathBuf],
    ) -> Result<DiskImageRecord> {
        let now = now_unix_secs();
        self.update(|doc| {
            let key = doc
                .find_by_identifier(identifier)
                .map(|r| r.normalized_path.clone())
                .unwrap_or_else(|| placeholder_key(identifier));
            doc.release_claims(&key, device_name, None);
            for mp in mount_points {
                doc.release_claims(&key, None, Some(mp.as_path()));
            }

            let record = doc
                .disks
                .entry(key)
                .or_insert_with(|| DiskImageRecord::placeholder(identifier, now));
            record.device_name = device_name.map(str::to_string);
            record.mount_points = mount_points.to_vec();
            record.last_seen = now;
            record.clone()
        })
    }

    /// Replace the mount point list. Returns false when no record exists.
    pub fn update_mount_points(&self, path: &Path, mount_points: &[PathBuf]) -> Result<bool> {
        self.update_mount_points_by_key(&normalize_path(path), mount_points)
    }

    pub fn update_mount_points_by_key(&self, key: &str, mount_points: &[PathBuf]) -> Result<bool> {
        let now = now_unix_secs();
        let key = key.to_string();
        self.update(|doc| {
            for mp in mount_points {
                doc.release_claims(&key, None, Some(mp.as_path()));
            }
            match doc.disks.get_mut(&key) {
                Some(record) => {
                    record.mount_points = mount_points.to_vec();
                    record.last_seen = now;
                    true
                }
                None => false,
            }
        })
    }

    /// Clear device name and mount points and append a detach event.
    pub fn mark_detached(&self, path: &Path) -> Result<Option<DetachEvent>> {
        let key = normalize_path(path);
        let now = now_unix_secs();
        self.update(|doc| {
            let record = doc.disks.get_mut(&key)?;
            let event = DetachEvent {
                normalized_path: key.clone(),
                original_path: record.original_path.clone(),
                identifier: record.identifier.clone(),
                device_name: record.device_name.take(),
                detached_at: now,
            };
            record.mount_points.clear();
            record.last_seen = now;
            doc.push_detach_event(event.clone());
            Some(event)
        })
    }

    /// Forget a stale attachment (detached behind our back). No history entry.
    pub fn clear_attachment(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.update(|doc| match doc.disks.get_mut(&key) {
            Some(record) if record.device_name.is_some() || !record.mount_points.is_empty() => {
                record.device_name = None;
                record.mount_points.clear();
                true
            }
            _ => false,
        })
    }

    /// Refresh `last_seen` only.
    pub fn touch(&self, path: &Path) -> Result<bool> {
        let key = normalize_path(path);
        let now = now_unix_secs();
        self.update(|doc| match doc.disks.get_mut(&key) {
            Some(record) => {
                record.last_seen = now;
                true
            }
            None => false,
        })
    }

    pub fn remove(&self, path: &Path) -> Result<Option<DiskImageRecord>> {
        self.remove_key(&normalize_path(path))
    }

    pub fn remove_key(&self, key: &str) -> Result<Option<DiskImageRecord>> {
        let key = key.to_string();
        self.update(|doc| doc.disks.remove(&key))
    }

    pub fn list_all(&self) -> Result<Vec<DiskImageRecord>> {
        Ok(self.load()?.disks.into_values().collect())
    }

    /// Evict records whose backing file no longer exists. Placeholders have
    /// no file and are left alone.
    pub fn cleanup_non_existent(&self) -> Result<Vec<DiskImageRecord>> {
        self.cleanup_where_missing(|path| path.exists())
    }

    pub fn cleanup_where_missing(
        &self,
        exists: impl Fn(&Path) -> bool,
    ) -> Result<Vec<DiskImageRecord>> {
        self.update(|doc| {
            let stale: Vec<String> = doc
                .disks
                .iter()
                .filter(|(_, r)| r.image_path().is_some_and(|p| !exists(p)))
                .map(|(k, _)| k.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|k| doc.disks.remove(&k))
                .collect()
        })
    }

    pub fn detach_history(&self) -> Result<Vec<DetachEvent>> {
        Ok(self.load()?.detach_history)
    }
}

pub fn load_document(path: &Path) -> Result<TrackingDocument> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(TrackingDocument::default())
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("Failed to read tracking file: {}", path.display()))
        }
    };
    if content.trim().is_empty() {
        return Ok(TrackingDocument::default());
    }

    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Tracking file is not valid JSON: {}", path.display()))?;
    let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
    if version > u64::from(TRACKING_VERSION) {
        bail!(
            "Tracking file {} has version {}, newer than supported version {}",
            path.display(),
            version,
            TRACKING_VERSION
        );
    }

    let mut doc: TrackingDocument = serde_json::from_value(value)
        .with_context(|| format!("Failed to parse tracking file: {}", path.display()))?;
    doc.version = TRACKING_VERSION;
    doc.sync_keys();
    Ok(doc)
}

pub fn save_document_atomic(path: &Path, doc: &TrackingDocument) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create tracking directory: {}", parent.display()))?;
    }

    let tmp_path = temp_path(path);
    let payload = serde_json::to_string_pretty(doc).context("Failed to serialize tracking")?;

    let mut file = File::create(&tmp_path)
        .with_context(|| format!("Failed to create temp tracking file: {}", tmp_path.display()))?;
    file.write_all(payload.as_bytes())
        .context("Failed to write tracking")?;
    file.sync_all().context("Failed to flush tracking")?;

    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed to atomically replace tracking file: {}",
            path.display()
        )
    })?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            dir.sync_all().ok();
        }
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("disk-tracking.json");
    path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()))
}
