//! Bulk tree copy used to migrate data between disks.

use crate::{HalError, HalResult};
use nix::sys::stat::{utimensat, UtimensatFlags};
use nix::sys::time::TimeSpec;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Options controlling how trees are copied.
#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Preserve ownership (uid/gid) when supported.
    pub preserve_owner: bool,
    /// Preserve permissions (mode bits).
    pub preserve_perms: bool,
    /// Preserve access and modification times.
    pub preserve_times: bool,
}

impl CopyOptions {
    /// Archive-style copy (similar to `cp -a`).
    pub fn archive() -> Self {
        Self {
            preserve_owner: true,
            preserve_perms: true,
            preserve_times: true,
        }
    }
}

/// Progress information for a copy operation.
#[derive(Debug, Clone, Default)]
pub struct CopyProgress {
    pub bytes_copied: u64,
    pub bytes_total: u64,
    pub files_copied: u64,
    pub files_total: u64,
}

/// Copy operations abstraction.
pub trait CopyOps {
    /// Recursively copy the contents of `src` into `dst`, reporting progress.
    ///
    /// The callback returns `true` to continue or `false` to abort the copy.
    fn copy_tree(
        &self,
        src: &Path,
        dst: &Path,
        opts: &CopyOptions,
        on_progress: &mut dyn FnMut(CopyProgress) -> bool,
    ) -> HalResult<()>;
}

/// Native implementation shared by every backend.
///
/// Regular files, directories and symlinks are copied; sockets, fifos and
/// device nodes are skipped. Directory attributes are applied last so that
/// writing children does not clobber their mtimes.
pub fn copy_tree_native(
    src: &Path,
    dst: &Path,
    opts: &CopyOptions,
    on_progress: &mut dyn FnMut(CopyProgress) -> bool,
) -> HalResult<()> {
    let mut progress = CopyProgress::default();
    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let ft = entry.file_type();
        if ft.is_file() {
            progress.files_total += 1;
            progress.bytes_total += entry.metadata().map_err(io::Error::from)?.len();
        } else if ft.is_symlink() {
            progress.files_total += 1;
        }
    }

    fs::create_dir_all(dst)?;
    let mut dirs: Vec<(PathBuf, PathBuf)> = Vec::new();

    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| HalError::Other(format!("copy: {}", e)))?;
        let target = dst.join(rel);
        let ft = entry.file_type();

        if ft.is_dir() {
            fs::create_dir_all(&target)?;
            dirs.push((entry.path().to_path_buf(), target));
            continue;
        }

        if ft.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if fs::symlink_metadata(&target).is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(&link, &target)?;
            apply_attributes(entry.path(), &target, opts, true)?;
        } else if ft.is_file() {
            let copied = fs::copy(entry.path(), &target)?;
            progress.bytes_copied += copied;
            apply_attributes(entry.path(), &target, opts, false)?;
        } else {
            log::debug!("copy: skipping special file {}", entry.path().display());
            continue;
        }

        progress.files_copied += 1;
        if !on_progress(progress.clone()) {
            return Err(HalError::Other("copy cancelled".to_string()));
        }
    }

    for (src_dir, dst_dir) in dirs.iter().rev() {
        apply_attributes(src_dir, dst_dir, opts, false)?;
    }

    Ok(())
}

fn apply_attributes(src: &Path, dst: &Path, opts: &CopyOptions, is_symlink: bool) -> HalResult<()> {
    let meta = fs::symlink_metadata(src)?;

    if opts.preserve_owner {
        let res = if is_symlink {
            std::os::unix::fs::lchown(dst, Some(meta.uid()), Some(meta.gid()))
        } else {
            std::os::unix::fs::chown(dst, Some(meta.uid()), Some(meta.gid()))
        };
        // Unprivileged runs cannot give files away; keep going with the rest.
        if let Err(err) = res {
            if err.kind() != io::ErrorKind::PermissionDenied {
                return Err(err.into());
            }
            log::debug!("copy: cannot preserve owner of {}: {}", dst.display(), err);
        }
    }

    if opts.preserve_perms && !is_symlink {
        fs::set_permissions(dst, meta.permissions())?;
    }

    if opts.preserve_times {
        let atime = TimeSpec::new(meta.atime() as _, meta.atime_nsec() as _);
        let mtime = TimeSpec::new(meta.mtime() as _, meta.mtime_nsec() as _);
        utimensat(None, dst, &atime, &mtime, UtimensatFlags::NoFollowSymlink)?;
    }

    Ok(())
}
