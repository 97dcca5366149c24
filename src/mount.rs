//! Kernel mount wrappers and the backing-device manager.
//!
//! The backing-device manager pairs the superblock readers with the verity
//! engine for privileged mounts, spawns FUSE helpers for unprivileged ones,
//! and knows how to release whatever kind of device backed a mount.

use std::{fs, path::Path};

use anyhow::anyhow;
use log::debug;

use crate::{
    dependencies::Dependency,
    error::{Error, ResourceError, Result, ResultExt, StateError},
    files,
    filesystems::FilesystemType,
    fuse::{self, FuseHelper},
    mountinfo::{self, MountTable},
    superblock, veritysetup,
};

fn do_mount(source: &Path, target: &Path, fstype: &str, options: &str) -> Result<()> {
    Dependency::Mount
        .cmd()
        .arg("-t")
        .arg(fstype)
        .arg("-o")
        .arg(options)
        .arg(source)
        .arg(target)
        .run_and_check()
        .map_err(|source| {
            Error::from(ResourceError::MountFailed {
                target: target.to_owned(),
                source: anyhow::Error::new(*source),
            })
        })
}

/// Read-only kernel mount of a block device.
pub fn mount_ro(source: &Path, target: &Path, fstype: &str) -> Result<()> {
    do_mount(source, target, fstype, "ro")
}

/// Read-only kernel mount of an image file through an autoclearing loop
/// device.
pub fn mount_ro_loop(image: &Path, target: &Path, fstype: &str) -> Result<()> {
    do_mount(image, target, fstype, "loop,ro")
}

/// Mounts an overlay with the given option string at `target`.
pub fn overlay_mount(target: &Path, options: &str) -> Result<()> {
    Dependency::Mount
        .cmd()
        .arg("-t")
        .arg("overlay")
        .arg("overlay")
        .arg("-o")
        .arg(options)
        .arg(target)
        .run_and_check()
        .map_err(|source| {
            Error::from(ResourceError::MountFailed {
                target: target.to_owned(),
                source: anyhow::Error::new(*source),
            })
        })
}

pub fn kernel_umount(target: &Path) -> Result<()> {
    Dependency::Umount
        .cmd()
        .arg(target)
        .run_and_check()
        .map_err(|source| {
            Error::from(ResourceError::UnmountFailed {
                target: target.to_owned(),
                source: anyhow::Error::new(*source),
            })
        })
}

/// Kernel-mounts an atom image at `target`, with verity when `root_hash` is
/// given. Requires host-root privileges.
pub fn host_mount_image(
    image: &Path,
    filesystem: FilesystemType,
    target: &Path,
    root_hash: Option<&str>,
) -> Result<()> {
    let image_size = fs::symlink_metadata(image)
        .message(format!("failed to stat image '{}'", image.display()))?
        .len();
    let verity_offset = match filesystem {
        FilesystemType::Squashfs => {
            superblock::SquashfsSuperblock::read(image)?.verity_data_location()
        }
        FilesystemType::Erofs => superblock::ErofsSuperblock::read(image)?.verity_data_location(),
    };

    veritysetup::host_mount(
        image,
        filesystem.name(),
        target,
        root_hash,
        image_size,
        verity_offset,
    )
}

/// Mounts an atom image at `target` through a FUSE helper, without host-root
/// privileges. The helper process is released and outlives the caller.
pub fn guest_mount_image(image: &Path, target: &Path, helper: &FuseHelper) -> Result<()> {
    if mountinfo::is_mountpoint(target)? {
        return Err(ResourceError::MountFailed {
            target: target.to_owned(),
            source: anyhow!("'{}' is already mounted", target.display()),
        }
        .into());
    }

    let image = files::absolute(image).message("failed to absolutize image path")?;
    let target = files::absolute(target).message("failed to absolutize mountpoint")?;

    fuse::mount_and_wait(helper, &image, &target)
}

/// Unmounts an atom mount and releases its backing device if it has one to
/// release.
pub fn umount_image(target: &Path) -> Result<()> {
    let table = MountTable::read()?;
    let record = table
        .find_mount(target)
        .ok_or_else(|| StateError::NotAMountpoint {
            path: target.to_owned(),
        })?
        .clone();

    kernel_umount(target)?;
    maybe_cleanup_backing_device(&record.source)
}

/// Releases the device that backed an unmounted atom.
///
/// A source path that no longer exists is the expected end state for plain
/// loop mounts (the autoclear flag detaches them on unmount). A
/// `...-verity` mapper source still needs explicit teardown. Anything else
/// is left alone.
pub fn maybe_cleanup_backing_device(source: &str) -> Result<()> {
    let path = Path::new(source);
    if !files::path_exists(path) {
        return Ok(());
    }

    if source.ends_with(&format!("-{}", veritysetup::VERITY_SUFFIX)) {
        debug!("releasing verity backing device {source}");
        veritysetup::verity_unmount(path)?;
    }

    Ok(())
}
