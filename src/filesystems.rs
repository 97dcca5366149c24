//! The filesystem adapter: dispatches make/mount/extract/umount to the
//! right filesystem family based on media type.

use std::{fmt, fs, path::Path};

use log::{debug, warn};
use once_cell::sync::OnceCell;

use crate::{
    dependencies::Dependency,
    error::{EnvironmentError, Result, ResultExt},
    exclude::ExcludePaths,
    extract, fuse,
    mediatype::{Compression, MediaType, BASE_MEDIA_TYPE},
    mount, procinfo, veritysetup,
};

/// The filesystem families an atom can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilesystemType {
    Squashfs,
    Erofs,
}

impl FilesystemType {
    /// The kernel filesystem name, also used in media types.
    pub fn name(self) -> &'static str {
        match self {
            FilesystemType::Squashfs => "squashfs",
            FilesystemType::Erofs => "erofs",
        }
    }

    pub(crate) fn parse(name: &str) -> Option<Self> {
        match name {
            "squashfs" => Some(FilesystemType::Squashfs),
            "erofs" => Some(FilesystemType::Erofs),
            _ => None,
        }
    }

    /// Resolves a raw media-type string to its filesystem family by prefix.
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        [FilesystemType::Squashfs, FilesystemType::Erofs]
            .into_iter()
            .find(|fs| media_type.starts_with(&format!("{BASE_MEDIA_TYPE}.{}", fs.name())))
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Mounts an atom image at `target`.
///
/// Host root goes through the kernel (loop + verity); anyone else gets a
/// FUSE guest mount. A host-mount failure only falls back to the guest path
/// when no root hash was required, because a guest mount cannot verify one.
pub fn mount(
    filesystem: FilesystemType,
    image: &Path,
    target: &Path,
    root_hash: Option<&str>,
) -> Result<()> {
    if !procinfo::am_host_root() {
        return guest_mount(filesystem, image, target);
    }

    match mount::host_mount_image(image, filesystem, target, root_hash) {
        Ok(()) => Ok(()),
        Err(err) if root_hash.is_none() => {
            warn!(
                "host mount of '{}' failed, falling back to guest mount: {err}",
                image.display()
            );
            guest_mount(filesystem, image, target)
        }
        Err(err) => Err(err),
    }
}

fn guest_mount(filesystem: FilesystemType, image: &Path, target: &Path) -> Result<()> {
    let helper = fuse::helper_for(filesystem).ok_or_else(|| EnvironmentError::HelperNotFound {
        name: fuse::default_helper_name(filesystem).to_string(),
    })?;
    mount::guest_mount_image(image, target, helper)
}

/// Unmounts an atom mount and releases its backing device.
pub fn umount(target: &Path) -> Result<()> {
    mount::umount_image(target)
}

/// Extracts a single atom image into `dest` via the extractor policy.
pub fn extract_single(filesystem: FilesystemType, image: &Path, dest: &Path) -> Result<()> {
    extract::extract_single(filesystem, image, dest)
}

/// Builds a filesystem image from `rootfs_dir`, optionally appending verity
/// data. Returns a reader over the image blob, its media type, and the
/// verity root hash when one was produced. The image itself is unlinked once
/// opened.
pub fn make_filesystem(
    filesystem: FilesystemType,
    tempdir: &Path,
    rootfs_dir: &Path,
    excludes: Option<&ExcludePaths>,
    verity: bool,
) -> Result<(fs::File, String, Option<String>)> {
    let rendered_excludes = excludes.map(ExcludePaths::to_string).unwrap_or_default();
    let mut exclude_file = None;
    if !rendered_excludes.is_empty() {
        let file = tempfile::Builder::new()
            .prefix(&format!("atomfs-{filesystem}-exclude-"))
            .tempfile_in(tempdir)
            .message("failed to create exclude file")?;
        fs::write(file.path(), &rendered_excludes).message("failed to write exclude file")?;
        exclude_file = Some(file);
    }

    // Reserve a name for the mkfs tool to write to. The tools misbehave on
    // pre-existing output files, so the reservation is dropped (removing the
    // file) before mkfs runs; nothing else should be guessing names in the
    // caller's tempdir.
    let reserved = tempfile::Builder::new()
        .prefix(&format!("atomfs-{filesystem}-img-"))
        .tempfile_in(tempdir)
        .message("failed to create image file")?;
    let image = reserved.path().to_owned();
    drop(reserved);

    let compression = match filesystem {
        FilesystemType::Squashfs => {
            let mut cmd = Dependency::Mksquashfs.cmd();
            cmd.arg(rootfs_dir).arg(&image);
            let compression = if mksquashfs_supports_zstd() {
                cmd.arg("-comp").arg("zstd");
                Compression::Zstd
            } else {
                Compression::Gzip
            };
            if let Some(file) = &exclude_file {
                cmd.arg("-ef").arg(file.path());
            }
            cmd.run_and_check()?;
            compression
        }
        FilesystemType::Erofs => {
            let mut cmd = Dependency::MkfsErofs.cmd();
            cmd.arg(&image).arg(rootfs_dir);
            if let Some(file) = &exclude_file {
                cmd.arg("--exclude-path").arg(file.path());
            }
            cmd.run_and_check()?;
            Compression::Lz4hc
        }
    };

    let root_hash = if verity {
        Some(veritysetup::append_verity_data(&image)?)
    } else {
        None
    };

    let media_type = MediaType::new(filesystem, compression, verity).to_string();

    let blob = fs::File::open(&image).message("failed to open finished image")?;
    if let Err(err) = fs::remove_file(&image) {
        warn!("failed to remove scratch image '{}': {err}", image.display());
    }
    debug!("built {media_type} image from {}", rootfs_dir.display());

    Ok((blob, media_type, root_hash))
}

fn mksquashfs_supports_zstd() -> bool {
    static SUPPORTED: OnceCell<bool> = OnceCell::new();

    *SUPPORTED.get_or_init(|| {
        // mksquashfs --help exits nonzero; only the text matters
        let output = match Dependency::Mksquashfs.cmd().arg("--help").output() {
            Ok(output) => output,
            Err(_) => return false,
        };
        output.output().contains("zstd") || output.error_output().contains("zstd")
    })
}
