//! The dm-verity engine.
//!
//! All device-mapper work goes through the platform's `veritysetup` and
//! `dmsetup` tools; this module owns formatting (appending a hash tree to an
//! image), activation, validation, and teardown of verity devices.

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::anyhow;
use log::{debug, trace, warn};

use crate::{
    dependencies::{Dependency, DependencyError},
    error::{Error, ResourceError, Result, ResultExt, VerityError},
    files, losetup, mount, procinfo,
};

pub const VERITY_SUFFIX: &str = "verity";
pub const DEV_MAPPER_PATH: &str = "/dev/mapper";

const DEACTIVATE_ATTEMPTS: usize = 5;
const DEACTIVATE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Derives the mapper device name for an image: `<basename>-verity`.
pub fn verity_device_name(image: &Path) -> String {
    let base = image
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{base}-{VERITY_SUFFIX}")
}

/// Returns the dev-mapper path for the given device name.
pub fn device_path(name: impl AsRef<Path>) -> PathBuf {
    Path::new(DEV_MAPPER_PATH).join(name)
}

/// Appends a dm-verity hash tree to `image` in place and returns the root
/// hash as lowercase hex.
///
/// The image must already be 512-byte aligned (the mkfs wrappers pad to
/// 4 KiB). Data and hash block sizes are the page size; hash format is
/// version 1.
pub fn append_verity_data(image: &Path) -> Result<String> {
    let size = fs::symlink_metadata(image)
        .message(format!("failed to stat image '{}'", image.display()))?
        .len();
    if size % 512 != 0 {
        return Err(VerityError::MisalignedImage {
            image: image.to_owned(),
            size,
        }
        .into());
    }

    let block_size = procinfo::page_size();
    let report = Dependency::Veritysetup
        .cmd()
        .arg("format")
        .arg(image)
        .arg(image)
        .arg("--format=1")
        .arg("--hash=sha256")
        .arg(format!("--data-block-size={block_size}"))
        .arg(format!("--hash-block-size={block_size}"))
        .arg(format!("--data-blocks={}", size / block_size))
        .arg(format!("--hash-offset={size}"))
        .output_and_check()?;

    root_hash_from_format_report(&report).ok_or_else(|| VerityError::LibraryTooOld.into())
}

/// Extracts the root hash from a `veritysetup format` report.
fn root_hash_from_format_report(report: &str) -> Option<String> {
    report.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() == "Root hash" {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_lowercase())
        } else {
            None
        }
    })
}

/// Kernel-mounts an image read-only at `target`, going through a verity
/// mapper device when a root hash is given.
///
/// `image_size` is the full size of the image file; `verity_offset` is where
/// the appended hash tree begins (equal to `image_size` when there is none).
pub fn host_mount(
    image: &Path,
    fstype: &str,
    target: &Path,
    root_hash: Option<&str>,
    image_size: u64,
    verity_offset: u64,
) -> Result<()> {
    match root_hash {
        None if verity_offset != image_size => Err(VerityError::DataPresentNoHash {
            image: image.to_owned(),
        }
        .into()),
        Some(_) if verity_offset == image_size => Err(VerityError::RequestedNoData {
            image: image.to_owned(),
        }
        .into()),
        Some(hash) => host_mount_verity(image, fstype, target, hash, verity_offset),
        // No verity data at all: plain read-only loop mount. `mount -o loop`
        // marks the loop device autoclear, so unmount detaches it.
        None => mount::mount_ro_loop(image, target, fstype),
    }
}

fn host_mount_verity(
    image: &Path,
    fstype: &str,
    target: &Path,
    root_hash: &str,
    verity_offset: u64,
) -> Result<()> {
    let name = verity_device_name(image);
    let device = device_path(&name);

    // Device-mapper names are global: another molecule may already have
    // activated this atom. Reuse it, but never without re-checking it.
    let mut created_loop = None;
    if files::path_exists(&device) {
        confirm_device_hash(&device, root_hash, false)?;
    } else {
        let loop_device = losetup::attach_read_only(image)?;
        if let Err(err) = activate(&name, &loop_device, root_hash, verity_offset) {
            detach_quietly(&loop_device);
            return Err(err);
        }
        created_loop = Some(loop_device);
    }

    if let Err(err) = confirm_device_validity(&device) {
        release_created(&name, created_loop.as_deref());
        return Err(err);
    }

    if let Err(err) = mount::mount_ro(&device, target, fstype) {
        release_created(&name, created_loop.as_deref());
        return Err(err);
    }

    Ok(())
}

fn activate(name: &str, loop_device: &Path, root_hash: &str, verity_offset: u64) -> Result<()> {
    // each hex char encodes four bits of the volume key
    hex::decode(root_hash).map_err(|_| VerityError::InvalidRootHash {
        hash: root_hash.to_string(),
    })?;

    Dependency::Veritysetup
        .cmd()
        .arg("open")
        .arg(loop_device)
        .arg(name)
        .arg(loop_device)
        .arg(root_hash)
        .arg(format!("--hash-offset={verity_offset}"))
        .run_and_check()
        .map_err(|source| {
            Error::from(ResourceError::MapperActivateFailed {
                name: name.to_string(),
                source: anyhow::Error::new(*source),
            })
        })
}

/// Tears down a mapper device and loop device that were created by this
/// call's failed mount attempt. Pre-existing devices are left alone.
fn release_created(name: &str, created_loop: Option<&Path>) {
    let Some(loop_device) = created_loop else {
        return;
    };
    if let Err(err) = deactivate_with_retry(name) {
        warn!("cleanup: failed to remove verity device '{name}': {err}");
    }
    detach_quietly(loop_device);
}

fn detach_quietly(loop_device: &Path) {
    if let Err(err) = losetup::detach(loop_device) {
        warn!(
            "cleanup: failed to detach loop device '{}': {err}",
            loop_device.display()
        );
    }
}

/// Tears down the verity device at `source` (a `/dev/mapper/...-verity`
/// path) and the loop device backing it. Devices that no longer exist are
/// treated as already cleaned up.
pub fn verity_unmount(source: &Path) -> Result<()> {
    let Some(loop_number) = find_loop_backing_verity(source)? else {
        return Ok(());
    };

    let name = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    deactivate_with_retry(&name)?;

    losetup::detach(&PathBuf::from(format!("/dev/loop{loop_number}")))
}

/// Finds the single loop device backing a mapper device via
/// `/sys/block/dm-<minor>/slaves/`. Returns `None` when the mapper device is
/// already gone.
fn find_loop_backing_verity(device: &Path) -> Result<Option<u64>> {
    let st = match nix::sys::stat::stat(device) {
        Err(nix::errno::Errno::ENOENT) => return Ok(None),
        other => other.message(format!("failed to stat '{}'", device.display()))?,
    };
    let minor = nix::sys::stat::minor(st.st_rdev);

    let slaves_dir = format!("/sys/block/dm-{minor}/slaves");
    let entries = match fs::read_dir(&slaves_dir) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        other => other.message(format!("failed to read '{slaves_dir}'"))?,
    };

    let names = entries
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<std::io::Result<Vec<_>>>()
        .message(format!("failed to read '{slaves_dir}'"))?;

    if names.len() != 1 {
        return Err(Error::Internal {
            context: format!("too many slaves for '{}'", device.display()).into(),
            source: anyhow!("expected one slave in {slaves_dir}, found {:?}", names),
        });
    }

    let number = names[0]
        .strip_prefix("loop")
        .and_then(|n| n.parse::<u64>().ok())
        .ok_or_else(|| Error::Internal {
            context: format!("bad loop device '{}'", names[0]).into(),
            source: anyhow!("slave of {slaves_dir} is not a loop device"),
        })?;

    Ok(Some(number))
}

/// Removes a mapper device. EROFS is prone to transiently reporting EBUSY
/// right after unmount, so retry a few times before giving up.
fn deactivate_with_retry(name: &str) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match Dependency::Dmsetup.cmd().arg("remove").arg(name).run_and_check() {
            Ok(()) => return Ok(()),
            Err(err) if is_missing_device(&err) => {
                debug!("verity device '{name}' already removed");
                return Ok(());
            }
            Err(err) if is_busy(&err) && attempt < DEACTIVATE_ATTEMPTS => {
                trace!("verity device '{name}' busy, retrying ({attempt}/{DEACTIVATE_ATTEMPTS})");
                thread::sleep(DEACTIVATE_RETRY_DELAY);
            }
            Err(err) => {
                return Err(ResourceError::MapperRemoveFailed {
                    name: name.to_string(),
                    source: anyhow::Error::new(*err),
                }
                .into())
            }
        }
    }
}

fn is_busy(err: &DependencyError) -> bool {
    matches!(
        err,
        DependencyError::ExecutionFailed { stderr, .. } if stderr.to_lowercase().contains("busy")
    )
}

fn is_missing_device(err: &DependencyError) -> bool {
    match err {
        DependencyError::ExecutionFailed { stderr, .. } => {
            let stderr = stderr.to_lowercase();
            stderr.contains("not found") || stderr.contains("no such device")
        }
        _ => false,
    }
}

/// Checks that the root hash in a device's verity table matches `expected`.
///
/// When `allow_failure` is set, a failure to query the table at all (e.g. a
/// FUSE-backed source that is no dm device) is treated as success; an actual
/// mismatch never is.
pub fn confirm_device_hash(device: &Path, expected: &str, allow_failure: bool) -> Result<()> {
    let name = device_basename(device);
    let table = match Dependency::Dmsetup.cmd().arg("table").arg(&name).output_and_check() {
        Ok(table) => table,
        Err(err) => {
            if allow_failure {
                debug!("cannot read verity table for '{name}', allowed by configuration: {err}");
                return Ok(());
            }
            return Err(err.into());
        }
    };

    let params = verity_target_params(&table, &name)?;
    // https://gitlab.com/cryptsetup/cryptsetup/-/wikis/DMVerity:
    // version data_dev hash_dev data_block_size hash_block_size num_blocks
    // hash_start algorithm digest salt
    if params.len() < 10 {
        return Err(VerityError::UnexpectedStatus {
            device: name,
            status: params.join(" "),
        }
        .into());
    }

    let found = params[8];
    if found != expected {
        return Err(VerityError::HashMismatch {
            device: name,
            expected: expected.to_string(),
            found: found.to_string(),
        }
        .into());
    }

    Ok(())
}

/// Checks a verity device's live status: `V` means every block read so far
/// verified, `C` means corruption has been detected.
pub fn confirm_device_validity(device: &Path) -> Result<()> {
    let name = device_basename(device);
    let status = Dependency::Dmsetup
        .cmd()
        .arg("status")
        .arg(&name)
        .output_and_check()?;

    let params = verity_target_params(&status, &name)?;
    match params.as_slice() {
        ["V"] => Ok(()),
        ["C"] => Err(VerityError::CorruptionDetected { device: name }.into()),
        other => Err(VerityError::UnexpectedStatus {
            device: name,
            status: other.join(" "),
        }
        .into()),
    }
}

fn device_basename(device: &Path) -> String {
    device
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| device.to_string_lossy().into_owned())
}

/// Splits one line of `dmsetup table`/`dmsetup status` output and returns
/// the target parameters after checking the target type is `verity`.
fn verity_target_params<'a>(output: &'a str, device: &str) -> Result<Vec<&'a str>> {
    let fields: Vec<&str> = output.split_whitespace().collect();
    // "<start> <length> <target-type> <params...>"
    if fields.len() < 3 || fields[2] != "verity" {
        return Err(VerityError::NotAVerityDevice {
            device: device.to_string(),
        }
        .into());
    }
    Ok(fields[3..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    use crate::error::VerityError;

    #[test]
    fn test_verity_device_name() {
        assert_eq!(
            verity_device_name(Path::new("/oci/blobs/sha256/abcd")),
            "abcd-verity"
        );
        assert_eq!(device_path("abcd-verity"), Path::new("/dev/mapper/abcd-verity"));
    }

    #[test]
    fn test_root_hash_from_format_report() {
        let report = indoc! {"
            VERITY header information for /tmp/img
            UUID:            	6d0cb5ad-6035-44a9-b6fb-f4b9e8a1a055
            Hash type:       	1
            Data blocks:     	256
            Data block size: 	4096
            Hash blocks:     	3
            Hash block size: 	4096
            Hash algorithm:  	sha256
            Salt:            	f5eb45a51f31bd2aa2c80bcf1a0b967f219021b63d8a12b6b5e8a1f3bcf26725
            Root hash:      	9e74f2e8a33b25e5b09c5d35b0f4bcb0d71e74be96180c34a93fe046fc51b0bf
        "};

        assert_eq!(
            root_hash_from_format_report(report).as_deref(),
            Some("9e74f2e8a33b25e5b09c5d35b0f4bcb0d71e74be96180c34a93fe046fc51b0bf")
        );

        // old veritysetup: no root hash line at all
        assert_eq!(root_hash_from_format_report("VERITY header information\n"), None);
        assert_eq!(root_hash_from_format_report("Root hash:\n"), None);
    }

    #[test]
    fn test_verity_target_params() {
        let table = "0 802816 verity 1 7:1 7:1 4096 4096 98 99 sha256 \
                     fb1a5a0f00deb908d8b53cb270858975e76cf64105d412ce4417bccf05e8693e \
                     1f951588446c7aede57674dfd9b0a7ef7dd7b18f40cb13ae535c86e0b067143a";
        let params = verity_target_params(table, "img-verity").unwrap();
        assert_eq!(params.len(), 10);
        assert_eq!(
            params[8],
            "fb1a5a0f00deb908d8b53cb270858975e76cf64105d412ce4417bccf05e8693e"
        );

        let err = verity_target_params("0 8 linear 7:1 0", "img").unwrap_err();
        assert!(matches!(
            err,
            Error::Verity(VerityError::NotAVerityDevice { .. })
        ));
    }

    #[test]
    fn test_host_mount_hash_data_agreement() {
        // verity data present but no hash given
        let err = host_mount(
            Path::new("/img"),
            "squashfs",
            Path::new("/mnt"),
            None,
            8192,
            4096,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Verity(VerityError::DataPresentNoHash { .. })
        ));

        // hash given but no verity data present
        let err = host_mount(
            Path::new("/img"),
            "squashfs",
            Path::new("/mnt"),
            Some("abcd"),
            8192,
            8192,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Verity(VerityError::RequestedNoData { .. })
        ));
    }

    #[test]
    fn test_busy_classification() {
        let busy = DependencyError::ExecutionFailed {
            dependency: Dependency::Dmsetup,
            rendered_command: "dmsetup remove x".into(),
            code: Some(1),
            signal: None,
            stdout: String::new(),
            stderr: "device-mapper: remove ioctl on x failed: Device or resource busy\n".into(),
            explanation: "process exited with status: 1".into(),
            output: String::new(),
        };
        assert!(is_busy(&busy));
        assert!(!is_missing_device(&busy));

        let missing = DependencyError::ExecutionFailed {
            dependency: Dependency::Dmsetup,
            rendered_command: "dmsetup remove x".into(),
            code: Some(1),
            signal: None,
            stdout: String::new(),
            stderr: "Device x not found\n".into(),
            explanation: "process exited with status: 1".into(),
            output: String::new(),
        };
        assert!(is_missing_device(&missing));
        assert!(!is_busy(&missing));
    }
}
