//! Loop-device management through `losetup`.

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use log::trace;

use crate::{
    dependencies::Dependency,
    error::{Error, ResourceError, Result},
    files,
};

/// Attaches a read-only loop device to `image` and returns its path.
pub fn attach_read_only(image: &Path) -> Result<PathBuf> {
    let output = Dependency::Losetup
        .cmd()
        .arg("--find")
        .arg("--show")
        .arg("--read-only")
        .arg(image)
        .output_and_check()
        .map_err(|source| {
            Error::from(ResourceError::LoopAttachFailed {
                image: image.to_owned(),
                source: anyhow::Error::new(*source),
            })
        })?;

    let device = output.trim();
    if device.is_empty() {
        return Err(ResourceError::LoopAttachFailed {
            image: image.to_owned(),
            source: anyhow!("losetup did not report a device"),
        }
        .into());
    }

    trace!("attached {} -> {}", image.display(), device);
    Ok(PathBuf::from(device))
}

/// Detaches a loop device. A device that no longer exists counts as already
/// detached (the kernel lazily destroys loop devices whose last user is gone).
pub fn detach(device: &Path) -> Result<()> {
    if !files::path_exists(device) {
        return Ok(());
    }

    Dependency::Losetup
        .cmd()
        .arg("--detach")
        .arg(device)
        .run_and_check()
        .map_err(|source| {
            Error::from(ResourceError::LoopDetachFailed {
                device: device.to_owned(),
                source: anyhow::Error::new(*source),
            })
        })
}
