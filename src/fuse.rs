//! FUSE helper discovery and mounting.
//!
//! Helpers are found once per process. A spawned helper signals readiness
//! through a notify pipe when it is new enough; otherwise the mountpoint is
//! polled for a change, because FUSE gives us no other completion signal.

use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use log::{debug, info};
use once_cell::sync::OnceCell;
use semver::Version;

use crate::{
    error::{EnvironmentError, Error, ResourceError, Result, ResultExt},
    files,
    filesystems::FilesystemType,
};

const MOUNT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A FUSE helper binary found in PATH.
#[derive(Debug, Clone)]
pub struct FuseHelper {
    pub path: PathBuf,
    pub version: Option<Version>,
    pub supports_notify: bool,
    filesystem: FilesystemType,
}

impl FuseHelper {
    /// The helper's binary name, e.g. `squashfuse_ll`.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

static SQUASHFUSE: OnceCell<Option<FuseHelper>> = OnceCell::new();
static EROFSFUSE: OnceCell<Option<FuseHelper>> = OnceCell::new();

/// The canonical helper name for a filesystem family, for error messages.
pub fn default_helper_name(filesystem: FilesystemType) -> &'static str {
    match filesystem {
        FilesystemType::Squashfs => "squashfuse",
        FilesystemType::Erofs => "erofsfuse",
    }
}

/// Returns the FUSE helper for a filesystem family, discovering it on first
/// use.
pub fn helper_for(filesystem: FilesystemType) -> Option<&'static FuseHelper> {
    let cell = match filesystem {
        FilesystemType::Squashfs => &SQUASHFUSE,
        FilesystemType::Erofs => &EROFSFUSE,
    };
    cell.get_or_init(|| discover(filesystem)).as_ref()
}

fn discover(filesystem: FilesystemType) -> Option<FuseHelper> {
    let candidates: &[&str] = match filesystem {
        FilesystemType::Squashfs => &["squashfuse_ll", "squashfuse"],
        FilesystemType::Erofs => &["erofsfuse"],
    };

    let path = candidates
        .iter()
        .find_map(|candidate| which::which(candidate).ok())?;
    let version = probe_version(&path);

    // the squashfuse notify mechanism was merged in 0.5.0
    let supports_notify = filesystem == FilesystemType::Squashfs
        && version
            .as_ref()
            .is_some_and(|v| *v >= Version::new(0, 5, 0));

    info!(
        "found {} at {} (version={} notify={supports_notify})",
        default_helper_name(filesystem),
        path.display(),
        version
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown".into()),
    );

    Some(FuseHelper {
        path,
        version,
        supports_notify,
        filesystem,
    })
}

/// Runs the helper with no arguments and parses the version out of its usage
/// banner (first line, second word). The helpers exit nonzero here, which is
/// fine.
fn probe_version(path: &Path) -> Option<Version> {
    let output = Command::new(path).output().ok()?;
    let text = if output.stdout.is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    let text = String::from_utf8_lossy(&text);
    let banner = text.lines().next()?;
    let word = banner.split_whitespace().nth(1)?;
    Version::parse(word).ok()
}

/// Spawns the helper to mount `image` at `target` and waits for the mount to
/// become ready. On success the helper keeps running and outlives this
/// process; on timeout it is killed.
pub fn mount_and_wait(helper: &FuseHelper, image: &Path, target: &Path) -> Result<()> {
    let pre = fs::symlink_metadata(target)
        .message(format!("failed to stat '{}'", target.display()))?;
    if pre.file_type().is_symlink() {
        return Err(Error::Internal {
            context: format!("refusing to mount onto a symbolic link '{}'", target.display())
                .into(),
            source: anyhow!("mountpoint is a symlink"),
        });
    }

    // given a target of path/to/some/dir, log to path/to/some/.dir-<helper>.log
    let log_path = target
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(
            ".{}-{}.log",
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            helper.name()
        ));
    let mut log_file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .message(format!("failed to open '{}' for write", log_path.display()))?;

    // the notify FIFO outlives the spawn but not this function
    let _notify_dir;
    let mut notify_path = None;
    if helper.supports_notify {
        let dir = tempfile::tempdir().message("failed to create notify pipe directory")?;
        let path = dir.path().join("notifypipe");
        _notify_dir = dir;
        nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o640))
            .message("failed to create notify pipe")?;
        notify_path = Some(path);
    }

    let mut options = match helper.filesystem {
        FilesystemType::Squashfs => String::from("allow_other,debug"),
        FilesystemType::Erofs => String::from("debug"),
    };
    if let Some(pipe) = &notify_path {
        options.push_str(&format!(",notify_pipe={}", pipe.display()));
    }

    let mut command = Command::new(&helper.path);
    command
        .arg("-f")
        .arg("-o")
        .arg(&options)
        .arg(image)
        .arg(target)
        .stdin(Stdio::null());

    writeln!(log_file, "# {} -f -o {} {} {}", helper.path.display(), options, image.display(), target.display())
        .message(format!("failed writing to '{}'", log_path.display()))?;

    let stdout = log_file
        .try_clone()
        .message("failed to clone helper log handle")?;
    command.stdout(Stdio::from(stdout)).stderr(Stdio::from(log_file));

    debug!(
        "mounting {} -> {} with {} [{}]",
        image.display(),
        target.display(),
        helper.name(),
        log_path.display()
    );
    let mut child = command
        .spawn()
        .message(format!("failed to spawn {}", helper.name()))?;

    // The reader thread blocks on the FIFO until the helper writes its
    // readiness byte; if the helper dies first the main loop notices via
    // try_wait and the thread is abandoned with the process.
    let notify_rx = notify_path.as_ref().map(|pipe| {
        let (tx, rx) = mpsc::channel();
        let pipe = pipe.clone();
        thread::spawn(move || {
            if let Ok(mut fifo) = fs::File::open(&pipe) {
                let mut byte = [0u8; 1];
                if fifo.read_exact(&mut byte).is_ok() {
                    let _ = tx.send(byte[0]);
                }
            }
        });
        rx
    });

    // Wait for one of three things: the child exits (an error), readiness is
    // signalled, or the deadline passes.
    let start = Instant::now();
    let mut polls = 0u32;
    loop {
        if let Some(status) = child
            .try_wait()
            .message(format!("failed to wait on {}", helper.name()))?
        {
            return Err(ResourceError::MountFailed {
                target: target.to_owned(),
                source: anyhow!(
                    "{} exited unexpectedly with {status}, check '{}'",
                    helper.name(),
                    log_path.display()
                ),
            }
            .into());
        }

        match &notify_rx {
            Some(rx) => match rx.try_recv() {
                Ok(b's') => break,
                Ok(_) => {
                    return Err(ResourceError::MountFailed {
                        target: target.to_owned(),
                        source: anyhow!(
                            "{} reported an error, check '{}'",
                            helper.name(),
                            log_path.display()
                        ),
                    }
                    .into());
                }
                Err(mpsc::TryRecvError::Empty) | Err(mpsc::TryRecvError::Disconnected) => {}
            },
            None => {
                if files::file_changed(&pre, target) {
                    break;
                }
            }
        }

        if start.elapsed() > MOUNT_WAIT_TIMEOUT {
            let _ = child.kill();
            return Err(EnvironmentError::HelperTimeout {
                helper: helper.name(),
                image: image.to_owned(),
                timeout: MOUNT_WAIT_TIMEOUT,
            }
            .into());
        }

        polls += 1;
        if polls % 10 == 1 {
            debug!(
                "{} is not yet mounted... ({:?})",
                target.display(),
                start.elapsed()
            );
        }
        thread::sleep(MOUNT_POLL_INTERVAL);
    }

    debug!(
        "{} mounted ({}) {} -> {}",
        helper.name(),
        child.id(),
        image.display(),
        target.display()
    );
    // dropping the Child releases the helper without killing it
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_helper_names() {
        assert_eq!(default_helper_name(FilesystemType::Squashfs), "squashfuse");
        assert_eq!(default_helper_name(FilesystemType::Erofs), "erofsfuse");
    }

    #[test]
    fn test_notify_version_gate() {
        assert!(Version::parse("0.5.0").unwrap() >= Version::new(0, 5, 0));
        assert!(Version::parse("0.5.2").unwrap() >= Version::new(0, 5, 0));
        assert!(Version::parse("0.1.104").unwrap() < Version::new(0, 5, 0));
    }
}
