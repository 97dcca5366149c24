//! Structured error surface for the atomfs engine.
//!
//! Errors are grouped by domain so callers can match on the failure class
//! without string inspection. Variants that wrap a lower-level failure carry
//! it as an `anyhow::Error` source; the CLI renders the full chain.

use std::{borrow::Cow, path::PathBuf, time::Duration};

use crate::dependencies::DependencyError;
use crate::oci::{VERITY_ROOT_HASH_ANNOTATION, VERITY_ROOT_HASH_ANNOTATION_LEGACY};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Verity(#[from] VerityError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    Dependency(#[from] Box<DependencyError>),

    #[error("{context}")]
    Internal {
        context: Cow<'static, str>,
        #[source]
        source: anyhow::Error,
    },

    #[error("{}", summarize_umount_errors(.0))]
    UmountErrors(Vec<Error>),
}

fn summarize_umount_errors(errors: &[Error]) -> String {
    let mut msg = format!("encountered {} error(s) during unmount:", errors.len());
    for err in errors {
        msg.push_str("\n  ");
        msg.push_str(&err.to_string());
    }
    msg
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("bad mount spec '{spec}', expected <ocidir>:<tag>")]
    BadMountSpec { spec: String },

    #[error("mount target '{}' is not absolute", .path.display())]
    TargetNotAbsolute { path: PathBuf },

    #[error("invalid metadata directory '{}': must be an absolute path", .path.display())]
    InvalidMetadir { path: PathBuf },

    #[error("--persist requires a non-empty directory argument")]
    EmptyPersistPath,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("'{}' exists: cowardly refusing to mess with it", .metadir.display())]
    AlreadyMounted { metadir: PathBuf },

    #[error("'{}' is not an atomfs mountpoint", .target.display())]
    NotAnAtomfsMount { target: PathBuf },

    #[error("'{}' is not a mountpoint", .path.display())]
    NotAMountpoint { path: PathBuf },
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("unknown media type '{media_type}'")]
    UnknownMediaType { media_type: String },

    #[error("image '{}' is truncated", .path.display())]
    TruncatedImage { path: PathBuf },

    #[error(
        "image '{}' has bad magic 0x{found:08x} (expected 0x{expected:08x})",
        .path.display()
    )]
    BadMagic {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error(
        "image '{}' uses unsupported incompatible features 0x{features:x}",
        .path.display()
    )]
    UnsupportedFeature { path: PathBuf, features: u32 },

    #[error(
        "image '{}' superblock checksum mismatch: computed 0x{computed:08x}, expected 0x{expected:08x}",
        .path.display()
    )]
    ChecksumMismatch {
        path: PathBuf,
        computed: u32,
        expected: u32,
    },

    #[error("image '{}' has unsupported block size {block_size}", .path.display())]
    UnsupportedBlockSize { path: PathBuf, block_size: u64 },

    #[error("bad digest '{digest}'")]
    BadDigest { digest: String },

    #[error("tag '{tag}' not found in OCI index")]
    TagNotFound { tag: String },
}

#[derive(Debug, thiserror::Error)]
pub enum VerityError {
    #[error(
        "atom {digest} has no verity root hash in '{}' or '{}'",
        VERITY_ROOT_HASH_ANNOTATION,
        VERITY_ROOT_HASH_ANNOTATION_LEGACY
    )]
    MissingVerity { digest: String },

    #[error("'{}' has verity data appended but no root hash was given", .image.display())]
    DataPresentNoHash { image: PathBuf },

    #[error("verity requested for '{}' but the image has no verity data", .image.display())]
    RequestedNoData { image: PathBuf },

    #[error("invalid root hash for {device}: device reports {found}, expected {expected}")]
    HashMismatch {
        device: String,
        expected: String,
        found: String,
    },

    #[error("verity reports corruption on device '{device}'")]
    CorruptionDetected { device: String },

    #[error("unexpected verity status '{status}' for device '{device}'")]
    UnexpectedStatus { device: String, status: String },

    #[error("'{device}' is not a dm-verity device")]
    NotAVerityDevice { device: String },

    #[error("veritysetup did not report a root hash; veritysetup >= 2.3.0 is required")]
    LibraryTooOld,

    #[error(
        "bad verity image size {size} for '{}': must be 512-byte aligned",
        .image.display()
    )]
    MisalignedImage { image: PathBuf, size: u64 },

    #[error("invalid verity root hash '{hash}'")]
    InvalidRootHash { hash: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("failed to attach loop device for '{}'", .image.display())]
    LoopAttachFailed {
        image: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to detach loop device '{}'", .device.display())]
    LoopDetachFailed {
        device: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to activate verity device '{name}'")]
    MapperActivateFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to remove verity device '{name}'")]
    MapperRemoveFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to mount '{}'", .target.display())]
    MountFailed {
        target: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to unmount '{}'", .target.display())]
    UnmountFailed {
        target: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "overlay mount options are {len} bytes, over the kernel's 4096-byte limit: too many layers"
    )]
    TooManyLayers { len: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("no '{name}' in PATH")]
    HelperNotFound { name: String },

    #[error(
        "gave up on {helper} mount of '{}' after {timeout:?}",
        .image.display()
    )]
    HelperTimeout {
        helper: String,
        image: PathBuf,
        timeout: Duration,
    },

    #[error("not running as host root")]
    NotPrivileged,

    #[error("won't guest-mount an image with verity data without --allow-missing-verity")]
    GuestVerityUnsupported,

    #[error("unknown extractor '{name}'")]
    UnknownExtractor { name: String },

    #[error("no suitable extractor found:\n  {excuses}")]
    NoUsableExtractor { excuses: String },
}

/// Attach a context message to any error, wrapping it as [`Error::Internal`].
///
/// This is for plumbing failures (I/O, parsing) that have no dedicated
/// variant; domain failures should construct their variant directly.
pub trait ResultExt<T> {
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T> {
        self.map_err(|source| Error::Internal {
            context: context.into(),
            source: source.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_umount_error_summary() {
        let err = Error::UmountErrors(vec![
            StateError::NotAMountpoint {
                path: PathBuf::from("/mnt/a"),
            }
            .into(),
            VerityError::CorruptionDetected {
                device: "/dev/mapper/x-verity".into(),
            }
            .into(),
        ]);

        let msg = err.to_string();
        assert!(msg.starts_with("encountered 2 error(s) during unmount:"));
        assert!(msg.contains("'/mnt/a' is not a mountpoint"));
        assert!(msg.contains("corruption on device '/dev/mapper/x-verity'"));
    }

    #[test]
    fn test_message_extension_wraps_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Err::<(), _>(io_err).message("reading mount table").unwrap_err();
        assert_eq!(err.to_string(), "reading mount table");
        assert!(std::error::Error::source(&err).is_some());
    }
}
