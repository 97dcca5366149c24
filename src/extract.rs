//! The extractor policy: a prioritized pipeline of ways to get at an atom's
//! contents, with a sticky process-wide selection.
//!
//! The first extractor whose mount succeeds is used for every later call in
//! this process. Loop and mapper devices are globally contended, so trying
//! them anew for each atom would just rediscover the same answer slowly.

use std::{
    collections::BTreeMap,
    env,
    path::Path,
    sync::{Mutex, PoisonError},
};

use log::{debug, warn};
use once_cell::sync::OnceCell;

use crate::{
    dependencies::Dependency,
    error::{EnvironmentError, Error, Result, ResultExt},
    files,
    filesystems::FilesystemType,
    fuse, mount,
    mountinfo::MountTable,
    procinfo,
};

pub const SQUASHFS_POLICY_ENV: &str = "STACKER_SQUASHFS_EXTRACT_POLICY";
pub const EROFS_POLICY_ENV: &str = "STACKER_EROFS_EXTRACT_POLICY";

const DEFAULT_SQUASHFS_POLICY: &str = "kmount squashfuse unsquashfs";
const DEFAULT_EROFS_POLICY: &str = "kmount erofsfuse fsck.erofs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractorKind {
    /// Kernel loop mount; needs host root.
    Kernel,
    /// FUSE helper mount.
    Fuse,
    /// Unpack the image contents into the destination directory.
    Unpack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extractor {
    kind: ExtractorKind,
    filesystem: FilesystemType,
}

impl Extractor {
    fn name(&self) -> &'static str {
        match (self.kind, self.filesystem) {
            (ExtractorKind::Kernel, _) => "kmount",
            (ExtractorKind::Fuse, FilesystemType::Squashfs) => "squashfuse",
            (ExtractorKind::Fuse, FilesystemType::Erofs) => "erofsfuse",
            (ExtractorKind::Unpack, FilesystemType::Squashfs) => "unsquashfs",
            (ExtractorKind::Unpack, FilesystemType::Erofs) => "fsck.erofs",
        }
    }

    fn from_name(name: &str, filesystem: FilesystemType) -> Option<Self> {
        [ExtractorKind::Kernel, ExtractorKind::Fuse, ExtractorKind::Unpack]
            .into_iter()
            .map(|kind| Extractor { kind, filesystem })
            .find(|extractor| extractor.name() == name)
    }

    /// Returns the excuse for why this extractor cannot run, if any.
    fn availability(&self) -> std::result::Result<(), String> {
        match self.kind {
            ExtractorKind::Kernel => {
                if procinfo::am_host_root() {
                    Ok(())
                } else {
                    Err("not host root".into())
                }
            }
            ExtractorKind::Fuse => {
                if fuse::helper_for(self.filesystem).is_some() {
                    Ok(())
                } else {
                    Err(format!(
                        "no '{}' in PATH",
                        fuse::default_helper_name(self.filesystem)
                    ))
                }
            }
            ExtractorKind::Unpack => {
                let dependency = unpack_dependency(self.filesystem);
                if dependency.exists() {
                    Ok(())
                } else {
                    Err(format!("no '{}' in PATH", dependency.name()))
                }
            }
        }
    }

    /// Mounts or extracts `image` at `dest`. Already-done is success.
    fn mount(&self, image: &Path, dest: &Path) -> Result<()> {
        match self.kind {
            ExtractorKind::Kernel => {
                if is_mounted_at_dir(dest)? {
                    return Ok(());
                }
                mount::mount_ro_loop(image, dest, self.filesystem.name())
            }
            ExtractorKind::Fuse => {
                if is_mounted_at_dir(dest)? {
                    debug!("[{}] {} already mounted -> {}", self.name(), image.display(), dest.display());
                    return Ok(());
                }
                let helper = fuse::helper_for(self.filesystem).ok_or_else(|| {
                    EnvironmentError::HelperNotFound {
                        name: fuse::default_helper_name(self.filesystem).to_string(),
                    }
                })?;
                fuse::mount_and_wait(helper, image, dest)
            }
            ExtractorKind::Unpack => unpack(self.filesystem, image, dest),
        }
    }
}

fn unpack_dependency(filesystem: FilesystemType) -> Dependency {
    match filesystem {
        FilesystemType::Squashfs => Dependency::Unsquashfs,
        FilesystemType::Erofs => Dependency::FsckErofs,
    }
}

fn is_mounted_at_dir(dest: &Path) -> Result<bool> {
    let metadata = match std::fs::metadata(dest) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        other => other.message(format!("failed to stat '{}'", dest.display()))?,
    };
    if !metadata.is_dir() {
        return Ok(false);
    }
    let dest = files::absolute(dest).message("failed to absolutize extract dir")?;
    Ok(MountTable::read()?.is_mountpoint(dest))
}

fn unpack(filesystem: FilesystemType, image: &Path, dest: &Path) -> Result<()> {
    // an already-populated directory means a previous extraction finished
    if !files::is_empty_dir(dest)
        .message(format!("failed to read extract dir '{}'", dest.display()))?
    {
        return Ok(());
    }

    debug!("{} {} -> {}", unpack_dependency(filesystem).name(), image.display(), dest.display());
    let result = match filesystem {
        FilesystemType::Squashfs => Dependency::Unsquashfs
            .cmd()
            .arg("-f")
            .arg("-d")
            .arg(dest)
            .arg(image)
            .run_and_check(),
        FilesystemType::Erofs => Dependency::FsckErofs
            .cmd()
            .arg(format!("--extract={}", dest.display()))
            .arg(image)
            .run_and_check(),
    };

    if let Err(err) = result {
        if let Err(rm_err) = std::fs::remove_dir_all(dest) {
            warn!(
                "failed to remove '{}' after failed extraction of '{}': {rm_err}",
                dest.display(),
                image.display()
            );
        }
        return Err(err.into());
    }

    // extraction must create files, so an empty dir is a broken image
    if files::is_empty_dir(dest)
        .message(format!("failed to read extract dir '{}'", dest.display()))?
    {
        return Err(Error::Internal {
            context: format!("'{}' was an empty fs image", image.display()).into(),
            source: anyhow::anyhow!("extraction produced no files"),
        });
    }

    Ok(())
}

#[derive(Debug, Default)]
struct PolicyState {
    selected: Option<Extractor>,
    excuses: BTreeMap<&'static str, String>,
    init_failed: Option<String>,
}

/// An ordered set of extractors for one filesystem family.
#[derive(Debug)]
pub struct ExtractPolicy {
    extractors: Vec<Extractor>,
    state: Mutex<PolicyState>,
}

impl ExtractPolicy {
    /// Builds a policy from a whitespace-separated list of extractor names.
    /// Unavailable extractors are kept out of the pipeline with an excuse;
    /// an unknown name fails construction.
    fn build(
        filesystem: FilesystemType,
        spec: &str,
    ) -> std::result::Result<ExtractPolicy, String> {
        let mut extractors = Vec::new();
        let mut excuses = BTreeMap::new();

        for name in spec.split_whitespace() {
            let extractor =
                Extractor::from_name(name, filesystem).ok_or_else(|| name.to_string())?;
            match extractor.availability() {
                Ok(()) => extractors.push(extractor),
                Err(excuse) => {
                    debug!("{} extractor {name} is not available: {excuse}", filesystem.name());
                    excuses.insert(extractor.name(), excuse);
                }
            }
        }

        Ok(ExtractPolicy {
            extractors,
            state: Mutex::new(PolicyState {
                selected: None,
                excuses,
                init_failed: None,
            }),
        })
    }

    /// Mounts or extracts `image` at `dest` with the selected extractor,
    /// electing one on first use. Initialization and extraction are mutually
    /// exclusive across threads.
    fn extract(&self, image: &Path, dest: &Path) -> Result<()> {
        files::create_dirs(dest).message("failed to create extract dir")?;
        let dest = files::absolute(dest).message("failed to absolutize extract dir")?;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(selected) = state.selected {
            return selected.mount(image, &dest);
        }
        if let Some(excuses) = &state.init_failed {
            return Err(EnvironmentError::NoUsableExtractor {
                excuses: excuses.clone(),
            }
            .into());
        }

        for extractor in &self.extractors {
            match extractor.mount(image, &dest) {
                Ok(()) => {
                    debug!("selected {} extractor {}", extractor.filesystem.name(), extractor.name());
                    state.selected = Some(*extractor);
                    return Ok(());
                }
                Err(err) => {
                    let chain = format!("{:#}", anyhow::Error::new(err));
                    state.excuses.insert(extractor.name(), chain);
                }
            }
        }

        let summary = state
            .excuses
            .iter()
            .map(|(name, excuse)| format!("{name}: {excuse}"))
            .collect::<Vec<_>>()
            .join("\n  ");
        let summary = if summary.is_empty() {
            "policy had no extractors".to_string()
        } else {
            summary
        };
        state.init_failed = Some(summary.clone());

        Err(EnvironmentError::NoUsableExtractor { excuses: summary }.into())
    }
}

static SQUASHFS_POLICY: OnceCell<std::result::Result<ExtractPolicy, String>> = OnceCell::new();
static EROFS_POLICY: OnceCell<std::result::Result<ExtractPolicy, String>> = OnceCell::new();

/// Mounts or extracts an atom image with the process-wide policy for its
/// filesystem family.
pub fn extract_single(filesystem: FilesystemType, image: &Path, dest: &Path) -> Result<()> {
    let (cell, env_name, default_spec) = match filesystem {
        FilesystemType::Squashfs => (&SQUASHFS_POLICY, SQUASHFS_POLICY_ENV, DEFAULT_SQUASHFS_POLICY),
        FilesystemType::Erofs => (&EROFS_POLICY, EROFS_POLICY_ENV, DEFAULT_EROFS_POLICY),
    };

    let policy = cell.get_or_init(|| {
        let spec = env::var(env_name)
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| default_spec.to_string());
        ExtractPolicy::build(filesystem, &spec)
    });

    match policy {
        Ok(policy) => policy.extract(image, dest),
        Err(name) => Err(EnvironmentError::UnknownExtractor { name: name.clone() }.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extractor_names() {
        for filesystem in [FilesystemType::Squashfs, FilesystemType::Erofs] {
            for name in match filesystem {
                FilesystemType::Squashfs => ["kmount", "squashfuse", "unsquashfs"],
                FilesystemType::Erofs => ["kmount", "erofsfuse", "fsck.erofs"],
            } {
                let extractor = Extractor::from_name(name, filesystem).unwrap();
                assert_eq!(extractor.name(), name);
            }
            assert!(Extractor::from_name("tar", filesystem).is_none());
            // names from the other family don't resolve
        }
        assert!(Extractor::from_name("unsquashfs", FilesystemType::Erofs).is_none());
        assert!(Extractor::from_name("erofsfuse", FilesystemType::Squashfs).is_none());
    }

    #[test]
    fn test_policy_build_rejects_unknown_names() {
        let err = ExtractPolicy::build(FilesystemType::Squashfs, "kmount cpio").unwrap_err();
        assert_eq!(err, "cpio");
    }

    #[test]
    fn test_empty_policy_reports_excuses() {
        let policy = ExtractPolicy::build(FilesystemType::Squashfs, "").unwrap();
        let err = policy
            .extract(Path::new("/no/such/image"), &tempfile::tempdir().unwrap().path().join("x"))
            .unwrap_err();
        match err {
            Error::Environment(EnvironmentError::NoUsableExtractor { excuses }) => {
                assert_eq!(excuses, "policy had no extractors")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_failed_init_is_sticky() {
        let policy = ExtractPolicy::build(FilesystemType::Erofs, "").unwrap();
        let dir = tempfile::tempdir().unwrap();

        policy
            .extract(Path::new("/no/such/image"), &dir.path().join("a"))
            .unwrap_err();
        let err = policy
            .extract(Path::new("/no/such/image"), &dir.path().join("b"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Environment(EnvironmentError::NoUsableExtractor { .. })
        ));
    }
}
