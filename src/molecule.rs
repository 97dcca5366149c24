//! The molecule engine: composing an ordered stack of atoms into one
//! overlay mount, and taking it apart again.

use std::{
    env,
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
};

use anyhow::anyhow;
use log::{debug, error, info, warn};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};

use crate::{
    error::{
        ConfigError, EnvironmentError, Error, ImageError, ResourceError, Result, ResultExt,
        StateError, VerityError,
    },
    files,
    filesystems::{self, FilesystemType},
    mount,
    mountinfo::{self, MountTable},
    oci::{Descriptor, OciDir},
    procinfo, veritysetup,
};

/// Overrides the runtime root, so tests can assert on empty directories.
pub const RUNTIME_DIR_ENV: &str = "ATOMFS_TEST_RUN_DIR";

pub const DEFAULT_RUNTIME_DIR: &str = "/run/atomfs";

pub const OVERLAY_MOUNT_OPTIONS: &str = "index=off,xino=on,userxattr";

/// The kernel rejects mount option strings longer than this.
const MAX_OVERLAY_OPTIONS_LEN: usize = 4096;

/// Overlay refuses a single lowerdir with no upperdir, so single-atom
/// molecules get an empty extra lower layer with this name.
const WORKAROUND_DIR: &str = "workaround";

const LOCK_FILE_NAME: &str = ".atomfs-lock";
const CONFIG_FILE_NAME: &str = "config.json";

/// Everything needed to build and mount a molecule from an OCI layout, and
/// the snapshot persisted to `config.json` while it is mounted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountOciOpts {
    pub oci_dir: PathBuf,
    pub tag: String,
    pub target: PathBuf,
    pub add_writeable_overlay: bool,
    pub writeable_overlay_path: Option<PathBuf>,
    pub allow_missing_verity_data: bool,
    pub metadata_dir: Option<PathBuf>,
}

impl MountOciOpts {
    fn validate(&self) -> Result<()> {
        if !self.target.is_absolute() {
            return Err(ConfigError::TargetNotAbsolute {
                path: self.target.clone(),
            }
            .into());
        }
        if let Some(metadir) = &self.metadata_dir {
            if !metadir.is_absolute() {
                return Err(ConfigError::InvalidMetadir {
                    path: metadir.clone(),
                }
                .into());
            }
        }
        if let Some(persist) = &self.writeable_overlay_path {
            if persist.as_os_str().is_empty() {
                return Err(ConfigError::EmptyPersistPath.into());
            }
        }
        Ok(())
    }

    fn write_to_file(&self, path: &Path) -> Result<()> {
        let rendered =
            serde_json::to_string_pretty(self).message("failed to serialize mount config")?;
        fs::write(path, rendered).message(format!("failed to write '{}'", path.display()))
    }
}

/// The runtime root holding per-namespace mount metadata. A test override
/// from the environment wins, then an explicit metadata dir, then
/// `/run/atomfs`.
pub fn runtime_dir(metadata_dir: Option<&Path>) -> PathBuf {
    let test_override = env::var(RUNTIME_DIR_ENV).ok().filter(|v| !v.is_empty());
    runtime_dir_from(test_override.as_deref(), metadata_dir)
}

fn runtime_dir_from(test_override: Option<&str>, metadata_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = test_override {
        return PathBuf::from(dir);
    }
    match metadata_dir {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_owned(),
        _ => PathBuf::from(DEFAULT_RUNTIME_DIR),
    }
}

/// Collapses an absolute mount target into a single directory name: the
/// leading `/` is dropped and the remaining separators become `-`. This is
/// lossy, which is fine; it is never mapped back.
fn sanitize_mount_target(target: &Path) -> String {
    let raw = target.to_string_lossy();
    let raw = raw.strip_prefix('/').unwrap_or(&raw);
    raw.replace('/', "-")
}

fn metadata_path_for(runtime_root: &Path, namespace_id: &str, target: &Path) -> PathBuf {
    runtime_root
        .join("meta")
        .join(namespace_id)
        .join(sanitize_mount_target(target))
}

/// An ordered stack of atoms composed as a single overlay mount.
#[derive(Debug)]
pub struct Molecule {
    /// The atoms in this molecule. The first element is the top-most layer
    /// in the overlay.
    pub atoms: Vec<Descriptor>,
    config: MountOciOpts,
}

/// Resolves an OCI tag to its ordered atom list. The returned molecule owns
/// no kernel state until [`Molecule::mount`] is called.
pub fn build_molecule_from_oci(opts: MountOciOpts) -> Result<Molecule> {
    opts.validate()?;

    let layout = OciDir::open(&opts.oci_dir)?;
    let manifest_desc = layout.resolve_tag(&opts.tag)?;
    let manifest = layout.manifest(&manifest_desc)?;

    Ok(Molecule {
        atoms: manifest.layers,
        config: opts,
    })
}

impl Molecule {
    /// The metadata directory for this molecule's target:
    /// `<runtime>/meta/<mount-ns-id>/<sanitized-target>`. Its existence is
    /// the "already mounted" guard.
    pub fn metadata_path(&self) -> Result<PathBuf> {
        let namespace_id =
            procinfo::mount_namespace_id().message("failed to determine mount namespace")?;
        let target =
            files::absolute(&self.config.target).message("failed to absolutize mount target")?;
        Ok(metadata_path_for(
            &runtime_dir(self.config.metadata_dir.as_deref()),
            &namespace_id,
            &target,
        ))
    }

    /// The per-atom sub-mount directory under the metadata dir.
    pub fn mounted_atoms_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.metadata_path()?.join("mounts").join(name))
    }

    /// Mounts the molecule at its configured target.
    ///
    /// On any failure, every atom mounted by this call is unmounted again
    /// and the metadata directory is removed; the system is left as it was.
    pub fn mount(&self) -> Result<()> {
        let metadir = self.metadata_path()?;
        if files::path_exists(&metadir) {
            return Err(StateError::AlreadyMounted { metadir }.into());
        }
        files::create_dirs(&metadir).message("failed to create metadata dir")?;

        // device-mapper names are a global namespace; serialize against
        // other processes creating or destroying the same devices
        let _lock = lock_exclusive(&metadir)?;

        let mut guard = CleanupGuard::new(metadir.clone());
        self.mount_inner(&metadir, &mut guard)?;
        guard.disarm();
        Ok(())
    }

    fn mount_inner(&self, metadir: &Path, guard: &mut CleanupGuard) -> Result<()> {
        self.mount_underlying_atoms(guard)?;
        let lower_dirs = self.overlay_lower_dirs()?;

        self.config.write_to_file(&metadir.join(CONFIG_FILE_NAME))?;

        let lower_joined = lower_dirs
            .iter()
            .map(|dir| dir.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":");

        let target = &self.config.target;
        let overlay_options = if self.config.add_writeable_overlay {
            files::create_dirs(metadir.join("ro")).message("failed to create ro dir")?;

            let persist_root = match &self.config.writeable_overlay_path {
                Some(path) => path.clone(),
                None => metadir.to_owned(),
            };
            let workdir = persist_root.join("work");
            files::create_dirs(&workdir)
                .message(format!("failed to ensure workdir '{}'", workdir.display()))?;
            let upperdir = persist_root.join("persist");
            files::create_dirs(&upperdir)
                .message(format!("failed to ensure upperdir '{}'", upperdir.display()))?;

            // the target itself is prepended as the top lower layer, which
            // is what allows an atomfs mount to be re-mounted on itself
            format!(
                "lowerdir={}:{lower_joined},upperdir={},workdir={},{OVERLAY_MOUNT_OPTIONS}",
                target.display(),
                upperdir.display(),
                workdir.display(),
            )
        } else {
            format!("lowerdir={lower_joined},{OVERLAY_MOUNT_OPTIONS}")
        };

        if overlay_options.len() > MAX_OVERLAY_OPTIONS_LEN {
            return Err(ResourceError::TooManyLayers {
                len: overlay_options.len(),
            }
            .into());
        }

        debug!(
            "mounting molecule at '{}' with options '{overlay_options}'",
            target.display()
        );
        mount::overlay_mount(target, &overlay_options)
    }

    /// Mounts all underlying atoms at their sub-mount points, in manifest
    /// order. Atoms already mounted (by an earlier call or another molecule
    /// sharing them) are re-validated and skipped; everything mounted here
    /// is recorded in the guard for rollback.
    fn mount_underlying_atoms(&self, guard: &mut CleanupGuard) -> Result<()> {
        for atom in &self.atoms {
            let target = self.mounted_atoms_path(atom.digest.encoded())?;
            let root_hash = atom.verity_root_hash();

            if !self.config.allow_missing_verity_data {
                if root_hash.is_none() {
                    return Err(VerityError::MissingVerity {
                        digest: atom.digest.to_string(),
                    }
                    .into());
                }
                if !procinfo::am_host_root() {
                    return Err(EnvironmentError::GuestVerityUnsupported.into());
                }
            }

            let table = MountTable::read()?;
            if let Some(existing) = table.find_mount(&target) {
                if let Some(hash) = root_hash {
                    let source = Path::new(&existing.source);
                    veritysetup::confirm_device_hash(
                        source,
                        hash,
                        self.config.allow_missing_verity_data,
                    )?;
                    veritysetup::confirm_device_validity(source)?;
                }
                continue;
            }

            files::create_dirs(&target).message("failed to create atom mountpoint")?;

            let filesystem = FilesystemType::from_media_type(&atom.media_type).ok_or_else(|| {
                ImageError::UnknownMediaType {
                    media_type: atom.media_type.clone(),
                }
            })?;
            let image = OciDir::open(&self.config.oci_dir)?.blob_path(&atom.digest);
            filesystems::mount(filesystem, &image, &target, root_hash)?;

            guard.mounted_atoms.push(target);
        }

        Ok(())
    }

    /// The overlay lowerdir list in manifest order, top-most layer first.
    fn overlay_lower_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = self
            .atoms
            .iter()
            .map(|atom| self.mounted_atoms_path(atom.digest.encoded()))
            .collect::<Result<Vec<_>>>()?;

        // overlay doesn't work with only one lowerdir and no upperdir, so a
        // single-atom molecule gets an empty second lower layer
        if dirs.len() == 1 {
            let workaround = self.mounted_atoms_path(WORKAROUND_DIR)?;
            files::create_dirs(&workaround).message("couldn't make workaround dir")?;
            dirs.push(workaround);
        }

        Ok(dirs)
    }
}

/// Takes the global advisory lock. Two processes mounting the same image
/// concurrently must not race their verity-device creation and teardown.
fn lock_exclusive(metadir: &Path) -> Result<Flock<fs::File>> {
    let primary = env::temp_dir().join(LOCK_FILE_NAME);
    let file = match fs::File::create(&primary) {
        Ok(file) => file,
        Err(primary_err) => {
            // backup plan: lock under the metadata directory
            let fallback = metadir.join(LOCK_FILE_NAME);
            fs::File::create(&fallback).map_err(|fallback_err| Error::Internal {
                context: format!(
                    "failed locking '{}' and '{}'",
                    primary.display(),
                    fallback.display()
                )
                .into(),
                source: anyhow!("{primary_err}; {fallback_err}"),
            })?
        }
    };

    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| Error::Internal {
        context: "failed to take advisory lock".into(),
        source: anyhow::Error::new(errno),
    })
}

/// Rolls back a partial mount unless disarmed: atoms mounted by this call
/// are unmounted (releasing their backing devices) and the metadata
/// directory, including any defaulted upper/work dirs in it, is removed.
struct CleanupGuard {
    metadir: PathBuf,
    mounted_atoms: Vec<PathBuf>,
    armed: bool,
}

impl CleanupGuard {
    fn new(metadir: PathBuf) -> Self {
        Self {
            metadir,
            mounted_atoms: Vec::new(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        error!("failure detected: cleaning up '{}'", self.metadir.display());
        for target in &self.mounted_atoms {
            if let Err(err) = mount::umount_image(target) {
                warn!(
                    "cleanup: failed to unmount atom at '{}': {err}",
                    target.display()
                );
            }
        }
        if let Err(err) = fs::remove_dir_all(&self.metadir) {
            warn!(
                "cleanup: failed to remove '{}': {err}",
                self.metadir.display()
            );
        }
    }
}

/// Unmounts the molecule at `target`, releasing every backing device that
/// no other mount still references.
///
/// Teardown keeps going past individual failures so as much state as
/// possible is freed; the collected errors come back as one aggregate.
pub fn umount(target: &Path, metadata_dir: Option<&Path>) -> Result<()> {
    let target = files::absolute(target).message("failed to absolutize mount target")?;

    // recreate just enough molecule config to compute the metadata path
    let molecule = Molecule {
        atoms: Vec::new(),
        config: MountOciOpts {
            target: target.clone(),
            metadata_dir: metadata_dir.map(Path::to_path_buf),
            ..Default::default()
        },
    };
    let metadir = molecule.metadata_path()?;

    let _lock = lock_exclusive(&metadir)?;

    let table = MountTable::read()?;
    let lower_dirs: Vec<PathBuf> = table
        .records()
        .iter()
        .find(|record| record.fstype == "overlay" && record.target == target)
        .map(|record| record.overlay_lower_dirs())
        .unwrap_or_default()
        .into_iter()
        .map(|dir| files::absolute(&dir).message("failed to absolutize lowerdir"))
        .collect::<Result<_>>()?;

    if lower_dirs.is_empty() {
        return Err(StateError::NotAnAtomfsMount { target }.into());
    }

    mount::kernel_umount(&target)?;

    let mut errors: Vec<Error> = Vec::new();
    for dir in &lower_dirs {
        // the workaround dir isn't really a mountpoint
        if dir.file_name() == Some(OsStr::new(WORKAROUND_DIR)) {
            continue;
        }
        // the lowerdir list includes the target itself for writable mounts
        if dir == &target {
            continue;
        }

        let table = match MountTable::read() {
            Ok(table) => table,
            Err(err) => {
                errors.push(err);
                continue;
            }
        };
        let Some(record) = table.find_mount(dir) else {
            errors.push(
                StateError::NotAMountpoint {
                    path: dir.to_owned(),
                }
                .into(),
            );
            continue;
        };
        let backing_device = record.source.clone();

        debug!("unmounting underlying atom '{}'", dir.display());
        if let Err(err) = mount::kernel_umount(dir) {
            errors.push(err);
            continue;
        }

        // release the backing device only once nothing else references it
        match MountTable::read() {
            Ok(table) if !table.source_in_use(&backing_device) => {
                if let Err(err) = mount::maybe_cleanup_backing_device(&backing_device) {
                    errors.push(err);
                }
            }
            Ok(_) => debug!("backing device {backing_device} still in use"),
            Err(err) => errors.push(err),
        }
    }

    if let Err(err) = fs::remove_dir_all(&metadir) {
        errors.push(Error::Internal {
            context: format!("failed to remove metadata dir '{}'", metadir.display()).into(),
            source: err.into(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::UmountErrors(errors))
    }
}

/// Checks every verity-backed atom of the molecule mounted at `target` for
/// corruption. FUSE-backed atoms cannot be checked and are skipped with a
/// warning; checking nothing at all is an error.
pub fn verify(target: &Path, metadata_dir: Option<&Path>) -> Result<()> {
    let target = files::absolute(target).message("failed to absolutize mount target")?;

    if !mountinfo::is_mountpoint(&target)? {
        return Err(StateError::NotAMountpoint { path: target }.into());
    }

    let molecule = Molecule {
        atoms: Vec::new(),
        config: MountOciOpts {
            target: target.clone(),
            metadata_dir: metadata_dir.map(Path::to_path_buf),
            ..Default::default()
        },
    };
    let metadir = molecule.metadata_path()?;

    // mountinfo reports resolved paths, so canonicalize both sides of the
    // prefix test below
    let mounts_dir = fs::canonicalize(metadir.join("mounts"))
        .map_err(|_| StateError::NotAnAtomfsMount {
            target: target.clone(),
        })?;

    let table = MountTable::read()?;
    if let Some(record) = table.find_mount(&target) {
        if record.fstype != "overlay" {
            return Err(StateError::NotAnAtomfsMount { target }.into());
        }
    }

    let mut checked = 0usize;
    let mut corrupt = Vec::new();
    for record in table.records() {
        let Ok(record_target) = fs::canonicalize(&record.target) else {
            continue;
        };
        if !record_target.starts_with(&mounts_dir) {
            continue;
        }
        if record.fstype.starts_with("fuse.") {
            warn!(
                "found fuse mount not supported by verify at '{}'",
                record.source
            );
            continue;
        }
        if FilesystemType::parse(&record.fstype).is_none() {
            continue;
        }

        checked += 1;
        match veritysetup::confirm_device_validity(Path::new(&record.source)) {
            Ok(()) => info!("{}: OK", record.source),
            Err(err) => {
                error!("{}: CORRUPTION FOUND ({err})", record.source);
                corrupt.push(record.source.clone());
            }
        }
    }

    if checked == 0 {
        return Err(Error::Internal {
            context: format!("no applicable mounts found in '{}'", mounts_dir.display()).into(),
            source: anyhow!("nothing to verify"),
        });
    }

    if corrupt.is_empty() {
        Ok(())
    } else {
        Err(VerityError::CorruptionDetected {
            device: corrupt.join(", "),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use crate::error::{ConfigError, VerityError};

    #[test]
    fn test_sanitize_mount_target() {
        assert_eq!(sanitize_mount_target(Path::new("/a/b/c")), "a-b-c");
        assert_eq!(sanitize_mount_target(Path::new("/mnt/x")), "mnt-x");
        assert_eq!(sanitize_mount_target(Path::new("/")), "");
    }

    #[test]
    fn test_runtime_dir_precedence() {
        assert_eq!(
            runtime_dir_from(None, None),
            Path::new(DEFAULT_RUNTIME_DIR)
        );
        assert_eq!(
            runtime_dir_from(None, Some(Path::new("/custom"))),
            Path::new("/custom")
        );
        assert_eq!(
            runtime_dir_from(Some("/test-run"), Some(Path::new("/custom"))),
            Path::new("/test-run")
        );
        assert_eq!(runtime_dir_from(None, Some(Path::new(""))), Path::new(DEFAULT_RUNTIME_DIR));
    }

    #[test]
    fn test_metadata_path_shape() {
        let path = metadata_path_for(
            Path::new("/run/atomfs"),
            "4026531840",
            Path::new("/mnt/x"),
        );
        assert_eq!(path, Path::new("/run/atomfs/meta/4026531840/mnt-x"));
    }

    #[test]
    fn test_opts_validation() {
        let opts = MountOciOpts {
            target: PathBuf::from("relative/target"),
            ..Default::default()
        };
        assert!(matches!(
            opts.validate().unwrap_err(),
            Error::Config(ConfigError::TargetNotAbsolute { .. })
        ));

        let opts = MountOciOpts {
            target: PathBuf::from("/mnt/x"),
            metadata_dir: Some(PathBuf::from("relative")),
            ..Default::default()
        };
        assert!(matches!(
            opts.validate().unwrap_err(),
            Error::Config(ConfigError::InvalidMetadir { .. })
        ));

        let opts = MountOciOpts {
            target: PathBuf::from("/mnt/x"),
            writeable_overlay_path: Some(PathBuf::new()),
            ..Default::default()
        };
        assert!(matches!(
            opts.validate().unwrap_err(),
            Error::Config(ConfigError::EmptyPersistPath)
        ));

        let opts = MountOciOpts {
            target: PathBuf::from("/mnt/x"),
            ..Default::default()
        };
        opts.validate().unwrap();
    }

    #[test]
    fn test_atom_without_root_hash_is_rejected() {
        const DIGEST: &str =
            "sha256:73cd1a9ab86defeb5e22151ceb96b347fc58b4318f64be05046c51d407a364eb";

        let molecule = Molecule {
            atoms: vec![Descriptor {
                media_type: "application/vnd.stacker.image.layer.squashfs+zstd".into(),
                digest: DIGEST.parse().unwrap(),
                size: 4096,
                annotations: HashMap::new(),
            }],
            config: MountOciOpts {
                target: PathBuf::from("/nonexistent-atomfs-test-target"),
                ..Default::default()
            },
        };

        let mut guard = CleanupGuard::new(PathBuf::from("/nonexistent-atomfs-test-metadir"));
        let err = molecule.mount_underlying_atoms(&mut guard).unwrap_err();
        guard.disarm();

        match err {
            Error::Verity(VerityError::MissingVerity { digest }) => {
                assert_eq!(digest, DIGEST)
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(guard.mounted_atoms.is_empty());
    }

    #[test]
    fn test_config_snapshot_round_trips() {
        let opts = MountOciOpts {
            oci_dir: PathBuf::from("/oci"),
            tag: "v1".into(),
            target: PathBuf::from("/mnt/x"),
            add_writeable_overlay: true,
            writeable_overlay_path: None,
            allow_missing_verity_data: false,
            metadata_dir: Some(PathBuf::from("/run/atomfs-alt")),
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        opts.write_to_file(&path).unwrap();

        let parsed: MountOciOpts =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.tag, opts.tag);
        assert_eq!(parsed.target, opts.target);
        assert!(parsed.add_writeable_overlay);
        assert_eq!(parsed.metadata_dir, opts.metadata_dir);
    }
}
