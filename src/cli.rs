//! Command-line surface of the `atomfs` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[clap(version, about = "mount and unmount atomfs molecules")]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Info)]
    pub verbosity: LevelFilter,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mount an atomfs image
    #[clap(arg_required_else_help = true)]
    Mount {
        /// The image to mount, as <ocidir>:<tag>
        #[clap(index = 1)]
        image: String,

        /// Where to mount the molecule
        #[clap(index = 2)]
        target: PathBuf,

        /// Make the mount writeable using an overlay (ephemeral by default)
        #[clap(long, alias = "writable")]
        writeable: bool,

        /// Directory to use for the workdir and upperdir of a writeable
        /// overlay (implies --writeable)
        #[clap(long)]
        persist: Option<PathBuf>,

        /// Mount even if the image has no verity data
        #[clap(long)]
        allow_missing_verity: bool,

        /// Directory to use for metadata, if /run/atomfs is not writable
        #[clap(long)]
        metadir: Option<PathBuf>,
    },

    /// Unmount an atomfs image
    #[clap(arg_required_else_help = true)]
    Umount {
        /// The molecule's mountpoint
        target: PathBuf,

        /// Directory to use for metadata, if /run/atomfs is not writable
        #[clap(long)]
        metadir: Option<PathBuf>,
    },

    /// Check a mounted atomfs image for dm-verity errors
    #[clap(arg_required_else_help = true)]
    Verify {
        /// The molecule's mountpoint
        target: PathBuf,

        /// Directory to use for metadata, if /run/atomfs is not writable
        #[clap(long)]
        metadir: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_args() {
        let cli = Cli::parse_from([
            "atomfs",
            "mount",
            "--writable",
            "--persist",
            "/tmp/upper",
            "--allow-missing-verity",
            "/oci:v1",
            "/mnt/x",
        ]);
        match cli.command {
            Commands::Mount {
                image,
                target,
                writeable,
                persist,
                allow_missing_verity,
                metadir,
            } => {
                assert_eq!(image, "/oci:v1");
                assert_eq!(target, PathBuf::from("/mnt/x"));
                assert!(writeable);
                assert_eq!(persist, Some(PathBuf::from("/tmp/upper")));
                assert!(allow_missing_verity);
                assert_eq!(metadir, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_umount_args() {
        let cli = Cli::parse_from(["atomfs", "-v", "debug", "umount", "--metadir", "/alt", "/mnt/x"]);
        assert_eq!(cli.verbosity, LevelFilter::Debug);
        match cli.command {
            Commands::Umount { target, metadir } => {
                assert_eq!(target, PathBuf::from("/mnt/x"));
                assert_eq!(metadir, Some(PathBuf::from("/alt")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_verify_args() {
        let cli = Cli::parse_from(["atomfs", "verify", "/mnt/x"]);
        assert!(matches!(cli.command, Commands::Verify { .. }));
    }
}
