use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use log::error;

use atomfs::{
    cli::{Cli, Commands},
    error::{ConfigError, EnvironmentError, Result, ResultExt},
    files, molecule, procinfo,
};

fn main() -> ExitCode {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbosity)
        .format_timestamp(None)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let err = anyhow::Error::new(err);
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Cli) -> Result<()> {
    match &args.command {
        Commands::Mount {
            image,
            target,
            writeable,
            persist,
            allow_missing_verity,
            metadir,
        } => {
            let (oci_dir, tag) = split_image_arg(image)?;
            if !procinfo::am_privileged() {
                eprintln!("Please run as root, or in a user namespace");
                eprintln!(" You could try:");
                eprintln!("\tlxc-usernsexec -s -- /bin/bash");
                eprintln!(" or");
                eprintln!("\tunshare -Umr -- /bin/bash");
                eprintln!("then run from that shell");
                return Err(EnvironmentError::NotPrivileged.into());
            }

            let opts = molecule::MountOciOpts {
                oci_dir: files::absolute(oci_dir).message("failed to absolutize OCI dir")?,
                tag,
                target: files::absolute(target).message("failed to absolutize target")?,
                add_writeable_overlay: *writeable || persist.is_some(),
                writeable_overlay_path: persist.clone(),
                allow_missing_verity_data: *allow_missing_verity,
                metadata_dir: metadir.clone(),
            };

            let mol = molecule::build_molecule_from_oci(opts)?;
            mol.mount()
        }

        Commands::Umount { target, metadir } => molecule::umount(target, metadir.as_deref()),

        Commands::Verify { target, metadir } => molecule::verify(target, metadir.as_deref()),
    }
}

fn split_image_arg(image: &str) -> Result<(PathBuf, String)> {
    let bad = || ConfigError::BadMountSpec {
        spec: image.to_string(),
    };

    let (oci_dir, tag) = image.split_once(':').ok_or_else(bad)?;
    if oci_dir.is_empty() || tag.is_empty() {
        return Err(bad().into());
    }

    Ok((PathBuf::from(oci_dir), tag.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image_arg() {
        let (dir, tag) = split_image_arg("/oci/dir:v1.2").unwrap();
        assert_eq!(dir, PathBuf::from("/oci/dir"));
        assert_eq!(tag, "v1.2");

        for bad in ["/oci/dir", ":v1", "/oci/dir:", ""] {
            assert!(split_image_arg(bad).is_err(), "accepted '{bad}'");
        }
    }
}
