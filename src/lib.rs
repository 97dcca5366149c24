//! atomfs composes read-only container images ("atoms": SquashFS or EROFS
//! blobs catalogued in an OCI layout) into a single root filesystem (a
//! "molecule") by stacking each atom as a lower layer of an overlay mount,
//! optionally with a writable upper layer. Every atom is authenticated on
//! each block read via dm-verity.

pub mod cli;
pub mod dependencies;
pub mod error;
pub mod exclude;
pub mod extract;
pub mod files;
pub mod filesystems;
pub mod fuse;
pub mod losetup;
pub mod mediatype;
pub mod molecule;
pub mod mount;
pub mod mountinfo;
pub mod oci;
pub mod procinfo;
pub mod superblock;
pub mod veritysetup;

pub use error::{Error, Result};
pub use molecule::{build_molecule_from_oci, Molecule, MountOciOpts};
