//! OCI layer media types for filesystem atoms.
//!
//! The string form is the wire form:
//! `application/vnd.stacker.image.layer.{squashfs|erofs}+{compression}[+verity]`.

use std::{fmt, str::FromStr};

use crate::{error::ImageError, filesystems::FilesystemType, veritysetup::VERITY_SUFFIX};

pub const BASE_MEDIA_TYPE: &str = "application/vnd.stacker.image.layer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
    Lz4hc,
}

impl Compression {
    pub fn name(self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
            Compression::Lz4hc => "lz4hc",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "gzip" => Some(Compression::Gzip),
            "zstd" => Some(Compression::Zstd),
            "lz4hc" => Some(Compression::Lz4hc),
            _ => None,
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaType {
    pub filesystem: FilesystemType,
    pub compression: Compression,
    pub verity: bool,
}

impl MediaType {
    pub fn new(filesystem: FilesystemType, compression: Compression, verity: bool) -> Self {
        Self {
            filesystem,
            compression,
            verity,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{BASE_MEDIA_TYPE}.{}+{}",
            self.filesystem.name(),
            self.compression
        )?;
        if self.verity {
            write!(f, "+{VERITY_SUFFIX}")?;
        }
        Ok(())
    }
}

impl FromStr for MediaType {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || ImageError::UnknownMediaType {
            media_type: s.to_string(),
        };

        let rest = s
            .strip_prefix(BASE_MEDIA_TYPE)
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or_else(unknown)?;

        let mut parts = rest.split('+');
        let filesystem = parts
            .next()
            .and_then(FilesystemType::parse)
            .ok_or_else(unknown)?;
        let compression = parts
            .next()
            .and_then(Compression::parse)
            .ok_or_else(unknown)?;
        let verity = match parts.next() {
            None => false,
            Some(suffix) if suffix == VERITY_SUFFIX => true,
            Some(_) => return Err(unknown()),
        };
        if parts.next().is_some() {
            return Err(unknown());
        }

        Ok(MediaType {
            filesystem,
            compression,
            verity,
        })
    }
}

/// Returns whether a raw media-type string advertises appended verity data.
pub fn has_verity_metadata(media_type: &str) -> bool {
    media_type.ends_with(VERITY_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            MediaType::new(FilesystemType::Squashfs, Compression::Zstd, true).to_string(),
            "application/vnd.stacker.image.layer.squashfs+zstd+verity"
        );
        assert_eq!(
            MediaType::new(FilesystemType::Erofs, Compression::Lz4hc, false).to_string(),
            "application/vnd.stacker.image.layer.erofs+lz4hc"
        );
    }

    #[test]
    fn test_round_trip() {
        for filesystem in [FilesystemType::Squashfs, FilesystemType::Erofs] {
            for compression in [Compression::Gzip, Compression::Zstd, Compression::Lz4hc] {
                for verity in [false, true] {
                    let mt = MediaType::new(filesystem, compression, verity);
                    let parsed: MediaType = mt.to_string().parse().unwrap();
                    assert_eq!(parsed, mt);
                }
            }
        }
    }

    #[test]
    fn test_parse_rejects_unknown() {
        for bad in [
            "application/vnd.oci.image.layer.v1.tar",
            "application/vnd.stacker.image.layer.ext4+gzip",
            "application/vnd.stacker.image.layer.squashfs",
            "application/vnd.stacker.image.layer.squashfs+brotli",
            "application/vnd.stacker.image.layer.squashfs+zstd+signed",
            "application/vnd.stacker.image.layer.squashfs+zstd+verity+extra",
        ] {
            assert!(bad.parse::<MediaType>().is_err(), "accepted '{bad}'");
        }
    }

    #[test]
    fn test_has_verity_metadata() {
        assert!(has_verity_metadata(
            "application/vnd.stacker.image.layer.erofs+zstd+verity"
        ));
        assert!(!has_verity_metadata(
            "application/vnd.stacker.image.layer.erofs+zstd"
        ));
    }
}
