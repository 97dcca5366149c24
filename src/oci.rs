//! Minimal reader for the OCI image layout on disk.
//!
//! The engine only consumes `index.json`, per-tag manifests, and the layer
//! descriptors' digest, media type, and annotations.

use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ImageError, Result, ResultExt};

/// Annotation carrying an atom's dm-verity root hash.
pub const VERITY_ROOT_HASH_ANNOTATION: &str = "io.stackeroci.stacker.atomfs_verity_root_hash";

/// Older spelling of [`VERITY_ROOT_HASH_ANNOTATION`]; accepted on read only.
pub const VERITY_ROOT_HASH_ANNOTATION_LEGACY: &str =
    "io.stackeroci.stacker.squashfs_verity_root_hash";

/// Standard OCI annotation naming the tag a manifest belongs to.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// A content digest in `algorithm:hex` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: String,
    encoded: String,
}

impl Digest {
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The hex part of the digest, used as the atom's directory name.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl FromStr for Digest {
    type Err = ImageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bad = || ImageError::BadDigest {
            digest: s.to_string(),
        };

        let (algorithm, encoded) = s.split_once(':').ok_or_else(bad)?;
        if algorithm.is_empty()
            || !algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(bad());
        }
        if encoded.is_empty()
            || !encoded
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(bad());
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            encoded: encoded.to_string(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = ImageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

/// An OCI content descriptor. Layer descriptors are the engine's atoms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Descriptor {
    /// The verity root hash recorded for this atom, if any. The current
    /// annotation name wins over the legacy one; empty values don't count.
    pub fn verity_root_hash(&self) -> Option<&str> {
        [VERITY_ROOT_HASH_ANNOTATION, VERITY_ROOT_HASH_ANNOTATION_LEGACY]
            .iter()
            .find_map(|key| self.annotations.get(*key))
            .map(String::as_str)
            .filter(|hash| !hash.is_empty())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    #[allow(dead_code)]
    pub schema_version: u32,
    pub manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    #[allow(dead_code)]
    pub schema_version: u32,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// Handle on an OCI image-layout directory.
#[derive(Debug, Clone)]
pub struct OciDir {
    path: PathBuf,
}

impl OciDir {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let index = path.join("index.json");
        if !index.exists() {
            return Err(Error::Internal {
                context: format!(
                    "'{}' is not an OCI layout: missing index.json",
                    path.display()
                )
                .into(),
                source: anyhow::anyhow!("index.json not found"),
            });
        }
        Ok(Self { path })
    }

    pub fn index(&self) -> Result<ImageIndex> {
        let raw = fs::read_to_string(self.path.join("index.json"))
            .message("failed to read OCI index")?;
        serde_json::from_str(&raw).message("failed to parse OCI index")
    }

    /// Resolves a tag to its manifest descriptor via the standard ref-name
    /// annotation.
    pub fn resolve_tag(&self, tag: &str) -> Result<Descriptor> {
        self.index()?
            .manifests
            .into_iter()
            .find(|desc| {
                desc.annotations
                    .get(REF_NAME_ANNOTATION)
                    .is_some_and(|name| name == tag)
            })
            .ok_or_else(|| {
                ImageError::TagNotFound {
                    tag: tag.to_string(),
                }
                .into()
            })
    }

    pub fn manifest(&self, desc: &Descriptor) -> Result<ImageManifest> {
        let raw = fs::read_to_string(self.blob_path(&desc.digest))
            .message(format!("failed to read manifest blob {}", desc.digest))?;
        serde_json::from_str(&raw).message("failed to parse image manifest")
    }

    /// The on-disk path of a blob: `<ocidir>/blobs/<algorithm>/<hex>`.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.path
            .join("blobs")
            .join(digest.algorithm())
            .join(digest.encoded())
    }
}
