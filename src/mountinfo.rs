//! Reader for `/proc/self/mountinfo`.
//!
//! The engine needs the raw superblock option string of overlay mounts (to
//! recover the `lowerdir=` list in layer order), so this parses the file
//! directly instead of going through `findmnt`.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, Context};

use crate::{
    error::{Result, ResultExt},
    files,
};

pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// One record of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    /// Per-mount vfs options followed by the superblock options, split on commas.
    pub options: Vec<String>,
}

impl MountRecord {
    /// Parses one mountinfo line:
    /// `36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue`
    fn parse_line(line: &str) -> std::result::Result<Self, anyhow::Error> {
        let mut fields = line.split_whitespace();

        let mut next = |what: &str| {
            fields
                .next()
                .ok_or_else(|| anyhow!("mountinfo line '{line}' is missing the {what} field"))
        };

        next("mount id")?;
        next("parent id")?;
        next("major:minor")?;
        next("root")?;
        let target = unescape_mount_field(next("mount point")?);
        let vfs_options = next("mount options")?.to_string();

        // skip the variable-length optional fields up to the separator
        loop {
            let field = next("optional fields separator")?;
            if field == "-" {
                break;
            }
        }

        let fstype = next("filesystem type")?.to_string();
        let source = unescape_mount_field(next("mount source")?);
        let super_options = next("super options")?;

        let options = vfs_options
            .split(',')
            .chain(super_options.split(','))
            .map(|opt| unescape_mount_field(opt))
            .collect();

        Ok(Self {
            source,
            target: PathBuf::from(target),
            fstype,
            options,
        })
    }

    /// Returns the overlay `lowerdir` entries in layer order (topmost first),
    /// or an empty list when this mount has no `lowerdir` option.
    pub fn overlay_lower_dirs(&self) -> Vec<PathBuf> {
        self.options
            .iter()
            .find_map(|opt| opt.strip_prefix("lowerdir="))
            .map(|dirs| dirs.split(':').map(PathBuf::from).collect())
            .unwrap_or_default()
    }
}

/// Kernel mount fields escape whitespace and backslashes as octal triplets.
fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let bytes = field.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(value) = octal_triplet(&bytes[i + 1..]) {
                out.push(value as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

fn octal_triplet(bytes: &[u8]) -> Option<u8> {
    if bytes.len() < 3 {
        return None;
    }
    let mut value: u32 = 0;
    for b in &bytes[..3] {
        if !(b'0'..=b'7').contains(b) {
            return None;
        }
        value = value * 8 + u32::from(b - b'0');
    }
    u8::try_from(value).ok()
}

/// A point-in-time snapshot of the mount table.
#[derive(Debug, Default)]
pub struct MountTable {
    records: Vec<MountRecord>,
}

impl MountTable {
    /// Reads the calling process's mount table.
    pub fn read() -> Result<Self> {
        let contents =
            std::fs::read_to_string(MOUNTINFO_PATH).message("failed to read mountinfo")?;
        contents.parse().message("failed to parse mountinfo")
    }

    pub fn records(&self) -> &[MountRecord] {
        &self.records
    }

    /// Finds the first record mounted exactly at `target`. The caller must
    /// pass an absolute path.
    pub fn find_mount(&self, target: impl AsRef<Path>) -> Option<&MountRecord> {
        self.records
            .iter()
            .find(|record| record.target == target.as_ref())
    }

    pub fn is_mountpoint(&self, target: impl AsRef<Path>) -> bool {
        self.find_mount(target).is_some()
    }

    /// Returns whether any record uses `source` as its backing device.
    pub fn source_in_use(&self, source: &str) -> bool {
        self.records.iter().any(|record| record.source == source)
    }
}

impl FromStr for MountTable {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let records = s
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(MountRecord::parse_line)
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("invalid mountinfo")?;
        Ok(Self { records })
    }
}

/// Returns whether `path`, made absolute, is a mountpoint in the current
/// mount table.
pub fn is_mountpoint(path: impl AsRef<Path>) -> Result<bool> {
    let abs = files::absolute(path.as_ref()).message("failed to absolutize path")?;
    Ok(MountTable::read()?.is_mountpoint(abs))
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    fn sample_table() -> MountTable {
        indoc! {r#"
            21 26 0:19 / /sys rw,nosuid,nodev,noexec,relatime shared:7 - sysfs sysfs rw
            26 1 8:2 / / rw,relatime shared:1 - ext4 /dev/sda2 rw,errors=remount-ro
            40 26 7:3 / /run/atomfs/meta/4026531840/mnt-x/mounts/aaaa rw,relatime shared:30 - squashfs /dev/mapper/img-verity ro
            41 26 7:4 / /run/atomfs/meta/4026531840/mnt-x/mounts/bbbb rw,relatime shared:31 - erofs /dev/loop4 ro
            42 26 0:52 / /mnt/x rw,relatime shared:32 - overlay overlay rw,lowerdir=/run/atomfs/meta/4026531840/mnt-x/mounts/aaaa:/run/atomfs/meta/4026531840/mnt-x/mounts/bbbb,index=off,xino=on,userxattr
            43 26 0:53 / /mnt/with\040space rw - tmpfs tmpfs rw,size=1M
        "#}
        .parse()
        .unwrap()
    }

    #[test]
    fn test_find_mount() {
        let table = sample_table();

        let root = table.find_mount("/").unwrap();
        assert_eq!(root.fstype, "ext4");
        assert_eq!(root.source, "/dev/sda2");
        assert!(root.options.iter().any(|o| o == "errors=remount-ro"));

        assert!(table.find_mount("/mnt").is_none());
        assert!(table.is_mountpoint("/mnt/x"));
        assert!(!table.is_mountpoint("/mnt/y"));
    }

    #[test]
    fn test_overlay_lower_dirs() {
        let table = sample_table();

        let overlay = table.find_mount("/mnt/x").unwrap();
        assert_eq!(overlay.fstype, "overlay");
        assert_eq!(
            overlay.overlay_lower_dirs(),
            vec![
                PathBuf::from("/run/atomfs/meta/4026531840/mnt-x/mounts/aaaa"),
                PathBuf::from("/run/atomfs/meta/4026531840/mnt-x/mounts/bbbb"),
            ]
        );

        let plain = table.find_mount("/sys").unwrap();
        assert!(plain.overlay_lower_dirs().is_empty());
    }

    #[test]
    fn test_source_in_use() {
        let table = sample_table();
        assert!(table.source_in_use("/dev/mapper/img-verity"));
        assert!(table.source_in_use("/dev/loop4"));
        assert!(!table.source_in_use("/dev/loop9"));
    }

    #[test]
    fn test_escaped_paths() {
        let table = sample_table();
        assert!(table.is_mountpoint("/mnt/with space"));
    }

    #[test]
    fn test_malformed_line() {
        let err = "21 26 0:19 / /sys".parse::<MountTable>().unwrap_err();
        assert!(err.to_string().contains("invalid mountinfo"));
    }

    #[test]
    fn test_unescape_mount_field() {
        assert_eq!(unescape_mount_field(r"/mnt/a\040b"), "/mnt/a b");
        assert_eq!(unescape_mount_field(r"tab\011sep"), "tab\tsep");
        assert_eq!(unescape_mount_field(r"back\134slash"), r"back\slash");
        assert_eq!(unescape_mount_field(r"trailing\04"), r"trailing\04");
        assert_eq!(unescape_mount_field("/plain"), "/plain");
    }
}
