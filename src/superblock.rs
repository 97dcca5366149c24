//! SquashFS and EROFS superblock readers.
//!
//! The engine only needs enough of each superblock to find where the
//! filesystem data ends, which is where appended dm-verity data begins.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use crc::{Crc, CRC_32_ISCSI};

use crate::{
    error::{Error, ImageError, Result},
    procinfo,
};

pub const SQUASHFS_MAGIC: u32 = 0x7371_7368;
const SQUASHFS_SUPERBLOCK_SIZE: usize = 96;

pub const EROFS_MAGIC: u32 = 0xe0f5_e1e2;
const EROFS_SUPERBLOCK_OFFSET: usize = 1024;
const EROFS_SUPERBLOCK_SIZE: usize = 128;

/// Feature with backward compatibility: superblock carries a CRC32C checksum.
const EROFS_FEATURE_COMPAT_SB_CHKSUM: u32 = 0x0000_0001;

/// Incompatible features supported by this reader. Anything else is rejected.
const EROFS_FEATURE_INCOMPAT_SUPPORTED: u32 = 0x0;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

fn le_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn le_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn le_u64(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes([
        b[off],
        b[off + 1],
        b[off + 2],
        b[off + 3],
        b[off + 4],
        b[off + 5],
        b[off + 6],
        b[off + 7],
    ])
}

fn read_exact_at_start(path: &Path, len: usize) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|source| Error::Internal {
        context: format!("failed to open image '{}'", path.display()).into(),
        source: source.into(),
    })?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).map_err(|source| {
        if source.kind() == io::ErrorKind::UnexpectedEof {
            ImageError::TruncatedImage {
                path: path.to_owned(),
            }
            .into()
        } else {
            Error::Internal {
                context: format!("failed to read image '{}'", path.display()).into(),
                source: source.into(),
            }
        }
    })?;
    Ok(buf)
}

/// The fixed SquashFS superblock at offset 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquashfsSuperblock {
    pub magic: u32,
    pub inode_count: u32,
    pub mkfs_time: u32,
    pub block_size: u32,
    pub fragment_entry_count: u32,
    pub compression_id: u16,
    pub block_log: u16,
    pub flags: u16,
    pub id_count: u16,
    pub version_major: u16,
    pub version_minor: u16,
    pub root_inode: u64,
    pub bytes_used: u64,
    pub id_table_start: u64,
    pub xattr_id_table_start: u64,
    pub inode_table_start: u64,
    pub directory_table_start: u64,
    pub fragment_table_start: u64,
    pub export_table_start: u64,
}

impl SquashfsSuperblock {
    pub fn read(path: &Path) -> Result<Self> {
        let buf = read_exact_at_start(path, SQUASHFS_SUPERBLOCK_SIZE)?;
        Self::parse(&buf, path)
    }

    fn parse(b: &[u8], path: &Path) -> Result<Self> {
        if b.len() < SQUASHFS_SUPERBLOCK_SIZE {
            return Err(ImageError::TruncatedImage {
                path: path.to_owned(),
            }
            .into());
        }

        let magic = le_u32(b, 0);
        if magic != SQUASHFS_MAGIC {
            return Err(ImageError::BadMagic {
                path: path.to_owned(),
                found: magic,
                expected: SQUASHFS_MAGIC,
            }
            .into());
        }

        Ok(Self {
            magic,
            inode_count: le_u32(b, 4),
            mkfs_time: le_u32(b, 8),
            block_size: le_u32(b, 12),
            fragment_entry_count: le_u32(b, 16),
            compression_id: le_u16(b, 20),
            block_log: le_u16(b, 22),
            flags: le_u16(b, 24),
            id_count: le_u16(b, 26),
            version_major: le_u16(b, 28),
            version_minor: le_u16(b, 30),
            root_inode: le_u64(b, 32),
            bytes_used: le_u64(b, 40),
            id_table_start: le_u64(b, 48),
            xattr_id_table_start: le_u64(b, 56),
            inode_table_start: le_u64(b, 64),
            directory_table_start: le_u64(b, 72),
            fragment_table_start: le_u64(b, 80),
            export_table_start: le_u64(b, 88),
        })
    }

    /// The offset just past the filesystem data, where appended verity data
    /// begins. SquashFS images are padded out to the nearest 4 KiB.
    pub fn verity_data_location(&self) -> u64 {
        let len = self.bytes_used;
        if len % 4096 != 0 {
            len + (4096 - len % 4096)
        } else {
            len
        }
    }
}

/// The EROFS superblock, 128 bytes at offset 1024.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErofsSuperblock {
    pub magic: u32,
    pub checksum: u32,
    pub feature_compat: u32,
    pub block_size_bits: u8,
    pub ext_slots: u8,
    pub root_nid: u16,
    pub inodes: u64,
    pub build_time: u64,
    pub build_time_nsec: u32,
    pub blocks: u32,
    pub meta_block_addr: u32,
    pub xattr_block_addr: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub feature_incompat: u32,
    pub extra_devices: u16,
    pub dev_table_slot_off: u16,
}

impl ErofsSuperblock {
    pub fn read(path: &Path) -> Result<Self> {
        let head = read_exact_at_start(path, EROFS_SUPERBLOCK_OFFSET + EROFS_SUPERBLOCK_SIZE)?;
        let sb = Self::parse(&head[EROFS_SUPERBLOCK_OFFSET..], path)?;

        if sb.feature_compat & EROFS_FEATURE_COMPAT_SB_CHKSUM != 0 {
            let block = read_exact_at_start(path, 1usize << sb.block_size_bits)?;
            sb.verify_checksum(&block, path)?;
        }

        Ok(sb)
    }

    fn parse(b: &[u8], path: &Path) -> Result<Self> {
        if b.len() < EROFS_SUPERBLOCK_SIZE {
            return Err(ImageError::TruncatedImage {
                path: path.to_owned(),
            }
            .into());
        }

        let magic = le_u32(b, 0);
        if magic != EROFS_MAGIC {
            return Err(ImageError::BadMagic {
                path: path.to_owned(),
                found: magic,
                expected: EROFS_MAGIC,
            }
            .into());
        }

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&b[48..64]);
        let mut volume_name = [0u8; 16];
        volume_name.copy_from_slice(&b[64..80]);

        let sb = Self {
            magic,
            checksum: le_u32(b, 4),
            feature_compat: le_u32(b, 8),
            block_size_bits: b[12],
            ext_slots: b[13],
            root_nid: le_u16(b, 14),
            inodes: le_u64(b, 16),
            build_time: le_u64(b, 24),
            build_time_nsec: le_u32(b, 32),
            blocks: le_u32(b, 36),
            meta_block_addr: le_u32(b, 40),
            xattr_block_addr: le_u32(b, 44),
            uuid,
            volume_name,
            feature_incompat: le_u32(b, 80),
            extra_devices: le_u16(b, 86),
            dev_table_slot_off: le_u16(b, 88),
        };

        let unsupported = sb.feature_incompat & !EROFS_FEATURE_INCOMPAT_SUPPORTED;
        if unsupported != 0 {
            return Err(ImageError::UnsupportedFeature {
                path: path.to_owned(),
                features: unsupported,
            }
            .into());
        }

        // a corrupt bits field must not overflow the shift; blocks over
        // 1 MiB are nothing the kernel driver supports either
        let block_size = 1u64
            .checked_shl(u32::from(sb.block_size_bits))
            .unwrap_or(u64::MAX);
        if sb.block_size_bits > 20 || block_size % procinfo::page_size() != 0 {
            return Err(ImageError::UnsupportedBlockSize {
                path: path.to_owned(),
                block_size,
            }
            .into());
        }

        Ok(sb)
    }

    /// Verifies the CRC32C (Castagnoli) over the first block, with the
    /// checksum field itself zeroed.
    fn verify_checksum(&self, block: &[u8], path: &Path) -> Result<()> {
        let mut data = block[EROFS_SUPERBLOCK_OFFSET..].to_vec();
        data[4..8].fill(0);

        let computed = !CASTAGNOLI.checksum(&data);
        if computed != self.checksum {
            return Err(ImageError::ChecksumMismatch {
                path: path.to_owned(),
                computed,
                expected: self.checksum,
            }
            .into());
        }

        Ok(())
    }

    /// The offset just past the filesystem data, where appended verity data
    /// begins. EROFS images are always block-aligned.
    pub fn verity_data_location(&self) -> u64 {
        u64::from(self.blocks) * (1u64 << self.block_size_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use tempfile::NamedTempFile;

    fn squashfs_image(bytes_used: u64) -> Vec<u8> {
        let mut b = vec![0u8; SQUASHFS_SUPERBLOCK_SIZE];
        b[0..4].copy_from_slice(&SQUASHFS_MAGIC.to_le_bytes());
        b[12..16].copy_from_slice(&131072u32.to_le_bytes());
        b[28..30].copy_from_slice(&4u16.to_le_bytes());
        b[40..48].copy_from_slice(&bytes_used.to_le_bytes());
        b
    }

    fn erofs_image(block_size_bits: u8, blocks: u32, with_checksum: bool) -> Vec<u8> {
        let block_size = 1usize << block_size_bits;
        let mut b = vec![0u8; block_size.max(EROFS_SUPERBLOCK_OFFSET + EROFS_SUPERBLOCK_SIZE)];
        let sb = EROFS_SUPERBLOCK_OFFSET;
        b[sb..sb + 4].copy_from_slice(&EROFS_MAGIC.to_le_bytes());
        if with_checksum {
            b[sb + 8..sb + 12].copy_from_slice(&EROFS_FEATURE_COMPAT_SB_CHKSUM.to_le_bytes());
        }
        b[sb + 12] = block_size_bits;
        b[sb + 36..sb + 40].copy_from_slice(&blocks.to_le_bytes());

        if with_checksum {
            let checksum = !CASTAGNOLI.checksum(&b[sb..block_size]);
            b[sb + 4..sb + 8].copy_from_slice(&checksum.to_le_bytes());
        }
        b
    }

    fn write_temp(data: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    /// Smallest block size the reader accepts on this host.
    fn host_block_bits() -> u8 {
        procinfo::page_size().trailing_zeros().max(12) as u8
    }

    #[test]
    fn test_squashfs_superblock() {
        let img = write_temp(&squashfs_image(4096 * 3));
        let sb = SquashfsSuperblock::read(img.path()).unwrap();
        assert_eq!(sb.bytes_used, 4096 * 3);
        assert_eq!(sb.version_major, 4);
        assert_eq!(sb.verity_data_location(), 4096 * 3);
    }

    #[test]
    fn test_squashfs_verity_location_rounds_up() {
        let img = write_temp(&squashfs_image(4097));
        let sb = SquashfsSuperblock::read(img.path()).unwrap();
        assert_eq!(sb.verity_data_location(), 8192);
    }

    #[test]
    fn test_squashfs_bad_magic() {
        let mut data = squashfs_image(4096);
        data[0] = 0xff;
        let img = write_temp(&data);
        match SquashfsSuperblock::read(img.path()).unwrap_err() {
            Error::Image(ImageError::BadMagic { expected, .. }) => {
                assert_eq!(expected, SQUASHFS_MAGIC)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_squashfs_truncated() {
        let img = write_temp(&[0u8; 17]);
        assert!(matches!(
            SquashfsSuperblock::read(img.path()).unwrap_err(),
            Error::Image(ImageError::TruncatedImage { .. })
        ));
    }

    #[test]
    fn test_erofs_superblock() {
        let bits = host_block_bits();
        let img = write_temp(&erofs_image(bits, 64, true));
        let sb = ErofsSuperblock::read(img.path()).unwrap();
        assert_eq!(sb.blocks, 64);
        assert_eq!(sb.block_size_bits, bits);
        assert_eq!(sb.verity_data_location(), 64 * (1u64 << bits));
    }

    #[test]
    fn test_erofs_no_checksum_feature() {
        let img = write_temp(&erofs_image(host_block_bits(), 8, false));
        let sb = ErofsSuperblock::read(img.path()).unwrap();
        assert_eq!(sb.feature_compat & EROFS_FEATURE_COMPAT_SB_CHKSUM, 0);
    }

    #[test]
    fn test_erofs_checksum_mismatch() {
        let mut data = erofs_image(host_block_bits(), 8, true);
        // corrupt a byte inside the checksummed block, past the superblock
        let last = data.len() - 1;
        data[last] ^= 0xa5;
        let img = write_temp(&data);
        assert!(matches!(
            ErofsSuperblock::read(img.path()).unwrap_err(),
            Error::Image(ImageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_erofs_unsupported_feature() {
        let mut data = erofs_image(host_block_bits(), 8, false);
        let sb = EROFS_SUPERBLOCK_OFFSET;
        data[sb + 80..sb + 84].copy_from_slice(&2u32.to_le_bytes());
        let img = write_temp(&data);
        match ErofsSuperblock::read(img.path()).unwrap_err() {
            Error::Image(ImageError::UnsupportedFeature { features, .. }) => {
                assert_eq!(features, 2)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_erofs_unsupported_block_size() {
        // 2 KiB blocks are not a multiple of any supported page size
        let data = erofs_image(11, 8, false);
        let img = write_temp(&data);
        assert!(matches!(
            ErofsSuperblock::read(img.path()).unwrap_err(),
            Error::Image(ImageError::UnsupportedBlockSize { block_size: 2048, .. })
        ));
    }

    #[test]
    fn test_erofs_bad_magic() {
        let mut data = erofs_image(host_block_bits(), 8, false);
        data[EROFS_SUPERBLOCK_OFFSET] = 0;
        let img = write_temp(&data);
        assert!(matches!(
            ErofsSuperblock::read(img.path()).unwrap_err(),
            Error::Image(ImageError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_erofs_truncated() {
        let img = write_temp(&[0u8; EROFS_SUPERBLOCK_OFFSET]);
        assert!(matches!(
            ErofsSuperblock::read(img.path()).unwrap_err(),
            Error::Image(ImageError::TruncatedImage { .. })
        ));
    }
}
