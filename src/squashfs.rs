//! Squashfs detection.
//!
//! Only the superblock is read.  Its `bytes_used` field is the exact length of the archive,
//! which is usually much smaller than the partition holding it.

use std::{fs::File, io::Read, path::Path, time::Duration};

use log::{debug, warn};
use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::{
    error::{IoContext, Result},
    util::{read_exactish, wait_for_path},
};

/// Superblock magic, the bytes of 0x73717368 in little-endian order.
pub const SQUASHFS_MAGIC: [u8; 4] = *b"hsqs";

/// How long to wait for a partition node before deciding it isn't there.
const NODE_TIMEOUT: Duration = Duration::from_secs(5);

/// The 96-byte squashfs 4.0 superblock at offset 0.
#[repr(C)]
#[derive(Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Superblock {
    pub magic: [u8; 4],
    pub inode_count: U32,
    pub mod_time: U32,
    pub block_size: U32,
    pub frag_count: U32,
    pub compressor: U16,
    pub block_log: U16,
    pub flags: U16,
    pub id_count: U16,
    pub version_major: U16,
    pub version_minor: U16,
    pub root_inode: U64,
    /// Number of bytes used by the archive, excluding any padding after it.
    pub bytes_used: U64,
    pub id_table: U64,
    pub xattr_table: U64,
    pub inode_table: U64,
    pub dir_table: U64,
    pub frag_table: U64,
    pub export_table: U64,
}

const _: () = {
    assert!(size_of::<Superblock>() == 96);
};

impl Superblock {
    fn is_valid(&self) -> bool {
        self.magic == SQUASHFS_MAGIC
            && self.version_major.get() == 4
            && self.block_log.get() < 32
            && self.block_size.get() == 1 << self.block_log.get()
    }
}

fn compressor_name(id: u16) -> &'static str {
    match id {
        1 => "gzip",
        2 => "lzma",
        3 => "lzo",
        4 => "xz",
        5 => "lz4",
        6 => "zstd",
        _ => "unknown",
    }
}

/// What a successful probe learned about a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesystemReport {
    /// Exact payload size according to the filesystem's own metadata.
    pub content_size: u64,
}

/// The filesystem probe primitive.
pub trait FilesystemProbe {
    /// Returns a report if `partition` holds the root filesystem type, `None` if it holds
    /// something else.
    fn probe(&self, partition: &Path) -> Result<Option<FilesystemReport>>;
}

/// Reads a squashfs superblock from the start of `reader`.
///
/// Short input and foreign data are "not recognized", not errors.
pub fn read_superblock(reader: &mut impl Read) -> std::io::Result<Option<Superblock>> {
    let mut buf = [0u8; size_of::<Superblock>()];
    match read_exactish(reader, &mut buf) {
        Ok(true) => {}
        Ok(false) => return Ok(None),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    // the buffer is exactly the size of the struct, so this can't fail
    let Ok(superblock) = Superblock::read_from_bytes(&buf) else {
        return Ok(None);
    };
    Ok(superblock.is_valid().then_some(superblock))
}

/// Probes partition nodes for a squashfs superblock.
#[derive(Debug, Default)]
pub struct SquashfsProbe;

impl FilesystemProbe for SquashfsProbe {
    fn probe(&self, partition: &Path) -> Result<Option<FilesystemReport>> {
        if !wait_for_path(partition, NODE_TIMEOUT) {
            warn!("{} did not appear", partition.display());
            return Ok(None);
        }

        let mut file =
            File::open(partition).io_context(|| format!("opening {}", partition.display()))?;
        let superblock = read_superblock(&mut file)
            .io_context(|| format!("reading superblock of {}", partition.display()))?;

        Ok(superblock.map(|sb| {
            debug!(
                "{}: squashfs {}.{}, {} compression, {} inodes, {} bytes used",
                partition.display(),
                sb.version_major.get(),
                sb.version_minor.get(),
                compressor_name(sb.compressor.get()),
                sb.inode_count.get(),
                sb.bytes_used.get(),
            );
            FilesystemReport {
                content_size: sb.bytes_used.get(),
            }
        }))
    }
}
