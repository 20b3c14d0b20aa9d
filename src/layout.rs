//! Partition layout planning.
//!
//! Given the squashfs partition, the size of its content and the requested sizes, compute where
//! the shrunk root partition and the new overlay partition go and how much the image has to grow
//! to hold them.  Planning is pure arithmetic: nothing here touches a device.

use std::fmt;

use crate::{
    error::{Error, Result},
    partition::{PartitionRecord, TableScheme},
    size::{format_size, parse_size, KIB, MIB},
    squashfs::FilesystemReport,
    util::align_up,
    SECTOR_SIZE,
};

/// Automatic root sizes are multiples of this.
pub const ROOT_ALIGN: u64 = 8 * MIB;
/// Everything in the root partition past the content rounded up to this is zeroed.
pub const TAIL_ALIGN: u64 = 64 * KIB;
/// The overlay partition starts on a boundary of this many bytes (2048 sectors).
pub const OVERLAY_ALIGN: u64 = MIB;
/// Bytes left unused at the end of the overlay region for the overlay filesystem's trailing
/// structures.
pub const OVERLAY_TAIL_RESERVE: u64 = 4096;

/// The user's size requests, parsed and validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutRequest {
    /// Explicit root partition size, or `None` to derive it from the content size.
    pub root_size: Option<u64>,
    pub overlay_size: u64,
}

impl LayoutRequest {
    /// Parses the size strings.  Happens before any device is touched.
    pub fn parse(root_size: Option<&str>, overlay_size: &str) -> Result<Self> {
        let root_size = root_size
            .map(|value| parse_size(value).ok_or_else(|| Error::parse("root size", value)))
            .transpose()?;
        let overlay_size =
            parse_size(overlay_size).ok_or_else(|| Error::parse("overlay size", overlay_size))?;
        if overlay_size == 0 {
            return Err(Error::EmptyOverlay(0));
        }
        Ok(Self {
            root_size,
            overlay_size,
        })
    }
}

/// The device a layout is planned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disk {
    /// Current size of the backing image.
    pub size: u64,
    pub scheme: TableScheme,
}

/// A byte range of the device to overwrite with zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroRange {
    pub offset: u64,
    pub length: u64,
}

/// The computed target layout.  All offsets are absolute device byte offsets, ends exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutPlan {
    pub root_index: u32,
    pub scheme: TableScheme,
    pub content_size: u64,
    pub root_start: u64,
    pub root_end: u64,
    pub overlay_start: u64,
    pub overlay_end: u64,
    /// Bytes to append to the image before applying the layout, 0 if it already fits.
    pub growth: u64,
    pub tail_zero: ZeroRange,
}

impl LayoutPlan {
    pub fn root_size(&self) -> u64 {
        self.root_end - self.root_start
    }

    pub fn overlay_size(&self) -> u64 {
        self.overlay_end - self.overlay_start
    }

    /// Points the plan at the root partition's index in a re-read table.
    pub(crate) fn rebind(&mut self, root: &PartitionRecord) {
        debug_assert_eq!(root.start, self.root_start);
        self.root_index = root.index;
    }
}

impl fmt::Display for LayoutPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "squashfs content: {} bytes", self.content_size)?;
        writeln!(
            f,
            "root partition {}: {}..{} ({})",
            self.root_index,
            self.root_start,
            self.root_end,
            format_size(self.root_size())
        )?;
        writeln!(
            f,
            "overlay partition: {}..{} ({})",
            self.overlay_start,
            self.overlay_end,
            format_size(self.overlay_size())
        )?;
        writeln!(
            f,
            "zero fill: {} bytes at {}",
            self.tail_zero.length, self.tail_zero.offset
        )?;
        write!(f, "image growth: {}", format_size(self.growth))?;
        if self.scheme == TableScheme::Gpt {
            write!(
                f,
                "\nnote: the recreated root partition gets a new GPT unique GUID"
            )?;
        }
        Ok(())
    }
}

/// Resolves the root partition size for a given content size.
pub fn resolve_root_size(content_size: u64, requested: Option<u64>) -> Result<u64> {
    match requested {
        None => {
            let size = align_up(content_size, ROOT_ALIGN).ok_or(Error::RootTooSmall {
                requested: u64::MAX,
                content: content_size,
            })?;
            Ok(size.max(ROOT_ALIGN))
        }
        Some(requested) if requested < content_size || requested == 0 => {
            Err(Error::RootTooSmall {
                requested,
                content: content_size,
            })
        }
        // partition boundaries are whole sectors
        Some(requested) => align_up(requested, SECTOR_SIZE).ok_or(Error::RootTooSmall {
            requested,
            content: content_size,
        }),
    }
}

/// Offset within the root partition where the zero fill begins.
pub fn tail_start(content_size: u64) -> u64 {
    // content_size comes from a u64 field that can't be within 64KiB of overflow on any real
    // device, but saturate instead of panicking on a corrupt superblock
    align_up(content_size, TAIL_ALIGN).unwrap_or(u64::MAX)
}

/// Computes the new layout.
///
/// `table` is the full partition table (used to reject layouts that run into later
/// partitions) and `root` the squashfs partition within it.  The overlay ends before any
/// trailing structure of the table, such as the GPT backup header.
pub fn plan_layout(
    table: &[PartitionRecord],
    root: &PartitionRecord,
    report: &FilesystemReport,
    request: &LayoutRequest,
    disk: Disk,
) -> Result<LayoutPlan> {
    let image_size = disk.size;
    let content_size = report.content_size;
    let root_size = resolve_root_size(content_size, request.root_size)?;
    let overflow = || Error::NoRoomForOverlay {
        overlay_start: u64::MAX,
        image_size,
    };

    // growth is measured against the space the root partition already owns
    let needed = root_size
        .checked_add(request.overlay_size)
        .ok_or_else(overflow)?;
    let growth = match needed.checked_sub(root.size()) {
        Some(deficit) if deficit > 0 => align_up(deficit, SECTOR_SIZE).ok_or_else(overflow)?,
        _ => 0,
    };

    let root_start = root.start;
    let root_end = root_start.checked_add(root_size).ok_or_else(overflow)?;
    let overlay_start = align_up(root_end, OVERLAY_ALIGN).ok_or_else(overflow)?;

    let image_end = image_size.checked_add(growth).ok_or_else(overflow)?;
    // parted --fix moves a GPT backup table to the end of the grown image
    let usable_end = image_end.saturating_sub(disk.scheme.trailer());
    let region_end = overlay_start
        .saturating_add(request.overlay_size)
        .min(usable_end);
    let overlay_end = region_end
        .checked_sub(OVERLAY_TAIL_RESERVE)
        .map(|end| end - end % SECTOR_SIZE)
        .filter(|end| *end > overlay_start)
        .ok_or(Error::NoRoomForOverlay {
            overlay_start,
            image_size: image_end,
        })?;

    if let Some(other) = table
        .iter()
        .filter(|p| p.index != root.index)
        .find(|p| p.start < overlay_end && root_start < p.end)
    {
        return Err(Error::Overlap {
            index: other.index,
            start: root_start,
            end: overlay_end,
        });
    }

    let tail = tail_start(content_size);
    let tail_zero = ZeroRange {
        offset: root_start.saturating_add(tail),
        length: root_size.saturating_sub(tail),
    };

    Ok(LayoutPlan {
        root_index: root.index,
        scheme: disk.scheme,
        content_size,
        root_start,
        root_end,
        overlay_start,
        overlay_end,
        growth,
        tail_zero,
    })
}
