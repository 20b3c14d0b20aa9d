//! Repartition firmware disk images that carry a squashfs root filesystem.
//!
//! The root partition is shrunk to the size of its squashfs content and a writable overlay
//! partition is created after it.  See [`engine::Engine`] for the partition-layout run and
//! [`pipeline`] for the decompress/recompress bracket around it.

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod image;
pub mod layout;
pub mod loop_device;
pub mod mkfs;
pub mod partition;
pub mod pipeline;
pub mod size;
pub mod squashfs;
pub mod util;


pub use error::{Error, Result};

/// Sector size used for partition-table arithmetic and growth alignment.
pub const SECTOR_SIZE: u64 = 512;

/// Default volume label for the overlay filesystem.  This is the name that the firmware's
/// early-boot mount logic searches for.
pub const OVERLAY_LABEL: &str = "rootfs_data";
