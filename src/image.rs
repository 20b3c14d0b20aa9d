//! Byte-level operations on the working image and its loop device.

use std::{fs::OpenOptions, os::unix::fs::FileExt, path::Path};

use log::{debug, info};

use crate::{
    error::{IoContext, Result},
    layout::ZeroRange,
    util::progress_bar,
};

const ZERO_CHUNK: usize = 1 << 20;

/// Extends the backing file by `bytes`, filling with zeros.
///
/// The file must not be loop-attached while this runs: a loop device's size is fixed when it is
/// configured.
pub fn grow_image(path: &Path, bytes: u64) -> Result<u64> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .io_context(|| format!("opening {}", path.display()))?;
    let size = file
        .metadata()
        .io_context(|| format!("reading size of {}", path.display()))?
        .len();
    let new_size = size + bytes;

    rustix::fs::ftruncate(&file, new_size)
        .map_err(std::io::Error::from)
        .io_context(|| format!("growing {} to {new_size} bytes", path.display()))?;
    rustix::fs::fsync(&file)
        .map_err(std::io::Error::from)
        .io_context(|| format!("syncing {}", path.display()))?;

    info!("grew {} from {size} to {new_size} bytes", path.display());
    Ok(new_size)
}

/// Overwrites `range` of `device` with zeros, in place.
pub fn zero_range(device: &Path, range: ZeroRange, progress: bool) -> Result<()> {
    if range.length == 0 {
        debug!("nothing to zero on {}", device.display());
        return Ok(());
    }

    let file = OpenOptions::new()
        .write(true)
        .open(device)
        .io_context(|| format!("opening {}", device.display()))?;

    let zeros = vec![0u8; ZERO_CHUNK];
    let bar = progress_bar(Some(range.length), "zeroing unused root space", progress);
    let mut done = 0;
    while done < range.length {
        let chunk = (range.length - done).min(ZERO_CHUNK as u64) as usize;
        let offset = range.offset + done;
        file.write_all_at(&zeros[..chunk], offset)
            .io_context(|| format!("zeroing {} at {offset}", device.display()))?;
        done += chunk as u64;
        bar.set_position(done);
    }
    file.sync_all()
        .io_context(|| format!("syncing {}", device.display()))?;
    bar.finish_and_clear();

    info!(
        "zeroed {} bytes at {} on {}",
        range.length,
        range.offset,
        device.display()
    );
    Ok(())
}
