//! Loop device attachment.
//!
//! [`LoopControl`] is the attach/detach primitive.  [`KernelLoop`] implements it with the
//! loop-control ioctls; partition scanning is always enabled so that the kernel exposes the
//! image's partitions as `/dev/loopNpM`.
//!
//! [`LoopBinding`] is the scoped guard around an attachment: it detaches when dropped, so a
//! binding can't outlive the run that created it, whichever way the run ends.

#![allow(unsafe_code)]

use std::{
    fs::OpenOptions,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use log::{debug, error, info};
use rustix::{
    io::Errno,
    ioctl::{ioctl, opcode, NoArg, Opcode, Setter},
};

use crate::error::{Error, IoContext, Result};

/// Flags for loop device configuration.
pub mod flags {
    /// Allow partition scanning.
    pub const LO_FLAGS_PARTSCAN: u32 = 8;
}

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

// Loop device ioctl structures
#[repr(C)]
#[derive(Default)]
struct LoopConfig {
    fd: u32,
    block_size: u32,
    info: LoopInfo64,
    reserved: [u64; 8],
}

#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    // HACK: default trait is only implemented up to [u8; 32]
    lo_file_name: ([u8; LO_NAME_SIZE / 2], [u8; LO_NAME_SIZE / 2]),
    lo_crypt_name: ([u8; LO_NAME_SIZE / 2], [u8; LO_NAME_SIZE / 2]),
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: ([0; LO_NAME_SIZE / 2], [0; LO_NAME_SIZE / 2]),
            lo_crypt_name: ([0; LO_NAME_SIZE / 2], [0; LO_NAME_SIZE / 2]),
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

// Custom ioctl for LOOP_CTL_GET_FREE which returns data in the return value
struct LoopCtlGetFree;

// Rustix seems to lack a built-in pattern for an ioctl that returns data by the syscall return
// value instead of the usual return-by-reference on the args parameter.  Bake our own.
unsafe impl rustix::ioctl::Ioctl for LoopCtlGetFree {
    type Output = std::ffi::c_int;

    const IS_MUTATING: bool = false;

    fn opcode(&self) -> rustix::ioctl::Opcode {
        LOOP_CTL_GET_FREE
    }

    fn as_ptr(&mut self) -> *mut std::ffi::c_void {
        std::ptr::null_mut()
    }

    unsafe fn output_from_ptr(
        out: rustix::ioctl::IoctlOutput,
        _ptr: *mut std::ffi::c_void,
    ) -> rustix::io::Result<std::ffi::c_int> {
        Ok(out)
    }
}

const LOOP_CTL_GET_FREE: Opcode = opcode::none(0x4C, 0x82);
// #define LOOP_CLR_FD            0x4C01
const LOOP_CLR_FD: Opcode = opcode::none(0x4C, 0x01);
// #define LOOP_CONFIGURE         0x4C0A
const LOOP_CONFIGURE: Opcode = opcode::write::<LoopConfig>(0x4C, 0x0A);

/// How often to retry when another process grabs the free device between lookup and configure.
const CONFIGURE_ATTEMPTS: usize = 8;

/// The loop attach/detach primitive.
pub trait LoopControl {
    /// Binds a free loop device to `backing` (read-write, partitions scanned) and returns the
    /// device path.
    fn attach(&self, backing: &Path) -> Result<PathBuf>;

    /// Releases the binding for `device`.
    fn detach(&self, device: &Path) -> Result<()>;
}

/// Loop devices managed through `/dev/loop-control`.
#[derive(Debug, Default)]
pub struct KernelLoop;

impl KernelLoop {
    fn get_free(&self) -> Result<i32> {
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/loop-control")
            .io_context(|| "opening /dev/loop-control".into())?;

        // Get a free loop device number
        match unsafe { ioctl(&control, LoopCtlGetFree) } {
            Ok(free) if free >= 0 => Ok(free),
            Ok(_) | Err(Errno::NODEV) | Err(Errno::NOSPC) => Err(Error::NoFreeLoopDevice),
            Err(errno) => {
                Err(std::io::Error::from(errno)).io_context(|| "LOOP_CTL_GET_FREE".into())
            }
        }
    }
}

impl LoopControl for KernelLoop {
    fn attach(&self, backing: &Path) -> Result<PathBuf> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(backing)
            .io_context(|| format!("opening {}", backing.display()))?;

        for _ in 0..CONFIGURE_ATTEMPTS {
            let loop_path = PathBuf::from(format!("/dev/loop{}", self.get_free()?));
            let loop_dev = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&loop_path)
                .io_context(|| format!("opening {}", loop_path.display()))?;

            // block_size 0 keeps the 512-byte default that partition tables are written against
            let config = LoopConfig {
                fd: file.as_raw_fd() as u32,
                block_size: 0,
                info: LoopInfo64 {
                    lo_flags: flags::LO_FLAGS_PARTSCAN,
                    ..Default::default()
                },
                reserved: [0; 8],
            };

            match unsafe {
                ioctl(
                    &loop_dev,
                    Setter::<{ LOOP_CONFIGURE }, LoopConfig>::new(config),
                )
            } {
                Ok(()) => {
                    info!("attached {} to {}", backing.display(), loop_path.display());
                    return Ok(loop_path);
                }
                // lost a race for the device: ask for another one
                Err(Errno::BUSY) => debug!("{} busy, retrying", loop_path.display()),
                Err(errno) => {
                    return Err(std::io::Error::from(errno))
                        .io_context(|| format!("configuring {}", loop_path.display()));
                }
            }
        }

        Err(Error::NoFreeLoopDevice)
    }

    fn detach(&self, device: &Path) -> Result<()> {
        let loop_dev = OpenOptions::new()
            .read(true)
            .open(device)
            .io_context(|| format!("opening {}", device.display()))?;
        unsafe { ioctl(&loop_dev, NoArg::<{ LOOP_CLR_FD }>::new()) }
            .map_err(std::io::Error::from)
            .io_context(|| format!("detaching {}", device.display()))?;
        info!("detached {}", device.display());
        Ok(())
    }
}

/// A live loop attachment that is released when it goes out of scope.
///
/// Use [`LoopBinding::release`] on the normal path to observe detach errors.  On every other
/// path the binding is released by `Drop`, and a failure there is logged instead of replacing
/// whatever error is already unwinding the run.
#[derive(Debug)]
pub struct LoopBinding<'a, L: LoopControl + ?Sized> {
    control: &'a L,
    device: Option<PathBuf>,
}

impl<'a, L: LoopControl + ?Sized> LoopBinding<'a, L> {
    pub fn attach(control: &'a L, backing: &Path) -> Result<Self> {
        let device = control.attach(backing)?;
        Ok(Self {
            control,
            device: Some(device),
        })
    }

    pub fn device(&self) -> &Path {
        // only `release` and `drop` take the device, and both consume the binding
        self.device.as_deref().unwrap_or(Path::new(""))
    }

    /// Detaches now, reporting failure.
    pub fn release(mut self) -> Result<()> {
        match self.device.take() {
            Some(device) => self.control.detach(&device),
            None => Ok(()),
        }
    }
}

impl<L: LoopControl + ?Sized> Drop for LoopBinding<'_, L> {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            if let Err(err) = self.control.detach(&device) {
                error!("failed to detach {}: {err}", device.display());
            }
        }
    }
}

/// Returns the device node for partition `index` of a whole-disk device.
///
/// Devices whose names end in a digit (`loop0`, `nvme0n1`) get a `p` separator.
pub fn partition_path(device: &Path, index: u32) -> PathBuf {
    let mut name = device.as_os_str().to_owned();
    if name
        .to_string_lossy()
        .ends_with(|c: char| c.is_ascii_digit())
    {
        name.push("p");
    }
    name.push(index.to_string());
    PathBuf::from(name)
}
