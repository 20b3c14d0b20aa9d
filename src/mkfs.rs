//! Overlay filesystem creation.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Command,
    str::FromStr,
    time::Duration,
};

use log::info;
use serde::Deserialize;

use crate::{
    error::{Error, Result},
    util::{run_tool, wait_for_path},
};

const NODE_TIMEOUT: Duration = Duration::from_secs(5);

/// Filesystems the overlay partition can be formatted with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayFs {
    #[default]
    Ext4,
    F2fs,
}

impl OverlayFs {
    /// Longest volume label the filesystem accepts, in bytes.
    fn max_label_len(self) -> usize {
        match self {
            OverlayFs::Ext4 => 16,
            OverlayFs::F2fs => 512,
        }
    }

    /// Rejects labels the formatter would refuse, before anything is modified.
    pub fn check_label(self, label: &str) -> Result<()> {
        match label.is_empty() || label.len() > self.max_label_len() {
            true => Err(Error::parse("volume label", label)),
            false => Ok(()),
        }
    }
}

impl fmt::Display for OverlayFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OverlayFs::Ext4 => "ext4",
            OverlayFs::F2fs => "f2fs",
        })
    }
}

impl FromStr for OverlayFs {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ext4" => Ok(OverlayFs::Ext4),
            "f2fs" => Ok(OverlayFs::F2fs),
            _ => Err(Error::parse("overlay filesystem", s)),
        }
    }
}

/// The formatter primitive.
pub trait Formatter {
    fn format(&self, partition: &Path, fs: OverlayFs, label: &str) -> Result<()>;
}

/// Formats with the `mkfs.*` tools.
#[derive(Debug, Clone)]
pub struct Mkfs {
    pub ext4: PathBuf,
    pub f2fs: PathBuf,
}

impl Default for Mkfs {
    fn default() -> Self {
        Self {
            ext4: "mkfs.ext4".into(),
            f2fs: "mkfs.f2fs".into(),
        }
    }
}

impl Mkfs {
    fn command(&self, partition: &Path, fs: OverlayFs, label: &str) -> Command {
        let mut cmd;
        match fs {
            OverlayFs::Ext4 => {
                cmd = Command::new(&self.ext4);
                cmd.args(["-F", "-q", "-L", label]);
            }
            OverlayFs::F2fs => {
                cmd = Command::new(&self.f2fs);
                cmd.args(["-f", "-q", "-l", label]);
            }
        }
        cmd.arg(partition);
        cmd
    }
}

impl Formatter for Mkfs {
    fn format(&self, partition: &Path, fs: OverlayFs, label: &str) -> Result<()> {
        if !wait_for_path(partition, NODE_TIMEOUT) {
            return Err(Error::Tool {
                tool: format!("mkfs.{fs}"),
                status: "not started".into(),
                stderr: format!("{} did not appear", partition.display()),
            });
        }

        run_tool(&mut self.command(partition, fs, label))?;
        info!("formatted {} as {fs} ({label})", partition.display());
        Ok(())
    }
}
