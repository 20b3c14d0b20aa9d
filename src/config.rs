//! The configuration file.
//!
//! Every setting is optional.  Command-line flags take precedence over the file, and the file
//! over built-in defaults; [`Config::or`] layers one source over another.

use std::{
    fmt::Display,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::debug;
use serde::{Deserialize, Deserializer};

use crate::{
    codec::Compression,
    error::{Error, Result},
    mkfs::OverlayFs,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/squashpart.toml";

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub root_size: Option<String>,
    pub overlay_size: Option<String>,
    pub filesystem: Option<OverlayFs>,
    pub label: Option<String>,
    #[serde(default, deserialize_with = "parse_field")]
    pub compression: Option<Compression>,
    /// Directory for the working image.
    pub workdir: Option<PathBuf>,
    pub parted: Option<PathBuf>,
    pub mkfs_ext4: Option<PathBuf>,
    pub mkfs_f2fs: Option<PathBuf>,
}

fn parse_field<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    Option::<String>::deserialize(deserializer)?
        .map(|value| value.parse().map_err(serde::de::Error::custom))
        .transpose()
}

impl Config {
    /// Parses TOML text; `path` only names the source in errors.
    pub fn from_toml(text: &str, path: &Path) -> Result<Self> {
        toml::from_str(text).map_err(|err| Error::Config {
            path: path.to_path_buf(),
            message: err.message().to_string(),
        })
    }

    /// Loads the file at `path`.
    ///
    /// A missing file is an empty configuration unless `required` is set.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                debug!("loading configuration from {}", path.display());
                Self::from_toml(&text, path)
            }
            Err(err) if err.kind() == ErrorKind::NotFound && !required => {
                debug!("no configuration at {}", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(Error::Config {
                path: path.to_path_buf(),
                message: err.to_string(),
            }),
        }
    }

    /// Fills every setting missing from `self` from `fallback`.
    pub fn or(self, fallback: Config) -> Config {
        Config {
            root_size: self.root_size.or(fallback.root_size),
            overlay_size: self.overlay_size.or(fallback.overlay_size),
            filesystem: self.filesystem.or(fallback.filesystem),
            label: self.label.or(fallback.label),
            compression: self.compression.or(fallback.compression),
            workdir: self.workdir.or(fallback.workdir),
            parted: self.parted.or(fallback.parted),
            mkfs_ext4: self.mkfs_ext4.or(fallback.mkfs_ext4),
            mkfs_f2fs: self.mkfs_f2fs.or(fallback.mkfs_f2fs),
        }
    }
}
