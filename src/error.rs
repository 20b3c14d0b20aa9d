//! Error types for repartitioning runs.
//!
//! Every failure a run can surface falls in one of a small set of categories:
//!
//! - **Parse**: a size string or other user input could not be understood
//! - **Detection**: no squashfs partition was found on the image
//! - **Constraint**: the requested layout is impossible (root too small, empty overlay)
//! - **Resource exhaustion**: no free loop device
//! - **Tool failure**: an external tool or system call reported failure
//!
//! All of them are fatal.  Nothing is retried.

use std::path::PathBuf;

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Failure categories, used for messages and process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Parse,
    Detection,
    Constraint,
    ResourceExhaustion,
    ToolFailure,
}

impl Category {
    pub fn name(self) -> &'static str {
        match self {
            Category::Parse => "parse error",
            Category::Detection => "detection error",
            Category::Constraint => "constraint error",
            Category::ResourceExhaustion => "resource exhaustion",
            Category::ToolFailure => "tool failure",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An unparseable size or other input value.
    #[error("invalid {what}: {value:?}")]
    Parse { what: &'static str, value: String },

    /// No recognised squashfs partition on the device.
    #[error("no squashfs partition found on {0}")]
    Detection(PathBuf),

    /// The partition that was planned for disappeared from the table.
    #[error("partition starting at byte {start} not found on {device} after re-attach")]
    PartitionLost { device: PathBuf, start: u64 },

    /// The requested root size can't hold the filesystem.
    #[error("requested root size {requested} too small for filesystem content of {content} bytes")]
    RootTooSmall { requested: u64, content: u64 },

    /// The overlay would have no usable space.
    #[error("overlay size {0} leaves no room for an overlay filesystem")]
    EmptyOverlay(u64),

    /// The overlay region is too small after alignment and the reserved tail.
    #[error("no room for an overlay partition at byte {overlay_start} in an image of {image_size} bytes")]
    NoRoomForOverlay { overlay_start: u64, image_size: u64 },

    /// The planned layout runs into another partition.
    #[error("planned layout {start}..{end} overlaps partition {index}")]
    Overlap { index: u32, start: u64, end: u64 },

    /// No loop device could be allocated.
    #[error("no free loop device available")]
    NoFreeLoopDevice,

    /// An external tool exited unsuccessfully.
    #[error("{tool} failed ({status}): {stderr}")]
    Tool {
        tool: String,
        status: String,
        stderr: String,
    },

    /// Creating a partition didn't result in exactly one new table entry.
    #[error("expected exactly one new partition on {device}, found {found:?}")]
    AmbiguousPartition { device: PathBuf, found: Vec<u32> },

    /// Output of a partition-table tool couldn't be understood.
    #[error("unexpected output from {tool}: {line:?}")]
    ToolOutput { tool: String, line: String },

    /// A device or file operation failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The output file exists and overwriting wasn't requested.
    #[error("output {0} already exists")]
    OutputExists(PathBuf),

    /// The configuration file couldn't be loaded.
    #[error("failed to load configuration {path}: {message}")]
    Config { path: PathBuf, message: String },
}

impl Error {
    pub fn category(&self) -> Category {
        match self {
            Error::Parse { .. } | Error::Config { .. } | Error::OutputExists(_) => {
                Category::Parse
            }
            Error::Detection(_) | Error::PartitionLost { .. } => Category::Detection,
            Error::RootTooSmall { .. }
            | Error::EmptyOverlay(_)
            | Error::NoRoomForOverlay { .. }
            | Error::Overlap { .. } => Category::Constraint,
            Error::NoFreeLoopDevice => Category::ResourceExhaustion,
            Error::Tool { .. }
            | Error::AmbiguousPartition { .. }
            | Error::ToolOutput { .. }
            | Error::Io { .. } => Category::ToolFailure,
        }
    }

    pub(crate) fn parse(what: &'static str, value: impl Into<String>) -> Self {
        Error::Parse {
            what,
            value: value.into(),
        }
    }
}

/// Attaches a description of the failed operation to an I/O error.
pub(crate) trait IoContext<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|source| Error::Io {
            context: context(),
            source,
        })
    }
}

#[cfg(test)]
mod test {
    use std::io::ErrorKind;

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(Error::parse("size", "abc").category(), Category::Parse);
        assert_eq!(
            Error::Detection("/dev/loop0".into()).category(),
            Category::Detection
        );
        assert_eq!(Error::EmptyOverlay(0).category(), Category::Constraint);
        assert_eq!(
            Error::RootTooSmall {
                requested: 1,
                content: 2
            }
            .category(),
            Category::Constraint
        );
        assert_eq!(
            Error::NoFreeLoopDevice.category(),
            Category::ResourceExhaustion
        );
        assert_eq!(
            Error::AmbiguousPartition {
                device: "/dev/loop0".into(),
                found: vec![]
            }
            .category(),
            Category::ToolFailure
        );
    }

    #[test]
    fn test_messages_name_the_value() {
        assert_eq!(
            Error::parse("overlay size", "12q").to_string(),
            "invalid overlay size: \"12q\""
        );
        assert_eq!(
            Error::RootTooSmall {
                requested: 41943040,
                content: 52428800
            }
            .to_string(),
            "requested root size 41943040 too small for filesystem content of 52428800 bytes"
        );
    }

    #[test]
    fn test_io_context() {
        let result: std::io::Result<()> = Err(ErrorKind::NotFound.into());
        let err = result.io_context(|| "opening image".into()).unwrap_err();
        assert_eq!(err.category(), Category::ToolFailure);
        assert!(err.to_string().starts_with("opening image: "));
    }
}
