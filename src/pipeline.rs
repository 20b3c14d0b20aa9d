//! The codec bracket around a run.
//!
//! The input is decoded into a working image, the engine repartitions that, and the result is
//! encoded with the same codec into the output.  The output only appears once everything has
//! succeeded; the working image is removed on every path.

use std::path::{Path, PathBuf};

use log::{debug, info};
use tempfile::{Builder, NamedTempFile, PersistError};

use crate::{
    codec::{Codec, Compression},
    engine::{Engine, Outcome},
    error::{Error, IoContext, Result},
    layout::LayoutRequest,
};

/// Where a run reads from and writes to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Job {
    pub input: PathBuf,
    pub output: PathBuf,
    pub compression: Compression,
    /// Directory for the working image.  Defaults to the output's directory.
    pub workdir: Option<PathBuf>,
    /// Replace an existing output.
    pub force: bool,
}

impl Job {
    fn output_dir(&self) -> &Path {
        match self.output.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }
}

fn scratch_file(dir: &Path, suffix: &str) -> Result<NamedTempFile> {
    Builder::new()
        .prefix(".squashpart-")
        .suffix(suffix)
        .tempfile_in(dir)
        .io_context(|| format!("creating a temporary file in {}", dir.display()))
}

fn persist(
    file: NamedTempFile,
    output: &Path,
    force: bool,
) -> std::result::Result<(), PersistError> {
    match force {
        true => file.persist(output).map(drop),
        false => file.persist_noclobber(output).map(drop),
    }
}

fn persist_error(err: PersistError, output: &Path) -> Error {
    match err.error.kind() {
        std::io::ErrorKind::AlreadyExists => Error::OutputExists(output.to_path_buf()),
        _ => Error::Io {
            context: format!("writing {}", output.display()),
            source: err.error,
        },
    }
}

/// Decodes `job.input`, runs `engine` on it and writes `job.output`.
///
/// On a dry run the working image is planned against and then discarded.
pub fn repartition(job: &Job, engine: &Engine<'_>, request: &LayoutRequest) -> Result<Outcome> {
    let options = engine.options();
    let codec = job.compression.resolve(&job.input)?;
    info!("{}: {codec}", job.input.display());

    if !options.dry_run && !job.force && job.output.exists() {
        return Err(Error::OutputExists(job.output.clone()));
    }

    let output_dir = job.output_dir();
    let workdir = job.workdir.as_deref().unwrap_or(output_dir);
    let mut working = scratch_file(workdir, ".img")?;
    debug!("working image {}", working.path().display());
    codec.decompress(&job.input, working.as_file_mut(), options.progress)?;

    let outcome = engine.run(working.path(), request)?;
    if options.dry_run {
        return Ok(outcome);
    }

    let working = match codec {
        Codec::Raw => match persist(working, &job.output, job.force) {
            Ok(()) => {
                info!("wrote {}", job.output.display());
                return Ok(outcome);
            }
            Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(persist_error(err, &job.output));
            }
            Err(err) => {
                // most likely a working directory on another filesystem
                debug!("can't rename working image ({}), copying", err.error);
                err.file
            }
        },
        _ => working,
    };

    let mut staged = scratch_file(output_dir, ".out")?;
    codec.compress(working.path(), staged.as_file_mut(), options.progress)?;
    persist(staged, &job.output, job.force).map_err(|err| persist_error(err, &job.output))?;
    info!("wrote {} ({codec})", job.output.display());
    Ok(outcome)
}
