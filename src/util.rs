use std::{
    io::{Error, ErrorKind, Read, Result},
    path::Path,
    process::{Command, Output},
    thread::sleep,
    time::{Duration, Instant},
};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::debug;

/// Rounds `n` up to the next multiple of `to`.
///
/// `to` must be non-zero.  Returns `None` on overflow.
pub fn align_up(n: u64, to: u64) -> Option<u64> {
    n.checked_next_multiple_of(to)
}

/// This function reads the exact amount of bytes required to fill the buffer, possibly performing
/// multiple reads to do so (and also retrying if required to deal with EINTR).
///
/// The "-ish" is that, unlike the standard Read::read_exact() method, it's possible to determine
/// the difference between an incomplete read (where some amount of bytes were read, but the buffer
/// wasn't filled) and a "clean" EOF where an EOF occurred immediately with no data read at all,
/// which is still considered to be a success.
///
/// # Return value
///
/// There are four possible return values:
///
///  - in case the requested number of bytes were successfully read into the buffer, returns
///    Ok(true)
///  - in case of a "clean" EOF where the stream ends immediately, the function returns
///    Ok(false)
///  - in case of an unexpected EOF after some bytes were read, the function returns an Error with
///    ErrorKind::UnexpectedEof
///  - in case of underlying errors from the Read implementation, the error is returned directly
pub(crate) fn read_exactish(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let buflen = buf.len();
    let mut todo: &mut [u8] = buf;

    while !todo.is_empty() {
        match reader.read(todo) {
            Ok(0) => {
                return match todo.len() {
                    s if s == buflen => Ok(false), // clean EOF
                    _ => Err(Error::from(ErrorKind::UnexpectedEof)),
                };
            }
            Ok(n) => todo = &mut todo[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(true)
}

/// Runs an external tool to completion and returns its output.
///
/// A non-zero exit status is turned into [`crate::Error::Tool`] carrying the tool's stderr.
pub(crate) fn run_tool(cmd: &mut Command) -> crate::Result<Output> {
    let tool = cmd.get_program().to_string_lossy().into_owned();
    debug!("running {cmd:?}");

    let output = cmd.output().map_err(|err| crate::Error::Tool {
        tool: tool.clone(),
        status: "spawn failed".into(),
        stderr: err.to_string(),
    })?;

    if !output.status.success() {
        return Err(crate::Error::Tool {
            tool,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output)
}

/// Waits for a path to appear, polling until the timeout expires.
///
/// Device nodes for partitions show up asynchronously after a loop device is configured or a
/// partition table is changed.  Returns whether the path exists.
pub(crate) fn wait_for_path(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if path.exists() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(50));
    }
}

/// Creates a byte-count progress bar on stderr, or a hidden one.
pub(crate) fn progress_bar(len: Option<u64>, message: &'static str, visible: bool) -> ProgressBar {
    let target = match visible {
        true => ProgressDrawTarget::stderr(),
        false => ProgressDrawTarget::hidden(),
    };
    let bar = ProgressBar::with_draw_target(len, target).with_message(message);
    let template = match len {
        Some(_) => "[eta {eta}] {bar:40.cyan/blue} {binary_bytes:>9}/{binary_total_bytes:9} {msg}",
        None => "{spinner} {binary_bytes:>9} {msg}",
    };
    if let Ok(style) = ProgressStyle::with_template(template) {
        bar.set_style(style.progress_chars("##-"));
    }
    bar
}
