//! Compression containers around firmware images.
//!
//! Images are usually shipped compressed.  A run decompresses the input into a working image and
//! compresses the result back into the same container format.

use std::{
    fmt,
    fs::File,
    io::{self, Read, Write},
    path::Path,
    str::FromStr,
};

use log::debug;

use crate::{
    error::{Error, IoContext, Result},
    util::{progress_bar, read_exactish},
};

/// Bytes needed to see an MBR boot signature.
const SNIFF_LEN: usize = 512;
/// Bytes needed to recognise any supported container.
const MAGIC_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// No container: the file is the disk image itself.
    Raw,
    Gzip,
    Xz,
    Bzip2,
    Zstd,
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Codec::Raw => "raw",
            Codec::Gzip => "gzip",
            Codec::Xz => "xz",
            Codec::Bzip2 => "bzip2",
            Codec::Zstd => "zstd",
        })
    }
}

impl FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "none" => Ok(Codec::Raw),
            "gzip" | "gz" => Ok(Codec::Gzip),
            "xz" => Ok(Codec::Xz),
            "bzip2" | "bz2" => Ok(Codec::Bzip2),
            "zstd" | "zst" => Ok(Codec::Zstd),
            _ => Err(Error::parse("compression", s)),
        }
    }
}

/// Which codec to use: a fixed one, or whatever the input turns out to be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    Auto,
    Fixed(Codec),
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.eq_ignore_ascii_case("auto") {
            true => Ok(Compression::Auto),
            false => Ok(Compression::Fixed(s.parse()?)),
        }
    }
}

impl Compression {
    /// Resolves to a concrete codec, sniffing `input` if needed.
    pub fn resolve(self, input: &Path) -> Result<Codec> {
        match self {
            Compression::Fixed(codec) => Ok(codec),
            Compression::Auto => Codec::detect(input),
        }
    }
}

impl Codec {
    /// Identifies a container by its magic bytes.
    pub fn sniff(header: &[u8]) -> Option<Codec> {
        const MAGIC: &[(&[u8], Codec)] = &[
            (&[0x1f, 0x8b], Codec::Gzip),
            (&[0xfd, b'7', b'z', b'X', b'Z', 0x00], Codec::Xz),
            (b"BZh", Codec::Bzip2),
            (&[0x28, 0xb5, 0x2f, 0xfd], Codec::Zstd),
        ];
        MAGIC
            .iter()
            .find(|(magic, _)| header.starts_with(magic))
            .map(|(_, codec)| *codec)
    }

    /// Determines the codec of the file at `path`.
    ///
    /// Files without a known container magic are accepted as raw only if they carry an MBR boot
    /// signature (which protective-MBR GPT images have too).
    pub fn detect(path: &Path) -> Result<Codec> {
        let unknown = || {
            Error::parse(
                "image format (not compressed, no partition table)",
                path.display().to_string(),
            )
        };
        let mut file = File::open(path).io_context(|| format!("opening {}", path.display()))?;
        // short files are simply unrecognised
        let mut fill = |buf: &mut [u8]| match read_exactish(&mut file, buf) {
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            other => other.io_context(|| format!("reading {}", path.display())),
        };

        let mut header = [0u8; SNIFF_LEN];
        let (magic, rest) = header.split_at_mut(MAGIC_LEN);
        if !fill(magic)? {
            return Err(unknown());
        }
        if let Some(codec) = Codec::sniff(magic) {
            debug!("{}: {codec} container", path.display());
            return Ok(codec);
        }
        if fill(rest)? && header[510..] == [0x55, 0xaa] {
            debug!("{}: raw disk image", path.display());
            return Ok(Codec::Raw);
        }
        Err(unknown())
    }

    fn decoder<'a>(self, reader: impl Read + 'a) -> io::Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Codec::Raw => Box::new(reader),
            // GzDecoder stops after the first member: firmware images often carry a trailer
            // (metadata, signatures) after the gzip stream
            Codec::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
            Codec::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(reader)),
            Codec::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(reader)),
            Codec::Zstd => Box::new(zstd::Decoder::new(reader)?),
        })
    }

    fn encode<W: Write>(self, reader: &mut impl Read, writer: W) -> io::Result<W> {
        match self {
            Codec::Raw => {
                let mut writer = writer;
                io::copy(reader, &mut writer)?;
                Ok(writer)
            }
            Codec::Gzip => {
                let mut encoder = flate2::write::GzEncoder::new(writer, flate2::Compression::best());
                io::copy(reader, &mut encoder)?;
                encoder.finish()
            }
            Codec::Xz => {
                let mut encoder = xz2::write::XzEncoder::new(writer, 6);
                io::copy(reader, &mut encoder)?;
                encoder.finish()
            }
            Codec::Bzip2 => {
                let mut encoder = bzip2::write::BzEncoder::new(writer, bzip2::Compression::best());
                io::copy(reader, &mut encoder)?;
                encoder.finish()
            }
            Codec::Zstd => {
                let mut encoder = zstd::Encoder::new(writer, zstd::DEFAULT_COMPRESSION_LEVEL)?;
                io::copy(reader, &mut encoder)?;
                encoder.finish()
            }
        }
    }

    /// Decodes `input` into `output`, returning the number of plain bytes written.
    pub fn decompress(self, input: &Path, output: &mut File, progress: bool) -> Result<u64> {
        let file = File::open(input).io_context(|| format!("opening {}", input.display()))?;
        let len = file.metadata().ok().map(|m| m.len());
        let bar = progress_bar(len, "decompressing", progress);

        let mut decoder = self
            .decoder(bar.wrap_read(file))
            .io_context(|| format!("reading {} as {self}", input.display()))?;
        let written = io::copy(&mut decoder, output)
            .io_context(|| format!("decompressing {} as {self}", input.display()))?;
        output
            .sync_all()
            .io_context(|| "syncing working image".into())?;
        bar.finish_and_clear();

        debug!("decompressed {} ({self}): {written} bytes", input.display());
        Ok(written)
    }

    /// Encodes the plain file `input` into `output`.
    pub fn compress(self, input: &Path, output: &mut File, progress: bool) -> Result<()> {
        let file = File::open(input).io_context(|| format!("opening {}", input.display()))?;
        let len = file.metadata().ok().map(|m| m.len());
        let bar = progress_bar(len, "compressing", progress);

        let writer = self
            .encode(&mut bar.wrap_read(file), &mut *output)
            .io_context(|| format!("compressing {} as {self}", input.display()))?;
        writer
            .sync_all()
            .io_context(|| "syncing output".into())?;
        bar.finish_and_clear();

        debug!("compressed {} ({self})", input.display());
        Ok(())
    }
}
