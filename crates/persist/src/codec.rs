//! Compression backends for the clean-capture archive.

use std::io::{Read, Write};

use repovault_common::CompressionFormat;

/// Default zstd level, matching the ratio/speed trade-off used for source trees.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Compression failures, split so callers can tell a missing backend apart
/// from one that choked on this input.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{backend} compression is unavailable: {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },
    #[error("{backend} stream failed: {source}")]
    Failed {
        backend: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// A compress/decompress capability.
pub trait Compressor {
    /// Format recorded in metadata when this compressor succeeds.
    fn format(&self) -> CompressionFormat;

    /// Copy `input` into `output` compressed. Returns bytes written.
    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64, CodecError>;

    /// Wrap `input` in a decompressing reader.
    fn decompress<'a>(&self, input: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>, CodecError>;
}

/// The configured compression backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Zstd { level: i32 },
    None,
}

impl Default for Codec {
    fn default() -> Self {
        Codec::Zstd {
            level: DEFAULT_ZSTD_LEVEL,
        }
    }
}

impl Codec {
    /// Backend able to read archives stored as `format`.
    pub fn for_format(format: CompressionFormat) -> Self {
        match format {
            CompressionFormat::Zstd => Codec::default(),
            CompressionFormat::None => Codec::None,
        }
    }
}

impl Compressor for Codec {
    fn format(&self) -> CompressionFormat {
        match self {
            Codec::Zstd { .. } => CompressionFormat::Zstd,
            Codec::None => CompressionFormat::None,
        }
    }

    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64, CodecError> {
        match *self {
            Codec::Zstd { level } => zstd_compress(input, output, level),
            Codec::None => std::io::copy(input, output).map_err(|source| CodecError::Failed {
                backend: "none",
                source,
            }),
        }
    }

    fn decompress<'a>(&self, input: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>, CodecError> {
        match self {
            Codec::Zstd { .. } => zstd_decoder(input),
            Codec::None => Ok(input),
        }
    }
}

#[cfg(feature = "zstd")]
fn zstd_compress(
    input: &mut dyn Read,
    output: &mut dyn Write,
    level: i32,
) -> Result<u64, CodecError> {
    let failed = |source| CodecError::Failed {
        backend: "zstd",
        source,
    };
    let mut counter = CountingWriter::new(output);
    let mut encoder = zstd::Encoder::new(&mut counter, level).map_err(failed)?;
    std::io::copy(input, &mut encoder).map_err(failed)?;
    encoder.finish().map_err(failed)?;
    counter.flush().map_err(failed)?;
    Ok(counter.written)
}

#[cfg(not(feature = "zstd"))]
fn zstd_compress(
    _input: &mut dyn Read,
    _output: &mut dyn Write,
    _level: i32,
) -> Result<u64, CodecError> {
    Err(zstd_unavailable())
}

#[cfg(feature = "zstd")]
fn zstd_decoder<'a>(input: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>, CodecError> {
    let decoder = zstd::Decoder::new(input).map_err(|source| CodecError::Failed {
        backend: "zstd",
        source,
    })?;
    Ok(Box::new(decoder))
}

#[cfg(not(feature = "zstd"))]
fn zstd_decoder<'a>(_input: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>, CodecError> {
    Err(zstd_unavailable())
}

#[cfg(not(feature = "zstd"))]
fn zstd_unavailable() -> CodecError {
    CodecError::Unavailable {
        backend: "zstd",
        reason: "built without the `zstd` feature".into(),
    }
}

#[cfg(feature = "zstd")]
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

#[cfg(feature = "zstd")]
impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }
}

#[cfg(feature = "zstd")]
impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Vec<u8> {
        b"fn main() { println!(\"hello\"); }\n".repeat(200)
    }

    #[test]
    fn none_codec_is_passthrough() {
        let data = payload();
        let mut out = Vec::new();
        let n = Codec::None.compress(&mut data.as_slice(), &mut out).unwrap();
        assert_eq!(n as usize, data.len());
        assert_eq!(out, data);

        let mut back = Vec::new();
        Codec::None
            .decompress(Box::new(out.as_slice()))
            .unwrap()
            .read_to_end(&mut back)
            .unwrap();
        assert_eq!(back, data);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn zstd_shrinks_repetitive_source() {
        let data = payload();
        let mut out = Vec::new();
        let codec = Codec::default();
        let n = codec.compress(&mut data.as_slice(), &mut out).unwrap();
        assert_eq!(n as usize, out.len());
        assert!(out.len() < data.len() / 4);

        let mut back = Vec::new();
        codec
            .decompress(Box::new(out.as_slice()))
            .unwrap()
            .read_to_end(&mut back)
            .unwrap();
        assert_eq!(back, data);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn zstd_rejects_garbage_input() {
        let mut back = Vec::new();
        let result = Codec::default()
            .decompress(Box::new(&b"definitely not zstd"[..]))
            .and_then(|mut r| {
                r.read_to_end(&mut back).map_err(|source| CodecError::Failed {
                    backend: "zstd",
                    source,
                })
            });
        assert!(result.is_err());
    }

    #[test]
    fn format_and_lookup_agree() {
        assert_eq!(Codec::for_format(CompressionFormat::Zstd).format(), CompressionFormat::Zstd);
        assert_eq!(Codec::for_format(CompressionFormat::None), Codec::None);
    }
}
