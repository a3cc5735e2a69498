//! Streaming compression of member payloads.
//!
//! The container does not record the codec anywhere, so decompression
//! sniffs the first payload bytes: `BZh` means bzip2, the 6-byte xz
//! stream header means xz, anything else passes through untouched.

use std::io::{self, Read, Seek, SeekFrom, Take, Write};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use crate::MarError;

const BZ2_MAGIC: [u8; 3] = *b"BZh";
const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];

const BZ2_LEVEL: u32 = 9;
const XZ_LEVEL: u32 = 9;

/// The codec applied to every member of an archive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Bz2,
    Xz,
}

impl Compression {
    /// Sniffs the codec from the first payload bytes.
    pub fn detect(magic: &[u8]) -> Compression {
        if magic.len() >= 6 && magic[..6] == XZ_MAGIC {
            Compression::Xz
        } else if magic.len() >= 3 && magic[..3] == BZ2_MAGIC {
            Compression::Bz2
        } else {
            Compression::None
        }
    }
}

/// Counts the bytes that reach the underlying sink.
pub struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        CountingWriter { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum Encoder<W: Write> {
    Plain(CountingWriter<W>),
    Bz2(BzEncoder<CountingWriter<W>>),
    Xz(XzEncoder<CountingWriter<W>>),
}

/// Write stream that compresses into an underlying sink. Closing it with
/// [`Compressor::finish`] flushes the codec and reports how many compressed
/// bytes were emitted.
pub struct Compressor<W: Write> {
    encoder: Encoder<W>,
}

impl<W: Write> Compressor<W> {
    pub fn new(codec: Compression, sink: W) -> Compressor<W> {
        let counter = CountingWriter::new(sink);
        let encoder = match codec {
            Compression::None => Encoder::Plain(counter),
            Compression::Bz2 => Encoder::Bz2(BzEncoder::new(
                counter,
                bzip2::Compression::new(BZ2_LEVEL),
            )),
            Compression::Xz => Encoder::Xz(XzEncoder::new(counter, XZ_LEVEL)),
        };
        Compressor { encoder }
    }

    /// Flushes the codec and returns the sink and the compressed byte count.
    pub fn finish(self) -> io::Result<(W, u64)> {
        let counter = match self.encoder {
            Encoder::Plain(counter) => counter,
            Encoder::Bz2(encoder) => encoder.finish()?,
            Encoder::Xz(encoder) => encoder.finish()?,
        };
        let count = counter.count();
        Ok((counter.into_inner(), count))
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.encoder {
            Encoder::Plain(ref mut w) => w.write(buf),
            Encoder::Bz2(ref mut w) => w.write(buf),
            Encoder::Xz(ref mut w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.encoder {
            Encoder::Plain(ref mut w) => w.flush(),
            Encoder::Bz2(ref mut w) => w.flush(),
            Encoder::Xz(ref mut w) => w.flush(),
        }
    }
}

enum Decoder<'a, R: Read + Seek> {
    Plain(Take<&'a mut R>),
    Bz2(BzDecoder<Take<&'a mut R>>),
    Xz(XzDecoder<Take<&'a mut R>>),
}

/// Read stream that decompresses a member payload in place, detecting the
/// codec from the payload's first bytes.
pub struct Decompressor<'a, R: Read + Seek> {
    decoder: Decoder<'a, R>,
}

impl<'a, R: Read + Seek> Decompressor<'a, R> {
    /// Wraps the next `length` bytes of `inner`. The source is peeked and
    /// rewound, so it must be positioned at the start of the payload.
    pub fn new(inner: &'a mut R, length: u64) -> Result<Decompressor<'a, R>, MarError> {
        let position = inner.stream_position()?;

        let mut magic = [0u8; 6];
        if length >= 6 {
            inner.read_exact(&mut magic)?;
        } else if length >= 3 {
            inner.read_exact(&mut magic[..3])?;
        }
        inner.seek(SeekFrom::Start(position))?;

        let taken = inner.take(length);
        let decoder = match Compression::detect(&magic) {
            Compression::None => Decoder::Plain(taken),
            Compression::Bz2 => Decoder::Bz2(BzDecoder::new(taken)),
            Compression::Xz => Decoder::Xz(XzDecoder::new(taken)),
        };
        Ok(Decompressor { decoder })
    }
}

impl<R: Read + Seek> Read for Decompressor<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.decoder {
            Decoder::Plain(ref mut r) => r.read(buf),
            Decoder::Bz2(ref mut r) => r.read(buf),
            Decoder::Xz(ref mut r) => r.read(buf),
        }
    }
}

#[cfg(test)]
mod test_compression {
    use std::io::Cursor;

    use super::*;

    fn compress(codec: Compression, data: &[u8]) -> (Vec<u8>, u64) {
        let mut compressor = Compressor::new(codec, Vec::new());
        compressor.write_all(data).unwrap();
        compressor.finish().unwrap()
    }

    fn decompress(data: Vec<u8>) -> Vec<u8> {
        let length = data.len() as u64;
        let mut cursor = Cursor::new(data);
        let mut decompressor = Decompressor::new(&mut cursor, length).unwrap();
        let mut out = Vec::new();
        decompressor.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn passthrough_is_byte_exact() {
        let data = b"not compressed at all".to_vec();
        let (packed, count) = compress(Compression::None, &data);
        assert_eq!(packed, data);
        assert_eq!(count, data.len() as u64);
        assert_eq!(decompress(packed), data);
    }

    #[test]
    fn bz2_roundtrip() {
        let data: Vec<u8> = (0u32..4096).map(|i| (i % 251) as u8).collect();
        let (packed, count) = compress(Compression::Bz2, &data);
        assert_eq!(count, packed.len() as u64);
        assert_eq!(Compression::detect(&packed), Compression::Bz2);
        assert_eq!(decompress(packed), data);
    }

    #[test]
    fn xz_roundtrip() {
        let data: Vec<u8> = (0u32..4096).map(|i| (i % 13) as u8).collect();
        let (packed, count) = compress(Compression::Xz, &data);
        assert_eq!(count, packed.len() as u64);
        assert_eq!(Compression::detect(&packed), Compression::Xz);
        assert_eq!(decompress(packed), data);
    }

    #[test]
    fn detect_needs_enough_bytes() {
        assert_eq!(Compression::detect(b"BZ"), Compression::None);
        assert_eq!(Compression::detect(b"BZh91AY"), Compression::Bz2);
        assert_eq!(Compression::detect(&XZ_MAGIC), Compression::Xz);
    }

    #[test]
    fn short_payload_passes_through() {
        let mut cursor = Cursor::new(b"ab".to_vec());
        let mut decompressor = Decompressor::new(&mut cursor, 2).unwrap();
        let mut out = Vec::new();
        decompressor.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ab");
    }

    #[test]
    fn take_stops_at_member_boundary() {
        // Two members back to back; the reader must not run into the second.
        let mut data = b"hello".to_vec();
        data.extend_from_slice(b"world");
        let mut cursor = Cursor::new(data);
        let mut decompressor = Decompressor::new(&mut cursor, 5).unwrap();
        let mut out = Vec::new();
        decompressor.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
    }
}
