//! Digesting a stream as if chosen byte ranges were zeroed.
//!
//! Signatures cover the whole archive with the signature bytes themselves
//! treated as NULs. Rather than patching zeros into the file, this wrapper
//! substitutes them in flight while fanning the stream out to any number
//! of digest sinks, so the on-disk bytes are never touched.

use std::io::{self, Read, Write};
use std::ops::Range;

const ZEROS: [u8; 4096] = [0u8; 4096];

/// Broadcasts a byte stream to several sinks, replacing the bytes inside
/// each hole range with NULs of the same length.
///
/// Ranges are half-open, non-overlapping and sorted ascending. Ranges that
/// extend past the end of the stream are clipped; ranges that end before
/// the current position are skipped.
pub struct MaskedWriter<'a> {
    sinks: Vec<&'a mut dyn Write>,
    holes: &'a [Range<u64>],
    next_hole: usize,
    position: u64,
}

impl<'a> MaskedWriter<'a> {
    pub fn new(sinks: Vec<&'a mut dyn Write>, holes: &'a [Range<u64>]) -> MaskedWriter<'a> {
        MaskedWriter {
            sinks,
            holes,
            next_hole: 0,
            position: 0,
        }
    }

    fn broadcast(&mut self, buf: &[u8]) -> io::Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.write_all(buf)?;
        }
        Ok(())
    }

    fn broadcast_zeros(&mut self, mut len: u64) -> io::Result<()> {
        while len > 0 {
            let n = len.min(ZEROS.len() as u64) as usize;
            self.broadcast(&ZEROS[..n])?;
            len -= n as u64;
        }
        Ok(())
    }
}

impl Write for MaskedWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut consumed = 0;
        while consumed < buf.len() {
            // Holes already behind the cursor no longer apply.
            while self.next_hole < self.holes.len()
                && self.holes[self.next_hole].end <= self.position
            {
                self.next_hole += 1;
            }

            let remaining = (buf.len() - consumed) as u64;
            let span = match self.holes.get(self.next_hole) {
                Some(hole) if hole.start <= self.position => {
                    let len = remaining.min(hole.end - self.position);
                    self.broadcast_zeros(len)?;
                    len
                }
                Some(hole) => {
                    let len = remaining.min(hole.start - self.position);
                    self.broadcast(&buf[consumed..consumed + len as usize])?;
                    len
                }
                None => {
                    self.broadcast(&buf[consumed..])?;
                    remaining
                }
            };
            consumed += span as usize;
            self.position += span;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.flush()?;
        }
        Ok(())
    }
}

/// Pumps `src` through a [`MaskedWriter`] until EOF. Returns the number of
/// bytes read from the source.
pub fn copy_masked<'a, R: Read>(
    src: &mut R,
    holes: &'a [Range<u64>],
    sinks: Vec<&'a mut dyn Write>,
) -> io::Result<u64> {
    let mut masked = MaskedWriter::new(sinks, holes);
    io::copy(src, &mut masked)
}
