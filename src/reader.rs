//! Parsing, extraction and verification of existing archives.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;
use openssl::pkey::{PKey, Public};

use crate::compression::{Compression, Decompressor};
use crate::format::{
    AdditionalBlock, IndexEntry, MarHeader, ProductInformation, SignatureBlock, HEADER_SIZE,
    INFO_TYPE_PRODUCT,
};
use crate::hash::copy_masked;
use crate::signing::{self, Algorithm, VerifyOutcome, VerifyPolicy};
use crate::{short_read, MarError};

/// Reads MAR data from any seekable source.
///
/// The header and index are parsed up front; the signature and additional
/// blocks are probed lazily the first time something asks for them.
pub struct MarReader<R: Read + Seek> {
    src: R,
    file_size: u64,
    index_offset: u64,
    entries: Vec<IndexEntry>,
    blocks: Option<(Option<SignatureBlock>, Option<AdditionalBlock>)>,
}

impl MarReader<BufReader<File>> {
    /// Opens a MAR file on disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MarError> {
        MarReader::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> MarReader<R> {
    /// Wraps a seekable source, parsing the header and index eagerly.
    pub fn new(mut src: R) -> Result<MarReader<R>, MarError> {
        let file_size = src.seek(SeekFrom::End(0))?;
        src.seek(SeekFrom::Start(0))?;

        let header = MarHeader::parse(&mut src)?;
        let index_offset = header.index_offset as u64;
        if index_offset < HEADER_SIZE {
            return Err(MarError::MalformedIndex(format!(
                "index offset {} points into the header",
                index_offset
            )));
        }
        if index_offset + 4 > file_size {
            return Err(MarError::TruncatedFile);
        }

        src.seek(SeekFrom::Start(index_offset))?;
        let mut index_size_buf = [0u8; 4];
        src.read_exact(&mut index_size_buf).map_err(short_read)?;
        let index_size = u32::from_be_bytes(index_size_buf) as u64;
        if index_offset + 4 + index_size > file_size {
            return Err(MarError::TruncatedFile);
        }

        let mut region = vec![0u8; index_size as usize];
        src.read_exact(&mut region).map_err(short_read)?;

        let entries = parse_index(&region, index_offset)?;
        debug!(
            "parsed index: {} entries, index at {}, {} bytes total",
            entries.len(),
            index_offset,
            file_size
        );

        Ok(MarReader {
            src,
            file_size,
            index_offset,
            entries,
            blocks: None,
        })
    }

    /// The index entries, in the order the archive stores them.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Releases the underlying source.
    pub fn into_inner(self) -> R {
        self.src
    }

    /// Total length of the underlying file in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Where the first payload byte lives; everything between the header
    /// and this point belongs to the signature and additional blocks.
    fn data_start(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.offset as u64)
            .min()
            .unwrap_or(self.index_offset)
    }

    /// The archive's signature block, if it has one.
    pub fn signatures(&mut self) -> Result<Option<SignatureBlock>, MarError> {
        self.ensure_blocks()?;
        Ok(self.blocks.as_ref().and_then(|b| b.0.clone()))
    }

    /// The archive's additional block, if it has one.
    pub fn additional(&mut self) -> Result<Option<AdditionalBlock>, MarError> {
        self.ensure_blocks()?;
        Ok(self.blocks.as_ref().and_then(|b| b.1.clone()))
    }

    /// The decoded product-information entry, if present.
    pub fn product_info(&mut self) -> Result<Option<ProductInformation>, MarError> {
        match self.additional()? {
            Some(block) => block
                .entries
                .iter()
                .find(|e| e.info_type == INFO_TYPE_PRODUCT)
                .map(|e| ProductInformation::parse(&e.payload))
                .transpose(),
            None => Ok(None),
        }
    }

    /// Decompresses one member into `sink`, returning the decompressed
    /// byte count.
    pub fn extract_entry<W: Write>(
        &mut self,
        entry: &IndexEntry,
        sink: &mut W,
    ) -> Result<u64, MarError> {
        self.src.seek(SeekFrom::Start(entry.offset as u64))?;
        let mut stream = Decompressor::new(&mut self.src, entry.size as u64)?;
        match io::copy(&mut stream, sink) {
            Ok(n) => Ok(n),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::InvalidData
                        | io::ErrorKind::InvalidInput
                        | io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::Other
                ) =>
            {
                Err(MarError::CorruptCompressedStream(entry.name.clone()))
            }
            Err(err) => Err(MarError::Io(err)),
        }
    }

    /// Sniffs what codec the members use. Mixed archives report the
    /// strongest codec seen; an xz member settles it immediately.
    pub fn compression_type(&mut self) -> Result<Compression, MarError> {
        let mut best = Compression::None;
        for i in 0..self.entries.len() {
            let (offset, size) = (self.entries[i].offset as u64, self.entries[i].size as u64);
            let mut magic = [0u8; 6];
            let want = magic.len().min(size as usize);
            self.src.seek(SeekFrom::Start(offset))?;
            self.src.read_exact(&mut magic[..want]).map_err(short_read)?;
            match Compression::detect(&magic[..want]) {
                Compression::Xz => return Ok(Compression::Xz),
                Compression::Bz2 => best = Compression::Bz2,
                Compression::None => {}
            }
        }
        Ok(best)
    }

    /// Digests of the archive contents, one per declared signature,
    /// computed with the signature bytes masked to NUL.
    pub fn signature_digests(&mut self) -> Result<Vec<(u32, Vec<u8>)>, MarError> {
        let block = match self.signatures()? {
            Some(block) if !block.entries.is_empty() => block,
            _ => return Ok(Vec::new()),
        };
        let digests = self.digest_block(&block)?;
        Ok(block
            .entries
            .iter()
            .map(|e| e.algorithm_id)
            .zip(digests)
            .collect())
    }

    /// Verifies every declared signature against the candidate keys.
    ///
    /// All slots must verify for the archive to count as verified. A slot
    /// with an unrecognized algorithm id, or for which no candidate key of
    /// the right size was supplied, reports `UnknownSignatureAlgorithm`.
    pub fn verify(
        &mut self,
        candidate_keys: &[PKey<Public>],
        policy: VerifyPolicy,
    ) -> Result<VerifyOutcome, MarError> {
        let block = match self.signatures()? {
            Some(block) if !block.entries.is_empty() => block,
            _ => return Ok(VerifyOutcome::NoSignatures),
        };

        let mut slots = Vec::with_capacity(block.entries.len());
        for (i, entry) in block.entries.iter().enumerate() {
            let algorithm = match Algorithm::from_id(entry.algorithm_id) {
                Some(algorithm) => algorithm,
                None => return Ok(VerifyOutcome::UnknownSignatureAlgorithm(i)),
            };
            let candidates: Vec<&PKey<Public>> = candidate_keys
                .iter()
                .filter(|key| signing::key_matches(key, entry.signature.len()))
                .collect();
            if candidates.is_empty() {
                return Ok(VerifyOutcome::UnknownSignatureAlgorithm(i));
            }
            slots.push((algorithm, &entry.signature, candidates));
        }

        let digests = self.digest_block(&block)?;
        for (i, ((algorithm, signature, candidates), digest)) in
            slots.into_iter().zip(digests).enumerate()
        {
            let mut checks = candidates
                .iter()
                .map(|key| signing::verify_digest(key, algorithm, &digest, signature));
            let good = match policy {
                VerifyPolicy::AnyKey => checks.any(|ok| ok),
                VerifyPolicy::RequireAll => checks.all(|ok| ok),
            };
            if !good {
                debug!("signature {} did not verify", i);
                return Ok(VerifyOutcome::FailedSignature(i));
            }
        }
        Ok(VerifyOutcome::Verified(block.entries.len()))
    }

    /// Replays the whole file through the masking hasher, one digest per
    /// signature slot.
    fn digest_block(&mut self, block: &SignatureBlock) -> Result<Vec<Vec<u8>>, MarError> {
        let mut hashers = Vec::with_capacity(block.entries.len());
        for (i, entry) in block.entries.iter().enumerate() {
            let algorithm = Algorithm::from_id(entry.algorithm_id)
                .ok_or(MarError::UnknownSignatureAlgorithm(i))?;
            hashers.push(signing::hasher(algorithm)?);
        }

        let holes = block.signature_ranges();
        self.src.seek(SeekFrom::Start(0))?;
        let sinks: Vec<&mut dyn Write> = hashers
            .iter_mut()
            .map(|h| h as &mut dyn Write)
            .collect();
        copy_masked(&mut self.src, &holes, sinks)?;

        let mut digests = Vec::with_capacity(hashers.len());
        for mut hasher in hashers {
            digests.push(hasher.finish()?.to_vec());
        }
        Ok(digests)
    }

    fn ensure_blocks(&mut self) -> Result<(), MarError> {
        if self.blocks.is_some() {
            return Ok(());
        }
        self.blocks = Some(self.probe_blocks()?);
        Ok(())
    }

    /// Works out what sits between the header and the first payload.
    ///
    /// The format does not tag the blocks, so the region is probed: a
    /// signature-shaped prefix whose `total_file_size` matches the real
    /// file length is a signature block; a mismatch on an otherwise valid
    /// shape means the file was truncated or padded. Whatever follows is
    /// probed as an additional block.
    fn probe_blocks(
        &mut self,
    ) -> Result<(Option<SignatureBlock>, Option<AdditionalBlock>), MarError> {
        let boundary = self.data_start();
        if boundary <= HEADER_SIZE {
            // Old-style archive: payloads begin right after the header.
            return Ok((None, None));
        }

        let region_len = (boundary - HEADER_SIZE) as usize;
        let mut region = vec![0u8; region_len];
        self.src.seek(SeekFrom::Start(HEADER_SIZE))?;
        self.src.read_exact(&mut region).map_err(short_read)?;

        let mut consumed = 0usize;
        let mut signatures = None;
        let mut cursor = Cursor::new(&region[..]);
        if let Ok(block) = SignatureBlock::parse(&mut cursor) {
            if block.total_file_size != self.file_size {
                return Err(MarError::TruncatedFile);
            }
            consumed = cursor.position() as usize;
            debug!("signature block: {} entries", block.entries.len());
            signatures = Some(block);
        }

        let mut additional = None;
        let rest = &region[consumed..];
        if rest.len() >= 8 {
            let block_size = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            if block_size >= 8 && block_size <= rest.len() {
                if let Ok(block) = AdditionalBlock::parse(&mut Cursor::new(&rest[..block_size])) {
                    debug!("additional block: {} entries", block.entries.len());
                    additional = Some(block);
                }
            }
        }

        Ok((signatures, additional))
    }
}

impl SignatureBlock {
    /// Byte ranges of the signature bytes themselves, relative to the
    /// start of the file. These are the holes masked while digesting.
    pub fn signature_ranges(&self) -> Vec<std::ops::Range<u64>> {
        let mut ranges = Vec::with_capacity(self.entries.len());
        let mut pos = HEADER_SIZE + 12;
        for entry in &self.entries {
            pos += 8;
            ranges.push(pos..pos + entry.signature.len() as u64);
            pos += entry.signature.len() as u64;
        }
        ranges
    }
}

fn parse_index(region: &[u8], index_offset: u64) -> Result<Vec<IndexEntry>, MarError> {
    let mut cursor = Cursor::new(region);
    let mut entries: Vec<IndexEntry> = Vec::new();
    while (cursor.position() as usize) < region.len() {
        let entry = match IndexEntry::parse(&mut cursor) {
            Ok(entry) => entry,
            Err(MarError::TruncatedFile) => {
                return Err(MarError::MalformedIndex(
                    "entry overruns the index block".into(),
                ))
            }
            Err(err) => return Err(err),
        };
        let start = entry.offset as u64;
        let end = start + entry.size as u64;
        if start < HEADER_SIZE || end > index_offset {
            return Err(MarError::OffsetOutOfRange {
                name: entry.name,
                start,
                end,
            });
        }
        if let Some(prev) = entries.last() {
            if entry.offset <= prev.offset {
                return Err(MarError::IndexNotSorted);
            }
        }
        if entries.iter().any(|e| e.name == entry.name) {
            return Err(MarError::DuplicateName(entry.name));
        }
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod test_reader {
    use std::io::Cursor;

    use super::*;
    use crate::format::MAR_MAGIC;

    /// Builds a raw archive by hand: `payload` lands verbatim at offset 8
    /// and the index entries are appended as given.
    fn raw_archive(payload: &[u8], entries: &[(u32, u32, u32, &str)]) -> Vec<u8> {
        let mut index = Vec::new();
        for &(offset, size, mode, name) in entries {
            IndexEntry {
                offset,
                size,
                mode,
                name: name.to_string(),
            }
            .write(&mut index)
            .unwrap();
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(MAR_MAGIC);
        buf.extend_from_slice(&(8 + payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&(index.len() as u32).to_be_bytes());
        buf.extend_from_slice(&index);
        buf
    }

    #[test]
    fn lists_members_in_order() {
        let data = raw_archive(
            b"helloworld",
            &[(8, 5, 0o644, "a.txt"), (13, 5, 0o755, "b/c.txt")],
        );
        let mut reader = MarReader::new(Cursor::new(data)).unwrap();
        let names: Vec<&str> = reader.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a.txt", "b/c.txt"]);
        assert_eq!(reader.entries()[0].size, 5);
        assert_eq!(reader.entries()[1].mode, 0o755);

        let mut out = Vec::new();
        let entry = reader.entries()[1].clone();
        reader.extract_entry(&entry, &mut out).unwrap();
        assert_eq!(out, b"world");
    }

    #[test]
    fn old_style_archive_has_no_blocks() {
        let data = raw_archive(b"hello", &[(8, 5, 0o644, "a")]);
        let mut reader = MarReader::new(Cursor::new(data)).unwrap();
        assert!(reader.signatures().unwrap().is_none());
        assert!(reader.additional().unwrap().is_none());
        assert_eq!(
            reader.verify(&[], VerifyPolicy::AnyKey).unwrap(),
            VerifyOutcome::NoSignatures
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = raw_archive(b"hello", &[(8, 5, 0o644, "a")]);
        data[0] = b'X';
        assert!(matches!(
            MarReader::new(Cursor::new(data)),
            Err(MarError::BadMagic)
        ));
    }

    #[test]
    fn rejects_truncated_index() {
        let data = raw_archive(b"hello", &[(8, 5, 0o644, "a")]);
        let short = data[..data.len() - 1].to_vec();
        assert!(matches!(
            MarReader::new(Cursor::new(short)),
            Err(MarError::TruncatedFile)
        ));
    }

    #[test]
    fn rejects_unsorted_index() {
        let data = raw_archive(
            b"helloworld",
            &[(13, 5, 0o644, "b"), (8, 5, 0o644, "a")],
        );
        assert!(matches!(
            MarReader::new(Cursor::new(data)),
            Err(MarError::IndexNotSorted)
        ));
    }

    #[test]
    fn rejects_duplicate_names() {
        let data = raw_archive(
            b"helloworld",
            &[(8, 5, 0o644, "a"), (13, 5, 0o644, "a")],
        );
        assert!(matches!(
            MarReader::new(Cursor::new(data)),
            Err(MarError::DuplicateName(_))
        ));
    }

    #[test]
    fn rejects_payload_overrunning_index() {
        let data = raw_archive(b"hello", &[(8, 500, 0o644, "a")]);
        assert!(matches!(
            MarReader::new(Cursor::new(data)),
            Err(MarError::OffsetOutOfRange { .. })
        ));
    }

    #[test]
    fn index_offset_into_header_is_rejected() {
        let mut data = raw_archive(b"", &[]);
        data[4..8].copy_from_slice(&4u32.to_be_bytes());
        assert!(matches!(
            MarReader::new(Cursor::new(data)),
            Err(MarError::MalformedIndex(_))
        ));
    }

    #[test]
    fn empty_archive_lists_nothing() {
        let data = raw_archive(b"", &[]);
        let mut reader = MarReader::new(Cursor::new(data)).unwrap();
        assert!(reader.entries().is_empty());
        assert_eq!(
            reader.verify(&[], VerifyPolicy::AnyKey).unwrap(),
            VerifyOutcome::NoSignatures
        );
    }

    #[test]
    fn signature_ranges_skip_entry_headers() {
        let block = SignatureBlock {
            total_file_size: 1000,
            entries: vec![
                crate::format::SignatureEntry {
                    algorithm_id: 1,
                    signature: vec![0; 256],
                },
                crate::format::SignatureEntry {
                    algorithm_id: 2,
                    signature: vec![0; 512],
                },
            ],
        };
        let ranges = block.signature_ranges();
        assert_eq!(ranges, vec![28..284, 292..804]);
    }
}
