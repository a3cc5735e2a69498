//! Emitting archives to a seekable sink.
//!
//! Writing is two-phase. Phase one streams the header, placeholder
//! signature block, additional block and compressed payloads in order,
//! recording offsets as they happen. Phase two appends the index,
//! back-patches the header and signature block, and replays the finished
//! file through the masking hasher to fill in the signature slots. The
//! sink must support reads when signing, which is why creation takes a
//! read/write file.

use std::collections::HashSet;
use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, WriteBytesExt};
use log::debug;
use openssl::pkey::{PKey, Private};

use crate::compression::{Compression, Compressor};
use crate::format::{
    AdditionalBlock, IndexEntry, MarHeader, ProductInformation, SignatureBlock, SignatureEntry,
    HEADER_SIZE, MAX_NAME_SIZE, MAX_SIGNATURES,
};
use crate::hash::copy_masked;
use crate::signing::{self, Algorithm};
use crate::MarError;

/// A private key plus the algorithm its size dictates.
pub struct SigningKey {
    key: PKey<Private>,
    algorithm: Algorithm,
}

impl SigningKey {
    /// Wraps an RSA private key. The signing algorithm follows from the
    /// modulus size; 2048-bit keys sign with SHA-1, 4096-bit with SHA-384.
    pub fn new(key: PKey<Private>) -> Result<SigningKey, MarError> {
        let algorithm = Algorithm::for_key(&key)?;
        Ok(SigningKey { key, algorithm })
    }

    /// Loads a signing key from PEM or DER bytes.
    pub fn from_bytes(data: &[u8]) -> Result<SigningKey, MarError> {
        SigningKey::new(signing::load_private_key(data)?)
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }
}

/// Streams members into a new archive and finalizes it exactly once.
pub struct MarWriter<F: Read + Write + Seek> {
    file: F,
    compression: Compression,
    keys: Vec<SigningKey>,
    placeholder: Option<SignatureBlock>,
    entries: Vec<IndexEntry>,
    names: HashSet<String>,
    next_offset: u64,
}

impl<F: Read + Write + Seek> MarWriter<F> {
    /// Starts an unsigned archive with no additional block.
    pub fn new(file: F, compression: Compression) -> Result<MarWriter<F>, MarError> {
        MarWriter::with_options(file, compression, Vec::new(), None)
    }

    /// Starts an archive, optionally signed and carrying product
    /// information. The header and all block skeletons are written
    /// immediately; signature slots hold zeros until [`MarWriter::finish`].
    pub fn with_options(
        mut file: F,
        compression: Compression,
        keys: Vec<SigningKey>,
        product_info: Option<ProductInformation>,
    ) -> Result<MarWriter<F>, MarError> {
        if keys.len() > MAX_SIGNATURES as usize {
            return Err(MarError::SigningFailed(format!(
                "at most {} signing keys are supported",
                MAX_SIGNATURES
            )));
        }

        file.seek(SeekFrom::Start(0))?;
        MarHeader { index_offset: 0 }.write(&mut file)?;

        let placeholder = if keys.is_empty() {
            None
        } else {
            let block = SignatureBlock {
                total_file_size: 0,
                entries: keys
                    .iter()
                    .map(|k| SignatureEntry {
                        algorithm_id: k.algorithm.id(),
                        signature: vec![0u8; k.algorithm.signature_size()],
                    })
                    .collect(),
            };
            block.write(&mut file)?;
            Some(block)
        };

        if let Some(info) = &product_info {
            AdditionalBlock {
                entries: vec![info.to_entry()],
            }
            .write(&mut file)?;
        }

        let next_offset = file.stream_position()?;
        Ok(MarWriter {
            file,
            compression,
            keys,
            placeholder,
            entries: Vec::new(),
            names: HashSet::new(),
            next_offset,
        })
    }

    /// Appends one member, compressing the payload in flight. Members are
    /// laid out in call order.
    pub fn add<R: Read>(&mut self, name: &str, mode: u32, data: &mut R) -> Result<(), MarError> {
        check_name(name)?;
        if !self.names.insert(name.to_string()) {
            return Err(MarError::DuplicateName(name.to_string()));
        }

        self.file.seek(SeekFrom::Start(self.next_offset))?;
        let mut compressor = Compressor::new(self.compression, &mut self.file);
        io::copy(data, &mut compressor)?;
        let (_, size) = compressor.finish()?;

        let end = self.next_offset + size;
        if size > u32::MAX as u64 || end > u32::MAX as u64 {
            return Err(MarError::MemberTooLarge(name.to_string()));
        }
        debug!("added {} ({} bytes at {})", name, size, self.next_offset);

        self.entries.push(IndexEntry {
            offset: self.next_offset as u32,
            size: size as u32,
            mode,
            name: name.to_string(),
        });
        self.next_offset = end;
        Ok(())
    }

    /// Writes the index, patches the header and signature block, signs,
    /// and returns the sink. If signing fails the sink's contents are
    /// indeterminate and must be discarded.
    pub fn finish(mut self) -> Result<F, MarError> {
        let index_offset = self.next_offset;
        self.file.seek(SeekFrom::Start(index_offset))?;
        let index_size: u64 = self.entries.iter().map(|e| e.encoded_size()).sum();
        self.file.write_u32::<BigEndian>(index_size as u32)?;
        for entry in &self.entries {
            entry.write(&mut self.file)?;
        }
        let total_size = self.file.stream_position()?;

        self.file.seek(SeekFrom::Start(0))?;
        MarHeader {
            index_offset: index_offset as u32,
        }
        .write(&mut self.file)?;

        if let Some(block) = self.placeholder.take() {
            self.file.seek(SeekFrom::Start(HEADER_SIZE))?;
            self.file.write_u64::<BigEndian>(total_size)?;

            let holes = block.signature_ranges();
            let mut hashers = Vec::with_capacity(self.keys.len());
            for key in &self.keys {
                hashers.push(signing::hasher(key.algorithm)?);
            }
            self.file.seek(SeekFrom::Start(0))?;
            let sinks: Vec<&mut dyn Write> = hashers
                .iter_mut()
                .map(|h| h as &mut dyn Write)
                .collect();
            copy_masked(&mut self.file, &holes, sinks)?;

            for ((key, mut hasher), hole) in self.keys.iter().zip(hashers).zip(holes) {
                let digest = hasher.finish()?;
                let signature = signing::sign_digest(&key.key, key.algorithm, &digest)?;
                if signature.len() as u64 != hole.end - hole.start {
                    return Err(MarError::SigningFailed(
                        "signature does not fill its reserved slot".into(),
                    ));
                }
                self.file.seek(SeekFrom::Start(hole.start))?;
                self.file.write_all(&signature)?;
            }
            debug!("signed archive, {} signature(s)", self.keys.len());
        }

        self.file.flush()?;
        debug!(
            "finished archive: {} members, index at {}, {} bytes",
            self.entries.len(),
            index_offset,
            total_size
        );
        Ok(self.file)
    }
}

fn check_name(name: &str) -> Result<(), MarError> {
    if name.len() + 1 > MAX_NAME_SIZE {
        return Err(MarError::NameTooLong);
    }
    let unsafe_name = name.is_empty()
        || name.starts_with('/')
        || name.contains('\0')
        || name.split('/').any(|part| part.is_empty() || part == "..");
    if unsafe_name {
        return Err(MarError::UnsafeName(name.to_string()));
    }
    Ok(())
}
