//! Wire records of the MAR container.
//!
//! Every multi-byte integer is big-endian. Records know their encoded size
//! so the writer can lay out offsets without serializing twice.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::{short_read, MarError};

pub const MAR_MAGIC: &[u8; 4] = b"MAR1";

/// Size of the fixed header: magic plus the index offset.
pub const HEADER_SIZE: u64 = 8;

/// Member names are NUL-terminated and bounded, terminator included.
pub const MAX_NAME_SIZE: usize = 256;

/// Product information strings are NUL-terminated ASCII, bounded likewise.
pub const MAX_INFO_SIZE: usize = 64;

/// Signature blocks with more entries than this are not recognized.
pub const MAX_SIGNATURES: u32 = 8;

/// Upper bound on a single signature, larger than any supported key.
pub const MAX_SIGNATURE_SIZE: u32 = 4096;

/// The fixed 8-byte header at the start of every archive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarHeader {
    pub index_offset: u32,
}

impl MarHeader {
    pub fn parse<R: Read>(r: &mut R) -> Result<MarHeader, MarError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(short_read)?;
        if &magic != MAR_MAGIC {
            return Err(MarError::BadMagic);
        }
        let index_offset = r.read_u32::<BigEndian>().map_err(short_read)?;
        Ok(MarHeader { index_offset })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), MarError> {
        w.write_all(MAR_MAGIC)?;
        w.write_u32::<BigEndian>(self.index_offset)?;
        Ok(())
    }
}

/// One signature slot: the declared algorithm and the raw signature bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureEntry {
    pub algorithm_id: u32,
    pub signature: Vec<u8>,
}

impl SignatureEntry {
    pub fn encoded_size(&self) -> u64 {
        8 + self.signature.len() as u64
    }
}

/// The optional signature block that directly follows the header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureBlock {
    pub total_file_size: u64,
    pub entries: Vec<SignatureEntry>,
}

impl SignatureBlock {
    pub fn parse<R: Read>(r: &mut R) -> Result<SignatureBlock, MarError> {
        let total_file_size = r.read_u64::<BigEndian>().map_err(short_read)?;
        let count = r.read_u32::<BigEndian>().map_err(short_read)?;
        if count > MAX_SIGNATURES {
            return Err(MarError::MalformedIndex(format!(
                "signature block declares {} entries",
                count
            )));
        }
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let algorithm_id = r.read_u32::<BigEndian>().map_err(short_read)?;
            let size = r.read_u32::<BigEndian>().map_err(short_read)?;
            if size > MAX_SIGNATURE_SIZE {
                return Err(MarError::MalformedIndex(format!(
                    "signature of {} bytes exceeds the supported bound",
                    size
                )));
            }
            let mut signature = vec![0u8; size as usize];
            r.read_exact(&mut signature).map_err(short_read)?;
            entries.push(SignatureEntry {
                algorithm_id,
                signature,
            });
        }
        Ok(SignatureBlock {
            total_file_size,
            entries,
        })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), MarError> {
        w.write_u64::<BigEndian>(self.total_file_size)?;
        w.write_u32::<BigEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            w.write_u32::<BigEndian>(entry.algorithm_id)?;
            w.write_u32::<BigEndian>(entry.signature.len() as u32)?;
            w.write_all(&entry.signature)?;
        }
        Ok(())
    }

    pub fn encoded_size(&self) -> u64 {
        12 + self.entries.iter().map(|e| e.encoded_size()).sum::<u64>()
    }
}

/// Known `info_type` values for additional-block entries.
pub const INFO_TYPE_PRODUCT: u32 = 1;

/// One typed entry of the additional block. The payload of the only known
/// type, [`INFO_TYPE_PRODUCT`], decodes into [`ProductInformation`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdditionalEntry {
    pub info_type: u32,
    pub payload: Vec<u8>,
}

impl AdditionalEntry {
    pub fn encoded_size(&self) -> u64 {
        8 + self.payload.len() as u64
    }
}

/// The optional metadata block between the signatures and the payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdditionalBlock {
    pub entries: Vec<AdditionalEntry>,
}

impl AdditionalBlock {
    pub fn parse<R: Read>(r: &mut R) -> Result<AdditionalBlock, MarError> {
        let block_size = r.read_u32::<BigEndian>().map_err(short_read)?;
        let count = r.read_u32::<BigEndian>().map_err(short_read)?;
        if block_size < 8 {
            return Err(MarError::MalformedIndex(
                "additional block smaller than its own header".into(),
            ));
        }
        let mut remaining = block_size as u64 - 8;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if remaining < 8 {
                return Err(MarError::MalformedIndex(
                    "additional entry overruns its block".into(),
                ));
            }
            let entry_size = r.read_u32::<BigEndian>().map_err(short_read)?;
            let info_type = r.read_u32::<BigEndian>().map_err(short_read)?;
            if entry_size < 8 || entry_size as u64 > remaining {
                return Err(MarError::MalformedIndex(
                    "additional entry overruns its block".into(),
                ));
            }
            let mut payload = vec![0u8; entry_size as usize - 8];
            r.read_exact(&mut payload).map_err(short_read)?;
            remaining -= entry_size as u64;
            entries.push(AdditionalEntry { info_type, payload });
        }
        Ok(AdditionalBlock { entries })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), MarError> {
        w.write_u32::<BigEndian>(self.encoded_size() as u32)?;
        w.write_u32::<BigEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            w.write_u32::<BigEndian>(entry.encoded_size() as u32)?;
            w.write_u32::<BigEndian>(entry.info_type)?;
            w.write_all(&entry.payload)?;
        }
        Ok(())
    }

    /// Total block length, the size and count fields included.
    pub fn encoded_size(&self) -> u64 {
        8 + self.entries.iter().map(|e| e.encoded_size()).sum::<u64>()
    }
}

/// Decoded payload of a product-information additional entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProductInformation {
    pub channel: String,
    pub version: String,
}

impl ProductInformation {
    pub fn new(channel: &str, version: &str) -> Result<ProductInformation, MarError> {
        for field in [channel, version] {
            if !field.is_ascii() || field.contains('\0') || field.len() + 1 > MAX_INFO_SIZE {
                return Err(MarError::MalformedString(MAX_INFO_SIZE));
            }
        }
        Ok(ProductInformation {
            channel: channel.to_string(),
            version: version.to_string(),
        })
    }

    pub fn parse(payload: &[u8]) -> Result<ProductInformation, MarError> {
        let mut r = payload;
        let channel = read_cstring(&mut r, MAX_INFO_SIZE)?;
        let version = read_cstring(&mut r, MAX_INFO_SIZE)?;
        if !channel.is_ascii() || !version.is_ascii() {
            return Err(MarError::MalformedString(MAX_INFO_SIZE));
        }
        Ok(ProductInformation { channel, version })
    }

    pub fn to_entry(&self) -> AdditionalEntry {
        let mut payload = Vec::with_capacity(self.channel.len() + self.version.len() + 2);
        payload.extend_from_slice(self.channel.as_bytes());
        payload.push(0);
        payload.extend_from_slice(self.version.as_bytes());
        payload.push(0);
        AdditionalEntry {
            info_type: INFO_TYPE_PRODUCT,
            payload,
        }
    }
}

/// One member of the trailing index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// Absolute offset of the (possibly compressed) payload.
    pub offset: u32,
    /// Payload length in bytes as stored, before decompression.
    pub size: u32,
    /// POSIX mode bits; only the low 9 are honored on extract.
    pub mode: u32,
    /// `/`-separated member path, no leading slash.
    pub name: String,
}

impl IndexEntry {
    pub fn parse<R: Read>(r: &mut R) -> Result<IndexEntry, MarError> {
        let offset = r.read_u32::<BigEndian>().map_err(short_read)?;
        let size = r.read_u32::<BigEndian>().map_err(short_read)?;
        let mode = r.read_u32::<BigEndian>().map_err(short_read)?;
        let name = match read_cstring(r, MAX_NAME_SIZE) {
            Ok(name) => name,
            Err(MarError::MalformedString(_)) => return Err(MarError::NameTooLong),
            Err(err) => return Err(err),
        };
        Ok(IndexEntry {
            offset,
            size,
            mode,
            name,
        })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), MarError> {
        w.write_u32::<BigEndian>(self.offset)?;
        w.write_u32::<BigEndian>(self.size)?;
        w.write_u32::<BigEndian>(self.mode)?;
        w.write_all(self.name.as_bytes())?;
        w.write_all(&[0])?;
        Ok(())
    }

    pub fn encoded_size(&self) -> u64 {
        12 + self.name.len() as u64 + 1
    }
}

/// Reads a NUL-terminated UTF-8 string of at most `max` bytes, NUL included.
pub fn read_cstring<R: Read>(r: &mut R, max: usize) -> Result<String, MarError> {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        r.read_exact(&mut byte).map_err(short_read)?;
        if byte[0] == 0 {
            break;
        }
        raw.push(byte[0]);
        if raw.len() + 1 > max {
            return Err(MarError::MalformedString(max));
        }
    }
    String::from_utf8(raw).map_err(|_| MarError::MalformedString(max))
}

#[cfg(test)]
mod test_format {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = MarHeader { index_offset: 277 };
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf, b"MAR1\x00\x00\x01\x15");

        let parsed = MarHeader::parse(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut data = Cursor::new(b"MAR2\x00\x00\x00\x08".to_vec());
        assert!(matches!(
            MarHeader::parse(&mut data),
            Err(MarError::BadMagic)
        ));
    }

    #[test]
    fn header_short_file() {
        let mut data = Cursor::new(b"MAR1\x00".to_vec());
        assert!(matches!(
            MarHeader::parse(&mut data),
            Err(MarError::TruncatedFile)
        ));
    }

    #[test]
    fn signature_block_roundtrip() {
        let block = SignatureBlock {
            total_file_size: 0x1_0000_0001,
            entries: vec![
                SignatureEntry {
                    algorithm_id: 1,
                    signature: vec![0xaa; 256],
                },
                SignatureEntry {
                    algorithm_id: 2,
                    signature: vec![0xbb; 512],
                },
            ],
        };
        let mut buf = Vec::new();
        block.write(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, block.encoded_size());

        let parsed = SignatureBlock::parse(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parsed, block);
    }

    #[test]
    fn signature_block_rejects_oversized_entry() {
        let mut buf = Vec::new();
        SignatureBlock {
            total_file_size: 0,
            entries: vec![SignatureEntry {
                algorithm_id: 1,
                signature: vec![0; 8192],
            }],
        }
        .write(&mut buf)
        .unwrap();
        assert!(matches!(
            SignatureBlock::parse(&mut Cursor::new(buf)),
            Err(MarError::MalformedIndex(_))
        ));
    }

    #[test]
    fn additional_block_roundtrip() {
        let info = ProductInformation::new("release", "99.0").unwrap();
        let block = AdditionalBlock {
            entries: vec![info.to_entry()],
        };
        let mut buf = Vec::new();
        block.write(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, block.encoded_size());
        // channel and version strings plus NULs plus two 8-byte headers
        assert_eq!(block.encoded_size(), 8 + 8 + 8 + 5);

        let parsed = AdditionalBlock::parse(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parsed, block);
        let decoded = ProductInformation::parse(&parsed.entries[0].payload).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn additional_entry_must_fit_block() {
        // block_size of 12 but a 16-byte entry inside
        let mut buf = Vec::new();
        buf.extend_from_slice(&12u32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&16u32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            AdditionalBlock::parse(&mut Cursor::new(buf)),
            Err(MarError::MalformedIndex(_))
        ));
    }

    #[test]
    fn product_information_bounds() {
        let long = "x".repeat(MAX_INFO_SIZE);
        assert!(matches!(
            ProductInformation::new(&long, "1.0"),
            Err(MarError::MalformedString(_))
        ));
        assert!(ProductInformation::new(&long[..MAX_INFO_SIZE - 1], "1.0").is_ok());
    }

    #[test]
    fn index_entry_roundtrip() {
        let entry = IndexEntry {
            offset: 8,
            size: 5,
            mode: 0o644,
            name: "dir/b.bin".to_string(),
        };
        let mut buf = Vec::new();
        entry.write(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, entry.encoded_size());

        let parsed = IndexEntry::parse(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn index_entry_name_bound() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0u8; 12]);
        buf.extend_from_slice(&[b'a'; MAX_NAME_SIZE]);
        buf.push(0);
        assert!(matches!(
            IndexEntry::parse(&mut Cursor::new(buf)),
            Err(MarError::NameTooLong)
        ));
    }

    #[test]
    fn cstring_missing_terminator() {
        let mut data = Cursor::new(b"abc".to_vec());
        assert!(matches!(
            read_cstring(&mut data, 16),
            Err(MarError::TruncatedFile)
        ));
    }
}
