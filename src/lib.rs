//! Library for reading, writing and verifying Mozilla ARchive (MAR) files,
//! the container format Firefox uses to ship signed application updates.
//!
//! See <https://wiki.mozilla.org/Software_Update:MAR> for the format itself.

use thiserror::Error;

pub mod compression;
pub mod extract;
pub mod format;
pub mod hash;
pub mod keys;
pub mod reader;
pub mod signing;
pub mod writer;

pub use compression::Compression;
pub use format::{IndexEntry, ProductInformation};
pub use reader::MarReader;
pub use signing::{Algorithm, VerifyOutcome, VerifyPolicy};
pub use writer::{MarWriter, SigningKey};

/// Everything that can go wrong while reading, writing or verifying a MAR.
#[derive(Error, Debug)]
pub enum MarError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("bad magic bytes, not a MAR file")]
    BadMagic,

    #[error("file ends before a complete record")]
    TruncatedFile,

    #[error("malformed index: {0}")]
    MalformedIndex(String),

    #[error("string field exceeds its {0} byte bound")]
    MalformedString(usize),

    #[error("member name exceeds {} bytes", format::MAX_NAME_SIZE)]
    NameTooLong,

    #[error("member name {0:?} is not a safe relative path")]
    UnsafeName(String),

    #[error("member {name:?} spans bytes {start}..{end}, outside the data region")]
    OffsetOutOfRange { name: String, start: u64, end: u64 },

    #[error("index entries are not sorted by ascending offset")]
    IndexNotSorted,

    #[error("duplicate member name {0:?}")]
    DuplicateName(String),

    #[error("unsupported compression codec: {0}")]
    UnsupportedCompression(&'static str),

    #[error("corrupt compressed stream in member {0:?}")]
    CorruptCompressedStream(String),

    #[error("no key available for signature {0}")]
    UnknownSignatureAlgorithm(usize),

    #[error("signature {0} does not match the archive contents")]
    FailedSignature(usize),

    #[error("member {0:?} is larger than the format allows")]
    MemberTooLarge(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error(transparent)]
    Crypto(#[from] openssl::error::ErrorStack),
}

/// Maps an I/O error hit in the middle of a record to `TruncatedFile`.
pub(crate) fn short_read(err: std::io::Error) -> MarError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        MarError::TruncatedFile
    } else {
        MarError::Io(err)
    }
}
