//! RSA-PKCS#1 v1.5 signature support.
//!
//! Signatures are made over a digest of the archive computed elsewhere
//! (see [`crate::hash`]), so both signing and verification work on the
//! prehashed DigestInfo form of the PKCS#1 v1.5 operation.

use openssl::hash::{Hasher, MessageDigest};
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Padding;

use crate::MarError;

/// ASN.1 DigestInfo prefixes, concatenated in front of the raw digest.
const SHA1_PREFIX: &[u8] = &[
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];
const SHA384_PREFIX: &[u8] = &[
    0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02,
    0x05, 0x00, 0x04, 0x30,
];

/// The (hash, key size) pairs an archive may declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    /// Algorithm id 1: SHA-1 with a 2048-bit key. Older archives pair this
    /// id with 1024-bit keys; those verify but are never produced.
    Sha1,
    /// Algorithm id 2: SHA-384 with a 4096-bit key.
    Sha384,
}

impl Algorithm {
    pub fn from_id(id: u32) -> Option<Algorithm> {
        match id {
            1 => Some(Algorithm::Sha1),
            2 => Some(Algorithm::Sha384),
            _ => None,
        }
    }

    pub fn id(self) -> u32 {
        match self {
            Algorithm::Sha1 => 1,
            Algorithm::Sha384 => 2,
        }
    }

    pub fn digest(self) -> MessageDigest {
        match self {
            Algorithm::Sha1 => MessageDigest::sha1(),
            Algorithm::Sha384 => MessageDigest::sha384(),
        }
    }

    /// Modulus size in bytes of the key this crate will sign with.
    pub fn signature_size(self) -> usize {
        match self {
            Algorithm::Sha1 => 256,
            Algorithm::Sha384 => 512,
        }
    }

    /// Picks the algorithm for a private key by its modulus size.
    pub fn for_key(key: &PKey<Private>) -> Result<Algorithm, MarError> {
        let rsa = key
            .rsa()
            .map_err(|_| MarError::SigningFailed("signing key is not RSA".into()))?;
        match rsa.size() as usize {
            256 => Ok(Algorithm::Sha1),
            512 => Ok(Algorithm::Sha384),
            bytes => Err(MarError::SigningFailed(format!(
                "unsupported {}-bit signing key",
                bytes * 8
            ))),
        }
    }

    fn digest_info(self, digest: &[u8]) -> Vec<u8> {
        let prefix = match self {
            Algorithm::Sha1 => SHA1_PREFIX,
            Algorithm::Sha384 => SHA384_PREFIX,
        };
        let mut info = Vec::with_capacity(prefix.len() + digest.len());
        info.extend_from_slice(prefix);
        info.extend_from_slice(digest);
        info
    }
}

/// A fresh streaming hasher for the given algorithm.
pub fn hasher(algorithm: Algorithm) -> Result<Hasher, MarError> {
    Ok(Hasher::new(algorithm.digest())?)
}

/// Signs a precomputed digest. The result is exactly as long as the key's
/// modulus.
pub fn sign_digest(
    key: &PKey<Private>,
    algorithm: Algorithm,
    digest: &[u8],
) -> Result<Vec<u8>, MarError> {
    let rsa = key
        .rsa()
        .map_err(|_| MarError::SigningFailed("signing key is not RSA".into()))?;
    let info = algorithm.digest_info(digest);
    let mut signature = vec![0u8; rsa.size() as usize];
    let n = rsa
        .private_encrypt(&info, &mut signature, Padding::PKCS1)
        .map_err(|e| MarError::SigningFailed(e.to_string()))?;
    signature.truncate(n);
    Ok(signature)
}

/// Checks a signature against a precomputed digest. A padding failure and
/// a digest mismatch are indistinguishable: both are just `false`.
pub fn verify_digest(
    key: &PKey<Public>,
    algorithm: Algorithm,
    digest: &[u8],
    signature: &[u8],
) -> bool {
    let rsa = match key.rsa() {
        Ok(rsa) => rsa,
        Err(_) => return false,
    };
    if signature.len() != rsa.size() as usize {
        return false;
    }
    let mut recovered = vec![0u8; rsa.size() as usize];
    let n = match rsa.public_decrypt(signature, &mut recovered, Padding::PKCS1) {
        Ok(n) => n,
        Err(_) => return false,
    };
    recovered.truncate(n);
    recovered == algorithm.digest_info(digest)
}

/// Whether `key` could plausibly have produced a signature of `len` bytes.
pub fn key_matches(key: &PKey<Public>, len: usize) -> bool {
    key.rsa().map(|rsa| rsa.size() as usize == len).unwrap_or(false)
}

/// Loads a public key from SubjectPublicKeyInfo DER or PEM. As a
/// convenience a private-key PEM is accepted too and its public half used.
pub fn load_public_key(data: &[u8]) -> Result<PKey<Public>, MarError> {
    if let Ok(key) = PKey::public_key_from_der(data) {
        return Ok(key);
    }
    if let Ok(key) = PKey::public_key_from_pem(data) {
        return Ok(key);
    }
    let private = PKey::private_key_from_pem(data)?;
    let pem = private.public_key_to_pem()?;
    Ok(PKey::public_key_from_pem(&pem)?)
}

/// Loads a private key from PKCS#1 or PKCS#8, PEM or DER.
pub fn load_private_key(data: &[u8]) -> Result<PKey<Private>, MarError> {
    if let Ok(key) = PKey::private_key_from_pem(data) {
        return Ok(key);
    }
    Ok(PKey::private_key_from_der(data)?)
}

/// How candidate keys are applied to each signature slot during verify.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyPolicy {
    /// A slot verifies when any matching candidate key accepts it.
    AnyKey,
    /// A slot verifies only when every matching candidate key accepts it.
    RequireAll,
}

/// Result of verifying an archive. Every declared signature must verify
/// for the archive to count as [`VerifyOutcome::Verified`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// A well-formed archive that declares no signatures.
    NoSignatures,
    /// All declared signatures verified; carries how many.
    Verified(usize),
    /// The given slot did not match the archive contents.
    FailedSignature(usize),
    /// No candidate key was supplied for the given slot, or its algorithm
    /// id is not recognized.
    UnknownSignatureAlgorithm(usize),
}

impl VerifyOutcome {
    pub fn is_good(&self) -> bool {
        matches!(
            self,
            VerifyOutcome::NoSignatures | VerifyOutcome::Verified(_)
        )
    }
}

#[cfg(test)]
mod test_signing {
    use openssl::rsa::Rsa;

    use super::*;

    fn keypair(bits: u32) -> (PKey<Private>, PKey<Public>) {
        let rsa = Rsa::generate(bits).unwrap();
        let private = PKey::from_rsa(rsa).unwrap();
        let pem = private.public_key_to_pem().unwrap();
        let public = PKey::public_key_from_pem(&pem).unwrap();
        (private, public)
    }

    fn digest_for(algorithm: Algorithm, data: &[u8]) -> Vec<u8> {
        let mut h = hasher(algorithm).unwrap();
        h.update(data).unwrap();
        h.finish().unwrap().to_vec()
    }

    #[test]
    fn sha1_sign_verify_roundtrip() {
        let (private, public) = keypair(2048);
        let digest = digest_for(Algorithm::Sha1, b"some archive bytes");
        assert_eq!(digest.len(), 20);

        let sig = sign_digest(&private, Algorithm::Sha1, &digest).unwrap();
        assert_eq!(sig.len(), Algorithm::Sha1.signature_size());
        assert!(verify_digest(&public, Algorithm::Sha1, &digest, &sig));
    }

    #[test]
    fn sha384_sign_verify_roundtrip() {
        let (private, public) = keypair(4096);
        let digest = digest_for(Algorithm::Sha384, b"other archive bytes");
        assert_eq!(digest.len(), 48);

        let sig = sign_digest(&private, Algorithm::Sha384, &digest).unwrap();
        assert_eq!(sig.len(), Algorithm::Sha384.signature_size());
        assert!(verify_digest(&public, Algorithm::Sha384, &digest, &sig));
    }

    #[test]
    fn wrong_key_fails() {
        let (private, _) = keypair(2048);
        let (_, other_public) = keypair(2048);
        let digest = digest_for(Algorithm::Sha1, b"payload");
        let sig = sign_digest(&private, Algorithm::Sha1, &digest).unwrap();
        assert!(!verify_digest(&other_public, Algorithm::Sha1, &digest, &sig));
    }

    #[test]
    fn wrong_digest_fails() {
        let (private, public) = keypair(2048);
        let digest = digest_for(Algorithm::Sha1, b"payload");
        let other = digest_for(Algorithm::Sha1, b"tampered");
        let sig = sign_digest(&private, Algorithm::Sha1, &digest).unwrap();
        assert!(!verify_digest(&public, Algorithm::Sha1, &other, &sig));
    }

    #[test]
    fn signing_is_deterministic() {
        let (private, _) = keypair(2048);
        let digest = digest_for(Algorithm::Sha1, b"payload");
        let a = sign_digest(&private, Algorithm::Sha1, &digest).unwrap();
        let b = sign_digest(&private, Algorithm::Sha1, &digest).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn algorithm_follows_key_size() {
        let (k2048, _) = keypair(2048);
        let (k4096, _) = keypair(4096);
        let (k1024, _) = keypair(1024);
        assert_eq!(Algorithm::for_key(&k2048).unwrap(), Algorithm::Sha1);
        assert_eq!(Algorithm::for_key(&k4096).unwrap(), Algorithm::Sha384);
        // 1024-bit keys are verify-only
        assert!(matches!(
            Algorithm::for_key(&k1024),
            Err(MarError::SigningFailed(_))
        ));
    }

    #[test]
    fn legacy_1024_bit_verify() {
        let (private, public) = keypair(1024);
        let digest = digest_for(Algorithm::Sha1, b"legacy archive");
        let sig = sign_digest(&private, Algorithm::Sha1, &digest).unwrap();
        assert_eq!(sig.len(), 128);
        assert!(key_matches(&public, 128));
        assert!(verify_digest(&public, Algorithm::Sha1, &digest, &sig));
    }

    #[test]
    fn private_pem_loads_as_public() {
        let (private, public) = keypair(2048);
        let pem = private.private_key_to_pem_pkcs8().unwrap();
        let loaded = load_public_key(&pem).unwrap();
        assert!(loaded.public_eq(&public));
    }
}
