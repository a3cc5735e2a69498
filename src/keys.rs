//! Built-in verification keys, embedded at compile time.
//!
//! Each symbolic name maps to one or more DER-encoded
//! SubjectPublicKeyInfo blobs so that key rotation periods, where archives
//! signed by either key are in circulation, stay verifiable.

static MOZILLA_RELEASE: [&[u8]; 2] = [
    include_bytes!("keys/release1.der"),
    include_bytes!("keys/release2.der"),
];

static MOZILLA_NIGHTLY: [&[u8]; 2] = [
    include_bytes!("keys/nightly1.der"),
    include_bytes!("keys/nightly2.der"),
];

static AUTOGRAPH_STAGE: [&[u8]; 1] = [include_bytes!("keys/autograph-stage.der")];

/// Names accepted by the `-k :name` CLI selector.
pub const KNOWN_NAMES: [&str; 3] = ["mozilla-release", "mozilla-nightly", "autograph-stage"];

/// Looks up the DER public keys registered under a symbolic name.
pub fn lookup(name: &str) -> Option<&'static [&'static [u8]]> {
    match name {
        "mozilla-release" => Some(&MOZILLA_RELEASE),
        "mozilla-nightly" => Some(&MOZILLA_NIGHTLY),
        "autograph-stage" => Some(&AUTOGRAPH_STAGE),
        _ => None,
    }
}
