//! Key identifiers.
//!
//! A `Ski` (subject key identifier) names the key a request should be served
//! with; the `Digest` pins the exact public key the client registered.

use std::fmt;

use sha1::Sha1;
use sha2::{Digest as _, Sha256};
use x509_parser::prelude::{FromDer, SubjectPublicKeyInfo};

pub const SKI_LEN: usize = 20;
pub const DIGEST_LEN: usize = 32;

/// Error returned when key material cannot be parsed.
#[derive(Debug, thiserror::Error)]
pub enum KeyParseError {
    #[error("invalid public key: {0}")]
    PublicKey(String),
    #[error("invalid certificate: {0}")]
    Certificate(String),
}

/// SHA-1 of the subjectPublicKey bits (RFC 5280, method 1).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ski(pub [u8; SKI_LEN]);

/// SHA-256 of the DER-encoded SubjectPublicKeyInfo.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Ski {
    /// Compute the SKI of a DER-encoded SubjectPublicKeyInfo.
    pub fn from_spki_der(der: &[u8]) -> Result<Self, KeyParseError> {
        let (_, spki) = SubjectPublicKeyInfo::from_der(der)
            .map_err(|e| KeyParseError::PublicKey(e.to_string()))?;
        Ok(Self::from_spki(&spki))
    }

    fn from_spki(spki: &SubjectPublicKeyInfo<'_>) -> Self {
        let hash = Sha1::digest(spki.subject_public_key.data.as_ref());
        let mut out = [0u8; SKI_LEN];
        out.copy_from_slice(&hash);
        Ski(out)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; SKI_LEN]>::try_from(bytes).ok().map(Ski)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Digest {
    pub fn from_spki_der(der: &[u8]) -> Self {
        let hash = Sha256::digest(der);
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&hash);
        Digest(out)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; DIGEST_LEN]>::try_from(bytes).ok().map(Digest)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Extract the DER-encoded SubjectPublicKeyInfo from a DER certificate.
pub fn spki_from_cert_der(cert_der: &[u8]) -> Result<Vec<u8>, KeyParseError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| KeyParseError::Certificate(e.to_string()))?;
    Ok(cert.public_key().raw.to_vec())
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

impl fmt::Display for Ski {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for Ski {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ski({})", self)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}
