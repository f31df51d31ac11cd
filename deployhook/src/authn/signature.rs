//! Webhook signature verification
//!
//! The sender signs the raw request body with HMAC using the shared secret
//! and sends the digest as `<algorithm>=<lowercase hex>`. Verification always
//! runs over the body bytes exactly as received.

use std::fmt;

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;
use sha2::Sha256;
use tracing::warn;

/// Header carrying the HMAC-SHA-256 signature
pub const SIGNATURE_256_HEADER: &str = "x-hub-signature-256";

/// Header carrying the deprecated HMAC-SHA-1 signature
pub const LEGACY_SIGNATURE_HEADER: &str = "x-hub-signature";

/// Supported signature algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Sha256,
    /// Deprecated, only accepted in legacy mode
    Sha1,
}

impl SignatureAlgorithm {
    pub fn prefix(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Sha256 => "sha256",
            SignatureAlgorithm::Sha1 => "sha1",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "sha256" => Some(SignatureAlgorithm::Sha256),
            "sha1" => Some(SignatureAlgorithm::Sha1),
            _ => None,
        }
    }
}

/// Reason a signature was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    MissingSignature,
    Mismatch,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::MissingSignature => "missing_signature",
            FailureReason::Mismatch => "mismatch",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of verifying one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationResult {
    Verified(SignatureAlgorithm),
    Failed(FailureReason),
}

impl VerificationResult {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerificationResult::Verified(_))
    }
}

/// Verifies inbound payloads against the configured shared secret
pub struct SignatureVerifier {
    secret: SecretString,
    allow_legacy_sha1: bool,
}

impl SignatureVerifier {
    pub fn new(secret: SecretString, allow_legacy_sha1: bool) -> Self {
        Self {
            secret,
            allow_legacy_sha1,
        }
    }

    /// Verify `raw_body` against the declared signature header value
    pub fn verify(&self, raw_body: &[u8], declared_signature: Option<&str>) -> VerificationResult {
        verify(
            raw_body,
            declared_signature,
            self.secret.expose_secret().as_bytes(),
            self.allow_legacy_sha1,
        )
    }
}

impl fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &self.secret)
            .field("allow_legacy_sha1", &self.allow_legacy_sha1)
            .finish()
    }
}

/// Verify a declared `<algorithm>=<hex>` signature over `raw_body`.
///
/// Fails closed: anything other than a well-formed, matching digest of an
/// accepted algorithm is refused. The digest comparison is constant time.
pub fn verify(
    raw_body: &[u8],
    declared_signature: Option<&str>,
    secret: &[u8],
    allow_legacy_sha1: bool,
) -> VerificationResult {
    let Some(declared) = declared_signature.filter(|s| !s.is_empty()) else {
        return VerificationResult::Failed(FailureReason::MissingSignature);
    };

    let Some((prefix, digest_hex)) = declared.split_once('=') else {
        return VerificationResult::Failed(FailureReason::Mismatch);
    };

    let algorithm = match SignatureAlgorithm::from_prefix(prefix) {
        Some(SignatureAlgorithm::Sha1) if !allow_legacy_sha1 => None,
        other => other,
    };
    let Some(algorithm) = algorithm else {
        return VerificationResult::Failed(FailureReason::Mismatch);
    };

    // Senders emit lowercase hex; anything else is not the digest they computed
    if digest_hex.bytes().any(|b| b.is_ascii_uppercase()) {
        return VerificationResult::Failed(FailureReason::Mismatch);
    }
    let Ok(expected) = hex::decode(digest_hex) else {
        return VerificationResult::Failed(FailureReason::Mismatch);
    };

    let matches = match algorithm {
        SignatureAlgorithm::Sha256 => mac_matches::<Hmac<Sha256>>(secret, raw_body, &expected),
        SignatureAlgorithm::Sha1 => mac_matches::<Hmac<Sha1>>(secret, raw_body, &expected),
    };
    if !matches {
        return VerificationResult::Failed(FailureReason::Mismatch);
    }

    if algorithm == SignatureAlgorithm::Sha1 {
        warn!("Accepted deprecated sha1 webhook signature, switch the sender to sha256");
    }
    VerificationResult::Verified(algorithm)
}

/// Compute the `<algorithm>=<hex>` header value for `raw_body`
pub fn sign(algorithm: SignatureAlgorithm, raw_body: &[u8], secret: &[u8]) -> String {
    let digest = match algorithm {
        SignatureAlgorithm::Sha256 => mac_digest::<Hmac<Sha256>>(secret, raw_body),
        SignatureAlgorithm::Sha1 => mac_digest::<Hmac<Sha1>>(secret, raw_body),
    };
    format!("{}={}", algorithm.prefix(), hex::encode(digest))
}

fn mac_matches<M: Mac + KeyInit>(secret: &[u8], raw_body: &[u8], expected: &[u8]) -> bool {
    let Ok(mut mac) = <M as Mac>::new_from_slice(secret) else {
        return false;
    };
    mac.update(raw_body);
    mac.verify_slice(expected).is_ok()
}

fn mac_digest<M: Mac + KeyInit>(secret: &[u8], raw_body: &[u8]) -> Vec<u8> {
    match <M as Mac>::new_from_slice(secret) {
        Ok(mut mac) => {
            mac.update(raw_body);
            mac.finalize().into_bytes().to_vec()
        }
        // HMAC accepts keys of any length
        Err(_) => Vec::new(),
    }
}
