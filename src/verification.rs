use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("invalid signature format")]
    InvalidFormat,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("unusable signing key")]
    InvalidKey,
}

/// Verify a GitHub webhook HMAC-SHA256 signature.
///
/// `signature_header` is the value of `X-Hub-Signature-256`, e.g. `sha256=abc123...`.
/// The digest is computed over the raw body and compared in constant time.
pub fn verify_github_hmac(
    secret: &[u8],
    signature_header: &str,
    body: &[u8],
) -> Result<(), VerificationError> {
    let hex_sig = signature_header
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(VerificationError::InvalidFormat)?;

    let expected = hex::decode(hex_sig).map_err(|_| VerificationError::InvalidFormat)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| VerificationError::InvalidKey)?;
    mac.update(body);

    mac.verify_slice(&expected)
        .map_err(|_| VerificationError::SignatureMismatch)
}

/// Produce the `sha256=<hex>` header value for `body`.
pub fn sign_github_hmac(secret: &[u8], body: &[u8]) -> Result<String, VerificationError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| VerificationError::InvalidKey)?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}
