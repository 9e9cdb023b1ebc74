//! Webhook signature verification.
//!
//! The processor signs each delivery with a header of the form
//! `t=<unix-seconds>,v1=<hex>` where the hex value is HMAC-SHA-256 over
//! `"<t>.<raw-body>"` keyed by the tenant's webhook secret. Verification
//! checks the timestamp window first, then compares digests in constant
//! time after an explicit length check. Anything structurally off rejects.

use chrono::DateTime;
use chrono::Utc;
use hmac::Hmac;
use hmac::Mac;
use sha2::Sha256;
use subtle::ConstantTimeEq;

pub const DEFAULT_TOLERANCE_SECONDS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

pub type SignatureResult<T> = Result<T, SignatureError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance window")]
    TimestampOutOfTolerance,
    #[error("signature mismatch")]
    Mismatch,
}

/// Produces the signature header value for a payload. Used by the sandbox
/// processor and by tests to fabricate deliveries.
#[must_use]
pub fn sign(secret: &[u8], timestamp: i64, raw_body: &[u8]) -> String {
    let digest = compute_digest(secret, timestamp, raw_body);
    format!("t={timestamp},v1={}", hex_encode(&digest))
}

pub fn verify(
    secret: &[u8],
    signature_header: &str,
    raw_body: &[u8],
    now: DateTime<Utc>,
    tolerance_seconds: i64,
) -> SignatureResult<()> {
    let (timestamp, provided_hex) = parse_header(signature_header)?;

    let skew = (now.timestamp() - timestamp).abs();
    if skew > tolerance_seconds.max(0) {
        return Err(SignatureError::TimestampOutOfTolerance);
    }

    let provided = hex_decode(provided_hex).ok_or(SignatureError::Malformed)?;
    let expected = compute_digest(secret, timestamp, raw_body);
    if provided.len() != expected.len() {
        return Err(SignatureError::Mismatch);
    }
    if provided.ct_eq(&expected).into() {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

fn parse_header(header: &str) -> SignatureResult<(i64, &str)> {
    let mut timestamp = None;
    let mut v1 = None;
    for part in header.split(',') {
        let (name, value) = part.split_once('=').ok_or(SignatureError::Malformed)?;
        match name.trim() {
            "t" => {
                let parsed = value.trim().parse::<i64>().map_err(|_| SignatureError::Malformed)?;
                timestamp = Some(parsed);
            }
            "v1" => v1 = Some(value.trim()),
            // Unknown scheme versions are ignored so the processor can roll
            // keys with dual-signed deliveries.
            _ => {}
        }
    }
    match (timestamp, v1) {
        (Some(timestamp), Some(v1)) if !v1.is_empty() => Ok((timestamp, v1)),
        _ => Err(SignatureError::Malformed),
    }
}

fn compute_digest(secret: &[u8], timestamp: i64, raw_body: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length; `new_from_slice` cannot fail here.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return Vec::new();
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    mac.finalize().into_bytes().to_vec()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn hex_decode(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 {
        return None;
    }
    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(input.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SECRET: &[u8] = b"whsec_test_secret";
    const BODY: &[u8] = br#"{"id":"evt_1","type":"payments.payment.succeeded"}"#;

    #[test]
    fn signed_payload_verifies() {
        let now = Utc::now();
        let header = sign(SECRET, now.timestamp(), BODY);
        assert_eq!(
            verify(SECRET, &header, BODY, now, DEFAULT_TOLERANCE_SECONDS),
            Ok(())
        );
    }

    #[test]
    fn tampered_digest_is_rejected() {
        let now = Utc::now();
        let header = sign(SECRET, now.timestamp(), BODY);
        let tampered = if header.ends_with('0') {
            format!("{}1", &header[..header.len() - 1])
        } else {
            format!("{}0", &header[..header.len() - 1])
        };
        assert_eq!(
            verify(SECRET, &tampered, BODY, now, DEFAULT_TOLERANCE_SECONDS),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn tampered_body_is_rejected() {
        let now = Utc::now();
        let header = sign(SECRET, now.timestamp(), BODY);
        assert_eq!(
            verify(SECRET, &header, b"{}", now, DEFAULT_TOLERANCE_SECONDS),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let now = Utc::now();
        let header = sign(SECRET, now.timestamp(), BODY);
        assert_eq!(
            verify(b"whsec_other", &header, BODY, now, DEFAULT_TOLERANCE_SECONDS),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let now = Utc::now();
        let header = sign(SECRET, now.timestamp() - DEFAULT_TOLERANCE_SECONDS - 1, BODY);
        assert_eq!(
            verify(SECRET, &header, BODY, now, DEFAULT_TOLERANCE_SECONDS),
            Err(SignatureError::TimestampOutOfTolerance)
        );
    }

    #[test]
    fn future_timestamp_is_rejected() {
        let now = Utc::now();
        let header = sign(SECRET, now.timestamp() + DEFAULT_TOLERANCE_SECONDS + 5, BODY);
        assert_eq!(
            verify(SECRET, &header, BODY, now, DEFAULT_TOLERANCE_SECONDS),
            Err(SignatureError::TimestampOutOfTolerance)
        );
    }

    #[test]
    fn structural_defects_are_malformed() {
        let now = Utc::now();
        for header in [
            "",
            "t=abc,v1=00",
            "v1=00",
            "t=123",
            "t=123,v1=",
            "nonsense",
            "t=123;v1=00",
        ] {
            assert_eq!(
                verify(SECRET, header, BODY, now, DEFAULT_TOLERANCE_SECONDS),
                Err(SignatureError::Malformed),
                "header {header:?} should be malformed"
            );
        }
    }

    #[test]
    fn odd_length_hex_is_malformed() {
        let now = Utc::now();
        let header = format!("t={},v1=abc", now.timestamp());
        assert_eq!(
            verify(SECRET, &header, BODY, now, DEFAULT_TOLERANCE_SECONDS),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn truncated_digest_is_mismatch_not_panic() {
        let now = Utc::now();
        let header = format!("t={},v1=abcd", now.timestamp());
        assert_eq!(
            verify(SECRET, &header, BODY, now, DEFAULT_TOLERANCE_SECONDS),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn unknown_header_parts_are_ignored() {
        let now = Utc::now();
        let base = sign(SECRET, now.timestamp(), BODY);
        let with_v0 = format!("{base},v0=deadbeef");
        assert_eq!(
            verify(SECRET, &with_v0, BODY, now, DEFAULT_TOLERANCE_SECONDS),
            Ok(())
        );
    }
}
