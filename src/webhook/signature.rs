//! Webhook signature verification.
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=<hex hmac>...]`.
//! The digest is HMAC-SHA256 over `"{t}." + raw body` with the shared secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::billing::LedgerError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    /// Decoded `v1` digests; any one may match.
    pub signatures: Vec<Vec<u8>>,
}

/// Parse a signature header. Unknown schemes are ignored.
pub fn parse_header(header: &str) -> Result<SignatureHeader, LedgerError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            return Err(LedgerError::InvalidSignature("malformed signature header"));
        };
        match key {
            "t" => {
                let parsed = value
                    .parse::<i64>()
                    .map_err(|_| LedgerError::InvalidSignature("malformed signature timestamp"))?;
                timestamp = Some(parsed);
            }
            "v1" => {
                // An undecodable entry can never match; skip it.
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(LedgerError::InvalidSignature("missing signature timestamp"))?;
    if signatures.is_empty() {
        return Err(LedgerError::InvalidSignature("missing v1 signature"));
    }
    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

fn mac_for(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, LedgerError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| LedgerError::InvalidSignature("unusable signing secret"))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Verify `payload` against `header`.
///
/// `tolerance_secs == 0` disables the timestamp check.
pub fn verify(
    secret: &str,
    payload: &[u8],
    header: &str,
    tolerance_secs: u64,
    now_secs: i64,
) -> Result<(), LedgerError> {
    let parsed = parse_header(header)?;

    if tolerance_secs > 0 {
        let age = now_secs.abs_diff(parsed.timestamp);
        if age > tolerance_secs {
            return Err(LedgerError::InvalidSignature("timestamp outside tolerance"));
        }
    }

    let mac = mac_for(secret, parsed.timestamp, payload)?;
    // Constant-time comparison against each candidate
    let matched = parsed
        .signatures
        .iter()
        .any(|candidate| mac.clone().verify_slice(candidate).is_ok());
    if matched {
        Ok(())
    } else {
        Err(LedgerError::InvalidSignature("invalid signature"))
    }
}

/// Hex digest for `payload` signed at `timestamp`.
pub fn sign(secret: &str, payload: &[u8], timestamp: i64) -> Result<String, LedgerError> {
    let mac = mac_for(secret, timestamp, payload)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Complete header value for `payload` signed at `timestamp`.
pub fn header_for(secret: &str, payload: &[u8], timestamp: i64) -> Result<String, LedgerError> {
    Ok(format!("t={timestamp},v1={}", sign(secret, payload, timestamp)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test123secret456";
    const NOW: i64 = 1_700_000_000;

    #[test]
    fn valid_signature_is_accepted() {
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let header = header_for(SECRET, payload, NOW).unwrap();
        assert!(verify(SECRET, payload, &header, 300, NOW + 10).is_ok());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = b"{}";
        let header = header_for("whsec_other", payload, NOW).unwrap();
        let err = verify(SECRET, payload, &header, 300, NOW).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidSignature("invalid signature")));
    }

    #[test]
    fn modified_payload_is_rejected() {
        let header = header_for(SECRET, br#"{"amount":100}"#, NOW).unwrap();
        assert!(verify(SECRET, br#"{"amount":999}"#, &header, 300, NOW).is_err());
    }

    #[test]
    fn body_is_verified_byte_exact() {
        // Same JSON, different whitespace.
        let header = header_for(SECRET, br#"{"a":1}"#, NOW).unwrap();
        assert!(verify(SECRET, br#"{ "a": 1 }"#, &header, 300, NOW).is_err());
    }

    #[test]
    fn binary_payload_is_supported() {
        let payload = [0u8, 159, 146, 150, 255];
        let header = header_for(SECRET, &payload, NOW).unwrap();
        assert!(verify(SECRET, &payload, &header, 300, NOW).is_ok());
    }

    #[test]
    fn old_timestamp_is_rejected() {
        let payload = b"{}";
        let header = header_for(SECRET, payload, NOW - 600).unwrap();
        let err = verify(SECRET, payload, &header, 300, NOW).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidSignature("timestamp outside tolerance")));
        assert!(verify(SECRET, payload, &header, 0, NOW).is_ok());
    }

    #[test]
    fn any_matching_v1_entry_is_enough() {
        let payload = b"{}";
        let good = sign(SECRET, payload, NOW).unwrap();
        let header = format!("t={NOW},v1={},v0=legacy,v1={good}", "ab".repeat(32));
        assert!(verify(SECRET, payload, &header, 300, NOW).is_ok());
    }

    #[test]
    fn malformed_headers_are_rejected() {
        for header in ["", "v1=abcdef", "t=1234567890", "t=abc,v1=00", "garbage"] {
            assert!(
                parse_header(header).is_err(),
                "header {header:?} should not parse"
            );
        }
    }
}
