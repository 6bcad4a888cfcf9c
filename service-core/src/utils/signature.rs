use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Malformed signature header: {0}")]
    Malformed(String),

    #[error("Signature timestamp outside tolerance ({age_seconds}s old)")]
    Expired { age_seconds: i64 },

    #[error("No signature matched the payload")]
    Mismatch,

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),
}

/// Parsed `t=<unix>,v1=<hex>[,v1=<hex>...]` webhook signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

impl SignatureHeader {
    pub fn parse(header: &str) -> Result<Self, SignatureError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => {
                    timestamp = Some(value.parse::<i64>().map_err(|_| {
                        SignatureError::Malformed(format!("invalid timestamp '{}'", value))
                    })?);
                }
                "v1" => signatures.push(value.to_string()),
                // other schemes (v0 test signatures) are ignored
                _ => {}
            }
        }

        let timestamp =
            timestamp.ok_or_else(|| SignatureError::Malformed("missing timestamp".to_string()))?;
        if signatures.is_empty() {
            return Err(SignatureError::Malformed("missing v1 signature".to_string()));
        }

        Ok(Self {
            timestamp,
            signatures,
        })
    }

    pub fn format(timestamp: i64, signature: &str) -> String {
        format!("t={},v1={}", timestamp, signature)
    }
}

/// HMAC-SHA256 over `"{timestamp}.{payload}"`, hex encoded.
pub fn generate_webhook_signature(
    secret: &str,
    timestamp: i64,
    payload: &str,
) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;

    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a webhook signature header against the raw payload.
///
/// Every `v1` entry is compared in constant time; the header timestamp must be
/// within `tolerance_seconds` of `now_unix`.
pub fn verify_webhook_signature(
    secret: &str,
    header: &str,
    payload: &str,
    now_unix: i64,
    tolerance_seconds: i64,
) -> Result<SignatureHeader, SignatureError> {
    let parsed = SignatureHeader::parse(header)?;

    let age_seconds = now_unix - parsed.timestamp;
    if age_seconds.abs() > tolerance_seconds {
        return Err(SignatureError::Expired { age_seconds });
    }

    let expected = generate_webhook_signature(secret, parsed.timestamp, payload)?;
    let expected_bytes = expected.as_bytes();

    let matched = parsed.signatures.iter().any(|candidate| {
        let candidate_bytes = candidate.as_bytes();
        candidate_bytes.len() == expected_bytes.len()
            && bool::from(expected_bytes.ct_eq(candidate_bytes))
    });

    if matched {
        Ok(parsed)
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const PAYLOAD: &str = r#"{"id":"evt_1","type":"checkout.session.completed"}"#;
    const NOW: i64 = 1_760_000_000;

    #[test]
    fn test_signature_generation_and_verification() {
        let signature = generate_webhook_signature(SECRET, NOW, PAYLOAD).unwrap();
        let header = SignatureHeader::format(NOW, &signature);

        let parsed = verify_webhook_signature(SECRET, &header, PAYLOAD, NOW + 10, 300).unwrap();
        assert_eq!(parsed.timestamp, NOW);
    }

    #[test]
    fn test_tampered_body() {
        let signature = generate_webhook_signature(SECRET, NOW, PAYLOAD).unwrap();
        let header = SignatureHeader::format(NOW, &signature);

        let result = verify_webhook_signature(SECRET, &header, r#"{"id":"evt_2"}"#, NOW, 300);
        assert_eq!(result, Err(SignatureError::Mismatch));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let signature = generate_webhook_signature(SECRET, NOW, PAYLOAD).unwrap();
        let header = SignatureHeader::format(NOW, &signature);

        let result = verify_webhook_signature(SECRET, &header, PAYLOAD, NOW + 301, 300);
        assert_eq!(result, Err(SignatureError::Expired { age_seconds: 301 }));
    }

    #[test]
    fn test_any_of_multiple_signatures_may_match() {
        let signature = generate_webhook_signature(SECRET, NOW, PAYLOAD).unwrap();
        let header = format!("t={},v1=deadbeef,v0=abc,v1={}", NOW, signature);

        assert!(verify_webhook_signature(SECRET, &header, PAYLOAD, NOW, 300).is_ok());
    }

    #[test]
    fn test_malformed_headers() {
        assert!(matches!(
            SignatureHeader::parse("v1=abc"),
            Err(SignatureError::Malformed(_))
        ));
        assert!(matches!(
            SignatureHeader::parse("t=123"),
            Err(SignatureError::Malformed(_))
        ));
        assert!(matches!(
            SignatureHeader::parse("t=soon,v1=abc"),
            Err(SignatureError::Malformed(_))
        ));
    }
}
