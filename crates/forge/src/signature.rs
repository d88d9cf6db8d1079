//! GitHub-compatible webhook HMAC validation (`X-Hub-Signature[-256]`).

use anyhow::{Result, anyhow, bail};
use hmac::{Hmac, Mac};
use http::HeaderMap;
use sha1::Sha1;
use sha2::Sha256;

pub const SIGNATURE_SHA256_HEADER: &str = "X-Hub-Signature-256";
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";

/// The signature header sent with a delivery, preferring SHA-256.
pub fn signature_header(headers: &HeaderMap) -> Option<&str> {
    [SIGNATURE_SHA256_HEADER, SIGNATURE_HEADER]
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
        .filter(|v| !v.is_empty())
}

/// Check `signature` (`sha1=<hex>` or `sha256=<hex>`) against `payload`.
pub fn validate_signature(signature: &str, payload: &[u8], secret: &[u8]) -> Result<()> {
    let (algorithm, digest) = signature
        .split_once('=')
        .ok_or_else(|| anyhow!("error parsing signature {signature:?}"))?;
    let digest = hex::decode(digest).map_err(|e| anyhow!("error decoding signature: {e}"))?;
    let verified = match algorithm {
        "sha256" => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret)
                .map_err(|e| anyhow!("invalid webhook secret: {e}"))?;
            mac.update(payload);
            mac.verify_slice(&digest).is_ok()
        }
        "sha1" => {
            let mut mac = Hmac::<Sha1>::new_from_slice(secret)
                .map_err(|e| anyhow!("invalid webhook secret: {e}"))?;
            mac.update(payload);
            mac.verify_slice(&digest).is_ok()
        }
        other => bail!("unknown signature algorithm {other:?}"),
    };
    if !verified {
        bail!("payload signature check failed");
    }
    Ok(())
}

/// Validate a delivery for `forge`. Unsigned deliveries pass when no secret
/// is configured; a signed delivery without a configured secret is rejected.
pub fn validate_request(
    forge: &str,
    headers: &HeaderMap,
    payload: &[u8],
    secret: &str,
) -> Result<()> {
    let signature = signature_header(headers);
    match (signature, secret.is_empty()) {
        (None, true) => Ok(()),
        (Some(_), true) => bail!("{forge} failed validation: failed to find webhook secret"),
        (None, false) => bail!("{forge} failed validation: missing signature header"),
        (Some(signature), false) => validate_signature(signature, payload, secret.as_bytes())
            .map_err(|e| anyhow!("{forge} failed validation: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn sign256(secret: &str, payload: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn sign1(secret: &str, payload: &[u8]) -> String {
        let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_validate_signature() {
        let payload = br#"{"hello":"world"}"#;
        assert!(validate_signature(&sign256("s3cr3t", payload), payload, b"s3cr3t").is_ok());
        assert!(validate_signature(&sign1("s3cr3t", payload), payload, b"s3cr3t").is_ok());
        assert!(validate_signature(&sign256("other", payload), payload, b"s3cr3t").is_err());
        assert!(validate_signature("md5=abcd", payload, b"s3cr3t").is_err());
        assert!(validate_signature("sha256=zz", payload, b"s3cr3t").is_err());
        assert!(validate_signature("garbage", payload, b"s3cr3t").is_err());
    }

    #[test]
    fn test_validate_request() {
        let payload = b"{}";
        let mut headers = HeaderMap::new();
        assert!(validate_request("gitea", &headers, payload, "").is_ok());
        assert!(validate_request("gitea", &headers, payload, "secret").is_err());

        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&sign1("secret", payload)).unwrap());
        let err = validate_request("bitbucket-datacenter", &headers, payload, "").unwrap_err();
        assert_eq!(
            err.to_string(),
            "bitbucket-datacenter failed validation: failed to find webhook secret"
        );
        assert!(validate_request("gitea", &headers, payload, "secret").is_ok());

        // SHA-256 header wins when both are present
        headers.insert(SIGNATURE_SHA256_HEADER, HeaderValue::from_static("sha256=00"));
        assert!(validate_request("gitea", &headers, payload, "secret").is_err());
    }
}
