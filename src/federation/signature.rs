//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per the HTTP Signatures draft as
//! used across the fediverse (Mastodon-compatible `rsa-sha256`).

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::{RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

use crate::error::{AppError, VerificationError};

/// Sign an HTTP request
///
/// Creates HTTP Signature header for outgoing requests.
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `private_key_pem` - RSA private key in PEM format
/// * `key_id` - Full URL to the public key (actor#main-key)
///
/// # Returns
/// Headers to add: Signature, Date, Digest (if body present)
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    // 1. Parse URL to get host and path
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = parsed_url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    // The signed host must match the Host header the peer receives, which
    // carries an explicit non-default port.
    let host = match parsed_url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let path = parsed_url.path();
    let query = parsed_url.query();
    let path_and_query = if let Some(q) = query {
        format!("{}?{}", path, q)
    } else {
        path.to_string()
    };

    // 2. Generate Date header (RFC 2822 format)
    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

    // 3. Generate Digest if body present
    let digest = body.map(generate_digest);

    // 4. Build signing string
    let request_target = format!("{} {}", method.to_lowercase(), path_and_query);

    let mut signing_parts = vec![
        format!("(request-target): {}", request_target),
        format!("host: {}", host),
        format!("date: {}", date),
    ];

    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");

    // 5. Sign with RSA-SHA256
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::signature::{RandomizedSigner, SignatureEncoding};

    let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::Validation(format!("Invalid private key: {}", e)))?;

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    // 6. Build Signature header
    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        headers_list.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        digest,
    })
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Verify an HTTP request signature
///
/// # Arguments
/// * `method` - HTTP method
/// * `path` - Request path
/// * `headers` - All request headers
/// * `body` - Request body (for digest verification)
/// * `public_key_pem` - RSA public key in PEM format
/// * `clock_skew_seconds` - Accepted Date header skew in either direction
///
/// # Errors
/// Returns the taxonomy variant for the failed check; never panics on
/// malformed input.
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
    clock_skew_seconds: i64,
) -> Result<(), VerificationError> {
    // 1. Parse Signature header
    let signature_header = headers
        .get("signature")
        .ok_or(VerificationError::Unsigned)?
        .to_str()
        .map_err(|_| invalid("Invalid Signature header encoding"))?;

    let parsed = parse_signature_header(signature_header)?;

    // 2. Validate algorithm and required signed headers.
    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(invalid(&format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(invalid(&format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(invalid("Signed headers must include: digest"));
    }

    // 3. Verify Date is within the skew window (replay protection).
    let date_header = headers
        .get("date")
        .ok_or_else(|| invalid("Missing Date header"))?;
    let date_str = date_header
        .to_str()
        .map_err(|_| invalid("Invalid Date header"))?;

    let date = DateTime::parse_from_rfc2822(date_str).map_err(|_| invalid("Invalid Date format"))?;

    let now = Utc::now();
    let diff = (now.timestamp() - date.timestamp()).abs();

    if diff > clock_skew_seconds {
        return Err(VerificationError::StaleTimestamp);
    }

    // 4. If body present, verify Digest.
    if let Some(body_data) = body {
        let digest_header = headers
            .get("digest")
            .ok_or_else(|| invalid("Missing Digest header"))?;
        let digest_str = digest_header
            .to_str()
            .map_err(|_| invalid("Invalid Digest header"))?;

        let expected_digest = generate_digest(body_data);
        if digest_str != expected_digest {
            return Err(VerificationError::DigestMismatch);
        }
    }

    // 5. Reconstruct signing string.
    let mut signing_parts = Vec::new();

    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            name => headers
                .get(name)
                .ok_or_else(|| invalid(&format!("Missing signed header: {}", name)))?
                .to_str()
                .map_err(|_| invalid(&format!("Invalid signed header: {}", name)))?
                .to_string(),
        };

        signing_parts.push(format!("{}: {}", header_name, value));
    }

    let signing_string = signing_parts.join("\n");

    // 6. Verify RSA signature.
    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| invalid("Invalid signature encoding"))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| invalid(&format!("Invalid public key: {}", e)))?;

    // Use new_unprefixed for compatibility with other implementations.
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| invalid(&format!("Invalid signature format: {}", e)))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| invalid("Signature verification failed"))?;

    Ok(())
}

fn invalid(message: &str) -> VerificationError {
    VerificationError::InvalidSignature(message.to_string())
}

/// Extract keyId from Signature header.
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, VerificationError> {
    let signature_header = headers
        .get("signature")
        .ok_or(VerificationError::Unsigned)?
        .to_str()
        .map_err(|_| invalid("Invalid Signature header encoding"))?;

    let parsed = parse_signature_header(signature_header)?;
    Ok(parsed.key_id)
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, VerificationError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    // Split by comma and parse key=value pairs
    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            // Remove quotes from value
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {} // Ignore unknown fields
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| invalid("Missing keyId"))?,
        algorithm: algorithm.ok_or_else(|| invalid("Missing algorithm"))?,
        headers: headers.ok_or_else(|| invalid("Missing headers"))?,
        signature: signature.ok_or_else(|| invalid("Missing signature"))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue};
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    const TEST_SKEW: i64 = 1800;

    fn generate_test_keypair() -> (String, String) {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation should work");
        let public_key = RsaPublicKey::from(&private_key);

        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("private key pem")
            .to_string();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .expect("public key pem");

        (private_key_pem, public_key_pem)
    }

    fn build_signed_header_map(
        method: &str,
        url: &str,
        body: Option<&[u8]>,
        private_key_pem: &str,
    ) -> (HeaderMap, String) {
        let key_id = "https://remote.example/users/alice#main-key";
        let signed = sign_request(method, url, body, private_key_pem, key_id).expect("signed");
        let parsed_url = url::Url::parse(url).expect("valid test url");
        let host = parsed_url.host_str().expect("host");
        let path = parsed_url.path();
        let path_and_query = if let Some(query) = parsed_url.query() {
            format!("{}?{}", path, query)
        } else {
            path.to_string()
        };

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_str(host).expect("host header"));
        headers.insert(
            "date",
            HeaderValue::from_str(&signed.date).expect("date header"),
        );
        if let Some(digest) = signed.digest {
            headers.insert(
                "digest",
                HeaderValue::from_str(&digest).expect("digest header"),
            );
        }
        headers.insert(
            "signature",
            HeaderValue::from_str(&signed.signature).expect("signature header"),
        );

        (headers, path_and_query)
    }

    #[test]
    fn verify_signature_accepts_valid_signed_request() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) = build_signed_header_map(
            "POST",
            "https://remote.example/inbox?foo=bar",
            Some(body),
            &private_key_pem,
        );

        let result = verify_signature(
            "POST",
            &path,
            &headers,
            Some(body),
            &public_key_pem,
            TEST_SKEW,
        );
        assert!(result.is_ok(), "valid signature should verify: {result:?}");
    }

    #[test]
    fn verify_signature_rejects_missing_signature_as_unsigned() {
        let (_, public_key_pem) = generate_test_keypair();
        let headers = HeaderMap::new();

        match verify_signature("POST", "/inbox", &headers, None, &public_key_pem, TEST_SKEW) {
            Err(VerificationError::Unsigned) => {}
            other => panic!("expected Unsigned, got: {other:?}"),
        }
    }

    #[test]
    fn verify_signature_rejects_tampered_body_as_digest_mismatch() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) = build_signed_header_map(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );

        let tampered = br#"{"type":"Undo"}"#;
        match verify_signature(
            "POST",
            &path,
            &headers,
            Some(tampered),
            &public_key_pem,
            TEST_SKEW,
        ) {
            Err(VerificationError::DigestMismatch) => {}
            other => panic!("expected DigestMismatch, got: {other:?}"),
        }
    }

    #[test]
    fn verify_signature_rejects_expired_date_as_stale_timestamp() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path) = build_signed_header_map(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );

        let stale = (Utc::now() - chrono::Duration::seconds(TEST_SKEW + 60))
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        headers.insert("date", HeaderValue::from_str(&stale).expect("date header"));

        match verify_signature(
            "POST",
            &path,
            &headers,
            Some(body),
            &public_key_pem,
            TEST_SKEW,
        ) {
            Err(VerificationError::StaleTimestamp) => {}
            other => panic!("expected StaleTimestamp, got: {other:?}"),
        }
    }

    #[test]
    fn verify_signature_rejects_wrong_key_as_invalid_signature() {
        let (private_key_pem, _) = generate_test_keypair();
        let (_, other_public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) = build_signed_header_map(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );

        match verify_signature(
            "POST",
            &path,
            &headers,
            Some(body),
            &other_public_key_pem,
            TEST_SKEW,
        ) {
            Err(VerificationError::InvalidSignature(_)) => {}
            other => panic!("expected InvalidSignature, got: {other:?}"),
        }
    }

    #[test]
    fn verify_signature_rejects_missing_digest_header_for_body() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path) = build_signed_header_map(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );
        headers.remove("digest");

        match verify_signature(
            "POST",
            &path,
            &headers,
            Some(body),
            &public_key_pem,
            TEST_SKEW,
        ) {
            Err(VerificationError::InvalidSignature(msg)) => {
                assert!(msg.contains("Missing Digest header"))
            }
            other => panic!("expected missing digest header error, got: {other:?}"),
        }
    }

    #[test]
    fn verify_signature_rejects_when_date_not_in_signed_headers() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path) = build_signed_header_map(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );

        let signature_header = headers
            .get("signature")
            .expect("signature")
            .to_str()
            .expect("signature str");
        let parsed = parse_signature_header(signature_header).expect("parsed signature");
        let tampered = format!(
            "keyId=\"{}\",algorithm=\"{}\",headers=\"(request-target) host digest\",signature=\"{}\"",
            parsed.key_id, parsed.algorithm, parsed.signature
        );
        headers.insert(
            "signature",
            HeaderValue::from_str(&tampered).expect("tampered signature"),
        );

        match verify_signature(
            "POST",
            &path,
            &headers,
            Some(body),
            &public_key_pem,
            TEST_SKEW,
        ) {
            Err(VerificationError::InvalidSignature(msg)) => {
                assert!(msg.contains("Signed headers must include: date"))
            }
            other => panic!("expected missing signed date error, got: {other:?}"),
        }
    }

    #[test]
    fn extract_signature_key_id_reads_key_id() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "signature",
            HeaderValue::from_static(
                "keyId=\"https://remote.example/users/alice#main-key\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date\",signature=\"ZmFrZQ==\"",
            ),
        );

        let key_id = extract_signature_key_id(&headers).expect("keyId should be parsed");
        assert_eq!(key_id, "https://remote.example/users/alice#main-key");
    }

    #[test]
    fn key_id_matches_actor_accepts_same_actor() {
        assert!(key_id_matches_actor(
            "https://remote.example/users/alice#main-key",
            "https://remote.example/users/alice",
        ));
    }

    #[test]
    fn key_id_matches_actor_rejects_different_actor() {
        assert!(!key_id_matches_actor(
            "https://remote.example/users/bob#main-key",
            "https://remote.example/users/alice",
        ));
    }
}
