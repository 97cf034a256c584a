//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per the draft-cavage scheme used by
//! Mastodon and most fediverse software:
//! https://docs.joinmastodon.org/spec/security/

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::{RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

use super::activity::strip_fragment;
use crate::error::AppError;

/// Date header format (RFC 7231 IMF-fixdate)
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Why a signature was not accepted
///
/// Every variant surfaces as `AppError::InvalidSignature` (401); the detail
/// is only logged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing Signature header")]
    Missing,
    #[error("malformed Signature header: {0}")]
    Malformed(String),
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("signed headers must include: {0}")]
    MissingSignedHeader(String),
    #[error("missing {0} header")]
    MissingHeader(String),
    #[error("date header outside the accepted window ({0}s skew)")]
    Expired(i64),
    #[error("unsupported digest algorithm")]
    UnsupportedDigest,
    #[error("digest mismatch")]
    DigestMismatch,
    #[error("invalid public key: {0}")]
    InvalidKey(String),
    #[error("signature does not match")]
    Mismatch,
}

impl From<SignatureError> for AppError {
    fn from(_: SignatureError) -> Self {
        AppError::InvalidSignature
    }
}

/// The parts of an inbound HTTP request a signature covers
#[derive(Debug, Clone)]
pub struct SignedRequest<'a> {
    pub method: &'a str,
    /// Path including the query string
    pub path: &'a str,
    pub headers: &'a http::HeaderMap,
    pub body: &'a [u8],
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Sign an HTTP request
///
/// Signs `(request-target)`, `host`, `date` and, when a body is given,
/// `digest` with RSA-SHA256.
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `private_key_pem` - RSA private key in PEM format (PKCS#8 or PKCS#1)
/// * `key_id` - Full URL to the public key (actor#main-key)
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    sign_request_at(method, url, body, private_key_pem, key_id, Utc::now())
}

/// [`sign_request`] with an explicit signing time
pub fn sign_request_at(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
    now: DateTime<Utc>,
) -> Result<SignatureHeaders, AppError> {
    use rsa::signature::{RandomizedSigner, SignatureEncoding};

    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = host_header_value(&parsed_url)
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", parsed_url.path(), q),
        None => parsed_url.path().to_string(),
    };

    let date = now.format(HTTP_DATE_FORMAT).to_string();
    let digest = body.map(generate_digest);

    let mut signing_parts = vec![
        format!("(request-target): {} {}", method.to_lowercase(), path_and_query),
        format!("host: {}", host),
        format!("date: {}", date),
    ];
    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");

    let private_key = parse_private_key(private_key_pem)?;
    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

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

fn parse_private_key(pem: &str) -> Result<rsa::RsaPrivateKey, AppError> {
    use rsa::pkcs1::DecodeRsaPrivateKey;
    use rsa::pkcs8::DecodePrivateKey;

    rsa::RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| rsa::RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| AppError::Config(format!("Invalid private key: {}", e)))
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey, SignatureError> {
    use rsa::pkcs1::DecodeRsaPublicKey;

    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))
}

/// Generate an RSA key pair for a new local actor
///
/// Returns `(private_key_pem, public_key_pem)`, PKCS#8 and SPKI encoded.
pub fn generate_keypair(bits: usize) -> Result<(String, String), AppError> {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    let mut rng = rand::thread_rng();
    let private_key = rsa::RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Key generation failed: {}", e)))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Key encoding failed: {}", e)))?
        .to_string();
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Key encoding failed: {}", e)))?;

    Ok((private_pem, public_pem))
}

/// Host header value for a URL, including a non-default port
fn host_header_value(url: &url::Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Verify an inbound request signature against a public key
///
/// Checks, in order: the header parses, the algorithm is RSA-SHA256
/// compatible, the required headers are signed, the Date is within
/// `max_age_secs` of now, the Digest matches the body, and finally the RSA
/// signature itself.
pub fn verify_signature(
    request: &SignedRequest<'_>,
    public_key_pem: &str,
    max_age_secs: i64,
) -> Result<(), SignatureError> {
    verify_signature_at(request, public_key_pem, max_age_secs, Utc::now())
}

/// [`verify_signature`] with an explicit current time
pub fn verify_signature_at(
    request: &SignedRequest<'_>,
    public_key_pem: &str,
    max_age_secs: i64,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let header = header_str(request.headers, "signature")?.ok_or(SignatureError::Missing)?;
    let parsed = parse_signature_header(header)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(SignatureError::UnsupportedAlgorithm(parsed.algorithm));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(SignatureError::MissingSignedHeader(required.to_string()));
        }
    }

    if !request.body.is_empty() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(SignatureError::MissingSignedHeader("digest".to_string()));
    }

    let date_str = header_str(request.headers, "date")?
        .ok_or_else(|| SignatureError::MissingHeader("date".to_string()))?;
    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| SignatureError::Malformed("invalid Date format".to_string()))?;
    let skew = (now.timestamp() - date.timestamp()).abs();
    if skew > max_age_secs {
        return Err(SignatureError::Expired(skew));
    }

    if let Some(digest) = header_str(request.headers, "digest")? {
        verify_digest(digest, request.body)?;
    } else if !request.body.is_empty() {
        return Err(SignatureError::MissingHeader("digest".to_string()));
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = if header_name == "(request-target)" {
            format!("{} {}", request.method.to_lowercase(), request.path)
        } else {
            header_str(request.headers, header_name)?
                .ok_or_else(|| SignatureError::MissingHeader(header_name.clone()))?
                .to_string()
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| SignatureError::Malformed("invalid signature encoding".to_string()))?;
    let public_key = parse_public_key(public_key_pem)?;
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| SignatureError::Mismatch)
}

fn header_str<'a>(
    headers: &'a http::HeaderMap,
    name: &str,
) -> Result<Option<&'a str>, SignatureError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| SignatureError::Malformed(format!("non-ASCII {} header", name)))
        })
        .transpose()
}

/// Extract keyId from the Signature header, if any
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, SignatureError> {
    let header = header_str(headers, "signature")?.ok_or(SignatureError::Missing)?;
    Ok(parse_signature_header(header)?.key_id)
}

/// Validate that signature keyId points to the same actor as the activity actor
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    strip_fragment(key_id) == strip_fragment(actor_id)
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (rsa-sha256 or hs2019)
    pub algorithm: String,
    /// Signed header names, lowercased
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
///
/// `algorithm` defaults to hs2019 and `headers` to `date` when omitted.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, SignatureError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');

        match key.trim() {
            "keyId" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_ascii_lowercase()),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(|s| s.to_ascii_lowercase())
                        .collect::<Vec<_>>(),
                )
            }
            "signature" => signature = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(ParsedSignature {
        key_id: key_id
            .filter(|k| !k.is_empty())
            .ok_or_else(|| SignatureError::Malformed("missing keyId".to_string()))?,
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SignatureError::Malformed("missing signature".to_string()))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    format!("SHA-256={}", BASE64.encode(Sha256::digest(body)))
}

/// Check a `Digest` header (SHA-256 or SHA-512) against the body
pub fn verify_digest(header: &str, body: &[u8]) -> Result<(), SignatureError> {
    let (algorithm, encoded) = header
        .split_once('=')
        .ok_or_else(|| SignatureError::Malformed("invalid Digest header".to_string()))?;

    let expected = match algorithm.trim().to_ascii_uppercase().as_str() {
        "SHA-256" => BASE64.encode(Sha256::digest(body)),
        "SHA-512" => BASE64.encode(Sha512::digest(body)),
        _ => return Err(SignatureError::UnsupportedDigest),
    };

    if encoded.trim() == expected {
        Ok(())
    } else {
        Err(SignatureError::DigestMismatch)
    }
}
