//! HTTP Signatures
//!
//! Signing string: one `name: value` line per signed header, in the order
//! the signer lists them, joined by `\n`. RSA PKCS#1 v1.5 over SHA-256.
//! Only `(request-target)`, `host`, `date`, `digest` and `content-length`
//! are recognized; other names in the signer's list are skipped on both
//! sides.

use crate::data::Actor;
use crate::error::AppError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Header names that may take part in a signing string.
pub const RECOGNIZED_HEADERS: [&str; 5] =
    ["(request-target)", "host", "date", "digest", "content-length"];

/// RFC 1123 date as used in the `Date` header.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// `Host` value for a URL, keeping non-default ports.
pub fn host_header(url: &url::Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Sign an HTTP request
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `private_key` - The sending actor's key
/// * `key_id` - Public key id published on the sending actor
///
/// # Returns
/// Headers to attach: Signature, Date, Host and Digest (if body present)
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key: &RsaPrivateKey,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    sign_request_at(method, url, body, private_key, key_id, Utc::now())
}

pub(crate) fn sign_request_at(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key: &RsaPrivateKey,
    key_id: &str,
    now: DateTime<Utc>,
) -> Result<SignatureHeaders, AppError> {
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
    let host = host_header(&parsed_url)
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", parsed_url.path(), q),
        None => parsed_url.path().to_string(),
    };

    let date = http_date(now);
    let digest = body.map(generate_digest);

    let mut lines = vec![
        format!("(request-target): {} {}", method.to_lowercase(), path_and_query),
        format!("host: {}", host),
        format!("date: {}", date),
    ];
    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(ref digest_value) = digest {
        lines.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
    }

    let signature_b64 = sign_string(&lines.join("\n"), private_key);

    Ok(SignatureHeaders {
        signature: format!(
            "keyId=\"{}\",headers=\"{}\",signature=\"{}\"",
            key_id,
            headers_list.join(" "),
            signature_b64
        ),
        date,
        host,
        digest,
    })
}

/// Sign a prepared signing string, returning base64.
pub fn sign_string(signing_string: &str, private_key: &RsaPrivateKey) -> String {
    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key.clone());
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    BASE64.encode(signature.to_bytes())
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 1123)
    pub date: String,
    /// Host header value, with port when non-default
    pub host: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Why a signature was refused. Logged, never sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingSignature,
    Malformed(&'static str),
    KeyMismatch,
    MissingDate,
    StaleDate(i64),
    DigestMismatch,
    BadPublicKey,
    BadSignature,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::MissingSignature => write!(f, "no Signature header"),
            Rejection::Malformed(what) => write!(f, "malformed Signature header: {what}"),
            Rejection::KeyMismatch => write!(f, "keyId does not match actor public key"),
            Rejection::MissingDate => write!(f, "Date header absent or unparseable"),
            Rejection::StaleDate(skew) => write!(f, "Date is {skew}s away from now"),
            Rejection::DigestMismatch => write!(f, "Digest does not match body"),
            Rejection::BadPublicKey => write!(f, "actor public key cannot be parsed"),
            Rejection::BadSignature => write!(f, "signature does not verify"),
        }
    }
}

/// Verify an inbound request against the claimed actor's key
///
/// # Arguments
/// * `method` - HTTP method
/// * `path` - Request path and query as received
/// * `headers` - All request headers
/// * `body` - Request body (checked against `Digest` when one is sent)
/// * `actor` - The actor the activity claims to come from
/// * `replay_window` - Maximum allowed distance between `Date` and now
///
/// # Errors
/// `AppError::Authentication` for every failure; the reason is logged at debug.
pub fn verify_request(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    actor: &Actor,
    replay_window: Duration,
) -> Result<(), AppError> {
    verify_request_at(method, path, headers, body, actor, replay_window, Utc::now()).map_err(
        |reason| {
            tracing::debug!(actor = %actor.id, %reason, "Rejected request signature");
            AppError::Authentication
        },
    )
}

pub(crate) fn verify_request_at(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    actor: &Actor,
    replay_window: Duration,
    now: DateTime<Utc>,
) -> Result<(), Rejection> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };

    let signature_header = headers
        .get("signature")
        .ok_or(Rejection::MissingSignature)?
        .to_str()
        .map_err(|_| Rejection::Malformed("not ASCII"))?;
    let parsed = parse_signature_header(signature_header)?;

    // 1. keyId must be the one the actor publishes.
    match actor.public_key_id() {
        Some(published) if published == parsed.key_id => {}
        _ => return Err(Rejection::KeyMismatch),
    }

    // 2. Rebuild the signing string in the signer's order.
    let signing_string = parsed
        .headers
        .iter()
        .filter(|name| RECOGNIZED_HEADERS.contains(&name.as_str()))
        .map(|name| match name.as_str() {
            "(request-target)" => format!("{}: {} {}", name, method.to_lowercase(), path),
            other => format!("{}: {}", other, header_value(other)),
        })
        .collect::<Vec<_>>()
        .join("\n");

    // 3. Replay window.
    let date = DateTime::parse_from_rfc2822(&header_value("date"))
        .map_err(|_| Rejection::MissingDate)?;
    let skew = (now.timestamp() - date.timestamp()).abs();
    if skew > replay_window.as_secs() as i64 {
        return Err(Rejection::StaleDate(skew));
    }

    // 4. Body integrity, when the peer sent a digest.
    if let (Some(body), Some(digest)) = (body, headers.get("digest")) {
        if digest.to_str().ok() != Some(generate_digest(body).as_str()) {
            return Err(Rejection::DigestMismatch);
        }
    }

    // 5. RSA check.
    let public_key_pem = actor
        .public_key
        .as_ref()
        .map(|key| key.public_key_pem.as_str())
        .unwrap_or_default();
    let public_key = parse_public_key(public_key_pem).ok_or(Rejection::BadPublicKey)?;

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| Rejection::BadSignature)?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| Rejection::BadSignature)?;

    rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key)
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| Rejection::BadSignature)
}

/// SubjectPublicKeyInfo PEM, falling back to PKCS#1.
pub fn parse_public_key(pem: &str) -> Option<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .ok()
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Signed header names, in signing order
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, Rejection> {
    let mut key_id = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            let value = value.trim().trim_matches('"');

            match key.trim() {
                "keyId" => key_id = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or(Rejection::Malformed("missing keyId"))?,
        // Per draft-cavage, an absent list means only `date` was signed.
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature.ok_or(Rejection::Malformed("missing signature"))?,
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
