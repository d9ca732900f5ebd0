//! DKIM signing (rsa-sha256, simple/simple canonicalization).
//!
//! The body hash covers the message body plus a trailing CRLF; the
//! signature covers the existing header block with the unsigned
//! `DKIM-Signature` header appended, and the finished signature line is
//! prepended to the message.

use base64::Engine;
use ring::{rand::SystemRandom, signature::RsaKeyPair};
use sha2::{Digest, Sha256};

use crate::parser::parse_mail_headers;

/// `bh=`: base64 of sha256 over the body with one CRLF appended.
pub fn body_hash(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hasher.update(b"\r\n");
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// The `DKIM-Signature` value up to and including `b=`, ready for signing.
pub fn signature_value(
    domain: &str,
    selector: &str,
    header_names: &str,
    body_hash: &str,
    now: i64,
) -> String {
    format!(
        "v=1; a=rsa-sha256; c=simple/simple; d={}; s={}; t={}; x={}; h={}; bh={}; b=",
        domain,
        selector,
        now,
        now + 3600,
        header_names,
        body_hash
    )
}

fn signing_key(privkey_pem: &[u8]) -> Result<RsaKeyPair, String> {
    let mut reader = std::io::BufReader::new(privkey_pem);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| format!("reading DKIM key: {e}"))?;
    let der = match keys.into_iter().next() {
        Some(der) => der,
        None => {
            let mut reader = std::io::BufReader::new(privkey_pem);
            rustls_pemfile::rsa_private_keys(&mut reader)
                .map_err(|e| format!("reading DKIM key: {e}"))?
                .into_iter()
                .next()
                .ok_or_else(|| "no private key in DKIM key file".to_owned())?
        }
    };
    RsaKeyPair::from_pkcs8(&der)
        .or_else(|_| RsaKeyPair::from_der(&der))
        .map_err(|e| format!("unusable DKIM key: {e}"))
}

/// Sign `eml` and return it with the `DKIM-Signature` line prepended.
pub fn sign(
    eml: &[u8],
    privkey_pem: &[u8],
    domain: &str,
    selector: &str,
    now: i64,
) -> Result<Vec<u8>, String> {
    let text = String::from_utf8_lossy(eml);
    let (header, body) = match text.split_once("\r\n\r\n") {
        Some((header, body)) => (header, body),
        None => (text.as_ref(), ""),
    };

    let bh = body_hash(body.as_bytes());
    let (headers, _) = parse_mail_headers(&format!("{header}\r\n\r\n"));
    let header_names = headers
        .iter()
        .map(|(key, _)| key.as_str())
        .collect::<Vec<_>>()
        .join(":");

    let dkim_value = signature_value(domain, selector, &header_names, &bh, now);
    let canonical = format!("{header}\r\nDKIM-Signature: {dkim_value}");

    let key = signing_key(privkey_pem)?;
    let mut signature = vec![0u8; key.public_modulus_len()];
    key.sign(
        &ring::signature::RSA_PKCS1_SHA256,
        &SystemRandom::new(),
        canonical.as_bytes(),
        &mut signature,
    )
    .map_err(|e| format!("signing failed: {e}"))?;
    let b = base64::engine::general_purpose::STANDARD.encode(&signature);

    let mut out = Vec::with_capacity(eml.len() + dkim_value.len() + b.len() + 32);
    out.extend_from_slice(b"DKIM-Signature: ");
    out.extend_from_slice(dkim_value.as_bytes());
    out.extend_from_slice(b.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(eml);
    Ok(out)
}
