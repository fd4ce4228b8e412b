//! Canonical signing engine.
//!
//! Canonicalization and signing are pure functions over explicit inputs
//! (parameter mapping, key material). They never reach into ambient
//! configuration, so every adapter shares the same byte-exact message
//! construction and the functions stay independently testable.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use percent_encoding::percent_decode_str;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::{GatewayError, GatewayResult};

/// Digest algorithm for the shared-secret network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignType {
    Md5,
    HmacSha256,
}

impl SignType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignType::Md5 => "MD5",
            SignType::HmacSha256 => "HMAC-SHA256",
        }
    }
}

/// Builds the canonical message string for signing.
///
/// Entries are joined as `key=value` pairs with `&` in ascending key order
/// (the `BTreeMap` already holds them sorted), then percent-decoded, since
/// both counterparties canonicalize over the decoded text. The `sign` and
/// `sign_type` fields are stripped unless the caller asks to keep them;
/// empty values are kept — omission is provider policy, applied by the
/// caller via [`strip_empty`] before signing.
pub fn sign_text(
    params: &BTreeMap<String, String>,
    keep_sign: bool,
    keep_sign_type: bool,
) -> String {
    let message = params
        .iter()
        .filter(|(k, _)| {
            if !keep_sign && k.as_str() == "sign" {
                return false;
            }
            if !keep_sign_type && k.as_str() == "sign_type" {
                return false;
            }
            true
        })
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    percent_decode_str(&message).decode_utf8_lossy().into_owned()
}

/// Drops entries with empty values. The shared-secret network excludes
/// empty fields from its canonical form.
pub fn strip_empty(params: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    params
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Keyed-digest signature for the shared-secret network.
///
/// Canonical form excludes the `sign` field only, the shared secret is
/// appended as a trailing `&key=<secret>` segment, and the hex output is
/// uppercased. The counterparty computes the identical bytes, so casing and
/// the trailing-key convention must not change.
pub fn keyed_sign(
    params: &BTreeMap<String, String>,
    secret: &str,
    sign_type: SignType,
) -> String {
    let message = format!("{}&key={}", sign_text(params, false, true), secret);
    let digest = match sign_type {
        SignType::Md5 => {
            let mut hasher = Md5::new();
            hasher.update(message.as_bytes());
            hex::encode(hasher.finalize())
        }
        SignType::HmacSha256 => {
            let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
                Ok(mac) => mac,
                // HMAC accepts keys of any length; unreachable for valid input.
                Err(_) => return String::new(),
            };
            mac.update(message.as_bytes());
            hex::encode(mac.finalize().into_bytes())
        }
    };
    digest.to_uppercase()
}

fn parse_private_key(pem: &str) -> GatewayResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|_| GatewayError::Configuration {
            message: "signing private key is not a usable RSA key".to_string(),
        })
}

fn parse_public_key(pem: &str) -> GatewayResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|_| GatewayError::Configuration {
            message: "counterparty public key is not a usable RSA key".to_string(),
        })
}

/// RSA2 (SHA-256 with RSA, PKCS#1 v1.5) signature over the canonical
/// message, base64-encoded for the wire.
pub fn rsa2_sign(private_key_pem: &str, message: &str) -> GatewayResult<String> {
    let key = parse_private_key(private_key_pem)?;
    let signing_key = SigningKey::<Sha256>::new(key);
    let signature = signing_key
        .try_sign(message.as_bytes())
        .map_err(|_| GatewayError::Configuration {
            message: "RSA signing failed with the configured private key".to_string(),
        })?;
    Ok(BASE64.encode(signature.to_bytes()))
}

/// Verifies an RSA2 signature. Any decode or verification failure is a
/// `SignatureMismatch`; a bad key is a `Configuration` error.
pub fn rsa2_verify(
    public_key_pem: &str,
    message: &str,
    signature_b64: &str,
) -> GatewayResult<()> {
    let key = parse_public_key(public_key_pem)?;
    let verifying_key = VerifyingKey::<Sha256>::new(key);

    let raw = BASE64
        .decode(signature_b64.trim())
        .map_err(|_| GatewayError::SignatureMismatch {
            message: "signature is not valid base64".to_string(),
        })?;
    let signature =
        Signature::try_from(raw.as_slice()).map_err(|_| GatewayError::SignatureMismatch {
            message: "signature has an invalid length".to_string(),
        })?;

    verifying_key
        .verify(message.as_bytes(), &signature)
        .map_err(|_| GatewayError::SignatureMismatch {
            message: "RSA signature does not match canonical message".to_string(),
        })
}

/// Fresh 32-character alphanumeric nonce for request replay protection.
pub fn generate_nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Constant-time byte comparison for signature checks.
pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    fn params(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn sign_text_sorts_and_strips_sign_fields() {
        let input = params(&[
            ("b_field", "2"),
            ("a_field", "1"),
            ("sign", "SIG"),
            ("sign_type", "RSA2"),
        ]);
        assert_eq!(sign_text(&input, false, false), "a_field=1&b_field=2");
        assert_eq!(
            sign_text(&input, false, true),
            "a_field=1&b_field=2&sign_type=RSA2"
        );
        assert_eq!(
            sign_text(&input, true, true),
            "a_field=1&b_field=2&sign=SIG&sign_type=RSA2"
        );
    }

    #[test]
    fn sign_text_is_stable_under_input_reordering() {
        let forward = params(&[("alpha", "1"), ("beta", "2"), ("gamma", "3")]);
        let reversed = params(&[("gamma", "3"), ("beta", "2"), ("alpha", "1")]);
        assert_eq!(
            sign_text(&forward, false, false),
            sign_text(&reversed, false, false)
        );
    }

    #[test]
    fn sign_text_percent_decodes_joined_message() {
        let input = params(&[("subject", "abc%20def")]);
        assert_eq!(sign_text(&input, false, false), "subject=abc def");
    }

    #[test]
    fn sign_text_keeps_empty_values() {
        let input = params(&[("empty", ""), ("full", "x")]);
        assert_eq!(sign_text(&input, false, false), "empty=&full=x");
        assert_eq!(sign_text(&strip_empty(&input), false, false), "full=x");
    }

    #[test]
    fn keyed_sign_matches_reference_digest() {
        // MD5("appid=A&mch_id=M&nonce_str=n1&key=K"), uppercased.
        let input = params(&[("appid", "A"), ("mch_id", "M"), ("nonce_str", "n1")]);
        let expected = {
            let mut hasher = Md5::new();
            hasher.update(b"appid=A&mch_id=M&nonce_str=n1&key=K");
            hex::encode(hasher.finalize()).to_uppercase()
        };
        assert_eq!(keyed_sign(&input, "K", SignType::Md5), expected);
    }

    #[test]
    fn keyed_sign_excludes_prior_sign_field() {
        let without = params(&[("appid", "A"), ("nonce_str", "n1")]);
        let mut with = without.clone();
        with.insert("sign".to_string(), "STALE".to_string());
        assert_eq!(
            keyed_sign(&without, "K", SignType::Md5),
            keyed_sign(&with, "K", SignType::Md5)
        );
    }

    #[test]
    fn keyed_sign_output_is_uppercase_hex() {
        let input = params(&[("appid", "A")]);
        let sign = keyed_sign(&input, "secret", SignType::Md5);
        assert_eq!(sign.len(), 32);
        assert!(sign
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    fn test_keypair() -> (String, String) {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("keygen");
        let public = RsaPublicKey::from(&private);
        (
            private
                .to_pkcs8_pem(LineEnding::LF)
                .expect("private pem")
                .to_string(),
            public
                .to_public_key_pem(LineEnding::LF)
                .expect("public pem"),
        )
    }

    #[test]
    fn rsa2_sign_verify_round_trip_and_tamper_detection() {
        let (private_pem, public_pem) = test_keypair();
        let message = "a_field=1&b_field=2&sign_type=RSA2";

        let signature = rsa2_sign(&private_pem, message).expect("sign");
        rsa2_verify(&public_pem, message, &signature).expect("verify");

        // One changed byte in the canonical message must fail verification.
        let tampered = "a_field=1&b_field=3&sign_type=RSA2";
        assert!(matches!(
            rsa2_verify(&public_pem, tampered, &signature),
            Err(GatewayError::SignatureMismatch { .. })
        ));
    }

    #[test]
    fn rsa2_verify_rejects_garbage_signature() {
        let (_, public_pem) = test_keypair();
        assert!(matches!(
            rsa2_verify(&public_pem, "m", "not base64 !!!"),
            Err(GatewayError::SignatureMismatch { .. })
        ));
    }

    #[test]
    fn rsa2_sign_with_bad_key_is_configuration_error() {
        assert!(matches!(
            rsa2_sign("not a pem", "message"),
            Err(GatewayError::Configuration { .. })
        ));
    }

    #[test]
    fn nonces_are_32_chars_and_distinct() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn secure_eq_behaves_correctly() {
        assert!(secure_eq(b"abc", b"abc"));
        assert!(!secure_eq(b"abc", b"abd"));
        assert!(!secure_eq(b"abc", b"ab"));
    }
}
