//! Loading, signing and verification of JWK-keyed JWS envelopes.
//!
//! This crate is deliberately pure: no logger, no shared state, no `OnceCell`.
//! Every operation takes what it needs as an argument and returns a `Result`.
//! Callers log around it, matching the "process-wide logger" design note being
//! resolved in favor of plain dependency injection rather than a global sink.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as b64url;
use picky::key::{PrivateKey, PublicKey};
use picky::signature::SignatureAlgorithm;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("couldn't read key file {path}")]
    Io {
        path: camino::Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("couldn't parse JWK")]
    Parse(#[source] serde_json::Error),
    #[error("JWK uses unsupported key type {kty} (only OKP/Ed25519 is supported)")]
    UnsupportedKeyType { kty: String },
    #[error("key file does not contain a private key")]
    NotPrivate,
    #[error("invalid key material")]
    BadKeyMaterial(#[source] picky::key::KeyError),
    #[error("signing failed")]
    Crypto(#[source] picky::signature::SignatureError),
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("payload is not a well-formed JWS envelope")]
    NotAJws(#[source] serde_json::Error),
    #[error("JWS envelope carries no signature")]
    NoSignature,
    #[error("JWS signature is missing a `kid` header")]
    NoKid,
    #[error("unsupported JWS algorithm {alg} (only EdDSA is supported)")]
    UnsupportedAlgorithm { alg: String },
}

/// Private half of an asymmetric key, used by a downbridge to sign outgoing payloads.
pub struct SigningKey {
    private: PrivateKey,
    public_raw: [u8; 32],
    kid: Option<String>,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey").field("kid", &self.kid).finish_non_exhaustive()
    }
}

/// Public half of an asymmetric key, used by an upbridge to verify incoming payloads.
#[derive(Clone)]
pub struct ValidationKey {
    public: PublicKey,
    raw: [u8; 32],
    kid: Option<String>,
}

impl fmt::Debug for ValidationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationKey").field("kid", &self.kid).finish_non_exhaustive()
    }
}

impl ValidationKey {
    /// The `kid` embedded in the JWK itself, if any.
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// RFC 7638 JWK thumbprint of the canonical OKP member set, base64url (no padding).
    pub fn thumbprint(&self) -> String {
        // Canonical JSON per RFC 7638: lexicographic member order, no whitespace.
        let canonical = format!(
            r#"{{"crv":"Ed25519","kty":"OKP","x":"{}"}}"#,
            b64url.encode(self.raw)
        );
        let digest = Sha256::digest(canonical.as_bytes());
        b64url.encode(digest)
    }
}

/// On-disk JWK representation for an OKP (Ed25519) key, per RFC 8037.
#[derive(Serialize, Deserialize)]
struct RawJwk {
    kty: String,
    crv: Option<String>,
    x: Option<String>,
    d: Option<String>,
    kid: Option<String>,
}

fn decode_component(field: &str, value: &str) -> Result<[u8; 32], KeyError> {
    let bytes = b64url
        .decode(value)
        .map_err(|_| KeyError::Parse(serde::de::Error::custom(format!("invalid base64url in `{field}`"))))?;
    bytes
        .try_into()
        .map_err(|_| KeyError::Parse(serde::de::Error::custom(format!("`{field}` is not 32 bytes"))))
}

fn parse_jwk(bytes: &[u8]) -> Result<RawJwk, KeyError> {
    let jwk: RawJwk = serde_json::from_slice(bytes).map_err(KeyError::Parse)?;
    if jwk.kty != "OKP" || jwk.crv.as_deref() != Some("Ed25519") {
        return Err(KeyError::UnsupportedKeyType { kty: jwk.kty.clone() });
    }
    Ok(jwk)
}

/// Load a private signing key from a JWK file at `path`.
pub fn load_signing(path: &camino::Utf8Path) -> Result<SigningKey, KeyError> {
    let bytes = std::fs::read(path).map_err(|source| KeyError::Io { path: path.to_owned(), source })?;
    let jwk = parse_jwk(&bytes)?;
    let Some(d) = jwk.d.as_deref() else {
        return Err(KeyError::NotPrivate);
    };
    let private_raw = decode_component("d", d)?;
    let public_raw = match jwk.x.as_deref() {
        Some(x) => decode_component("x", x)?,
        None => picky::key::ed25519_public_from_private(&private_raw).map_err(KeyError::BadKeyMaterial)?,
    };
    let private = PrivateKey::from_ed25519_bytes(&private_raw).map_err(KeyError::BadKeyMaterial)?;
    Ok(SigningKey { private, public_raw, kid: jwk.kid })
}

/// Load a validation key from a JWK file at `path`. If the file contains a private
/// key, the public half is derived and returned (signing keys double as their own
/// validation counterpart when testing a bridge against itself).
pub fn load_validation(path: &camino::Utf8Path) -> Result<ValidationKey, KeyError> {
    let bytes = std::fs::read(path).map_err(|source| KeyError::Io { path: path.to_owned(), source })?;
    parse_validation(&bytes)
}

/// Parse a validation key from raw JWK bytes, deriving the public half if the
/// document happens to carry private material.
pub fn parse_validation(bytes: &[u8]) -> Result<ValidationKey, KeyError> {
    let jwk = parse_jwk(bytes)?;
    let raw = match (jwk.x.as_deref(), jwk.d.as_deref()) {
        (Some(x), _) => decode_component("x", x)?,
        (None, Some(d)) => {
            let private_raw = decode_component("d", d)?;
            picky::key::ed25519_public_from_private(&private_raw).map_err(KeyError::BadKeyMaterial)?
        }
        (None, None) => return Err(KeyError::Parse(serde::de::Error::custom("JWK has neither `x` nor `d`"))),
    };
    let public = PublicKey::from_ed25519_bytes(&raw).map_err(KeyError::BadKeyMaterial)?;
    Ok(ValidationKey { public, raw, kid: jwk.kid })
}

#[derive(Serialize)]
struct ProtectedHeader<'a> {
    alg: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
}

/// Flattened JSON Serialization of a JWS (RFC 7515 §7.2.2), the only form this
/// bridge ever produces; `verify`/`extract_kid` also accept the general form
/// since a counterpart implementation is free to emit it.
#[derive(Serialize, Deserialize)]
struct FlattenedJws {
    payload: String,
    protected: String,
    signature: String,
}

#[derive(Deserialize)]
struct GeneralJwsSignature {
    protected: String,
    signature: String,
}

#[derive(Deserialize)]
struct GeneralJws {
    payload: String,
    signatures: Vec<GeneralJwsSignature>,
}

enum ParsedJws {
    Flattened(FlattenedJws),
    General(GeneralJws),
}

fn parse_jws(bytes: &[u8]) -> Result<ParsedJws, KeyError> {
    if let Ok(flattened) = serde_json::from_slice::<FlattenedJws>(bytes) {
        return Ok(ParsedJws::Flattened(flattened));
    }
    serde_json::from_slice::<GeneralJws>(bytes)
        .map(ParsedJws::General)
        .map_err(KeyError::NotAJws)
}

#[derive(Deserialize)]
struct ProtectedHeaderOwned {
    alg: String,
    kid: Option<String>,
}

fn decode_protected_header(protected_b64: &str) -> Result<ProtectedHeaderOwned, KeyError> {
    let raw = b64url
        .decode(protected_b64)
        .map_err(|_| KeyError::NotAJws(serde::de::Error::custom("invalid base64url protected header")))?;
    serde_json::from_slice(&raw).map_err(|_| KeyError::NotAJws(serde::de::Error::custom("invalid protected header JSON")))
}

/// Map a JWS `alg` header value to the `picky` algorithm it names. The only
/// key type this crate ever loads is OKP/Ed25519, so `EdDSA` is the only
/// value accepted; anything else is rejected rather than silently verified
/// as Ed25519.
fn signature_algorithm_for(alg: &str) -> Result<SignatureAlgorithm, KeyError> {
    match alg {
        "EdDSA" => Ok(SignatureAlgorithm::Ed25519),
        other => Err(KeyError::UnsupportedAlgorithm { alg: other.to_owned() }),
    }
}

/// Produce a JSON-serialized (flattened) JWS over `payload`, using EdDSA as declared
/// by `key`'s own algorithm.
pub fn sign(payload: &[u8], key: &SigningKey) -> Result<Vec<u8>, KeyError> {
    let protected_header = ProtectedHeader { alg: "EdDSA", kid: key.kid.as_deref() };
    let algorithm = signature_algorithm_for(protected_header.alg)?;
    let protected = b64url.encode(serde_json::to_vec(&protected_header).expect("header serializes"));
    let payload_b64 = b64url.encode(payload);
    let signing_input = format!("{protected}.{payload_b64}");

    let signature = algorithm
        .sign(signing_input.as_bytes(), &key.private)
        .map_err(KeyError::Crypto)?;

    let envelope = FlattenedJws {
        payload: payload_b64,
        protected,
        signature: b64url.encode(signature),
    };

    serde_json::to_vec(&envelope).map_err(|_| unreachable!("envelope always serializes"))
}

struct FirstSignature {
    protected: String,
    signature: String,
}

fn first_signature(parsed: &ParsedJws) -> Result<FirstSignature, KeyError> {
    match parsed {
        ParsedJws::Flattened(flattened) => Ok(FirstSignature {
            protected: flattened.protected.clone(),
            signature: flattened.signature.clone(),
        }),
        ParsedJws::General(general) => {
            let first = general.signatures.first().ok_or(KeyError::NoSignature)?;
            Ok(FirstSignature {
                protected: first.protected.clone(),
                signature: first.signature.clone(),
            })
        }
    }
}

fn payload_of(parsed: &ParsedJws) -> &str {
    match parsed {
        ParsedJws::Flattened(flattened) => &flattened.payload,
        ParsedJws::General(general) => &general.payload,
    }
}

/// Verify `bytes` as a JWS against `key`, returning the protected payload on success.
pub fn verify(bytes: &[u8], key: &ValidationKey) -> Result<Vec<u8>, KeyError> {
    let parsed = parse_jws(bytes)?;
    let sig = first_signature(&parsed)?;
    let header = decode_protected_header(&sig.protected)?;
    let algorithm = signature_algorithm_for(&header.alg)?;

    let signature = b64url
        .decode(&sig.signature)
        .map_err(|_| KeyError::NotAJws(serde::de::Error::custom("invalid base64url signature")))?;
    let payload_b64 = payload_of(&parsed);
    let signing_input = format!("{}.{}", sig.protected, payload_b64);

    algorithm
        .verify(signing_input.as_bytes(), &signature, &key.public)
        .map_err(|_| KeyError::VerificationFailed)?;

    b64url
        .decode(payload_b64)
        .map_err(|_| KeyError::NotAJws(serde::de::Error::custom("invalid base64url payload")))
}

/// Parse `bytes` as a JWS and return the `kid` carried by its first signature.
pub fn extract_kid(bytes: &[u8]) -> Result<String, KeyError> {
    let parsed = parse_jws(bytes)?;
    let sig = first_signature(&parsed)?;
    let header = decode_protected_header(&sig.protected)?;
    header.kid.filter(|kid| !kid.is_empty()).ok_or(KeyError::NoKid)
}

#[cfg(test)]
mod test {
    use super::*;

    fn write_jwk(dir: &tempfile::TempDir, name: &str, contents: &str) -> camino::Utf8PathBuf {
        let path = camino::Utf8PathBuf::try_from(dir.path().join(name)).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn keypair() -> (String, String) {
        // Fixed Ed25519 keypair for deterministic tests (32-byte seed, derived public key).
        let seed = [7u8; 32];
        let public = picky::key::ed25519_public_from_private(&seed).unwrap();
        (b64url.encode(seed), b64url.encode(public))
    }

    #[test]
    fn sign_then_verify_round_trip() {
        let (d, x) = keypair();
        let dir = tempfile::tempdir().unwrap();
        let signing_path = write_jwk(
            &dir,
            "signing.jwk",
            &format!(r#"{{"kty":"OKP","crv":"Ed25519","x":"{x}","d":"{d}","kid":"k1"}}"#),
        );
        let validation_path = write_jwk(&dir, "validation.jwk", &format!(r#"{{"kty":"OKP","crv":"Ed25519","x":"{x}"}}"#));

        let signing_key = load_signing(&signing_path).unwrap();
        let validation_key = load_validation(&validation_path).unwrap();

        let payload = br#"{"foo":"bar"}"#;
        let envelope = sign(payload, &signing_key).unwrap();
        let roundtripped = verify(&envelope, &validation_key).unwrap();

        assert_eq!(roundtripped, payload);
        assert_eq!(extract_kid(&envelope).unwrap(), "k1");
    }

    #[test]
    fn load_signing_rejects_public_only_jwk() {
        let (_, x) = keypair();
        let dir = tempfile::tempdir().unwrap();
        let path = write_jwk(&dir, "pub.jwk", &format!(r#"{{"kty":"OKP","crv":"Ed25519","x":"{x}"}}"#));
        assert!(matches!(load_signing(&path), Err(KeyError::NotPrivate)));
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let (d, x) = keypair();
        let dir = tempfile::tempdir().unwrap();
        let signing_path = write_jwk(
            &dir,
            "signing.jwk",
            &format!(r#"{{"kty":"OKP","crv":"Ed25519","x":"{x}","d":"{d}"}}"#),
        );
        let validation_path = write_jwk(&dir, "validation.jwk", &format!(r#"{{"kty":"OKP","crv":"Ed25519","x":"{x}"}}"#));

        let signing_key = load_signing(&signing_path).unwrap();
        let validation_key = load_validation(&validation_path).unwrap();

        let mut envelope: serde_json::Value = serde_json::from_slice(&sign(b"{}", &signing_key).unwrap()).unwrap();
        envelope["payload"] = serde_json::Value::String(b64url.encode(b"{\"tampered\":true}"));
        let tampered = serde_json::to_vec(&envelope).unwrap();

        assert!(matches!(verify(&tampered, &validation_key), Err(KeyError::VerificationFailed)));
    }

    #[test]
    fn verify_rejects_declared_algorithm_other_than_eddsa() {
        let (d, x) = keypair();
        let dir = tempfile::tempdir().unwrap();
        let signing_path = write_jwk(
            &dir,
            "signing.jwk",
            &format!(r#"{{"kty":"OKP","crv":"Ed25519","x":"{x}","d":"{d}"}}"#),
        );
        let validation_path = write_jwk(&dir, "validation.jwk", &format!(r#"{{"kty":"OKP","crv":"Ed25519","x":"{x}"}}"#));

        let signing_key = load_signing(&signing_path).unwrap();
        let validation_key = load_validation(&validation_path).unwrap();

        let mut envelope: serde_json::Value = serde_json::from_slice(&sign(b"{}", &signing_key).unwrap()).unwrap();
        let forged_header = b64url.encode(br#"{"alg":"HS256"}"#);
        envelope["protected"] = serde_json::Value::String(forged_header);
        let forged = serde_json::to_vec(&envelope).unwrap();

        assert!(matches!(
            verify(&forged, &validation_key),
            Err(KeyError::UnsupportedAlgorithm { alg }) if alg == "HS256"
        ));
    }

    #[test]
    fn extract_kid_rejects_malformed_json() {
        assert!(matches!(extract_kid(b"not json"), Err(KeyError::NotAJws(_))));
    }

    #[test]
    fn thumbprint_is_stable_for_same_key() {
        let (_, x) = keypair();
        let dir = tempfile::tempdir().unwrap();
        let path = write_jwk(&dir, "pub.jwk", &format!(r#"{{"kty":"OKP","crv":"Ed25519","x":"{x}"}}"#));
        let key_a = load_validation(&path).unwrap();
        let key_b = load_validation(&path).unwrap();
        assert_eq!(key_a.thumbprint(), key_b.thumbprint());
    }
}
