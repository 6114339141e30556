//! Signed configuration bundles.
//!
//! A bundle wraps config bytes in an envelope carrying version metadata, the
//! config hash, and an Ed25519 signature. The signature covers
//! `SHA-256(canonical_json(meta) || SHA-256(config_bytes))`, where canonical
//! JSON means sorted keys, no insignificant whitespace, UTF-8 — the same
//! form on the signing and verifying side, regardless of language.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat, Utc};
use ring::digest;
use ring::signature::{self, Ed25519KeyPair};
use serde::{Deserialize, Serialize};

pub const ED25519_PUBLIC_KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleMeta {
	pub version: String,
	/// RFC3339 with nanoseconds.
	pub created_at: String,
	pub source: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub notes: Option<String>,
}

impl BundleMeta {
	pub fn new(version: impl Into<String>, source: impl Into<String>, at: DateTime<Utc>) -> Self {
		BundleMeta {
			version: version.into(),
			created_at: at.to_rfc3339_opts(SecondsFormat::Nanos, true),
			source: source.into(),
			notes: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bundle {
	pub meta: BundleMeta,
	pub config_bytes_b64: String,
	/// Hex SHA-256 of the raw config bytes.
	pub config_sha256: String,
	pub signature_b64: String,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
	#[error("bundle encoding is invalid")]
	BadEncoding,
	#[error("config hash mismatch")]
	BadHash,
	#[error("signature verification failed")]
	BadSignature,
	#[error("ed25519 public key must be {ED25519_PUBLIC_KEY_LEN} bytes, got {0}")]
	BadKey(usize),
}

impl VerifyError {
	/// Metric label for `bundle_verify_total`.
	pub fn as_label(&self) -> &'static str {
		match self {
			VerifyError::BadEncoding => "bad_encoding",
			VerifyError::BadHash => "bad_hash",
			VerifyError::BadSignature => "bad_sig",
			VerifyError::BadKey(_) => "bad_key",
		}
	}
}

/// Canonical JSON: serde_json maps are BTreeMap-backed, so serializing the
/// Value form yields sorted keys with no whitespace.
fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, VerifyError> {
	let value = serde_json::to_value(value).map_err(|_| VerifyError::BadEncoding)?;
	serde_json::to_vec(&value).map_err(|_| VerifyError::BadEncoding)
}

fn signing_input(meta: &BundleMeta, config_hash: &[u8]) -> Result<Vec<u8>, VerifyError> {
	let mut buf = canonical_json(meta)?;
	buf.extend_from_slice(config_hash);
	Ok(digest::digest(&digest::SHA256, &buf).as_ref().to_vec())
}

/// Verifies a bundle against the configured public key and returns the
/// config bytes.
pub fn verify(bundle: &Bundle, public_key: &[u8]) -> Result<Vec<u8>, VerifyError> {
	if public_key.len() != ED25519_PUBLIC_KEY_LEN {
		return Err(VerifyError::BadKey(public_key.len()));
	}
	let config_bytes = BASE64
		.decode(bundle.config_bytes_b64.as_bytes())
		.map_err(|_| VerifyError::BadEncoding)?;
	let config_hash = digest::digest(&digest::SHA256, &config_bytes);
	if !hex::encode(config_hash.as_ref()).eq_ignore_ascii_case(&bundle.config_sha256) {
		return Err(VerifyError::BadHash);
	}
	let signature = BASE64
		.decode(bundle.signature_b64.as_bytes())
		.map_err(|_| VerifyError::BadEncoding)?;
	let input = signing_input(&bundle.meta, config_hash.as_ref())?;
	signature::UnparsedPublicKey::new(&signature::ED25519, public_key)
		.verify(&input, &signature)
		.map_err(|_| VerifyError::BadSignature)?;
	Ok(config_bytes)
}

/// Produces a signed bundle; the counterpart of [verify], used by bundle
/// tooling and tests.
pub fn sign(config_bytes: &[u8], meta: BundleMeta, key: &Ed25519KeyPair) -> Result<Bundle, VerifyError> {
	let config_hash = digest::digest(&digest::SHA256, config_bytes);
	let input = signing_input(&meta, config_hash.as_ref())?;
	let signature = key.sign(&input);
	Ok(Bundle {
		meta,
		config_bytes_b64: BASE64.encode(config_bytes),
		config_sha256: hex::encode(config_hash.as_ref()),
		signature_b64: BASE64.encode(signature.as_ref()),
	})
}

/// Decodes persisted key material: raw bytes, or base64 with optional
/// trailing whitespace.
pub fn decode_key_material(bytes: &[u8], expected_lens: &[usize]) -> Result<Vec<u8>, VerifyError> {
	if expected_lens.contains(&bytes.len()) {
		return Ok(bytes.to_vec());
	}
	let trimmed: &[u8] = {
		let s = bytes;
		let end = s
			.iter()
			.rposition(|b| !b.is_ascii_whitespace())
			.map(|i| i + 1)
			.unwrap_or(0);
		&s[..end]
	};
	let decoded = BASE64
		.decode(trimmed)
		.map_err(|_| VerifyError::BadEncoding)?;
	if expected_lens.contains(&decoded.len()) {
		Ok(decoded)
	} else {
		Err(VerifyError::BadKey(decoded.len()))
	}
}

pub fn load_public_key(bytes: &[u8]) -> Result<Vec<u8>, VerifyError> {
	decode_key_material(bytes, &[ED25519_PUBLIC_KEY_LEN])
}

/// Loads a signing key from a 32-byte seed or a 64-byte seed||public blob.
pub fn load_signing_key(bytes: &[u8]) -> Result<Ed25519KeyPair, VerifyError> {
	let material = decode_key_material(bytes, &[32, 64])?;
	match material.len() {
		32 => Ed25519KeyPair::from_seed_unchecked(&material).map_err(|_| VerifyError::BadKey(32)),
		64 => Ed25519KeyPair::from_seed_and_public_key(&material[..32], &material[32..])
			.map_err(|_| VerifyError::BadKey(64)),
		n => Err(VerifyError::BadKey(n)),
	}
}
