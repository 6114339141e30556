//! Listener TLS compilation.
//!
//! Produced once per snapshot: server certificates keyed by SNI, optional
//! client certificate verification against the union of the listener CA and
//! every route-level mTLS CA. Per-route CA pinning happens later, at the
//! request gate, by issuer comparison.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rustls::ServerConfig;
use rustls::crypto::CryptoProvider;
use rustls::server::{ResolvesServerCertUsingSni, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tracing::debug;

use crate::config::TlsConfig;

pub static ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
	&[&rustls::version::TLS12, &rustls::version::TLS13];

static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

fn provider(cipher_suites: &[String]) -> CryptoProvider {
	let mut provider = rustls::crypto::ring::default_provider();
	if !cipher_suites.is_empty() {
		let wanted: Vec<String> = cipher_suites.iter().map(|s| s.to_ascii_uppercase()).collect();
		provider
			.cipher_suites
			.retain(|s| wanted.contains(&format!("{:?}", s.suite()).to_ascii_uppercase()));
	}
	provider
}

fn versions(min_version: Option<&str>) -> &'static [&'static rustls::SupportedProtocolVersion] {
	match min_version {
		Some("1.3") => TLS13_ONLY,
		_ => ALL_TLS_VERSIONS,
	}
}

pub fn load_certs(path: impl AsRef<Path>) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let path = path.as_ref();
	let mut reader = std::io::BufReader::new(
		std::fs::File::open(path).with_context(|| format!("open cert {}", path.display()))?,
	);
	let certs = rustls_pemfile::certs(&mut reader)
		.collect::<Result<Vec<_>, _>>()
		.with_context(|| format!("parse certs in {}", path.display()))?;
	anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
	Ok(certs)
}

pub fn load_key(path: impl AsRef<Path>) -> anyhow::Result<PrivateKeyDer<'static>> {
	let path = path.as_ref();
	let mut reader = std::io::BufReader::new(
		std::fs::File::open(path).with_context(|| format!("open key {}", path.display()))?,
	);
	rustls_pemfile::private_key(&mut reader)
		.with_context(|| format!("parse key in {}", path.display()))?
		.ok_or_else(|| anyhow::anyhow!("no private key in {}", path.display()))
}

/// Subject DN of the first certificate in a PEM file. Routes pin their mTLS
/// CA by this value.
pub fn ca_subject(path: impl AsRef<Path>) -> anyhow::Result<String> {
	let certs = load_certs(&path)?;
	let (_, cert) = x509_parser::parse_x509_certificate(certs[0].as_ref())
		.map_err(|e| anyhow::anyhow!("parse CA certificate: {e}"))?;
	Ok(cert.subject().to_string())
}

/// Builds the listener's rustls config for one snapshot.
///
/// `client_ca_files` is the union of the listener-level CA and every
/// route-level mTLS CA; when empty, no client certificate is requested.
pub fn build_server_config(
	tls: &TlsConfig,
	client_ca_files: &[String],
) -> anyhow::Result<Arc<ServerConfig>> {
	let provider = Arc::new(provider(&tls.cipher_suites));
	anyhow::ensure!(
		!provider.cipher_suites.is_empty(),
		"cipher suite filter removed every suite"
	);

	let mut resolver = ResolvesServerCertUsingSni::new();
	for cert in &tls.certs {
		let chain = load_certs(&cert.cert_file)?;
		let key = load_key(&cert.key_file)?;
		let signing_key = provider
			.key_provider
			.load_private_key(key)
			.map_err(|e| anyhow::anyhow!("load key for {}: {e}", cert.host))?;
		resolver
			.add(&cert.host, CertifiedKey::new(chain, signing_key))
			.map_err(|e| anyhow::anyhow!("register cert for {}: {e}", cert.host))?;
		debug!(host = %cert.host, "registered server certificate");
	}

	let builder = ServerConfig::builder_with_provider(provider.clone())
		.with_protocol_versions(versions(tls.min_version.as_deref()))
		.context("incompatible TLS version selection")?;

	let builder = if client_ca_files.is_empty() {
		builder.with_no_client_auth()
	} else {
		let mut roots = rustls::RootCertStore::empty();
		for path in client_ca_files {
			for cert in load_certs(path)? {
				roots
					.add(cert)
					.map_err(|e| anyhow::anyhow!("add client CA from {path}: {e}"))?;
			}
		}
		let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
			// Presence is enforced per route at the request gate, so plain
			// TLS clients can still reach routes without mTLS.
			.allow_unauthenticated()
			.build()
			.map_err(|e| anyhow::anyhow!("build client verifier: {e}"))?;
		builder.with_client_cert_verifier(verifier)
	};

	let mut cfg = builder.with_cert_resolver(Arc::new(resolver));
	cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	Ok(Arc::new(cfg))
}
