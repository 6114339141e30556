pub mod tls;

use rustls_pki_types::CertificateDer;

/// Connection-level TLS facts, attached to every request on a TLS listener.
#[derive(Debug, Clone)]
pub struct TlsConnectionInfo {
	pub sni: Option<String>,
	/// Present iff the client presented a certificate that the listener's
	/// client-CA verifier accepted.
	pub peer_certificates: Option<Vec<CertificateDer<'static>>>,
}

impl TlsConnectionInfo {
	/// Issuer DN of the peer's leaf certificate.
	pub fn peer_issuer(&self) -> Option<String> {
		let leaf = self.peer_certificates.as_ref()?.first()?;
		let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;
		Some(cert.issuer().to_string())
	}
}
