use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rustls_pki_types::CertificateDer;
use serde::Deserialize;
use tracing::{debug, info};
use x509_parser::prelude::*;

use crate::pkcs7::{self, SignerIdentifier};
use crate::trust::TrustPools;

/// 1.3.6.1.5.5.7.48.2 (id-ad-caIssuers), the AIA access method whose
/// location serves the issuing certificate.
const OID_AD_CA_ISSUERS: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x02];

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CHAIN_DEPTH: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum AttestError {
	#[error("malformed attestation document: {0}")]
	Malformed(String),
	#[error("failed to retrieve intermediate certificate: {0}")]
	IntermediateFetch(String),
	#[error("attestation signer is not trusted: {0}")]
	SignerUntrusted(String),
}

/// The document the platform metadata service signs for a VM. JSON inside
/// the PKCS#7 envelope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttestedDocument {
	pub license_type: String,
	pub nonce: String,
	pub plan: AttestedPlan,
	pub subscription_id: String,
	pub sku: String,
	pub timestamp: AttestedTimestamp,
	pub vm_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AttestedPlan {
	pub name: String,
	pub product: String,
	pub publisher: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttestedTimestamp {
	pub created_on: String,
	pub expires_on: String,
}

/// Verifies platform-signed attestation blobs: PKCS#7 parsing, signer chain
/// validation against the trust pools, signer hostname enforcement, and
/// document extraction.
pub struct AttestationVerifier {
	pools: Arc<TrustPools>,
	signer_hostname: String,
	http: reqwest::Client,
}

impl AttestationVerifier {
	pub fn new(pools: Arc<TrustPools>, signer_hostname: String) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
		Ok(AttestationVerifier {
			pools,
			signer_hostname,
			http,
		})
	}

	/// Validate a base64-encoded PKCS#7 blob and return the attested
	/// document it envelopes.
	pub async fn verify(&self, signed_blob: &str) -> Result<AttestedDocument, AttestError> {
		let der = BASE64
			.decode(signed_blob)
			.map_err(|e| AttestError::Malformed(format!("failed to decode base64 signature: {e}")))?;

		let envelope = pkcs7::parse(&der)
			.map_err(|e| AttestError::Malformed(format!("failed to parse pkcs7 signature block: {e}")))?;

		let signer_der = find_signer(&envelope.certificates, &envelope.signer)
			.ok_or_else(|| AttestError::Malformed("no certificate matches the signer".to_string()))?
			.to_vec();

		self.pool_signer_issuer(&signer_der).await?;
		verify_signer_chain(&signer_der, &self.pools, &self.signer_hostname)
			.map_err(AttestError::SignerUntrusted)?;

		serde_json::from_slice(&envelope.content)
			.map_err(|e| AttestError::Malformed(format!("failed to unmarshal attested data: {e}")))
	}

	/// Make sure the signer's issuer is present in the intermediate pool,
	/// fetching it over HTTP from the signer's AIA location if not. An
	/// intermediate is fetched at most once per process lifetime.
	async fn pool_signer_issuer(&self, signer_der: &[u8]) -> Result<(), AttestError> {
		let url = {
			let (_, signer) = X509Certificate::from_der(signer_der)
				.map_err(|e| AttestError::Malformed(format!("failed to parse signer certificate: {e}")))?;
			debug!(subject = %signer.subject(), "attestation signer");
			if self.pools.has_intermediate_for(signer.issuer().as_raw()) {
				debug!("intermediate certificate already cached");
				return Ok(());
			}
			ca_issuers_url(&signer).ok_or_else(|| {
				AttestError::IntermediateFetch(
					"signer certificate has no authority information access URL".to_string(),
				)
			})?
		};

		info!(%url, "retrieving intermediate certificate");
		let response = self
			.http
			.get(&url)
			.send()
			.await
			.and_then(|r| r.error_for_status())
			.map_err(|e| AttestError::IntermediateFetch(e.to_string()))?;
		let body = response
			.bytes()
			.await
			.map_err(|e| AttestError::IntermediateFetch(e.to_string()))?;

		X509Certificate::from_der(&body).map_err(|e| {
			AttestError::IntermediateFetch(format!("failed to parse certificate from {url}: {e}"))
		})?;
		self
			.pools
			.add_intermediate(CertificateDer::from(body.to_vec()));
		Ok(())
	}
}

/// Locate the signer certificate among the bundled ones by
/// issuerAndSerialNumber.
fn find_signer<'a>(certificates: &'a [Vec<u8>], signer: &SignerIdentifier) -> Option<&'a [u8]> {
	let (_, want_issuer) = X509Name::from_der(&signer.issuer).ok()?;
	certificates
		.iter()
		.map(Vec::as_slice)
		.find(|der| match X509Certificate::from_der(der) {
			Ok((_, cert)) => {
				cert.raw_serial() == signer.serial.as_slice()
					&& cert.issuer().to_string() == want_issuer.to_string()
			},
			Err(_) => false,
		})
}

/// Verify the signer chains to a pooled root through pooled intermediates
/// and is valid for `hostname`. Time validity is checked at every link.
fn verify_signer_chain(
	signer_der: &[u8],
	pools: &TrustPools,
	hostname: &str,
) -> Result<(), String> {
	{
		let (_, signer) = X509Certificate::from_der(signer_der)
			.map_err(|e| format!("failed to parse signer certificate: {e}"))?;
		if !signer.validity().is_valid() {
			return Err("signer certificate is expired or not yet valid".to_string());
		}
		check_hostname(&signer, hostname)?;
	}

	let intermediates = pools.intermediates();
	let mut current: Vec<u8> = signer_der.to_vec();
	for _ in 0..MAX_CHAIN_DEPTH {
		let next = {
			let (_, cert) = X509Certificate::from_der(&current)
				.map_err(|e| format!("failed to parse chain certificate: {e}"))?;

			if let Some(anchor_der) = find_issuer(&cert, pools.roots()) {
				let (_, anchor) = X509Certificate::from_der(anchor_der)
					.map_err(|e| format!("failed to parse root certificate: {e}"))?;
				if !anchor.validity().is_valid() {
					return Err("root certificate is expired or not yet valid".to_string());
				}
				cert
					.verify_signature(Some(anchor.public_key()))
					.map_err(|e| format!("signature verification against root failed: {e}"))?;
				return Ok(());
			}

			match find_issuer(&cert, &intermediates) {
				Some(issuer_der) => {
					let (_, issuer) = X509Certificate::from_der(issuer_der)
						.map_err(|e| format!("failed to parse intermediate certificate: {e}"))?;
					if !issuer.validity().is_valid() {
						return Err("intermediate certificate is expired or not yet valid".to_string());
					}
					cert
						.verify_signature(Some(issuer.public_key()))
						.map_err(|e| format!("signature verification against intermediate failed: {e}"))?;
					issuer_der.to_vec()
				},
				None => {
					return Err(format!("no trusted issuer for {}", cert.issuer()));
				},
			}
		};
		current = next;
	}
	Err("certificate chain exceeds maximum depth".to_string())
}

fn find_issuer<'a>(
	cert: &X509Certificate<'_>,
	pool: &'a [CertificateDer<'static>],
) -> Option<&'a [u8]> {
	let issuer_raw = cert.issuer().as_raw();
	pool
		.iter()
		.find(|candidate| match X509Certificate::from_der(candidate) {
			Ok((_, c)) => c.subject().as_raw() == issuer_raw,
			Err(_) => false,
		})
		.map(|der| der.as_ref())
}

fn check_hostname(cert: &X509Certificate<'_>, hostname: &str) -> Result<(), String> {
	let mut names: Vec<&str> = Vec::new();
	if let Ok(Some(san)) = cert.subject_alternative_name() {
		for name in &san.value.general_names {
			if let GeneralName::DNSName(dns) = name {
				names.push(dns);
			}
		}
	}
	if names.is_empty() {
		// No SAN entries; fall back to the subject CN.
		if let Some(cn) = cert
			.subject()
			.iter_common_name()
			.next()
			.and_then(|attr| attr.as_str().ok())
		{
			names.push(cn);
		}
	}
	if names.iter().any(|name| dns_name_matches(name, hostname)) {
		Ok(())
	} else {
		Err(format!(
			"failed to verify {hostname} hostname: certificate names {names:?}"
		))
	}
}

fn dns_name_matches(pattern: &str, host: &str) -> bool {
	if pattern.eq_ignore_ascii_case(host) {
		return true;
	}
	// Single leftmost wildcard label only.
	if let Some(suffix) = pattern.strip_prefix("*.") {
		return host
			.split_once('.')
			.map(|(_, tail)| tail.eq_ignore_ascii_case(suffix))
			.unwrap_or(false);
	}
	false
}

fn ca_issuers_url(cert: &X509Certificate<'_>) -> Option<String> {
	for ext in cert.extensions() {
		if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
			for desc in &aia.accessdescs {
				if desc.access_method.as_bytes() == OID_AD_CA_ISSUERS {
					if let GeneralName::URI(uri) = &desc.access_location {
						return Some(uri.to_string());
					}
				}
			}
		}
	}
	None
}

#[cfg(test)]
#[path = "attest_tests.rs"]
mod tests;
