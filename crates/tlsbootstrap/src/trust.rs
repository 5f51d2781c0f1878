use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use rustls_pemfile::Item;
use rustls_pki_types::CertificateDer;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
	#[error("failed to read certificate directory {path}: {source}")]
	ReadDir {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("failed to read certificate file {path}: {source}")]
	ReadFile {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("failed to parse certificate(s) from {0}")]
	ParseCertificate(PathBuf),
	#[error("no root certificates were found; attested data validation would be impossible")]
	NoRoots,
}

/// Root and intermediate certificate pools used to validate the platform
/// attestation signer.
///
/// The root pool is fixed for the process lifetime. The intermediate pool is
/// append-only: the attestation verifier adds issuer certificates fetched on
/// demand, so a rotated platform intermediate costs one fetch and is then
/// served from the pool.
#[derive(Debug)]
pub struct TrustPools {
	roots: Vec<CertificateDer<'static>>,
	intermediates: RwLock<Vec<CertificateDer<'static>>>,
}

impl TrustPools {
	/// Build the pools from optional directories of PEM or DER files.
	/// Without a root directory the system store is used. Refuses to
	/// construct an empty root pool.
	pub fn load(
		root_dir: Option<&Path>,
		intermediate_dir: Option<&Path>,
	) -> Result<Self, TrustError> {
		let roots = match root_dir {
			Some(dir) => {
				let certs = load_directory(dir)?;
				info!(directory = %dir.display(), count = certs.len(), "loaded root certificates");
				certs
			},
			None => {
				info!("loading root certificates from the system certificate store");
				let result = rustls_native_certs::load_native_certs();
				for err in &result.errors {
					warn!("system certificate store: {err}");
				}
				result.certs
			},
		};
		if roots.is_empty() {
			return Err(TrustError::NoRoots);
		}

		let intermediates = match intermediate_dir {
			Some(dir) => {
				let certs = load_directory(dir)?;
				info!(directory = %dir.display(), count = certs.len(), "loaded intermediate certificates");
				certs
			},
			None => Vec::new(),
		};

		Ok(TrustPools {
			roots,
			intermediates: RwLock::new(intermediates),
		})
	}

	/// Construct pools from in-memory certificates.
	pub fn from_der(
		roots: Vec<CertificateDer<'static>>,
		intermediates: Vec<CertificateDer<'static>>,
	) -> Result<Self, TrustError> {
		if roots.is_empty() {
			return Err(TrustError::NoRoots);
		}
		Ok(TrustPools {
			roots,
			intermediates: RwLock::new(intermediates),
		})
	}

	pub fn roots(&self) -> &[CertificateDer<'static>] {
		&self.roots
	}

	/// Snapshot of the intermediate pool. Coherent with the most recent
	/// append at the time of the call.
	pub fn intermediates(&self) -> Vec<CertificateDer<'static>> {
		self.intermediates.read().clone()
	}

	/// True when some pooled intermediate's subject equals `issuer_raw`
	/// (the DER-encoded Name of a signer's issuer).
	pub fn has_intermediate_for(&self, issuer_raw: &[u8]) -> bool {
		self
			.intermediates
			.read()
			.iter()
			.any(|der| subject_matches(der, issuer_raw))
	}

	pub fn add_intermediate(&self, cert: CertificateDer<'static>) {
		self.intermediates.write().push(cert);
	}
}

fn subject_matches(der: &CertificateDer<'_>, issuer_raw: &[u8]) -> bool {
	match X509Certificate::from_der(der) {
		Ok((_, cert)) => cert.subject().as_raw() == issuer_raw,
		Err(e) => {
			debug!("skipping unparseable pooled certificate: {e}");
			false
		},
	}
}

fn load_directory(dir: &Path) -> Result<Vec<CertificateDer<'static>>, TrustError> {
	let entries = fs::read_dir(dir).map_err(|source| TrustError::ReadDir {
		path: dir.to_path_buf(),
		source,
	})?;

	let mut certs = Vec::new();
	for entry in entries {
		let entry = entry.map_err(|source| TrustError::ReadDir {
			path: dir.to_path_buf(),
			source,
		})?;
		let path = entry.path();
		if !path.is_file() {
			continue;
		}
		let data = fs::read(&path).map_err(|source| TrustError::ReadFile {
			path: path.clone(),
			source,
		})?;
		let parsed = parse_certificates(&data)
			.ok_or_else(|| TrustError::ParseCertificate(path.clone()))?;
		debug!(file = %path.display(), count = parsed.len(), "loaded certificates");
		certs.extend(parsed);
	}
	Ok(certs)
}

/// Accepts a PEM bundle or a single DER certificate.
fn parse_certificates(data: &[u8]) -> Option<Vec<CertificateDer<'static>>> {
	let mut reader = std::io::BufReader::new(Cursor::new(data));
	let items: Result<Vec<_>, _> = rustls_pemfile::read_all(&mut reader).collect();
	if let Ok(items) = items {
		let certs: Vec<_> = items
			.into_iter()
			.filter_map(|item| match item {
				Item::X509Certificate(der) => Some(der),
				_ => None,
			})
			.collect();
		if !certs.is_empty() {
			return Some(certs);
		}
	}
	// Not PEM; maybe a DER-format certificate.
	match X509Certificate::from_der(data) {
		Ok(_) => Some(vec![CertificateDer::from(data.to_vec())]),
		Err(_) => None,
	}
}

#[cfg(test)]
#[path = "trust_tests.rs"]
mod tests;
