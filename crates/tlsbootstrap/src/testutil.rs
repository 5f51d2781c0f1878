//! Fixtures shared by the unit tests: a DER encoder mirroring the envelope
//! layout the platform emits, and an rcgen-backed PKI.

use rcgen::{
	BasicConstraints, CertificateParams, CustomExtension, DnType, IsCa, Issuer, KeyPair,
};
use x509_parser::prelude::*;

/// Encode one DER TLV with definite length.
pub fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
	let mut out = vec![tag];
	let len = content.len();
	if len < 0x80 {
		out.push(len as u8);
	} else if len <= 0xff {
		out.extend([0x81, len as u8]);
	} else {
		out.extend([0x82, (len >> 8) as u8, (len & 0xff) as u8]);
	}
	out.extend_from_slice(content);
	out
}

const OID_SIGNED_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02];
const OID_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x01];
const OID_CA_ISSUERS: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x02];

/// Build a PKCS#7 signedData envelope over `content` bundling `certs` and
/// one SignerInfo per `(issuer TLV, serial bytes)` pair. Signature bytes
/// are filler; the verifier trusts the certificate chain, not the CMS
/// signature.
pub fn signed_envelope(content: &[u8], certs: &[&[u8]], signers: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
	let version = der_tlv(0x02, &[1]);
	let digest_algorithms = der_tlv(0x31, &[]);
	let econtent = der_tlv(0xa0, &der_tlv(0x04, content));
	let encap = der_tlv(
		0x30,
		&[der_tlv(0x06, OID_DATA), econtent].concat(),
	);
	let certificates = der_tlv(0xa0, &certs.concat());

	let signer_infos: Vec<u8> = signers
		.iter()
		.flat_map(|(issuer, serial)| {
			let sid = der_tlv(0x30, &[issuer.clone(), der_tlv(0x02, serial)].concat());
			der_tlv(
				0x30,
				&[
					der_tlv(0x02, &[1]),
					sid,
					der_tlv(0x30, &[]),
					der_tlv(0x30, &[]),
					der_tlv(0x04, &[0xde, 0xad, 0xbe, 0xef]),
				]
				.concat(),
			)
		})
		.collect();
	let signer_set = der_tlv(0x31, &signer_infos);

	let signed_data = der_tlv(
		0x30,
		&[version, digest_algorithms, encap, certificates, signer_set].concat(),
	);
	let wrapped = der_tlv(0xa0, &signed_data);
	der_tlv(0x30, &[der_tlv(0x06, OID_SIGNED_DATA), wrapped].concat())
}

/// The issuerAndSerialNumber identifying `cert_der` as the signer.
pub fn signer_identifier_of(cert_der: &[u8]) -> (Vec<u8>, Vec<u8>) {
	let (_, cert) = X509Certificate::from_der(cert_der).unwrap();
	(
		cert.issuer().as_raw().to_vec(),
		cert.raw_serial().to_vec(),
	)
}

/// Convenience: envelope signed by exactly `signer_der`, bundling the
/// given certificates.
pub fn envelope_signed_by(content: &[u8], signer_der: &[u8], bundle: &[&[u8]]) -> Vec<u8> {
	signed_envelope(content, bundle, &[signer_identifier_of(signer_der)])
}

/// root -> intermediate -> signer chain for attestation tests.
pub struct TestPki {
	pub root_der: Vec<u8>,
	pub intermediate_der: Vec<u8>,
	pub signer_der: Vec<u8>,
}

pub struct SignerOptions {
	pub hostname: String,
	/// Authority Information Access caIssuers URL baked into the signer.
	pub aia_url: Option<String>,
	pub expired: bool,
}

impl Default for SignerOptions {
	fn default() -> Self {
		SignerOptions {
			hostname: "metadata.azure.com".to_string(),
			aia_url: None,
			expired: false,
		}
	}
}

pub fn test_pki(options: SignerOptions) -> TestPki {
	let root_key = KeyPair::generate().unwrap();
	let mut root_params = CertificateParams::new(vec![]).unwrap();
	root_params
		.distinguished_name
		.push(DnType::CommonName, "test root");
	root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	let root_cert = root_params.clone().self_signed(&root_key).unwrap();
	let root_der = root_cert.der().to_vec();
	let root_issuer = Issuer::new(root_params, root_key);

	let intermediate_key = KeyPair::generate().unwrap();
	let mut intermediate_params = CertificateParams::new(vec![]).unwrap();
	intermediate_params
		.distinguished_name
		.push(DnType::CommonName, "test intermediate");
	intermediate_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	let intermediate_cert = intermediate_params
		.clone()
		.signed_by(&intermediate_key, &root_issuer)
		.unwrap();
	let intermediate_der = intermediate_cert.der().to_vec();
	let intermediate_issuer = Issuer::new(intermediate_params, intermediate_key);

	let signer_key = KeyPair::generate().unwrap();
	let mut signer_params = CertificateParams::new(vec![options.hostname.clone()]).unwrap();
	signer_params
		.distinguished_name
		.push(DnType::CommonName, options.hostname.as_str());
	if options.expired {
		signer_params.not_before = rcgen::date_time_ymd(2000, 1, 1);
		signer_params.not_after = rcgen::date_time_ymd(2001, 1, 1);
	}
	if let Some(url) = &options.aia_url {
		signer_params
			.custom_extensions
			.push(aia_extension(url));
	}
	let signer_cert = signer_params
		.signed_by(&signer_key, &intermediate_issuer)
		.unwrap();

	TestPki {
		root_der,
		intermediate_der,
		signer_der: signer_cert.der().to_vec(),
	}
}

/// AuthorityInfoAccess with a single caIssuers URI.
fn aia_extension(url: &str) -> CustomExtension {
	let access_description = der_tlv(
		0x30,
		&[der_tlv(0x06, OID_CA_ISSUERS), der_tlv(0x86, url.as_bytes())].concat(),
	);
	let aia = der_tlv(0x30, &access_description);
	CustomExtension::from_oid_content(&[1, 3, 6, 1, 5, 5, 7, 1, 1], aia)
}
