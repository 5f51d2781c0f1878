use super::*;
use crate::testutil::{der_tlv, signed_envelope};
use assert_matches::assert_matches;

fn dummy_cert(label: &[u8]) -> Vec<u8> {
	der_tlv(0x30, label)
}

fn one_signer() -> Vec<(Vec<u8>, Vec<u8>)> {
	vec![(der_tlv(0x30, b"issuer"), vec![0x02, 0x01])]
}

#[test]
fn parses_content_certificates_and_signer() {
	let cert_a = dummy_cert(b"a");
	let cert_b = dummy_cert(b"b");
	let der = signed_envelope(
		b"{\"nonce\":\"a1b2c3d4e5\"}",
		&[&cert_a, &cert_b],
		&one_signer(),
	);

	let envelope = parse(&der).unwrap();
	assert_eq!(envelope.content, b"{\"nonce\":\"a1b2c3d4e5\"}");
	assert_eq!(envelope.certificates, vec![cert_a, cert_b]);
	assert_eq!(envelope.signer.issuer, der_tlv(0x30, b"issuer"));
	assert_eq!(envelope.signer.serial, vec![0x02, 0x01]);
}

#[test]
fn parses_long_form_lengths() {
	// Content larger than 127 bytes forces the two-byte length form, and
	// larger than 255 the three-byte form.
	for size in [200usize, 70_000] {
		let content = vec![b'x'; size];
		let der = signed_envelope(&content, &[], &one_signer());
		let envelope = parse(&der).unwrap();
		assert_eq!(envelope.content.len(), size);
	}
}

#[test]
fn rejects_zero_signers() {
	let der = signed_envelope(b"{}", &[], &[]);
	assert_matches!(parse(&der), Err(Pkcs7Error::SignerCount(0)));
}

#[test]
fn rejects_multiple_signers() {
	let signers = vec![
		(der_tlv(0x30, b"one"), vec![0x01]),
		(der_tlv(0x30, b"two"), vec![0x02]),
	];
	let der = signed_envelope(b"{}", &[], &signers);
	assert_matches!(parse(&der), Err(Pkcs7Error::SignerCount(2)));
}

#[test]
fn rejects_non_signed_data_content_type() {
	// pkcs7-data instead of pkcs7-signedData.
	let oid_data = der_tlv(0x06, &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x01]);
	let inner = der_tlv(0xa0, &der_tlv(0x30, b""));
	let der = der_tlv(0x30, &[oid_data, inner].concat());
	assert_matches!(parse(&der), Err(Pkcs7Error::NotSignedData));
}

#[test]
fn rejects_truncated_input() {
	let der = signed_envelope(b"{}", &[], &one_signer());
	assert_matches!(
		parse(&der[..der.len() - 4]),
		Err(Pkcs7Error::Truncated | Pkcs7Error::BadLength | Pkcs7Error::UnexpectedTag { .. })
	);
	assert_matches!(parse(&[]), Err(Pkcs7Error::Truncated));
}

#[test]
fn rejects_indefinite_length() {
	// 0x80 length octet is the BER indefinite form.
	let der = [0x30, 0x80, 0x06, 0x00];
	assert_matches!(parse(&der), Err(Pkcs7Error::BadLength));
}

#[test]
fn rejects_garbage() {
	assert_matches!(
		parse(b"definitely not der"),
		Err(Pkcs7Error::UnexpectedTag { .. } | Pkcs7Error::Truncated | Pkcs7Error::BadLength)
	);
}

#[test]
fn empty_content_allowed() {
	// encapContentInfo with no eContent.
	let version = der_tlv(0x02, &[1]);
	let digest_algorithms = der_tlv(0x31, &[]);
	let encap = der_tlv(
		0x30,
		&der_tlv(0x06, &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x01]),
	);
	let (issuer, serial) = one_signer().remove(0);
	let sid = der_tlv(0x30, &[issuer, der_tlv(0x02, &serial)].concat());
	let signer = der_tlv(
		0x30,
		&[
			der_tlv(0x02, &[1]),
			sid,
			der_tlv(0x30, &[]),
			der_tlv(0x30, &[]),
			der_tlv(0x04, &[0]),
		]
		.concat(),
	);
	let signed_data = der_tlv(
		0x30,
		&[version, digest_algorithms, encap, der_tlv(0x31, &signer)].concat(),
	);
	let der = der_tlv(
		0x30,
		&[
			der_tlv(0x06, &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02]),
			der_tlv(0xa0, &signed_data),
		]
		.concat(),
	);

	let envelope = parse(&der).unwrap();
	assert!(envelope.content.is_empty());
	assert!(envelope.certificates.is_empty());
}
