use super::*;
use crate::testutil::{SignerOptions, envelope_signed_by, test_pki};
use crate::trust::TrustPools;
use assert_matches::assert_matches;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DOCUMENT: &str = r#"{
	"licenseType": "",
	"nonce": "a1b2c3d4e5",
	"plan": { "name": "", "product": "", "publisher": "" },
	"subscriptionId": "sub0",
	"sku": "aks-sku",
	"timestamp": { "createdOn": "01/01/26 00:00:00 -0000", "expiresOn": "01/01/26 06:00:00 -0000" },
	"vmId": "VMID-1"
}"#;

fn verifier_for(pki: &crate::testutil::TestPki, pool_intermediate: bool) -> AttestationVerifier {
	let intermediates = if pool_intermediate {
		vec![rustls_pki_types::CertificateDer::from(
			pki.intermediate_der.clone(),
		)]
	} else {
		vec![]
	};
	let pools = Arc::new(
		TrustPools::from_der(
			vec![rustls_pki_types::CertificateDer::from(pki.root_der.clone())],
			intermediates,
		)
		.unwrap(),
	);
	AttestationVerifier::new(pools, "metadata.azure.com".to_string()).unwrap()
}

fn blob(pki: &crate::testutil::TestPki, content: &str) -> String {
	BASE64.encode(envelope_signed_by(
		content.as_bytes(),
		&pki.signer_der,
		&[&pki.signer_der, &pki.intermediate_der],
	))
}

#[tokio::test]
async fn verifies_document_signed_by_trusted_chain() {
	let pki = test_pki(SignerOptions::default());
	let verifier = verifier_for(&pki, true);

	let document = verifier.verify(&blob(&pki, DOCUMENT)).await.unwrap();
	assert_eq!(document.nonce, "a1b2c3d4e5");
	assert_eq!(document.vm_id, "VMID-1");
	assert_eq!(document.subscription_id, "sub0");
	assert_eq!(document.sku, "aks-sku");
	assert_eq!(document.timestamp.created_on, "01/01/26 00:00:00 -0000");
}

#[tokio::test]
async fn rejects_invalid_base64() {
	let pki = test_pki(SignerOptions::default());
	let verifier = verifier_for(&pki, true);
	assert_matches!(
		verifier.verify("not-base64!").await,
		Err(AttestError::Malformed(_))
	);
}

#[tokio::test]
async fn rejects_multiple_signers() {
	let pki = test_pki(SignerOptions::default());
	let verifier = verifier_for(&pki, true);
	let sid = crate::testutil::signer_identifier_of(&pki.signer_der);
	let der = crate::testutil::signed_envelope(
		DOCUMENT.as_bytes(),
		&[&pki.signer_der],
		&[sid.clone(), sid],
	);
	assert_matches!(
		verifier.verify(&BASE64.encode(der)).await,
		Err(AttestError::Malformed(_))
	);
}

#[tokio::test]
async fn rejects_missing_signer_certificate() {
	let pki = test_pki(SignerOptions::default());
	let verifier = verifier_for(&pki, true);
	// Bundle only the intermediate; the signer identified by the
	// SignerInfo is absent.
	let der = crate::testutil::signed_envelope(
		DOCUMENT.as_bytes(),
		&[&pki.intermediate_der],
		&[crate::testutil::signer_identifier_of(&pki.signer_der)],
	);
	assert_matches!(
		verifier.verify(&BASE64.encode(der)).await,
		Err(AttestError::Malformed(_))
	);
}

#[tokio::test]
async fn rejects_wrong_signer_hostname() {
	let pki = test_pki(SignerOptions {
		hostname: "not-the-platform.example.com".to_string(),
		..Default::default()
	});
	let verifier = verifier_for(&pki, true);
	assert_matches!(
		verifier.verify(&blob(&pki, DOCUMENT)).await,
		Err(AttestError::SignerUntrusted(_))
	);
}

#[tokio::test]
async fn rejects_expired_signer() {
	let pki = test_pki(SignerOptions {
		expired: true,
		..Default::default()
	});
	let verifier = verifier_for(&pki, true);
	assert_matches!(
		verifier.verify(&blob(&pki, DOCUMENT)).await,
		Err(AttestError::SignerUntrusted(_))
	);
}

#[tokio::test]
async fn rejects_chain_to_unknown_root() {
	let pki = test_pki(SignerOptions::default());
	let other = test_pki(SignerOptions::default());
	// Pools anchored at a different root.
	let pools = Arc::new(
		TrustPools::from_der(
			vec![rustls_pki_types::CertificateDer::from(other.root_der.clone())],
			vec![rustls_pki_types::CertificateDer::from(
				pki.intermediate_der.clone(),
			)],
		)
		.unwrap(),
	);
	let verifier = AttestationVerifier::new(pools, "metadata.azure.com".to_string()).unwrap();
	assert_matches!(
		verifier.verify(&blob(&pki, DOCUMENT)).await,
		Err(AttestError::SignerUntrusted(_))
	);
}

#[tokio::test]
async fn rejects_unparseable_document() {
	let pki = test_pki(SignerOptions::default());
	let verifier = verifier_for(&pki, true);
	assert_matches!(
		verifier.verify(&blob(&pki, "not json")).await,
		Err(AttestError::Malformed(_))
	);
}

#[tokio::test]
async fn fetches_rotated_intermediate_once() {
	let server = MockServer::start().await;
	let pki = test_pki(SignerOptions {
		aia_url: Some(format!("{}/intermediate.der", server.uri())),
		..Default::default()
	});
	Mock::given(method("GET"))
		.and(path("/intermediate.der"))
		.respond_with(ResponseTemplate::new(200).set_body_bytes(pki.intermediate_der.clone()))
		.expect(1)
		.mount(&server)
		.await;

	// Intermediate pool starts empty; the first verify fetches the issuer
	// from the AIA location, the second is served from the pool.
	let verifier = verifier_for(&pki, false);
	verifier.verify(&blob(&pki, DOCUMENT)).await.unwrap();
	verifier.verify(&blob(&pki, DOCUMENT)).await.unwrap();
	server.verify().await;
}

#[tokio::test]
async fn intermediate_fetch_failure_is_reported() {
	let server = MockServer::start().await;
	let pki = test_pki(SignerOptions {
		aia_url: Some(format!("{}/intermediate.der", server.uri())),
		..Default::default()
	});
	Mock::given(method("GET"))
		.and(path("/intermediate.der"))
		.respond_with(ResponseTemplate::new(500))
		.mount(&server)
		.await;

	let verifier = verifier_for(&pki, false);
	assert_matches!(
		verifier.verify(&blob(&pki, DOCUMENT)).await,
		Err(AttestError::IntermediateFetch(_))
	);
}

#[tokio::test]
async fn missing_aia_with_unpooled_issuer_fails() {
	let pki = test_pki(SignerOptions::default());
	let verifier = verifier_for(&pki, false);
	assert_matches!(
		verifier.verify(&blob(&pki, DOCUMENT)).await,
		Err(AttestError::IntermediateFetch(_))
	);
}

#[test]
fn wildcard_hostname_matching() {
	assert!(dns_name_matches("metadata.azure.com", "METADATA.azure.com"));
	assert!(dns_name_matches("*.azure.com", "metadata.azure.com"));
	assert!(!dns_name_matches("*.azure.com", "deep.metadata.azure.com"));
	assert!(!dns_name_matches("*.azure.com", "azure.com"));
	assert!(!dns_name_matches("metadata.azure.com", "other.azure.com"));
}

#[test]
fn document_parsing_tolerates_missing_optional_fields() {
	let document: AttestedDocument =
		serde_json::from_str(r#"{"nonce":"a1b2c3d4e5","vmId":"VMID-1"}"#).unwrap();
	assert_eq!(document.nonce, "a1b2c3d4e5");
	assert_eq!(document.vm_id, "VMID-1");
	assert_eq!(document.license_type, "");
	assert_eq!(document.plan.publisher, "");
}
