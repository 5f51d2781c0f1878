use super::*;
use assert_matches::assert_matches;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{EncodingKey, Header};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &[u8] = b"a shared secret for the test jwks";
const TENANT: &str = "tenant-0";
const ALLOWED: &str = "client-0";

async fn jwks_server() -> MockServer {
	let server = MockServer::start().await;
	let jwks = serde_json::json!({
		"keys": [{
			"kty": "oct",
			"kid": "test-key",
			"alg": "HS256",
			"k": URL_SAFE_NO_PAD.encode(SECRET),
		}]
	});
	Mock::given(method("GET"))
		.and(path("/keys"))
		.respond_with(ResponseTemplate::new(200).set_body_json(jwks))
		.mount(&server)
		.await;
	server
}

async fn authenticator(server: &MockServer) -> Arc<Authenticator> {
	let auth = Authenticator::new(
		format!("{}/keys", server.uri()),
		TENANT.to_string(),
		vec![ALLOWED.to_string()],
		reqwest::Client::new(),
	);
	auth.refresh().await.unwrap();
	auth
}

fn sign_token(kid: Option<&str>, claims: serde_json::Value) -> String {
	let mut header = Header::new(jsonwebtoken::Algorithm::HS256);
	header.kid = kid.map(str::to_string);
	jsonwebtoken::encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

fn valid_claims() -> serde_json::Value {
	serde_json::json!({
		"tid": TENANT,
		"oid": ALLOWED,
		"exp": chrono::Utc::now().timestamp() + 300,
	})
}

fn request_with_bearer(token: &str) -> tonic::Request<()> {
	let mut request = tonic::Request::new(());
	request.metadata_mut().insert(
		"authorization",
		format!("Bearer {token}").parse().unwrap(),
	);
	request
}

#[tokio::test]
async fn accepts_valid_token() {
	let server = jwks_server().await;
	let auth = authenticator(&server).await;
	let token = sign_token(Some("test-key"), valid_claims());

	let claims = auth.authenticate(&request_with_bearer(&token)).unwrap();
	assert_eq!(claims.tid, TENANT);
	assert_eq!(claims.oid, ALLOWED);
}

#[tokio::test]
async fn rejects_missing_bearer() {
	let server = jwks_server().await;
	let auth = authenticator(&server).await;
	assert_matches!(
		auth.authenticate(&tonic::Request::new(())),
		Err(AuthError::MissingCredential)
	);

	let mut request = tonic::Request::new(());
	request
		.metadata_mut()
		.insert("authorization", "Bearer ".parse().unwrap());
	assert_matches!(
		auth.authenticate(&request),
		Err(AuthError::MissingCredential)
	);
}

#[tokio::test]
async fn rejects_non_bearer_scheme() {
	let server = jwks_server().await;
	let auth = authenticator(&server).await;
	let mut request = tonic::Request::new(());
	request
		.metadata_mut()
		.insert("authorization", "Basic dXNlcjpwdw==".parse().unwrap());
	assert_matches!(
		auth.authenticate(&request),
		Err(AuthError::MalformedToken(_))
	);
}

#[tokio::test]
async fn rejects_unknown_key_id() {
	let server = jwks_server().await;
	let auth = authenticator(&server).await;
	let token = sign_token(Some("other-key"), valid_claims());
	assert_matches!(
		auth.validate_token(&token),
		Err(AuthError::UntrustedSigner)
	);
	let token = sign_token(None, valid_claims());
	assert_matches!(
		auth.validate_token(&token),
		Err(AuthError::UntrustedSigner)
	);
}

#[tokio::test]
async fn rejects_expired_token() {
	let server = jwks_server().await;
	let auth = authenticator(&server).await;
	let token = sign_token(
		Some("test-key"),
		serde_json::json!({
			"tid": TENANT,
			"oid": ALLOWED,
			"exp": chrono::Utc::now().timestamp() - 3600,
		}),
	);
	assert_matches!(
		auth.validate_token(&token),
		Err(AuthError::MalformedToken(_))
	);
}

#[tokio::test]
async fn rejects_wrong_tenant() {
	let server = jwks_server().await;
	let auth = authenticator(&server).await;
	let token = sign_token(
		Some("test-key"),
		serde_json::json!({
			"tid": "other-tenant",
			"oid": ALLOWED,
			"exp": chrono::Utc::now().timestamp() + 300,
		}),
	);
	assert_matches!(
		auth.validate_token(&token),
		Err(AuthError::WrongTenant { .. })
	);
}

#[tokio::test]
async fn rejects_principal_outside_allow_list() {
	let server = jwks_server().await;
	let auth = authenticator(&server).await;
	let token = sign_token(
		Some("test-key"),
		serde_json::json!({
			"tid": TENANT,
			"oid": "intruder",
			"exp": chrono::Utc::now().timestamp() + 300,
		}),
	);
	assert_matches!(
		auth.validate_token(&token),
		Err(AuthError::PrincipalNotAllowed(_))
	);
}

#[tokio::test]
async fn refresh_swaps_in_new_keys() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/keys"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"keys": []})))
		.up_to_n_times(1)
		.mount(&server)
		.await;
	let auth = Authenticator::new(
		format!("{}/keys", server.uri()),
		TENANT.to_string(),
		vec![ALLOWED.to_string()],
		reqwest::Client::new(),
	);
	auth.refresh().await.unwrap();
	let token = sign_token(Some("test-key"), valid_claims());
	assert_matches!(
		auth.validate_token(&token),
		Err(AuthError::UntrustedSigner)
	);

	// The key appears on rotation; the next refresh picks it up.
	Mock::given(method("GET"))
		.and(path("/keys"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"keys": [{
				"kty": "oct",
				"kid": "test-key",
				"alg": "HS256",
				"k": URL_SAFE_NO_PAD.encode(SECRET),
			}]
		})))
		.mount(&server)
		.await;
	auth.refresh().await.unwrap();
	assert!(auth.validate_token(&token).is_ok());
}

#[tokio::test]
async fn status_mapping_distinguishes_authentication_and_authorization() {
	let unauthenticated = AuthError::MissingCredential;
	assert_eq!(
		tonic::Status::from(&unauthenticated).code(),
		tonic::Code::Unauthenticated
	);
	let denied = AuthError::PrincipalNotAllowed("x".to_string());
	assert_eq!(
		tonic::Status::from(&denied).code(),
		tonic::Code::PermissionDenied
	);
}
