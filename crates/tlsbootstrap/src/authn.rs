use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tonic::Status;
use tracing::{debug, warn};

/// How often the signing keys are re-fetched from the identity provider.
pub const JWKS_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
	#[error("no bearer token supplied")]
	MissingCredential,
	#[error("failed to parse token: {0}")]
	MalformedToken(String),
	#[error("token is not signed by a known key")]
	UntrustedSigner,
	#[error("token tenant ID {got} does not match expected tenant ID {want}")]
	WrongTenant { got: String, want: String },
	#[error("principal ID {0} is not in the allowed ID list")]
	PrincipalNotAllowed(String),
}

impl From<&AuthError> for Status {
	fn from(err: &AuthError) -> Status {
		match err {
			AuthError::MissingCredential
			| AuthError::MalformedToken(_)
			| AuthError::UntrustedSigner => Status::unauthenticated(err.to_string()),
			AuthError::WrongTenant { .. } | AuthError::PrincipalNotAllowed(_) => {
				Status::permission_denied(err.to_string())
			},
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum JwkError {
	#[error("failed to load JWKS: {0}")]
	JwkLoadError(#[from] reqwest::Error),
	#[error("failed to parse JWKS: {0}")]
	JwksParseError(#[from] serde_json::Error),
	#[error("the key is missing the `kid` attribute")]
	MissingKeyId,
	#[error("could not construct a decoding key for {key_id:?}: {error:?}")]
	DecodingError {
		key_id: String,
		error: jsonwebtoken::errors::Error,
	},
}

/// Claims the issuer acts on. Standard validity claims are enforced by the
/// JWT library; tenant and principal checks happen here.
#[derive(Debug, Clone, Deserialize)]
pub struct CallerClaims {
	#[serde(default)]
	pub tid: String,
	#[serde(default)]
	pub oid: String,
}

#[derive(Clone)]
struct Jwk {
	decoding: DecodingKey,
	validation: Validation,
}

/// Validates bearer tokens attached to issuer RPCs: signature against a
/// rotating JWKS, tenant match, and an allow-listed principal.
///
/// The key set is swapped atomically by the background refresher; request
/// paths only ever read the current snapshot.
pub struct Authenticator {
	keys: ArcSwap<HashMap<String, Jwk>>,
	jwks_url: String,
	tenant_id: String,
	allowed_client_ids: Vec<String>,
	http: reqwest::Client,
}

impl Authenticator {
	pub fn new(
		jwks_url: String,
		tenant_id: String,
		allowed_client_ids: Vec<String>,
		http: reqwest::Client,
	) -> Arc<Self> {
		Arc::new(Authenticator {
			keys: ArcSwap::from_pointee(HashMap::new()),
			jwks_url,
			tenant_id,
			allowed_client_ids,
			http,
		})
	}

	/// Fetch the JWKS and swap in the freshly built key set.
	pub async fn refresh(&self) -> Result<(), JwkError> {
		let jwks: JwkSet = self
			.http
			.get(&self.jwks_url)
			.send()
			.await
			.and_then(|r| r.error_for_status())?
			.json()
			.await?;

		let mut keys = HashMap::new();
		for jwk in jwks.keys {
			let Some(alg) = jwk
				.common
				.key_algorithm
				.and_then(|a| jsonwebtoken::Algorithm::from_str(&a.to_string()).ok())
			else {
				warn!(
					"JWK key algorithm {:?} is not supported; tokens signed by that key will not be accepted",
					jwk.common.key_algorithm
				);
				continue;
			};
			let kid = jwk.common.key_id.clone().ok_or(JwkError::MissingKeyId)?;
			let decoding = DecodingKey::from_jwk(&jwk).map_err(|error| JwkError::DecodingError {
				key_id: kid.clone(),
				error,
			})?;
			let mut validation = Validation::new(alg);
			validation.validate_nbf = true;
			keys.insert(kid, Jwk {
				decoding,
				validation,
			});
		}
		debug!(count = keys.len(), "refreshed JWKS");
		self.keys.store(Arc::new(keys));
		Ok(())
	}

	/// Hourly refresh loop. The initial fetch happens at startup through
	/// [`Authenticator::refresh`]; failures here keep the previous key set.
	pub fn spawn_refresher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
		let auth = Arc::clone(self);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(JWKS_REFRESH_INTERVAL);
			ticker.tick().await;
			loop {
				ticker.tick().await;
				if let Err(e) = auth.refresh().await {
					warn!("failed to refresh JWKS: {e}");
				}
			}
		})
	}

	/// Authenticate an incoming RPC from its request metadata.
	pub fn authenticate<T>(&self, request: &tonic::Request<T>) -> Result<CallerClaims, AuthError> {
		let token = bearer_token(request.metadata())?;
		self.validate_token(token)
	}

	pub fn validate_token(&self, token: &str) -> Result<CallerClaims, AuthError> {
		let header = decode_header(token).map_err(|e| AuthError::MalformedToken(e.to_string()))?;
		let kid = header.kid.ok_or(AuthError::UntrustedSigner)?;

		let keys = self.keys.load();
		let key = keys.get(&kid).ok_or(AuthError::UntrustedSigner)?;

		let data = decode::<CallerClaims>(token, &key.decoding, &key.validation)
			.map_err(|e| AuthError::MalformedToken(e.to_string()))?;
		let claims = data.claims;

		if claims.tid != self.tenant_id {
			return Err(AuthError::WrongTenant {
				got: claims.tid,
				want: self.tenant_id.clone(),
			});
		}
		if !self.allowed_client_ids.iter().any(|id| id == &claims.oid) {
			return Err(AuthError::PrincipalNotAllowed(claims.oid));
		}

		debug!(oid = %claims.oid, tid = %claims.tid, "successfully validated token");
		Ok(claims)
	}
}

fn bearer_token(metadata: &tonic::metadata::MetadataMap) -> Result<&str, AuthError> {
	let value = metadata
		.get(http::header::AUTHORIZATION.as_str())
		.ok_or(AuthError::MissingCredential)?
		.to_str()
		.map_err(|_| AuthError::MalformedToken("authorization metadata is not ascii".to_string()))?;
	let (scheme, token) = value
		.split_once(' ')
		.ok_or_else(|| AuthError::MalformedToken("authorization metadata has no scheme".to_string()))?;
	if !scheme.eq_ignore_ascii_case("bearer") {
		return Err(AuthError::MalformedToken(format!(
			"unsupported authorization scheme {scheme}"
		)));
	}
	let token = token.trim();
	if token.is_empty() {
		return Err(AuthError::MissingCredential);
	}
	Ok(token)
}

#[cfg(test)]
#[path = "authn_tests.rs"]
mod tests;
