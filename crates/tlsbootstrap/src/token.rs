use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rand::RngExt;
use secrecy::SecretString;
use tracing::{debug, info};

use crate::cluster::{
	BOOTSTRAP_TOKEN_SECRET_PREFIX, BOOTSTRAP_TOKEN_SECRET_TYPE, Cluster, ClusterError,
	HOSTNAME_ANNOTATION, Secret,
};

/// Bootstrap tokens are only good for the immediate join handshake.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(30);

const TOKEN_ID_BYTES: usize = 3;
const TOKEN_SECRET_BYTES: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum MintError {
	#[error("failed to persist bootstrap token secret: {0}")]
	PersistenceFailed(#[from] ClusterError),
}

/// A freshly minted bootstrap credential. The wire form is
/// `<tokenId>.<tokenSecret>`.
pub struct MintedToken {
	pub token: SecretString,
	pub token_id: String,
	/// RFC 3339 expiration, also written to the secret.
	pub expiration: String,
}

/// Mints `<tokenId>.<tokenSecret>` credentials and persists them as
/// bootstrap-token secrets annotated with the validated hostname.
pub struct TokenMinter {
	cluster: Arc<dyn Cluster>,
	namespace: String,
}

impl TokenMinter {
	pub fn new(cluster: Arc<dyn Cluster>, namespace: String) -> Self {
		TokenMinter { cluster, namespace }
	}

	pub async fn mint(&self, vm_name: &str) -> Result<MintedToken, MintError> {
		let token_id = random_hex(TOKEN_ID_BYTES);
		let token_secret = random_hex(TOKEN_SECRET_BYTES);
		let expiration =
			(Utc::now() + TOKEN_LIFETIME).to_rfc3339_opts(SecondsFormat::Secs, true);

		let mut annotations = BTreeMap::new();
		annotations.insert(HOSTNAME_ANNOTATION.to_string(), vm_name.to_string());
		let mut data = BTreeMap::new();
		data.insert("token-id".to_string(), token_id.clone());
		data.insert("token-secret".to_string(), token_secret.clone());
		data.insert(
			"usage-bootstrap-authentication".to_string(),
			"true".to_string(),
		);
		data.insert("usage-bootstrap-signing".to_string(), "true".to_string());
		data.insert("expiration".to_string(), expiration.clone());

		let secret = Secret {
			namespace: self.namespace.clone(),
			name: format!("{BOOTSTRAP_TOKEN_SECRET_PREFIX}{token_id}"),
			secret_type: BOOTSTRAP_TOKEN_SECRET_TYPE.to_string(),
			annotations,
			data,
		};
		debug!(name = %secret.name, vm_name, "bootstrap secret generated");

		// create-then-update: a name conflict means the token id collided,
		// so the existing object is replaced with the fresh material
		// (last writer wins).
		match self.cluster.create_secret(secret.clone()).await {
			Ok(()) => {},
			Err(ClusterError::AlreadyExists(_)) => {
				self.cluster.update_secret(secret).await?;
			},
			Err(e) => return Err(e.into()),
		}

		info!(token_id = %token_id, vm_name, "bootstrap token created");
		Ok(MintedToken {
			token: SecretString::from(format!("{token_id}.{token_secret}")),
			token_id,
			expiration,
		})
	}
}

fn random_hex(bytes: usize) -> String {
	let mut buf = vec![0u8; bytes];
	rand::rng().fill(buf.as_mut_slice());
	hex::encode(buf)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cluster::memory::MemoryCluster;
	use futures::stream::BoxStream;
	use secrecy::ExposeSecret;
	use std::time::Duration;

	#[tokio::test]
	async fn mint_persists_annotated_secret() {
		let cluster = Arc::new(MemoryCluster::new());
		let minter = TokenMinter::new(cluster.clone(), "kube-system".to_string());

		let minted = minter.mint("aks-node-0").await.unwrap();
		let token = minted.token.expose_secret();
		let (id, secret_part) = token.split_once('.').unwrap();
		assert_eq!(id.len(), 6);
		assert_eq!(secret_part.len(), 16);
		assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
		assert!(secret_part.chars().all(|c| c.is_ascii_hexdigit()));
		assert_eq!(minted.token_id, id);

		let stored = cluster
			.secret("kube-system", &format!("bootstrap-token-{id}"))
			.unwrap();
		assert_eq!(stored.secret_type, BOOTSTRAP_TOKEN_SECRET_TYPE);
		assert_eq!(
			stored.annotations.get(HOSTNAME_ANNOTATION).unwrap(),
			"aks-node-0"
		);
		assert_eq!(stored.data.get("token-id").unwrap(), id);
		assert_eq!(stored.data.get("token-secret").unwrap(), secret_part);
		assert_eq!(
			stored.data.get("usage-bootstrap-authentication").unwrap(),
			"true"
		);
		assert_eq!(stored.data.get("usage-bootstrap-signing").unwrap(), "true");
		assert_eq!(stored.data.get("expiration").unwrap(), &minted.expiration);
	}

	#[tokio::test]
	async fn remint_yields_distinct_credentials() {
		let cluster = Arc::new(MemoryCluster::new());
		let minter = TokenMinter::new(cluster, "kube-system".to_string());
		let a = minter.mint("aks-node-0").await.unwrap();
		let b = minter.mint("aks-node-0").await.unwrap();
		assert_ne!(a.token.expose_secret(), b.token.expose_secret());
	}

	/// Cluster stub whose create always conflicts, to drive the update arm.
	struct ConflictingCluster {
		inner: MemoryCluster,
	}

	#[async_trait::async_trait]
	impl Cluster for ConflictingCluster {
		async fn get_secret(
			&self,
			namespace: &str,
			name: &str,
		) -> Result<Secret, ClusterError> {
			self.inner.get_secret(namespace, name).await
		}
		async fn create_secret(&self, secret: Secret) -> Result<(), ClusterError> {
			self.inner.insert_secret(Secret {
				data: Default::default(),
				..secret.clone()
			});
			Err(ClusterError::AlreadyExists(secret.name))
		}
		async fn update_secret(&self, secret: Secret) -> Result<(), ClusterError> {
			self.inner.update_secret(secret).await
		}
		async fn get_csr(
			&self,
			name: &str,
		) -> Result<crate::cluster::CertificateSigningRequest, ClusterError> {
			self.inner.get_csr(name).await
		}
		async fn update_approval(
			&self,
			csr: &crate::cluster::CertificateSigningRequest,
		) -> Result<(), ClusterError> {
			self.inner.update_approval(csr).await
		}
		async fn watch_csrs(&self) -> Result<BoxStream<'static, String>, ClusterError> {
			self.inner.watch_csrs().await
		}
		async fn try_acquire_lease(
			&self,
			key: &str,
			holder: &str,
			ttl: Duration,
		) -> Result<bool, ClusterError> {
			self.inner.try_acquire_lease(key, holder, ttl).await
		}
	}

	#[tokio::test]
	async fn mint_updates_on_name_conflict() {
		let cluster = Arc::new(ConflictingCluster {
			inner: MemoryCluster::new(),
		});
		let minter = TokenMinter::new(cluster.clone(), "kube-system".to_string());
		let minted = minter.mint("aks-node-0").await.unwrap();
		// The update replaced the conflicting object with the new material.
		let stored = cluster
			.inner
			.secret("kube-system", &format!("bootstrap-token-{}", minted.token_id))
			.unwrap();
		assert_eq!(stored.data.get("token-id").unwrap(), &minted.token_id);
	}
}
