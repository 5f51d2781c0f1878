use std::collections::BTreeMap;
use std::time::Duration;

use futures::stream::BoxStream;

/// Signer that produces kubelet serving certificates.
pub const KUBELET_SERVING_SIGNER: &str = "kubernetes.io/kubelet-serving";
/// Signer that produces kube-apiserver client certificates.
pub const KUBE_APISERVER_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client";

/// Well-known bootstrap-token secret kind.
pub const BOOTSTRAP_TOKEN_SECRET_TYPE: &str = "bootstrap.kubernetes.io/token";
/// Secrets holding bootstrap tokens are named `bootstrap-token-<tokenId>`.
pub const BOOTSTRAP_TOKEN_SECRET_PREFIX: &str = "bootstrap-token-";
/// Annotation recording the hostname validated at issuance.
pub const HOSTNAME_ANNOTATION: &str = "kubernetes.azure.com/tls-bootstrap-hostname";

pub const USAGE_DIGITAL_SIGNATURE: &str = "digital signature";
pub const USAGE_KEY_ENCIPHERMENT: &str = "key encipherment";
pub const USAGE_SERVER_AUTH: &str = "server auth";
pub const USAGE_CLIENT_AUTH: &str = "client auth";

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
	#[error("object not found: {0}")]
	NotFound(String),
	#[error("object already exists: {0}")]
	AlreadyExists(String),
	#[error("cluster API error: {0}")]
	Api(String),
}

/// A namespace-scoped secret, reduced to the fields this system touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secret {
	pub namespace: String,
	pub name: String,
	pub secret_type: String,
	pub annotations: BTreeMap<String, String>,
	pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType {
	Approved,
	Denied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrCondition {
	pub condition_type: ConditionType,
	/// "True", "False", or "Unknown".
	pub status: String,
	pub reason: String,
	pub message: String,
}

/// A pending certificate signing request as observed by the approver.
#[derive(Debug, Clone, Default)]
pub struct CertificateSigningRequest {
	pub name: String,
	pub namespace: String,
	pub username: String,
	pub signer_name: String,
	pub request_pem: Vec<u8>,
	pub usages: Vec<String>,
	pub certificate: Vec<u8>,
	pub conditions: Vec<CsrCondition>,
}

impl CertificateSigningRequest {
	pub fn is_approved_or_denied(&self) -> bool {
		self.conditions.iter().any(|c| {
			matches!(
				c.condition_type,
				ConditionType::Approved | ConditionType::Denied
			)
		})
	}
}

/// The cluster operations the issuer and approver need. Kept as a seam so
/// the core logic is independent of any particular client plumbing; tests
/// run against [`memory::MemoryCluster`].
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
	async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError>;
	async fn create_secret(&self, secret: Secret) -> Result<(), ClusterError>;
	async fn update_secret(&self, secret: Secret) -> Result<(), ClusterError>;

	async fn get_csr(&self, name: &str) -> Result<CertificateSigningRequest, ClusterError>;
	/// Write the approval sub-resource with the object's current conditions.
	async fn update_approval(&self, csr: &CertificateSigningRequest) -> Result<(), ClusterError>;
	/// Names of CSRs to reconcile, delivered as events arrive.
	async fn watch_csrs(&self) -> Result<BoxStream<'static, String>, ClusterError>;

	/// Try to take or renew the named leadership lease. Returns true when
	/// this holder owns the lease afterwards.
	async fn try_acquire_lease(
		&self,
		key: &str,
		holder: &str,
		ttl: Duration,
	) -> Result<bool, ClusterError>;
}

pub mod memory {
	use std::collections::BTreeMap;
	use std::time::{Duration, Instant};

	use futures::StreamExt;
	use futures::stream::BoxStream;
	use parking_lot::Mutex;
	use tokio::sync::mpsc;
	use tokio_stream::wrappers::UnboundedReceiverStream;

	use super::{CertificateSigningRequest, Cluster, ClusterError, Secret};

	#[derive(Default)]
	struct State {
		secrets: BTreeMap<(String, String), Secret>,
		csrs: BTreeMap<String, CertificateSigningRequest>,
		leases: BTreeMap<String, (String, Instant)>,
		watchers: Vec<mpsc::UnboundedSender<String>>,
	}

	/// In-memory cluster used by the test suites and local dry runs.
	#[derive(Default)]
	pub struct MemoryCluster {
		state: Mutex<State>,
	}

	impl MemoryCluster {
		pub fn new() -> Self {
			MemoryCluster::default()
		}

		/// Insert a secret directly, bypassing the create/update flow.
		pub fn insert_secret(&self, secret: Secret) {
			let mut state = self.state.lock();
			state
				.secrets
				.insert((secret.namespace.clone(), secret.name.clone()), secret);
		}

		/// Insert a CSR and notify watchers.
		pub fn insert_csr(&self, csr: CertificateSigningRequest) {
			let mut state = self.state.lock();
			let name = csr.name.clone();
			state.csrs.insert(name.clone(), csr);
			state.watchers.retain(|tx| tx.send(name.clone()).is_ok());
		}

		pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
			self
				.state
				.lock()
				.secrets
				.get(&(namespace.to_string(), name.to_string()))
				.cloned()
		}

		pub fn csr(&self, name: &str) -> Option<CertificateSigningRequest> {
			self.state.lock().csrs.get(name).cloned()
		}
	}

	#[async_trait::async_trait]
	impl Cluster for MemoryCluster {
		async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError> {
			self
				.secret(namespace, name)
				.ok_or_else(|| ClusterError::NotFound(format!("{namespace}/{name}")))
		}

		async fn create_secret(&self, secret: Secret) -> Result<(), ClusterError> {
			let mut state = self.state.lock();
			let key = (secret.namespace.clone(), secret.name.clone());
			if state.secrets.contains_key(&key) {
				return Err(ClusterError::AlreadyExists(format!(
					"{}/{}",
					key.0, key.1
				)));
			}
			state.secrets.insert(key, secret);
			Ok(())
		}

		async fn update_secret(&self, secret: Secret) -> Result<(), ClusterError> {
			let mut state = self.state.lock();
			let key = (secret.namespace.clone(), secret.name.clone());
			if !state.secrets.contains_key(&key) {
				return Err(ClusterError::NotFound(format!("{}/{}", key.0, key.1)));
			}
			state.secrets.insert(key, secret);
			Ok(())
		}

		async fn get_csr(&self, name: &str) -> Result<CertificateSigningRequest, ClusterError> {
			self
				.csr(name)
				.ok_or_else(|| ClusterError::NotFound(name.to_string()))
		}

		async fn update_approval(
			&self,
			csr: &CertificateSigningRequest,
		) -> Result<(), ClusterError> {
			let mut state = self.state.lock();
			match state.csrs.get_mut(&csr.name) {
				Some(existing) => {
					existing.conditions = csr.conditions.clone();
					Ok(())
				},
				None => Err(ClusterError::NotFound(csr.name.clone())),
			}
		}

		async fn watch_csrs(&self) -> Result<BoxStream<'static, String>, ClusterError> {
			let (tx, rx) = mpsc::unbounded_channel();
			let mut state = self.state.lock();
			// Replay existing objects, then live events.
			for name in state.csrs.keys() {
				let _ = tx.send(name.clone());
			}
			state.watchers.push(tx);
			Ok(UnboundedReceiverStream::new(rx).boxed())
		}

		async fn try_acquire_lease(
			&self,
			key: &str,
			holder: &str,
			ttl: Duration,
		) -> Result<bool, ClusterError> {
			let mut state = self.state.lock();
			let now = Instant::now();
			match state.leases.get(key) {
				Some((owner, expires)) if owner != holder && *expires > now => Ok(false),
				_ => {
					state
						.leases
						.insert(key.to_string(), (holder.to_string(), now + ttl));
					Ok(true)
				},
			}
		}
	}
}
