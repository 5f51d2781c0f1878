use std::sync::Arc;

use secrecy::ExposeSecret;
use tokio::net::TcpListener;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::attest::{AttestError, AttestationVerifier};
use crate::authn::Authenticator;
use crate::azure::{ArmResolver, CredentialConfig, ClientSecretConfig, IdentityResolver, ResolveError};
use crate::cluster::Cluster;
use crate::config::{ClusterFile, IssuerConfig};
use crate::management::{self, Metrics};
use crate::nonce::{NonceCache, NonceError};
use crate::proto::v1::bootstrap_token_server::{BootstrapToken, BootstrapTokenServer};
use crate::proto::v1::{NonceRequest, NonceResponse, TokenRequest, TokenResponse};
use crate::token::{MintError, TokenMinter};
use crate::transport;
use crate::trust::TrustPools;

#[derive(Debug, thiserror::Error)]
pub enum IssueError {
	#[error("failed to validate attested data: {0}")]
	Attestation(AttestError),
	#[error("attested nonce does not match the request nonce")]
	NonceMismatch,
	#[error("nonce {0} is unknown or expired")]
	NonceUnknownOrExpired(String),
	#[error("attested VM ID does not match the control-plane record")]
	AttestedVmIdMismatch,
	#[error("failed to validate VM identity: {0}")]
	Resolve(ResolveError),
	#[error(transparent)]
	Mint(#[from] MintError),
	#[error(transparent)]
	NonceGeneration(#[from] NonceError),
}

impl IssueError {
	/// Each taxonomy entry maps to a distinct status so clients can act on
	/// the failure kind. Messages never carry caller credentials.
	pub fn to_status(&self) -> Status {
		match self {
			IssueError::Attestation(AttestError::Malformed(_)) => {
				Status::invalid_argument(self.to_string())
			},
			IssueError::Attestation(AttestError::IntermediateFetch(_)) => {
				Status::unavailable(self.to_string())
			},
			IssueError::Attestation(AttestError::SignerUntrusted(_)) => {
				Status::permission_denied(self.to_string())
			},
			IssueError::NonceMismatch => Status::invalid_argument(self.to_string()),
			IssueError::NonceUnknownOrExpired(_) => Status::failed_precondition(self.to_string()),
			IssueError::AttestedVmIdMismatch => Status::permission_denied(self.to_string()),
			IssueError::Resolve(ResolveError::ResourceIdMalformed(_)) => {
				Status::invalid_argument(self.to_string())
			},
			IssueError::Resolve(ResolveError::ResourceNotFound(_)) => {
				Status::not_found(self.to_string())
			},
			IssueError::Resolve(ResolveError::ControlPlaneUnreachable(_)) => {
				Status::unavailable(self.to_string())
			},
			IssueError::Resolve(ResolveError::CredentialUnavailable(_))
			| IssueError::Mint(_)
			| IssueError::NonceGeneration(_) => Status::internal(self.to_string()),
		}
	}
}

/// The issuance orchestrator: glues the authenticator, nonce cache,
/// attestation verifier, identity resolver, and minter into the two-RPC
/// handshake.
pub struct BootstrapService {
	authenticator: Arc<Authenticator>,
	nonces: Arc<NonceCache>,
	verifier: AttestationVerifier,
	resolver: Arc<dyn IdentityResolver>,
	minter: TokenMinter,
	metrics: Arc<Metrics>,
}

impl BootstrapService {
	pub fn new(
		authenticator: Arc<Authenticator>,
		nonces: Arc<NonceCache>,
		verifier: AttestationVerifier,
		resolver: Arc<dyn IdentityResolver>,
		minter: TokenMinter,
		metrics: Arc<Metrics>,
	) -> Self {
		BootstrapService {
			authenticator,
			nonces,
			verifier,
			resolver,
			minter,
			metrics,
		}
	}

	/// GetToken past authentication. On any failure after the nonce lookup
	/// the record stays for a retry within its TTL; the exceptions are the
	/// successful path and minting failures, both of which consume it.
	async fn issue(&self, req: &TokenRequest) -> Result<TokenResponse, IssueError> {
		let attested = self
			.verifier
			.verify(&req.attested_data)
			.await
			.map_err(IssueError::Attestation)?;
		debug!(nonce = %req.nonce, "validated attested data");
		if attested.nonce != req.nonce {
			return Err(IssueError::NonceMismatch);
		}

		let record = self
			.nonces
			.get(&req.nonce)
			.filter(|r| !r.is_expired())
			.ok_or_else(|| IssueError::NonceUnknownOrExpired(req.nonce.clone()))?;

		self.nonces.update(&req.nonce, |r| {
			r.vm_id = Some(attested.vm_id.clone());
		});

		let identity = self
			.resolver
			.resolve(&record.resource_id)
			.await
			.map_err(IssueError::Resolve)?;
		if identity.vm_id != attested.vm_id {
			// The nonce record stays; the caller may retry with a correct
			// attestation until the TTL passes.
			return Err(IssueError::AttestedVmIdMismatch);
		}
		info!(
			nonce = %req.nonce,
			vm_id = %identity.vm_id,
			"attested VM ID matches the control-plane record"
		);

		self.nonces.update(&req.nonce, |r| {
			r.vm_name = Some(identity.computer_name.clone());
		});

		// Claim the record before minting: exactly one concurrent GetToken
		// can win, and a minting failure still forces a fresh handshake.
		let record = self
			.nonces
			.remove(&req.nonce)
			.filter(|r| !r.is_expired())
			.ok_or_else(|| IssueError::NonceUnknownOrExpired(req.nonce.clone()))?;
		let minted = self.minter.mint(&identity.computer_name).await?;

		info!(
			nonce = %record.nonce,
			resource_id = %record.resource_id,
			"returning token and flushing nonce from cache"
		);
		Ok(TokenResponse {
			token: minted.token.expose_secret().to_string(),
			expiration: minted.expiration,
		})
	}
}

#[tonic::async_trait]
impl BootstrapToken for BootstrapService {
	async fn get_nonce(
		&self,
		request: Request<NonceRequest>,
	) -> Result<Response<NonceResponse>, Status> {
		self.authenticator.authenticate(&request).map_err(|e| {
			warn!("authentication failed: {e}");
			Status::from(&e)
		})?;
		let req = request.into_inner();
		info!(resource_id = %req.resource_id, "received nonce request");
		self.metrics.nonce_requests.inc();

		let record = self.nonces.create(&req.resource_id).map_err(|e| {
			error!("{e}");
			Status::internal(e.to_string())
		})?;
		info!(resource_id = %req.resource_id, nonce = %record.nonce, "replying to nonce request");
		Ok(Response::new(NonceResponse {
			nonce: record.nonce,
		}))
	}

	async fn get_token(
		&self,
		request: Request<TokenRequest>,
	) -> Result<Response<TokenResponse>, Status> {
		self.authenticator.authenticate(&request).map_err(|e| {
			warn!("authentication failed: {e}");
			Status::from(&e)
		})?;
		let req = request.into_inner();
		info!(nonce = %req.nonce, "received token request");

		match self.issue(&req).await {
			Ok(response) => {
				self.metrics.tokens_issued.inc();
				Ok(Response::new(response))
			},
			Err(e) => {
				self.metrics.token_failures.inc();
				warn!(nonce = %req.nonce, "token request failed: {e}");
				Err(e.to_status())
			},
		}
	}
}

/// Build and run the issuer from its configuration. Returns when the
/// process receives a shutdown signal.
pub async fn run(config: IssuerConfig, cluster: Arc<dyn Cluster>) -> anyhow::Result<()> {
	let cluster_file = ClusterFile::load(&config.cluster_config_path)?;
	let tenant_id = if config.tenant_id.is_empty() {
		cluster_file.tenant_id.clone()
	} else {
		config.tenant_id.clone()
	};
	anyhow::ensure!(!tenant_id.is_empty(), "a tenant ID is required");
	anyhow::ensure!(
		!config.allowed_client_ids.is_empty(),
		"at least one allowed client ID is required"
	);

	let pools = Arc::new(TrustPools::load(
		config.root_cert_dir.as_deref(),
		config.intermediate_cert_dir.as_deref(),
	)?);

	let http = reqwest::Client::builder()
		.timeout(std::time::Duration::from_secs(30))
		.build()?;
	let authenticator = Authenticator::new(
		config.jwks_url.clone(),
		tenant_id,
		config.allowed_client_ids.clone(),
		http,
	);
	authenticator
		.refresh()
		.await
		.map_err(|e| anyhow::anyhow!("initial JWKS fetch failed: {e}"))?;
	let _jwks_refresher = authenticator.spawn_refresher();

	let nonces = NonceCache::new();
	let _sweeper = nonces.spawn_sweeper();

	let resolver: Arc<dyn IdentityResolver> = Arc::new(ArmResolver::new(&CredentialConfig {
		user_assigned_identity_id: crate::config::empty_to_none(Some(
			cluster_file.user_assigned_identity_id.clone(),
		)),
		client_secret: if cluster_file.client_id.is_empty() || cluster_file.client_id == "msi" {
			None
		} else {
			Some(ClientSecretConfig {
				tenant_id: cluster_file.tenant_id.clone(),
				client_id: cluster_file.client_id.clone(),
				client_secret: cluster_file.client_secret.clone(),
			})
		},
	})?);

	let mut registry = prometheus_client::registry::Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));
	let _management = management::spawn(config.health_addr, config.metrics_addr, registry).await?;

	let verifier = AttestationVerifier::new(pools, config.signer_hostname.clone())?;
	let minter = TokenMinter::new(cluster, config.namespace.clone());
	let service = BootstrapService::new(
		authenticator,
		nonces,
		verifier,
		resolver,
		minter,
		metrics,
	);

	let addr = format!("{}:{}", config.host, config.port);
	let listener = TcpListener::bind(&addr).await?;
	info!(%addr, "starting server");

	let server = tonic::transport::Server::builder()
		.add_service(BootstrapTokenServer::new(service));
	match (&config.tls_cert, &config.tls_key) {
		(Some(cert), Some(key)) => {
			info!(cert = %cert.display(), key = %key.display(), "serving with TLS");
			let tls = transport::tls_server_config(cert, key, &config.alpn_protocol)?;
			let incoming = transport::tls_incoming(listener, tls);
			server
				.serve_with_incoming_shutdown(incoming, transport::shutdown_signal())
				.await?;
		},
		(None, None) => {
			warn!("serving without transport security");
			let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
			server
				.serve_with_incoming_shutdown(incoming, transport::shutdown_signal())
				.await?;
		},
		_ => anyhow::bail!("TLS requires both a certificate and a key"),
	}
	Ok(())
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
