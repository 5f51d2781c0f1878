use std::collections::BTreeSet;
use std::io::Cursor;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rustls_pemfile::Item;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use crate::cluster::{
	BOOTSTRAP_TOKEN_SECRET_PREFIX, CertificateSigningRequest, Cluster, ClusterError,
	ConditionType, CsrCondition, HOSTNAME_ANNOTATION, KUBE_APISERVER_CLIENT_SIGNER,
	KUBELET_SERVING_SIGNER, USAGE_CLIENT_AUTH, USAGE_DIGITAL_SIGNATURE, USAGE_KEY_ENCIPHERMENT,
	USAGE_SERVER_AUTH,
};
use crate::config::ApproverConfig;
use crate::management::{self, Metrics};
use crate::transport;

pub const APPROVAL_REASON: &str = "AutoApproved";
pub const APPROVAL_MESSAGE: &str = "AutomaticSecureApproval";

const LEASE_KEY: &str = "tlsbootstrap-csr-approver";
const LEASE_TTL: Duration = Duration::from_secs(30);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(10);

const REQUEUE_BASE_DELAY: Duration = Duration::from_secs(1);
const REQUEUE_MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
	/// The CSR violates admission policy. Terminal; the reconcile ends and
	/// the object is left untouched.
	#[error("{0}")]
	PolicyViolation(String),
	/// A lookup raced ahead of cluster state (the bootstrap secret may land
	/// after the CSR event). Requeue with backoff.
	#[error("{0}")]
	RetryableLookup(String),
	#[error("failed to patch approval: {0}")]
	PatchFailed(ClusterError),
}

impl ReconcileError {
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			ReconcileError::RetryableLookup(_) | ReconcileError::PatchFailed(_)
		)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
	Skipped,
	Approved,
}

/// Reconciles pending node CSRs: parse, classify by signer, validate against
/// the serving or client policy, and approve.
pub struct CsrApprover {
	cluster: Arc<dyn Cluster>,
	/// Fallback namespace for bootstrap-token secrets when the CSR carries
	/// none (CSRs are cluster-scoped).
	namespace: String,
	metrics: Arc<Metrics>,
}

impl CsrApprover {
	pub fn new(cluster: Arc<dyn Cluster>, namespace: String, metrics: Arc<Metrics>) -> Self {
		CsrApprover {
			cluster,
			namespace,
			metrics,
		}
	}

	/// Decide once for the named CSR. Reads the object fresh; terminal
	/// failures end the reconcile without mutating the object.
	pub async fn reconcile(&self, name: &str) -> Result<Outcome, ReconcileError> {
		let csr = match self.cluster.get_csr(name).await {
			Ok(csr) => csr,
			// Deleted between event and read.
			Err(ClusterError::NotFound(_)) => return Ok(Outcome::Skipped),
			Err(e) => return Err(ReconcileError::RetryableLookup(e.to_string())),
		};

		if should_skip(&csr) {
			debug!(csr = name, "skipping csr");
			return Ok(Outcome::Skipped);
		}

		match csr.signer_name.as_str() {
			KUBELET_SERVING_SIGNER => {
				let req = parse_csr(&csr.request_pem).map_err(ReconcileError::PolicyViolation)?;
				validate_serving_csr(&csr, &req).map_err(ReconcileError::PolicyViolation)?;
			},
			KUBE_APISERVER_CLIENT_SIGNER => {
				let req = parse_csr(&csr.request_pem).map_err(ReconcileError::PolicyViolation)?;
				let token_id =
					username_token_id(&csr.username).map_err(ReconcileError::PolicyViolation)?;
				let namespace = if csr.namespace.is_empty() {
					self.namespace.as_str()
				} else {
					csr.namespace.as_str()
				};
				let secret_name = format!("{BOOTSTRAP_TOKEN_SECRET_PREFIX}{token_id}");
				let secret = self
					.cluster
					.get_secret(namespace, &secret_name)
					.await
					.map_err(|_| {
						ReconcileError::RetryableLookup(format!(
							"failed to get bootstrap token {token_id} for csr"
						))
					})?;
				let hostname = secret
					.annotations
					.get(HOSTNAME_ANNOTATION)
					.cloned()
					.unwrap_or_default();
				validate_client_csr(&csr, &req, &hostname).map_err(ReconcileError::PolicyViolation)?;
			},
			// should_skip filters unknown signers.
			_ => return Ok(Outcome::Skipped),
		}

		info!(csr = name, "validated successfully, should approve");
		let mut csr = csr;
		set_approval_condition(&mut csr, APPROVAL_MESSAGE);
		self
			.cluster
			.update_approval(&csr)
			.await
			.map_err(ReconcileError::PatchFailed)?;
		info!(csr = name, "patched successfully");
		self.metrics.csr_approved.inc();
		Ok(Outcome::Approved)
	}
}

fn should_skip(csr: &CertificateSigningRequest) -> bool {
	if !csr.certificate.is_empty() {
		return true;
	}
	if csr.is_approved_or_denied() {
		return true;
	}
	csr.signer_name != KUBELET_SERVING_SIGNER && csr.signer_name != KUBE_APISERVER_CLIENT_SIGNER
}

/// Replace an existing Approved condition in place, else append one.
fn set_approval_condition(csr: &mut CertificateSigningRequest, message: &str) {
	let condition = CsrCondition {
		condition_type: ConditionType::Approved,
		status: "True".to_string(),
		reason: APPROVAL_REASON.to_string(),
		message: message.to_string(),
	};
	match csr
		.conditions
		.iter_mut()
		.find(|c| c.condition_type == ConditionType::Approved)
	{
		Some(existing) => *existing = condition,
		None => csr.conditions.push(condition),
	}
}

/// Subject and SAN material of a decoded PKCS#10 request.
#[derive(Debug, Default, Clone)]
pub struct ParsedRequest {
	pub common_name: String,
	pub organization: Vec<String>,
	pub dns_names: Vec<String>,
	pub ip_addresses: Vec<String>,
	pub email_addresses: Vec<String>,
	pub uris: Vec<String>,
}

fn parse_csr(pem: &[u8]) -> Result<ParsedRequest, String> {
	let mut reader = std::io::BufReader::new(Cursor::new(pem));
	let der = match rustls_pemfile::read_one(&mut reader) {
		Ok(Some(Item::Csr(der))) => der,
		_ => return Err("PEM block type must be CERTIFICATE REQUEST".to_string()),
	};
	let (_, req) = X509CertificationRequest::from_der(der.as_ref())
		.map_err(|e| format!("unable to parse csr: {e}"))?;
	let info = &req.certification_request_info;

	let mut parsed = ParsedRequest {
		common_name: info
			.subject
			.iter_common_name()
			.next()
			.and_then(|attr| attr.as_str().ok())
			.unwrap_or_default()
			.to_string(),
		organization: info
			.subject
			.iter_organization()
			.filter_map(|attr| attr.as_str().ok())
			.map(str::to_string)
			.collect(),
		..Default::default()
	};

	if let Some(extensions) = req.requested_extensions() {
		for ext in extensions {
			if let ParsedExtension::SubjectAlternativeName(san) = ext {
				for name in &san.general_names {
					match name {
						GeneralName::DNSName(dns) => parsed.dns_names.push((*dns).to_string()),
						GeneralName::IPAddress(bytes) => {
							parsed.ip_addresses.push(format_ip(bytes));
						},
						GeneralName::RFC822Name(email) => {
							parsed.email_addresses.push((*email).to_string());
						},
						GeneralName::URI(uri) => parsed.uris.push((*uri).to_string()),
						_ => {},
					}
				}
			}
		}
	}
	Ok(parsed)
}

fn format_ip(bytes: &[u8]) -> String {
	match bytes.len() {
		4 => IpAddr::from([bytes[0], bytes[1], bytes[2], bytes[3]]).to_string(),
		16 => {
			let mut octets = [0u8; 16];
			octets.copy_from_slice(bytes);
			IpAddr::from(octets).to_string()
		},
		_ => hex::encode(bytes),
	}
}

/// `system:bootstrap:<tokenId>`, exactly two colons.
fn username_token_id(username: &str) -> Result<&str, String> {
	if !username.starts_with("system:bootstrap:") {
		return Err(format!(
			"client csr should be requested by system:bootstrap:<token_id>, not {username}"
		));
	}
	let parts: Vec<&str> = username.split(':').collect();
	if parts.len() != 3 {
		return Err(format!(
			"expected csr username {username:?} to have 2 colons and 3 components, actual {}",
			parts.len()
		));
	}
	Ok(parts[2])
}

/// `system:node:<name>`, exactly two colons; returns the node name.
fn node_name(subject: &str) -> Result<&str, String> {
	let parts: Vec<&str> = subject.split(':').collect();
	if parts.len() != 3 {
		return Err(format!(
			"expected {subject:?} to have 2 colons and 3 components, actual {}",
			parts.len()
		));
	}
	Ok(parts[2])
}

fn validate_serving_csr(
	csr: &CertificateSigningRequest,
	req: &ParsedRequest,
) -> Result<(), String> {
	// The requesting node's username is the certificate's common name.
	if csr.username != req.common_name {
		return Err(format!(
			"csr username {:?} does not match x509 common name {:?}",
			csr.username, req.common_name
		));
	}
	if !req.common_name.starts_with("system:node:") {
		return Err("subject common name does not begin with 'system:node:'".to_string());
	}
	if req.organization != ["system:nodes"] {
		return Err("subject organization is not system:nodes".to_string());
	}
	if req.dns_names.is_empty() && req.ip_addresses.is_empty() {
		return Err("DNS or IP subjectAltName is required".to_string());
	}

	let node = node_name(&csr.username)?;
	if !req.dns_names.iter().any(|dns| dns == node) {
		return Err(format!("csr missing node hostname {node:?} as dns name"));
	}

	if !req.email_addresses.is_empty() {
		return Err("email subjectAltNames are not allowed".to_string());
	}
	if !req.uris.is_empty() {
		return Err("URI subjectAltNames are not allowed".to_string());
	}

	if !has_exact_usages(
		&csr.usages,
		&[USAGE_DIGITAL_SIGNATURE, USAGE_KEY_ENCIPHERMENT, USAGE_SERVER_AUTH],
	) {
		return Err(format!("usages did not match {:?}", csr.usages));
	}
	Ok(())
}

fn validate_client_csr(
	csr: &CertificateSigningRequest,
	req: &ParsedRequest,
	validated_hostname: &str,
) -> Result<(), String> {
	if req.organization != ["system:nodes"] {
		return Err("subject organization is not system:nodes".to_string());
	}
	if !req.dns_names.is_empty() {
		return Err("DNS subjectAltNames are not allowed".to_string());
	}
	if !req.email_addresses.is_empty() {
		return Err("email subjectAltNames are not allowed".to_string());
	}
	if !req.ip_addresses.is_empty() {
		return Err("IP subjectAltNames are not allowed".to_string());
	}
	if !req.uris.is_empty() {
		return Err("URI subjectAltNames are not allowed".to_string());
	}

	if !req.common_name.starts_with("system:node:") {
		return Err("subject common name does not begin with 'system:node:'".to_string());
	}
	let requested = node_name(&req.common_name)?;

	// The hostname annotated at issuance bounds what the token may request.
	if validated_hostname != requested {
		return Err(format!(
			"requested common name {requested:?} does not match allowed hostname {validated_hostname:?}"
		));
	}

	if !has_exact_usages(
		&csr.usages,
		&[USAGE_DIGITAL_SIGNATURE, USAGE_KEY_ENCIPHERMENT, USAGE_CLIENT_AUTH],
	) {
		return Err(format!("usages did not match {:?}", csr.usages));
	}
	Ok(())
}

fn has_exact_usages(usages: &[String], want: &[&str]) -> bool {
	let got: BTreeSet<&str> = usages.iter().map(String::as_str).collect();
	let want: BTreeSet<&str> = want.iter().copied().collect();
	got == want && usages.len() == want.len()
}

fn backoff(attempt: u32) -> Duration {
	REQUEUE_BASE_DELAY
		.saturating_mul(1u32 << attempt.min(6))
		.min(REQUEUE_MAX_DELAY)
}

/// Run the approver until shutdown: consume CSR events, reconcile each, and
/// requeue retryable failures with backoff. Per-object work is serialized
/// by the single consumer loop.
pub async fn run(config: ApproverConfig, cluster: Arc<dyn Cluster>) -> anyhow::Result<()> {
	let mut registry = prometheus_client::registry::Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));
	let _management = management::spawn(config.health_addr, config.metrics_addr, registry).await?;

	let holder = std::env::var("POD_NAME")
		.unwrap_or_else(|_| format!("csr-approver-{}", std::process::id()));
	if config.leader_election {
		acquire_leadership(cluster.as_ref(), &holder).await?;
	}
	let leadership = {
		let cluster = cluster.clone();
		let enabled = config.leader_election;
		let holder = holder.clone();
		async move {
			if enabled {
				hold_leadership(cluster, holder).await
			} else {
				std::future::pending::<anyhow::Error>().await
			}
		}
	};
	tokio::pin!(leadership);

	let approver = CsrApprover::new(cluster.clone(), config.namespace.clone(), metrics.clone());
	let mut events = cluster
		.watch_csrs()
		.await
		.map_err(|e| anyhow::anyhow!("failed to watch CSRs: {e}"))?;
	let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel::<(String, u32)>();

	let shutdown = transport::shutdown_signal();
	tokio::pin!(shutdown);

	info!("starting approver");
	loop {
		tokio::select! {
			event = events.next() => {
				let Some(name) = event else {
					info!("csr event stream closed");
					return Ok(());
				};
				handle_event(&approver, &metrics, name, 0, &requeue_tx).await;
			},
			Some((name, attempt)) = requeue_rx.recv() => {
				handle_event(&approver, &metrics, name, attempt, &requeue_tx).await;
			},
			err = &mut leadership => {
				return Err(err.context("leadership lost"));
			},
			_ = &mut shutdown => {
				return Ok(());
			},
		}
	}
}

async fn handle_event(
	approver: &CsrApprover,
	metrics: &Metrics,
	name: String,
	attempt: u32,
	requeue_tx: &mpsc::UnboundedSender<(String, u32)>,
) {
	match approver.reconcile(&name).await {
		Ok(_) => {},
		Err(e) if e.is_retryable() => {
			metrics.csr_requeued.inc();
			let delay = backoff(attempt);
			warn!(csr = %name, "retryable error, will requeue in {delay:?}: {e}");
			let tx = requeue_tx.clone();
			tokio::spawn(async move {
				tokio::time::sleep(delay).await;
				let _ = tx.send((name, attempt + 1));
			});
		},
		Err(e) => {
			metrics.csr_rejected.inc();
			warn!(csr = %name, "terminal error, will not requeue: {e}");
		},
	}
}

async fn acquire_leadership(cluster: &dyn Cluster, holder: &str) -> anyhow::Result<()> {
	info!(holder, "waiting for leadership lease");
	loop {
		let acquired = cluster
			.try_acquire_lease(LEASE_KEY, holder, LEASE_TTL)
			.await
			.map_err(|e| anyhow::anyhow!("failed to acquire leadership lease: {e}"))?;
		if acquired {
			info!(holder, "acquired leadership lease");
			return Ok(());
		}
		tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
	}
}

/// Renews the lease until it is lost; returns the reason.
async fn hold_leadership(cluster: Arc<dyn Cluster>, holder: String) -> anyhow::Error {
	let mut ticker = tokio::time::interval(LEASE_RENEW_INTERVAL);
	ticker.tick().await;
	loop {
		ticker.tick().await;
		match cluster
			.try_acquire_lease(LEASE_KEY, &holder, LEASE_TTL)
			.await
		{
			Ok(true) => {},
			Ok(false) => return anyhow::anyhow!("leadership lease taken by another holder"),
			Err(e) => return anyhow::anyhow!("failed to renew leadership lease: {e}"),
		}
	}
}

#[cfg(test)]
#[path = "approver_tests.rs"]
mod tests;
