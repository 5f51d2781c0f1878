use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

/// Default port of the bootstrap token issuer.
pub const DEFAULT_PORT: u16 = 9123;
/// Hostname the platform attestation signer certificate must carry.
pub const DEFAULT_SIGNER_HOSTNAME: &str = "metadata.azure.com";
/// Identity-provider JWKS endpoint used to validate caller tokens.
pub const DEFAULT_JWKS_URL: &str =
	"https://login.microsoftonline.com/common/discovery/v2.0/keys";
/// ALPN next-protocol advertised by the issuer so intermediaries can route
/// on it.
pub const DEFAULT_ALPN_PROTOCOL: &str = "tlsbootstrap";
/// Path of the cluster configuration file carrying tenant and credential
/// fields.
pub const DEFAULT_CLUSTER_CONFIG_PATH: &str = "/etc/kubernetes/azure.json";

/// Settings for the `serve` subcommand (the token issuer).
#[derive(Debug, Clone)]
pub struct IssuerConfig {
	pub host: String,
	pub port: u16,
	pub signer_hostname: String,
	pub jwks_url: String,
	/// Expected `tid` claim; falls back to the cluster configuration file's
	/// tenant when empty.
	pub tenant_id: String,
	pub allowed_client_ids: Vec<String>,
	pub tls_cert: Option<PathBuf>,
	pub tls_key: Option<PathBuf>,
	pub alpn_protocol: String,
	pub root_cert_dir: Option<PathBuf>,
	pub intermediate_cert_dir: Option<PathBuf>,
	/// Namespace bootstrap-token secrets are created in.
	pub namespace: String,
	pub cluster_config_path: PathBuf,
	pub health_addr: Option<SocketAddr>,
	pub metrics_addr: Option<SocketAddr>,
	pub debug: bool,
}

/// Settings for the `approve` subcommand (the CSR approver).
#[derive(Debug, Clone)]
pub struct ApproverConfig {
	/// Namespace bootstrap-token secrets are read from.
	pub namespace: String,
	pub health_addr: Option<SocketAddr>,
	pub metrics_addr: Option<SocketAddr>,
	pub webhook_port: u16,
	pub leader_election: bool,
	pub debug: bool,
}

/// Settings for the `token` subcommand (the on-VM client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
	pub server_address: String,
	pub cluster_config_path: PathBuf,
	/// Managed-identity client ID override; when set, skips the cluster
	/// configuration file entirely.
	pub client_id: Option<String>,
	pub debug: bool,
}

/// The cluster configuration file (`azure.json`): tenant, client, and
/// credential fields shared by the kubelet and this system.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterFile {
	pub tenant_id: String,
	pub client_id: String,
	pub client_secret: SecretString,
	#[serde(rename = "userAssignedIdentityID")]
	pub user_assigned_identity_id: String,
}

impl std::fmt::Debug for ClusterFile {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClusterFile")
			.field("tenant_id", &self.tenant_id)
			.field("client_id", &self.client_id)
			.field("user_assigned_identity_id", &self.user_assigned_identity_id)
			.finish_non_exhaustive()
	}
}

impl ClusterFile {
	pub fn load(path: &Path) -> anyhow::Result<ClusterFile> {
		let contents = std::fs::read(path)
			.map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
		serde_json::from_slice(&contents)
			.map_err(|e| anyhow::anyhow!("failed to unmarshal {}: {e}", path.display()))
	}
}

/// Comma-separated list to entries, dropping empties.
pub fn split_ids(raw: &str) -> Vec<String> {
	raw
		.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(str::to_string)
		.collect()
}

/// Treat an empty string as unset.
pub fn empty_to_none(inp: Option<String>) -> Option<String> {
	match inp {
		Some(s) if s.is_empty() => None,
		other => other,
	}
}
