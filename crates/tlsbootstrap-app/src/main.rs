use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tlsbootstrap::cluster::memory::MemoryCluster;
use tlsbootstrap::config::{
	ApproverConfig, ClientConfig, DEFAULT_ALPN_PROTOCOL, DEFAULT_CLUSTER_CONFIG_PATH,
	DEFAULT_JWKS_URL, DEFAULT_PORT, DEFAULT_SIGNER_HOSTNAME, IssuerConfig, split_ids,
};
use tlsbootstrap::telemetry::{self, LogFormat};

#[derive(Parser, Debug)]
#[command(name = "tlsbootstrap", about = "TLS bootstrap token issuer and CSR approver", long_about = None)]
struct Args {
	/// Log format: json or text.
	#[arg(long, env = "LOG_FORMAT", default_value = "json")]
	log_format: LogFormat,

	/// Enable debug logging (WILL LOG AUTHENTICATION DATA).
	#[arg(long, env = "DEBUG")]
	debug: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run the bootstrap token issuer.
	Serve(ServeArgs),
	/// Run the CSR approver.
	Approve(ApproveArgs),
	/// Fetch a bootstrap token from a VM and print an ExecCredential.
	Token(TokenArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
	/// The hostname to listen on.
	#[arg(long, env = "BIND_HOST", default_value = "0.0.0.0")]
	hostname: String,

	/// The port to run the gRPC server on.
	#[arg(long, env = "BIND_PORT", default_value_t = DEFAULT_PORT)]
	port: u16,

	/// The hostname that must be present in the attestation signing
	/// certificate.
	#[arg(long = "signer-hostname", env = "SIGNER_HOSTNAME", default_value = DEFAULT_SIGNER_HOSTNAME)]
	signer_hostname: String,

	/// The identity provider's JWKS endpoint.
	#[arg(long = "jwks-url", env = "JWKS_URL", default_value = DEFAULT_JWKS_URL)]
	jwks_url: String,

	/// Expected token tenant; defaults to the cluster configuration file's
	/// tenant.
	#[arg(long = "tenant-id", env = "TENANT_ID", default_value = "")]
	tenant_id: String,

	/// Comma-separated list of allowed client IDs for the service.
	#[arg(long = "allowed-client-ids", env = "ALLOWED_CLIENT_IDS", default_value = "")]
	allowed_client_ids: String,

	/// TLS certificate path.
	#[arg(long = "tls-cert", env = "TLS_CERT")]
	tls_cert: Option<PathBuf>,

	/// TLS key path.
	#[arg(long = "tls-key", env = "TLS_KEY")]
	tls_key: Option<PathBuf>,

	/// ALPN next-protocol advertised first on the TLS listener.
	#[arg(long = "alpn-protocol", env = "ALPN_PROTOCOL", default_value = DEFAULT_ALPN_PROTOCOL)]
	alpn_protocol: String,

	/// Directory of root certificates; the system store is used when unset.
	#[arg(long = "root-cert-dir", env = "ROOT_CERT_DIR")]
	root_cert_dir: Option<PathBuf>,

	/// Directory of intermediate certificates to preload into the cache.
	#[arg(long = "intermediate-cert-dir", env = "INTERMEDIATE_CERT_DIR")]
	intermediate_cert_dir: Option<PathBuf>,

	/// Namespace bootstrap-token secrets are created in.
	#[arg(long, env = "POD_NAMESPACE", default_value = "kube-system")]
	namespace: String,

	/// Cluster configuration file with tenant and credential fields.
	#[arg(long = "cluster-config", env = "CLUSTER_CONFIG", default_value = DEFAULT_CLUSTER_CONFIG_PATH)]
	cluster_config: PathBuf,

	/// Health endpoint bind address.
	#[arg(long = "health-addr", env = "HEALTH_ADDR")]
	health_addr: Option<SocketAddr>,

	/// Metrics endpoint bind address.
	#[arg(long = "metrics-addr", env = "METRICS_ADDR")]
	metrics_addr: Option<SocketAddr>,
}

#[derive(Parser, Debug)]
struct ApproveArgs {
	/// Namespace bootstrap-token secrets are read from.
	#[arg(long, env = "POD_NAMESPACE", default_value = "kube-system")]
	namespace: String,

	/// The address the health endpoint binds to.
	#[arg(long = "health-addr", env = "HEALTH_ADDR", default_value = "0.0.0.0:9440")]
	health_addr: SocketAddr,

	/// The address the metrics endpoint binds to; disabled when unset.
	#[arg(long = "metrics-addr", env = "METRICS_ADDR")]
	metrics_addr: Option<SocketAddr>,

	/// Webhook server port, disabled by default.
	#[arg(long = "webhook-port", env = "WEBHOOK_PORT", default_value_t = 0)]
	webhook_port: u16,

	/// Ensure at most one active approver via a leadership lease.
	#[arg(
		long = "enable-leader-election",
		env = "ENABLE_LEADER_ELECTION",
		default_value_t = true,
		action = clap::ArgAction::Set
	)]
	enable_leader_election: bool,
}

#[derive(Parser, Debug)]
struct TokenArgs {
	/// The hostname and port of the bootstrap token server.
	#[arg(long, env = "SERVER_ADDRESS", default_value = "localhost:9123")]
	server: String,

	/// Managed-identity client ID override.
	#[arg(long = "client-id", env = "CLIENT_ID")]
	client_id: Option<String>,

	/// Cluster configuration file with tenant and credential fields.
	#[arg(long = "cluster-config", env = "CLUSTER_CONFIG", default_value = DEFAULT_CLUSTER_CONFIG_PATH)]
	cluster_config: PathBuf,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	telemetry::setup_logging(args.log_format, args.debug);

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
	match args.command {
		Command::Serve(serve) => {
			let config = IssuerConfig {
				host: serve.hostname,
				port: serve.port,
				signer_hostname: serve.signer_hostname,
				jwks_url: serve.jwks_url,
				tenant_id: serve.tenant_id,
				allowed_client_ids: split_ids(&serve.allowed_client_ids),
				tls_cert: serve.tls_cert,
				tls_key: serve.tls_key,
				alpn_protocol: serve.alpn_protocol,
				root_cert_dir: serve.root_cert_dir,
				intermediate_cert_dir: serve.intermediate_cert_dir,
				namespace: serve.namespace,
				cluster_config_path: serve.cluster_config,
				health_addr: serve.health_addr,
				metrics_addr: serve.metrics_addr,
				debug: args.debug,
			};
			// The secret store and CSR plumbing sit behind the Cluster
			// seam; the in-memory implementation backs local runs.
			let cluster = Arc::new(MemoryCluster::new());
			tlsbootstrap::server::run(config, cluster).await
		},
		Command::Approve(approve) => {
			let config = ApproverConfig {
				namespace: approve.namespace,
				health_addr: Some(approve.health_addr),
				metrics_addr: approve.metrics_addr,
				webhook_port: approve.webhook_port,
				leader_election: approve.enable_leader_election,
				debug: args.debug,
			};
			let cluster = Arc::new(MemoryCluster::new());
			tlsbootstrap::approver::run(config, cluster).await
		},
		Command::Token(token) => {
			let config = ClientConfig {
				server_address: token.server,
				cluster_config_path: token.cluster_config,
				client_id: token.client_id,
				debug: args.debug,
			};
			let credential = tlsbootstrap::client::bootstrap(config).await?;
			println!("{credential}");
			Ok(())
		},
	}
}
