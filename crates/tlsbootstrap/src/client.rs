use std::time::Duration;

use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, ClientTlsConfig};
use tracing::info;

use crate::config::{ClientConfig, ClusterFile, empty_to_none};
use crate::proto::v1::bootstrap_token_client::BootstrapTokenClient;
use crate::proto::v1::{NonceRequest, TokenRequest};

const IMDS_ENDPOINT: &str = "http://169.254.169.254";
const IMDS_API_VERSION: &str = "2021-05-01";
const IMDS_TOKEN_API_VERSION: &str = "2018-02-01";
const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";
/// Application scope of the issuer; client-credentials tokens are requested
/// for this audience.
const SERVICE_SCOPE: &str = "7319c514-987d-4e9b-ac3d-d38c4f427f4c/.default";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// kubectl/kubelet exec credential plugin output carrying the bootstrap
/// token.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredential {
	pub api_version: String,
	pub kind: String,
	pub status: ExecCredentialStatus,
}

#[derive(Debug, Serialize)]
pub struct ExecCredentialStatus {
	pub token: String,
}

impl ExecCredential {
	fn new(token: String) -> Self {
		ExecCredential {
			api_version: "client.authentication.k8s.io/v1".to_string(),
			kind: "ExecCredential".to_string(),
			status: ExecCredentialStatus { token },
		}
	}
}

#[derive(Debug, Deserialize)]
pub struct InstanceData {
	pub compute: ComputeData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeData {
	#[serde(default)]
	pub resource_id: String,
}

/// `/metadata/attested/document` response.
#[derive(Debug, Deserialize)]
pub struct AttestedBlob {
	#[serde(default)]
	pub encoding: String,
	#[serde(default)]
	pub signature: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MsiTokenResponse {
	access_token: String,
	error: String,
	error_description: String,
}

/// Client for the platform metadata service: unauthenticated link-local
/// endpoint, `Metadata: True` header on every request, no proxy.
pub struct ImdsClient {
	http: reqwest::Client,
	endpoint: String,
}

impl ImdsClient {
	pub fn new() -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.no_proxy()
			.timeout(REQUEST_TIMEOUT)
			.build()?;
		Ok(ImdsClient {
			http,
			endpoint: IMDS_ENDPOINT.to_string(),
		})
	}

	#[cfg(test)]
	pub(crate) fn with_endpoint(mut self, endpoint: String) -> Self {
		self.endpoint = endpoint;
		self
	}

	async fn get_json<T: DeserializeOwned>(
		&self,
		path: &str,
		query: &[(&str, &str)],
	) -> anyhow::Result<T> {
		let response = self
			.http
			.get(format!("{}{path}", self.endpoint))
			.header("Metadata", "True")
			.query(query)
			.send()
			.await?
			.error_for_status()?;
		Ok(response.json().await?)
	}

	pub async fn instance(&self) -> anyhow::Result<InstanceData> {
		self
			.get_json(
				"/metadata/instance",
				&[("api-version", IMDS_API_VERSION), ("format", "json")],
			)
			.await
			.map_err(|e| anyhow::anyhow!("failed to retrieve instance metadata: {e}"))
	}

	pub async fn attested_document(&self, nonce: &str) -> anyhow::Result<AttestedBlob> {
		self
			.get_json(
				"/metadata/attested/document",
				&[
					("api-version", IMDS_API_VERSION),
					("format", "json"),
					("nonce", nonce),
				],
			)
			.await
			.map_err(|e| anyhow::anyhow!("failed to retrieve attested data: {e}"))
	}

	/// Managed-identity access token for the control-plane resource.
	pub async fn msi_token(&self, client_id: Option<&str>) -> anyhow::Result<String> {
		let mut query = vec![
			("api-version", IMDS_TOKEN_API_VERSION),
			("resource", MANAGEMENT_RESOURCE),
		];
		if let Some(id) = client_id {
			query.push(("client_id", id));
		}
		let data: MsiTokenResponse = self
			.get_json("/metadata/identity/oauth2/token", &query)
			.await
			.map_err(|e| anyhow::anyhow!("failed to retrieve managed identity token: {e}"))?;
		if !data.error.is_empty() {
			anyhow::bail!(
				"failed to retrieve managed identity token ({}): {}",
				data.error,
				data.error_description
			);
		}
		Ok(data.access_token)
	}
}

/// Run the full bootstrap handshake from the VM and return the
/// ExecCredential JSON for the kubelet.
pub async fn bootstrap(config: ClientConfig) -> anyhow::Result<String> {
	let imds = ImdsClient::new()?;

	info!("retrieving instance metadata");
	let instance = imds.instance().await?;
	let resource_id = instance.compute.resource_id;
	anyhow::ensure!(!resource_id.is_empty(), "instance metadata has no resource ID");

	let bearer = acquire_auth_token(&config, &imds).await?;

	info!(server = %config.server_address, "retrieving nonce from bootstrap token server");
	let mut client = connect(&config.server_address, &bearer).await?;
	let nonce = client
		.get_nonce(NonceRequest {
			resource_id: resource_id.clone(),
		})
		.await?
		.into_inner()
		.nonce;
	info!(%nonce, "received nonce reply");

	info!("retrieving attested data");
	let attested = imds.attested_document(&nonce).await?;

	info!("retrieving bootstrap token");
	let reply = client
		.get_token(TokenRequest {
			resource_id,
			nonce,
			attested_data: attested.signature,
		})
		.await?
		.into_inner();
	info!(expiration = %reply.expiration, "received token reply");

	let credential = ExecCredential::new(reply.token);
	Ok(serde_json::to_string(&credential)?)
}

async fn connect(
	address: &str,
	bearer: &str,
) -> anyhow::Result<
	BootstrapTokenClient<
		tonic::service::interceptor::InterceptedService<Channel, AuthInterceptor>,
	>,
> {
	let url = if address.contains("://") {
		address.to_string()
	} else {
		format!("https://{address}")
	};
	let mut endpoint = Channel::from_shared(url.clone())?;
	if url.starts_with("https://") {
		endpoint = endpoint.tls_config(ClientTlsConfig::new().with_native_roots())?;
	}
	let channel = endpoint.connect().await?;
	let header = MetadataValue::try_from(format!("Bearer {bearer}"))?;
	Ok(BootstrapTokenClient::with_interceptor(
		channel,
		AuthInterceptor { header },
	))
}

/// Attaches the bearer credential to every RPC.
#[derive(Clone)]
pub struct AuthInterceptor {
	header: MetadataValue<tonic::metadata::Ascii>,
}

impl tonic::service::Interceptor for AuthInterceptor {
	fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
		request
			.metadata_mut()
			.insert("authorization", self.header.clone());
		Ok(request)
	}
}

/// Managed identity preferred; client-secret flow from the cluster
/// configuration file as the fallback.
async fn acquire_auth_token(config: &ClientConfig, imds: &ImdsClient) -> anyhow::Result<String> {
	if let Some(client_id) = &config.client_id {
		info!("retrieving managed identity access token");
		return imds.msi_token(Some(client_id)).await;
	}

	let file = ClusterFile::load(&config.cluster_config_path)?;
	if file.client_id == "msi" {
		info!("retrieving managed identity access token");
		let id = empty_to_none(Some(file.user_assigned_identity_id.clone()));
		return imds.msi_token(id.as_deref()).await;
	}
	if !file.client_id.is_empty() {
		info!("acquiring token via client-credentials flow");
		use azure_core::credentials::TokenCredential;
		let credential = azure_identity::ClientSecretCredential::new(
			&file.tenant_id,
			file.client_id.clone(),
			azure_core::credentials::Secret::new(file.client_secret.expose_secret().to_string()),
			None,
		)?;
		let token = credential.get_token(&[SERVICE_SCOPE], None).await?;
		return Ok(token.token.secret().to_string());
	}
	anyhow::bail!("failed to find authentication via the cluster configuration or managed identity")
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
