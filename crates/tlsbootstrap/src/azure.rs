use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use azure_core::credentials::{AccessToken, TokenCredential, TokenRequestOptions};
use azure_identity::UserAssignedId;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, trace};

pub const ARM_API_VERSION: &str = "2022-03-01";
const ARM_ENDPOINT: &str = "https://management.azure.com";
const ARM_SCOPE: &[&str] = &["https://management.azure.com/.default"];
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
	#[error("failed to parse resource ID {0}")]
	ResourceIdMalformed(String),
	#[error("failed to obtain a control-plane credential: {0}")]
	CredentialUnavailable(String),
	#[error("control plane request failed: {0}")]
	ControlPlaneUnreachable(String),
	#[error("resource not found: {0}")]
	ResourceNotFound(String),
}

/// Canonical identity of an attested VM as recorded by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmIdentity {
	pub vm_id: String,
	pub computer_name: String,
}

/// Resolves a cloud resource ID to the VM identity the control plane holds.
/// The orchestrator performs no retries through this seam; transport-level
/// retry policy belongs to the caller.
#[async_trait::async_trait]
pub trait IdentityResolver: Send + Sync {
	async fn resolve(&self, resource_id: &str) -> Result<VmIdentity, ResolveError>;
}

/// The two resource shapes a node can present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
	VirtualMachine,
	ScaleSetInstance,
}

/// Parsed `/subscriptions/.../providers/Microsoft.Compute/...` identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
	pub subscription_id: String,
	pub resource_group: String,
	pub kind: ResourceKind,
	/// Resource name (the VM name, or the scale-set instance index).
	pub name: String,
}

impl ResourceId {
	pub fn parse(raw: &str) -> Result<ResourceId, ResolveError> {
		let malformed = || ResolveError::ResourceIdMalformed(raw.to_string());
		let segments: Vec<&str> = raw
			.strip_prefix('/')
			.ok_or_else(malformed)?
			.split('/')
			.collect();
		// subscriptions/<id>/resourceGroups/<rg>/providers/Microsoft.Compute/<type...>
		if segments.len() < 8
			|| !segments[0].eq_ignore_ascii_case("subscriptions")
			|| !segments[2].eq_ignore_ascii_case("resourceGroups")
			|| !segments[4].eq_ignore_ascii_case("providers")
			|| !segments[5].eq_ignore_ascii_case("Microsoft.Compute")
		{
			return Err(malformed());
		}
		let subscription_id = segments[1].to_string();
		let resource_group = segments[3].to_string();
		match &segments[6..] {
			[kind, name] if kind.eq_ignore_ascii_case("virtualMachines") => Ok(ResourceId {
				subscription_id,
				resource_group,
				kind: ResourceKind::VirtualMachine,
				name: (*name).to_string(),
			}),
			[kind, _scale_set, nested, instance]
				if kind.eq_ignore_ascii_case("virtualMachineScaleSets")
					&& nested.eq_ignore_ascii_case("virtualMachines") =>
			{
				Ok(ResourceId {
					subscription_id,
					resource_group,
					kind: ResourceKind::ScaleSetInstance,
					name: (*instance).to_string(),
				})
			},
			_ => Err(malformed()),
		}
	}
}

/// Control-plane representation of a VM resource. Only the fields the
/// issuer consumes; `osProfile` may be absent for specialty images.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VirtualMachineResource {
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub properties: Option<VmProperties>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmProperties {
	pub vm_id: Option<String>,
	pub os_profile: Option<OsProfile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OsProfile {
	pub computer_name: Option<String>,
}

/// Credential configuration for the control-plane client. Managed identity
/// is preferred; a client secret from the cluster configuration file is the
/// fallback.
#[derive(Debug, Clone, Default)]
pub struct CredentialConfig {
	pub user_assigned_identity_id: Option<String>,
	pub client_secret: Option<ClientSecretConfig>,
}

#[derive(Debug, Clone)]
pub struct ClientSecretConfig {
	pub tenant_id: String,
	pub client_id: String,
	pub client_secret: SecretString,
}

impl std::fmt::Debug for ChainCredential {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("ChainCredential")
	}
}

/// Tries each credential source in order, caching the first that yields a
/// token.
struct ChainCredential {
	sources: Vec<(&'static str, Arc<dyn TokenCredential>)>,
	/// Index of the source that first provided a token; `usize::MAX` until
	/// one has.
	cached_source_index: AtomicUsize,
}

#[async_trait::async_trait]
impl TokenCredential for ChainCredential {
	async fn get_token(
		&self,
		scopes: &[&str],
		options: Option<TokenRequestOptions<'_>>,
	) -> azure_core::Result<AccessToken> {
		let cached = self.cached_source_index.load(Ordering::Relaxed);
		if cached != usize::MAX {
			if let Some((name, source)) = self.sources.get(cached) {
				trace!("using cached credential: {name}");
				return source.get_token(scopes, options).await;
			}
		}

		let mut errors = Vec::new();
		for (index, (name, source)) in self.sources.iter().enumerate() {
			match source.get_token(scopes, options.clone()).await {
				Ok(token) => {
					debug!("authenticated with {name}");
					self.cached_source_index.store(index, Ordering::Relaxed);
					return Ok(token);
				},
				Err(error) => {
					trace!("{name} failed: {error}");
					errors.push(format!("{name}: {error}"));
				},
			}
		}
		Err(azure_core::Error::with_message_fn(
			azure_core::error::ErrorKind::Credential,
			|| format!("all credential sources failed:\n{}", errors.join("\n")),
		))
	}
}

fn build_credential(config: &CredentialConfig) -> anyhow::Result<Arc<dyn TokenCredential>> {
	let mut sources: Vec<(&'static str, Arc<dyn TokenCredential>)> = Vec::new();

	let options = config.user_assigned_identity_id.as_ref().map(|client_id| {
		azure_identity::ManagedIdentityCredentialOptions {
			user_assigned_id: Some(UserAssignedId::ClientId(client_id.clone())),
			client_options: Default::default(),
		}
	});
	match azure_identity::ManagedIdentityCredential::new(options) {
		Ok(cred) => sources.push(("ManagedIdentityCredential", cred)),
		Err(e) => debug!("managed identity credential not available: {e}"),
	}

	if let Some(sp) = &config.client_secret {
		let cred = azure_identity::ClientSecretCredential::new(
			&sp.tenant_id,
			sp.client_id.clone(),
			azure_core::credentials::Secret::new(sp.client_secret.expose_secret().to_string()),
			None,
		)?;
		sources.push(("ClientSecretCredential", cred));
	}

	if sources.is_empty() {
		anyhow::bail!("no control-plane credential source is configured");
	}
	Ok(Arc::new(ChainCredential {
		sources,
		cached_source_index: AtomicUsize::new(usize::MAX),
	}))
}

/// Control-plane backed resolver: GET the resource by ID with a fixed API
/// version and extract `properties.vmId` and the computer name.
pub struct ArmResolver {
	credential: Arc<dyn TokenCredential>,
	http: reqwest::Client,
}

impl ArmResolver {
	pub fn new(config: &CredentialConfig) -> anyhow::Result<Self> {
		let credential = build_credential(config)?;
		let http = reqwest::Client::builder()
			.timeout(REQUEST_TIMEOUT)
			.build()?;
		Ok(ArmResolver { credential, http })
	}
}

#[async_trait::async_trait]
impl IdentityResolver for ArmResolver {
	async fn resolve(&self, resource_id: &str) -> Result<VmIdentity, ResolveError> {
		let parsed = ResourceId::parse(resource_id)?;

		let token = self
			.credential
			.get_token(ARM_SCOPE, None)
			.await
			.map_err(|e| ResolveError::CredentialUnavailable(e.to_string()))?;

		let response = self
			.http
			.get(format!("{ARM_ENDPOINT}{resource_id}"))
			.query(&[("api-version", ARM_API_VERSION)])
			.bearer_auth(token.token.secret())
			.send()
			.await
			.map_err(|e| ResolveError::ControlPlaneUnreachable(e.to_string()))?;

		if response.status() == reqwest::StatusCode::NOT_FOUND {
			return Err(ResolveError::ResourceNotFound(resource_id.to_string()));
		}
		let resource: VirtualMachineResource = response
			.error_for_status()
			.map_err(|e| ResolveError::ControlPlaneUnreachable(e.to_string()))?
			.json()
			.await
			.map_err(|e| ResolveError::ControlPlaneUnreachable(e.to_string()))?;

		let identity = identity_from_resource(resource, &parsed.name)?;
		info!(
			resource_id,
			vm_id = %identity.vm_id,
			computer_name = %identity.computer_name,
			"resolved VM identity"
		);
		Ok(identity)
	}
}

/// Extract the identity fields, falling back to the resource's own name
/// when `osProfile` or `computerName` is absent.
fn identity_from_resource(
	resource: VirtualMachineResource,
	fallback_name: &str,
) -> Result<VmIdentity, ResolveError> {
	let properties = resource
		.properties
		.ok_or_else(|| ResolveError::ResourceNotFound("resource has no properties".to_string()))?;
	let vm_id = properties
		.vm_id
		.ok_or_else(|| ResolveError::ResourceNotFound("resource has no vmId".to_string()))?;
	let computer_name = properties
		.os_profile
		.and_then(|p| p.computer_name)
		.unwrap_or_else(|| {
			if resource.name.is_empty() {
				fallback_name.to_string()
			} else {
				resource.name
			}
		});
	Ok(VmIdentity {
		vm_id,
		computer_name,
	})
}
