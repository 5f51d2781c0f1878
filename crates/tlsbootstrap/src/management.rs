use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use tracing::{info, warn};

/// Issuer and approver counters, exposed on the metrics listener.
pub struct Metrics {
	pub nonce_requests: Counter,
	pub tokens_issued: Counter,
	pub token_failures: Counter,
	pub csr_approved: Counter,
	pub csr_rejected: Counter,
	pub csr_requeued: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let nonce_requests = Counter::default();
		registry.register(
			"nonce_requests",
			"Nonce requests served",
			nonce_requests.clone(),
		);
		let tokens_issued = Counter::default();
		registry.register(
			"tokens_issued",
			"Bootstrap tokens minted",
			tokens_issued.clone(),
		);
		let token_failures = Counter::default();
		registry.register(
			"token_failures",
			"Token requests that failed",
			token_failures.clone(),
		);
		let csr_approved = Counter::default();
		registry.register("csr_approved", "CSRs approved", csr_approved.clone());
		let csr_rejected = Counter::default();
		registry.register(
			"csr_rejected",
			"CSRs rejected by policy",
			csr_rejected.clone(),
		);
		let csr_requeued = Counter::default();
		registry.register(
			"csr_requeued",
			"CSR reconciles requeued for retry",
			csr_requeued.clone(),
		);
		Metrics {
			nonce_requests,
			tokens_issued,
			token_failures,
			csr_approved,
			csr_rejected,
			csr_requeued,
		}
	}
}

/// Start the health and metrics listeners that are configured. The returned
/// handles are detached; dropping them does not stop the servers.
pub async fn spawn(
	health_addr: Option<SocketAddr>,
	metrics_addr: Option<SocketAddr>,
	registry: Registry,
) -> anyhow::Result<Vec<tokio::task::JoinHandle<()>>> {
	let mut handles = Vec::new();

	if let Some(addr) = health_addr {
		let listener = tokio::net::TcpListener::bind(addr).await?;
		info!(%addr, "health endpoint listening");
		let app = Router::new()
			.route("/healthz", get(ok))
			.route("/readyz", get(ok));
		handles.push(tokio::spawn(async move {
			if let Err(e) = axum::serve(listener, app).await {
				warn!("health server exited: {e}");
			}
		}));
	}

	if let Some(addr) = metrics_addr {
		let listener = tokio::net::TcpListener::bind(addr).await?;
		info!(%addr, "metrics endpoint listening");
		let app = Router::new()
			.route("/metrics", get(metrics_handler))
			.with_state(Arc::new(registry));
		handles.push(tokio::spawn(async move {
			if let Err(e) = axum::serve(listener, app).await {
				warn!("metrics server exited: {e}");
			}
		}));
	}

	Ok(handles)
}

async fn ok() -> &'static str {
	"ok\n"
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
	let mut body = String::new();
	match prometheus_client::encoding::text::encode(&mut body, &registry) {
		Ok(()) => (
			StatusCode::OK,
			[(
				header::CONTENT_TYPE,
				"application/openmetrics-text; version=1.0.0; charset=utf-8",
			)],
			body,
		)
			.into_response(),
		Err(e) => (
			StatusCode::INTERNAL_SERVER_ERROR,
			format!("failed to encode metrics: {e}"),
		)
			.into_response(),
	}
}
