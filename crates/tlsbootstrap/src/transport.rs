use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use futures::Stream;
use rustls::ServerConfig;
use rustls_pemfile::Item;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub static ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
	&[&rustls::version::TLS12, &rustls::version::TLS13];

pub fn provider() -> Arc<rustls::crypto::CryptoProvider> {
	Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Server-side TLS for the issuer. The configured ALPN protocol is
/// advertised first so intermediaries can route on it; h2 follows for the
/// gRPC transport itself.
pub fn tls_server_config(
	cert_path: &Path,
	key_path: &Path,
	alpn_protocol: &str,
) -> anyhow::Result<ServerConfig> {
	let certs = load_certs(cert_path)?;
	let key = load_key(key_path)?;
	let mut config = ServerConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)?
		.with_no_client_auth()
		.with_single_cert(certs, key)?;
	config.alpn_protocols = vec![alpn_protocol.as_bytes().to_vec(), b"h2".to_vec()];
	Ok(config)
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let data = std::fs::read(path)
		.map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
	let mut reader = std::io::BufReader::new(Cursor::new(data));
	let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
	let certs = certs.map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
	anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
	Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
	let data = std::fs::read(path)
		.map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
	let mut reader = std::io::BufReader::new(Cursor::new(data));
	loop {
		match rustls_pemfile::read_one(&mut reader)? {
			Some(Item::Pkcs8Key(key)) => return Ok(PrivateKeyDer::Pkcs8(key)),
			Some(Item::Sec1Key(key)) => return Ok(PrivateKeyDer::Sec1(key)),
			Some(Item::Pkcs1Key(key)) => return Ok(PrivateKeyDer::Pkcs1(key)),
			Some(_) => continue,
			None => anyhow::bail!("no private key in {}", path.display()),
		}
	}
}

/// Accepted-and-handshaken TLS connections as an incoming stream for the
/// gRPC server. Handshake failures are logged and skipped.
pub fn tls_incoming(
	listener: TcpListener,
	config: ServerConfig,
) -> impl Stream<Item = Result<tokio_rustls::server::TlsStream<TcpStream>, std::io::Error>> {
	let acceptor = TlsAcceptor::from(Arc::new(config));
	async_stream::stream! {
		loop {
			match listener.accept().await {
				Ok((stream, peer)) => match acceptor.accept(stream).await {
					Ok(tls) => yield Ok(tls),
					Err(e) => debug!(%peer, "TLS handshake failed: {e}"),
				},
				Err(e) => warn!("failed to accept connection: {e}"),
			}
		}
	}
}

/// Completes when the process is asked to stop.
#[cfg(unix)]
pub async fn shutdown_signal() {
	use tokio::signal::unix::{SignalKind, signal};
	let mut term = signal(SignalKind::terminate()).expect("failed to register signal handler");
	tokio::select! {
		_ = tokio::signal::ctrl_c() => info!("received SIGINT, starting shutdown"),
		_ = term.recv() => info!("received SIGTERM, starting shutdown"),
	}
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
	info!("received signal, starting shutdown");
}
