//! Issues short-lived cluster-join credentials to attested cloud VMs and
//! approves the node certificate-signing requests they submit.
//!
//! Two services share this library: the bootstrap token issuer
//! ([`server`]) and the CSR approver ([`approver`]). The issuer proves a
//! caller is a genuine VM by validating a platform-signed attestation
//! document ([`attest`]) bound to a single-use challenge ([`nonce`]),
//! cross-checks the VM against the cloud control plane ([`azure`]), and
//! mints a namespace-scoped bootstrap credential ([`token`]). The approver
//! admits node CSRs only when their shape satisfies policy and, for client
//! certificates, the requesting token's recorded hostname matches.

pub mod approver;
pub mod attest;
pub mod authn;
pub mod azure;
pub mod client;
pub mod cluster;
pub mod config;
pub mod management;
pub mod nonce;
pub mod pkcs7;
pub mod proto;
pub mod server;
pub mod telemetry;
pub mod token;
pub mod transport;
pub mod trust;

#[cfg(test)]
pub(crate) mod testutil;
