use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngExt;
use tracing::info;

/// How long a nonce may be outstanding before the handshake must restart.
pub const NONCE_LIFETIME: Duration = Duration::from_secs(30);
/// Cadence of the background expiration sweep.
pub const EXPIRATION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

const NONCE_BYTES: usize = 5;
const MAX_GENERATION_ATTEMPTS: usize = 100;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NonceError {
	#[error("unable to generate a non-colliding nonce after {MAX_GENERATION_ATTEMPTS} attempts")]
	GenerationExhausted,
}

/// One outstanding challenge. Created by GetNonce, enriched during GetToken,
/// removed on successful issuance or by the sweeper.
#[derive(Debug, Clone)]
pub struct NonceRecord {
	pub nonce: String,
	pub resource_id: String,
	pub vm_id: Option<String>,
	pub vm_name: Option<String>,
	pub expires_at: DateTime<Utc>,
}

impl NonceRecord {
	pub fn is_expired(&self) -> bool {
		self.expires_at < Utc::now()
	}
}

/// Single-use, time-bounded challenge store. All mutation happens in short
/// critical sections; callers never hold the lock across I/O.
#[derive(Default)]
pub struct NonceCache {
	records: Mutex<HashMap<String, NonceRecord>>,
}

impl NonceCache {
	pub fn new() -> Arc<Self> {
		Arc::new(NonceCache::default())
	}

	/// Create a record for `resource_id` under a fresh nonce. Entropy comes
	/// from the OS-seeded CSPRNG; collisions are retried. Exhausting the
	/// retry budget at 40 bits of entropy means the RNG is broken, never
	/// bad luck.
	pub fn create(&self, resource_id: &str) -> Result<NonceRecord, NonceError> {
		let mut records = self.records.lock();
		for _ in 0..MAX_GENERATION_ATTEMPTS {
			let nonce = generate_nonce();
			if records.contains_key(&nonce) {
				continue;
			}
			let record = NonceRecord {
				nonce: nonce.clone(),
				resource_id: resource_id.to_string(),
				vm_id: None,
				vm_name: None,
				expires_at: Utc::now() + NONCE_LIFETIME,
			};
			records.insert(nonce, record.clone());
			return Ok(record);
		}
		Err(NonceError::GenerationExhausted)
	}

	pub fn get(&self, nonce: &str) -> Option<NonceRecord> {
		self.records.lock().get(nonce).cloned()
	}

	/// Mutate the record for `nonce` in place. Returns false when no such
	/// record exists.
	pub fn update(&self, nonce: &str, f: impl FnOnce(&mut NonceRecord)) -> bool {
		match self.records.lock().get_mut(nonce) {
			Some(record) => {
				f(record);
				true
			},
			None => false,
		}
	}

	pub fn remove(&self, nonce: &str) -> Option<NonceRecord> {
		self.records.lock().remove(nonce)
	}

	pub fn len(&self) -> usize {
		self.records.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.lock().is_empty()
	}

	/// Drop every record whose deadline has passed.
	pub fn evict_expired(&self) {
		let now = Utc::now();
		self.records.lock().retain(|nonce, record| {
			if record.expires_at < now {
				info!(%nonce, resource_id = %record.resource_id, "removing expired nonce");
				false
			} else {
				true
			}
		});
	}

	/// Background sweeper evicting expired records every minute.
	pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
		let cache = Arc::clone(self);
		info!(
			interval_secs = EXPIRATION_CHECK_INTERVAL.as_secs(),
			"starting nonce expiration checker"
		);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(EXPIRATION_CHECK_INTERVAL);
			loop {
				ticker.tick().await;
				cache.evict_expired();
			}
		})
	}
}

fn generate_nonce() -> String {
	let mut bytes = [0u8; NONCE_BYTES];
	rand::rng().fill(&mut bytes);
	hex::encode(bytes)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn create_returns_ten_hex_chars() {
		let cache = NonceCache::new();
		let record = cache.create("/subscriptions/s/vm").unwrap();
		assert_eq!(record.nonce.len(), 10);
		assert!(record.nonce.chars().all(|c| c.is_ascii_hexdigit()));
		assert_eq!(record.resource_id, "/subscriptions/s/vm");
		assert!(!record.is_expired());
	}

	#[test]
	fn nonces_are_unique_among_live_records() {
		let cache = NonceCache::new();
		let mut seen = std::collections::HashSet::new();
		for _ in 0..256 {
			let record = cache.create("rid").unwrap();
			assert!(seen.insert(record.nonce));
		}
		assert_eq!(cache.len(), 256);
	}

	#[test]
	fn remove_consumes_exactly_once() {
		let cache = NonceCache::new();
		let record = cache.create("rid").unwrap();
		assert!(cache.remove(&record.nonce).is_some());
		assert!(cache.remove(&record.nonce).is_none());
		assert!(cache.get(&record.nonce).is_none());
	}

	#[test]
	fn update_mutates_in_place() {
		let cache = NonceCache::new();
		let record = cache.create("rid").unwrap();
		assert!(cache.update(&record.nonce, |r| {
			r.vm_id = Some("VMID-1".to_string());
		}));
		assert_eq!(
			cache.get(&record.nonce).unwrap().vm_id.as_deref(),
			Some("VMID-1")
		);
		assert!(!cache.update("ffffffffff", |_| {}));
	}

	#[test]
	fn evict_expired_drops_only_stale_records() {
		let cache = NonceCache::new();
		let live = cache.create("rid").unwrap();
		let stale = cache.create("rid").unwrap();
		cache.update(&stale.nonce, |r| {
			r.expires_at = Utc::now() - Duration::from_secs(1);
		});
		cache.evict_expired();
		assert!(cache.get(&live.nonce).is_some());
		assert!(cache.get(&stale.nonce).is_none());
	}

	#[test]
	fn expired_record_reports_expired() {
		let cache = NonceCache::new();
		let record = cache.create("rid").unwrap();
		cache.update(&record.nonce, |r| {
			r.expires_at = Utc::now() - Duration::from_secs(1);
		});
		assert!(cache.get(&record.nonce).unwrap().is_expired());
	}
}
