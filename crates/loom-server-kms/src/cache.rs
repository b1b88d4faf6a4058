// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Bounded cache of unwrapped cipher pairs for batch jobs.
//!
//! A fixed ring of slots. `put` writes the next slot and overwrites the
//! oldest entry once full; `get` never changes eviction order. A tenant that
//! falls out and comes back costs one more unwrap.
//!
//! There is no internal locking. Each worker owns its own cache.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::error::KmsResult;
use crate::service::{CipherPair, KmsService};
use crate::store::DataKeyStore;
use crate::types::TenantKey;

/// Default number of cached tenants.
pub const DEFAULT_CACHE_CAPACITY: usize = 25;

/// Hit and miss counters, for tuning capacity against real tenant mixes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
	pub hits: u64,
	pub misses: u64,
	pub evictions: u64,
}

impl CacheStats {
	pub fn hit_rate(&self) -> f64 {
		let total = self.hits + self.misses;
		if total == 0 {
			return 0.0;
		}
		self.hits as f64 / total as f64
	}
}

struct CacheEntry {
	tenant: TenantKey,
	pair: Arc<CipherPair>,
	insertion_order: u64,
}

pub struct DataKeyCache {
	slots: Vec<Option<CacheEntry>>,
	index: HashMap<TenantKey, usize>,
	next_slot: usize,
	inserted: u64,
	stats: CacheStats,
}

impl DataKeyCache {
	/// Create a cache holding at most `capacity` tenants (minimum 1).
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self {
			slots: (0..capacity).map(|_| None).collect(),
			index: HashMap::with_capacity(capacity),
			next_slot: 0,
			inserted: 0,
			stats: CacheStats::default(),
		}
	}

	pub fn capacity(&self) -> usize {
		self.slots.len()
	}

	pub fn len(&self) -> usize {
		self.index.len()
	}

	pub fn is_empty(&self) -> bool {
		self.index.is_empty()
	}

	pub fn stats(&self) -> CacheStats {
		self.stats
	}

	pub fn get(&mut self, tenant: &TenantKey) -> Option<Arc<CipherPair>> {
		match self.index.get(tenant).and_then(|&slot| self.slots[slot].as_ref()) {
			Some(entry) => {
				self.stats.hits += 1;
				Some(Arc::clone(&entry.pair))
			}
			None => {
				self.stats.misses += 1;
				None
			}
		}
	}

	/// Insert a pair. Re-inserting a cached tenant replaces its pair without
	/// changing its place in eviction order.
	pub fn put(&mut self, tenant: TenantKey, pair: Arc<CipherPair>) {
		if let Some(&slot) = self.index.get(&tenant) {
			if let Some(entry) = self.slots[slot].as_mut() {
				entry.pair = pair;
				return;
			}
		}

		let slot = self.next_slot;
		if let Some(evicted) = self.slots[slot].take() {
			trace!(tenant = %evicted.tenant, order = evicted.insertion_order, "evicting cipher pair");
			self.index.remove(&evicted.tenant);
			self.stats.evictions += 1;
		}

		self.index.insert(tenant.clone(), slot);
		self.slots[slot] = Some(CacheEntry {
			tenant,
			pair,
			insertion_order: self.inserted,
		});
		self.inserted += 1;
		self.next_slot = (slot + 1) % self.slots.len();
	}

	/// Cached pair for `tenant`, or a new one from `kms` on a miss.
	pub async fn get_or_create<S: DataKeyStore>(
		&mut self,
		kms: &KmsService<S>,
		tenant: &TenantKey,
	) -> KmsResult<Arc<CipherPair>> {
		if let Some(pair) = self.get(tenant) {
			return Ok(pair);
		}
		let pair = Arc::new(kms.create_cipher_pair(&tenant.tenant_id, tenant.key_class).await?);
		self.put(tenant.clone(), Arc::clone(&pair));
		Ok(pair)
	}
}

impl Default for DataKeyCache {
	fn default() -> Self {
		Self::new(DEFAULT_CACHE_CAPACITY)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::DbConnections;
	use crate::encryption::KeyMaterial;
	use crate::root_key::{RootKeyConfig, RootKeyProvider};
	use crate::store::SqliteKmsStore;
	use crate::testing::{create_test_pool, hsm_inputs, InMemoryHsm};
	use crate::types::KeyClass;

	fn tenant(id: &str) -> TenantKey {
		TenantKey::new(id, KeyClass::Organization).unwrap()
	}

	fn pair(id: &str) -> Arc<CipherPair> {
		Arc::new(CipherPair::new(tenant(id), 1, KeyMaterial::generate()))
	}

	#[test]
	fn evicts_first_inserted_when_full() {
		let mut cache = DataKeyCache::new(3);
		for id in ["t1", "t2", "t3", "t4"] {
			cache.put(tenant(id), pair(id));
		}

		assert_eq!(cache.len(), 3);
		assert!(cache.get(&tenant("t1")).is_none());
		for id in ["t2", "t3", "t4"] {
			assert!(cache.get(&tenant(id)).is_some(), "{id} should be cached");
		}
		assert_eq!(cache.stats().evictions, 1);
	}

	#[test]
	fn get_does_not_promote() {
		let mut cache = DataKeyCache::new(2);
		cache.put(tenant("t1"), pair("t1"));
		cache.put(tenant("t2"), pair("t2"));

		// A recency-ordered cache would now evict t2 instead.
		assert!(cache.get(&tenant("t1")).is_some());
		cache.put(tenant("t3"), pair("t3"));

		assert!(cache.get(&tenant("t1")).is_none());
		assert!(cache.get(&tenant("t2")).is_some());
	}

	#[test]
	fn reinsert_keeps_eviction_order() {
		let mut cache = DataKeyCache::new(2);
		cache.put(tenant("t1"), pair("t1"));
		cache.put(tenant("t2"), pair("t2"));
		cache.put(tenant("t1"), pair("t1"));
		assert_eq!(cache.len(), 2);

		cache.put(tenant("t3"), pair("t3"));
		assert!(cache.get(&tenant("t1")).is_none());
	}

	#[test]
	fn counts_hits_and_misses() {
		let mut cache = DataKeyCache::default();
		assert_eq!(cache.capacity(), DEFAULT_CACHE_CAPACITY);
		assert!(cache.get(&tenant("t1")).is_none());
		cache.put(tenant("t1"), pair("t1"));
		assert!(cache.get(&tenant("t1")).is_some());

		let stats = cache.stats();
		assert_eq!((stats.hits, stats.misses), (1, 1));
		assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
	}

	#[test]
	fn zero_capacity_is_raised_to_one() {
		let mut cache = DataKeyCache::new(0);
		cache.put(tenant("t1"), pair("t1"));
		assert!(cache.get(&tenant("t1")).is_some());
	}

	#[tokio::test]
	async fn evicted_tenant_is_unwrapped_again() {
		let hsm = Arc::new(InMemoryHsm::new());
		let config = RootKeyConfig::from_inputs(hsm_inputs(), None).unwrap();
		let root = RootKeyProvider::new(config)
			.with_hsm_adapter(hsm.clone())
			.resolve()
			.await
			.unwrap();
		let store = Arc::new(SqliteKmsStore::new(DbConnections::new(create_test_pool().await)));
		let kms = KmsService::new(root, store);

		let mut cache = DataKeyCache::new(3);
		for id in ["t1", "t2", "t3", "t4"] {
			cache.get_or_create(&kms, &tenant(id)).await.unwrap();
		}
		assert_eq!(hsm.unwrap_calls(), 4);

		for id in ["t2", "t3", "t4"] {
			cache.get_or_create(&kms, &tenant(id)).await.unwrap();
		}
		assert_eq!(hsm.unwrap_calls(), 4);

		cache.get_or_create(&kms, &tenant("t1")).await.unwrap();
		assert_eq!(hsm.unwrap_calls(), 5);
	}
}
