// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Envelope encryption service.
//!
//! [`KmsService`] owns tenant data keys: it creates them lazily, unwraps them
//! through the root key backend, and hands out [`CipherPair`]s bound to one
//! tenant and key class. It also exposes the legacy root-key scheme so
//! migrations can read old rows without duplicating key handling.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::db::ConnectionRole;
use crate::encryption::{self, KeyMaterial};
use crate::envelope::{Algorithm, CipherEnvelope};
use crate::error::{KmsError, KmsResult};
use crate::key_backend::WrappedDataKey;
use crate::legacy::{LegacyCiphertext, LegacyRootKeys};
use crate::root_key::RootKeyHandle;
use crate::store::{DataKeyStore, InsertOutcome};
use crate::types::{KeyClass, RootKeyStrategy, TenantDataKey, TenantKey};

/// Encrypt/decrypt capability for one tenant and key class.
///
/// Holds the unwrapped data key, which is wiped when the pair is dropped.
pub struct CipherPair {
	tenant: TenantKey,
	key_version: u32,
	key: KeyMaterial,
}

impl CipherPair {
	pub(crate) fn new(tenant: TenantKey, key_version: u32, key: KeyMaterial) -> Self {
		Self {
			tenant,
			key_version,
			key,
		}
	}

	pub fn tenant(&self) -> &TenantKey {
		&self.tenant
	}

	pub fn key_version(&self) -> u32 {
		self.key_version
	}

	/// Seal `plaintext` into an opaque envelope.
	pub fn encrypt(&self, plaintext: &[u8]) -> KmsResult<Vec<u8>> {
		let aad = CipherEnvelope::associated_data(Algorithm::Aes256Gcm, self.key_version, &self.tenant);
		let sealed = encryption::seal(&self.key, plaintext, &aad)?;
		Ok(CipherEnvelope::from_sealed(self.key_version, sealed).to_bytes())
	}

	/// Open an envelope produced by [`CipherPair::encrypt`] for the same
	/// tenant, key class and key version.
	pub fn decrypt(&self, envelope: &[u8]) -> KmsResult<Zeroizing<Vec<u8>>> {
		let envelope = CipherEnvelope::from_bytes(envelope)?;
		if envelope.key_version != self.key_version {
			return Err(KmsError::Decryption(format!(
				"envelope key version {} does not match data key version {}",
				envelope.key_version, self.key_version
			)));
		}
		let aad = CipherEnvelope::associated_data(envelope.algorithm, envelope.key_version, &self.tenant);
		encryption::open(&self.key, &envelope.to_sealed(), &aad)
	}
}

impl fmt::Debug for CipherPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CipherPair")
			.field("tenant", &self.tenant)
			.field("key_version", &self.key_version)
			.field("key", &"[REDACTED]")
			.finish()
	}
}

/// The key management service.
pub struct KmsService<S: DataKeyStore> {
	root: RootKeyHandle,
	store: Arc<S>,
}

impl<S: DataKeyStore> KmsService<S> {
	pub fn new(root: RootKeyHandle, store: Arc<S>) -> Self {
		Self { root, store }
	}

	pub fn strategy(&self) -> RootKeyStrategy {
		self.root.strategy()
	}

	/// Fetch the data key for a tenant, creating it on first use.
	///
	/// Concurrent first use converges on a single stored key: the loser of
	/// the insert race discards its key and re-reads the winner's.
	#[instrument(skip(self))]
	pub async fn get_or_create_data_key(&self, tenant_id: &str, key_class: KeyClass) -> KmsResult<TenantDataKey> {
		let tenant = TenantKey::new(tenant_id, key_class)?;

		if let Some(existing) = self.store.get_data_key(&tenant, ConnectionRole::Primary).await? {
			return Ok(existing);
		}

		let dek = KeyMaterial::generate();
		let wrapped = self.root.backend().wrap_data_key(&tenant, &dek).await?;
		let candidate = TenantDataKey {
			tenant: tenant.clone(),
			wrapped_key: wrapped.wrapped_key,
			key_version: wrapped.key_version,
			strategy: self.root.strategy(),
			created_at: Utc::now(),
		};

		match self.store.insert_data_key(&candidate).await? {
			InsertOutcome::Inserted => {
				info!(strategy = %candidate.strategy, "created tenant data key");
				Ok(candidate)
			}
			InsertOutcome::Conflict => {
				debug!("data key created concurrently, re-reading");
				self.store
					.get_data_key(&tenant, ConnectionRole::Primary)
					.await?
					.ok_or_else(|| KmsError::KeyCreationRace {
						tenant_id: tenant.tenant_id.clone(),
						key_class: tenant.key_class,
					})
			}
		}
	}

	/// Unwrap a stored data key. This is the call the data key cache exists
	/// to avoid repeating.
	#[instrument(skip(self, data_key), fields(tenant = %data_key.tenant))]
	pub async fn unwrap(&self, data_key: &TenantDataKey) -> KmsResult<KeyMaterial> {
		if data_key.strategy != self.root.strategy() {
			warn!(
				record_strategy = %data_key.strategy,
				active_strategy = %self.root.strategy(),
				"data key was wrapped by a different root strategy"
			);
			return Err(KmsError::Configuration(format!(
				"data key for {} was wrapped by the {} root but the active root is {}",
				data_key.tenant,
				data_key.strategy,
				self.root.strategy()
			)));
		}

		let wrapped = WrappedDataKey {
			wrapped_key: data_key.wrapped_key.clone(),
			key_version: data_key.key_version,
		};
		self.root.backend().unwrap_data_key(&data_key.tenant, &wrapped).await
	}

	/// Get or create the tenant's data key and bind it into a cipher pair.
	pub async fn create_cipher_pair(&self, tenant_id: &str, key_class: KeyClass) -> KmsResult<CipherPair> {
		let data_key = self.get_or_create_data_key(tenant_id, key_class).await?;
		let key = self.unwrap(&data_key).await?;
		Ok(CipherPair::new(data_key.tenant, data_key.key_version, key))
	}

	/// Encrypt under the root key directly, in the legacy column format.
	pub fn encrypt_with_root_key(&self, plaintext: &[u8]) -> KmsResult<LegacyCiphertext> {
		self.root.legacy().encrypt(plaintext)
	}

	/// Decrypt a legacy column value with the root key.
	pub fn decrypt_with_root_key(&self, legacy: &LegacyCiphertext) -> KmsResult<Zeroizing<Vec<u8>>> {
		self.root.legacy().decrypt(legacy)
	}

	pub(crate) fn legacy_root_keys(&self) -> Arc<LegacyRootKeys> {
		Arc::clone(self.root.legacy())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::DbConnections;
	use crate::root_key::{RootKeyConfig, RootKeyProvider};
	use crate::store::SqliteKmsStore;
	use crate::testing::{create_test_pool, hsm_inputs, software_root, test_kms, InMemoryHsm};
	use proptest::prelude::*;

	#[tokio::test]
	async fn org_42_scenario() {
		let (kms, _pool) = test_kms().await;

		let org_42 = kms.create_cipher_pair("org_42", KeyClass::Organization).await.unwrap();
		let org_43 = kms.create_cipher_pair("org_43", KeyClass::Organization).await.unwrap();

		let blob = org_42.encrypt(b"hello-secret").unwrap();
		assert!(!blob.is_empty());
		assert!(!blob.windows(12).any(|w| w == b"hello-secret"));
		assert_ne!(blob, org_43.encrypt(b"hello-secret").unwrap());

		assert_eq!(org_42.decrypt(&blob).unwrap().as_slice(), b"hello-secret");
		assert!(matches!(org_43.decrypt(&blob), Err(KmsError::Decryption(_))));
	}

	#[tokio::test]
	async fn key_classes_do_not_share_envelopes() {
		let (kms, _pool) = test_kms().await;
		let org = kms.create_cipher_pair("t1", KeyClass::Organization).await.unwrap();
		let project = kms.create_cipher_pair("t1", KeyClass::SecretManagerProject).await.unwrap();

		let blob = org.encrypt(b"value").unwrap();
		assert!(project.decrypt(&blob).is_err());
	}

	#[tokio::test]
	async fn data_key_is_created_once() {
		let (kms, _pool) = test_kms().await;

		let first = kms.get_or_create_data_key("org_1", KeyClass::Organization).await.unwrap();
		let second = kms.get_or_create_data_key("org_1", KeyClass::Organization).await.unwrap();

		assert_eq!(first.wrapped_key, second.wrapped_key);
	}

	#[tokio::test]
	async fn pairs_from_separate_calls_interoperate() {
		let (kms, _pool) = test_kms().await;
		let writer = kms.create_cipher_pair("org_1", KeyClass::Organization).await.unwrap();
		let blob = writer.encrypt(b"persisted").unwrap();
		drop(writer);

		let reader = kms.create_cipher_pair("org_1", KeyClass::Organization).await.unwrap();
		assert_eq!(reader.decrypt(&blob).unwrap().as_slice(), b"persisted");
	}

	#[tokio::test]
	async fn concurrent_first_use_converges() {
		let (kms, _pool) = test_kms().await;
		let kms = Arc::new(kms);

		let mut handles = Vec::new();
		for _ in 0..8 {
			let kms = Arc::clone(&kms);
			handles.push(tokio::spawn(async move {
				kms.get_or_create_data_key("org_race", KeyClass::Organization)
					.await
					.unwrap()
					.wrapped_key
			}));
		}

		let mut keys = Vec::new();
		for handle in handles {
			keys.push(handle.await.unwrap());
		}
		assert!(keys.windows(2).all(|w| w[0] == w[1]));
	}

	#[tokio::test]
	async fn conflict_rereads_winner() {
		let pool = create_test_pool().await;
		let store = Arc::new(SqliteKmsStore::new(DbConnections::new(pool)));
		let root = software_root().await;

		let a = KmsService::new(root.clone(), Arc::clone(&store));
		let winner = a.get_or_create_data_key("org_1", KeyClass::Organization).await.unwrap();

		// Simulate a loser whose read happened before the winner's insert.
		let dek = KeyMaterial::generate();
		let wrapped = root
			.backend()
			.wrap_data_key(&winner.tenant, &dek)
			.await
			.unwrap();
		let loser = TenantDataKey {
			wrapped_key: wrapped.wrapped_key,
			..winner.clone()
		};
		assert_eq!(store.insert_data_key(&loser).await.unwrap(), InsertOutcome::Conflict);

		let again = a.get_or_create_data_key("org_1", KeyClass::Organization).await.unwrap();
		assert_eq!(again.wrapped_key, winner.wrapped_key);
	}

	#[tokio::test]
	async fn empty_tenant_id_is_rejected() {
		let (kms, _pool) = test_kms().await;
		let err = kms.create_cipher_pair("", KeyClass::Organization).await.unwrap_err();
		assert!(matches!(err, KmsError::InvalidTenantId(_)));
	}

	#[tokio::test]
	async fn tampered_envelope_fails() {
		let (kms, _pool) = test_kms().await;
		let pair = kms.create_cipher_pair("org_1", KeyClass::Organization).await.unwrap();
		let mut blob = pair.encrypt(b"secret").unwrap();
		let last = blob.len() - 1;
		blob[last] ^= 0x80;
		assert!(matches!(pair.decrypt(&blob), Err(KmsError::Decryption(_))));
	}

	#[tokio::test]
	async fn root_key_legacy_roundtrip() {
		let (kms, _pool) = test_kms().await;
		let legacy = kms.encrypt_with_root_key(b"legacy-value").unwrap();
		assert_eq!(kms.decrypt_with_root_key(&legacy).unwrap().as_slice(), b"legacy-value");
	}

	#[tokio::test]
	async fn hsm_strategy_unwraps_through_adapter() {
		let hsm = Arc::new(InMemoryHsm::new());
		let config = RootKeyConfig::from_inputs(hsm_inputs(), None).unwrap();
		let root = RootKeyProvider::new(config)
			.with_hsm_adapter(hsm.clone())
			.resolve()
			.await
			.unwrap();
		let store = Arc::new(SqliteKmsStore::new(DbConnections::new(create_test_pool().await)));
		let kms = KmsService::new(root, store);

		let pair = kms.create_cipher_pair("org_1", KeyClass::Organization).await.unwrap();
		let blob = pair.encrypt(b"hsm-protected").unwrap();
		assert_eq!(pair.decrypt(&blob).unwrap().as_slice(), b"hsm-protected");
		assert_eq!(hsm.unwrap_calls(), 1);
	}

	#[tokio::test]
	async fn key_wrapped_by_other_strategy_is_refused() {
		let (kms, _pool) = test_kms().await;
		let mut data_key = kms.get_or_create_data_key("org_1", KeyClass::Organization).await.unwrap();
		data_key.strategy = RootKeyStrategy::Hsm;
		assert!(matches!(kms.unwrap(&data_key).await, Err(KmsError::Configuration(_))));
	}

	fn pair_for(tenant_id: &str, key: &KeyMaterial) -> CipherPair {
		CipherPair::new(
			TenantKey::new(tenant_id, KeyClass::Organization).unwrap(),
			1,
			key.duplicate(),
		)
	}

	proptest! {
		#[test]
		fn cipher_pair_roundtrip(plaintext in prop::collection::vec(any::<u8>(), 0..2048)) {
			let pair = pair_for("org_p", &KeyMaterial::generate());
			let blob = pair.encrypt(&plaintext).unwrap();
			let decrypted = pair.decrypt(&blob).unwrap();
			prop_assert_eq!(decrypted.as_slice(), plaintext.as_slice());
		}

		#[test]
		fn other_tenant_never_decrypts(
			plaintext in prop::collection::vec(any::<u8>(), 0..256),
			a in "[a-z0-9_]{1,16}",
			b in "[a-z0-9_]{1,16}",
		) {
			prop_assume!(a != b);
			// Same key material: only the tenant binding differs.
			let key = KeyMaterial::generate();
			let blob = pair_for(&a, &key).encrypt(&plaintext).unwrap();
			prop_assert!(pair_for(&b, &key).decrypt(&blob).is_err());
		}
	}
}
