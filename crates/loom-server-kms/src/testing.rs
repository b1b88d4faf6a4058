// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Test helpers: in-memory database, fake HSM and ready-made services.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use zeroize::Zeroizing;

use crate::config::RootKeyInputs;
use crate::db::{run_migrations, DbConnections};
use crate::encryption::{self, KeyMaterial};
use crate::error::{KmsError, KmsResult};
use crate::hsm::HsmAdapter;
use crate::root_key::{RootKeyConfig, RootKeyHandle, RootKeyProvider};
use crate::service::KmsService;
use crate::store::SqliteKmsStore;

/// In-memory SQLite pool with the key storage schema applied.
///
/// Pinned to one connection: every `:memory:` connection is its own
/// database.
pub async fn create_test_pool() -> SqlitePool {
	let pool = SqlitePoolOptions::new()
		.max_connections(1)
		.connect("sqlite::memory:")
		.await
		.unwrap();
	run_migrations(&pool).await.unwrap();
	pool
}

/// Software-only root key inputs with fresh random keys.
pub fn software_inputs() -> RootKeyInputs {
	let root = KeyMaterial::generate();
	RootKeyInputs {
		root_encryption_key: Some(Zeroizing::new(BASE64.encode(root.expose()))),
		..Default::default()
	}
}

/// Inputs with a complete HSM descriptor and a software key for the legacy
/// scheme.
pub fn hsm_inputs() -> RootKeyInputs {
	RootKeyInputs {
		hsm_library_path: Some(PathBuf::from("/usr/lib/softhsm/libsofthsm2.so")),
		hsm_pin: Some(Zeroizing::new("1234".to_string())),
		hsm_key_label: Some("loom-root".to_string()),
		hsm_slot: Some(0),
		..software_inputs()
	}
}

/// Resolve a software root key.
pub async fn software_root() -> RootKeyHandle {
	let config = RootKeyConfig::from_inputs(software_inputs(), None).unwrap();
	RootKeyProvider::new(config).resolve().await.unwrap()
}

/// A KMS service over a fresh in-memory database with a software root key.
pub async fn test_kms() -> (KmsService<SqliteKmsStore>, SqlitePool) {
	let pool = create_test_pool().await;
	let store = SqliteKmsStore::new(DbConnections::new(pool.clone()));
	(KmsService::new(software_root().await, Arc::new(store)), pool)
}

/// Fake HSM holding its root key in memory.
pub struct InMemoryHsm {
	root_key: KeyMaterial,
	healthy: AtomicBool,
	unwrap_calls: AtomicUsize,
}

impl InMemoryHsm {
	pub fn new() -> Self {
		Self {
			root_key: KeyMaterial::generate(),
			healthy: AtomicBool::new(true),
			unwrap_calls: AtomicUsize::new(0),
		}
	}

	pub fn set_healthy(&self, healthy: bool) {
		self.healthy.store(healthy, Ordering::SeqCst);
	}

	/// Number of unwrap calls served so far.
	pub fn unwrap_calls(&self) -> usize {
		self.unwrap_calls.load(Ordering::SeqCst)
	}
}

impl Default for InMemoryHsm {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl HsmAdapter for InMemoryHsm {
	async fn wrap_key(&self, key: &KeyMaterial) -> KmsResult<Vec<u8>> {
		if !self.healthy.load(Ordering::SeqCst) {
			return Err(KmsError::HsmUnavailable("in-memory HSM is offline".to_string()));
		}
		encryption::wrap_key(&self.root_key, key, b"hsm")
	}

	async fn unwrap_key(&self, wrapped: &[u8]) -> KmsResult<KeyMaterial> {
		if !self.healthy.load(Ordering::SeqCst) {
			return Err(KmsError::HsmUnavailable("in-memory HSM is offline".to_string()));
		}
		self.unwrap_calls.fetch_add(1, Ordering::SeqCst);
		encryption::unwrap_key(&self.root_key, wrapped, b"hsm")
	}

	async fn is_healthy(&self) -> bool {
		self.healthy.load(Ordering::SeqCst)
	}
}
