// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Key backend abstraction for wrapping tenant data keys.
//!
//! Provides a trait-based abstraction that allows swapping between:
//! - Software root keys held in process memory
//! - HSM-held root keys reached through an [`HsmAdapter`]

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::encryption::{self, KeyMaterial};
use crate::error::{KmsError, KmsResult};
use crate::hsm::HsmAdapter;
use crate::types::{RootKeyStrategy, TenantKey};

/// A wrapped DEK with the root key version that wrapped it.
#[derive(Debug, Clone)]
pub struct WrappedDataKey {
	pub wrapped_key: Vec<u8>,
	pub key_version: u32,
}

/// Root key operations on data keys.
///
/// The software backend authenticates the tenant with each wrapped key. The
/// HSM backend does not: its wraps are only bound to the HSM key, and the
/// tenant binding rests on the envelope AAD of the data the key encrypts.
#[async_trait]
pub trait KeyBackend: Send + Sync {
	/// Wrap a DEK for `tenant` under the root key.
	async fn wrap_data_key(&self, tenant: &TenantKey, dek: &KeyMaterial) -> KmsResult<WrappedDataKey>;

	/// Unwrap a DEK previously wrapped for `tenant`.
	async fn unwrap_data_key(&self, tenant: &TenantKey, wrapped: &WrappedDataKey) -> KmsResult<KeyMaterial>;

	/// The strategy this backend implements.
	fn strategy(&self) -> RootKeyStrategy;

	/// Get the current root key version.
	fn key_version(&self) -> u32;
}

/// Root key held in memory.
///
/// The tenant binding is authenticated with each wrapped key, so a wrapped
/// key copied onto another tenant's record does not unwrap.
pub struct SoftwareKeyBackend {
	root_key: KeyMaterial,
	key_version: u32,
}

impl SoftwareKeyBackend {
	pub fn new(root_key: KeyMaterial) -> Self {
		Self {
			root_key,
			key_version: 1,
		}
	}
}

#[async_trait]
impl KeyBackend for SoftwareKeyBackend {
	async fn wrap_data_key(&self, tenant: &TenantKey, dek: &KeyMaterial) -> KmsResult<WrappedDataKey> {
		let wrapped_key = encryption::wrap_key(&self.root_key, dek, &tenant.binding())?;
		Ok(WrappedDataKey {
			wrapped_key,
			key_version: self.key_version,
		})
	}

	async fn unwrap_data_key(&self, tenant: &TenantKey, wrapped: &WrappedDataKey) -> KmsResult<KeyMaterial> {
		if wrapped.key_version != self.key_version {
			return Err(KmsError::Decryption(format!(
				"root key version mismatch: expected {}, got {}",
				self.key_version, wrapped.key_version
			)));
		}
		encryption::unwrap_key(&self.root_key, &wrapped.wrapped_key, &tenant.binding())
	}

	fn strategy(&self) -> RootKeyStrategy {
		RootKeyStrategy::Software
	}

	fn key_version(&self) -> u32 {
		self.key_version
	}
}

/// Root key held in an HSM.
///
/// Wrapped keys are not tenant-bound at this layer.
pub struct HsmKeyBackend {
	adapter: Arc<dyn HsmAdapter>,
	key_label: String,
	slot: u32,
	key_version: u32,
}

impl HsmKeyBackend {
	pub fn new(adapter: Arc<dyn HsmAdapter>, key_label: String, slot: u32) -> Self {
		Self {
			adapter,
			key_label,
			slot,
			key_version: 1,
		}
	}
}

#[async_trait]
impl KeyBackend for HsmKeyBackend {
	#[instrument(skip(self, dek), fields(key_label = %self.key_label, slot = self.slot, tenant = %tenant))]
	async fn wrap_data_key(&self, tenant: &TenantKey, dek: &KeyMaterial) -> KmsResult<WrappedDataKey> {
		let wrapped_key = self.adapter.wrap_key(dek).await?;
		Ok(WrappedDataKey {
			wrapped_key,
			key_version: self.key_version,
		})
	}

	#[instrument(skip(self, wrapped), fields(key_label = %self.key_label, slot = self.slot, tenant = %tenant))]
	async fn unwrap_data_key(&self, tenant: &TenantKey, wrapped: &WrappedDataKey) -> KmsResult<KeyMaterial> {
		if wrapped.key_version != self.key_version {
			return Err(KmsError::Decryption(format!(
				"HSM key version mismatch: expected {}, got {}",
				self.key_version, wrapped.key_version
			)));
		}
		self.adapter.unwrap_key(&wrapped.wrapped_key).await
	}

	fn strategy(&self) -> RootKeyStrategy {
		RootKeyStrategy::Hsm
	}

	fn key_version(&self) -> u32 {
		self.key_version
	}
}
