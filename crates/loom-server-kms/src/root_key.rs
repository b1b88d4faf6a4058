// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Root key resolution.
//!
//! Startup turns [`RootKeyInputs`] into a [`RootKeyHandle`] or refuses to
//! start. Selection rules:
//!
//! 1. In FIPS mode the encryption key is relabelled as the root encryption
//!    key and must be base64 of 32 bytes.
//! 2. HSM is selected when all four HSM parameters are present and the
//!    recorded strategy is HSM (or nothing is recorded yet).
//! 3. Otherwise a software key is selected if one is configured.
//! 4. Otherwise the strategy stays [`RootKeyStrategy::Unconfigured`] and
//!    resolution fails.
//!
//! A recorded HSM strategy with an incomplete HSM descriptor is an error,
//! never a fallback to software.

use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::{info, instrument, warn};
use zeroize::Zeroizing;

use crate::config::RootKeyInputs;
use crate::encryption::{KeyMaterial, KEY_SIZE};
use crate::error::{KmsError, KmsResult};
use crate::hsm::HsmAdapter;
use crate::key_backend::{HsmKeyBackend, KeyBackend, SoftwareKeyBackend};
use crate::legacy::LegacyRootKeys;
use crate::store::DataKeyStore;
use crate::types::RootKeyStrategy;

/// Selected root key configuration, before any HSM contact.
pub struct RootKeyConfig {
	pub strategy: RootKeyStrategy,
	software_key_material: Option<KeyMaterial>,
	pub hsm_key_label: Option<String>,
	pub hsm_slot: Option<u32>,
	legacy: LegacyRootKeys,
}

impl RootKeyConfig {
	/// Decode key material and select a strategy.
	///
	/// `stored` is the strategy recorded by an earlier startup, if any.
	pub fn from_inputs(mut inputs: RootKeyInputs, stored: Option<RootKeyStrategy>) -> KmsResult<Self> {
		if inputs.fips_enabled {
			inputs.apply_fips_relabel();
			if inputs.root_encryption_key.is_none() {
				return Err(KmsError::Configuration(
					"FIPS mode requires a base64 encoded 32-byte encryption key".to_string(),
				));
			}
		}

		let root_encryption_key = inputs
			.root_encryption_key
			.as_ref()
			.map(decode_root_encryption_key)
			.transpose()?;
		let encryption_key = inputs
			.encryption_key
			.as_ref()
			.map(decode_encryption_key)
			.transpose()?;

		// The UTF-8 encryption key wraps data keys when present.
		let software_key_material = encryption_key
			.as_ref()
			.or(root_encryption_key.as_ref())
			.map(KeyMaterial::duplicate);

		let hsm = inputs.hsm_descriptor();
		let strategy = match (stored, hsm.is_some(), software_key_material.is_some()) {
			(Some(RootKeyStrategy::Hsm), true, _) => RootKeyStrategy::Hsm,
			(Some(RootKeyStrategy::Hsm), false, _) => {
				return Err(KmsError::Configuration(
					"root strategy is bound to HSM but the HSM library path, PIN, key label and slot are not all set"
						.to_string(),
				))
			}
			(Some(RootKeyStrategy::Software), _, true) => RootKeyStrategy::Software,
			(Some(RootKeyStrategy::Software), _, false) => {
				return Err(KmsError::Configuration(
					"root strategy is bound to software but no encryption key is configured".to_string(),
				))
			}
			(None | Some(RootKeyStrategy::Unconfigured), true, _) => RootKeyStrategy::Hsm,
			(None | Some(RootKeyStrategy::Unconfigured), false, true) => RootKeyStrategy::Software,
			(None | Some(RootKeyStrategy::Unconfigured), false, false) => RootKeyStrategy::Unconfigured,
		};

		if stored == Some(RootKeyStrategy::Software) && hsm.is_some() {
			warn!("HSM is configured but the root strategy is bound to software; HSM settings are ignored");
		}

		Ok(Self {
			strategy,
			software_key_material,
			hsm_key_label: hsm.as_ref().map(|h| h.key_label.clone()),
			hsm_slot: hsm.as_ref().map(|h| h.slot),
			legacy: LegacyRootKeys::new(root_encryption_key, encryption_key),
		})
	}
}

impl fmt::Debug for RootKeyConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RootKeyConfig")
			.field("strategy", &self.strategy)
			.field(
				"software_key_material",
				&self.software_key_material.as_ref().map(|_| "[REDACTED]"),
			)
			.field("hsm_key_label", &self.hsm_key_label)
			.field("hsm_slot", &self.hsm_slot)
			.field("legacy", &self.legacy)
			.finish()
	}
}

fn decode_root_encryption_key(raw: &Zeroizing<String>) -> KmsResult<KeyMaterial> {
	let decoded = Zeroizing::new(BASE64.decode(raw.as_bytes()).map_err(|e| {
		KmsError::Configuration(format!("root encryption key is not valid base64: {e}"))
	})?);
	if decoded.len() != KEY_SIZE {
		return Err(KmsError::Configuration(format!(
			"root encryption key must decode to {KEY_SIZE} bytes, got {}",
			decoded.len()
		)));
	}
	KeyMaterial::from_slice(&decoded)
}

fn decode_encryption_key(raw: &Zeroizing<String>) -> KmsResult<KeyMaterial> {
	if raw.len() != KEY_SIZE {
		return Err(KmsError::Configuration(format!(
			"encryption key must be {KEY_SIZE} bytes, got {}",
			raw.len()
		)));
	}
	KeyMaterial::from_slice(raw.as_bytes())
}

/// Resolves a [`RootKeyConfig`] into a usable [`RootKeyHandle`].
pub struct RootKeyProvider {
	config: RootKeyConfig,
	hsm: Option<Arc<dyn HsmAdapter>>,
}

impl RootKeyProvider {
	pub fn new(config: RootKeyConfig) -> Self {
		Self { config, hsm: None }
	}

	/// Attach the adapter used when the HSM strategy is selected.
	pub fn with_hsm_adapter(mut self, adapter: Arc<dyn HsmAdapter>) -> Self {
		self.hsm = Some(adapter);
		self
	}

	/// The strategy that resolution will bind.
	pub fn strategy(&self) -> RootKeyStrategy {
		self.config.strategy
	}

	/// Bind the selected strategy.
	///
	/// Fails with [`KmsError::Configuration`] when nothing usable is
	/// configured and [`KmsError::HsmUnavailable`] when the HSM does not
	/// report healthy. Both are fatal to startup.
	#[instrument(skip(self), fields(strategy = %self.config.strategy))]
	pub async fn resolve(self) -> KmsResult<RootKeyHandle> {
		let RootKeyConfig {
			strategy,
			software_key_material,
			hsm_key_label,
			hsm_slot,
			legacy,
		} = self.config;

		let backend: Arc<dyn KeyBackend> = match strategy {
			RootKeyStrategy::Unconfigured => {
				return Err(KmsError::Configuration(
					"no root key configured: set an encryption key or a complete HSM descriptor".to_string(),
				))
			}
			RootKeyStrategy::Software => {
				let key = software_key_material.ok_or_else(|| {
					KmsError::Configuration("software strategy selected without key material".to_string())
				})?;
				Arc::new(SoftwareKeyBackend::new(key))
			}
			RootKeyStrategy::Hsm => {
				let adapter = self.hsm.ok_or_else(|| {
					KmsError::Configuration("HSM strategy selected but no HSM adapter is available".to_string())
				})?;
				let (Some(key_label), Some(slot)) = (hsm_key_label, hsm_slot) else {
					return Err(KmsError::Configuration(
						"HSM strategy selected without key label and slot".to_string(),
					));
				};
				if !adapter.is_healthy().await {
					return Err(KmsError::HsmUnavailable(format!(
						"HSM slot {slot} key {key_label} did not report healthy"
					)));
				}
				Arc::new(HsmKeyBackend::new(adapter, key_label, slot))
			}
		};

		info!(strategy = %backend.strategy(), "root key resolved");
		Ok(RootKeyHandle {
			backend,
			legacy: Arc::new(legacy),
		})
	}

	/// Startup validation: read the recorded strategy, resolve, and record
	/// the strategy if this is the first startup.
	///
	/// Another process may record a different strategy between the read and
	/// the write; the recorded one wins and this startup is refused.
	#[instrument(skip_all)]
	pub async fn bootstrap<S: DataKeyStore + ?Sized>(
		inputs: RootKeyInputs,
		store: &S,
		hsm: Option<Arc<dyn HsmAdapter>>,
	) -> KmsResult<RootKeyHandle> {
		let stored = store.get_root_strategy().await?;
		let mut provider = Self::new(RootKeyConfig::from_inputs(inputs, stored)?);
		if let Some(adapter) = hsm {
			provider = provider.with_hsm_adapter(adapter);
		}
		let handle = provider.resolve().await?;
		let recorded = store.record_root_strategy(handle.strategy()).await?;
		if recorded != handle.strategy() {
			return Err(KmsError::Configuration(format!(
				"root strategy {recorded} is already recorded, refusing to start with {}",
				handle.strategy()
			)));
		}
		Ok(handle)
	}
}

/// A resolved root key.
#[derive(Clone)]
pub struct RootKeyHandle {
	backend: Arc<dyn KeyBackend>,
	legacy: Arc<LegacyRootKeys>,
}

impl RootKeyHandle {
	pub fn strategy(&self) -> RootKeyStrategy {
		self.backend.strategy()
	}

	pub(crate) fn backend(&self) -> &Arc<dyn KeyBackend> {
		&self.backend
	}

	pub(crate) fn legacy(&self) -> &Arc<LegacyRootKeys> {
		&self.legacy
	}
}

impl fmt::Debug for RootKeyHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RootKeyHandle")
			.field("strategy", &self.backend.strategy())
			.field("key_version", &self.backend.key_version())
			.finish()
	}
}
