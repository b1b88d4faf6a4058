// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for tenant data keys.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KmsError, KmsResult};

/// The kind of tenant a data key is scoped to.
///
/// A tenant holds one independent data key per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyClass {
	Organization,
	SecretManagerProject,
}

impl KeyClass {
	pub fn as_str(&self) -> &'static str {
		match self {
			KeyClass::Organization => "organization",
			KeyClass::SecretManagerProject => "secret_manager_project",
		}
	}
}

impl fmt::Display for KeyClass {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for KeyClass {
	type Err = KmsError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"organization" => Ok(KeyClass::Organization),
			"secret_manager_project" => Ok(KeyClass::SecretManagerProject),
			other => Err(KmsError::CorruptedData(format!("unknown key class: {other}"))),
		}
	}
}

/// The root key strategy bound for this deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootKeyStrategy {
	Software,
	Hsm,
	/// Only observable before startup validation has run.
	Unconfigured,
}

impl RootKeyStrategy {
	pub fn as_str(&self) -> &'static str {
		match self {
			RootKeyStrategy::Software => "software",
			RootKeyStrategy::Hsm => "hsm",
			RootKeyStrategy::Unconfigured => "unconfigured",
		}
	}
}

impl fmt::Display for RootKeyStrategy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for RootKeyStrategy {
	type Err = KmsError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"software" => Ok(RootKeyStrategy::Software),
			"hsm" => Ok(RootKeyStrategy::Hsm),
			"unconfigured" => Ok(RootKeyStrategy::Unconfigured),
			other => Err(KmsError::CorruptedData(format!("unknown root key strategy: {other}"))),
		}
	}
}

/// Identifies one data key: a tenant plus a key class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantKey {
	pub tenant_id: String,
	pub key_class: KeyClass,
}

impl TenantKey {
	/// Build a tenant key, rejecting empty or whitespace-padded tenant ids.
	pub fn new(tenant_id: impl Into<String>, key_class: KeyClass) -> KmsResult<Self> {
		let tenant_id = tenant_id.into();
		if tenant_id.is_empty() || tenant_id.trim() != tenant_id {
			return Err(KmsError::InvalidTenantId(tenant_id));
		}
		Ok(Self {
			tenant_id,
			key_class,
		})
	}

	/// Associated data binding ciphertext to this tenant and class.
	///
	/// Length-prefixed so that no two distinct keys share an encoding.
	pub(crate) fn binding(&self) -> Vec<u8> {
		let tenant = self.tenant_id.as_bytes();
		let class = self.key_class.as_str().as_bytes();
		let mut out = Vec::with_capacity(8 + tenant.len() + class.len());
		out.extend_from_slice(&(tenant.len() as u32).to_be_bytes());
		out.extend_from_slice(tenant);
		out.extend_from_slice(&(class.len() as u32).to_be_bytes());
		out.extend_from_slice(class);
		out
	}
}

impl fmt::Display for TenantKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.tenant_id, self.key_class)
	}
}

/// A persisted, wrapped data encryption key.
#[derive(Clone)]
pub struct TenantDataKey {
	pub tenant: TenantKey,
	/// DEK wrapped under the root key. Opaque to everything but the backend
	/// that produced it.
	pub wrapped_key: Vec<u8>,
	pub key_version: u32,
	/// Strategy of the root key that wrapped this DEK.
	pub strategy: RootKeyStrategy,
	pub created_at: DateTime<Utc>,
}

impl fmt::Debug for TenantDataKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TenantDataKey")
			.field("tenant", &self.tenant)
			.field("wrapped_key", &"[REDACTED]")
			.field("key_version", &self.key_version)
			.field("strategy", &self.strategy)
			.field("created_at", &self.created_at)
			.finish()
	}
}
