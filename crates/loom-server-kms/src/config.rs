// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration for the key management core.
//!
//! Two kinds of input are handled here:
//! - Root key secrets ([`RootKeyInputs`]), read only from the environment
//!   with `VAR` / `VAR_FILE` support.
//! - Tunables ([`KmsSettings`]), layered as defaults, then an optional TOML
//!   file, then environment overrides.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::error::{KmsError, KmsResult};
use crate::hsm::HsmDescriptor;

pub const ENV_ENCRYPTION_KEY: &str = "LOOM_KMS_ENCRYPTION_KEY";
pub const ENV_ROOT_ENCRYPTION_KEY: &str = "LOOM_KMS_ROOT_ENCRYPTION_KEY";
pub const ENV_FIPS_ENABLED: &str = "LOOM_KMS_FIPS_ENABLED";
pub const ENV_HSM_LIB_PATH: &str = "LOOM_KMS_HSM_LIB_PATH";
pub const ENV_HSM_PIN: &str = "LOOM_KMS_HSM_PIN";
pub const ENV_HSM_KEY_LABEL: &str = "LOOM_KMS_HSM_KEY_LABEL";
pub const ENV_HSM_SLOT: &str = "LOOM_KMS_HSM_SLOT";

const DEFAULT_DATABASE_URL: &str = "sqlite:./loom.db";
const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 3;

/// Raw root key configuration as read from the environment.
#[derive(Clone, Default)]
pub struct RootKeyInputs {
	/// 32-byte key used as its raw UTF-8 bytes.
	pub encryption_key: Option<Zeroizing<String>>,
	/// Base64 of a 32-byte key.
	pub root_encryption_key: Option<Zeroizing<String>>,
	pub fips_enabled: bool,
	pub hsm_library_path: Option<PathBuf>,
	pub hsm_pin: Option<Zeroizing<String>>,
	pub hsm_key_label: Option<String>,
	pub hsm_slot: Option<u32>,
}

impl RootKeyInputs {
	/// Load root key inputs from environment variables.
	///
	/// Environment variables:
	/// - `LOOM_KMS_ENCRYPTION_KEY` / `_FILE` - 32-character key
	/// - `LOOM_KMS_ROOT_ENCRYPTION_KEY` / `_FILE` - base64 32-byte key
	/// - `LOOM_KMS_FIPS_ENABLED` - `true` or `1`
	/// - `LOOM_KMS_HSM_LIB_PATH`, `LOOM_KMS_HSM_PIN` / `_FILE`,
	///   `LOOM_KMS_HSM_KEY_LABEL`, `LOOM_KMS_HSM_SLOT`
	#[instrument(skip_all)]
	pub fn from_env() -> KmsResult<Self> {
		Ok(Self {
			encryption_key: load_secret_env(ENV_ENCRYPTION_KEY)?,
			root_encryption_key: load_secret_env(ENV_ROOT_ENCRYPTION_KEY)?,
			fips_enabled: env_bool(ENV_FIPS_ENABLED).unwrap_or(false),
			hsm_library_path: env_var(ENV_HSM_LIB_PATH).map(PathBuf::from),
			hsm_pin: load_secret_env(ENV_HSM_PIN)?,
			hsm_key_label: env_var(ENV_HSM_KEY_LABEL),
			hsm_slot: env_parse(ENV_HSM_SLOT)?,
		})
	}

	/// The HSM descriptor, only when all four parts are present.
	pub fn hsm_descriptor(&self) -> Option<HsmDescriptor> {
		Some(HsmDescriptor {
			library_path: self.hsm_library_path.clone()?,
			pin: self.hsm_pin.clone()?,
			key_label: self.hsm_key_label.clone()?,
			slot: self.hsm_slot?,
		})
	}

	/// Move the encryption key into the root encryption key slot when FIPS
	/// mode is on. The same secret is relabelled, nothing is re-encrypted.
	pub fn apply_fips_relabel(&mut self) {
		if !self.fips_enabled {
			return;
		}
		if let Some(key) = self.encryption_key.take() {
			self.root_encryption_key = Some(key);
		}
	}
}

impl fmt::Debug for RootKeyInputs {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let redact = |present: bool| if present { Some("[REDACTED]") } else { None };
		f.debug_struct("RootKeyInputs")
			.field("encryption_key", &redact(self.encryption_key.is_some()))
			.field("root_encryption_key", &redact(self.root_encryption_key.is_some()))
			.field("fips_enabled", &self.fips_enabled)
			.field("hsm_library_path", &self.hsm_library_path)
			.field("hsm_pin", &redact(self.hsm_pin.is_some()))
			.field("hsm_key_label", &self.hsm_key_label)
			.field("hsm_slot", &self.hsm_slot)
			.finish()
	}
}

/// Load a secret using the `VAR` / `VAR_FILE` convention.
///
/// `VAR_FILE` wins over `VAR`. A single trailing newline is stripped from
/// file contents; everything else is kept. Empty values count as unset.
pub fn load_secret_env(var: &str) -> KmsResult<Option<Zeroizing<String>>> {
	let file_var = format!("{var}_FILE");

	if let Some(path) = env_var(&file_var) {
		let content = Zeroizing::new(std::fs::read_to_string(&path).map_err(|e| {
			KmsError::Configuration(format!("failed to read {file_var} from {path}: {e}"))
		})?);
		let secret = content.strip_suffix('\n').unwrap_or(&content);
		if secret.is_empty() {
			return Ok(None);
		}
		return Ok(Some(Zeroizing::new(secret.to_string())));
	}

	Ok(env_var(var).map(Zeroizing::new))
}

fn env_var(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
	env_var(name).map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

fn env_parse<T: FromStr>(name: &str) -> KmsResult<Option<T>> {
	match env_var(name) {
		Some(v) => v
			.parse()
			.map(Some)
			.map_err(|_| KmsError::Configuration(format!("invalid value for {name}: '{v}'"))),
		None => Ok(None),
	}
}

// =============================================================================
// Tunables
// =============================================================================

/// Database settings (runtime, fully resolved).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
	pub url: String,
	/// Read replica used for streaming migration candidates when requested.
	pub replica_url: Option<String>,
}

/// Migration tunables (runtime, fully resolved).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSettings {
	pub batch_size: usize,
	pub cache_capacity: usize,
	pub max_write_attempts: u32,
	/// Row transforms running at once within a batch.
	pub max_in_flight: usize,
}

impl Default for MigrationSettings {
	fn default() -> Self {
		Self {
			batch_size: DEFAULT_BATCH_SIZE,
			cache_capacity: DEFAULT_CACHE_CAPACITY,
			max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
			max_in_flight: DEFAULT_BATCH_SIZE,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsSettings {
	pub database: DatabaseSettings,
	pub migration: MigrationSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseSettingsLayer {
	#[serde(default)]
	pub url: Option<String>,
	#[serde(default)]
	pub replica_url: Option<String>,
}

impl DatabaseSettingsLayer {
	pub fn merge(&mut self, other: DatabaseSettingsLayer) {
		if other.url.is_some() {
			self.url = other.url;
		}
		if other.replica_url.is_some() {
			self.replica_url = other.replica_url;
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MigrationSettingsLayer {
	#[serde(default)]
	pub batch_size: Option<usize>,
	#[serde(default)]
	pub cache_capacity: Option<usize>,
	#[serde(default)]
	pub max_write_attempts: Option<u32>,
	#[serde(default)]
	pub max_in_flight: Option<usize>,
}

impl MigrationSettingsLayer {
	pub fn merge(&mut self, other: MigrationSettingsLayer) {
		if other.batch_size.is_some() {
			self.batch_size = other.batch_size;
		}
		if other.cache_capacity.is_some() {
			self.cache_capacity = other.cache_capacity;
		}
		if other.max_write_attempts.is_some() {
			self.max_write_attempts = other.max_write_attempts;
		}
		if other.max_in_flight.is_some() {
			self.max_in_flight = other.max_in_flight;
		}
	}
}

/// Partial settings, for merging.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KmsSettingsLayer {
	#[serde(default)]
	pub database: DatabaseSettingsLayer,
	#[serde(default)]
	pub migration: MigrationSettingsLayer,
}

impl KmsSettingsLayer {
	pub fn merge(&mut self, other: KmsSettingsLayer) {
		self.database.merge(other.database);
		self.migration.merge(other.migration);
	}

	/// Parse a TOML file. A missing file yields an empty layer.
	pub fn from_toml_file(path: &Path) -> KmsResult<Self> {
		if !path.exists() {
			debug!(path = %path.display(), "config file not found, skipping");
			return Ok(Self::default());
		}
		let content = std::fs::read_to_string(path).map_err(|e| {
			KmsError::Configuration(format!("failed to read {}: {e}", path.display()))
		})?;
		toml::from_str(&content)
			.map_err(|e| KmsError::Configuration(format!("invalid TOML in {}: {e}", path.display())))
	}

	/// Environment overrides.
	///
	/// Convention: LOOM_KMS_<FIELD>
	pub fn from_env() -> KmsResult<Self> {
		Ok(Self {
			database: DatabaseSettingsLayer {
				url: env_var("LOOM_KMS_DATABASE_URL"),
				replica_url: env_var("LOOM_KMS_REPLICA_DATABASE_URL"),
			},
			migration: MigrationSettingsLayer {
				batch_size: env_parse("LOOM_KMS_MIGRATION_BATCH_SIZE")?,
				cache_capacity: env_parse("LOOM_KMS_CACHE_CAPACITY")?,
				max_write_attempts: env_parse("LOOM_KMS_MAX_WRITE_ATTEMPTS")?,
				max_in_flight: env_parse("LOOM_KMS_MAX_IN_FLIGHT")?,
			},
		})
	}

	pub fn finalize(self) -> KmsResult<KmsSettings> {
		let defaults = MigrationSettings::default();
		let batch_size = self.migration.batch_size.unwrap_or(defaults.batch_size);
		let migration = MigrationSettings {
			batch_size,
			cache_capacity: self.migration.cache_capacity.unwrap_or(defaults.cache_capacity),
			max_write_attempts: self.migration.max_write_attempts.unwrap_or(defaults.max_write_attempts),
			max_in_flight: self.migration.max_in_flight.unwrap_or(batch_size),
		};

		if migration.batch_size == 0 {
			return Err(KmsError::Configuration("batch_size must be at least 1".to_string()));
		}
		if migration.cache_capacity == 0 {
			return Err(KmsError::Configuration("cache_capacity must be at least 1".to_string()));
		}
		if migration.max_write_attempts == 0 {
			return Err(KmsError::Configuration(
				"max_write_attempts must be at least 1".to_string(),
			));
		}
		if migration.max_in_flight == 0 {
			return Err(KmsError::Configuration("max_in_flight must be at least 1".to_string()));
		}

		Ok(KmsSettings {
			database: DatabaseSettings {
				url: self.database.url.unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
				replica_url: self.database.replica_url,
			},
			migration,
		})
	}
}

/// Resolve settings: defaults, then `path` (if any), then the environment.
pub fn load_settings(path: Option<&Path>) -> KmsResult<KmsSettings> {
	let mut layer = KmsSettingsLayer::default();
	if let Some(path) = path {
		layer.merge(KmsSettingsLayer::from_toml_file(path)?);
	}
	layer.merge(KmsSettingsLayer::from_env()?);
	layer.finalize()
}
