// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Tenant-scoped envelope encryption for Loom server.
//!
//! Every tenant and key class gets its own data key, wrapped by a root key
//! held either in software or in an HSM. Callers obtain a [`CipherPair`] from
//! [`KmsService`] and never see key material. Batch jobs go through a
//! [`DataKeyCache`] to avoid unwrapping the same key per row, and
//! [`BulkReencryptor`] moves tables from the legacy root-key ciphertext
//! columns onto tenant envelopes.

pub mod cache;
pub mod config;
pub mod db;
pub mod encryption;
pub mod envelope;
pub mod error;
pub mod hsm;
pub mod key_backend;
pub mod legacy;
pub mod reencrypt;
pub mod root_key;
pub mod service;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheStats, DataKeyCache, DEFAULT_CACHE_CAPACITY};
pub use config::{load_settings, KmsSettings, MigrationSettings, RootKeyInputs};
pub use db::{ConnectionRole, DbConnections};
pub use encryption::KeyMaterial;
pub use envelope::CipherEnvelope;
pub use error::{KmsError, KmsResult};
pub use hsm::{HsmAdapter, HsmDescriptor};
pub use legacy::{KeyEncoding, LegacyCiphertext};
pub use reencrypt::{
	BulkReencryptor, CancellationToken, MigrationPhase, MigrationStatus, ReencryptionOptions,
	ReencryptionPlan, ReencryptionReport, ResumeMode, RollbackMode, RollbackReport,
};
pub use root_key::{RootKeyConfig, RootKeyHandle, RootKeyProvider};
pub use service::{CipherPair, KmsService};
pub use store::{DataKeyStore, SqliteKmsStore};
pub use types::{KeyClass, RootKeyStrategy, TenantDataKey, TenantKey};
