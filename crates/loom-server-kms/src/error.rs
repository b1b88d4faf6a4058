// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the key management core.

use thiserror::Error;

use crate::types::KeyClass;

/// Result type alias for KMS operations.
pub type KmsResult<T> = Result<T, KmsError>;

/// Errors that can occur in the key management core.
#[derive(Debug, Error)]
pub enum KmsError {
	// =========================================================================
	// Configuration Errors
	// =========================================================================
	#[error("configuration error: {0}")]
	Configuration(String),

	#[error("HSM unavailable: {0}")]
	HsmUnavailable(String),

	// =========================================================================
	// Encryption Errors
	// =========================================================================
	#[error("encryption failed: {0}")]
	Encryption(String),

	#[error("decryption failed: {0}")]
	Decryption(String),

	#[error("invalid key size: expected {expected}, got {actual}")]
	InvalidKeySize { expected: usize, actual: usize },

	#[error("corrupted data: {0}")]
	CorruptedData(String),

	// =========================================================================
	// Data Key Errors
	// =========================================================================
	#[error("invalid tenant id: {0:?}")]
	InvalidTenantId(String),

	#[error("data key for {tenant_id}/{key_class} conflicted on create but could not be re-read")]
	KeyCreationRace {
		tenant_id: String,
		key_class: KeyClass,
	},

	// =========================================================================
	// Migration Errors
	// =========================================================================
	#[error("invalid migration plan: {0}")]
	InvalidPlan(String),

	#[error("row {row_id} (tenant {tenant_id}) could not be re-encrypted: {source}")]
	RowReencryption {
		row_id: String,
		tenant_id: String,
		#[source]
		source: Box<KmsError>,
	},

	#[error("batch {batch} failed to write after {attempts} attempts: {source}")]
	MigrationBatch {
		batch: u64,
		attempts: u32,
		#[source]
		source: sqlx::Error,
	},

	#[error("migration cancelled after {batches_written} batches")]
	MigrationCancelled { batches_written: u64 },

	#[error("migration incomplete: {remaining} rows in {table} have no value in {column}")]
	MigrationIncomplete {
		table: String,
		column: String,
		remaining: i64,
	},

	// =========================================================================
	// Infrastructure Errors
	// =========================================================================
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("internal error: {0}")]
	Internal(String),
}

impl KmsError {
	/// Returns true if this error should be logged at error level.
	///
	/// Every failure leaving the core is internal from a caller's point of
	/// view except malformed identifiers handed in by the caller.
	pub fn is_internal(&self) -> bool {
		!matches!(self, KmsError::InvalidTenantId(_) | KmsError::InvalidPlan(_))
	}

	/// Returns true if the host must refuse to start when this error is
	/// returned from root key resolution.
	pub fn is_startup_fatal(&self) -> bool {
		matches!(
			self,
			KmsError::Configuration(_) | KmsError::HsmUnavailable(_) | KmsError::InvalidKeySize { .. }
		)
	}

	/// Returns true if the failed operation may succeed when repeated.
	///
	/// Only transient database failures qualify. Decryption failures and
	/// mapping errors such as a missing column never do.
	pub fn is_retryable(&self) -> bool {
		match self {
			KmsError::Database(e) => crate::db::is_transient(e),
			_ => false,
		}
	}

	/// Returns true if this error (or the row error it wraps) is an
	/// authentication failure on ciphertext.
	pub fn is_decryption_failure(&self) -> bool {
		match self {
			KmsError::Decryption(_) | KmsError::CorruptedData(_) => true,
			KmsError::RowReencryption { source, .. } => source.is_decryption_failure(),
			_ => false,
		}
	}
}
