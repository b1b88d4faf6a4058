// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Persistence for wrapped tenant data keys and the bound root strategy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::db::{is_unique_violation, ConnectionRole, DbConnections};
use crate::error::{KmsError, KmsResult};
use crate::types::{KeyClass, RootKeyStrategy, TenantDataKey, TenantKey};

/// Result of an insert that may lose a creation race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
	Inserted,
	/// A record already exists for the same key.
	Conflict,
}

/// Storage for wrapped data keys.
#[async_trait]
pub trait DataKeyStore: Send + Sync {
	async fn get_data_key(&self, tenant: &TenantKey, role: ConnectionRole) -> KmsResult<Option<TenantDataKey>>;

	/// Insert a new record. A uniqueness conflict is reported as
	/// [`InsertOutcome::Conflict`], never overwritten.
	async fn insert_data_key(&self, data_key: &TenantDataKey) -> KmsResult<InsertOutcome>;

	/// The root strategy recorded by the first successful startup.
	async fn get_root_strategy(&self) -> KmsResult<Option<RootKeyStrategy>>;

	/// Record `strategy` unless one is already recorded; returns the strategy
	/// in effect afterwards.
	async fn record_root_strategy(&self, strategy: RootKeyStrategy) -> KmsResult<RootKeyStrategy>;
}

/// SQLite-backed [`DataKeyStore`].
#[derive(Debug, Clone)]
pub struct SqliteKmsStore {
	connections: DbConnections,
}

#[derive(sqlx::FromRow)]
struct DataKeyRow {
	tenant_id: String,
	key_class: String,
	wrapped_key: Vec<u8>,
	key_version: i64,
	strategy: String,
	created_at: String,
}

impl DataKeyRow {
	fn into_data_key(self) -> KmsResult<TenantDataKey> {
		let key_class: KeyClass = self.key_class.parse()?;
		let created_at = DateTime::parse_from_rfc3339(&self.created_at)
			.map_err(|e| KmsError::CorruptedData(format!("invalid created_at: {e}")))?
			.with_timezone(&Utc);
		let key_version = u32::try_from(self.key_version)
			.map_err(|_| KmsError::CorruptedData(format!("invalid key_version {}", self.key_version)))?;

		Ok(TenantDataKey {
			tenant: TenantKey {
				tenant_id: self.tenant_id,
				key_class,
			},
			wrapped_key: self.wrapped_key,
			key_version,
			strategy: self.strategy.parse()?,
			created_at,
		})
	}
}

impl SqliteKmsStore {
	pub fn new(connections: DbConnections) -> Self {
		Self { connections }
	}
}

#[async_trait]
impl DataKeyStore for SqliteKmsStore {
	#[instrument(skip(self), fields(tenant = %tenant))]
	async fn get_data_key(&self, tenant: &TenantKey, role: ConnectionRole) -> KmsResult<Option<TenantDataKey>> {
		let row: Option<DataKeyRow> = sqlx::query_as(
			r#"
			SELECT tenant_id, key_class, wrapped_key, key_version, strategy, created_at
			FROM kms_tenant_data_keys
			WHERE tenant_id = ? AND key_class = ?
			"#,
		)
		.bind(&tenant.tenant_id)
		.bind(tenant.key_class.as_str())
		.fetch_optional(self.connections.pool(role))
		.await?;

		row.map(DataKeyRow::into_data_key).transpose()
	}

	#[instrument(skip(self, data_key), fields(tenant = %data_key.tenant))]
	async fn insert_data_key(&self, data_key: &TenantDataKey) -> KmsResult<InsertOutcome> {
		let result = sqlx::query(
			r#"
			INSERT INTO kms_tenant_data_keys
				(tenant_id, key_class, wrapped_key, key_version, strategy, created_at)
			VALUES (?, ?, ?, ?, ?, ?)
			"#,
		)
		.bind(&data_key.tenant.tenant_id)
		.bind(data_key.tenant.key_class.as_str())
		.bind(&data_key.wrapped_key)
		.bind(i64::from(data_key.key_version))
		.bind(data_key.strategy.as_str())
		.bind(data_key.created_at.to_rfc3339())
		.execute(self.connections.primary())
		.await;

		match result {
			Ok(_) => Ok(InsertOutcome::Inserted),
			Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Conflict),
			Err(e) => Err(e.into()),
		}
	}

	async fn get_root_strategy(&self) -> KmsResult<Option<RootKeyStrategy>> {
		let row: Option<(String,)> = sqlx::query_as("SELECT strategy FROM kms_root_config WHERE id = 1")
			.fetch_optional(self.connections.primary())
			.await?;
		row.map(|(s,)| s.parse()).transpose()
	}

	#[instrument(skip(self))]
	async fn record_root_strategy(&self, strategy: RootKeyStrategy) -> KmsResult<RootKeyStrategy> {
		if strategy == RootKeyStrategy::Unconfigured {
			return Err(KmsError::Configuration(
				"refusing to record an unconfigured root strategy".to_string(),
			));
		}

		sqlx::query(
			"INSERT INTO kms_root_config (id, strategy, recorded_at) VALUES (1, ?, ?) ON CONFLICT(id) DO NOTHING",
		)
		.bind(strategy.as_str())
		.bind(Utc::now().to_rfc3339())
		.execute(self.connections.primary())
		.await?;

		self.get_root_strategy()
			.await?
			.ok_or_else(|| KmsError::Internal("root strategy missing after insert".to_string()))
	}
}
