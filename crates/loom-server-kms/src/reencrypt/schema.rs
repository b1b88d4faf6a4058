// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Schema changes around a re-encryption run.
//!
//! SQLite cannot add NOT NULL to an existing column, so tightening installs
//! insert and update triggers that abort on NULL envelopes instead.

use std::collections::HashSet;

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info};

use super::plan::{quote, LegacyKeySource, ReencryptionPlan};
use crate::error::{KmsError, KmsResult};

/// Current column names of `table`; empty if the table does not exist.
pub async fn table_columns(pool: &SqlitePool, table: &str) -> KmsResult<HashSet<String>> {
	let names: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info(?)")
		.bind(table)
		.fetch_all(pool)
		.await?;
	Ok(names.into_iter().collect())
}

fn require_columns<'a>(
	existing: &HashSet<String>,
	table: &str,
	columns: impl IntoIterator<Item = &'a str>,
) -> KmsResult<()> {
	for column in columns {
		if !existing.contains(column) {
			return Err(KmsError::InvalidPlan(format!("column {table}.{column} does not exist")));
		}
	}
	Ok(())
}

/// Check that every column the plan reads exists.
pub async fn check_sources(pool: &SqlitePool, plan: &ReencryptionPlan) -> KmsResult<()> {
	let existing = table_columns(pool, &plan.table).await?;
	if existing.is_empty() {
		return Err(KmsError::InvalidPlan(format!("table {} does not exist", plan.table)));
	}
	require_columns(
		&existing,
		&plan.table,
		[plan.primary_key.as_str(), plan.tenant_column.as_str()],
	)?;
	require_columns(&existing, &plan.table, plan.legacy_columns())?;

	if let LegacyKeySource::TenantKey {
		table,
		tenant_column,
		columns,
	} = &plan.legacy_key
	{
		let key_columns = table_columns(pool, table).await?;
		if key_columns.is_empty() {
			return Err(KmsError::InvalidPlan(format!("tenant key table {table} does not exist")));
		}
		require_columns(&key_columns, table, [tenant_column.as_str()])?;
		require_columns(&key_columns, table, columns.names())?;
	}
	Ok(())
}

/// Add any missing envelope columns as nullable blobs. Returns the columns
/// that were added.
pub async fn expand(pool: &SqlitePool, plan: &ReencryptionPlan) -> KmsResult<Vec<String>> {
	let existing = table_columns(pool, &plan.table).await?;
	let mut added = Vec::new();
	for column in plan.envelope_columns() {
		if existing.contains(column) {
			continue;
		}
		let sql = format!(
			"ALTER TABLE {} ADD COLUMN {} BLOB",
			quote(&plan.table),
			quote(column)
		);
		sqlx::query(&sql).execute(pool).await?;
		debug!(table = %plan.table, column, "added envelope column");
		added.push(column.to_string());
	}
	Ok(added)
}

/// Number of rows with no value in `column`.
pub async fn count_null(pool: &SqlitePool, table: &str, column: &str) -> KmsResult<i64> {
	let sql = format!(
		"SELECT COUNT(*) FROM {} WHERE {} IS NULL",
		quote(table),
		quote(column)
	);
	Ok(sqlx::query_scalar(&sql).fetch_one(pool).await?)
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> KmsResult<i64> {
	let sql = format!("SELECT COUNT(*) FROM {}", quote(table));
	Ok(sqlx::query_scalar(&sql).fetch_one(pool).await?)
}

fn trigger_names(table: &str, column: &str) -> [String; 2] {
	[
		format!("kms_{table}_{column}_not_null_insert"),
		format!("kms_{table}_{column}_not_null_update"),
	]
}

/// Forbid NULL in every envelope column.
///
/// Refuses with `MigrationIncomplete` while any row still lacks an envelope.
pub async fn tighten(pool: &SqlitePool, plan: &ReencryptionPlan) -> KmsResult<()> {
	for column in plan.envelope_columns() {
		let remaining = count_null(pool, &plan.table, column).await?;
		if remaining > 0 {
			return Err(KmsError::MigrationIncomplete {
				table: plan.table.clone(),
				column: column.to_string(),
				remaining,
			});
		}
	}

	let mut tx = pool.begin().await?;
	for column in plan.envelope_columns() {
		let [on_insert, on_update] = trigger_names(&plan.table, column);
		let message = format!("{}.{} may not be NULL", plan.table, column);
		for (name, event) in [(on_insert, "INSERT"), (on_update, "UPDATE")] {
			let sql = format!(
				"CREATE TRIGGER IF NOT EXISTS {name} BEFORE {event} ON {table} \
				 FOR EACH ROW WHEN NEW.{column} IS NULL \
				 BEGIN SELECT RAISE(ABORT, '{message}'); END",
				name = quote(&name),
				table = quote(&plan.table),
				column = quote(column),
			);
			sqlx::query(&sql).execute(&mut *tx).await?;
		}
	}
	tx.commit().await?;

	info!(table = %plan.table, "envelope columns tightened");
	Ok(())
}

/// Whether every envelope column carries its NOT NULL triggers.
pub async fn is_tightened(pool: &SqlitePool, plan: &ReencryptionPlan) -> KmsResult<bool> {
	for column in plan.envelope_columns() {
		for name in trigger_names(&plan.table, column) {
			let found: i64 = sqlx::query_scalar(
				"SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name = ?",
			)
			.bind(&name)
			.fetch_one(pool)
			.await?;
			if found == 0 {
				return Ok(false);
			}
		}
	}
	Ok(true)
}

/// Record that legacy columns of `plan.table` are being rebuilt.
pub async fn mark_restore_started(pool: &SqlitePool, plan: &ReencryptionPlan) -> KmsResult<()> {
	sqlx::query(
		"INSERT INTO kms_restore_progress (table_name, started_at) VALUES (?, ?) ON CONFLICT(table_name) DO NOTHING",
	)
		.bind(&plan.table)
		.bind(Utc::now().to_rfc3339())
		.execute(pool)
		.await?;
	Ok(())
}

/// Whether an earlier rebuild of `plan.table` did not finish.
pub async fn restore_in_progress(pool: &SqlitePool, plan: &ReencryptionPlan) -> KmsResult<bool> {
	let found: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kms_restore_progress WHERE table_name = ?")
		.bind(&plan.table)
		.fetch_one(pool)
		.await?;
	Ok(found > 0)
}

/// Drop the NOT NULL triggers and then the envelope columns themselves.
///
/// Clears any rebuild marker for the table in the same transaction.
pub async fn drop_envelope_columns(pool: &SqlitePool, plan: &ReencryptionPlan) -> KmsResult<()> {
	let existing = table_columns(pool, &plan.table).await?;
	let mut tx = pool.begin().await?;
	for column in plan.envelope_columns() {
		for name in trigger_names(&plan.table, column) {
			sqlx::query(&format!("DROP TRIGGER IF EXISTS {}", quote(&name)))
				.execute(&mut *tx)
				.await?;
		}
		if existing.contains(column) {
			let sql = format!(
				"ALTER TABLE {} DROP COLUMN {}",
				quote(&plan.table),
				quote(column)
			);
			sqlx::query(&sql).execute(&mut *tx).await?;
		}
	}
	sqlx::query("DELETE FROM kms_restore_progress WHERE table_name = ?")
		.bind(&plan.table)
		.execute(&mut *tx)
		.await?;
	tx.commit().await?;
	info!(table = %plan.table, "envelope columns dropped");
	Ok(())
}

/// Re-add missing legacy columns as nullable text. Returns the columns added.
pub async fn restore_legacy_columns(pool: &SqlitePool, plan: &ReencryptionPlan) -> KmsResult<Vec<String>> {
	let existing = table_columns(pool, &plan.table).await?;
	let mut added = Vec::new();
	for column in plan.legacy_columns() {
		if existing.contains(column) {
			continue;
		}
		let sql = format!(
			"ALTER TABLE {} ADD COLUMN {} TEXT",
			quote(&plan.table),
			quote(column)
		);
		sqlx::query(&sql).execute(pool).await?;
		added.push(column.to_string());
	}
	Ok(added)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::reencrypt::plan::fixtures::ldap_plan;
	use crate::testing::create_test_pool;

	async fn ldap_pool() -> SqlitePool {
		let pool = create_test_pool().await;
		sqlx::query(
			"CREATE TABLE ldap_configs (
				id INTEGER PRIMARY KEY,
				org_id TEXT NOT NULL,
				bind_pass_ciphertext TEXT, bind_pass_iv TEXT, bind_pass_tag TEXT, bind_pass_key_encoding TEXT,
				ca_cert_ciphertext TEXT, ca_cert_iv TEXT, ca_cert_tag TEXT, ca_cert_key_encoding TEXT
			)",
		)
		.execute(&pool)
		.await
		.unwrap();
		pool
	}

	#[tokio::test]
	async fn expand_is_idempotent() {
		let pool = ldap_pool().await;
		let plan = ldap_plan();

		let added = expand(&pool, &plan).await.unwrap();
		assert_eq!(added, vec!["encrypted_bind_pass", "encrypted_ca_cert"]);
		assert!(expand(&pool, &plan).await.unwrap().is_empty());

		let columns = table_columns(&pool, "ldap_configs").await.unwrap();
		assert!(columns.contains("encrypted_bind_pass"));
	}

	#[tokio::test]
	async fn missing_source_column_is_invalid_plan() {
		let pool = ldap_pool().await;
		let mut plan = ldap_plan();
		plan.fields[0].legacy.iv = "no_such_column".to_string();
		assert!(matches!(
			check_sources(&pool, &plan).await,
			Err(KmsError::InvalidPlan(_))
		));

		plan.table = "no_such_table".to_string();
		assert!(check_sources(&pool, &plan).await.is_err());
	}

	#[tokio::test]
	async fn tighten_refuses_while_rows_pending() {
		let pool = ldap_pool().await;
		let plan = ldap_plan();
		expand(&pool, &plan).await.unwrap();
		sqlx::query("INSERT INTO ldap_configs (id, org_id) VALUES (1, 'org_1')")
			.execute(&pool)
			.await
			.unwrap();

		let err = tighten(&pool, &plan).await.unwrap_err();
		assert!(matches!(err, KmsError::MigrationIncomplete { remaining: 1, .. }));
		assert!(!is_tightened(&pool, &plan).await.unwrap());
	}

	#[tokio::test]
	async fn tightened_columns_reject_null() {
		let pool = ldap_pool().await;
		let plan = ldap_plan();
		expand(&pool, &plan).await.unwrap();
		tighten(&pool, &plan).await.unwrap();
		assert!(is_tightened(&pool, &plan).await.unwrap());

		let rejected = sqlx::query("INSERT INTO ldap_configs (id, org_id) VALUES (1, 'org_1')")
			.execute(&pool)
			.await;
		assert!(rejected.is_err());

		sqlx::query(
			"INSERT INTO ldap_configs (id, org_id, encrypted_bind_pass, encrypted_ca_cert)
			 VALUES (1, 'org_1', x'01', x'02')",
		)
		.execute(&pool)
		.await
		.unwrap();
	}

	#[tokio::test]
	async fn drop_removes_triggers_and_columns() {
		let pool = ldap_pool().await;
		let plan = ldap_plan();
		expand(&pool, &plan).await.unwrap();
		tighten(&pool, &plan).await.unwrap();

		drop_envelope_columns(&pool, &plan).await.unwrap();

		let columns = table_columns(&pool, "ldap_configs").await.unwrap();
		assert!(!columns.contains("encrypted_bind_pass"));
		assert!(!columns.contains("encrypted_ca_cert"));
		sqlx::query("INSERT INTO ldap_configs (id, org_id) VALUES (1, 'org_1')")
			.execute(&pool)
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn restore_marker_is_cleared_by_drop() {
		let pool = ldap_pool().await;
		let plan = ldap_plan();
		expand(&pool, &plan).await.unwrap();
		assert!(!restore_in_progress(&pool, &plan).await.unwrap());

		mark_restore_started(&pool, &plan).await.unwrap();
		mark_restore_started(&pool, &plan).await.unwrap();
		assert!(restore_in_progress(&pool, &plan).await.unwrap());

		drop_envelope_columns(&pool, &plan).await.unwrap();
		assert!(!restore_in_progress(&pool, &plan).await.unwrap());
	}
}
