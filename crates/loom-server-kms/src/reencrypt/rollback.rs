// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reverting a table to its legacy columns.

use sqlx::Row;
use tracing::{info, instrument, warn};

use super::plan::{quote, LegacyKeySource, ReencryptionPlan};
use super::{schema, BatchRow, BulkReencryptor, SqliteQuery};
use crate::cache::DataKeyCache;
use crate::error::{KmsError, KmsResult};
use crate::store::DataKeyStore;
use crate::types::TenantKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackMode {
	/// No envelope columns existed.
	NothingToDo,
	/// Legacy columns were intact; envelope columns were dropped.
	DroppedEnvelopeColumns,
	/// Legacy columns were rebuilt from envelopes under the root key, then the
	/// envelope columns were dropped.
	RestoredLegacyColumns,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
	pub plan: String,
	pub mode: RollbackMode,
	pub rows_restored: u64,
}

/// Legacy column values for one row: (ciphertext, iv, tag, key_encoding) per
/// field, all NULL where the envelope was NULL.
struct RestoredRow {
	row_id: String,
	fields: Vec<Option<[String; 4]>>,
}

impl BatchRow for RestoredRow {
	fn bind_to<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
		self.fields
			.iter()
			.fold(query, |query, field| match field {
				Some(values) => values.iter().fold(query, |query, value| query.bind(value.as_str())),
				None => (0..4).fold(query, |query, _| query.bind(None::<&str>)),
			})
			.bind(self.row_id.as_str())
	}
}

impl<S: DataKeyStore> BulkReencryptor<S> {
	/// Undo a migration of `plan.table`.
	///
	/// If the legacy columns are still present only the envelope columns are
	/// dropped. Otherwise the legacy columns are re-added and filled by
	/// decrypting each envelope and encrypting it again under the root key,
	/// which produces new ciphertexts rather than the original ones.
	///
	/// A rebuild that fails part way is resumed from the start by the next
	/// rollback; envelopes are only dropped once every row is rebuilt.
	#[instrument(skip(self, plan), fields(plan = %plan.name, table = %plan.table))]
	pub async fn rollback(&self, plan: &ReencryptionPlan) -> KmsResult<RollbackReport> {
		plan.validate()?;
		let primary = self.connections.primary();
		let existing = schema::table_columns(primary, &plan.table).await?;
		if existing.is_empty() {
			return Err(KmsError::InvalidPlan(format!("table {} does not exist", plan.table)));
		}

		let report = |mode, rows_restored| RollbackReport {
			plan: plan.name.clone(),
			mode,
			rows_restored,
		};

		if !plan.envelope_columns().any(|c| existing.contains(c)) {
			info!("no envelope columns present, nothing to roll back");
			return Ok(report(RollbackMode::NothingToDo, 0));
		}

		// An unfinished rebuild leaves legacy columns present but partly NULL,
		// so their presence alone does not make the envelopes redundant.
		let resuming = schema::restore_in_progress(primary, plan).await?;
		if !resuming && plan.legacy_columns().all(|c| existing.contains(c)) {
			schema::drop_envelope_columns(primary, plan).await?;
			return Ok(report(RollbackMode::DroppedEnvelopeColumns, 0));
		}

		if !matches!(plan.legacy_key, LegacyKeySource::RootKey) {
			return Err(KmsError::InvalidPlan(
				"legacy columns sealed with tenant keys cannot be restored".to_string(),
			));
		}
		if let Some(field) = plan.fields.iter().find(|f| f.legacy.key_encoding.is_none()) {
			return Err(KmsError::InvalidPlan(format!(
				"restoring {} needs a key_encoding column",
				field.envelope_column
			)));
		}
		if let Some(missing) = plan.envelope_columns().find(|c| !existing.contains(*c)) {
			return Err(KmsError::InvalidPlan(format!(
				"cannot restore from a partial migration: {missing} is missing"
			)));
		}

		if resuming {
			warn!("resuming an interrupted rebuild of legacy columns");
		} else {
			warn!("legacy columns missing, rebuilding them under the root key");
		}
		schema::mark_restore_started(primary, plan).await?;
		schema::restore_legacy_columns(primary, plan).await?;
		let rows_restored = self.restore_rows(plan).await?;
		schema::drop_envelope_columns(primary, plan).await?;

		info!(rows_restored, "legacy columns restored");
		Ok(report(RollbackMode::RestoredLegacyColumns, rows_restored))
	}

	async fn restore_rows(&self, plan: &ReencryptionPlan) -> KmsResult<u64> {
		let primary = self.connections.primary();
		let tenant = format!("t.{}", quote(&plan.tenant_column));
		let pk = format!("t.{}", quote(&plan.primary_key));
		let envelopes = plan
			.envelope_columns()
			.enumerate()
			.map(|(i, column)| format!("t.{} AS e{i}", quote(column)))
			.collect::<Vec<_>>()
			.join(", ");
		let select = format!(
			"SELECT CAST({pk} AS TEXT) AS row_id, CAST({tenant} AS TEXT) AS tenant_id, {envelopes} FROM {} AS t",
			quote(&plan.table)
		);
		let first_page = format!("{select} ORDER BY {tenant}, {pk} LIMIT ?");
		let next_page =
			format!("{select} WHERE ({tenant} > ? OR ({tenant} = ? AND {pk} > ?)) ORDER BY {tenant}, {pk} LIMIT ?");
		let update = restore_sql(plan);

		let batch_size = self.options.batch_size.max(1);
		let mut cache = DataKeyCache::new(self.options.cache_capacity);
		let mut cursor: Option<(String, String)> = None;
		let mut restored = 0u64;
		let mut batch = 0u64;

		loop {
			if self.cancel.is_cancelled() {
				return Err(KmsError::MigrationCancelled {
					batches_written: batch,
				});
			}

			let rows = match &cursor {
				None => sqlx::query(&first_page).bind(batch_size as i64).fetch_all(primary).await?,
				Some((tenant_id, row_id)) => {
					sqlx::query(&next_page)
						.bind(tenant_id)
						.bind(tenant_id)
						.bind(row_id)
						.bind(batch_size as i64)
						.fetch_all(primary)
						.await?
				}
			};
			if rows.is_empty() {
				break;
			}

			let mut page = Vec::with_capacity(rows.len());
			for row in &rows {
				let row_id: String = row.try_get("row_id")?;
				let tenant_id: Option<String> = row.try_get("tenant_id")?;
				let tenant_id = tenant_id.unwrap_or_default();
				let restored_row = self
					.restore_row(plan, &mut cache, row, &row_id, &tenant_id)
					.await
					.map_err(|source| KmsError::RowReencryption {
						row_id: row_id.clone(),
						tenant_id: tenant_id.clone(),
						source: Box::new(source),
					})?;
				cursor = Some((tenant_id, row_id));
				page.push(restored_row);
			}

			batch += 1;
			self.write_with_retry(batch, &update, &page).await?;
			restored += page.len() as u64;
			info!(batch, rows = page.len(), "restored batch written");

			if rows.len() < batch_size {
				break;
			}
		}
		Ok(restored)
	}

	async fn restore_row(
		&self,
		plan: &ReencryptionPlan,
		cache: &mut DataKeyCache,
		row: &sqlx::sqlite::SqliteRow,
		row_id: &str,
		tenant_id: &str,
	) -> KmsResult<RestoredRow> {
		let tenant = TenantKey::new(tenant_id, plan.key_class)?;
		let mut fields = Vec::with_capacity(plan.fields.len());
		for i in 0..plan.fields.len() {
			let envelope: Option<Vec<u8>> = row.try_get(format!("e{i}").as_str())?;
			let Some(envelope) = envelope else {
				fields.push(None);
				continue;
			};
			let pair = cache.get_or_create(&*self.kms, &tenant).await?;
			let plaintext = pair.decrypt(&envelope)?;
			let legacy = self.kms.encrypt_with_root_key(&plaintext)?;
			fields.push(Some([
				legacy.ciphertext,
				legacy.iv,
				legacy.tag,
				legacy.key_encoding.as_str().to_string(),
			]));
		}
		Ok(RestoredRow {
			row_id: row_id.to_string(),
			fields,
		})
	}
}

/// UPDATE binding (ciphertext, iv, tag, key_encoding) per field, then the
/// primary key. Only called for plans whose fields all name a key encoding
/// column.
fn restore_sql(plan: &ReencryptionPlan) -> String {
	let assignments = plan
		.fields
		.iter()
		.flat_map(|field| field.legacy.names())
		.map(|column| format!("{} = ?", quote(column)))
		.collect::<Vec<_>>()
		.join(", ");
	format!(
		"UPDATE {} SET {assignments} WHERE {} = ?",
		quote(&plan.table),
		quote(&plan.primary_key)
	)
}
