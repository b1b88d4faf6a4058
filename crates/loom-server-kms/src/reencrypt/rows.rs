// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reading legacy rows page by page and turning them into envelopes.

use std::sync::Arc;

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use super::plan::{quote, LegacyColumns, LegacyKeySource, ReencryptionPlan, FALLBACK_KEY_ENCODING};
use super::ResumeMode;
use crate::encryption::KeyMaterial;
use crate::error::{KmsError, KmsResult};
use crate::legacy::{decrypt_legacy, LegacyFields, LegacyRootKeys};
use crate::service::CipherPair;

/// Position after the last row of the previous page, in (tenant, primary key)
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
	pub tenant_id: String,
	pub row_id: String,
}

/// Raw legacy column values of one field.
#[derive(Debug, Clone, Default)]
pub(crate) struct RawFields {
	pub ciphertext: Option<String>,
	pub iv: Option<String>,
	pub tag: Option<String>,
	pub key_encoding: Option<String>,
}

impl RawFields {
	pub fn parse(self) -> KmsResult<LegacyFields> {
		LegacyFields::from_columns(
			self.ciphertext,
			self.iv,
			self.tag,
			self.key_encoding,
			FALLBACK_KEY_ENCODING,
		)
	}

	fn read(row: &SqliteRow, prefix: &str) -> KmsResult<Self> {
		Ok(Self {
			ciphertext: row.try_get(format!("{prefix}_ciphertext").as_str())?,
			iv: row.try_get(format!("{prefix}_iv").as_str())?,
			tag: row.try_get(format!("{prefix}_tag").as_str())?,
			key_encoding: row.try_get(format!("{prefix}_key_encoding").as_str())?,
		})
	}
}

/// A row still to be re-encrypted.
#[derive(Debug)]
pub(crate) struct CandidateRow {
	pub row_id: String,
	pub tenant_id: Option<String>,
	pub fields: Vec<RawFields>,
	/// The tenant's sealed legacy key, for plans with a tenant key source.
	pub tenant_key: Option<RawFields>,
}

fn select_legacy(alias: &str, columns: &LegacyColumns, prefix: &str, out: &mut Vec<String>) {
	out.push(format!("{alias}.{} AS {prefix}_ciphertext", quote(&columns.ciphertext)));
	out.push(format!("{alias}.{} AS {prefix}_iv", quote(&columns.iv)));
	out.push(format!("{alias}.{} AS {prefix}_tag", quote(&columns.tag)));
	match &columns.key_encoding {
		Some(column) => out.push(format!("{alias}.{} AS {prefix}_key_encoding", quote(column))),
		None => out.push(format!("NULL AS {prefix}_key_encoding")),
	}
}

/// SELECT for one page of candidate rows.
///
/// Binds, in order: cursor tenant twice and cursor row id (when
/// `with_cursor`), then the page size.
pub(crate) fn page_sql(plan: &ReencryptionPlan, mode: ResumeMode, with_cursor: bool) -> String {
	let tenant = format!("t.{}", quote(&plan.tenant_column));
	let pk = format!("t.{}", quote(&plan.primary_key));

	let mut columns = vec![
		format!("CAST({pk} AS TEXT) AS row_id"),
		format!("CAST({tenant} AS TEXT) AS tenant_id"),
	];
	for (i, field) in plan.fields.iter().enumerate() {
		select_legacy("t", &field.legacy, &format!("f{i}"), &mut columns);
	}

	let mut from = format!("{} AS t", quote(&plan.table));
	if let LegacyKeySource::TenantKey {
		table,
		tenant_column,
		columns: key_columns,
	} = &plan.legacy_key
	{
		select_legacy("k", key_columns, "tk", &mut columns);
		from.push_str(&format!(
			" LEFT JOIN {} AS k ON CAST(k.{} AS TEXT) = CAST({tenant} AS TEXT)",
			quote(table),
			quote(tenant_column)
		));
	}

	let mut filters = Vec::new();
	if with_cursor {
		filters.push(format!("({tenant} > ? OR ({tenant} = ? AND {pk} > ?))"));
	}
	if mode == ResumeMode::SkipMigrated {
		let pending = plan
			.envelope_columns()
			.map(|column| format!("t.{} IS NULL", quote(column)))
			.collect::<Vec<_>>()
			.join(" OR ");
		filters.push(format!("({pending})"));
	}

	let mut sql = format!("SELECT {} FROM {from}", columns.join(", "));
	if !filters.is_empty() {
		sql.push_str(" WHERE ");
		sql.push_str(&filters.join(" AND "));
	}
	sql.push_str(&format!(" ORDER BY {tenant}, {pk} LIMIT ?"));
	sql
}

/// Fetch the next page of rows after `cursor`.
pub(crate) async fn fetch_page(
	pool: &SqlitePool,
	plan: &ReencryptionPlan,
	mode: ResumeMode,
	cursor: Option<&Cursor>,
	limit: usize,
) -> KmsResult<Vec<CandidateRow>> {
	let sql = page_sql(plan, mode, cursor.is_some());
	let mut query = sqlx::query(&sql);
	if let Some(cursor) = cursor {
		query = query
			.bind(&cursor.tenant_id)
			.bind(&cursor.tenant_id)
			.bind(&cursor.row_id);
	}
	let rows = query.bind(limit as i64).fetch_all(pool).await?;

	let has_tenant_key = matches!(plan.legacy_key, LegacyKeySource::TenantKey { .. });
	rows.iter()
		.map(|row| {
			let fields = (0..plan.fields.len())
				.map(|i| RawFields::read(row, &format!("f{i}")))
				.collect::<KmsResult<Vec<_>>>()?;
			let tenant_key = if has_tenant_key {
				Some(RawFields::read(row, "tk")?)
			} else {
				None
			};
			Ok(CandidateRow {
				row_id: row.try_get("row_id")?,
				tenant_id: row.try_get("tenant_id")?,
				fields,
				tenant_key,
			})
		})
		.collect()
}

/// The key that opens a row's legacy fields.
#[derive(Clone)]
pub(crate) enum RowKey {
	Root(Arc<LegacyRootKeys>),
	Tenant(Arc<KeyMaterial>),
	/// Every field is absent, so nothing needs opening.
	Unneeded,
}

/// A row with its tenant's cipher pair and legacy key resolved.
pub(crate) struct PreparedRow {
	pub row_id: String,
	pub tenant_id: String,
	pub fields: Vec<LegacyFields>,
	pub key: RowKey,
	pub pair: Arc<CipherPair>,
}

/// Envelopes for one row, in plan field order.
#[derive(Debug)]
pub(crate) struct TransformedRow {
	pub row_id: String,
	pub envelopes: Vec<Vec<u8>>,
}

/// Decrypt every legacy field of a row and seal it under the tenant's data
/// key. An absent field becomes an envelope of the empty string.
pub(crate) fn reencrypt_row(row: PreparedRow) -> KmsResult<TransformedRow> {
	let envelopes = row
		.fields
		.iter()
		.map(|field| match field {
			LegacyFields::Absent => row.pair.encrypt(b""),
			LegacyFields::Present(legacy) => {
				let plaintext = match &row.key {
					RowKey::Root(keys) => keys.decrypt(legacy)?,
					RowKey::Tenant(key) => decrypt_legacy(key, legacy)?,
					RowKey::Unneeded => {
						return Err(KmsError::Internal(
							"legacy field present but no key was resolved".to_string(),
						))
					}
				};
				row.pair.encrypt(&plaintext)
			}
		})
		.collect::<KmsResult<Vec<_>>>()
		.map_err(|source| KmsError::RowReencryption {
			row_id: row.row_id.clone(),
			tenant_id: row.tenant_id.clone(),
			source: Box::new(source),
		})?;

	Ok(TransformedRow {
		row_id: row.row_id,
		envelopes,
	})
}
