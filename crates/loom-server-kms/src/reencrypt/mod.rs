// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Bulk re-encryption of legacy rows into tenant envelopes.
//!
//! A run moves one table through these phases:
//!
//! 1. **SchemaExpanded**: nullable envelope columns are added.
//! 2. **Streaming**: candidate rows are read in (tenant, primary key) order,
//!    one page at a time.
//! 3. **BatchWriting**: each page is transformed and written in a single
//!    transaction, retried with backoff on failure.
//! 4. **SchemaTightened**: envelope columns are made non-nullable once every
//!    row has one.
//! 5. **Done**.
//!
//! A row that cannot be decrypted aborts the run before its batch is written.
//! Earlier batches stay committed, so a rerun in the default
//! [`ResumeMode::SkipMigrated`] picks up where the failure happened.

pub mod plan;
mod rollback;
mod rows;
pub mod schema;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool};
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheStats, DataKeyCache};
use crate::config::MigrationSettings;
use crate::db::{ConnectionRole, DbConnections};
use crate::encryption::KeyMaterial;
use crate::error::{KmsError, KmsResult};
use crate::legacy::{parse_tenant_legacy_key, LegacyFields, LegacyRootKeys};
use crate::service::KmsService;
use crate::store::DataKeyStore;
use crate::types::TenantKey;

pub use plan::{FieldMapping, LegacyColumns, LegacyKeySource, ReencryptionPlan, FALLBACK_KEY_ENCODING};
pub use rollback::{RollbackMode, RollbackReport};

use plan::quote;
use rows::{CandidateRow, Cursor, PreparedRow, RawFields, RowKey, TransformedRow};

const BASE_RETRY_DELAY_MS: u64 = 100;
const MAX_RETRY_DELAY_MS: u64 = 5_000;

/// Cooperative cancellation, checked between batches.
#[derive(Clone)]
pub struct CancellationToken {
	cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
	pub fn new() -> Self {
		Self {
			cancelled: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn cancel(&self) {
		self.cancelled.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::SeqCst)
	}
}

impl Default for CancellationToken {
	fn default() -> Self {
		Self::new()
	}
}

/// Which rows a run reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeMode {
	/// Only rows missing at least one envelope.
	#[default]
	SkipMigrated,
	/// Every row, overwriting existing envelopes.
	Recompute,
}

#[derive(Debug, Clone)]
pub struct ReencryptionOptions {
	pub batch_size: usize,
	pub cache_capacity: usize,
	pub max_write_attempts: u32,
	pub max_in_flight: usize,
	pub mode: ResumeMode,
	/// Where candidate rows are streamed from. Writes always go to the
	/// primary.
	pub read_role: ConnectionRole,
}

impl From<&MigrationSettings> for ReencryptionOptions {
	fn from(settings: &MigrationSettings) -> Self {
		Self {
			batch_size: settings.batch_size,
			cache_capacity: settings.cache_capacity,
			max_write_attempts: settings.max_write_attempts,
			max_in_flight: settings.max_in_flight,
			mode: ResumeMode::default(),
			read_role: ConnectionRole::default(),
		}
	}
}

impl Default for ReencryptionOptions {
	fn default() -> Self {
		Self::from(&MigrationSettings::default())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
	SchemaExpanded,
	Streaming,
	BatchWriting,
	SchemaTightened,
	Done,
}

impl MigrationPhase {
	pub fn as_str(&self) -> &'static str {
		match self {
			MigrationPhase::SchemaExpanded => "schema_expanded",
			MigrationPhase::Streaming => "streaming",
			MigrationPhase::BatchWriting => "batch_writing",
			MigrationPhase::SchemaTightened => "schema_tightened",
			MigrationPhase::Done => "done",
		}
	}
}

impl fmt::Display for MigrationPhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct ReencryptionReport {
	pub plan: String,
	pub phase: MigrationPhase,
	/// Envelope columns this run added; empty on a rerun.
	pub columns_added: Vec<String>,
	pub rows_migrated: u64,
	pub batches_written: u64,
	pub cache: CacheStats,
}

impl ReencryptionReport {
	fn enter(&mut self, phase: MigrationPhase) {
		if self.phase != phase {
			debug!(plan = %self.plan, from = %self.phase, to = %phase, "migration phase");
			self.phase = phase;
		}
	}
}

/// Progress of a table, as seen from outside a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
	pub plan: String,
	pub total_rows: i64,
	/// Rows missing at least one envelope.
	pub pending_rows: i64,
	pub envelope_columns_present: bool,
	pub legacy_columns_present: bool,
	pub tightened: bool,
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// A row update keyed by primary key.
pub(crate) trait BatchRow: Send + Sync {
	/// Bind the SET values in column order, then the primary key.
	fn bind_to<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q>;
}

impl BatchRow for TransformedRow {
	fn bind_to<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
		self.envelopes
			.iter()
			.fold(query, |query, envelope| query.bind(envelope.as_slice()))
			.bind(self.row_id.as_str())
	}
}

pub struct BulkReencryptor<S: DataKeyStore> {
	kms: Arc<KmsService<S>>,
	connections: DbConnections,
	options: ReencryptionOptions,
	cancel: CancellationToken,
}

impl<S: DataKeyStore> BulkReencryptor<S> {
	/// `connections` must reach the tables named by the plans this runs.
	pub fn new(kms: Arc<KmsService<S>>, connections: DbConnections) -> Self {
		Self {
			kms,
			connections,
			options: ReencryptionOptions::default(),
			cancel: CancellationToken::new(),
		}
	}

	pub fn with_options(mut self, options: ReencryptionOptions) -> Self {
		self.options = options;
		self
	}

	pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
		self.cancel = cancel;
		self
	}

	pub fn cancellation_token(&self) -> CancellationToken {
		self.cancel.clone()
	}

	/// Migrate every row of `plan.table` into envelopes and tighten the
	/// envelope columns.
	#[instrument(skip(self, plan), fields(plan = %plan.name, table = %plan.table))]
	pub async fn run(&self, plan: &ReencryptionPlan) -> KmsResult<ReencryptionReport> {
		plan.validate()?;
		let primary = self.connections.primary();
		schema::check_sources(primary, plan).await?;

		let columns_added = schema::expand(primary, plan).await?;
		let mut report = ReencryptionReport {
			plan: plan.name.clone(),
			phase: MigrationPhase::SchemaExpanded,
			columns_added,
			rows_migrated: 0,
			batches_written: 0,
			cache: CacheStats::default(),
		};
		info!(columns_added = report.columns_added.len(), mode = ?self.options.mode, "schema expanded");

		let batch_size = self.options.batch_size.max(1);
		let mut cache = DataKeyCache::new(self.options.cache_capacity);
		let mut cursor: Option<Cursor> = None;

		loop {
			if self.cancel.is_cancelled() {
				warn!(batches_written = report.batches_written, "migration cancelled");
				return Err(KmsError::MigrationCancelled {
					batches_written: report.batches_written,
				});
			}

			report.enter(MigrationPhase::Streaming);
			let page = rows::fetch_page(
				self.connections.pool(self.options.read_role),
				plan,
				self.options.mode,
				cursor.as_ref(),
				batch_size,
			)
			.await?;
			let Some(last) = page.last() else {
				break;
			};
			let next_cursor = Cursor {
				tenant_id: last.tenant_id.clone().unwrap_or_default(),
				row_id: last.row_id.clone(),
			};
			let page_len = page.len();
			let batch = report.batches_written + 1;

			let transformed = self.transform_page(plan, &mut cache, page).await?;

			report.enter(MigrationPhase::BatchWriting);
			self.write_with_retry(batch, &update_envelopes_sql(plan), &transformed)
				.await?;
			report.batches_written = batch;
			report.rows_migrated += transformed.len() as u64;
			info!(batch, rows = transformed.len(), "batch written");

			if page_len < batch_size {
				break;
			}
			cursor = Some(next_cursor);
		}

		schema::tighten(primary, plan).await?;
		report.enter(MigrationPhase::SchemaTightened);

		report.cache = cache.stats();
		report.enter(MigrationPhase::Done);
		info!(
			rows_migrated = report.rows_migrated,
			batches_written = report.batches_written,
			cache_hit_rate = report.cache.hit_rate(),
			"migration complete"
		);
		Ok(report)
	}

	/// Count migrated and pending rows without changing anything.
	pub async fn status(&self, plan: &ReencryptionPlan) -> KmsResult<MigrationStatus> {
		plan.validate()?;
		let pool = self.connections.pool(self.options.read_role);
		let columns = schema::table_columns(pool, &plan.table).await?;
		if columns.is_empty() {
			return Err(KmsError::InvalidPlan(format!("table {} does not exist", plan.table)));
		}

		let envelope_columns_present = plan.envelope_columns().all(|c| columns.contains(c));
		let legacy_columns_present = plan.legacy_columns().all(|c| columns.contains(c));
		let total_rows = schema::count_rows(pool, &plan.table).await?;

		let (pending_rows, tightened) = if envelope_columns_present {
			let pending = plan
				.envelope_columns()
				.map(|column| format!("{} IS NULL", quote(column)))
				.collect::<Vec<_>>()
				.join(" OR ");
			let sql = format!("SELECT COUNT(*) FROM {} WHERE {pending}", quote(&plan.table));
			let pending_rows: i64 = sqlx::query_scalar(&sql).fetch_one(pool).await?;
			(pending_rows, schema::is_tightened(pool, plan).await?)
		} else {
			(total_rows, false)
		};

		Ok(MigrationStatus {
			plan: plan.name.clone(),
			total_rows,
			pending_rows,
			envelope_columns_present,
			legacy_columns_present,
			tightened,
		})
	}

	/// Resolve cipher pairs and legacy keys for a page, then transform rows
	/// in parallel.
	///
	/// Resolution runs one row at a time so each tenant is unwrapped once per
	/// cache residency. The CPU-bound transforms are fanned out to the
	/// blocking pool, at most `max_in_flight` at once.
	async fn transform_page(
		&self,
		plan: &ReencryptionPlan,
		cache: &mut DataKeyCache,
		page: Vec<CandidateRow>,
	) -> KmsResult<Vec<TransformedRow>> {
		let root_keys = self.kms.legacy_root_keys();
		let mut tenant_keys: HashMap<String, Arc<KeyMaterial>> = HashMap::new();

		let mut prepared = Vec::with_capacity(page.len());
		for row in page {
			let row_id = row.row_id.clone();
			let tenant_id = row.tenant_id.clone().unwrap_or_default();
			match self
				.prepare_row(plan, cache, &root_keys, &mut tenant_keys, row)
				.await
			{
				Ok(row) => prepared.push(row),
				Err(source) => {
					return Err(KmsError::RowReencryption {
						row_id,
						tenant_id,
						source: Box::new(source),
					})
				}
			}
		}

		stream::iter(prepared)
			.map(|row| async move {
				tokio::task::spawn_blocking(move || rows::reencrypt_row(row))
					.await
					.map_err(|e| KmsError::Internal(format!("re-encryption task failed: {e}")))?
			})
			.buffered(self.options.max_in_flight.max(1))
			.try_collect()
			.await
	}

	async fn prepare_row(
		&self,
		plan: &ReencryptionPlan,
		cache: &mut DataKeyCache,
		root_keys: &Arc<LegacyRootKeys>,
		tenant_keys: &mut HashMap<String, Arc<KeyMaterial>>,
		row: CandidateRow,
	) -> KmsResult<PreparedRow> {
		let tenant_id = row
			.tenant_id
			.ok_or_else(|| KmsError::CorruptedData(format!("{} is NULL", plan.tenant_column)))?;
		let tenant = TenantKey::new(&tenant_id, plan.key_class)?;
		let fields = row
			.fields
			.into_iter()
			.map(RawFields::parse)
			.collect::<KmsResult<Vec<_>>>()?;

		let needs_key = fields.iter().any(|f| matches!(f, LegacyFields::Present(_)));
		let key = match &plan.legacy_key {
			_ if !needs_key => RowKey::Unneeded,
			LegacyKeySource::RootKey => RowKey::Root(Arc::clone(root_keys)),
			LegacyKeySource::TenantKey { .. } => RowKey::Tenant(tenant_legacy_key(
				root_keys,
				tenant_keys,
				&tenant_id,
				row.tenant_key,
			)?),
		};

		let pair = cache.get_or_create(&*self.kms, &tenant).await?;

		Ok(PreparedRow {
			row_id: row.row_id,
			tenant_id,
			fields,
			key,
			pair,
		})
	}

	/// Write one batch in a single transaction, retrying transient failures
	/// with backoff.
	pub(crate) async fn write_with_retry<R: BatchRow>(
		&self,
		batch: u64,
		sql: &str,
		rows: &[R],
	) -> KmsResult<()> {
		let max_attempts = self.options.max_write_attempts.max(1);
		let mut attempt = 0;
		loop {
			attempt += 1;
			match write_batch(self.connections.primary(), sql, rows).await {
				Ok(()) => return Ok(()),
				Err(source) => {
					let e = KmsError::from(source);
					if attempt >= max_attempts || !e.is_retryable() {
						return Err(match e {
							KmsError::Database(source) => KmsError::MigrationBatch {
								batch,
								attempts: attempt,
								source,
							},
							other => other,
						});
					}
					let delay = retry_delay(attempt);
					warn!(
						batch,
						attempt,
						delay_ms = delay.as_millis() as u64,
						error = %e,
						"batch write failed, retrying"
					);
					tokio::time::sleep(delay).await;
				}
			}
		}
	}
}

/// Decrypt a tenant's own legacy key, once per tenant per page.
fn tenant_legacy_key(
	root_keys: &LegacyRootKeys,
	known: &mut HashMap<String, Arc<KeyMaterial>>,
	tenant_id: &str,
	sealed: Option<RawFields>,
) -> KmsResult<Arc<KeyMaterial>> {
	if let Some(key) = known.get(tenant_id) {
		return Ok(Arc::clone(key));
	}
	let sealed = match sealed.map(RawFields::parse).transpose()? {
		Some(LegacyFields::Present(sealed)) => sealed,
		_ => {
			return Err(KmsError::CorruptedData(format!(
				"tenant {tenant_id} has no legacy key"
			)))
		}
	};
	let key = Arc::new(parse_tenant_legacy_key(&root_keys.decrypt(&sealed)?)?);
	known.insert(tenant_id.to_string(), Arc::clone(&key));
	Ok(key)
}

fn update_envelopes_sql(plan: &ReencryptionPlan) -> String {
	let assignments = plan
		.envelope_columns()
		.map(|column| format!("{} = ?", quote(column)))
		.collect::<Vec<_>>()
		.join(", ");
	format!(
		"UPDATE {} SET {assignments} WHERE {} = ?",
		quote(&plan.table),
		quote(&plan.primary_key)
	)
}

async fn write_batch<R: BatchRow>(pool: &SqlitePool, sql: &str, rows: &[R]) -> Result<(), sqlx::Error> {
	let mut tx = pool.begin().await?;
	for row in rows {
		row.bind_to(sqlx::query(sql)).execute(&mut *tx).await?;
	}
	tx.commit().await
}

/// Exponential backoff from 100ms, capped at 5s, plus up to 25% jitter.
pub(crate) fn retry_delay(attempt: u32) -> Duration {
	let exponent = attempt.saturating_sub(1).min(16);
	let delay = BASE_RETRY_DELAY_MS
		.saturating_mul(1u64 << exponent)
		.min(MAX_RETRY_DELAY_MS);
	Duration::from_millis(delay + fastrand::u64(0..=delay / 4))
}
