// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SQLite pools and schema for key storage.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};

use crate::config::DatabaseSettings;
use crate::error::{KmsError, KmsResult};

const SCHEMA: &[(&str, &str)] = &[
	(
		"001_kms_data_keys",
		include_str!("../migrations/001_kms_data_keys.sql"),
	),
	(
		"002_kms_restore_progress",
		include_str!("../migrations/002_kms_restore_progress.sql"),
	),
];

/// Which connection a read should go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionRole {
	#[default]
	Primary,
	/// Read replica. Falls back to the primary when none is configured.
	Replica,
}

/// Primary pool plus an optional read replica.
#[derive(Debug, Clone)]
pub struct DbConnections {
	primary: SqlitePool,
	replica: Option<SqlitePool>,
}

impl DbConnections {
	pub fn new(primary: SqlitePool) -> Self {
		Self {
			primary,
			replica: None,
		}
	}

	pub fn with_replica(mut self, replica: SqlitePool) -> Self {
		self.replica = Some(replica);
		self
	}

	/// Open pools for `settings`.
	pub async fn connect(settings: &DatabaseSettings) -> KmsResult<Self> {
		let primary = create_pool(&settings.url).await?;
		let mut connections = Self::new(primary);
		if let Some(url) = &settings.replica_url {
			connections = connections.with_replica(create_pool(url).await?);
		}
		Ok(connections)
	}

	pub fn pool(&self, role: ConnectionRole) -> &SqlitePool {
		match role {
			ConnectionRole::Primary => &self.primary,
			ConnectionRole::Replica => self.replica.as_ref().unwrap_or(&self.primary),
		}
	}

	pub fn primary(&self) -> &SqlitePool {
		&self.primary
	}
}

/// Create a SqlitePool with WAL mode and common settings.
///
/// # Arguments
/// * `database_url` - SQLite connection string (e.g., "sqlite:./loom.db")
#[tracing::instrument(skip(database_url))]
pub async fn create_pool(database_url: &str) -> KmsResult<SqlitePool> {
	let options = SqliteConnectOptions::from_str(database_url)
		.map_err(|e| KmsError::Configuration(format!("invalid database URL: {e}")))?
		.journal_mode(SqliteJournalMode::Wal)
		.synchronous(SqliteSynchronous::Normal)
		.create_if_missing(true);

	let pool = SqlitePool::connect_with(options).await?;

	tracing::debug!("database pool created");
	Ok(pool)
}

/// Create the key storage tables if they are missing.
#[tracing::instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> KmsResult<()> {
	for (name, sql) in SCHEMA {
		for statement in sql.split(';').map(strip_comments).filter(|s| !s.is_empty()) {
			sqlx::query(&statement).execute(pool).await?;
		}
		tracing::debug!(migration = name, "schema applied");
	}
	Ok(())
}

fn strip_comments(chunk: &str) -> String {
	chunk
		.lines()
		.filter(|line| !line.trim_start().starts_with("--"))
		.collect::<Vec<_>>()
		.join("\n")
		.trim()
		.to_string()
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
	if let sqlx::Error::Database(ref db_err) = e {
		return db_err.is_unique_violation() || db_err.message().contains("UNIQUE constraint failed");
	}
	false
}

/// Failures that may clear on their own: the database refused the
/// statement (locked, busy, aborted by a trigger) or the pool could not
/// hand out a connection in time.
pub(crate) fn is_transient(e: &sqlx::Error) -> bool {
	matches!(
		e,
		sqlx::Error::Database(_) | sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut
	)
}
