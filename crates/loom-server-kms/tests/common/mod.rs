// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

#![allow(dead_code)]

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use loom_server_kms::db::{create_pool, run_migrations};
use loom_server_kms::{
	BulkReencryptor, DbConnections, KmsService, LegacyCiphertext, ReencryptionOptions, ReencryptionPlan,
	RootKeyInputs, RootKeyProvider, SqliteKmsStore,
};
use sqlx::sqlite::SqlitePool;
use tempfile::TempDir;
use zeroize::Zeroizing;

pub struct Harness {
	pub kms: Arc<KmsService<SqliteKmsStore>>,
	pub pool: SqlitePool,
	pub connections: DbConnections,
	_dir: TempDir,
}

/// A KMS with a software root key over a fresh on-disk database.
pub async fn harness() -> Harness {
	let dir = tempfile::tempdir().unwrap();
	let url = format!("sqlite:{}?mode=rwc", dir.path().join("kms.db").display());
	let pool = create_pool(&url).await.unwrap();
	run_migrations(&pool).await.unwrap();

	let connections = DbConnections::new(pool.clone());
	let store = SqliteKmsStore::new(connections.clone());
	let inputs = RootKeyInputs {
		root_encryption_key: Some(Zeroizing::new(BASE64.encode(rand::random::<[u8; 32]>()))),
		..Default::default()
	};
	let root = RootKeyProvider::bootstrap(inputs, &store, None).await.unwrap();

	Harness {
		kms: Arc::new(KmsService::new(root, Arc::new(store))),
		pool,
		connections,
		_dir: dir,
	}
}

impl Harness {
	pub fn reencryptor(&self, options: ReencryptionOptions) -> BulkReencryptor<SqliteKmsStore> {
		BulkReencryptor::new(Arc::clone(&self.kms), self.connections.clone()).with_options(options)
	}

	pub fn seal(&self, plaintext: Option<&str>) -> Option<LegacyCiphertext> {
		plaintext.map(|p| self.kms.encrypt_with_root_key(p.as_bytes()).unwrap())
	}
}

pub fn options(batch_size: usize) -> ReencryptionOptions {
	ReencryptionOptions {
		batch_size,
		..Default::default()
	}
}

pub const LDAP_PLAN: &str = r#"
name = "ldap_configs"
table = "ldap_configs"
primary_key = "id"
tenant_column = "org_id"
key_class = "organization"

[[fields]]
envelope_column = "encrypted_bind_pass"
legacy = { ciphertext = "bind_pass_ciphertext", iv = "bind_pass_iv", tag = "bind_pass_tag", key_encoding = "bind_pass_key_encoding" }

[[fields]]
envelope_column = "encrypted_ca_cert"
legacy = { ciphertext = "ca_cert_ciphertext", iv = "ca_cert_iv", tag = "ca_cert_tag", key_encoding = "ca_cert_key_encoding" }
"#;

pub fn ldap_plan() -> ReencryptionPlan {
	toml::from_str(LDAP_PLAN).unwrap()
}

pub async fn create_ldap_table(pool: &SqlitePool) {
	sqlx::query(
		"CREATE TABLE ldap_configs (
			id INTEGER PRIMARY KEY,
			org_id TEXT NOT NULL,
			bind_pass_ciphertext TEXT,
			bind_pass_iv TEXT,
			bind_pass_tag TEXT,
			bind_pass_key_encoding TEXT,
			ca_cert_ciphertext TEXT,
			ca_cert_iv TEXT,
			ca_cert_tag TEXT,
			ca_cert_key_encoding TEXT
		)",
	)
	.execute(pool)
	.await
	.unwrap();
}

pub fn legacy_values(legacy: &Option<LegacyCiphertext>) -> [Option<String>; 4] {
	match legacy {
		Some(l) => [
			Some(l.ciphertext.clone()),
			Some(l.iv.clone()),
			Some(l.tag.clone()),
			Some(l.key_encoding.as_str().to_string()),
		],
		None => [None, None, None, None],
	}
}

/// Insert a row sealing both fields under the root key; `None` leaves the
/// field's legacy columns NULL.
pub async fn insert_ldap_row(h: &Harness, id: i64, org_id: &str, bind_pass: Option<&str>, ca_cert: Option<&str>) {
	let bind_pass = h.seal(bind_pass);
	let ca_cert = h.seal(ca_cert);
	let mut query = sqlx::query(
		"INSERT INTO ldap_configs (
			id, org_id,
			bind_pass_ciphertext, bind_pass_iv, bind_pass_tag, bind_pass_key_encoding,
			ca_cert_ciphertext, ca_cert_iv, ca_cert_tag, ca_cert_key_encoding
		) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
	)
	.bind(id)
	.bind(org_id);
	for value in legacy_values(&bind_pass).into_iter().chain(legacy_values(&ca_cert)) {
		query = query.bind(value);
	}
	query.execute(&h.pool).await.unwrap();
}

pub async fn envelope(pool: &SqlitePool, id: i64, column: &str) -> Option<Vec<u8>> {
	sqlx::query_scalar(&format!("SELECT {column} FROM ldap_configs WHERE id = ?"))
		.bind(id)
		.fetch_one(pool)
		.await
		.unwrap()
}

pub async fn column_names(pool: &SqlitePool, table: &str) -> Vec<String> {
	sqlx::query_scalar("SELECT name FROM pragma_table_info(?)")
		.bind(table)
		.fetch_all(pool)
		.await
		.unwrap()
}
