// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Description of one table's move from legacy columns to envelopes.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{KmsError, KmsResult};
use crate::legacy::KeyEncoding;
use crate::types::KeyClass;

/// Encoding assumed when a plan names no key encoding column.
pub const FALLBACK_KEY_ENCODING: KeyEncoding = KeyEncoding::Utf8;

/// The legacy columns holding one encrypted value.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LegacyColumns {
	pub ciphertext: String,
	pub iv: String,
	pub tag: String,
	#[serde(default)]
	pub key_encoding: Option<String>,
}

impl LegacyColumns {
	pub fn names(&self) -> impl Iterator<Item = &str> {
		[self.ciphertext.as_str(), self.iv.as_str(), self.tag.as_str()]
			.into_iter()
			.chain(self.key_encoding.as_deref())
	}
}

/// One legacy value and the envelope column replacing it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldMapping {
	pub legacy: LegacyColumns,
	pub envelope_column: String,
}

/// Where the key that sealed the legacy values comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LegacyKeySource {
	/// Values were sealed with the root key directly.
	#[default]
	RootKey,
	/// Values were sealed with a per-tenant key, itself sealed with the root
	/// key and stored in `table`, one row per tenant.
	TenantKey {
		table: String,
		tenant_column: String,
		columns: LegacyColumns,
	},
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReencryptionPlan {
	/// Label used in logs and reports.
	pub name: String,
	pub table: String,
	pub primary_key: String,
	pub tenant_column: String,
	pub key_class: KeyClass,
	#[serde(default)]
	pub legacy_key: LegacyKeySource,
	pub fields: Vec<FieldMapping>,
}

impl ReencryptionPlan {
	/// Load a plan from a TOML file.
	pub fn from_toml_file(path: &Path) -> KmsResult<Self> {
		let content = std::fs::read_to_string(path)
			.map_err(|e| KmsError::InvalidPlan(format!("failed to read {}: {e}", path.display())))?;
		let plan: Self = toml::from_str(&content)
			.map_err(|e| KmsError::InvalidPlan(format!("invalid plan {}: {e}", path.display())))?;
		plan.validate()?;
		Ok(plan)
	}

	/// Check identifiers and mappings before any SQL is built from them.
	pub fn validate(&self) -> KmsResult<()> {
		check_identifier("table", &self.table)?;
		check_identifier("primary_key", &self.primary_key)?;
		check_identifier("tenant_column", &self.tenant_column)?;

		if self.fields.is_empty() {
			return Err(KmsError::InvalidPlan(format!("plan {} maps no fields", self.name)));
		}

		let mut targets = HashSet::new();
		let mut sources = HashSet::new();
		for field in &self.fields {
			check_identifier("envelope_column", &field.envelope_column)?;
			if !targets.insert(field.envelope_column.as_str()) {
				return Err(KmsError::InvalidPlan(format!(
					"envelope column {} is mapped twice",
					field.envelope_column
				)));
			}
			for column in field.legacy.names() {
				check_identifier("legacy column", column)?;
				if !sources.insert(column) {
					return Err(KmsError::InvalidPlan(format!("legacy column {column} is mapped twice")));
				}
			}
		}

		for target in &targets {
			if sources.contains(target) {
				return Err(KmsError::InvalidPlan(format!(
					"column {target} is both a legacy and an envelope column"
				)));
			}
		}

		if let LegacyKeySource::TenantKey {
			table,
			tenant_column,
			columns,
		} = &self.legacy_key
		{
			check_identifier("tenant key table", table)?;
			check_identifier("tenant key tenant_column", tenant_column)?;
			for column in columns.names() {
				check_identifier("tenant key column", column)?;
			}
		}

		Ok(())
	}

	pub fn envelope_columns(&self) -> impl Iterator<Item = &str> {
		self.fields.iter().map(|f| f.envelope_column.as_str())
	}

	pub fn legacy_columns(&self) -> impl Iterator<Item = &str> {
		self.fields.iter().flat_map(|f| f.legacy.names())
	}
}

fn check_identifier(what: &str, ident: &str) -> KmsResult<()> {
	let mut chars = ident.chars();
	let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
	let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
	if valid_start && valid_rest && ident.len() <= 64 {
		Ok(())
	} else {
		Err(KmsError::InvalidPlan(format!("{what} {ident:?} is not a valid identifier")))
	}
}

/// Quote a validated identifier.
pub(crate) fn quote(ident: &str) -> String {
	format!("\"{ident}\"")
}

#[cfg(test)]
pub(crate) mod fixtures {
	use super::*;

	pub fn legacy(prefix: &str, with_encoding: bool) -> LegacyColumns {
		LegacyColumns {
			ciphertext: format!("{prefix}_ciphertext"),
			iv: format!("{prefix}_iv"),
			tag: format!("{prefix}_tag"),
			key_encoding: with_encoding.then(|| format!("{prefix}_key_encoding")),
		}
	}

	pub fn ldap_plan() -> ReencryptionPlan {
		ReencryptionPlan {
			name: "ldap_configs".to_string(),
			table: "ldap_configs".to_string(),
			primary_key: "id".to_string(),
			tenant_column: "org_id".to_string(),
			key_class: KeyClass::Organization,
			legacy_key: LegacyKeySource::RootKey,
			fields: vec![
				FieldMapping {
					legacy: legacy("bind_pass", true),
					envelope_column: "encrypted_bind_pass".to_string(),
				},
				FieldMapping {
					legacy: legacy("ca_cert", true),
					envelope_column: "encrypted_ca_cert".to_string(),
				},
			],
		}
	}
}
