// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Legacy four-column ciphertext scheme.
//!
//! Rows encrypted before envelope encryption store `ciphertext`, `iv` and
//! `tag` as separate base64 text columns plus a `key_encoding` column naming
//! which root secret sealed them:
//!
//! - `base64`: the root encryption key (base64 of 32 bytes), 12-byte IV.
//! - `utf8`: the encryption key used as its raw 32 UTF-8 bytes, 16-byte IV.
//!
//! The IV length selects the GCM nonce size on decrypt.

use std::fmt;
use std::str::FromStr;

use aes_gcm::{
	aead::{consts::U16, Aead, KeyInit},
	aes::Aes256,
	Aes256Gcm, AesGcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::encryption::{KeyMaterial, TAG_SIZE};
use crate::error::{KmsError, KmsResult};

/// AES-256-GCM with a 16-byte nonce, as written by the UTF-8 key path.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Which root secret sealed a legacy value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEncoding {
	Base64,
	Utf8,
}

impl KeyEncoding {
	pub fn as_str(&self) -> &'static str {
		match self {
			KeyEncoding::Base64 => "base64",
			KeyEncoding::Utf8 => "utf8",
		}
	}

	fn iv_size(&self) -> usize {
		match self {
			KeyEncoding::Base64 => 12,
			KeyEncoding::Utf8 => 16,
		}
	}
}

impl fmt::Display for KeyEncoding {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for KeyEncoding {
	type Err = KmsError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"base64" => Ok(KeyEncoding::Base64),
			"utf8" => Ok(KeyEncoding::Utf8),
			other => Err(KmsError::CorruptedData(format!("unknown key encoding: {other}"))),
		}
	}
}

/// A legacy ciphertext as stored across its columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyCiphertext {
	pub iv: String,
	pub tag: String,
	pub ciphertext: String,
	pub key_encoding: KeyEncoding,
}

/// The legacy columns of one field in one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyFields {
	Present(LegacyCiphertext),
	/// One or more of ciphertext, IV or tag is NULL: nothing was stored.
	Absent,
}

impl LegacyFields {
	/// Build from nullable column values.
	///
	/// `key_encoding` is only consulted when the other three are present. A
	/// missing encoding defaults to `fallback`; an unknown one is corruption.
	pub fn from_columns(
		ciphertext: Option<String>,
		iv: Option<String>,
		tag: Option<String>,
		key_encoding: Option<String>,
		fallback: KeyEncoding,
	) -> KmsResult<Self> {
		let (Some(ciphertext), Some(iv), Some(tag)) = (ciphertext, iv, tag) else {
			return Ok(LegacyFields::Absent);
		};
		let key_encoding = match key_encoding {
			Some(raw) => raw.parse()?,
			None => fallback,
		};
		Ok(LegacyFields::Present(LegacyCiphertext {
			iv,
			tag,
			ciphertext,
			key_encoding,
		}))
	}
}

/// The root secrets able to read and write the legacy scheme.
#[derive(Default)]
pub struct LegacyRootKeys {
	root_encryption_key: Option<KeyMaterial>,
	encryption_key: Option<KeyMaterial>,
}

impl LegacyRootKeys {
	pub fn new(root_encryption_key: Option<KeyMaterial>, encryption_key: Option<KeyMaterial>) -> Self {
		Self {
			root_encryption_key,
			encryption_key,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.root_encryption_key.is_none() && self.encryption_key.is_none()
	}

	/// Encrypt under the root encryption key if present, else the UTF-8
	/// encryption key.
	pub fn encrypt(&self, plaintext: &[u8]) -> KmsResult<LegacyCiphertext> {
		if let Some(key) = &self.root_encryption_key {
			return encrypt_legacy(key, KeyEncoding::Base64, plaintext);
		}
		if let Some(key) = &self.encryption_key {
			return encrypt_legacy(key, KeyEncoding::Utf8, plaintext);
		}
		Err(KmsError::Configuration(
			"no software root key configured for legacy encryption".to_string(),
		))
	}

	pub fn decrypt(&self, legacy: &LegacyCiphertext) -> KmsResult<Zeroizing<Vec<u8>>> {
		let key = match legacy.key_encoding {
			KeyEncoding::Base64 => self.root_encryption_key.as_ref(),
			KeyEncoding::Utf8 => self.encryption_key.as_ref(),
		}
		.ok_or_else(|| {
			KmsError::Configuration(format!(
				"legacy value sealed with {} key but that key is not configured",
				legacy.key_encoding
			))
		})?;
		decrypt_legacy(key, legacy)
	}
}

impl fmt::Debug for LegacyRootKeys {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LegacyRootKeys")
			.field("root_encryption_key", &self.root_encryption_key.as_ref().map(|_| "[REDACTED]"))
			.field("encryption_key", &self.encryption_key.as_ref().map(|_| "[REDACTED]"))
			.finish()
	}
}

/// Encrypt with an explicit key using the IV size of `encoding`.
pub fn encrypt_legacy(
	key: &KeyMaterial,
	encoding: KeyEncoding,
	plaintext: &[u8],
) -> KmsResult<LegacyCiphertext> {
	let mut iv = vec![0u8; encoding.iv_size()];
	OsRng.fill_bytes(&mut iv);

	let mut ciphertext = match encoding.iv_size() {
		12 => Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.expose()))
			.encrypt(Nonce::from_slice(&iv), plaintext),
		_ => Aes256Gcm16::new(Key::<Aes256Gcm16>::from_slice(key.expose()))
			.encrypt(Nonce::<U16>::from_slice(&iv), plaintext),
	}
	.map_err(|e| KmsError::Encryption(format!("legacy encryption failed: {e}")))?;

	let tag = ciphertext.split_off(ciphertext.len() - TAG_SIZE);

	Ok(LegacyCiphertext {
		iv: BASE64.encode(&iv),
		tag: BASE64.encode(&tag),
		ciphertext: BASE64.encode(&ciphertext),
		key_encoding: encoding,
	})
}

/// Decrypt with an explicit key; `legacy.key_encoding` is not consulted.
pub fn decrypt_legacy(key: &KeyMaterial, legacy: &LegacyCiphertext) -> KmsResult<Zeroizing<Vec<u8>>> {
	let iv = decode_column("iv", &legacy.iv)?;
	let tag = decode_column("tag", &legacy.tag)?;
	let mut combined = decode_column("ciphertext", &legacy.ciphertext)?;

	if tag.len() != TAG_SIZE {
		return Err(KmsError::Decryption(format!(
			"legacy tag must be {TAG_SIZE} bytes, got {}",
			tag.len()
		)));
	}
	combined.extend_from_slice(&tag);

	let plaintext = match iv.len() {
		12 => Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.expose()))
			.decrypt(Nonce::from_slice(&iv), combined.as_slice()),
		16 => Aes256Gcm16::new(Key::<Aes256Gcm16>::from_slice(key.expose()))
			.decrypt(Nonce::<U16>::from_slice(&iv), combined.as_slice()),
		n => {
			return Err(KmsError::Decryption(format!(
				"legacy IV must be 12 or 16 bytes, got {n}"
			)))
		}
	}
	.map_err(|e| KmsError::Decryption(format!("legacy authentication failed: {e}")))?;

	Ok(Zeroizing::new(plaintext))
}

fn decode_column(column: &str, value: &str) -> KmsResult<Vec<u8>> {
	BASE64
		.decode(value)
		.map_err(|e| KmsError::Decryption(format!("legacy {column} is not valid base64: {e}")))
}

/// Parse a tenant's own legacy key, stored as base64 text of 32 bytes.
pub fn parse_tenant_legacy_key(plaintext: &[u8]) -> KmsResult<KeyMaterial> {
	let decoded = Zeroizing::new(
		BASE64
			.decode(plaintext)
			.map_err(|e| KmsError::Decryption(format!("tenant legacy key is not base64: {e}")))?,
	);
	KeyMaterial::from_slice(&decoded)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn both_keys() -> LegacyRootKeys {
		LegacyRootKeys::new(Some(KeyMaterial::generate()), Some(KeyMaterial::generate()))
	}

	#[test]
	fn prefers_root_encryption_key() {
		let keys = both_keys();
		let legacy = keys.encrypt(b"bind-password").unwrap();
		assert_eq!(legacy.key_encoding, KeyEncoding::Base64);
		assert_eq!(BASE64.decode(&legacy.iv).unwrap().len(), 12);
		assert_eq!(keys.decrypt(&legacy).unwrap().as_slice(), b"bind-password");
	}

	#[test]
	fn utf8_key_uses_sixteen_byte_iv() {
		let keys = LegacyRootKeys::new(None, Some(KeyMaterial::generate()));
		let legacy = keys.encrypt(b"bind-password").unwrap();
		assert_eq!(legacy.key_encoding, KeyEncoding::Utf8);
		assert_eq!(BASE64.decode(&legacy.iv).unwrap().len(), 16);
		assert_eq!(keys.decrypt(&legacy).unwrap().as_slice(), b"bind-password");
	}

	#[test]
	fn tag_is_stored_apart_from_ciphertext() {
		let keys = both_keys();
		let legacy = keys.encrypt(b"abc").unwrap();
		assert_eq!(BASE64.decode(&legacy.ciphertext).unwrap().len(), 3);
		assert_eq!(BASE64.decode(&legacy.tag).unwrap().len(), TAG_SIZE);
	}

	#[test]
	fn missing_key_for_encoding_is_configuration_error() {
		let writer = LegacyRootKeys::new(None, Some(KeyMaterial::generate()));
		let legacy = writer.encrypt(b"x").unwrap();
		let reader = LegacyRootKeys::new(Some(KeyMaterial::generate()), None);
		assert!(matches!(reader.decrypt(&legacy), Err(KmsError::Configuration(_))));
	}

	#[test]
	fn empty_keys_cannot_encrypt() {
		assert!(LegacyRootKeys::default().is_empty());
		assert!(matches!(
			LegacyRootKeys::default().encrypt(b"x"),
			Err(KmsError::Configuration(_))
		));
	}

	#[test]
	fn corrupted_ciphertext_is_decryption_error() {
		let keys = both_keys();
		let mut legacy = keys.encrypt(b"secret").unwrap();
		let mut raw = BASE64.decode(&legacy.ciphertext).unwrap();
		raw[0] ^= 0x01;
		legacy.ciphertext = BASE64.encode(raw);
		assert!(matches!(keys.decrypt(&legacy), Err(KmsError::Decryption(_))));

		legacy.iv = "not base64!".to_string();
		assert!(matches!(keys.decrypt(&legacy), Err(KmsError::Decryption(_))));
	}

	#[test]
	fn fields_with_any_null_are_absent() {
		let fields = LegacyFields::from_columns(
			Some("c".into()),
			None,
			Some("t".into()),
			Some("base64".into()),
			KeyEncoding::Base64,
		)
		.unwrap();
		assert_eq!(fields, LegacyFields::Absent);
	}

	#[test]
	fn unknown_encoding_is_rejected() {
		let result = LegacyFields::from_columns(
			Some("c".into()),
			Some("i".into()),
			Some("t".into()),
			Some("latin1".into()),
			KeyEncoding::Base64,
		);
		assert!(result.is_err());
	}

	#[test]
	fn tenant_key_roundtrip() {
		let root = both_keys();
		let tenant_key_text = BASE64.encode([9u8; 32]);
		let stored = root.encrypt(tenant_key_text.as_bytes()).unwrap();

		let tenant_key = parse_tenant_legacy_key(&root.decrypt(&stored).unwrap()).unwrap();
		let field = encrypt_legacy(&tenant_key, KeyEncoding::Base64, b"password").unwrap();
		assert_eq!(decrypt_legacy(&tenant_key, &field).unwrap().as_slice(), b"password");
	}
}
