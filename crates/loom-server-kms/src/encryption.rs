// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! AES-256-GCM primitives shared by key wrapping and payload encryption.

use std::fmt;

use aes_gcm::{
	aead::{Aead, KeyInit, OsRng, Payload},
	Aes256Gcm, Key, Nonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{KmsError, KmsResult};

/// Size of encryption keys in bytes (256 bits for AES-256).
pub const KEY_SIZE: usize = 32;

/// Size of AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Raw symmetric key held in memory that is wiped on drop.
pub struct KeyMaterial(Zeroizing<[u8; KEY_SIZE]>);

impl KeyMaterial {
	/// Generate a fresh random key.
	pub fn generate() -> Self {
		let mut key = Zeroizing::new([0u8; KEY_SIZE]);
		OsRng.fill_bytes(key.as_mut());
		Self(key)
	}

	pub fn new(bytes: Zeroizing<[u8; KEY_SIZE]>) -> Self {
		Self(bytes)
	}

	/// Copy a key out of a slice, checking its length.
	pub fn from_slice(bytes: &[u8]) -> KmsResult<Self> {
		if bytes.len() != KEY_SIZE {
			return Err(KmsError::InvalidKeySize {
				expected: KEY_SIZE,
				actual: bytes.len(),
			});
		}
		let mut key = Zeroizing::new([0u8; KEY_SIZE]);
		key.copy_from_slice(bytes);
		Ok(Self(key))
	}

	pub(crate) fn expose(&self) -> &[u8; KEY_SIZE] {
		&self.0
	}

	pub(crate) fn duplicate(&self) -> Self {
		Self(Zeroizing::new(*self.0))
	}
}

impl fmt::Debug for KeyMaterial {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("KeyMaterial([REDACTED])")
	}
}

/// Output of a single AES-GCM seal, with the tag split from the ciphertext.
#[derive(Debug, Clone)]
pub struct Sealed {
	pub nonce: [u8; NONCE_SIZE],
	pub ciphertext: Vec<u8>,
	pub tag: [u8; TAG_SIZE],
}

/// Generate a random nonce.
///
/// 96-bit random nonces from OsRng. The same (key, nonce) pair must never be
/// reused; collision probability stays negligible below 2^32 seals per key.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
	let mut nonce = [0u8; NONCE_SIZE];
	OsRng.fill_bytes(&mut nonce);
	nonce
}

/// Encrypt `plaintext` under `key`, authenticating `aad` alongside it.
pub fn seal(key: &KeyMaterial, plaintext: &[u8], aad: &[u8]) -> KmsResult<Sealed> {
	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.expose()));
	let nonce = generate_nonce();

	let mut ciphertext = cipher
		.encrypt(
			Nonce::from_slice(&nonce),
			Payload {
				msg: plaintext,
				aad,
			},
		)
		.map_err(|e| KmsError::Encryption(format!("seal failed: {e}")))?;

	let tag_start = ciphertext.len() - TAG_SIZE;
	let mut tag = [0u8; TAG_SIZE];
	tag.copy_from_slice(&ciphertext[tag_start..]);
	ciphertext.truncate(tag_start);

	Ok(Sealed {
		nonce,
		ciphertext,
		tag,
	})
}

/// Decrypt a [`Sealed`] value. Any key, nonce, tag or `aad` mismatch is a
/// [`KmsError::Decryption`].
pub fn open(key: &KeyMaterial, sealed: &Sealed, aad: &[u8]) -> KmsResult<Zeroizing<Vec<u8>>> {
	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.expose()));

	let mut combined = Vec::with_capacity(sealed.ciphertext.len() + TAG_SIZE);
	combined.extend_from_slice(&sealed.ciphertext);
	combined.extend_from_slice(&sealed.tag);

	let plaintext = cipher
		.decrypt(
			Nonce::from_slice(&sealed.nonce),
			Payload {
				msg: &combined,
				aad,
			},
		)
		.map_err(|e| KmsError::Decryption(format!("authentication failed: {e}")))?;

	Ok(Zeroizing::new(plaintext))
}

/// Wrap a DEK under a KEK. Output layout is `nonce || ciphertext || tag`.
pub fn wrap_key(kek: &KeyMaterial, dek: &KeyMaterial, aad: &[u8]) -> KmsResult<Vec<u8>> {
	let sealed = seal(kek, dek.expose(), aad)?;
	let mut out = Vec::with_capacity(NONCE_SIZE + KEY_SIZE + TAG_SIZE);
	out.extend_from_slice(&sealed.nonce);
	out.extend_from_slice(&sealed.ciphertext);
	out.extend_from_slice(&sealed.tag);
	Ok(out)
}

/// Reverse of [`wrap_key`].
pub fn unwrap_key(kek: &KeyMaterial, wrapped: &[u8], aad: &[u8]) -> KmsResult<KeyMaterial> {
	if wrapped.len() != NONCE_SIZE + KEY_SIZE + TAG_SIZE {
		return Err(KmsError::CorruptedData(format!(
			"wrapped key must be {} bytes, got {}",
			NONCE_SIZE + KEY_SIZE + TAG_SIZE,
			wrapped.len()
		)));
	}

	let mut nonce = [0u8; NONCE_SIZE];
	nonce.copy_from_slice(&wrapped[..NONCE_SIZE]);
	let mut tag = [0u8; TAG_SIZE];
	tag.copy_from_slice(&wrapped[NONCE_SIZE + KEY_SIZE..]);
	let sealed = Sealed {
		nonce,
		ciphertext: wrapped[NONCE_SIZE..NONCE_SIZE + KEY_SIZE].to_vec(),
		tag,
	};

	let plaintext = open(kek, &sealed, aad)?;
	KeyMaterial::from_slice(&plaintext)
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn key_generation_produces_unique_keys() {
		let key1 = KeyMaterial::generate();
		let key2 = KeyMaterial::generate();
		assert_ne!(key1.expose(), key2.expose());
	}

	#[test]
	fn key_material_debug_is_redacted() {
		let key = KeyMaterial::new(Zeroizing::new([7u8; KEY_SIZE]));
		assert_eq!(format!("{key:?}"), "KeyMaterial([REDACTED])");
	}

	#[test]
	fn from_slice_checks_length() {
		let err = KeyMaterial::from_slice(&[0u8; 16]).unwrap_err();
		assert!(matches!(
			err,
			KmsError::InvalidKeySize {
				expected: 32,
				actual: 16
			}
		));
	}

	#[test]
	fn wrap_roundtrip() {
		let kek = KeyMaterial::generate();
		let dek = KeyMaterial::generate();

		let wrapped = wrap_key(&kek, &dek, b"org_1").unwrap();
		let unwrapped = unwrap_key(&kek, &wrapped, b"org_1").unwrap();

		assert_eq!(dek.expose(), unwrapped.expose());
	}

	#[test]
	fn unwrap_with_other_aad_fails() {
		let kek = KeyMaterial::generate();
		let dek = KeyMaterial::generate();

		let wrapped = wrap_key(&kek, &dek, b"org_1").unwrap();
		let result = unwrap_key(&kek, &wrapped, b"org_2");

		assert!(matches!(result, Err(KmsError::Decryption(_))));
	}

	#[test]
	fn wrong_key_fails_decryption() {
		let key1 = KeyMaterial::generate();
		let key2 = KeyMaterial::generate();

		let sealed = seal(&key1, b"secret", b"").unwrap();
		assert!(open(&key2, &sealed, b"").is_err());
	}

	#[test]
	fn tampered_tag_fails() {
		let key = KeyMaterial::generate();
		let mut sealed = seal(&key, b"secret", b"").unwrap();
		sealed.tag[0] ^= 0xFF;
		assert!(matches!(open(&key, &sealed, b""), Err(KmsError::Decryption(_))));
	}

	#[test]
	fn empty_plaintext_roundtrips() {
		let key = KeyMaterial::generate();
		let sealed = seal(&key, b"", b"aad").unwrap();
		assert!(sealed.ciphertext.is_empty());
		assert!(open(&key, &sealed, b"aad").unwrap().is_empty());
	}

	proptest! {
		#[test]
		fn seal_open_roundtrip(plaintext in prop::collection::vec(any::<u8>(), 0..4096),
			aad in prop::collection::vec(any::<u8>(), 0..64)) {
			let key = KeyMaterial::generate();
			let sealed = seal(&key, &plaintext, &aad).unwrap();
			prop_assert_eq!(sealed.ciphertext.len(), plaintext.len());
			let opened = open(&key, &sealed, &aad).unwrap();
			prop_assert_eq!(opened.as_slice(), plaintext.as_slice());
		}

		#[test]
		fn truncated_wrapped_key_is_rejected(len in 0usize..(NONCE_SIZE + KEY_SIZE + TAG_SIZE)) {
			let kek = KeyMaterial::generate();
			let result = unwrap_key(&kek, &vec![0u8; len], b"");
			prop_assert!(matches!(result, Err(KmsError::CorruptedData(_))));
		}
	}
}
