// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Binary envelope produced by tenant cipher pairs.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! +---------+-----------+-------------+--------+------------+--------+
//! | version | algorithm | key_version |   iv   | ciphertext |  tag   |
//! |   u8    |    u8     |     u32     | 12 B   |    n B     |  16 B  |
//! +---------+-----------+-------------+--------+------------+--------+
//! ```
//!
//! The six header bytes together with the tenant binding form the AEAD
//! associated data, so an envelope only opens for the tenant, key class and
//! key version it was sealed for.

use crate::encryption::{Sealed, NONCE_SIZE, TAG_SIZE};
use crate::error::{KmsError, KmsResult};
use crate::types::TenantKey;

/// Current envelope format version.
pub const ENVELOPE_FORMAT_VERSION: u8 = 1;

const HEADER_SIZE: usize = 6;

/// Smallest possible envelope: header, IV and tag around an empty plaintext.
pub const MIN_ENVELOPE_SIZE: usize = HEADER_SIZE + NONCE_SIZE + TAG_SIZE;

/// Payload cipher recorded in an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Algorithm {
	Aes256Gcm = 1,
}

impl TryFrom<u8> for Algorithm {
	type Error = KmsError;

	fn try_from(value: u8) -> Result<Self, Self::Error> {
		match value {
			1 => Ok(Algorithm::Aes256Gcm),
			other => Err(KmsError::Decryption(format!("unsupported envelope algorithm {other}"))),
		}
	}
}

/// A parsed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherEnvelope {
	pub algorithm: Algorithm,
	pub key_version: u32,
	pub iv: [u8; NONCE_SIZE],
	pub ciphertext: Vec<u8>,
	pub tag: [u8; TAG_SIZE],
}

impl CipherEnvelope {
	pub(crate) fn from_sealed(key_version: u32, sealed: Sealed) -> Self {
		Self {
			algorithm: Algorithm::Aes256Gcm,
			key_version,
			iv: sealed.nonce,
			ciphertext: sealed.ciphertext,
			tag: sealed.tag,
		}
	}

	pub(crate) fn to_sealed(&self) -> Sealed {
		Sealed {
			nonce: self.iv,
			ciphertext: self.ciphertext.clone(),
			tag: self.tag,
		}
	}

	fn header(algorithm: Algorithm, key_version: u32) -> [u8; HEADER_SIZE] {
		let v = key_version.to_be_bytes();
		[ENVELOPE_FORMAT_VERSION, algorithm as u8, v[0], v[1], v[2], v[3]]
	}

	/// Associated data for sealing or opening under `tenant`.
	pub(crate) fn associated_data(algorithm: Algorithm, key_version: u32, tenant: &TenantKey) -> Vec<u8> {
		let mut aad = Self::header(algorithm, key_version).to_vec();
		aad.extend_from_slice(&tenant.binding());
		aad
	}

	pub fn to_bytes(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(MIN_ENVELOPE_SIZE + self.ciphertext.len());
		out.extend_from_slice(&Self::header(self.algorithm, self.key_version));
		out.extend_from_slice(&self.iv);
		out.extend_from_slice(&self.ciphertext);
		out.extend_from_slice(&self.tag);
		out
	}

	/// Parse an envelope. Malformed input is reported as a decryption
	/// failure since it can never authenticate.
	pub fn from_bytes(bytes: &[u8]) -> KmsResult<Self> {
		if bytes.len() < MIN_ENVELOPE_SIZE {
			return Err(KmsError::Decryption(format!(
				"envelope too short: {} bytes",
				bytes.len()
			)));
		}
		if bytes[0] != ENVELOPE_FORMAT_VERSION {
			return Err(KmsError::Decryption(format!(
				"unsupported envelope format version {}",
				bytes[0]
			)));
		}
		let algorithm = Algorithm::try_from(bytes[1])?;
		let key_version = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);

		let mut iv = [0u8; NONCE_SIZE];
		iv.copy_from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + NONCE_SIZE]);

		let tag_start = bytes.len() - TAG_SIZE;
		let mut tag = [0u8; TAG_SIZE];
		tag.copy_from_slice(&bytes[tag_start..]);

		Ok(Self {
			algorithm,
			key_version,
			iv,
			ciphertext: bytes[HEADER_SIZE + NONCE_SIZE..tag_start].to_vec(),
			tag,
		})
	}
}
