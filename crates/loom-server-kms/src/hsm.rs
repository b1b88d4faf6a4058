// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Hardware security module capability.
//!
//! The core never talks to a vendor library. Deployments that keep the root
//! key in an HSM supply an [`HsmAdapter`] implementation bound to the
//! configured slot and key label.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::encryption::KeyMaterial;
use crate::error::KmsResult;

/// Wrap/unwrap primitive backed by a key that never leaves the device.
///
/// Implementations must tolerate concurrent calls.
#[async_trait]
pub trait HsmAdapter: Send + Sync {
	/// Wrap a data key under the HSM-held root key.
	async fn wrap_key(&self, key: &KeyMaterial) -> KmsResult<Vec<u8>>;

	/// Unwrap a data key previously returned by [`HsmAdapter::wrap_key`].
	async fn unwrap_key(&self, wrapped: &[u8]) -> KmsResult<KeyMaterial>;

	/// Whether the device is reachable and the root key is usable.
	async fn is_healthy(&self) -> bool;
}

/// Parameters identifying the HSM-held root key.
#[derive(Clone)]
pub struct HsmDescriptor {
	pub library_path: PathBuf,
	pub pin: Zeroizing<String>,
	pub key_label: String,
	pub slot: u32,
}

impl fmt::Debug for HsmDescriptor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("HsmDescriptor")
			.field("library_path", &self.library_path)
			.field("pin", &"[REDACTED]")
			.field("key_label", &self.key_label)
			.field("slot", &self.slot)
			.finish()
	}
}
