// Copyright 2023 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Hooks the application provides to hand private key material in and out of
//! the crypto machinery.

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use ruma::{OwnedDeviceId, OwnedUserId};
use vodozemac::Ed25519SecretKey;
use zeroize::Zeroizing;

use crate::{
    error::{CrossSigningError, SecretStorageError},
    identities::DeviceTrustLevel,
    secret_storage::SecretStorageKeyDescription,
    types::KeyUsage,
};

/// An incoming request for one of our secrets.
#[derive(Clone, Debug)]
pub struct SecretRequestInfo {
    /// The user that requested the secret, always our own user.
    pub user_id: OwnedUserId,
    /// The device that requested the secret.
    pub device_id: OwnedDeviceId,
    /// The id of the request.
    pub request_id: String,
    /// The name of the requested secret.
    pub name: String,
    /// How much we trust the requesting device.
    pub device_trust: DeviceTrustLevel,
}

/// Application callbacks.
///
/// Every callback is optional, the default implementations report that the
/// callback isn't configured.
#[async_trait]
pub trait CryptoCallbacks: fmt::Debug + Send + Sync {
    /// Get the private part of our cross-signing key with the given usage.
    ///
    /// `public_key` is the base64 public key the private key has to match.
    async fn get_cross_signing_key(
        &self,
        usage: KeyUsage,
        public_key: &str,
    ) -> Option<Ed25519SecretKey> {
        let _ = (usage, public_key);
        None
    }

    /// Persist freshly created private cross-signing keys.
    ///
    /// The keys are not kept by the crypto machinery after this call.
    async fn save_cross_signing_keys(
        &self,
        keys: BTreeMap<KeyUsage, Ed25519SecretKey>,
    ) -> Result<(), CrossSigningError> {
        let _ = keys;
        Err(CrossSigningError::MissingCallback("save_cross_signing_keys"))
    }

    /// Get one of the given secret storage keys to decrypt the named secret.
    ///
    /// Returns the id of the chosen key and the key itself.
    async fn get_secret_storage_key(
        &self,
        key_ids: &[String],
        secret_name: &str,
    ) -> Result<Option<(String, Zeroizing<[u8; 32]>)>, SecretStorageError> {
        let _ = (key_ids, secret_name);
        Err(SecretStorageError::MissingCallback)
    }

    /// Called once a secret storage key passed its key check, so the
    /// application can cache it.
    async fn cache_secret_storage_key(
        &self,
        key_id: &str,
        description: &SecretStorageKeyDescription,
        key: &[u8; 32],
    ) {
        let _ = (key_id, description, key);
    }

    /// Decide whether an incoming secret request should be answered.
    ///
    /// Returns the secret to share, `None` to ignore the request.
    async fn on_secret_request(&self, request: SecretRequestInfo) -> Option<String> {
        let _ = request;
        None
    }
}

/// Callbacks that don't do anything.
#[derive(Debug, Default)]
pub(crate) struct NoCallbacks;

impl CryptoCallbacks for NoCallbacks {}
