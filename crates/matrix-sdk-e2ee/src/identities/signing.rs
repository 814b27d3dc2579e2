// Copyright 2021 The Matrix.org Foundation C.I.C.
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

use std::fmt;

use ruma::UserId;
use serde_json::Value;
use vodozemac::{Ed25519PublicKey, Ed25519SecretKey, Ed25519Signature};

use crate::{
    error::SignatureError,
    types::{ed25519_key_id, CrossSigningKey, DeviceKeys, KeyUsage},
    utilities::canonical_json_for_signing,
};

/// A private cross-signing key.
///
/// The key is only held for the duration of a signing operation.
pub(crate) struct Signing {
    inner: Ed25519SecretKey,
    public_key: Ed25519PublicKey,
}

impl fmt::Debug for Signing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signing").field("public_key", &self.public_key.to_base64()).finish()
    }
}

impl Signing {
    pub fn new() -> Self {
        Self::from_secret_key(Ed25519SecretKey::new())
    }

    pub fn from_secret_key(inner: Ed25519SecretKey) -> Self {
        let public_key = inner.public_key();
        Self { inner, public_key }
    }

    pub fn from_base64(key: &str) -> Result<Self, vodozemac::KeyError> {
        Ok(Self::from_secret_key(Ed25519SecretKey::from_base64(key)?))
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        self.public_key
    }

    pub fn to_base64(&self) -> String {
        self.inner.to_base64()
    }

    pub fn into_secret_key(self) -> Ed25519SecretKey {
        self.inner
    }

    /// The `ed25519:<public key>` id under which this key signs.
    pub fn key_id(&self) -> String {
        ed25519_key_id(&self.public_key.to_base64())
    }

    pub fn sign(&self, message: &str) -> Ed25519Signature {
        self.inner.sign(message.as_bytes())
    }

    pub fn sign_json(&self, json: &Value) -> Result<Ed25519Signature, SignatureError> {
        let canonical = canonical_json_for_signing(json)?;
        Ok(self.sign(&canonical))
    }

    /// Create the public cross-signing key object of this key.
    pub fn cross_signing_key(&self, user_id: &UserId, usage: KeyUsage) -> CrossSigningKey {
        CrossSigningKey::new(user_id.to_owned(), usage, self.public_key)
    }

    /// Add our signature, as the given user, to a cross-signing key.
    pub fn sign_cross_signing_key(
        &self,
        signer: &UserId,
        key: &mut CrossSigningKey,
    ) -> Result<(), SignatureError> {
        let signature = self.sign_json(&key.to_json()?)?;
        key.signatures.add_signature(signer.to_owned(), self.key_id(), signature);

        Ok(())
    }

    /// Add our signature, as the given user, to the keys of a device.
    pub fn sign_device(&self, signer: &UserId, device: &mut DeviceKeys) -> Result<(), SignatureError> {
        let signature = self.sign_json(&device.to_json()?)?;
        device.signatures.add_signature(signer.to_owned(), self.key_id(), signature);

        Ok(())
    }
}
