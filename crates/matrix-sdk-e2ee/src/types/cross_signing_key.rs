// Copyright 2022 The Matrix.org Foundation C.I.C.
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

use std::collections::BTreeMap;

use ruma::OwnedUserId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::Ed25519PublicKey;

use super::{ed25519_key_id, Signatures};
use crate::{error::SignatureError, utilities::verify_json};

/// The usage of a cross-signing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    /// The master key, the root of a user's cross-signing identity.
    Master,
    /// The self-signing key, signs the devices of the user.
    SelfSigning,
    /// The user-signing key, signs the master keys of other users.
    UserSigning,
}

impl KeyUsage {
    /// The name of the secret under which the private part of the key is
    /// kept in secret storage.
    pub fn secret_name(&self) -> &'static str {
        match self {
            KeyUsage::Master => "m.cross_signing.master",
            KeyUsage::SelfSigning => "m.cross_signing.self_signing",
            KeyUsage::UserSigning => "m.cross_signing.user_signing",
        }
    }
}

/// A public cross-signing key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossSigningKey {
    /// The ID of the user the key belongs to.
    pub user_id: OwnedUserId,

    /// What the key is used for.
    pub usage: Vec<KeyUsage>,

    /// The public key, `ed25519:<public key>` to the base64 public key.
    pub keys: BTreeMap<String, String>,

    /// Signatures of the key.
    #[serde(default)]
    pub signatures: Signatures,
}

impl CrossSigningKey {
    /// Create a new, unsigned, cross-signing key.
    pub fn new(user_id: OwnedUserId, usage: KeyUsage, public_key: Ed25519PublicKey) -> Self {
        let public_key = public_key.to_base64();
        let keys = BTreeMap::from([(ed25519_key_id(&public_key), public_key)]);

        Self { user_id, usage: vec![usage], keys, signatures: Signatures::new() }
    }

    /// Get the first public key of the cross-signing key.
    ///
    /// Cross-signing keys contain exactly one key in practice.
    pub fn get_first_key(&self) -> Option<Ed25519PublicKey> {
        self.keys.values().next().and_then(|k| Ed25519PublicKey::from_base64(k).ok())
    }

    /// The base64 form of the public key, this doubles as the id of the key.
    pub fn public_key_base64(&self) -> Option<&str> {
        self.keys.values().next().map(String::as_str)
    }

    /// The `ed25519:<public key>` id under which the key signs objects.
    pub fn key_id(&self) -> Option<String> {
        self.public_key_base64().map(ed25519_key_id)
    }

    /// Does the key have the given usage.
    pub fn has_usage(&self, usage: KeyUsage) -> bool {
        self.usage.contains(&usage)
    }

    /// Serialize the key into a JSON value.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Check that this key carries a valid signature of the given signing
    /// key, made by the owner of this key.
    pub fn verify_signed_by(&self, signer: &CrossSigningKey) -> Result<(), SignatureError> {
        let public_key = signer.get_first_key().ok_or(SignatureError::MissingSigningKey)?;
        let key_id = signer.key_id().ok_or(SignatureError::MissingSigningKey)?;

        verify_json(&signer.user_id, &key_id, &public_key, &self.to_json()?)
    }
}

/// The public parts of a cross-signing identity, as uploaded and as returned
/// by a key query.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossSigningKeys {
    /// The master key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<CrossSigningKey>,
    /// The self-signing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_signing: Option<CrossSigningKey>,
    /// The user-signing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_signing: Option<CrossSigningKey>,
}

impl CrossSigningKeys {
    /// Are all the keys missing.
    pub fn is_empty(&self) -> bool {
        self.master.is_none() && self.self_signing.is_none() && self.user_signing.is_none()
    }
}
