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

//! Module containing the types modeling Matrix keys and the encryption
//! related events.
//!
//! The key types keep their JSON form lossless, signatures made over them
//! stay valid after a serialization cycle.

pub mod backup;
mod cross_signing_key;
mod device_keys;
pub mod events;
mod one_time_keys;

use std::collections::BTreeMap;

pub use cross_signing_key::*;
pub use device_keys::*;
pub use one_time_keys::*;
use ruma::{OwnedUserId, UserId};
use serde::{Deserialize, Serialize, Serializer};
use vodozemac::Ed25519Signature;

pub use crate::ciphers::AesHmacSha2EncryptedData;

/// An enum over all the signature types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signature {
    /// A Ed25519 digital signature.
    Ed25519(Ed25519Signature),
    /// An unknown digital signature as a base64 encoded string.
    Other(String),
    /// An invalid signature that could not be decoded, left unmodified as a
    /// string.
    Invalid(String),
}

impl Signature {
    /// Get the Ed25519 signature, if this is one.
    pub fn ed25519(&self) -> Option<Ed25519Signature> {
        if let Self::Ed25519(signature) = &self {
            Some(*signature)
        } else {
            None
        }
    }

    /// Convert the signature to a base64 encoded string.
    pub fn to_base64(&self) -> String {
        match self {
            Signature::Ed25519(s) => s.to_base64(),
            Signature::Other(s) => s.to_owned(),
            Signature::Invalid(s) => s.to_owned(),
        }
    }
}

impl From<Ed25519Signature> for Signature {
    fn from(signature: Ed25519Signature) -> Self {
        Self::Ed25519(signature)
    }
}

/// Signatures for a signed object.
///
/// Key ids are kept in their `algorithm:identifier` string form, the
/// identifier is a device id for device keys and the unpadded base64 public
/// key for cross-signing keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signatures(BTreeMap<OwnedUserId, BTreeMap<String, Signature>>);

impl Signatures {
    /// Create a new, empty, signatures collection.
    pub fn new() -> Self {
        Signatures(Default::default())
    }

    /// Add the given signature from the given signer and the given key_id to
    /// the collection.
    pub fn add_signature(
        &mut self,
        signer: OwnedUserId,
        key_id: String,
        signature: Ed25519Signature,
    ) -> Option<Signature> {
        self.0.entry(signer).or_default().insert(key_id, signature.into())
    }

    /// Try to find an Ed25519 signature from the given signer with the given
    /// key id.
    pub fn get_signature(&self, signer: &UserId, key_id: &str) -> Option<Ed25519Signature> {
        self.get(signer)?.get(key_id)?.ed25519()
    }

    /// Get the map of signatures that belong to the given user.
    pub fn get(&self, signer: &UserId) -> Option<&BTreeMap<String, Signature>> {
        self.0.get(signer)
    }

    /// Merge the signatures of another collection into this one.
    pub fn extend(&mut self, other: Signatures) {
        for (user_id, signatures) in other {
            self.0.entry(user_id).or_default().extend(signatures);
        }
    }

    /// Do we hold any signatures or is our collection completely empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// How many signatures do we currently hold.
    pub fn signature_count(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }
}

impl IntoIterator for Signatures {
    type Item = (OwnedUserId, BTreeMap<String, Signature>);

    type IntoIter = std::collections::btree_map::IntoIter<OwnedUserId, BTreeMap<String, Signature>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'de> Deserialize<'de> for Signatures {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let map: BTreeMap<OwnedUserId, BTreeMap<String, String>> =
            Deserialize::deserialize(deserializer)?;

        let map = map
            .into_iter()
            .map(|(user, signatures)| {
                let signatures = signatures
                    .into_iter()
                    .map(|(key_id, s)| {
                        let signature = if key_id.starts_with("ed25519:") {
                            Ed25519Signature::from_base64(&s)
                                .map(Signature::from)
                                .unwrap_or_else(|_| Signature::Invalid(s))
                        } else {
                            Signature::Other(s)
                        };

                        (key_id, signature)
                    })
                    .collect();

                (user, signatures)
            })
            .collect();

        Ok(Signatures(map))
    }
}

impl Serialize for Signatures {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let signatures: BTreeMap<&OwnedUserId, BTreeMap<&String, String>> = self
            .0
            .iter()
            .map(|(u, m)| (u, m.iter().map(|(d, s)| (d, s.to_base64())).collect()))
            .collect();

        Serialize::serialize(&signatures, serializer)
    }
}

/// Build the `ed25519:<identifier>` key id.
pub fn ed25519_key_id(identifier: &str) -> String {
    format!("ed25519:{identifier}")
}

/// Build the `curve25519:<identifier>` key id.
pub fn curve25519_key_id(identifier: &str) -> String {
    format!("curve25519:{identifier}")
}
