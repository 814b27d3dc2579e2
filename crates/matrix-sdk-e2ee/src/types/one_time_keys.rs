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

//! Module containing the signed one-time and fallback key type.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::Curve25519PublicKey;

use super::Signatures;

/// A key for the SignedCurve25519 algorithm
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedKey {
    /// The Curve25519 key that can be used to establish Olm sessions.
    pub key: String,

    /// Signatures for the key object.
    #[serde(default)]
    pub signatures: Signatures,

    /// Is the key considered to be a fallback key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<bool>,
}

impl SignedKey {
    /// Creates a new, unsigned, `SignedKey`.
    pub fn new(key: Curve25519PublicKey) -> Self {
        Self { key: key.to_base64(), signatures: Signatures::new(), fallback: None }
    }

    /// Creates a new, unsigned, fallback `SignedKey`.
    pub fn new_fallback(key: Curve25519PublicKey) -> Self {
        Self { fallback: Some(true), ..Self::new(key) }
    }

    /// The Curve25519 key, `None` if it's malformed.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        Curve25519PublicKey::from_base64(&self.key).ok()
    }

    /// Serialize the key into a JSON value.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
