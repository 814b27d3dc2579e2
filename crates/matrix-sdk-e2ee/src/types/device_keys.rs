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

use ruma::{OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use super::{curve25519_key_id, ed25519_key_id, Signatures};
use crate::{algorithms::EventEncryptionAlgorithm, error::SignatureError, utilities::verify_json};

/// Identity keys for a device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// The ID of the user the device belongs to.
    ///
    /// Must match the user ID used when logging in.
    pub user_id: OwnedUserId,

    /// The ID of the device these keys belong to.
    ///
    /// Must match the device ID used when logging in.
    pub device_id: OwnedDeviceId,

    /// The encryption algorithms supported by this device.
    pub algorithms: Vec<EventEncryptionAlgorithm>,

    /// Public identity keys, `algorithm:device_id` to base64 key.
    pub keys: BTreeMap<String, String>,

    /// Signatures for the device key object.
    #[serde(default)]
    pub signatures: Signatures,

    /// Additional data added to the device key information by intermediate
    /// servers, and not covered by the signatures.
    #[serde(default, skip_serializing_if = "UnsignedDeviceInfo::is_empty")]
    pub unsigned: UnsignedDeviceInfo,
}

impl DeviceKeys {
    /// Create a new, unsigned, `DeviceKeys` object.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        algorithms: Vec<EventEncryptionAlgorithm>,
        curve25519: Curve25519PublicKey,
        ed25519: Ed25519PublicKey,
    ) -> Self {
        let keys = BTreeMap::from([
            (curve25519_key_id(device_id.as_str()), curve25519.to_base64()),
            (ed25519_key_id(device_id.as_str()), ed25519.to_base64()),
        ]);

        Self {
            user_id,
            device_id,
            algorithms,
            keys,
            signatures: Signatures::new(),
            unsigned: Default::default(),
        }
    }

    /// Get the Ed25519 fingerprint key of the device, `None` if it's missing
    /// or malformed.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.keys
            .get(&ed25519_key_id(self.device_id.as_str()))
            .and_then(|k| Ed25519PublicKey::from_base64(k).ok())
    }

    /// Get the Curve25519 identity key of the device, `None` if it's missing
    /// or malformed.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.keys
            .get(&curve25519_key_id(self.device_id.as_str()))
            .and_then(|k| Curve25519PublicKey::from_base64(k).ok())
    }

    /// Serialize the keys into a JSON value.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Check the self-signature of the device keys.
    pub fn check_self_signature(&self) -> Result<(), SignatureError> {
        let key = self.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;

        verify_json(
            &self.user_id,
            &ed25519_key_id(self.device_id.as_str()),
            &key,
            &self.to_json()?,
        )
    }
}

/// Additional data added to device key information by intermediate servers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedDeviceInfo {
    /// The display name which the user set on the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
}

impl UnsignedDeviceInfo {
    fn is_empty(&self) -> bool {
        self.device_display_name.is_none()
    }
}
