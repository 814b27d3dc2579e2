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

//! Types for the encryption related events.
//!
//! Events are exchanged with the host as plain JSON, these types are the
//! parsed contents this crate works with.

use std::{collections::BTreeMap, fmt};

use ruma::{
    MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedTransactionId,
    OwnedUserId,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::{algorithms::EventEncryptionAlgorithm, error::EventError};

/// A to-device event as it arrives from the sync loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceEvent {
    /// The sender of the event.
    pub sender: OwnedUserId,
    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the event.
    pub content: Value,
}

impl ToDeviceEvent {
    /// Create a new to-device event.
    pub fn new(sender: OwnedUserId, event_type: impl Into<String>, content: Value) -> Self {
        Self { sender, event_type: event_type.into(), content }
    }
}

/// An encrypted room event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedRoomEvent {
    /// The sender of the event.
    pub sender: OwnedUserId,
    /// The unique id of the event.
    pub event_id: OwnedEventId,
    /// The room the event was sent in.
    pub room_id: OwnedRoomId,
    /// The timestamp the server received the event at.
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,
    /// The `m.room.encrypted` content.
    pub content: Value,
}

/// A room event in the clear, either sent unencrypted or already decrypted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomEvent {
    /// The sender of the event.
    pub sender: OwnedUserId,
    /// The unique id of the event.
    pub event_id: OwnedEventId,
    /// The room the event was sent in.
    pub room_id: OwnedRoomId,
    /// The timestamp the server received the event at.
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,
    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the event.
    pub content: Value,
}

/// The ciphertext for a single device inside an Olm encrypted event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmCiphertext {
    /// The Olm message type, 0 for pre-key messages and 1 for normal
    /// messages.
    #[serde(rename = "type")]
    pub message_type: usize,
    /// The base64 encoded ciphertext.
    pub body: String,
}

/// The content of an `m.olm.v1.curve25519-aes-sha2` encrypted event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmV1Content {
    /// The Curve25519 key of the sender.
    pub sender_key: String,
    /// The ciphertexts, keyed by the Curve25519 key of the recipient device.
    pub ciphertext: BTreeMap<String, OlmCiphertext>,
}

/// The content of an `m.megolm.v1.aes-sha2` encrypted event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MegolmV1Content {
    /// The base64 encoded Megolm message.
    pub ciphertext: String,
    /// The id of the Megolm session.
    pub session_id: String,
    /// The Curve25519 key of the sender, deprecated but still sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_key: Option<String>,
    /// The device id of the sender, deprecated but still sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<OwnedDeviceId>,
}

/// The content of an `m.room.encrypted` event, dispatched by its algorithm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncryptedContent {
    /// Olm encrypted to-device content.
    OlmV1(OlmV1Content),
    /// Megolm encrypted room content.
    MegolmV1(MegolmV1Content),
}

impl EncryptedContent {
    /// Parse the content, failing with [`EventError::UnsupportedAlgorithm`]
    /// for algorithms we can't decrypt.
    pub fn from_json(value: &Value) -> Result<Self, EventError> {
        let algorithm: EventEncryptionAlgorithm = value
            .get("algorithm")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::MissingField("algorithm".to_owned()))?
            .into();

        let malformed = |e: serde_json::Error| EventError::MissingField(e.to_string());

        match algorithm {
            EventEncryptionAlgorithm::OlmV1Curve25519AesSha2 => {
                Ok(Self::OlmV1(serde_json::from_value(value.clone()).map_err(malformed)?))
            }
            EventEncryptionAlgorithm::MegolmV1AesSha2 => {
                Ok(Self::MegolmV1(serde_json::from_value(value.clone()).map_err(malformed)?))
            }
            other => Err(EventError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    /// The algorithm of the content.
    pub fn algorithm(&self) -> EventEncryptionAlgorithm {
        match self {
            EncryptedContent::OlmV1(_) => EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            EncryptedContent::MegolmV1(_) => EventEncryptionAlgorithm::MegolmV1AesSha2,
        }
    }

    /// Serialize the content back to JSON, including the algorithm.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        let mut value = match self {
            EncryptedContent::OlmV1(c) => serde_json::to_value(c)?,
            EncryptedContent::MegolmV1(c) => serde_json::to_value(c)?,
        };

        if let Some(object) = value.as_object_mut() {
            object.insert("algorithm".to_owned(), Value::String(self.algorithm().to_string()));
        }

        Ok(value)
    }
}

/// The keys that the sender of an Olm payload claims to own.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmPayloadKeys {
    /// The Ed25519 key, base64 encoded.
    pub ed25519: String,
}

/// The plaintext of an Olm encrypted event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OlmPayload {
    /// The sender of the event.
    pub sender: OwnedUserId,
    /// The device that sent the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_device: Option<OwnedDeviceId>,
    /// The keys of the sending device.
    pub keys: OlmPayloadKeys,
    /// The intended recipient.
    pub recipient: OwnedUserId,
    /// The keys of the intended recipient device.
    pub recipient_keys: OlmPayloadKeys,
    /// The type of the inner event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the inner event.
    pub content: Value,
}

/// The content of an `m.room_key` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// The algorithm of the room key.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room the key belongs to.
    pub room_id: OwnedRoomId,
    /// The id of the session.
    pub session_id: String,
    /// The base64 encoded session key.
    pub session_key: String,
    /// Can the key be shared with users invited later on.
    #[serde(default, rename = "org.matrix.msc3061.shared_history")]
    pub shared_history: bool,
}

/// The content of an `m.forwarded_room_key` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedRoomKeyContent {
    /// The algorithm of the room key.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room the key belongs to.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The id of the session.
    pub session_id: String,
    /// The exported session key.
    pub session_key: String,
    /// The Ed25519 key of the device that created the session.
    pub sender_claimed_ed25519_key: String,
    /// The chain of Curve25519 keys the key was forwarded through.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
    /// Can the key be shared with users invited later on.
    #[serde(default, rename = "org.matrix.msc3061.shared_history")]
    pub shared_history: bool,
}

/// A code why a room key was withheld.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum WithheldCode {
    /// The user or device was blacklisted.
    Blacklisted,
    /// The user or device was not verified.
    Unverified,
    /// The user or device is not allowed to have the key.
    Unauthorised,
    /// The sender was unable to find the requested key.
    Unavailable,
    /// No Olm session could be established with the device.
    NoOlm,
    /// A code we don't know about.
    Other(String),
}

impl WithheldCode {
    /// The string form of the code.
    pub fn as_str(&self) -> &str {
        match self {
            WithheldCode::Blacklisted => "m.blacklisted",
            WithheldCode::Unverified => "m.unverified",
            WithheldCode::Unauthorised => "m.unauthorised",
            WithheldCode::Unavailable => "m.unavailable",
            WithheldCode::NoOlm => "m.no_olm",
            WithheldCode::Other(code) => code,
        }
    }
}

impl From<&str> for WithheldCode {
    fn from(value: &str) -> Self {
        match value {
            "m.blacklisted" => Self::Blacklisted,
            "m.unverified" => Self::Unverified,
            "m.unauthorised" => Self::Unauthorised,
            "m.unavailable" => Self::Unavailable,
            "m.no_olm" => Self::NoOlm,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for WithheldCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for WithheldCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for WithheldCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.as_str().into())
    }
}

/// The content of an `m.room_key.withheld` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyWithheldContent {
    /// The algorithm of the withheld key.
    pub algorithm: EventEncryptionAlgorithm,
    /// Why the key was withheld.
    pub code: WithheldCode,
    /// A human readable reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The room of the withheld session, missing for `m.no_olm`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<OwnedRoomId>,
    /// The id of the withheld session, missing for `m.no_olm`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// The Curve25519 key of the session creator.
    pub sender_key: String,
}

/// The action of a key or secret request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestAction {
    /// Request a key or secret.
    Request,
    /// Cancel an earlier request.
    RequestCancellation,
}

/// Which room key is requested.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestedKeyInfo {
    /// The algorithm of the requested key.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room of the requested key.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the session creator.
    pub sender_key: String,
    /// The id of the session.
    pub session_id: String,
}

/// The content of an `m.room_key_request` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyRequestContent {
    /// Request or cancel.
    pub action: RequestAction,
    /// The requested key, missing for cancellations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestedKeyInfo>,
    /// The id of the request.
    pub request_id: OwnedTransactionId,
    /// The device that sent the request.
    pub requesting_device_id: OwnedDeviceId,
}

/// The content of an `m.secret.request` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRequestContent {
    /// The name of the requested secret, missing for cancellations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Request or cancel.
    pub action: RequestAction,
    /// The device that sent the request.
    pub requesting_device_id: OwnedDeviceId,
    /// The id of the request.
    pub request_id: String,
}

/// The content of an `m.secret.send` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSendContent {
    /// The id of the request this answers.
    pub request_id: String,
    /// The secret.
    pub secret: String,
}
