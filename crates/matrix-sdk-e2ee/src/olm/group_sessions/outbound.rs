// Copyright 2020 The Matrix.org Foundation C.I.C.
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

use std::{collections::BTreeMap, fmt, time::Duration};

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, SecondsSinceUnixEpoch};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use vodozemac::{
    megolm::{GroupSession, GroupSessionPickle, SessionConfig, SessionKey},
    PickleError,
};

use crate::algorithms::EventEncryptionAlgorithm;

const ROTATION_PERIOD: Duration = Duration::from_millis(604_800_000);
const ROTATION_MESSAGES: u64 = 100;

/// Settings for an encrypted room.
///
/// This determines the algorithm and rotation periods of a group session.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct EncryptionSettings {
    /// The encryption algorithm that should be used in the room.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long the session should be used before changing it.
    #[serde(with = "crate::config::duration_ms")]
    pub rotation_period: Duration,
    /// How many messages should be sent before changing the session.
    pub rotation_period_msgs: u64,
    /// Should untrusted devices receive the room key, or should they be
    /// excluded from the conversation.
    #[serde(default)]
    pub only_allow_trusted_devices: bool,
    /// Are the room keys of the room marked as shareable with users that
    /// are invited later on.
    #[serde(default)]
    pub shared_history: bool,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
            only_allow_trusted_devices: false,
            shared_history: false,
        }
    }
}

/// Outbound group session.
///
/// Outbound group sessions are used to exchange room messages between a group
/// of participants. Outbound group sessions are used to encrypt the room
/// messages.
pub struct OutboundGroupSession {
    inner: Box<GroupSession>,
    session_id: String,
    room_id: OwnedRoomId,
    pub(crate) creation_time: SecondsSinceUnixEpoch,
    message_count: u64,
    settings: EncryptionSettings,
    shared_with: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, u32>>,
    invalidated: bool,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("creation_time", &self.creation_time)
            .field("message_count", &self.message_count)
            .finish()
    }
}

/// A pickled version of an `OutboundGroupSession`.
#[derive(Clone, Deserialize, Serialize)]
pub struct PickledOutboundGroupSession {
    /// The encrypted pickle of the session.
    pub pickle: String,
    /// The room id this session is used for.
    pub room_id: OwnedRoomId,
    /// The id of the session.
    pub session_id: String,
    /// The timestamp when this session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// The number of messages this session has already encrypted.
    pub message_count: u64,
    /// The settings this session adheres to.
    pub settings: EncryptionSettings,
    /// The devices that received the session key, with the message index
    /// they received.
    #[serde(default)]
    pub shared_with: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, u32>>,
    /// Has the session been invalidated.
    #[serde(default)]
    pub invalidated: bool,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for PickledOutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickledOutboundGroupSession")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl OutboundGroupSession {
    /// Create a new outbound group session for the given room.
    pub fn new(room_id: &RoomId, settings: EncryptionSettings) -> Self {
        let session = GroupSession::new(SessionConfig::version_1());

        Self {
            session_id: session.session_id(),
            inner: Box::new(session),
            room_id: room_id.to_owned(),
            creation_time: SecondsSinceUnixEpoch::now(),
            message_count: 0,
            settings,
            shared_with: BTreeMap::new(),
            invalidated: false,
        }
    }

    /// The unique id of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The room the session is used in.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The settings the session follows.
    pub fn settings(&self) -> &EncryptionSettings {
        &self.settings
    }

    /// The message index the next encrypted message will use.
    pub fn message_index(&self) -> u32 {
        self.inner.message_index()
    }

    /// The current session key, ratcheted to the current message index.
    pub fn session_key(&self) -> SessionKey {
        self.inner.session_key()
    }

    /// Mark the session as invalid, it will be rotated before the next
    /// message.
    pub fn invalidate_session(&mut self) {
        self.invalidated = true;
    }

    /// Has the session been invalidated.
    pub fn invalidated(&self) -> bool {
        self.invalidated
    }

    /// Remember that the session key was sent to the given device at the
    /// given message index.
    pub fn mark_shared_with(&mut self, user_id: OwnedUserId, device_id: OwnedDeviceId, index: u32) {
        self.shared_with.entry(user_id).or_default().insert(device_id, index);
    }

    /// The message index the given device received the session key at, if
    /// it received it at all.
    pub fn shared_with(&self, user_id: &ruma::UserId, device_id: &ruma::DeviceId) -> Option<u32> {
        self.shared_with.get(user_id)?.get(device_id).copied()
    }

    /// Check if the session has expired and if it should be rotated.
    ///
    /// A session will expire after some time or if enough messages have been
    /// encrypted using it.
    pub fn expired(&self) -> bool {
        let count = self.message_count;
        let rotation_period_msgs = self.settings.rotation_period_msgs.clamp(1, 10_000);

        let elapsed = SecondsSinceUnixEpoch::now()
            .get()
            .checked_sub(self.creation_time.get())
            .map(|s| Duration::from_secs(s.into()))
            .unwrap_or_default();

        // Rotation periods below an hour make no sense, and above a week are
        // clamped to a week.
        let rotation_period =
            self.settings.rotation_period.clamp(Duration::from_secs(3600), ROTATION_PERIOD);

        count >= rotation_period_msgs || elapsed >= rotation_period
    }

    /// Encrypt an event for the room of the session.
    ///
    /// Returns the base64 encoded Megolm message.
    pub fn encrypt(&mut self, event_type: &str, content: Value) -> Result<String, serde_json::Error> {
        let payload = json!({
            "type": event_type,
            "content": content,
            "room_id": self.room_id,
        });

        let plaintext = serde_json::to_string(&payload)?;
        let message = self.inner.encrypt(&plaintext);
        self.message_count += 1;

        debug!(
            session_id = self.session_id,
            message_count = self.message_count,
            "Encrypted a room event"
        );

        Ok(message.to_base64())
    }

    /// Store the group session as an encrypted pickle.
    pub fn pickle(&self, pickle_key: &[u8; 32]) -> PickledOutboundGroupSession {
        PickledOutboundGroupSession {
            pickle: self.inner.pickle().encrypt(pickle_key),
            room_id: self.room_id.clone(),
            session_id: self.session_id.clone(),
            creation_time: self.creation_time,
            message_count: self.message_count,
            settings: self.settings.clone(),
            shared_with: self.shared_with.clone(),
            invalidated: self.invalidated,
        }
    }

    /// Restore a session from a previously pickled one.
    pub fn from_pickle(
        pickle: &PickledOutboundGroupSession,
        pickle_key: &[u8; 32],
    ) -> Result<Self, PickleError> {
        let session =
            GroupSession::from_pickle(GroupSessionPickle::from_encrypted(&pickle.pickle, pickle_key)?);

        Ok(Self {
            session_id: session.session_id(),
            inner: Box::new(session),
            room_id: pickle.room_id.clone(),
            creation_time: pickle.creation_time,
            message_count: pickle.message_count,
            settings: pickle.settings.clone(),
            shared_with: pickle.shared_with.clone(),
            invalidated: pickle.invalidated,
        })
    }
}
