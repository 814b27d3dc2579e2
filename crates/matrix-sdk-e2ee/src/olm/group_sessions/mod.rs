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

use std::{collections::BTreeMap, fmt};

use ruma::{OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};

mod inbound;
mod outbound;

pub use inbound::{InboundGroupSession, PickledInboundGroupSession};
pub use outbound::{EncryptionSettings, OutboundGroupSession, PickledOutboundGroupSession};
pub use vodozemac::megolm::{ExportedSessionKey, SessionKey};

use crate::{
    algorithms::EventEncryptionAlgorithm,
    types::{backup::BackedUpRoomKey, events::ForwardedRoomKeyContent},
};

/// An exported version of an `InboundGroupSession`.
///
/// This can be used to share the `InboundGroupSession` in an exported file or
/// through the key backup.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ExportedRoomKey {
    /// The encryption algorithm that the session uses.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room where the session is used.
    pub room_id: OwnedRoomId,

    /// The Curve25519 key of the device which initiated the session originally.
    pub sender_key: String,

    /// The ID of the session that the key is for.
    pub session_id: String,

    /// The key for the session, exported at its first known index.
    pub session_key: String,

    /// The Ed25519 key of the device which initiated the session originally.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,

    /// Chain of Curve25519 keys through which this session was forwarded, via
    /// m.forwarded_room_key events.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,

    /// Was the key shared because the room history is shared with new
    /// members.
    #[serde(default, rename = "org.matrix.msc3061.shared_history")]
    pub shared_history: bool,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for ExportedRoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedRoomKey")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("sender_key", &self.sender_key)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl ExportedRoomKey {
    /// The Ed25519 key the creator of the session claims to own.
    pub fn sender_claimed_ed25519_key(&self) -> Option<&str> {
        self.sender_claimed_keys.get("ed25519").map(String::as_str)
    }

    /// Convert the exported key into the content of a forwarded room key
    /// event.
    ///
    /// Returns `None` if the key doesn't carry a claimed Ed25519 key.
    pub fn to_forwarded_content(&self) -> Option<ForwardedRoomKeyContent> {
        Some(ForwardedRoomKeyContent {
            algorithm: self.algorithm.clone(),
            room_id: self.room_id.clone(),
            sender_key: self.sender_key.clone(),
            session_id: self.session_id.clone(),
            session_key: self.session_key.clone(),
            sender_claimed_ed25519_key: self.sender_claimed_ed25519_key()?.to_owned(),
            forwarding_curve25519_key_chain: self.forwarding_curve25519_key_chain.clone(),
            shared_history: self.shared_history,
        })
    }

    /// Rebuild an exported key from a backed up one.
    pub fn from_backed_up(room_id: OwnedRoomId, session_id: String, key: BackedUpRoomKey) -> Self {
        Self {
            algorithm: key.algorithm,
            room_id,
            sender_key: key.sender_key,
            session_id,
            session_key: key.session_key,
            sender_claimed_keys: key.sender_claimed_keys,
            forwarding_curve25519_key_chain: key.forwarding_curve25519_key_chain,
            shared_history: false,
        }
    }
}

impl From<ForwardedRoomKeyContent> for ExportedRoomKey {
    fn from(forwarded: ForwardedRoomKeyContent) -> Self {
        let sender_claimed_keys =
            BTreeMap::from([("ed25519".to_owned(), forwarded.sender_claimed_ed25519_key)]);

        Self {
            algorithm: forwarded.algorithm,
            room_id: forwarded.room_id,
            sender_key: forwarded.sender_key,
            session_id: forwarded.session_id,
            session_key: forwarded.session_key,
            sender_claimed_keys,
            forwarding_curve25519_key_chain: forwarded.forwarding_curve25519_key_chain,
            shared_history: forwarded.shared_history,
        }
    }
}

impl From<ExportedRoomKey> for BackedUpRoomKey {
    fn from(k: ExportedRoomKey) -> Self {
        Self {
            algorithm: k.algorithm,
            sender_key: k.sender_key,
            session_key: k.session_key,
            sender_claimed_keys: k.sender_claimed_keys,
            forwarding_curve25519_key_chain: k.forwarding_curve25519_key_chain,
        }
    }
}

/// A room key that was received for a room we were invited to with shared
/// history, waiting until the invite is accepted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParkedSharedHistory {
    /// The user that shared the history with us.
    pub inviter: OwnedUserId,
    /// The room key itself.
    pub key: ExportedRoomKey,
}
