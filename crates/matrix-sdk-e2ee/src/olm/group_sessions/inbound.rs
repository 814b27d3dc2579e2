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

use ruma::{OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use vodozemac::{
    megolm::{
        DecryptedMessage, DecryptionError, ExportedSessionKey,
        InboundGroupSession as InnerSession, InboundGroupSessionPickle, MegolmMessage,
        SessionConfig, SessionKey,
    },
    PickleError,
};

use super::ExportedRoomKey;
use crate::{algorithms::EventEncryptionAlgorithm, error::MegolmError};

/// Inbound group session.
///
/// Inbound group sessions are used to exchange room messages between a group
/// of participants. Inbound group sessions are used to decrypt the room
/// messages.
pub struct InboundGroupSession {
    inner: Box<InnerSession>,
    session_id: String,
    first_known_index: u32,
    sender_key: String,
    signing_keys: BTreeMap<String, String>,
    room_id: OwnedRoomId,
    forwarding_chain: Vec<String>,
    untrusted: bool,
    shared_history: bool,
    imported: bool,
    backed_up: bool,
}

/// A pickled version of an `InboundGroupSession`.
///
/// Holds all the information that needs to be stored in a database to restore
/// an `InboundGroupSession`.
#[derive(Clone, Serialize, Deserialize)]
pub struct PickledInboundGroupSession {
    /// The encrypted pickle of the session.
    pub pickle: String,
    /// The id of the session.
    pub session_id: String,
    /// The first message index the session is able to decrypt.
    pub first_known_index: u32,
    /// The public curve25519 key of the account that sent us the session.
    pub sender_key: String,
    /// The public ed25519 key of the account that is believed to have initiated
    /// the session, if we received the session by forwarding.
    pub signing_key: BTreeMap<String, String>,
    /// The id of the room that the session is used in.
    pub room_id: OwnedRoomId,
    /// The list of claimed ed25519 that forwarded us this key.
    #[serde(default)]
    pub forwarding_chains: Vec<String>,
    /// Did we receive the key through a channel we can't fully trust.
    #[serde(default)]
    pub untrusted: bool,
    /// Was the key shared because the room history is shared.
    #[serde(default)]
    pub shared_history: bool,
    /// Flag remembering if the session was directly sent to us by the sender
    /// or if it was imported.
    #[serde(default)]
    pub imported: bool,
    /// Flag remembering if the session has been backed up.
    #[serde(default)]
    pub backed_up: bool,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for PickledInboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickledInboundGroupSession")
            .field("session_id", &self.session_id)
            .field("sender_key", &self.sender_key)
            .field("room_id", &self.room_id)
            .field("backed_up", &self.backed_up)
            .finish_non_exhaustive()
    }
}

impl PickledInboundGroupSession {
    /// Does this pickle hold the same session data as the other one.
    ///
    /// The encrypted pickles differ on every pickling because of their random
    /// nonce, so the comparison uses the metadata that identifies the key.
    pub fn same_key_as(&self, other: &Self) -> bool {
        self.session_id == other.session_id
            && self.sender_key == other.sender_key
            && self.first_known_index == other.first_known_index
            && self.room_id == other.room_id
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("first_known_index", &self.first_known_index)
            .finish_non_exhaustive()
    }
}

impl InboundGroupSession {
    /// Create a new inbound group session from the content of an `m.room_key`
    /// event.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The public curve25519 key of the account that
    /// sent us the session.
    ///
    /// * `signing_key` - The public ed25519 key of the account that
    /// sent us the session.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `session_key` - The private session key that is used to decrypt
    /// messages.
    pub fn new(
        sender_key: &str,
        signing_key: &str,
        room_id: &RoomId,
        session_key: &SessionKey,
        shared_history: bool,
    ) -> Self {
        let session = InnerSession::new(session_key, SessionConfig::version_1());

        Self {
            session_id: session.session_id(),
            first_known_index: session.first_known_index(),
            inner: Box::new(session),
            sender_key: sender_key.to_owned(),
            signing_keys: BTreeMap::from([("ed25519".to_owned(), signing_key.to_owned())]),
            room_id: room_id.to_owned(),
            forwarding_chain: Vec::new(),
            untrusted: false,
            shared_history,
            imported: false,
            backed_up: false,
        }
    }

    /// Create an inbound group session from an exported room key.
    ///
    /// Imported sessions can't be authenticated against the sender's device,
    /// they are marked as untrusted.
    pub fn from_export(exported: &ExportedRoomKey) -> Result<Self, MegolmError> {
        let key = ExportedSessionKey::from_base64(&exported.session_key)?;
        let session = InnerSession::import(&key, SessionConfig::version_1());

        if session.session_id() != exported.session_id {
            return Err(MegolmError::EventError(crate::error::EventError::MismatchedKeys));
        }

        Ok(Self {
            session_id: session.session_id(),
            first_known_index: session.first_known_index(),
            inner: Box::new(session),
            sender_key: exported.sender_key.clone(),
            signing_keys: exported.sender_claimed_keys.clone(),
            room_id: exported.room_id.clone(),
            forwarding_chain: exported.forwarding_curve25519_key_chain.clone(),
            untrusted: true,
            shared_history: exported.shared_history,
            imported: true,
            backed_up: false,
        })
    }

    /// The unique id of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The Curve25519 key of the device that created the session.
    pub fn sender_key(&self) -> &str {
        &self.sender_key
    }

    /// The Ed25519 key the creator of the session claims to own.
    pub fn sender_claimed_ed25519_key(&self) -> Option<&str> {
        self.signing_keys.get("ed25519").map(String::as_str)
    }

    /// The room the session belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The keys of the devices that forwarded this session to us.
    pub fn forwarding_key_chain(&self) -> &[String] {
        &self.forwarding_chain
    }

    /// Get the first message index we know how to decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Was the session received through a channel we can't authenticate.
    pub fn is_untrusted(&self) -> bool {
        self.untrusted
    }

    /// Was the session shared together with the room history.
    pub fn shared_history(&self) -> bool {
        self.shared_history
    }

    /// Was the session imported.
    pub fn has_been_imported(&self) -> bool {
        self.imported
    }

    /// Has the session been uploaded to the key backup.
    pub fn backed_up(&self) -> bool {
        self.backed_up
    }

    /// Remember that the session has been uploaded to the key backup.
    pub fn mark_as_backed_up(&mut self) {
        self.backed_up = true;
    }

    /// The number of times this key was forwarded.
    pub fn forwarded_count(&self) -> u32 {
        self.forwarding_chain.len().try_into().unwrap_or(u32::MAX)
    }

    /// Decrypt the given Megolm message.
    pub fn decrypt(&mut self, message: &MegolmMessage) -> Result<DecryptedMessage, DecryptionError> {
        self.inner.decrypt(message)
    }

    /// Export the session at the given message index.
    ///
    /// Fails if the index precedes the first index the session knows about.
    pub fn export_at_index(&mut self, message_index: u32) -> Result<ExportedRoomKey, MegolmError> {
        let session_key = self.inner.export_at(message_index).ok_or(
            MegolmError::UnknownMessageIndex {
                first_known_index: self.first_known_index,
                requested: message_index,
            },
        )?;

        Ok(ExportedRoomKey {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: self.room_id.clone(),
            sender_key: self.sender_key.clone(),
            session_id: self.session_id.clone(),
            session_key: session_key.to_base64(),
            sender_claimed_keys: self.signing_keys.clone(),
            forwarding_curve25519_key_chain: self.forwarding_chain.clone(),
            shared_history: self.shared_history,
        })
    }

    /// Export the session at its first known index.
    pub fn export(&mut self) -> ExportedRoomKey {
        let first_known_index = self.first_known_index;

        // The first known index is always reachable.
        match self.export_at_index(first_known_index) {
            Ok(key) => key,
            Err(_) => unreachable!("A session can always be exported at its first known index"),
        }
    }

    /// Store the group session as an encrypted pickle.
    pub fn pickle(&self, pickle_key: &[u8; 32]) -> PickledInboundGroupSession {
        PickledInboundGroupSession {
            pickle: self.inner.pickle().encrypt(pickle_key),
            session_id: self.session_id.clone(),
            first_known_index: self.first_known_index,
            sender_key: self.sender_key.clone(),
            signing_key: self.signing_keys.clone(),
            room_id: self.room_id.clone(),
            forwarding_chains: self.forwarding_chain.clone(),
            untrusted: self.untrusted,
            shared_history: self.shared_history,
            imported: self.imported,
            backed_up: self.backed_up,
        }
    }

    /// Restore a session from a previously pickled one.
    pub fn from_pickle(
        pickle: &PickledInboundGroupSession,
        pickle_key: &[u8; 32],
    ) -> Result<Self, PickleError> {
        let session = InnerSession::from_pickle(InboundGroupSessionPickle::from_encrypted(
            &pickle.pickle,
            pickle_key,
        )?);

        Ok(Self {
            session_id: session.session_id(),
            first_known_index: session.first_known_index(),
            inner: Box::new(session),
            sender_key: pickle.sender_key.clone(),
            signing_keys: pickle.signing_key.clone(),
            room_id: pickle.room_id.clone(),
            forwarding_chain: pickle.forwarding_chains.clone(),
            untrusted: pickle.untrusted,
            shared_history: pickle.shared_history,
            imported: pickle.imported,
            backed_up: pickle.backed_up,
        })
    }
}
