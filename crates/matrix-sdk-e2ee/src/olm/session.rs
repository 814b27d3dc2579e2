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

use std::{cmp::Ordering, fmt};

use ruma::{MilliSecondsSinceUnixEpoch, SecondsSinceUnixEpoch};
use serde::{Deserialize, Serialize};
use tracing::trace;
use vodozemac::{
    olm::{DecryptionError, OlmMessage, PreKeyMessage, Session as InnerSession, SessionPickle},
    Curve25519PublicKey, PickleError,
};

/// A pairwise Olm session with another device.
pub struct Session {
    inner: Box<InnerSession>,
    session_id: String,
    sender_key: Curve25519PublicKey,
    created_using_fallback_key: bool,
    creation_time: SecondsSinceUnixEpoch,
    last_use_time: SecondsSinceUnixEpoch,
    last_received_message_ts: Option<MilliSecondsSinceUnixEpoch>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("sender_key", &self.sender_key)
            .field("last_received_message_ts", &self.last_received_message_ts)
            .finish()
    }
}

/// A pickled version of a `Session`.
///
/// The Olm state is encrypted with the pickle key of the device.
#[derive(Clone, Serialize, Deserialize)]
pub struct PickledSession {
    /// The encrypted pickle of the session.
    pub pickle: String,
    /// The session id, kept in the clear so the store can index it.
    pub session_id: String,
    /// The curve25519 key of the other user that we share this session with.
    pub sender_key: Curve25519PublicKey,
    /// Was the session created using a fallback key.
    #[serde(default)]
    pub created_using_fallback_key: bool,
    /// The relative time elapsed since the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// The relative time elapsed since the session was last used.
    pub last_use_time: SecondsSinceUnixEpoch,
    /// When the last message was successfully decrypted with this session.
    #[serde(default)]
    pub last_received_message_ts: Option<MilliSecondsSinceUnixEpoch>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for PickledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickledSession")
            .field("session_id", &self.session_id)
            .field("sender_key", &self.sender_key)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        inner: InnerSession,
        sender_key: Curve25519PublicKey,
        created_using_fallback_key: bool,
    ) -> Self {
        let now = SecondsSinceUnixEpoch::now();

        Self {
            session_id: inner.session_id(),
            inner: Box::new(inner),
            sender_key,
            created_using_fallback_key,
            creation_time: now,
            last_use_time: now,
            last_received_message_ts: None,
        }
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The Curve25519 identity key of the other side.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// Was the session created using a fallback key of the other side.
    pub fn created_using_fallback_key(&self) -> bool {
        self.created_using_fallback_key
    }

    /// When the last message was decrypted with this session, if ever.
    pub fn last_received_message_ts(&self) -> Option<MilliSecondsSinceUnixEpoch> {
        self.last_received_message_ts
    }

    /// Has the session received a message from the other side, i.e. does it
    /// no longer need to send pre-key messages.
    pub fn has_received_message(&self) -> bool {
        self.inner.has_received_message()
    }

    /// Encrypt the given plaintext.
    pub fn encrypt(&mut self, plaintext: &str) -> OlmMessage {
        let message = self.inner.encrypt(plaintext);
        self.last_use_time = SecondsSinceUnixEpoch::now();

        message
    }

    /// Decrypt the given Olm message.
    pub fn decrypt(&mut self, message: &OlmMessage) -> Result<String, DecryptionError> {
        let plaintext = self.inner.decrypt(message)?;
        trace!(session_id = self.session_id, "Decrypted an Olm message");

        self.last_use_time = SecondsSinceUnixEpoch::now();
        self.last_received_message_ts = Some(MilliSecondsSinceUnixEpoch::now());

        Ok(String::from_utf8_lossy(&plaintext).into_owned())
    }

    /// Was the given pre-key message encrypted with this session.
    pub fn matches(&self, message: &PreKeyMessage) -> bool {
        self.session_id == message.session_id()
    }

    /// The ordering used to pick the session we encrypt with: the session
    /// that most recently received a message wins, the session id breaks ties.
    pub(crate) fn cmp_by_usage(&self, other: &Self) -> Ordering {
        self.last_received_message_ts
            .cmp(&other.last_received_message_ts)
            .then_with(|| self.session_id.cmp(&other.session_id))
    }

    /// Store the session as an encrypted pickle.
    pub fn pickle(&self, pickle_key: &[u8; 32]) -> PickledSession {
        PickledSession {
            pickle: self.inner.pickle().encrypt(pickle_key),
            session_id: self.session_id.clone(),
            sender_key: self.sender_key,
            created_using_fallback_key: self.created_using_fallback_key,
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
            last_received_message_ts: self.last_received_message_ts,
        }
    }

    /// Restore a session from a previously pickled one.
    pub fn from_pickle(pickle: &PickledSession, pickle_key: &[u8; 32]) -> Result<Self, PickleError> {
        let inner = InnerSession::from_pickle(SessionPickle::from_encrypted(&pickle.pickle, pickle_key)?);

        Ok(Self {
            session_id: inner.session_id(),
            inner: Box::new(inner),
            sender_key: pickle.sender_key,
            created_using_fallback_key: pickle.created_using_fallback_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
            last_received_message_ts: pickle.last_received_message_ts,
        })
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}
