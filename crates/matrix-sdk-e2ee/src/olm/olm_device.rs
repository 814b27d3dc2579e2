// Copyright 2023 The Matrix.org Foundation C.I.C.
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

//! The owner of our Olm account and of every Olm and Megolm session.
//!
//! The Olm objects only ever live in the store as encrypted pickles. Every
//! operation unpickles the objects it needs inside a store transaction, uses
//! them, pickles the modified ones and drops them again before the changes
//! are committed.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use ruma::{
    DeviceId, EventId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedEventId, OwnedUserId,
    RoomId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace, warn};
use vodozemac::{
    megolm::MegolmMessage,
    olm::{IdentityKeys, OlmMessage, PreKeyMessage},
    Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature,
};
use zeroize::Zeroizing;

use super::{
    Account, EncryptionSettings, ExportedRoomKey, InboundGroupSession, OlmMessageHash,
    OutboundGroupSession, ParkedSharedHistory, PickledAccount, PickledSession, Session,
    SessionKey,
};
use crate::{
    error::{EventError, MegolmResult, OlmError, OlmResult, SessionCreationError, SignatureError},
    requests::KeysUploadRequest,
    store::{CryptoStore, Store},
    types::{
        events::{MegolmV1Content, OlmCiphertext, RoomKeyWithheldContent},
        DeviceKeys,
    },
    MegolmError,
};

type SessionFuture = Shared<BoxFuture<'static, Option<String>>>;

/// How many decrypted Megolm message indices are remembered for replay
/// detection.
const MAX_MEGOLM_INDICES: usize = 10_000;

type MegolmIndexKey = (String, String, u32);

/// The event id and timestamp of recently decrypted Megolm messages, keyed by
/// the sender key, session id and message index.
///
/// Once full, the oldest entry is forgotten for every new one.
#[derive(Debug)]
struct MegolmIndices {
    capacity: usize,
    entries: BTreeMap<MegolmIndexKey, (OwnedEventId, MilliSecondsSinceUnixEpoch)>,
    order: VecDeque<MegolmIndexKey>,
}

impl MegolmIndices {
    fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: BTreeMap::new(), order: VecDeque::new() }
    }

    fn get(&self, key: &MegolmIndexKey) -> Option<&(OwnedEventId, MilliSecondsSinceUnixEpoch)> {
        self.entries.get(key)
    }

    fn insert(&mut self, key: MegolmIndexKey, value: (OwnedEventId, MilliSecondsSinceUnixEpoch)) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A device exported from another `OlmDevice`, used to move an existing
/// device into a new store.
///
/// The pickles have to be encrypted with the pickle key of the new device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportedDevice {
    /// The pickled account.
    pub account: PickledAccount,
    /// The pickled Olm sessions.
    pub sessions: Vec<PickledSession>,
}

/// The result of creating an Olm session from a pre-key message.
#[derive(Clone, Debug)]
pub struct InboundSessionResult {
    /// The decrypted payload of the pre-key message.
    pub payload: String,
    /// The id of the new session.
    pub session_id: String,
}

/// A decrypted Olm message.
#[derive(Clone, Debug)]
pub struct DecryptedOlmMessage {
    /// The decrypted payload.
    pub plaintext: String,
    /// The id of the session that decrypted the message.
    pub session_id: String,
}

/// A decrypted Megolm message with the information about its origin.
#[derive(Clone, Debug)]
pub struct DecryptedGroupMessage {
    /// The decrypted event, with its `type`, `content` and `room_id`.
    pub event: Value,
    /// The message index of the message.
    pub message_index: u32,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The Ed25519 key the creator of the session claims to own.
    pub sender_claimed_ed25519_key: Option<String>,
    /// The keys of the devices that forwarded the session to us.
    pub forwarding_curve25519_key_chain: Vec<String>,
    /// Was the session received through a channel we can't authenticate.
    pub untrusted: bool,
}

/// Marker for an Olm session that is being established with a device.
///
/// Other callers that want a session for the same device wait until
/// [`SessionInProgress::finish()`] is called or the marker is dropped.
pub(crate) struct SessionInProgress {
    device: OlmDevice,
    identity_key: String,
    sender: Option<oneshot::Sender<Option<String>>>,
}

impl fmt::Debug for SessionInProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInProgress").field("identity_key", &self.identity_key).finish()
    }
}

impl SessionInProgress {
    /// Resolve the establishment with the id of the new session, `None` if
    /// it failed.
    pub(crate) fn finish(mut self, session_id: Option<String>) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(session_id);
        }
    }
}

impl Drop for SessionInProgress {
    fn drop(&mut self) {
        self.device.inner.sessions_in_progress.lock().unwrap().remove(&self.identity_key);

        if let Some(sender) = self.sender.take() {
            let _ = sender.send(None);
        }
    }
}

/// The owner of our Olm account and of all the Olm and Megolm sessions.
#[derive(Clone)]
pub struct OlmDevice {
    inner: Arc<OlmDeviceInner>,
}

struct OlmDeviceInner {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    store: Store,
    pickle_key: Zeroizing<[u8; 32]>,
    identity_keys: IdentityKeys,
    sessions_in_progress: StdMutex<BTreeMap<String, SessionFuture>>,
    megolm_indices: StdMutex<MegolmIndices>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for OlmDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OlmDevice")
            .field("user_id", &self.inner.user_id)
            .field("device_id", &self.inner.device_id)
            .field("identity_keys", &self.inner.identity_keys)
            .finish_non_exhaustive()
    }
}

impl OlmDevice {
    /// Load our account from the store, or create a new one.
    ///
    /// If an `exported` device is given, it replaces whatever account the
    /// store holds.
    #[instrument(skip(store, pickle_key, exported))]
    pub(crate) async fn init(
        user_id: &UserId,
        device_id: &DeviceId,
        store: Store,
        pickle_key: Zeroizing<[u8; 32]>,
        exported: Option<ExportedDevice>,
    ) -> OlmResult<Self> {
        let mut transaction = store.transaction().await;

        let identity_keys = if let Some(exported) = exported {
            debug!("Importing an exported device");

            let identity_keys = Account::from_pickle(&exported.account, &pickle_key)?.identity_keys();
            let changes = transaction.changes();
            changes.account = Some(exported.account);
            changes.sessions = exported.sessions;

            identity_keys
        } else if let Some(pickle) = transaction.store().load_account().await? {
            Account::from_pickle(&pickle, &pickle_key)?.identity_keys()
        } else {
            debug!("Creating a new Olm account");

            let account = Account::new(user_id, device_id);
            let identity_keys = account.identity_keys();
            transaction.changes().account = Some(account.pickle(&pickle_key));

            identity_keys
        };

        transaction.commit().await?;

        Ok(Self {
            inner: Arc::new(OlmDeviceInner {
                user_id: user_id.to_owned(),
                device_id: device_id.to_owned(),
                store,
                pickle_key,
                identity_keys,
                sessions_in_progress: Default::default(),
                megolm_indices: StdMutex::new(MegolmIndices::new(MAX_MEGOLM_INDICES)),
            }),
        })
    }

    fn pickle_key(&self) -> &[u8; 32] {
        &self.inner.pickle_key
    }

    /// The owner of the device.
    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    /// The id of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    /// The Curve25519 identity key of the device.
    pub fn curve25519_key(&self) -> Curve25519PublicKey {
        self.inner.identity_keys.curve25519
    }

    /// The Ed25519 identity key of the device.
    pub fn ed25519_key(&self) -> Ed25519PublicKey {
        self.inner.identity_keys.ed25519
    }

    pub(crate) fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Run a read-only operation on the account.
    async fn with_account<T>(&self, f: impl FnOnce(&Account) -> OlmResult<T>) -> OlmResult<T> {
        let pickle = self.inner.store.load_account().await?.ok_or(OlmError::NotInitialized)?;
        let account = Account::from_pickle(&pickle, self.pickle_key())?;

        f(&account)
    }

    /// Run an operation that modifies the account, the modified account is
    /// saved afterwards.
    async fn with_account_mut<T>(
        &self,
        f: impl FnOnce(&mut Account) -> OlmResult<T>,
    ) -> OlmResult<T> {
        let mut transaction = self.inner.store.transaction().await;
        let pickle =
            transaction.store().load_account().await?.ok_or(OlmError::NotInitialized)?;

        let (ret, pickle) = {
            let mut account = Account::from_pickle(&pickle, self.pickle_key())?;
            let ret = f(&mut account)?;
            (ret, account.pickle(self.pickle_key()))
        };

        transaction.changes().account = Some(pickle);
        transaction.commit().await?;

        Ok(ret)
    }

    /// Export the account and the Olm sessions of the device.
    pub async fn export_device(&self) -> OlmResult<ExportedDevice> {
        let snapshot = self.inner.store.snapshot().await?;
        let account = snapshot.account.ok_or(OlmError::NotInitialized)?;

        Ok(ExportedDevice { account, sessions: snapshot.sessions })
    }

    /// Sign the given message with the Ed25519 key of the device.
    pub async fn sign(&self, message: &str) -> OlmResult<Ed25519Signature> {
        self.with_account(|a| Ok(a.sign(message))).await
    }

    /// Sign the canonical form of the given JSON object.
    pub async fn sign_json(&self, json: &Value) -> OlmResult<Ed25519Signature> {
        self.with_account(|a| Ok(a.sign_json(json)?)).await
    }

    /// The self-signed device keys of the device.
    pub async fn device_keys(&self) -> OlmResult<DeviceKeys> {
        self.with_account(|a| Ok(a.device_keys()?)).await
    }

    /// The unpublished one-time keys.
    pub async fn one_time_keys(&self) -> OlmResult<BTreeMap<String, Curve25519PublicKey>> {
        self.with_account(|a| Ok(a.one_time_keys())).await
    }

    /// The maximum number of one-time keys the account can hold.
    pub async fn max_number_of_one_time_keys(&self) -> OlmResult<usize> {
        self.with_account(|a| Ok(a.max_number_of_one_time_keys())).await
    }

    /// Generate new one-time keys, returns the number of created keys.
    pub async fn generate_one_time_keys(&self, count: usize) -> OlmResult<usize> {
        self.with_account_mut(|a| Ok(a.generate_one_time_keys(count))).await
    }

    /// Mark the current one-time and fallback keys as published.
    pub async fn mark_keys_as_published(&self) -> OlmResult<()> {
        self.with_account_mut(|a| {
            a.mark_keys_as_published();
            Ok(())
        })
        .await
    }

    /// Generate a new fallback key.
    pub async fn generate_fallback_key(&self) -> OlmResult<()> {
        self.with_account_mut(|a| {
            a.generate_fallback_key();
            Ok(())
        })
        .await
    }

    /// The unpublished fallback key.
    pub async fn fallback_key(&self) -> OlmResult<BTreeMap<String, Curve25519PublicKey>> {
        self.with_account(|a| Ok(a.fallback_key())).await
    }

    /// Forget the previous fallback key, once the current one is older than
    /// `max_age`.
    ///
    /// Returns `true` if a key was forgotten.
    pub async fn forget_old_fallback_key(&self, max_age: Duration) -> OlmResult<bool> {
        let expired = self.with_account(|a| Ok(a.fallback_key_expired(max_age))).await?;

        if expired {
            self.with_account_mut(|a| Ok(a.forget_fallback_key())).await
        } else {
            Ok(false)
        }
    }

    /// Collect the keys that need to be uploaded.
    ///
    /// The device keys are only included until the account was marked as
    /// shared.
    pub async fn keys_for_upload(&self) -> OlmResult<KeysUploadRequest> {
        self.with_account(|a| {
            Ok(KeysUploadRequest {
                device_keys: if a.shared() { None } else { Some(a.device_keys()?) },
                one_time_keys: a.signed_one_time_keys()?,
                fallback_keys: a.signed_fallback_keys()?,
            })
        })
        .await
    }

    /// Remember that the keys were uploaded and how many one-time keys the
    /// server holds now.
    pub async fn mark_keys_as_uploaded(&self, one_time_key_count: u64) -> OlmResult<()> {
        self.with_account_mut(|a| {
            a.mark_as_shared();
            a.mark_keys_as_published();
            a.update_uploaded_key_count(one_time_key_count);
            Ok(())
        })
        .await
    }

    /// The number of one-time keys the server holds for us.
    pub async fn uploaded_key_count(&self) -> OlmResult<u64> {
        self.with_account(|a| Ok(a.uploaded_key_count())).await
    }

    /// Create a new outbound Olm session with the given device.
    ///
    /// Returns the id of the new session.
    #[instrument(skip(self, their_one_time_key))]
    pub async fn create_outbound_session(
        &self,
        their_identity_key: &str,
        their_one_time_key: &str,
        fallback_used: bool,
    ) -> OlmResult<String> {
        let identity_key = Curve25519PublicKey::from_base64(their_identity_key)
            .map_err(SessionCreationError::InvalidKey)?;
        let one_time_key = Curve25519PublicKey::from_base64(their_one_time_key)
            .map_err(SessionCreationError::InvalidKey)?;

        let mut transaction = self.inner.store.transaction().await;
        let pickle =
            transaction.store().load_account().await?.ok_or(OlmError::NotInitialized)?;

        let (session_id, pickle) = {
            let account = Account::from_pickle(&pickle, self.pickle_key())?;
            let session = account.create_outbound_session(identity_key, one_time_key, fallback_used);
            (session.session_id().to_owned(), session.pickle(self.pickle_key()))
        };

        transaction.changes().sessions.push(pickle);
        transaction.commit().await?;

        debug!(session_id, "Created a new outbound Olm session");

        Ok(session_id)
    }

    /// Create a new inbound Olm session from a pre-key message.
    ///
    /// Only pre-key messages, with a `message_type` of 0, can create
    /// sessions. The one-time key the message used is removed from the
    /// account.
    #[instrument(skip(self, ciphertext))]
    pub async fn create_inbound_session(
        &self,
        their_identity_key: &str,
        message_type: usize,
        ciphertext: &str,
    ) -> OlmResult<InboundSessionResult> {
        if message_type != 0 {
            return Err(SessionCreationError::NotPreKeyMessage.into());
        }

        let identity_key = Curve25519PublicKey::from_base64(their_identity_key)
            .map_err(SessionCreationError::InvalidKey)?;
        let message = PreKeyMessage::from_base64(ciphertext).map_err(SessionCreationError::Decode)?;

        let mut transaction = self.inner.store.transaction().await;
        let pickle =
            transaction.store().load_account().await?.ok_or(OlmError::NotInitialized)?;

        let (result, account_pickle, session_pickle) = {
            let mut account = Account::from_pickle(&pickle, self.pickle_key())?;
            let (session, payload) = account.create_inbound_session(identity_key, &message)?;

            (
                InboundSessionResult { payload, session_id: session.session_id().to_owned() },
                account.pickle(self.pickle_key()),
                session.pickle(self.pickle_key()),
            )
        };

        let changes = transaction.changes();
        changes.account = Some(account_pickle);
        changes.sessions.push(session_pickle);
        transaction.commit().await?;

        debug!(session_id = result.session_id, "Created a new inbound Olm session");

        Ok(result)
    }

    /// Claim the right to establish a new Olm session with the given device.
    ///
    /// If another caller already establishes a session with the device,
    /// returns the future that resolves once that caller is done.
    pub(crate) fn start_session_establishment(
        &self,
        their_identity_key: &str,
    ) -> Result<SessionInProgress, SessionFuture> {
        let mut in_progress = self.inner.sessions_in_progress.lock().unwrap();

        if let Some(future) = in_progress.get(their_identity_key) {
            return Err(future.clone());
        }

        let (sender, receiver) = oneshot::channel();
        let future = receiver.map(|r| r.ok().flatten()).boxed().shared();
        in_progress.insert(their_identity_key.to_owned(), future);

        Ok(SessionInProgress {
            device: self.clone(),
            identity_key: their_identity_key.to_owned(),
            sender: Some(sender),
        })
    }

    async fn wait_for_session_in_progress(&self, their_identity_key: &str) {
        let future = self.inner.sessions_in_progress.lock().unwrap().get(their_identity_key).cloned();

        if let Some(future) = future {
            trace!(their_identity_key, "Waiting for a session that is being established");
            future.await;
        }
    }

    /// Get the ids of all the Olm sessions with the given device.
    ///
    /// Unless `nowait` is set, this first waits for a running session
    /// establishment with the device.
    pub async fn get_session_ids_for_device(
        &self,
        their_identity_key: &str,
        nowait: bool,
    ) -> OlmResult<Vec<String>> {
        if !nowait {
            self.wait_for_session_in_progress(their_identity_key).await;
        }

        let sessions = self.inner.store.get_sessions(their_identity_key).await?;
        Ok(sessions.into_iter().map(|s| s.session_id).collect())
    }

    /// Get the id of the session we should use to encrypt for the given
    /// device: the one that most recently received a message.
    pub async fn get_session_id_for_device(
        &self,
        their_identity_key: &str,
        nowait: bool,
    ) -> OlmResult<Option<String>> {
        if !nowait {
            self.wait_for_session_in_progress(their_identity_key).await;
        }

        let pickles = self.inner.store.get_sessions(their_identity_key).await?;
        let mut sessions = pickles
            .iter()
            .map(|p| Session::from_pickle(p, self.pickle_key()))
            .collect::<Result<Vec<_>, _>>()?;

        sessions.sort_by(Session::cmp_by_usage);

        Ok(sessions.pop().map(|s| s.session_id().to_owned()))
    }

    /// Encrypt a payload with the given Olm session.
    pub async fn encrypt_message(
        &self,
        their_identity_key: &str,
        session_id: &str,
        payload: &str,
    ) -> OlmResult<OlmCiphertext> {
        let mut transaction = self.inner.store.transaction().await;
        let pickles = transaction.store().get_sessions(their_identity_key).await?;
        let pickle = pickles.iter().find(|p| p.session_id == session_id).ok_or_else(|| {
            OlmError::MissingSession {
                sender_key: their_identity_key.to_owned(),
                session_id: session_id.to_owned(),
            }
        })?;

        let (ciphertext, pickle) = {
            let mut session = Session::from_pickle(pickle, self.pickle_key())?;
            let (message_type, body) = session.encrypt(payload).to_parts();
            (OlmCiphertext { message_type, body }, session.pickle(self.pickle_key()))
        };

        transaction.changes().sessions.push(pickle);
        transaction.commit().await?;

        Ok(ciphertext)
    }

    /// Decrypt a message with the given Olm session.
    pub async fn decrypt_message(
        &self,
        their_identity_key: &str,
        session_id: &str,
        message_type: usize,
        ciphertext: &str,
    ) -> OlmResult<String> {
        let message = OlmMessage::from_parts(message_type, ciphertext)
            .map_err(|_| EventError::UnsupportedOlmType(message_type))?;

        let mut transaction = self.inner.store.transaction().await;
        let pickles = transaction.store().get_sessions(their_identity_key).await?;
        let pickle = pickles.iter().find(|p| p.session_id == session_id).ok_or_else(|| {
            OlmError::MissingSession {
                sender_key: their_identity_key.to_owned(),
                session_id: session_id.to_owned(),
            }
        })?;

        let (plaintext, pickle) = {
            let mut session = Session::from_pickle(pickle, self.pickle_key())?;
            let plaintext = session.decrypt(&message)?;
            (plaintext, session.pickle(self.pickle_key()))
        };

        transaction.changes().sessions.push(pickle);
        transaction.commit().await?;

        Ok(plaintext)
    }

    /// Check whether the given pre-key message belongs to the given session.
    pub async fn matches_session(
        &self,
        their_identity_key: &str,
        session_id: &str,
        message_type: usize,
        ciphertext: &str,
    ) -> OlmResult<bool> {
        if message_type != 0 {
            return Ok(false);
        }

        let Ok(message) = PreKeyMessage::from_base64(ciphertext) else {
            return Ok(false);
        };

        let pickles = self.inner.store.get_sessions(their_identity_key).await?;

        match pickles.iter().find(|p| p.session_id == session_id) {
            Some(pickle) => Ok(Session::from_pickle(pickle, self.pickle_key())?.matches(&message)),
            None => Ok(false),
        }
    }

    /// Decrypt an Olm message addressed to us.
    ///
    /// Every existing session with the sender is tried first. Pre-key
    /// messages that don't belong to an existing session create a new one.
    /// A message that was already decrypted once is rejected as a replay.
    #[instrument(skip(self, ciphertext), fields(message_type = ciphertext.message_type))]
    pub async fn decrypt_olm_event(
        &self,
        sender_key: &str,
        ciphertext: &OlmCiphertext,
    ) -> OlmResult<DecryptedOlmMessage> {
        let message_hash = OlmMessageHash::new(sender_key, ciphertext.message_type, &ciphertext.body);
        let message = OlmMessage::from_parts(ciphertext.message_type, &ciphertext.body)
            .map_err(|_| EventError::UnsupportedOlmType(ciphertext.message_type))?;
        let identity_key =
            Curve25519PublicKey::from_base64(sender_key).map_err(SessionCreationError::InvalidKey)?;

        let mut transaction = self.inner.store.transaction().await;

        if transaction.store().is_message_known(&message_hash).await? {
            warn!(sender_key, "Received an Olm message that was already decrypted");
            return Err(OlmError::ReplayedMessage(sender_key.to_owned()));
        }

        let pickles = transaction.store().get_sessions(sender_key).await?;
        let account_pickle = match &message {
            OlmMessage::PreKey(_) => transaction.store().load_account().await?,
            OlmMessage::Normal(_) => None,
        };

        let (decrypted, changes) = {
            let mut decrypted = None;

            for pickle in &pickles {
                let mut session = Session::from_pickle(pickle, self.pickle_key())?;

                match &message {
                    OlmMessage::PreKey(m) if session.matches(m) => {
                        // A matching pre-key message has to decrypt with this
                        // session, there is no point in trying others.
                        let plaintext = session.decrypt(&message)?;
                        decrypted = Some((plaintext, session, None));
                        break;
                    }
                    OlmMessage::PreKey(_) => {}
                    OlmMessage::Normal(_) => {
                        if let Ok(plaintext) = session.decrypt(&message) {
                            decrypted = Some((plaintext, session, None));
                            break;
                        }
                    }
                }
            }

            let (plaintext, session, account) = match (decrypted, &message) {
                (Some(decrypted), _) => decrypted,
                (None, OlmMessage::PreKey(m)) => {
                    let pickle = account_pickle.ok_or(OlmError::NotInitialized)?;
                    let mut account = Account::from_pickle(&pickle, self.pickle_key())?;
                    let (session, plaintext) = account.create_inbound_session(identity_key, m)?;

                    debug!(session_id = session.session_id(), "Created a new Olm session");

                    (plaintext, session, Some(account.pickle(self.pickle_key())))
                }
                (None, OlmMessage::Normal(_)) => {
                    return Err(OlmError::NoMatchingSession(sender_key.to_owned()));
                }
            };

            let result = DecryptedOlmMessage {
                plaintext,
                session_id: session.session_id().to_owned(),
            };

            (result, (session.pickle(self.pickle_key()), account))
        };

        let (session_pickle, account_pickle) = changes;
        let changes = transaction.changes();
        changes.sessions.push(session_pickle);
        changes.message_hashes.push(message_hash);

        if let Some(account_pickle) = account_pickle {
            changes.account = Some(account_pickle);
        }

        transaction.commit().await?;

        Ok(decrypted)
    }

    /// Create a new outbound group session for the given room, replacing the
    /// current one.
    ///
    /// Returns the id of the new session.
    pub async fn create_outbound_group_session(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> OlmResult<String> {
        let (session_id, pickle) = {
            let session = OutboundGroupSession::new(room_id, settings);
            (session.session_id().to_owned(), session.pickle(self.pickle_key()))
        };

        let mut transaction = self.inner.store.transaction().await;
        transaction.changes().outbound_group_sessions.push(pickle);
        transaction.commit().await?;

        debug!(?room_id, session_id, "Created a new outbound group session");

        Ok(session_id)
    }

    async fn with_outbound_group_session<T>(
        &self,
        room_id: &RoomId,
        save: bool,
        f: impl FnOnce(&mut OutboundGroupSession) -> OlmResult<T>,
    ) -> OlmResult<Option<T>> {
        let mut transaction = self.inner.store.transaction().await;

        let Some(pickle) = transaction.store().get_outbound_group_session(room_id).await? else {
            return Ok(None);
        };

        let (ret, pickle) = {
            let mut session = OutboundGroupSession::from_pickle(&pickle, self.pickle_key())?;
            let ret = f(&mut session)?;
            (ret, session.pickle(self.pickle_key()))
        };

        if save {
            transaction.changes().outbound_group_sessions.push(pickle);
            transaction.commit().await?;
        }

        Ok(Some(ret))
    }

    /// The id of the current outbound group session of the room, if it
    /// doesn't need to be rotated.
    pub async fn outbound_group_session_id(&self, room_id: &RoomId) -> OlmResult<Option<String>> {
        Ok(self
            .with_outbound_group_session(room_id, false, |s| {
                Ok((!s.expired() && !s.invalidated()).then(|| s.session_id().to_owned()))
            })
            .await?
            .flatten())
    }

    /// Invalidate the current outbound group session of the room, the next
    /// message will use a new session.
    pub async fn invalidate_outbound_group_session(&self, room_id: &RoomId) -> OlmResult<bool> {
        Ok(self
            .with_outbound_group_session(room_id, true, |s| {
                s.invalidate_session();
                Ok(())
            })
            .await?
            .is_some())
    }

    /// Remember that the current outbound group session of the room was
    /// shared with the given device at the given message index.
    pub async fn mark_outbound_group_session_shared_with(
        &self,
        room_id: &RoomId,
        devices: Vec<(OwnedUserId, OwnedDeviceId)>,
        message_index: u32,
    ) -> OlmResult<()> {
        self.with_outbound_group_session(room_id, true, |s| {
            for (user_id, device_id) in devices {
                s.mark_shared_with(user_id, device_id, message_index);
            }
            Ok(())
        })
        .await?;

        Ok(())
    }

    /// The message index at which the current outbound group session of the
    /// room was shared with the given device.
    pub async fn outbound_group_session_shared_with(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> OlmResult<Option<u32>> {
        Ok(self
            .with_outbound_group_session(room_id, false, |s| Ok(s.shared_with(user_id, device_id)))
            .await?
            .flatten())
    }

    /// Encrypt an event with the current outbound group session of the room.
    pub async fn encrypt_group_message(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> OlmResult<MegolmV1Content> {
        let sender_key = self.curve25519_key().to_base64();
        let device_id = self.inner.device_id.clone();

        self.with_outbound_group_session(room_id, true, |s| {
            let ciphertext = s.encrypt(event_type, content)?;

            Ok(MegolmV1Content {
                ciphertext,
                session_id: s.session_id().to_owned(),
                sender_key: Some(sender_key),
                device_id: Some(device_id),
            })
        })
        .await?
        .ok_or_else(|| OlmError::MissingOutboundGroupSession(room_id.to_string()))
    }

    /// Get the current message index and session key of the outbound group
    /// session of the room, for sharing it with other devices.
    pub async fn get_outbound_group_session_key(
        &self,
        room_id: &RoomId,
    ) -> OlmResult<(String, u32, SessionKey)> {
        self.with_outbound_group_session(room_id, false, |s| {
            Ok((s.session_id().to_owned(), s.message_index(), s.session_key()))
        })
        .await?
        .ok_or_else(|| OlmError::MissingOutboundGroupSession(room_id.to_string()))
    }

    async fn save_inbound_group_session(
        &self,
        session: InboundGroupSession,
        overwrite: bool,
    ) -> MegolmResult<bool> {
        let pickle = session.pickle(self.pickle_key());
        drop(session);

        let mut transaction = self.inner.store.transaction().await;

        if !overwrite
            && transaction
                .store()
                .get_inbound_group_session(&pickle.sender_key, &pickle.session_id)
                .await?
                .is_some()
        {
            trace!(
                sender_key = pickle.sender_key,
                session_id = pickle.session_id,
                "Ignoring an inbound group session we already have"
            );
            return Ok(false);
        }

        debug!(
            sender_key = pickle.sender_key,
            session_id = pickle.session_id,
            room_id = ?pickle.room_id,
            "Storing an inbound group session"
        );

        transaction.changes().inbound_group_sessions.push(pickle);
        transaction.commit().await?;

        Ok(true)
    }

    /// Add an inbound group session we received in an `m.room_key` event.
    ///
    /// If we already have a session with the same sender key and session id
    /// the new one is ignored. Returns `true` if the session was added.
    pub async fn add_inbound_group_session(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        sender_claimed_ed25519_key: &str,
        session_id: &str,
        session_key: &str,
        shared_history: bool,
    ) -> MegolmResult<bool> {
        let session = Self::session_from_room_key(
            room_id,
            sender_key,
            sender_claimed_ed25519_key,
            session_id,
            session_key,
            shared_history,
        )?;

        self.save_inbound_group_session(session, false).await
    }

    fn session_from_room_key(
        room_id: &RoomId,
        sender_key: &str,
        sender_claimed_ed25519_key: &str,
        session_id: &str,
        session_key: &str,
        shared_history: bool,
    ) -> MegolmResult<InboundGroupSession> {
        let session_key = SessionKey::from_base64(session_key)?;
        let session = InboundGroupSession::new(
            sender_key,
            sender_claimed_ed25519_key,
            room_id,
            &session_key,
            shared_history,
        );

        if session.session_id() != session_id {
            warn!(
                expected = session_id,
                got = session.session_id(),
                "The session id of a room key doesn't match its session key"
            );
            return Err(EventError::MismatchedKeys.into());
        }

        Ok(session)
    }

    /// Park a room key received for a room whose history-sharing invite we
    /// didn't accept yet.
    ///
    /// The key is only usable once it's taken out again with
    /// [`OlmDevice::take_parked_shared_history()`] and imported.
    #[allow(clippy::too_many_arguments)]
    pub async fn park_shared_history_session(
        &self,
        inviter: &UserId,
        room_id: &RoomId,
        sender_key: &str,
        sender_claimed_ed25519_key: &str,
        session_id: &str,
        session_key: &str,
    ) -> MegolmResult<()> {
        let mut session = Self::session_from_room_key(
            room_id,
            sender_key,
            sender_claimed_ed25519_key,
            session_id,
            session_key,
            true,
        )?;
        let key = session.export();
        drop(session);

        debug!(?room_id, ?inviter, session_id, "Parking a shared-history room key");

        let mut transaction = self.inner.store.transaction().await;
        transaction
            .changes()
            .parked_shared_history
            .push((room_id.to_owned(), ParkedSharedHistory { inviter: inviter.to_owned(), key }));
        Ok(transaction.commit().await?)
    }

    /// Remove and return all the room keys parked for the room.
    pub async fn take_parked_shared_history(
        &self,
        room_id: &RoomId,
    ) -> OlmResult<Vec<ParkedSharedHistory>> {
        let mut transaction = self.inner.store.transaction().await;
        let parked = transaction.store().get_parked_shared_history(room_id).await?;

        if !parked.is_empty() {
            transaction.changes().taken_parked_shared_history.push(room_id.to_owned());
            transaction.commit().await?;
        }

        Ok(parked)
    }

    /// Import an exported room key.
    ///
    /// With `overwrite` the key replaces an existing session with the same
    /// id, otherwise it's only added if we don't know the session yet.
    pub async fn import_room_key(
        &self,
        key: &ExportedRoomKey,
        overwrite: bool,
    ) -> MegolmResult<bool> {
        let session = InboundGroupSession::from_export(key)?;
        self.save_inbound_group_session(session, overwrite).await
    }

    /// Import an exported room key unless we already have a copy of the
    /// session that reaches back as far.
    ///
    /// Returns `true` if the key was new or replaced a copy with a higher
    /// first known index.
    pub async fn merge_room_key(&self, key: &ExportedRoomKey) -> MegolmResult<bool> {
        let session = InboundGroupSession::from_export(key)?;
        let mut transaction = self.inner.store.transaction().await;

        if let Some(existing) =
            transaction.store().get_inbound_group_session(&key.sender_key, &key.session_id).await?
        {
            let existing_index =
                InboundGroupSession::from_pickle(&existing, self.pickle_key())?.first_known_index();

            if existing_index <= session.first_known_index() {
                trace!(
                    session_id = key.session_id,
                    existing_index,
                    "Ignoring a room key that isn't better than ours"
                );
                return Ok(false);
            }

            debug!(
                session_id = key.session_id,
                existing_index,
                new_index = session.first_known_index(),
                "Replacing a room key with one that reaches further back"
            );
        }

        let pickle = session.pickle(self.pickle_key());
        drop(session);

        transaction.changes().inbound_group_sessions.push(pickle);
        transaction.commit().await?;

        Ok(true)
    }

    /// Store an exported room key, replacing any session with the same id.
    pub async fn store_inbound_group_session(&self, key: &ExportedRoomKey) -> MegolmResult<()> {
        self.import_room_key(key, true).await?;
        Ok(())
    }

    /// Remember that the sender of a group session withheld it from us.
    pub async fn add_inbound_group_session_withheld(
        &self,
        content: RoomKeyWithheldContent,
    ) -> OlmResult<()> {
        debug!(
            sender_key = content.sender_key,
            session_id = content.session_id,
            code = %content.code,
            "Storing a withheld notice"
        );

        let mut transaction = self.inner.store.transaction().await;
        transaction.changes().withheld_info.push(content);
        Ok(transaction.commit().await?)
    }

    /// Decrypt a Megolm message.
    ///
    /// Returns `Ok(None)` if we don't have the session, or an error carrying
    /// the withheld code if the sender told us it withheld the session. The
    /// same message index showing up with a different event id or timestamp
    /// is rejected as a replay.
    #[instrument(skip(self, ciphertext, event_id, timestamp))]
    pub async fn decrypt_group_message(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
        ciphertext: &str,
        event_id: &EventId,
        timestamp: MilliSecondsSinceUnixEpoch,
    ) -> MegolmResult<Option<DecryptedGroupMessage>> {
        let message = MegolmMessage::from_base64(ciphertext)?;
        let mut transaction = self.inner.store.transaction().await;

        let Some(pickle) =
            transaction.store().get_inbound_group_session(sender_key, session_id).await?
        else {
            return match transaction.store().get_withheld_info(sender_key, session_id).await? {
                Some(withheld) => Err(MegolmError::Withheld(withheld.code)),
                None => Ok(None),
            };
        };

        let (result, pickle) = {
            let mut session = InboundGroupSession::from_pickle(&pickle, self.pickle_key())?;

            if session.room_id() != room_id {
                warn!(session_room_id = ?session.room_id(), "The room key belongs to a different room");
                return Err(MegolmError::MismatchedRoom(session.room_id().to_owned()));
            }

            let decrypted = session.decrypt(&message)?;
            let event: Value = serde_json::from_slice(&decrypted.plaintext)?;

            if event.get("room_id").and_then(Value::as_str) != Some(room_id.as_str()) {
                return Err(EventError::MismatchedRoom(
                    event.get("room_id").and_then(|r| serde_json::from_value(r.clone()).ok()),
                )
                .into());
            }

            self.check_megolm_replay(
                sender_key,
                session_id,
                decrypted.message_index,
                event_id,
                timestamp,
            )?;

            let result = DecryptedGroupMessage {
                event,
                message_index: decrypted.message_index,
                sender_key: session.sender_key().to_owned(),
                sender_claimed_ed25519_key: session.sender_claimed_ed25519_key().map(ToOwned::to_owned),
                forwarding_curve25519_key_chain: session.forwarding_key_chain().to_vec(),
                untrusted: session.is_untrusted(),
            };

            (result, session.pickle(self.pickle_key()))
        };

        transaction.changes().inbound_group_sessions.push(pickle);
        transaction.commit().await?;

        Ok(Some(result))
    }

    fn check_megolm_replay(
        &self,
        sender_key: &str,
        session_id: &str,
        message_index: u32,
        event_id: &EventId,
        timestamp: MilliSecondsSinceUnixEpoch,
    ) -> MegolmResult<()> {
        let mut indices = self.inner.megolm_indices.lock().unwrap();
        let key: MegolmIndexKey = (sender_key.to_owned(), session_id.to_owned(), message_index);

        match indices.get(&key) {
            Some((known_event_id, known_timestamp))
                if known_event_id != event_id || *known_timestamp != timestamp =>
            {
                warn!(
                    session_id,
                    message_index,
                    ?known_event_id,
                    ?event_id,
                    "A Megolm message index was used by two different events"
                );
                Err(MegolmError::Replay(message_index))
            }
            Some(_) => Ok(()),
            None => {
                indices.insert(key, (event_id.to_owned(), timestamp));
                Ok(())
            }
        }
    }

    /// Do we have the inbound group session with the given id for the room.
    pub async fn has_inbound_session_keys(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
    ) -> MegolmResult<bool> {
        Ok(self
            .inner
            .store
            .get_inbound_group_session(sender_key, session_id)
            .await?
            .is_some_and(|s| s.room_id == room_id))
    }

    /// Export an inbound group session at the given message index, or at
    /// its first known index.
    ///
    /// Fails if the index precedes the first index the session knows about.
    pub async fn get_inbound_group_session_key(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
        chain_index: Option<u32>,
    ) -> MegolmResult<Option<ExportedRoomKey>> {
        let Some(pickle) = self.inner.store.get_inbound_group_session(sender_key, session_id).await?
        else {
            return Ok(None);
        };

        if pickle.room_id != room_id {
            return Err(MegolmError::MismatchedRoom(pickle.room_id));
        }

        let mut session = InboundGroupSession::from_pickle(&pickle, self.pickle_key())?;
        let index = chain_index.unwrap_or(session.first_known_index());

        session.export_at_index(index).map(Some)
    }

    /// Export an inbound group session at its first known index.
    pub async fn export_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> MegolmResult<Option<ExportedRoomKey>> {
        match self.inner.store.get_inbound_group_session(sender_key, session_id).await? {
            Some(pickle) => {
                Ok(Some(InboundGroupSession::from_pickle(&pickle, self.pickle_key())?.export()))
            }
            None => Ok(None),
        }
    }

    /// Export all of our inbound group sessions.
    pub async fn export_room_keys(&self) -> MegolmResult<Vec<ExportedRoomKey>> {
        self.inner
            .store
            .get_inbound_group_sessions()
            .await?
            .iter()
            .map(|p| Ok(InboundGroupSession::from_pickle(p, self.pickle_key())?.export()))
            .collect()
    }

    /// Unpickle the given inbound group sessions and export them.
    pub(crate) fn export_pickled(
        &self,
        pickles: &[super::PickledInboundGroupSession],
    ) -> MegolmResult<Vec<ExportedRoomKey>> {
        pickles
            .iter()
            .map(|p| Ok(InboundGroupSession::from_pickle(p, self.pickle_key())?.export()))
            .collect()
    }

    /// Verify an Ed25519 signature.
    ///
    /// Fails with [`SignatureError::InvalidBase64`] if the key or signature
    /// can't be decoded and with [`SignatureError::VerificationError`] if the
    /// signature is wrong.
    pub fn verify_signature(key: &str, message: &str, signature: &str) -> Result<(), SignatureError> {
        let key = Ed25519PublicKey::from_base64(key).map_err(|_| SignatureError::InvalidBase64)?;
        let signature =
            Ed25519Signature::from_base64(signature).map_err(|_| SignatureError::InvalidBase64)?;

        key.verify(message.as_bytes(), &signature).map_err(|_| SignatureError::VerificationError)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{sync::Arc, time::Duration};

    use assert_matches2::assert_matches;
    use ruma::{device_id, event_id, room_id, user_id, DeviceId, MilliSecondsSinceUnixEpoch, UInt, UserId};
    use serde_json::json;
    use zeroize::Zeroizing;

    use super::OlmDevice;
    use crate::{
        error::{MegolmError, OlmError, SessionCreationError, SignatureError},
        olm::EncryptionSettings,
        store::{MemoryStore, Store},
        types::events::{RoomKeyWithheldContent, WithheldCode},
        EventEncryptionAlgorithm,
    };

    pub(crate) async fn olm_device(user_id: &UserId, device_id: &DeviceId) -> OlmDevice {
        let store = Store::new(Arc::new(MemoryStore::new()));
        OlmDevice::init(user_id, device_id, store, Zeroizing::new([7u8; 32]), None).await.unwrap()
    }

    async fn alice_and_bob() -> (OlmDevice, OlmDevice) {
        (
            olm_device(user_id!("@alice:localhost"), device_id!("ALICEDEVICE")).await,
            olm_device(user_id!("@bob:localhost"), device_id!("BOBDEVICE")).await,
        )
    }

    /// Let `bob` create an outbound session with `alice` using one of her
    /// one-time keys.
    async fn bob_session_with(alice: &OlmDevice, bob: &OlmDevice) -> String {
        alice.generate_one_time_keys(1).await.unwrap();
        let one_time_key = *alice.one_time_keys().await.unwrap().values().next().unwrap();
        alice.mark_keys_as_published().await.unwrap();

        bob.create_outbound_session(
            &alice.curve25519_key().to_base64(),
            &one_time_key.to_base64(),
            false,
        )
        .await
        .unwrap()
    }

    fn ts(ms: u32) -> MilliSecondsSinceUnixEpoch {
        MilliSecondsSinceUnixEpoch(UInt::from(ms))
    }

    #[tokio::test]
    async fn account_survives_a_restart() {
        let store = Store::new(Arc::new(MemoryStore::new()));
        let alice = user_id!("@alice:localhost");
        let key = Zeroizing::new([1u8; 32]);

        let first = OlmDevice::init(alice, device_id!("A"), store.clone(), key.clone(), None)
            .await
            .unwrap();
        let second = OlmDevice::init(alice, device_id!("A"), store, key, None).await.unwrap();

        assert_eq!(first.curve25519_key(), second.curve25519_key());
        assert_eq!(first.ed25519_key(), second.ed25519_key());
    }

    #[tokio::test]
    async fn exported_device_keeps_its_identity() {
        let (alice, bob) = alice_and_bob().await;
        bob_session_with(&alice, &bob).await;

        let exported = bob.export_device().await.unwrap();
        assert_eq!(exported.sessions.len(), 1);

        let store = Store::new(Arc::new(MemoryStore::new()));
        let restored = OlmDevice::init(
            bob.user_id(),
            bob.device_id(),
            store,
            Zeroizing::new([7u8; 32]),
            Some(exported),
        )
        .await
        .unwrap();

        assert_eq!(restored.curve25519_key(), bob.curve25519_key());
        let ids = restored
            .get_session_ids_for_device(&alice.curve25519_key().to_base64(), true)
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn olm_round_trip() {
        let (alice, bob) = alice_and_bob().await;
        let session_id = bob_session_with(&alice, &bob).await;
        let alice_key = alice.curve25519_key().to_base64();
        let bob_key = bob.curve25519_key().to_base64();

        let payload = json!({"msgtype": "m.text", "body": "hi"}).to_string();
        let ciphertext = bob.encrypt_message(&alice_key, &session_id, &payload).await.unwrap();
        assert_eq!(ciphertext.message_type, 0);

        let result = alice
            .create_inbound_session(&bob_key, ciphertext.message_type, &ciphertext.body)
            .await
            .unwrap();

        assert_eq!(result.session_id, session_id);
        similar_asserts::assert_eq!(
            serde_json::from_str::<serde_json::Value>(&result.payload).unwrap(),
            json!({"msgtype": "m.text", "body": "hi"})
        );

        // The one-time key was used up.
        assert!(alice.one_time_keys().await.unwrap().is_empty());

        let reply = alice.encrypt_message(&bob_key, &session_id, "pong").await.unwrap();
        let plaintext = bob
            .decrypt_message(&alice_key, &session_id, reply.message_type, &reply.body)
            .await
            .unwrap();
        assert_eq!(plaintext, "pong");
    }

    #[tokio::test]
    async fn inbound_sessions_need_pre_key_messages() {
        let (alice, bob) = alice_and_bob().await;

        assert_matches!(
            alice.create_inbound_session(&bob.curve25519_key().to_base64(), 1, "AwogI").await,
            Err(OlmError::SessionCreation(SessionCreationError::NotPreKeyMessage))
        );
    }

    #[tokio::test]
    async fn replayed_olm_messages_are_rejected() {
        let (alice, bob) = alice_and_bob().await;
        let session_id = bob_session_with(&alice, &bob).await;
        let alice_key = alice.curve25519_key().to_base64();
        let bob_key = bob.curve25519_key().to_base64();

        let ciphertext = bob.encrypt_message(&alice_key, &session_id, "hello").await.unwrap();

        let decrypted = alice.decrypt_olm_event(&bob_key, &ciphertext).await.unwrap();
        assert_eq!(decrypted.plaintext, "hello");
        assert_eq!(decrypted.session_id, session_id);

        assert_matches!(
            alice.decrypt_olm_event(&bob_key, &ciphertext).await,
            Err(OlmError::ReplayedMessage(_))
        );
    }

    #[tokio::test]
    async fn most_recently_used_session_is_preferred() {
        let (alice, bob) = alice_and_bob().await;
        let alice_key = alice.curve25519_key().to_base64();
        let bob_key = bob.curve25519_key().to_base64();

        let first = bob_session_with(&alice, &bob).await;
        let second = bob_session_with(&alice, &bob).await;

        // Alice answers on the first session, which makes it the most
        // recently used one on Bob's side.
        let message = bob.encrypt_message(&alice_key, &first, "hi").await.unwrap();
        alice.decrypt_olm_event(&bob_key, &message).await.unwrap();
        let reply = alice.encrypt_message(&bob_key, &first, "hello").await.unwrap();
        bob.decrypt_olm_event(&alice_key, &reply).await.unwrap();

        let preferred = bob.get_session_id_for_device(&alice_key, true).await.unwrap();
        assert_eq!(preferred.as_deref(), Some(first.as_str()));
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_for_a_session_in_progress() {
        let (alice, bob) = alice_and_bob().await;
        let alice_key = alice.curve25519_key().to_base64();

        let in_progress = bob.start_session_establishment(&alice_key).unwrap();
        assert!(bob.start_session_establishment(&alice_key).is_err());

        let waiter = {
            let bob = bob.clone();
            let alice_key = alice_key.clone();
            tokio::spawn(async move { bob.get_session_id_for_device(&alice_key, false).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        let session_id = bob_session_with(&alice, &bob).await;
        in_progress.finish(Some(session_id.clone()));

        let found = waiter.await.unwrap().unwrap();
        assert_eq!(found, Some(session_id));
        assert!(bob.start_session_establishment(&alice_key).is_ok());
    }

    #[tokio::test]
    async fn group_round_trip() {
        let (alice, bob) = alice_and_bob().await;
        let room_id = room_id!("!r:x");
        let alice_key = alice.curve25519_key().to_base64();

        alice.create_outbound_group_session(room_id, EncryptionSettings::default()).await.unwrap();
        let (session_id, index, session_key) =
            alice.get_outbound_group_session_key(room_id).await.unwrap();
        assert_eq!(index, 0);

        let first = alice
            .encrypt_group_message(room_id, "m.room.message", json!({"body": "one"}))
            .await
            .unwrap();
        let second = alice
            .encrypt_group_message(room_id, "m.room.message", json!({"body": "two"}))
            .await
            .unwrap();

        assert!(bob
            .add_inbound_group_session(
                room_id,
                &alice_key,
                &alice.ed25519_key().to_base64(),
                &session_id,
                &session_key.to_base64(),
                false,
            )
            .await
            .unwrap());

        for (i, (content, body)) in [(first, "one"), (second, "two")].into_iter().enumerate() {
            let decrypted = bob
                .decrypt_group_message(
                    room_id,
                    &alice_key,
                    &content.session_id,
                    &content.ciphertext,
                    &ruma::OwnedEventId::try_from(format!("$event{i}:x")).unwrap(),
                    ts(i as u32),
                )
                .await
                .unwrap()
                .unwrap();

            assert_eq!(decrypted.message_index, i as u32);
            assert_eq!(decrypted.event["content"]["body"], body);
            assert_eq!(decrypted.event["type"], "m.room.message");
        }
    }

    #[tokio::test]
    async fn group_messages_before_the_shared_index_are_unreadable() {
        let (alice, bob) = alice_and_bob().await;
        let room_id = room_id!("!r:x");
        let alice_key = alice.curve25519_key().to_base64();

        alice.create_outbound_group_session(room_id, EncryptionSettings::default()).await.unwrap();
        let early = alice.encrypt_group_message(room_id, "m.dummy", json!({})).await.unwrap();

        let (session_id, index, session_key) =
            alice.get_outbound_group_session_key(room_id).await.unwrap();
        assert_eq!(index, 1);

        bob.add_inbound_group_session(
            room_id,
            &alice_key,
            &alice.ed25519_key().to_base64(),
            &session_id,
            &session_key.to_base64(),
            false,
        )
        .await
        .unwrap();

        let result = bob
            .decrypt_group_message(
                room_id,
                &alice_key,
                &session_id,
                &early.ciphertext,
                event_id!("$early:x"),
                ts(1),
            )
            .await;

        assert_matches!(result, Err(MegolmError::Decryption(_)));
    }

    #[tokio::test]
    async fn megolm_replays_are_detected() {
        let alice = olm_device(user_id!("@alice:localhost"), device_id!("ALICEDEVICE")).await;
        let room_id = room_id!("!r:x");
        let alice_key = alice.curve25519_key().to_base64();

        let session_id =
            alice.create_outbound_group_session(room_id, EncryptionSettings::default()).await.unwrap();
        let (_, _, session_key) = alice.get_outbound_group_session_key(room_id).await.unwrap();
        alice
            .add_inbound_group_session(
                room_id,
                &alice_key,
                &alice.ed25519_key().to_base64(),
                &session_id,
                &session_key.to_base64(),
                false,
            )
            .await
            .unwrap();

        let content = alice.encrypt_group_message(room_id, "m.dummy", json!({})).await.unwrap();
        let decrypt = |event_id: &'static ruma::EventId, timestamp| {
            let alice = alice.clone();
            let alice_key = alice_key.clone();
            let content = content.clone();

            async move {
                alice
                    .decrypt_group_message(
                        room_id,
                        &alice_key,
                        &content.session_id,
                        &content.ciphertext,
                        event_id,
                        timestamp,
                    )
                    .await
            }
        };

        decrypt(event_id!("$original:x"), ts(10)).await.unwrap().unwrap();
        // Decrypting the same event again is fine.
        decrypt(event_id!("$original:x"), ts(10)).await.unwrap().unwrap();

        assert_matches!(
            decrypt(event_id!("$replayed:x"), ts(10)).await,
            Err(MegolmError::Replay(0))
        );
    }

    #[tokio::test]
    async fn unknown_and_withheld_sessions() {
        let (alice, bob) = alice_and_bob().await;
        let room_id = room_id!("!r:x");
        let alice_key = alice.curve25519_key().to_base64();

        alice.create_outbound_group_session(room_id, EncryptionSettings::default()).await.unwrap();
        let content = alice.encrypt_group_message(room_id, "m.dummy", json!({})).await.unwrap();

        let result = bob
            .decrypt_group_message(
                room_id,
                &alice_key,
                &content.session_id,
                &content.ciphertext,
                event_id!("$e:x"),
                ts(1),
            )
            .await
            .unwrap();
        assert!(result.is_none());

        bob.add_inbound_group_session_withheld(RoomKeyWithheldContent {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            code: WithheldCode::Unverified,
            reason: Some("Device not verified".to_owned()),
            room_id: Some(room_id.to_owned()),
            session_id: Some(content.session_id.clone()),
            sender_key: alice_key.clone(),
        })
        .await
        .unwrap();

        let result = bob
            .decrypt_group_message(
                room_id,
                &alice_key,
                &content.session_id,
                &content.ciphertext,
                event_id!("$e:x"),
                ts(1),
            )
            .await;
        assert_matches!(result, Err(MegolmError::Withheld(WithheldCode::Unverified)));
    }

    #[tokio::test]
    async fn first_write_wins_unless_overwritten() {
        let (alice, bob) = alice_and_bob().await;
        let room_id = room_id!("!r:x");
        let alice_key = alice.curve25519_key().to_base64();

        let session_id =
            alice.create_outbound_group_session(room_id, EncryptionSettings::default()).await.unwrap();
        let (_, _, key_at_zero) = alice.get_outbound_group_session_key(room_id).await.unwrap();
        alice.encrypt_group_message(room_id, "m.dummy", json!({})).await.unwrap();
        let (_, _, key_at_one) = alice.get_outbound_group_session_key(room_id).await.unwrap();

        let ed25519 = alice.ed25519_key().to_base64();
        let add = |key: String| {
            let bob = bob.clone();
            let alice_key = alice_key.clone();
            let ed25519 = ed25519.clone();
            let session_id = session_id.clone();

            async move {
                bob.add_inbound_group_session(room_id, &alice_key, &ed25519, &session_id, &key, false)
                    .await
                    .unwrap()
            }
        };

        assert!(add(key_at_one.to_base64()).await);
        assert!(!add(key_at_zero.to_base64()).await);

        let stored = bob
            .get_inbound_group_session_key(room_id, &alice_key, &session_id, None)
            .await
            .unwrap()
            .unwrap();
        let first_index = crate::olm::InboundGroupSession::from_export(&stored)
            .unwrap()
            .first_known_index();
        assert_eq!(first_index, 1);

        // An explicit store replaces the session.
        let mut better = stored.clone();
        better.session_key = export_at_zero(&key_at_zero);
        bob.store_inbound_group_session(&better).await.unwrap();

        let stored = bob
            .get_inbound_group_session_key(room_id, &alice_key, &session_id, None)
            .await
            .unwrap()
            .unwrap();
        let first_index = crate::olm::InboundGroupSession::from_export(&stored)
            .unwrap()
            .first_known_index();
        assert_eq!(first_index, 0);
    }

    #[tokio::test]
    async fn merging_keeps_the_copy_reaching_further_back() {
        let (alice, bob) = alice_and_bob().await;
        let room_id = room_id!("!r:x");
        let alice_key = alice.curve25519_key().to_base64();

        let session_id =
            alice.create_outbound_group_session(room_id, EncryptionSettings::default()).await.unwrap();
        let (_, _, key_at_zero) = alice.get_outbound_group_session_key(room_id).await.unwrap();
        alice.encrypt_group_message(room_id, "m.dummy", json!({})).await.unwrap();
        let (_, _, key_at_one) = alice.get_outbound_group_session_key(room_id).await.unwrap();

        bob.add_inbound_group_session(
            room_id,
            &alice_key,
            &alice.ed25519_key().to_base64(),
            &session_id,
            &key_at_one.to_base64(),
            false,
        )
        .await
        .unwrap();

        let stored = bob
            .get_inbound_group_session_key(room_id, &alice_key, &session_id, None)
            .await
            .unwrap()
            .unwrap();
        let later = bob
            .get_inbound_group_session_key(room_id, &alice_key, &session_id, Some(4))
            .await
            .unwrap()
            .unwrap();

        assert!(!bob.merge_room_key(&stored).await.unwrap());
        assert!(!bob.merge_room_key(&later).await.unwrap());

        let mut better = stored.clone();
        better.session_key = export_at_zero(&key_at_zero);
        assert!(bob.merge_room_key(&better).await.unwrap());

        let stored = bob.export_inbound_group_session(&alice_key, &session_id).await.unwrap().unwrap();
        let first_index =
            crate::olm::InboundGroupSession::from_export(&stored).unwrap().first_known_index();
        assert_eq!(first_index, 0);

        // Unknown sessions are simply added.
        let other = olm_device(user_id!("@carol:localhost"), device_id!("CAROLDEVICE")).await;
        assert!(other.merge_room_key(&better).await.unwrap());
    }

    #[tokio::test]
    async fn parked_room_keys_are_taken_as_a_batch() {
        let (alice, bob) = alice_and_bob().await;
        let room_id = room_id!("!r:x");
        let alice_key = alice.curve25519_key().to_base64();

        let session_id =
            alice.create_outbound_group_session(room_id, EncryptionSettings::default()).await.unwrap();
        let (_, _, session_key) = alice.get_outbound_group_session_key(room_id).await.unwrap();

        bob.park_shared_history_session(
            alice.user_id(),
            room_id,
            &alice_key,
            &alice.ed25519_key().to_base64(),
            &session_id,
            &session_key.to_base64(),
        )
        .await
        .unwrap();

        assert_matches!(
            bob.park_shared_history_session(
                alice.user_id(),
                room_id,
                &alice_key,
                &alice.ed25519_key().to_base64(),
                "not-the-session-id",
                &session_key.to_base64(),
            )
            .await,
            Err(MegolmError::EventError(_))
        );

        // Parked keys aren't usable yet.
        assert!(!bob.has_inbound_session_keys(room_id, &alice_key, &session_id).await.unwrap());

        let parked = bob.take_parked_shared_history(room_id).await.unwrap();
        assert_matches!(&parked[..], [parked]);
        assert_eq!(parked.inviter, alice.user_id());
        assert_eq!(parked.key.session_id, session_id);
        assert!(parked.key.shared_history);

        assert!(bob.take_parked_shared_history(room_id).await.unwrap().is_empty());
    }

    #[test]
    fn replay_detection_forgets_the_oldest_indices() {
        let mut indices = super::MegolmIndices::new(2);
        let key = |index| ("SENDER".to_owned(), "SESSION".to_owned(), index);

        indices.insert(key(0), (event_id!("$0:x").to_owned(), ts(0)));
        indices.insert(key(1), (event_id!("$1:x").to_owned(), ts(1)));
        // Updating a known index doesn't count as a new entry.
        indices.insert(key(1), (event_id!("$1:x").to_owned(), ts(1)));
        assert_eq!(indices.len(), 2);
        assert!(indices.get(&key(0)).is_some());

        indices.insert(key(2), (event_id!("$2:x").to_owned(), ts(2)));
        assert_eq!(indices.len(), 2);
        assert!(indices.get(&key(0)).is_none());
        assert!(indices.get(&key(1)).is_some());
        assert!(indices.get(&key(2)).is_some());
    }

    /// Turn a session key into the export format at the same index.
    fn export_at_zero(key: &vodozemac::megolm::SessionKey) -> String {
        let mut session =
            vodozemac::megolm::InboundGroupSession::new(key, vodozemac::megolm::SessionConfig::version_1());
        session.export_at(0).unwrap().to_base64()
    }

    #[tokio::test]
    async fn exports_before_the_first_known_index_fail() {
        let (alice, bob) = alice_and_bob().await;
        let room_id = room_id!("!r:x");
        let alice_key = alice.curve25519_key().to_base64();

        let session_id =
            alice.create_outbound_group_session(room_id, EncryptionSettings::default()).await.unwrap();
        for _ in 0..3 {
            alice.encrypt_group_message(room_id, "m.dummy", json!({})).await.unwrap();
        }
        let (_, _, key) = alice.get_outbound_group_session_key(room_id).await.unwrap();

        bob.add_inbound_group_session(
            room_id,
            &alice_key,
            &alice.ed25519_key().to_base64(),
            &session_id,
            &key.to_base64(),
            false,
        )
        .await
        .unwrap();

        assert_matches!(
            bob.get_inbound_group_session_key(room_id, &alice_key, &session_id, Some(2)).await,
            Err(MegolmError::UnknownMessageIndex { first_known_index: 3, requested: 2 })
        );

        let exported = bob
            .get_inbound_group_session_key(room_id, &alice_key, &session_id, Some(5))
            .await
            .unwrap()
            .unwrap();
        let session = crate::olm::InboundGroupSession::from_export(&exported).unwrap();
        assert_eq!(session.first_known_index(), 5);

        assert!(bob.has_inbound_session_keys(room_id, &alice_key, &session_id).await.unwrap());
        assert!(!bob
            .has_inbound_session_keys(room_id!("!other:x"), &alice_key, &session_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn signature_verification_errors() {
        let alice = olm_device(user_id!("@alice:localhost"), device_id!("ALICEDEVICE")).await;
        let key = alice.ed25519_key().to_base64();
        let signature = alice.sign("message").await.unwrap().to_base64();

        OlmDevice::verify_signature(&key, "message", &signature).unwrap();

        let error = OlmDevice::verify_signature(&key, "other message", &signature).unwrap_err();
        assert_matches!(error, SignatureError::VerificationError);
        assert_eq!(error.to_string(), "OLM.BAD_MESSAGE_MAC");

        let error = OlmDevice::verify_signature("not a key", "message", &signature).unwrap_err();
        assert_eq!(error.to_string(), "OLM.INVALID_BASE64");
    }

    #[tokio::test]
    async fn fallback_keys_are_only_forgotten_when_old() {
        let alice = olm_device(user_id!("@alice:localhost"), device_id!("ALICEDEVICE")).await;

        alice.generate_fallback_key().await.unwrap();
        assert_eq!(alice.fallback_key().await.unwrap().len(), 1);

        alice.mark_keys_as_published().await.unwrap();
        alice.generate_fallback_key().await.unwrap();

        // The new fallback key is fresh, the old one stays around.
        assert!(!alice.forget_old_fallback_key(Duration::from_secs(3600)).await.unwrap());
        assert!(alice.forget_old_fallback_key(Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn keys_for_upload() {
        let alice = olm_device(user_id!("@alice:localhost"), device_id!("ALICEDEVICE")).await;
        alice.generate_one_time_keys(3).await.unwrap();

        let request = alice.keys_for_upload().await.unwrap();
        assert!(request.device_keys.is_some());
        assert_eq!(request.one_time_keys.len(), 3);

        alice.mark_keys_as_uploaded(3).await.unwrap();
        let request = alice.keys_for_upload().await.unwrap();
        assert!(request.device_keys.is_none());
        assert!(request.one_time_keys.is_empty());
        assert_eq!(alice.uploaded_key_count().await.unwrap(), 3);
    }
}
