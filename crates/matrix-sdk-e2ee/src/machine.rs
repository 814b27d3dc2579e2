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

//! The entry point of the crate, [`CryptoMachine`] wires the components
//! together and dispatches incoming events to them.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use futures_util::future::join_all;
use ruma::{
    DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, TransactionId, UserId,
};
use serde_json::Value;
use tracing::{debug, error, info, instrument, trace, warn};
use vodozemac::Ed25519SecretKey;
use zeroize::Zeroizing;

use crate::{
    algorithms::EventEncryptionAlgorithm,
    backups::{BackupDecryptionKey, BackupManager, BACKUP_SECRET_NAME},
    callbacks::{CryptoCallbacks, NoCallbacks},
    config::E2eeConfig,
    error::{
        CrossSigningError, EventError, MegolmError, MegolmResult, OlmError, OlmResult,
        SecretRequestError, SetRoomSettingsError,
    },
    gossiping::{GossipMachine, KeyRequestRecipient},
    identities::{DeviceData, DeviceListManager},
    olm::{EncryptionSettings, ExportedRoomKey, OlmDevice},
    requests::{CryptoTransport, ToDeviceMessages},
    secret_storage::{OutgoingSecretRequest, SecretSharing, SecretStorage},
    session_manager::SessionManager,
    store::{CryptoStore, Store},
    types::{
        events::{
            EncryptedContent, EncryptedRoomEvent, ForwardedRoomKeyContent, MegolmV1Content,
            OlmPayload, OlmV1Content, RequestedKeyInfo, RoomEvent, RoomKeyContent,
            RoomKeyWithheldContent, SecretRequestContent, SecretSendContent, ToDeviceEvent,
            WithheldCode,
        },
        KeyUsage,
    },
    verification::{VerificationContext, VerificationDone, VerificationMachine},
};

const ENCRYPTED: &str = "m.room.encrypted";
const ROOM_KEY: &str = "m.room_key";
const FORWARDED_ROOM_KEY: &str = "m.forwarded_room_key";
const ROOM_KEY_WITHHELD: &str = "m.room_key.withheld";
const ROOM_KEY_REQUEST: &str = "m.room_key_request";
const SECRET_REQUEST: &str = "m.secret.request";
const SECRET_SEND: &str = "m.secret.send";
const DUMMY: &str = "m.dummy";
const VERIFICATION_PREFIX: &str = "m.key.verification.";

/// How long newly received room keys may wait before they're backed up.
const KEY_BACKUP_DELAY: Duration = Duration::from_secs(10);

/// A decrypted room event together with the information about its sender.
#[derive(Clone, Debug)]
pub struct DecryptedRoomEvent {
    /// The event in the clear.
    pub event: RoomEvent,
    /// The Curve25519 key of the device that created the room key.
    pub sender_key: String,
    /// The Ed25519 key the creator of the room key claims to own.
    pub sender_claimed_ed25519_key: Option<String>,
    /// The keys of the devices that forwarded the room key to us.
    pub forwarding_curve25519_key_chain: Vec<String>,
    /// The device that sent the event, if we know it.
    pub sender_device: Option<OwnedDeviceId>,
    /// Was the event sent by a verified device over a room key we received
    /// directly from it.
    pub verified: bool,
}

/// A decrypted to-device event.
#[derive(Clone, Debug)]
pub struct DecryptedToDeviceEvent {
    /// The sender of the event.
    pub sender: OwnedUserId,
    /// The Curve25519 key of the Olm session the event was decrypted with.
    pub sender_key: String,
    /// The device that sent the event, if we know it.
    pub sender_device: Option<OwnedDeviceId>,
    /// The type of the decrypted event.
    pub event_type: String,
    /// The content of the decrypted event.
    pub content: Value,
}

/// The secrets we received after asking one of our devices for them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceivedSecrets {
    /// The private cross-signing keys that arrived and matched our identity.
    pub cross_signing_keys: Vec<KeyUsage>,
    /// Did the backup decryption key arrive.
    pub backup_key: bool,
}

/// Secret requests that went out and wait for an answer.
#[derive(Debug)]
pub struct PendingSecrets {
    machine: CryptoMachine,
    cross_signing: Vec<(KeyUsage, OutgoingSecretRequest)>,
    backup: Option<OutgoingSecretRequest>,
}

impl PendingSecrets {
    /// Did we request anything at all.
    pub fn is_empty(&self) -> bool {
        self.cross_signing.is_empty() && self.backup.is_none()
    }

    /// Wait for the answers and store what arrives.
    ///
    /// Every request waits at most for the configured secret request timeout,
    /// requests that time out or fail are logged and skipped.
    pub async fn receive(self) -> ReceivedSecrets {
        let Self { machine, cross_signing, backup } = self;
        let timeout = machine.inner.config.secret_request_timeout;

        let waits = cross_signing.into_iter().map(|(usage, request)| async move {
            (usage, request.wait_with_timeout(timeout).await)
        });

        let mut received = ReceivedSecrets::default();
        let mut keys = BTreeMap::new();

        for (usage, result) in join_all(waits).await {
            match result.map_err(ReceiveError::Request).and_then(|secret| {
                machine.check_cross_signing_secret(usage, &secret).map_err(ReceiveError::Key)
            }) {
                Ok(key) => {
                    keys.insert(usage, key);
                }
                Err(e) => warn!(?usage, "Didn't receive a private cross-signing key: {e}"),
            }
        }

        if !keys.is_empty() {
            let usages: Vec<_> = keys.keys().copied().collect();

            match machine.inner.callbacks.save_cross_signing_keys(keys).await {
                Ok(()) => received.cross_signing_keys = usages,
                Err(e) => warn!("Failed to save the received private cross-signing keys: {e}"),
            }
        }

        if let Some(request) = backup {
            received.backup_key = machine.receive_backup_key(request, timeout).await;
        }

        info!(?received, "Finished waiting for requested secrets");

        received
    }
}

#[derive(Debug, thiserror::Error)]
enum ReceiveError {
    #[error(transparent)]
    Request(SecretRequestError),
    #[error(transparent)]
    Key(CrossSigningError),
}

/// The end-to-end encryption state machine of a single device.
///
/// The machine is cheap to clone, all clones share the same state.
#[derive(Clone)]
pub struct CryptoMachine {
    inner: Arc<CryptoMachineInner>,
}

struct CryptoMachineInner {
    olm: OlmDevice,
    devices: DeviceListManager,
    sessions: SessionManager,
    secret_storage: SecretStorage,
    secret_sharing: SecretSharing,
    backups: BackupManager,
    gossiping: GossipMachine,
    verification: VerificationMachine,
    transport: Arc<dyn CryptoTransport>,
    callbacks: Arc<dyn CryptoCallbacks>,
    config: E2eeConfig,
    /// Rooms we were invited to with shared history, and who invited us.
    history_invites: StdMutex<BTreeMap<OwnedRoomId, OwnedUserId>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for CryptoMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoMachine")
            .field("user_id", &self.user_id())
            .field("device_id", &self.device_id())
            .finish_non_exhaustive()
    }
}

impl CryptoMachine {
    /// Create a new machine, loading our account and device lists from the
    /// given store or creating a fresh account if the store is empty.
    ///
    /// # Arguments
    ///
    /// * `pickle_key` - The key every pickled Olm object in the store is
    ///   encrypted with.
    ///
    /// * `callbacks` - The application hooks for private key material, all
    ///   of them are treated as unconfigured if `None` is given.
    #[instrument(skip(store, pickle_key, transport, callbacks, config))]
    pub async fn new(
        user_id: &UserId,
        device_id: &DeviceId,
        store: Arc<dyn CryptoStore>,
        pickle_key: Zeroizing<[u8; 32]>,
        transport: Arc<dyn CryptoTransport>,
        callbacks: Option<Arc<dyn CryptoCallbacks>>,
        config: E2eeConfig,
    ) -> OlmResult<Self> {
        let store = Store::new(store);
        let callbacks = callbacks.unwrap_or_else(|| Arc::new(NoCallbacks));

        let olm = OlmDevice::init(user_id, device_id, store.clone(), pickle_key, None).await?;
        let devices = DeviceListManager::load(
            user_id.to_owned(),
            device_id.to_owned(),
            store.clone(),
            transport.clone(),
            config.clone(),
        )
        .await?;

        let sessions = SessionManager::new(olm.clone(), transport.clone(), config.clone());
        let secret_storage = SecretStorage::new(transport.clone(), callbacks.clone());
        let secret_sharing = SecretSharing::new(
            devices.clone(),
            sessions.clone(),
            transport.clone(),
            callbacks.clone(),
        );
        let backups =
            BackupManager::new(olm.clone(), devices.clone(), transport.clone(), config.clone());
        let gossiping =
            GossipMachine::new(user_id.to_owned(), device_id.to_owned(), store, transport.clone());
        let verification = VerificationMachine::new(VerificationContext {
            olm: olm.clone(),
            devices: devices.clone(),
            transport: transport.clone(),
            callbacks: callbacks.clone(),
            config: config.clone(),
        });

        info!(ed25519_key = %olm.ed25519_key(), "Crypto machine ready");

        Ok(Self {
            inner: Arc::new(CryptoMachineInner {
                olm,
                devices,
                sessions,
                secret_storage,
                secret_sharing,
                backups,
                gossiping,
                verification,
                transport,
                callbacks,
                config,
                history_invites: Default::default(),
            }),
        })
    }

    /// Our own user id.
    pub fn user_id(&self) -> &UserId {
        self.inner.olm.user_id()
    }

    /// Our own device id.
    pub fn device_id(&self) -> &DeviceId {
        self.inner.olm.device_id()
    }

    /// The Olm account and sessions of this device.
    pub fn olm(&self) -> &OlmDevice {
        &self.inner.olm
    }

    /// The device lists of the users we track.
    pub fn devices(&self) -> &DeviceListManager {
        &self.inner.devices
    }

    /// The Olm session management for encrypted to-device messages.
    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// The server-side secret storage.
    pub fn secret_storage(&self) -> &SecretStorage {
        &self.inner.secret_storage
    }

    /// Secret sharing between our own devices.
    pub fn secret_sharing(&self) -> &SecretSharing {
        &self.inner.secret_sharing
    }

    /// The server-side room key backup.
    pub fn backups(&self) -> &BackupManager {
        &self.inner.backups
    }

    /// Interactive verification.
    pub fn verification(&self) -> &VerificationMachine {
        &self.inner.verification
    }

    /// The configuration the machine was created with.
    pub fn config(&self) -> &E2eeConfig {
        &self.inner.config
    }

    /// Encrypt a room event with the current outbound group session of the
    /// room.
    ///
    /// [`CryptoMachine::share_room_key()`] has to be called first, it makes
    /// sure a session exists and that the members of the room have it.
    ///
    /// Returns the `m.room.encrypted` content.
    pub async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> OlmResult<Value> {
        if self.inner.olm.outbound_group_session_id(room_id).await?.is_none() {
            return Err(OlmError::MissingOutboundGroupSession(room_id.to_string()));
        }

        let content = self.inner.olm.encrypt_group_message(room_id, event_type, content).await?;
        trace!(?room_id, session_id = content.session_id, "Encrypted a room event");

        Ok(EncryptedContent::MegolmV1(content).to_json()?)
    }

    /// The encryption settings of the room, the defaults if none were set.
    pub async fn room_settings(&self, room_id: &RoomId) -> OlmResult<EncryptionSettings> {
        Ok(self.inner.olm.store().get_room_settings(room_id).await?.unwrap_or_default())
    }

    /// Persist new encryption settings for the room.
    ///
    /// If the settings differ from the current ones, the outbound group
    /// session of the room is invalidated and the next
    /// [`CryptoMachine::share_room_key()`] call creates one with the new
    /// settings. Once a room only shares its keys with trusted devices it
    /// can't go back.
    #[instrument(skip(self, settings))]
    pub async fn set_room_settings(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> Result<(), SetRoomSettingsError> {
        if settings.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            warn!(algorithm = %settings.algorithm, "Rejecting an invalid room encryption algorithm");
            return Err(SetRoomSettingsError::InvalidSettings);
        }

        let olm = &self.inner.olm;
        let mut transaction = olm.store().transaction().await;

        let previous = transaction.store().get_room_settings(room_id).await?.unwrap_or_default();
        if previous == settings {
            return Ok(());
        }

        if previous.only_allow_trusted_devices && !settings.only_allow_trusted_devices {
            return Err(SetRoomSettingsError::EncryptionDowngrade);
        }

        transaction.changes().room_settings.insert(room_id.to_owned(), settings);
        transaction.commit().await?;

        if olm.invalidate_outbound_group_session(room_id).await? {
            info!("The encryption settings changed, the room key will be rotated");
        }

        Ok(())
    }

    /// Make sure all the devices of the given users have the current room
    /// key of the room.
    ///
    /// A new outbound group session is created if the room has none or the
    /// current one needs to be rotated. Devices that shouldn't or can't get
    /// the key are told so with an `m.room_key.withheld` event.
    ///
    /// Returns the number of devices the key was sent to.
    #[instrument(skip(self, users), fields(user_count = users.len()))]
    pub async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: &[OwnedUserId],
    ) -> OlmResult<usize> {
        let olm = &self.inner.olm;
        let settings = olm.store().get_room_settings(room_id).await?.unwrap_or_default();

        if olm.outbound_group_session_id(room_id).await?.is_none() {
            let session_id = olm.create_outbound_group_session(room_id, settings.clone()).await?;
            let (_, _, session_key) = olm.get_outbound_group_session_key(room_id).await?;

            // Our own inbound copy, so we can read our own messages.
            olm.add_inbound_group_session(
                room_id,
                &olm.curve25519_key().to_base64(),
                &olm.ed25519_key().to_base64(),
                &session_id,
                &session_key.to_base64(),
                settings.shared_history,
            )
            .await
            .map_err(|e| match e {
                MegolmError::Store(e) => OlmError::Store(e),
                e => OlmError::OwnRoomKey(Box::new(e)),
            })?;
        }

        let (session_id, message_index, session_key) =
            olm.get_outbound_group_session_key(room_id).await?;

        let mut recipients = Vec::new();
        let mut withheld: Vec<(DeviceData, WithheldCode)> = Vec::new();
        let users: BTreeSet<&OwnedUserId> = users.iter().collect();

        for user_id in users {
            for device in self.inner.devices.user_devices(user_id).into_values() {
                if user_id == self.user_id() && device.device_id() == self.device_id() {
                    continue;
                }

                if olm
                    .outbound_group_session_shared_with(room_id, user_id, device.device_id())
                    .await?
                    .is_some()
                {
                    continue;
                }

                if device.is_blocked() {
                    withheld.push((device, WithheldCode::Blacklisted));
                    continue;
                }

                if settings.only_allow_trusted_devices
                    && !self
                        .inner
                        .devices
                        .get_device_trust(user_id, device.device_id())
                        .is_some_and(|t| t.is_verified())
                {
                    withheld.push((device, WithheldCode::Unverified));
                    continue;
                }

                recipients.push(device);
            }
        }

        let content = serde_json::to_value(RoomKeyContent {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: room_id.to_owned(),
            session_id: session_id.clone(),
            session_key: session_key.to_base64(),
            shared_history: settings.shared_history,
        })?;

        let messages =
            self.inner.sessions.encrypt_to_devices(ROOM_KEY, &content, &recipients).await?;

        let mut shared_with = Vec::new();

        for device in recipients {
            let sent = messages
                .get(device.user_id())
                .is_some_and(|d| d.contains_key(device.device_id().as_str()));

            if sent {
                shared_with.push((device.user_id().to_owned(), device.device_id().to_owned()));
            } else {
                withheld.push((device, WithheldCode::NoOlm));
            }
        }

        if !shared_with.is_empty() {
            self.inner.transport.send_to_device(ENCRYPTED, &TransactionId::new(), messages).await?;
            olm.mark_outbound_group_session_shared_with(room_id, shared_with.clone(), message_index)
                .await?;
        }

        if !withheld.is_empty() {
            self.send_withheld(room_id, &session_id, withheld).await?;
        }

        info!(session_id, device_count = shared_with.len(), "Shared a room key");

        Ok(shared_with.len())
    }

    async fn send_withheld(
        &self,
        room_id: &RoomId,
        session_id: &str,
        devices: Vec<(DeviceData, WithheldCode)>,
    ) -> OlmResult<()> {
        let sender_key = self.inner.olm.curve25519_key().to_base64();
        let mut messages = ToDeviceMessages::new();

        for (device, code) in devices {
            debug!(
                user_id = ?device.user_id(),
                device_id = ?device.device_id(),
                %code,
                "Withholding a room key"
            );

            // The no_olm code is about the device and not about the session.
            let (room_id, session_id) = match code {
                WithheldCode::NoOlm => (None, None),
                _ => (Some(room_id.to_owned()), Some(session_id.to_owned())),
            };

            let content = RoomKeyWithheldContent {
                algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
                reason: None,
                code,
                room_id,
                session_id,
                sender_key: sender_key.clone(),
            };

            messages
                .entry(device.user_id().to_owned())
                .or_default()
                .insert(device.device_id().to_string(), serde_json::to_value(content)?);
        }

        self.inner
            .transport
            .send_to_device(ROOM_KEY_WITHHELD, &TransactionId::new(), messages)
            .await?;

        Ok(())
    }

    /// Decrypt an `m.room.encrypted` room event.
    ///
    /// If we don't have the room key yet it's requested from our other
    /// devices and the sender, and [`MegolmError::MissingRoomKey`] is
    /// returned. Decrypted verification events are fed into the verification
    /// machine.
    #[instrument(skip_all, fields(room_id = ?event.room_id, event_id = ?event.event_id))]
    pub async fn decrypt_room_event(
        &self,
        event: &EncryptedRoomEvent,
    ) -> MegolmResult<DecryptedRoomEvent> {
        let content = match EncryptedContent::from_json(&event.content)? {
            EncryptedContent::MegolmV1(content) => content,
            other => {
                return Err(EventError::UnsupportedAlgorithm(other.algorithm().to_string()).into())
            }
        };

        let sender_key = self.megolm_sender_key(event, &content)?;

        let decrypted = match self
            .inner
            .olm
            .decrypt_group_message(
                &event.room_id,
                &sender_key,
                &content.session_id,
                &content.ciphertext,
                &event.event_id,
                event.origin_server_ts,
            )
            .await?
        {
            Some(decrypted) => decrypted,
            None => {
                self.request_missing_room_key(event, &content, &sender_key).await;
                return Err(MegolmError::MissingRoomKey(None));
            }
        };

        let event_type = decrypted
            .event
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::MissingField("type".to_owned()))?
            .to_owned();
        let event_content = decrypted
            .event
            .get("content")
            .cloned()
            .ok_or_else(|| EventError::MissingField("content".to_owned()))?;

        let room_event = RoomEvent {
            sender: event.sender.clone(),
            event_id: event.event_id.clone(),
            room_id: event.room_id.clone(),
            origin_server_ts: event.origin_server_ts,
            event_type,
            content: event_content,
        };

        let (sender_device, verified) = self.sender_verification(
            &event.sender,
            &decrypted.sender_key,
            decrypted.sender_claimed_ed25519_key.as_deref(),
            decrypted.untrusted,
        );

        self.receive_room_event(&room_event).await;

        Ok(DecryptedRoomEvent {
            event: room_event,
            sender_key: decrypted.sender_key,
            sender_claimed_ed25519_key: decrypted.sender_claimed_ed25519_key,
            forwarding_curve25519_key_chain: decrypted.forwarding_curve25519_key_chain,
            sender_device,
            verified,
        })
    }

    /// The Curve25519 key of the session creator, newer clients only send the
    /// device id.
    fn megolm_sender_key(
        &self,
        event: &EncryptedRoomEvent,
        content: &MegolmV1Content,
    ) -> Result<String, EventError> {
        if let Some(sender_key) = &content.sender_key {
            return Ok(sender_key.clone());
        }

        content
            .device_id
            .as_deref()
            .and_then(|device_id| self.inner.devices.get_device(&event.sender, device_id))
            .and_then(|device| device.curve25519_key())
            .map(|key| key.to_base64())
            .ok_or_else(|| EventError::MissingField("sender_key".to_owned()))
    }

    async fn request_missing_room_key(
        &self,
        event: &EncryptedRoomEvent,
        content: &MegolmV1Content,
        sender_key: &str,
    ) {
        let info = RequestedKeyInfo {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: event.room_id.clone(),
            sender_key: sender_key.to_owned(),
            session_id: content.session_id.clone(),
        };

        let mut recipients = vec![KeyRequestRecipient::all_devices(self.user_id().to_owned())];

        if event.sender != self.user_id() {
            recipients.push(KeyRequestRecipient {
                user_id: event.sender.clone(),
                device_id: content.device_id.clone(),
            });
        }

        match self.inner.gossiping.queue_room_key_request(info, recipients, false).await {
            Ok(request) => {
                debug!(request_id = ?request.request_id, "Queued a request for a missing room key")
            }
            Err(e) => warn!("Failed to queue a request for a missing room key: {e}"),
        }
    }

    /// Figure out which device sent a message and whether we trust it.
    fn sender_verification(
        &self,
        sender: &UserId,
        sender_key: &str,
        claimed_ed25519_key: Option<&str>,
        untrusted: bool,
    ) -> (Option<OwnedDeviceId>, bool) {
        let olm = &self.inner.olm;

        if sender == self.user_id() && sender_key == olm.curve25519_key().to_base64() {
            let claimed_ours = claimed_ed25519_key == Some(olm.ed25519_key().to_base64().as_str());
            return (Some(self.device_id().to_owned()), claimed_ours && !untrusted);
        }

        let Some(device) = self
            .inner
            .devices
            .device_by_curve25519_key(sender_key)
            .filter(|d| d.user_id() == sender)
        else {
            return (None, false);
        };

        let keys_match = device
            .ed25519_key()
            .is_some_and(|key| claimed_ed25519_key == Some(key.to_base64().as_str()));
        let trusted = self
            .inner
            .devices
            .get_device_trust(sender, device.device_id())
            .is_some_and(|t| t.is_verified());

        (Some(device.device_id().to_owned()), keys_match && trusted && !untrusted)
    }

    /// Feed an unencrypted room event into the machine.
    ///
    /// Only in-room verification events are of interest, everything else is
    /// ignored.
    pub async fn receive_room_event(&self, event: &RoomEvent) {
        match self.inner.verification.receive_room_event(event).await {
            Ok(Some(done)) => self.verification_done(done).await,
            Ok(None) => {}
            Err(e) => {
                error!(event_id = ?event.event_id, "Error handling a verification event: {e}")
            }
        }
    }

    /// Handle a to-device event we received from the sync loop.
    ///
    /// Olm encrypted events are decrypted and their contents dispatched, the
    /// decrypted event is returned to the caller. Unencrypted events are
    /// handled in place and `None` is returned.
    #[instrument(skip_all, fields(sender = ?event.sender, event_type = event.event_type))]
    pub async fn receive_to_device_event(
        &self,
        event: &ToDeviceEvent,
    ) -> OlmResult<Option<DecryptedToDeviceEvent>> {
        match event.event_type.as_str() {
            ENCRYPTED => {
                let decrypted = self.decrypt_to_device_event(event).await?;
                self.handle_decrypted_event(&decrypted).await?;
                Ok(Some(decrypted))
            }
            ROOM_KEY_WITHHELD => {
                let content: RoomKeyWithheldContent =
                    serde_json::from_value(event.content.clone())?;
                self.inner.olm.add_inbound_group_session_withheld(content).await?;
                Ok(None)
            }
            SECRET_REQUEST => {
                let content: SecretRequestContent = serde_json::from_value(event.content.clone())?;
                self.inner.secret_sharing.on_request_received(&event.sender, content).await?;
                Ok(None)
            }
            ROOM_KEY_REQUEST => {
                debug!("Ignoring a room key request, keys are only shared by the sender");
                Ok(None)
            }
            t if t.starts_with(VERIFICATION_PREFIX) => {
                self.handle_verification_event(event).await;
                Ok(None)
            }
            _ => {
                trace!("Ignoring an unknown to-device event");
                Ok(None)
            }
        }
    }

    async fn decrypt_to_device_event(
        &self,
        event: &ToDeviceEvent,
    ) -> OlmResult<DecryptedToDeviceEvent> {
        let content: OlmV1Content = match EncryptedContent::from_json(&event.content)? {
            EncryptedContent::OlmV1(content) => content,
            other => {
                return Err(EventError::UnsupportedAlgorithm(other.algorithm().to_string()).into())
            }
        };

        let own_key = self.inner.olm.curve25519_key().to_base64();
        let ciphertext = content.ciphertext.get(&own_key).ok_or(EventError::MissingCiphertext)?;

        let decrypted = self.inner.olm.decrypt_olm_event(&content.sender_key, ciphertext).await?;
        let payload: OlmPayload = serde_json::from_str(&decrypted.plaintext)?;

        if payload.sender != event.sender {
            return Err(EventError::MismatchedSender(payload.sender, event.sender.clone()).into());
        }

        if payload.recipient != self.user_id() {
            return Err(EventError::MismatchedRecipient(payload.recipient).into());
        }

        if payload.recipient_keys.ed25519 != self.inner.olm.ed25519_key().to_base64() {
            return Err(EventError::MismatchedKeys.into());
        }

        let sender_device = self
            .inner
            .devices
            .device_by_curve25519_key(&content.sender_key)
            .filter(|d| d.user_id() == event.sender);

        if let Some(device) = &sender_device {
            if device.ed25519_key().map(|k| k.to_base64()).as_deref()
                != Some(payload.keys.ed25519.as_str())
            {
                warn!(
                    device_id = ?device.device_id(),
                    "The Ed25519 key of an Olm payload doesn't match the sending device"
                );
                return Err(EventError::MismatchedKeys.into());
            }
        }

        debug!(
            session_id = decrypted.session_id,
            event_type = payload.event_type,
            "Decrypted a to-device event"
        );

        Ok(DecryptedToDeviceEvent {
            sender: payload.sender,
            sender_key: content.sender_key,
            sender_device: sender_device.map(|d| d.device_id().to_owned()),
            event_type: payload.event_type,
            content: payload.content,
        })
    }

    async fn handle_decrypted_event(&self, decrypted: &DecryptedToDeviceEvent) -> OlmResult<()> {
        match decrypted.event_type.as_str() {
            ROOM_KEY => self.receive_room_key(decrypted).await,
            FORWARDED_ROOM_KEY => self.receive_forwarded_room_key(decrypted).await,
            SECRET_SEND => {
                let content: SecretSendContent = serde_json::from_value(decrypted.content.clone())?;
                self.inner
                    .secret_sharing
                    .on_secret_received(&decrypted.sender, &decrypted.sender_key, content)
                    .await;
                Ok(())
            }
            DUMMY => {
                debug!("Received an m.dummy event");
                Ok(())
            }
            t if t.starts_with(VERIFICATION_PREFIX) => {
                let event = ToDeviceEvent::new(
                    decrypted.sender.clone(),
                    t,
                    decrypted.content.clone(),
                );
                self.handle_verification_event(&event).await;
                Ok(())
            }
            _ => {
                warn!(
                    event_type = decrypted.event_type,
                    "Received an unexpected encrypted to-device event"
                );
                Ok(())
            }
        }
    }

    async fn receive_room_key(&self, decrypted: &DecryptedToDeviceEvent) -> OlmResult<()> {
        let content: RoomKeyContent = serde_json::from_value(decrypted.content.clone())?;

        if content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            warn!(
                algorithm = %content.algorithm,
                "Received a room key with an unsupported algorithm"
            );
            return Ok(());
        }

        let Some(claimed_key) = self.claimed_ed25519_key(decrypted) else {
            warn!("Received a room key from a device we don't know");
            return Ok(());
        };

        let invited_by_sender = content.shared_history
            && self
                .inner
                .history_invites
                .lock()
                .unwrap()
                .get(&content.room_id)
                .is_some_and(|inviter| *inviter == decrypted.sender);

        if invited_by_sender {
            return match self
                .inner
                .olm
                .park_shared_history_session(
                    &decrypted.sender,
                    &content.room_id,
                    &decrypted.sender_key,
                    &claimed_key,
                    &content.session_id,
                    &content.session_key,
                )
                .await
            {
                Ok(()) => Ok(()),
                Err(MegolmError::Store(e)) => Err(e.into()),
                Err(e) => {
                    warn!(session_id = content.session_id, "Received an invalid room key: {e}");
                    Ok(())
                }
            };
        }

        let added = match self
            .inner
            .olm
            .add_inbound_group_session(
                &content.room_id,
                &decrypted.sender_key,
                &claimed_key,
                &content.session_id,
                &content.session_key,
                content.shared_history,
            )
            .await
        {
            Ok(added) => added,
            Err(MegolmError::Store(e)) => return Err(e.into()),
            Err(e) => {
                warn!(session_id = content.session_id, "Received an invalid room key: {e}");
                return Ok(());
            }
        };

        if added {
            info!(
                room_id = ?content.room_id,
                session_id = content.session_id,
                "Received a new room key"
            );
            self.room_key_arrived(&content.room_id, &decrypted.sender_key, &content.session_id)
                .await;
        }

        Ok(())
    }

    /// The Ed25519 key the sender of an Olm event claims, taken from the
    /// device we know.
    fn claimed_ed25519_key(&self, decrypted: &DecryptedToDeviceEvent) -> Option<String> {
        let device_id = decrypted.sender_device.as_deref()?;
        let device = self.inner.devices.get_device(&decrypted.sender, device_id)?;

        Some(device.ed25519_key()?.to_base64())
    }

    /// Only keys we asked for, sent by one of our own verified devices, are
    /// accepted.
    async fn receive_forwarded_room_key(
        &self,
        decrypted: &DecryptedToDeviceEvent,
    ) -> OlmResult<()> {
        let content: ForwardedRoomKeyContent = serde_json::from_value(decrypted.content.clone())?;

        let from_verified_own_device = decrypted.sender == self.user_id()
            && decrypted.sender_device.as_deref().is_some_and(|device_id| {
                self.inner
                    .devices
                    .get_device_trust(&decrypted.sender, device_id)
                    .is_some_and(|t| t.is_verified())
            });

        if !from_verified_own_device {
            warn!(
                session_id = content.session_id,
                "Ignoring a forwarded room key from an untrusted device"
            );
            return Ok(());
        }

        let info = RequestedKeyInfo {
            algorithm: content.algorithm.clone(),
            room_id: content.room_id.clone(),
            sender_key: content.sender_key.clone(),
            session_id: content.session_id.clone(),
        };

        if self.inner.olm.store().get_outgoing_key_request_by_info(&info).await?.is_none() {
            warn!(
                session_id = content.session_id,
                "Ignoring a forwarded room key we didn't ask for"
            );
            return Ok(());
        }

        let mut forwarding_chain = content.forwarding_curve25519_key_chain;
        forwarding_chain.push(decrypted.sender_key.clone());

        let key = ExportedRoomKey {
            algorithm: content.algorithm,
            room_id: content.room_id,
            sender_key: content.sender_key,
            session_id: content.session_id,
            session_key: content.session_key,
            sender_claimed_keys: BTreeMap::from([(
                "ed25519".to_owned(),
                content.sender_claimed_ed25519_key,
            )]),
            forwarding_curve25519_key_chain: forwarding_chain,
            shared_history: content.shared_history,
        };

        match self.inner.olm.merge_room_key(&key).await {
            Ok(true) => {
                info!(session_id = key.session_id, "Received a forwarded room key");
                self.room_key_arrived(&key.room_id, &key.sender_key, &key.session_id).await;
            }
            Ok(false) => {}
            Err(MegolmError::Store(e)) => return Err(e.into()),
            Err(e) => {
                warn!(session_id = key.session_id, "Received an invalid forwarded room key: {e}")
            }
        }

        Ok(())
    }

    /// Remember that `inviter` invited us to the room and shares its history
    /// with us.
    ///
    /// Until the invite is accepted or rejected, shared-history room keys the
    /// inviter sends us for the room are parked instead of imported.
    pub fn add_history_sharing_invite(&self, room_id: &RoomId, inviter: &UserId) {
        debug!(?room_id, ?inviter, "Waiting for a history-sharing invite to be accepted");
        self.inner.history_invites.lock().unwrap().insert(room_id.to_owned(), inviter.to_owned());
    }

    /// Accept the history-sharing invite of the room, importing all the room
    /// keys that were parked for it.
    ///
    /// Returns the number of keys that were imported.
    #[instrument(skip(self))]
    pub async fn accept_history_sharing_invite(&self, room_id: &RoomId) -> OlmResult<usize> {
        self.inner.history_invites.lock().unwrap().remove(room_id);

        let parked = self.inner.olm.take_parked_shared_history(room_id).await?;
        let mut imported = 0;

        for entry in &parked {
            let key = &entry.key;

            match self.inner.olm.merge_room_key(key).await {
                Ok(true) => {
                    imported += 1;
                    self.room_key_arrived(&key.room_id, &key.sender_key, &key.session_id).await;
                }
                Ok(false) => {}
                Err(MegolmError::Store(e)) => return Err(e.into()),
                Err(e) => {
                    warn!(session_id = key.session_id, "Failed to import a parked room key: {e}")
                }
            }
        }

        info!(parked = parked.len(), imported, "Accepted a history-sharing invite");

        Ok(imported)
    }

    /// Reject the history-sharing invite of the room, dropping all the room
    /// keys that were parked for it.
    ///
    /// Returns the number of dropped keys.
    #[instrument(skip(self))]
    pub async fn reject_history_sharing_invite(&self, room_id: &RoomId) -> OlmResult<usize> {
        self.inner.history_invites.lock().unwrap().remove(room_id);
        let dropped = self.inner.olm.take_parked_shared_history(room_id).await?.len();

        debug!(dropped, "Rejected a history-sharing invite");

        Ok(dropped)
    }

    /// Cancel outstanding requests for the key and back it up.
    async fn room_key_arrived(&self, room_id: &RoomId, sender_key: &str, session_id: &str) {
        let info = RequestedKeyInfo {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: room_id.to_owned(),
            sender_key: sender_key.to_owned(),
            session_id: session_id.to_owned(),
        };

        if let Err(e) = self.inner.gossiping.cancel_room_key_request(&info).await {
            warn!(session_id, "Failed to cancel a room key request: {e}");
        }

        if self.inner.backups.is_enabled() {
            self.inner.backups.schedule_key_backup_send(KEY_BACKUP_DELAY);
        }
    }

    /// Queue a request for a room key, it is sent out with the next call to
    /// [`CryptoMachine::send_queued_room_key_requests()`].
    pub async fn request_room_key(
        &self,
        info: RequestedKeyInfo,
        recipients: Vec<KeyRequestRecipient>,
        resend: bool,
    ) -> OlmResult<()> {
        self.inner.gossiping.queue_room_key_request(info, recipients, resend).await?;
        Ok(())
    }

    /// Send out the queued room key requests and cancellations.
    pub async fn send_queued_room_key_requests(&self) -> OlmResult<()> {
        self.inner.gossiping.send_queued_requests().await
    }

    async fn handle_verification_event(&self, event: &ToDeviceEvent) {
        match self.inner.verification.receive_to_device_event(event).await {
            Ok(Some(done)) => self.verification_done(done).await,
            Ok(None) => {}
            Err(e) => error!("Error handling a verification event: {e}"),
        }
    }

    /// After verifying one of our own devices, ask it for the secrets we
    /// are missing.
    async fn verification_done(&self, done: VerificationDone) {
        if !done.self_verification {
            return;
        }

        match self.request_secrets_from_device(&done.device_id).await {
            Ok(pending) if pending.is_empty() => {
                debug!("We already have all the secrets the verified device could share");
            }
            Ok(pending) => {
                tokio::spawn(pending.receive());
            }
            Err(e) => warn!(device_id = ?done.device_id, "Failed to request secrets: {e}"),
        }
    }

    /// Ask one of our own devices for the private cross-signing keys and the
    /// backup decryption key.
    ///
    /// Only secrets we don't have yet are requested. Failing to request the
    /// backup key is logged and otherwise ignored.
    #[instrument(skip(self))]
    pub async fn request_secrets_from_device(
        &self,
        device_id: &DeviceId,
    ) -> Result<PendingSecrets, SecretRequestError> {
        let devices: &[OwnedDeviceId] = &[device_id.to_owned()];
        let identity = self.inner.devices.own_identity();
        let mut cross_signing = Vec::new();

        for usage in [KeyUsage::Master, KeyUsage::SelfSigning, KeyUsage::UserSigning] {
            let Some(public_key) = identity
                .as_ref()
                .and_then(|i| i.get_key(usage))
                .and_then(|k| k.public_key_base64())
            else {
                continue;
            };

            if self.inner.callbacks.get_cross_signing_key(usage, public_key).await.is_some() {
                continue;
            }

            let request =
                self.inner.secret_sharing.request(usage.secret_name(), Some(devices)).await?;
            cross_signing.push((usage, request));
        }

        let backup = match self.inner.backups.stored_decryption_key().await {
            Ok(Some(_)) => None,
            Ok(None) | Err(_) => {
                match self.inner.secret_sharing.request(BACKUP_SECRET_NAME, Some(devices)).await {
                    Ok(request) => Some(request),
                    Err(e) => {
                        warn!("Failed to request the backup decryption key: {e}");
                        None
                    }
                }
            }
        };

        Ok(PendingSecrets { machine: self.clone(), cross_signing, backup })
    }

    fn check_cross_signing_secret(
        &self,
        usage: KeyUsage,
        secret: &str,
    ) -> Result<Ed25519SecretKey, CrossSigningError> {
        let key = Ed25519SecretKey::from_base64(secret)?;
        let identity = self.inner.devices.own_identity();
        let expected =
            identity.as_ref().and_then(|i| i.get_key(usage)).and_then(|k| k.public_key_base64());

        if expected != Some(key.public_key().to_base64().as_str()) {
            return Err(CrossSigningError::PublicKeyMismatch(usage));
        }

        Ok(key)
    }

    async fn receive_backup_key(&self, request: OutgoingSecretRequest, timeout: Duration) -> bool {
        let secret = match request.wait_with_timeout(timeout).await {
            Ok(secret) => secret,
            Err(e) => {
                warn!("Didn't receive the backup decryption key: {e}");
                return false;
            }
        };

        let key = match BackupDecryptionKey::from_base64(&secret) {
            Ok(key) => key,
            Err(e) => {
                warn!("Received an invalid backup decryption key: {e}");
                return false;
            }
        };

        match self.inner.backups.save_decryption_key(key).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to store the backup decryption key: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{atomic::Ordering, Arc},
        time::Duration,
    };

    use assert_matches2::assert_matches;
    use ruma::{
        device_id, event_id, room_id, user_id, DeviceId, MilliSecondsSinceUnixEpoch, OwnedUserId,
        UserId,
    };
    use serde_json::json;
    use zeroize::Zeroizing;

    use super::{CryptoMachine, DecryptedToDeviceEvent};
    use crate::{
        callbacks::CryptoCallbacks,
        config::E2eeConfig,
        algorithms::EventEncryptionAlgorithm,
        error::{MegolmError, SetRoomSettingsError},
        identities::{CrossSigningInfo, CrossSigningLevel, DeviceData, LocalTrust},
        olm::EncryptionSettings,
        requests::KeysClaimResponse,
        store::MemoryStore,
        testing::{MockTransport, TestCallbacks},
        types::{events::EncryptedRoomEvent, KeyUsage},
    };

    struct TestMachine {
        machine: CryptoMachine,
        transport: Arc<MockTransport>,
        callbacks: Arc<TestCallbacks>,
    }

    impl TestMachine {
        async fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
            let transport = Arc::new(MockTransport::new());
            let callbacks = Arc::new(TestCallbacks::default());

            let machine_callbacks: Arc<dyn CryptoCallbacks> = callbacks.clone();
            let machine = CryptoMachine::new(
                user_id,
                device_id,
                Arc::new(MemoryStore::new()),
                Zeroizing::new([3u8; 32]),
                transport.clone(),
                Some(machine_callbacks),
                E2eeConfig::default(),
            )
            .await
            .unwrap();

            Self { machine, transport, callbacks }
        }

        fn user_id(&self) -> OwnedUserId {
            self.machine.user_id().to_owned()
        }

        async fn device_data(&self) -> DeviceData {
            DeviceData::new(self.machine.olm().device_keys().await.unwrap(), LocalTrust::Unverified)
        }

        async fn one_time_key(&self) -> KeysClaimResponse {
            let olm = self.machine.olm();
            olm.generate_one_time_keys(1).await.unwrap();
            let upload = olm.keys_for_upload().await.unwrap();
            olm.mark_keys_as_uploaded(1).await.unwrap();

            KeysClaimResponse {
                one_time_keys: BTreeMap::from([(
                    self.user_id(),
                    BTreeMap::from([(self.machine.device_id().to_owned(), upload.one_time_keys)]),
                )]),
                failures: BTreeMap::new(),
            }
        }
    }

    /// Let `from` know about `to` and be able to claim one of its one-time
    /// keys.
    async fn connect(from: &TestMachine, to: &TestMachine) {
        from.machine.devices().store_device(to.device_data().await);
        from.transport.set_keys_claim_response(to.one_time_key().await);
    }

    async fn deliver(from: &TestMachine, to: &TestMachine) -> Vec<Option<DecryptedToDeviceEvent>> {
        let mut received = Vec::new();

        for sent in from.transport.take_to_device() {
            let Some(devices) = sent.messages.get(to.machine.user_id()) else { continue };
            let Some(content) =
                devices.get(to.machine.device_id().as_str()).or_else(|| devices.get("*"))
            else {
                continue;
            };

            let event = crate::types::events::ToDeviceEvent::new(
                from.user_id(),
                sent.event_type,
                content.clone(),
            );
            received.push(to.machine.receive_to_device_event(&event).await.unwrap());
        }

        received
    }

    fn encrypted_event(sender: &UserId, content: serde_json::Value) -> EncryptedRoomEvent {
        EncryptedRoomEvent {
            sender: sender.to_owned(),
            event_id: event_id!("$message:localhost").to_owned(),
            room_id: room_id!("!room:localhost").to_owned(),
            origin_server_ts: MilliSecondsSinceUnixEpoch::now(),
            content,
        }
    }

    #[tokio::test]
    async fn shared_room_keys_decrypt_room_events() -> anyhow::Result<()> {
        let alice = TestMachine::new(user_id!("@alice:localhost"), device_id!("ALICE1")).await;
        let bob = TestMachine::new(user_id!("@bob:localhost"), device_id!("BOB1")).await;
        let room_id = room_id!("!room:localhost");

        connect(&alice, &bob).await;
        bob.machine.devices().store_device(alice.device_data().await);

        let shared = alice.machine.share_room_key(room_id, &[bob.user_id()]).await?;
        assert_eq!(shared, 1);

        let received = deliver(&alice, &bob).await;
        assert_matches!(&received[..], [Some(room_key)]);
        assert_eq!(room_key.event_type, "m.room_key");
        assert_eq!(room_key.sender_device.as_deref(), Some(device_id!("ALICE1")));

        let content = alice
            .machine
            .encrypt_room_event(room_id, "m.room.message", json!({"body": "It's a secret"}))
            .await?;
        let event = encrypted_event(alice.machine.user_id(), content);

        let decrypted = bob.machine.decrypt_room_event(&event).await?;
        assert_eq!(decrypted.event.event_type, "m.room.message");
        similar_asserts::assert_eq!(decrypted.event.content, json!({"body": "It's a secret"}));
        assert_eq!(decrypted.sender_key, alice.machine.olm().curve25519_key().to_base64());
        assert!(!decrypted.verified);

        bob.machine.devices().set_device_local_trust(
            alice.machine.user_id(),
            device_id!("ALICE1"),
            LocalTrust::Verified,
        );
        assert!(bob.machine.decrypt_room_event(&event).await?.verified);

        let own = alice.machine.decrypt_room_event(&event).await?;
        assert!(own.verified);
        assert_eq!(own.sender_device.as_deref(), Some(device_id!("ALICE1")));

        // Everybody has the key already.
        assert_eq!(alice.machine.share_room_key(room_id, &[bob.user_id()]).await?, 0);

        Ok(())
    }

    #[tokio::test]
    async fn duplicated_users_get_the_room_key_once() -> anyhow::Result<()> {
        let alice = TestMachine::new(user_id!("@alice:localhost"), device_id!("ALICE1")).await;
        let bob = TestMachine::new(user_id!("@bob:localhost"), device_id!("BOB1")).await;
        let room_id = room_id!("!room:localhost");

        connect(&alice, &bob).await;

        let shared = tokio::time::timeout(
            Duration::from_secs(5),
            alice.machine.share_room_key(room_id, &[bob.user_id(), bob.user_id()]),
        )
        .await??;

        assert_eq!(shared, 1);
        assert_eq!(alice.transport.keys_claim_calls.load(Ordering::SeqCst), 1);

        Ok(())
    }

    #[tokio::test]
    async fn room_settings_control_key_rotation() -> anyhow::Result<()> {
        let alice = TestMachine::new(user_id!("@alice:localhost"), device_id!("ALICE1")).await;
        let bob = TestMachine::new(user_id!("@bob:localhost"), device_id!("BOB1")).await;
        let room_id = room_id!("!room:localhost");
        let olm = alice.machine.olm();

        connect(&alice, &bob).await;
        assert_eq!(alice.machine.room_settings(room_id).await?, EncryptionSettings::default());

        let settings = EncryptionSettings { rotation_period_msgs: 2, ..Default::default() };
        alice.machine.set_room_settings(room_id, settings.clone()).await?;
        assert_eq!(alice.machine.room_settings(room_id).await?, settings);

        assert_eq!(alice.machine.share_room_key(room_id, &[bob.user_id()]).await?, 1);
        let first = olm.outbound_group_session_id(room_id).await?.unwrap();

        for _ in 0..2 {
            alice.machine.encrypt_room_event(room_id, "m.room.message", json!({})).await?;
        }
        assert!(olm.outbound_group_session_id(room_id).await?.is_none());

        // The rotated session has to go out to everybody again.
        assert_eq!(alice.machine.share_room_key(room_id, &[bob.user_id()]).await?, 1);
        let second = olm.outbound_group_session_id(room_id).await?.unwrap();
        assert_ne!(first, second);

        // Storing the same settings again keeps the session.
        alice.machine.set_room_settings(room_id, settings.clone()).await?;
        assert_eq!(olm.outbound_group_session_id(room_id).await?, Some(second));

        let trusted_only = EncryptionSettings {
            rotation_period_msgs: 5,
            only_allow_trusted_devices: true,
            ..settings.clone()
        };
        alice.machine.set_room_settings(room_id, trusted_only).await?;
        assert!(olm.outbound_group_session_id(room_id).await?.is_none());

        assert_matches!(
            alice.machine.set_room_settings(room_id, settings).await,
            Err(SetRoomSettingsError::EncryptionDowngrade)
        );
        assert_matches!(
            alice
                .machine
                .set_room_settings(
                    room_id,
                    EncryptionSettings {
                        algorithm: EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
                        ..Default::default()
                    },
                )
                .await,
            Err(SetRoomSettingsError::InvalidSettings)
        );

        Ok(())
    }

    #[tokio::test]
    async fn shared_history_room_keys_wait_for_the_invite() -> anyhow::Result<()> {
        let alice = TestMachine::new(user_id!("@alice:localhost"), device_id!("ALICE1")).await;
        let bob = TestMachine::new(user_id!("@bob:localhost"), device_id!("BOB1")).await;
        let room_id = room_id!("!room:localhost");
        let other_room_id = room_id!("!other:localhost");
        let alice_key = alice.machine.olm().curve25519_key().to_base64();

        connect(&alice, &bob).await;
        bob.machine.devices().store_device(alice.device_data().await);

        let settings = EncryptionSettings { shared_history: true, ..Default::default() };
        alice.machine.set_room_settings(room_id, settings.clone()).await?;
        alice.machine.set_room_settings(other_room_id, settings).await?;

        bob.machine.add_history_sharing_invite(room_id, alice.machine.user_id());
        bob.machine.add_history_sharing_invite(other_room_id, alice.machine.user_id());

        alice.machine.share_room_key(room_id, &[bob.user_id()]).await?;
        alice.machine.share_room_key(other_room_id, &[bob.user_id()]).await?;
        assert_matches!(&deliver(&alice, &bob).await[..], [Some(_), Some(_)]);

        let session_id = alice.machine.olm().outbound_group_session_id(room_id).await?.unwrap();
        let other_session_id =
            alice.machine.olm().outbound_group_session_id(other_room_id).await?.unwrap();

        // Parked keys can't decrypt anything yet.
        assert!(
            !bob.machine.olm().has_inbound_session_keys(room_id, &alice_key, &session_id).await?
        );

        assert_eq!(bob.machine.accept_history_sharing_invite(room_id).await?, 1);
        assert_eq!(bob.machine.accept_history_sharing_invite(room_id).await?, 0);

        let content = alice
            .machine
            .encrypt_room_event(room_id, "m.room.message", json!({"body": "Old news"}))
            .await?;
        let decrypted =
            bob.machine.decrypt_room_event(&encrypted_event(alice.machine.user_id(), content)).await?;
        similar_asserts::assert_eq!(decrypted.event.content, json!({"body": "Old news"}));

        assert_eq!(bob.machine.reject_history_sharing_invite(other_room_id).await?, 1);
        assert!(
            !bob.machine
                .olm()
                .has_inbound_session_keys(other_room_id, &alice_key, &other_session_id)
                .await?
        );

        Ok(())
    }

    #[tokio::test]
    async fn missing_room_keys_are_requested() -> anyhow::Result<()> {
        let alice = TestMachine::new(user_id!("@alice:localhost"), device_id!("ALICE1")).await;
        let bob = TestMachine::new(user_id!("@bob:localhost"), device_id!("BOB1")).await;
        let room_id = room_id!("!room:localhost");

        alice.machine.share_room_key(room_id, &[]).await?;
        let content = alice
            .machine
            .encrypt_room_event(room_id, "m.room.message", json!({ "body": "Hi" }))
            .await?;
        let event = encrypted_event(alice.machine.user_id(), content);

        assert_matches!(
            bob.machine.decrypt_room_event(&event).await,
            Err(MegolmError::MissingRoomKey(None))
        );

        bob.machine.send_queued_room_key_requests().await?;

        let sent = bob.transport.sent_to_device();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, "m.room_key_request");
        assert!(sent[0].messages.contains_key(bob.machine.user_id()));
        assert!(sent[0].messages.contains_key(alice.machine.user_id()));

        Ok(())
    }

    #[tokio::test]
    async fn unreachable_and_blocked_devices_are_told_the_key_is_withheld() -> anyhow::Result<()> {
        let alice = TestMachine::new(user_id!("@alice:localhost"), device_id!("ALICE1")).await;
        let bob = TestMachine::new(user_id!("@bob:localhost"), device_id!("BOB1")).await;
        let carol = TestMachine::new(user_id!("@carol:localhost"), device_id!("CAROL1")).await;
        let room_id = room_id!("!room:localhost");

        // Nobody hands out one-time keys for bob.
        alice.machine.devices().store_device(bob.device_data().await);
        alice.machine.devices().store_device(carol.device_data().await);
        alice.machine.devices().set_device_local_trust(
            carol.machine.user_id(),
            carol.machine.device_id(),
            LocalTrust::Blocked,
        );

        let shared =
            alice.machine.share_room_key(room_id, &[bob.user_id(), carol.user_id()]).await?;
        assert_eq!(shared, 0);

        let sent = alice.transport.take_to_device();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, "m.room_key.withheld");

        let for_bob = sent[0].content_for(bob.machine.user_id(), "BOB1").unwrap();
        assert_eq!(for_bob["code"], "m.no_olm");
        assert!(for_bob.get("session_id").is_none());

        let for_carol = sent[0].content_for(carol.machine.user_id(), "CAROL1").unwrap();
        assert_eq!(for_carol["code"], "m.blacklisted");
        assert_eq!(for_carol["room_id"], room_id.as_str());

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn secrets_are_requested_from_verified_own_devices() -> anyhow::Result<()> {
        let user_id = user_id!("@alice:localhost");
        let first = TestMachine::new(user_id, device_id!("ALICE1")).await;
        let second = TestMachine::new(user_id, device_id!("ALICE2")).await;

        // The second device owns the cross-signing keys and shares them, but
        // not the backup key.
        let mut identity = CrossSigningInfo::new(user_id.to_owned());
        identity
            .reset_keys(CrossSigningLevel::all(), &*second.callbacks)
            .await?;
        first.machine.devices().set_own_identity(identity.clone());
        second.machine.devices().set_own_identity(identity);

        let private_keys = second.callbacks.cross_signing_keys.lock().unwrap().clone();
        for (usage, key) in &private_keys {
            second.callbacks.share_secret(usage.secret_name(), key);
        }

        first.machine.devices().store_device(second.device_data().await);
        first.machine.devices().set_device_local_trust(
            user_id,
            device_id!("ALICE2"),
            LocalTrust::Verified,
        );
        connect(&second, &first).await;

        let pending = first.machine.request_secrets_from_device(device_id!("ALICE2")).await?;
        assert!(!pending.is_empty());

        deliver(&first, &second).await;
        assert_eq!(second.callbacks.secret_requests.lock().unwrap().len(), 4);

        let answers = deliver(&second, &first).await;
        assert_eq!(answers.len(), 3);

        let received = pending.receive().await;

        assert_eq!(
            received.cross_signing_keys,
            vec![KeyUsage::Master, KeyUsage::SelfSigning, KeyUsage::UserSigning]
        );
        assert!(!received.backup_key);
        assert_eq!(*first.callbacks.cross_signing_keys.lock().unwrap(), private_keys);

        // Nothing is missing anymore, apart from the backup key.
        let pending = first.machine.request_secrets_from_device(device_id!("ALICE2")).await?;
        assert!(!pending.is_empty());
        assert_eq!(first.transport.take_to_device().len(), 2);

        Ok(())
    }

    #[tokio::test]
    async fn verification_events_are_dispatched() -> anyhow::Result<()> {
        let alice = TestMachine::new(user_id!("@alice:localhost"), device_id!("ALICE1")).await;
        let bob = TestMachine::new(user_id!("@bob:localhost"), device_id!("BOB1")).await;

        alice.machine.devices().store_device(bob.device_data().await);
        bob.machine.devices().store_device(alice.device_data().await);

        let request =
            alice.machine.verification().request_verification(&bob.user_id(), None).await?;
        let received = deliver(&alice, &bob).await;
        assert_matches!(&received[..], [None]);

        let flow_id = request.flow_id().unwrap();
        let incoming =
            bob.machine.verification().get_request(alice.machine.user_id(), flow_id.as_str());
        assert!(incoming.is_some_and(|r| !r.we_started()));

        Ok(())
    }
}
