// Copyright 2021 The Matrix.org Foundation C.I.C.
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

//! Server-side backup support for room keys
//!
//! Room keys are encrypted with one of two algorithms, the asymmetric
//! `m.megolm_backup.v1.curve25519-aes-sha2` one or a symmetric AES-HMAC-SHA2
//! variant, and uploaded in the background.
//!
//! [spec]: https://spec.matrix.org/unstable/client-server-api/#server-side-key-backups

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use rand::{thread_rng, Rng};
use ruma::{OwnedDeviceId, OwnedRoomId, RoomId};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    algorithms::EventEncryptionAlgorithm,
    config::E2eeConfig,
    error::{KeyBackupError, SignatureError},
    identities::DeviceListManager,
    olm::{OlmDevice, PickledInboundGroupSession},
    requests::CryptoTransport,
    store::{CryptoStore, RoomKeyCounts},
    types::{
        backup::{BackedUpRoomKey, KeyBackupData, KeyBackupVersion, RoomKeyBackupInfo, RoomKeysUpload},
        ed25519_key_id, KeyUsage, Signatures,
    },
    utilities::verify_json,
};

mod algorithm;
mod keys;

pub use algorithm::BackupAlgorithm;
pub use keys::{BackupDecryptionKey, DecodeError};

/// The name of the secret that holds the backup decryption key.
pub const BACKUP_SECRET_NAME: &str = "m.megolm_backup.v1";

/// The result of a signature verification of the backup auth data.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignatureVerification {
    /// The result of the signature verification using the public key of our own
    /// device.
    pub device_signature: SignatureState,
    /// The result of the signature verification using the public key of our own
    /// user identity.
    pub user_identity_signature: SignatureState,
    /// The result of the signature verification using public keys of other
    /// devices we own.
    pub other_signatures: BTreeMap<OwnedDeviceId, SignatureState>,
}

impl SignatureVerification {
    /// Is the result considered to be trusted?
    ///
    /// This tells us if the result has a valid signature from any of the
    /// following:
    ///
    /// * Our own device
    /// * Our own user identity
    /// * Any of our own devices, provided the device is trusted as well
    pub fn trusted(&self) -> bool {
        self.device_signature.trusted()
            || self.user_identity_signature.trusted()
            || self.other_signatures.values().any(|s| s.trusted())
    }
}

/// The result of a signature check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignatureState {
    /// The signature is missing.
    #[default]
    Missing,
    /// The signature is invalid.
    Invalid,
    /// The signature is valid but the device or user identity that created the
    /// signature is not trusted.
    ValidButNotTrusted,
    /// The signature is valid and the device or user identity that created the
    /// signature is trusted.
    ValidAndTrusted,
}

impl SignatureState {
    /// Is the state considered to be trusted?
    pub fn trusted(self) -> bool {
        self == SignatureState::ValidAndTrusted
    }

    /// Did we find a valid signature?
    pub fn signed(self) -> bool {
        matches!(self, SignatureState::ValidButNotTrusted | SignatureState::ValidAndTrusted)
    }

    fn from_result(result: Result<(), SignatureError>, trusted: bool) -> Self {
        match result {
            Ok(()) if trusted => SignatureState::ValidAndTrusted,
            Ok(()) => SignatureState::ValidButNotTrusted,
            Err(SignatureError::NoSignatureFound) => SignatureState::Missing,
            Err(_) => SignatureState::Invalid,
        }
    }
}

/// What [`BackupManager::check_and_start()`] found on the server.
#[derive(Clone, Debug)]
pub struct BackupCheck {
    /// The current backup version.
    pub version: KeyBackupVersion,
    /// The signatures of the backup auth data.
    pub trust: SignatureVerification,
    /// Did we start backing up to this version.
    pub enabled: bool,
}

#[derive(Clone, Debug)]
struct ActiveBackup {
    version: KeyBackupVersion,
    algorithm: BackupAlgorithm,
}

/// A state machine that backs up room keys to the server.
///
/// A backup gets enabled by [`BackupManager::check_and_start()`] if the
/// server has a trusted one, or by [`BackupManager::create_backup()`]. Room
/// keys flagged as not backed up are then uploaded by
/// [`BackupManager::schedule_key_backup_send()`].
#[derive(Clone)]
pub struct BackupManager {
    inner: Arc<BackupManagerInner>,
}

struct BackupManagerInner {
    olm: OlmDevice,
    devices: DeviceListManager,
    transport: Arc<dyn CryptoTransport>,
    config: E2eeConfig,
    active: StdMutex<Option<ActiveBackup>>,
    sending: AtomicBool,
    send_again: AtomicBool,
    last_check_attempt: StdMutex<HashMap<(OwnedRoomId, String), Instant>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupManager")
            .field("active", &*self.inner.active.lock().unwrap())
            .field("sending", &self.inner.sending.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl BackupManager {
    const RETRY_DELAY: Duration = Duration::from_secs(1);

    pub(crate) fn new(
        olm: OlmDevice,
        devices: DeviceListManager,
        transport: Arc<dyn CryptoTransport>,
        config: E2eeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(BackupManagerInner {
                olm,
                devices,
                transport,
                config,
                active: StdMutex::new(None),
                sending: AtomicBool::new(false),
                send_again: AtomicBool::new(false),
                last_check_attempt: Default::default(),
            }),
        }
    }

    /// Are we backing up room keys.
    pub fn is_enabled(&self) -> bool {
        self.inner.active.lock().unwrap().is_some()
    }

    /// The backup version we're backing up to.
    pub fn backup_info(&self) -> Option<KeyBackupVersion> {
        self.inner.active.lock().unwrap().as_ref().map(|a| a.version.clone())
    }

    fn active(&self) -> Result<ActiveBackup, KeyBackupError> {
        self.inner.active.lock().unwrap().clone().ok_or(KeyBackupError::BackupDisabled)
    }

    /// Get the number of backed up room keys and the total number of room keys.
    pub async fn room_key_counts(&self) -> Result<RoomKeyCounts, KeyBackupError> {
        Ok(self.inner.olm.store().inbound_group_session_counts().await?)
    }

    /// The backup decryption key we have stored locally.
    pub async fn stored_decryption_key(&self) -> Result<Option<BackupDecryptionKey>, KeyBackupError> {
        let secret = self.inner.olm.store().get_secret(BACKUP_SECRET_NAME).await?;
        Ok(secret.map(|s| BackupDecryptionKey::from_base64(&s)).transpose()?)
    }

    /// Store the backup decryption key, for example after receiving it from
    /// another device.
    ///
    /// If the key belongs to the active backup it's used to restore keys
    /// from now on.
    pub async fn save_decryption_key(&self, key: BackupDecryptionKey) -> Result<(), KeyBackupError> {
        let mut transaction = self.inner.olm.store().transaction().await;
        transaction.changes().secrets.insert(BACKUP_SECRET_NAME.to_owned(), key.to_base64());
        transaction.commit().await?;

        let mut active = self.inner.active.lock().unwrap();

        if let Some(backup) = active.as_mut() {
            if !backup.algorithm.has_decryption_key()
                && BackupAlgorithm::key_matches_info(&backup.version.info, &key)
            {
                debug!(version = backup.version.version, "Storing the decryption key of the active backup");
                backup.algorithm = BackupAlgorithm::init(&backup.version.info, Some(key))?;
            }
        }

        Ok(())
    }

    /// Create a new backup version on the server and start backing up to it.
    ///
    /// The auth data is signed with our device key and the decryption key is
    /// stored locally. A new key is generated if none is given.
    #[instrument(skip(self, key))]
    pub async fn create_backup(
        &self,
        algorithm: &EventEncryptionAlgorithm,
        key: Option<BackupDecryptionKey>,
    ) -> Result<(BackupDecryptionKey, KeyBackupVersion), KeyBackupError> {
        let (key, mut info) = BackupAlgorithm::prepare(algorithm, key)?;

        let signature = self.inner.olm.sign_json(&info.auth_data_json()?).await?;
        let mut signatures = Signatures::new();
        signatures.add_signature(
            self.inner.olm.user_id().to_owned(),
            ed25519_key_id(self.inner.olm.device_id().as_str()),
            signature,
        );

        match &mut info {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(data) => data.signatures = signatures,
            RoomKeyBackupInfo::MegolmBackupV1AesHmacSha2(data) => data.signatures = signatures,
            RoomKeyBackupInfo::Other { algorithm, .. } => {
                return Err(KeyBackupError::UnsupportedAlgorithm(algorithm.to_owned()));
            }
        }

        let version = self.inner.transport.create_key_backup_version(info.clone()).await?;
        info!(version, "Created a new key backup version");

        let backup = KeyBackupVersion { info, version, count: 0, etag: String::new() };

        self.save_decryption_key(key.clone()).await?;
        self.enable(backup.clone(), Some(key.clone())).await?;

        Ok((key, backup))
    }

    /// Fetch the current backup version from the server and start backing up
    /// to it if it's trusted.
    ///
    /// Backing up stops if the server doesn't have a backup or the backup
    /// isn't signed by us, one of our verified devices or our cross-signing
    /// identity.
    #[instrument(skip(self))]
    pub async fn check_and_start(&self) -> Result<Option<BackupCheck>, KeyBackupError> {
        let Some(version) = self.inner.transport.get_key_backup_version().await? else {
            info!("The server has no key backup, disabling backups");
            self.disable().await?;
            return Ok(None);
        };

        if let Err(e) = BackupAlgorithm::check_backup_version(&version.info) {
            warn!(version = version.version, error = ?e, "The server has an unusable key backup");
            self.disable().await?;
            return Err(e);
        }

        let trust = self.verify_backup(&version.info).await?;

        if !trust.trusted() {
            warn!(version = version.version, ?trust, "The key backup isn't trusted, not backing up");
            self.inner.active.lock().unwrap().take();

            return Ok(Some(BackupCheck { version, trust, enabled: false }));
        }

        let key = self
            .stored_decryption_key()
            .await?
            .filter(|key| BackupAlgorithm::key_matches_info(&version.info, key));

        let enabled = match version.info.algorithm() {
            EventEncryptionAlgorithm::MegolmBackupV1AesHmacSha2 if key.is_none() => {
                warn!(version = version.version, "Missing the key of the symmetric backup, not backing up");
                self.inner.active.lock().unwrap().take();
                false
            }
            _ => {
                self.enable(version.clone(), key).await?;
                true
            }
        };

        Ok(Some(BackupCheck { version, trust, enabled }))
    }

    /// Start backing up to the given backup version.
    ///
    /// Switching to a different version than the last one resets the backed
    /// up flag of every room key.
    pub async fn enable(
        &self,
        version: KeyBackupVersion,
        key: Option<BackupDecryptionKey>,
    ) -> Result<(), KeyBackupError> {
        let algorithm = BackupAlgorithm::init(&version.info, key)?;
        let store = self.inner.olm.store();

        if store.get_backup_version().await?.as_deref() != Some(version.version.as_str()) {
            info!(version = version.version, "Backup version changed, resetting the backup state");

            store.reset_backup_state().await?;

            let mut transaction = store.transaction().await;
            transaction.changes().backup_version = Some(Some(version.version.clone()));
            transaction.commit().await?;
        }

        info!(version = version.version, ?algorithm, "Activated a backup");
        *self.inner.active.lock().unwrap() = Some(ActiveBackup { version, algorithm });

        Ok(())
    }

    /// Disable and reset our backup state.
    #[instrument(skip(self))]
    pub async fn disable(&self) -> Result<(), KeyBackupError> {
        debug!("Disabling key backup and resetting backup state for room keys");

        self.inner.active.lock().unwrap().take();

        let mut transaction = self.inner.olm.store().transaction().await;
        transaction.changes().backup_version = Some(None);
        transaction.commit().await?;

        Ok(())
    }

    /// Verify the signatures of some backup info that we downloaded from the
    /// server.
    pub async fn verify_backup(
        &self,
        info: &RoomKeyBackupInfo,
    ) -> Result<SignatureVerification, KeyBackupError> {
        trace!(?info, "Verifying backup auth data");

        let auth_data = info.auth_data_json()?;
        let user_id = self.inner.olm.user_id();
        let own_device_id = self.inner.olm.device_id();

        let device_signature = SignatureState::from_result(
            verify_json(
                user_id,
                &ed25519_key_id(own_device_id.as_str()),
                &self.inner.olm.ed25519_key(),
                &auth_data,
            ),
            true,
        );

        let user_identity_signature = self
            .inner
            .devices
            .own_identity()
            .and_then(|identity| identity.get_key(KeyUsage::Master).cloned())
            .and_then(|master| Some((master.key_id()?, master.get_first_key()?)))
            .map(|(key_id, key)| {
                SignatureState::from_result(verify_json(user_id, &key_id, &key, &auth_data), true)
            })
            .unwrap_or_default();

        let mut other_signatures = BTreeMap::new();

        if let Some(signatures) = info.signatures().get(user_id) {
            for key_id in signatures.keys() {
                let Some(device_id) = key_id.strip_prefix("ed25519:") else { continue };

                if device_id == own_device_id.as_str() {
                    continue;
                }

                let Some(device) = self.inner.devices.get_device(user_id, device_id.into()) else {
                    trace!(device_id, "Device not found, can't check signature");
                    continue;
                };
                let Some(key) = device.ed25519_key() else { continue };

                let trusted = self
                    .inner
                    .devices
                    .get_device_trust(user_id, device.device_id())
                    .is_some_and(|t| t.is_verified());

                let state = SignatureState::from_result(
                    verify_json(user_id, key_id, &key, &auth_data),
                    trusted,
                );

                other_signatures.insert(device.device_id().to_owned(), state);
            }
        }

        Ok(SignatureVerification { device_signature, user_identity_signature, other_signatures })
    }

    fn sender_is_verified(&self, session: &PickledInboundGroupSession) -> bool {
        if session.untrusted {
            return false;
        }

        if session.sender_key == self.inner.olm.curve25519_key().to_base64() {
            return true;
        }

        self.inner
            .devices
            .device_by_curve25519_key(&session.sender_key)
            .and_then(|d| self.inner.devices.get_device_trust(d.user_id(), d.device_id()))
            .is_some_and(|t| t.is_verified())
    }

    /// Back up to `limit` room keys that aren't backed up yet.
    ///
    /// The keys are uploaded in chunks, every chunk the server acknowledged
    /// stays marked as backed up even if a later one fails. Returns the number
    /// of uploaded keys.
    #[instrument(skip(self))]
    pub async fn backup_pending_keys(&self, limit: usize) -> Result<usize, KeyBackupError> {
        let ActiveBackup { version, algorithm } = self.active()?;
        let store = self.inner.olm.store();

        let pickles = store.inbound_group_sessions_for_backup(limit).await?;

        if pickles.is_empty() {
            trace!("No room keys need to be backed up");
            return Ok(0);
        }

        let exported = self.inner.olm.export_pickled(&pickles)?;
        let sessions: Vec<_> = pickles.iter().zip(exported).collect();
        let mut uploaded = 0;

        for chunk in sessions.chunks(self.inner.config.key_backup_upload_chunk_size.max(1)) {
            let mut request = RoomKeysUpload::default();
            let mut session_ids = Vec::with_capacity(chunk.len());

            for (pickle, key) in chunk {
                let session_data =
                    algorithm.encrypt_session(&key.session_id, &BackedUpRoomKey::from(key.clone()))?;

                let data = KeyBackupData {
                    first_message_index: pickle.first_known_index,
                    forwarded_count: u32::from(pickle.imported),
                    is_verified: self.sender_is_verified(pickle),
                    session_data,
                };

                request
                    .rooms
                    .entry(key.room_id.clone())
                    .or_default()
                    .sessions
                    .insert(key.session_id.clone(), data);
                session_ids.push((pickle.sender_key.clone(), pickle.session_id.clone()));
            }

            if let Err(e) = self.inner.transport.upload_room_keys(&version.version, request).await {
                warn!(uploaded, remaining = sessions.len() - uploaded, error = ?e, "Failed to upload room keys");
                return Err(e.into());
            }

            store.mark_inbound_group_sessions_as_backed_up(&session_ids).await?;
            uploaded += session_ids.len();

            trace!(uploaded, "Marked room keys as backed up");
        }

        debug!(uploaded, version = version.version, "Backed up room keys");

        Ok(uploaded)
    }

    /// Start a background task that backs up all pending room keys after a
    /// random delay of up to `max_delay`.
    ///
    /// Only one task runs at a time. If one is already running `None` is
    /// returned and the running task picks up any newly added keys.
    pub fn schedule_key_backup_send(&self, max_delay: Duration) -> Option<JoinHandle<()>> {
        self.inner.send_again.store(true, Ordering::SeqCst);

        if self.inner.sending.swap(true, Ordering::SeqCst) {
            trace!("A key backup is already in progress");
            return None;
        }

        let delay = if max_delay.is_zero() {
            Duration::ZERO
        } else {
            thread_rng().gen_range(Duration::ZERO..=max_delay)
        };

        let this = self.clone();

        Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.send_loop().await;
        }))
    }

    async fn send_loop(&self) {
        let mut failures = 0;

        loop {
            self.inner.send_again.store(false, Ordering::SeqCst);

            match self.backup_pending_keys(self.inner.config.key_backup_keys_per_request).await {
                Ok(0) => {
                    self.inner.sending.store(false, Ordering::SeqCst);

                    // Someone scheduled a send while we were finishing up.
                    if self.inner.send_again.load(Ordering::SeqCst)
                        && !self.inner.sending.swap(true, Ordering::SeqCst)
                    {
                        continue;
                    }

                    return;
                }
                Ok(_) => failures = 0,
                Err(KeyBackupError::BackupDisabled) => {
                    debug!("Key backup got disabled, stopping the backup loop");
                    break;
                }
                Err(e) => {
                    failures += 1;

                    if failures > self.inner.config.key_backup_max_retries {
                        warn!(error = ?e, failures, "Giving up on backing up room keys");
                        break;
                    }

                    let delay = Self::RETRY_DELAY * failures;
                    debug!(error = ?e, failures, ?delay, "Failed to back up room keys, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.inner.sending.store(false, Ordering::SeqCst);
    }

    /// Try to fetch a room key we're missing from the backup.
    ///
    /// The same session is queried at most once per
    /// `key_backup_check_rate_limit`. Returns `None` if the query was skipped,
    /// otherwise the number of imported keys.
    pub async fn query_key_backup_rate_limited(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<usize>, KeyBackupError> {
        {
            let mut attempts = self.inner.last_check_attempt.lock().unwrap();
            let now = Instant::now();
            let key = (room_id.to_owned(), session_id.to_owned());

            if let Some(last) = attempts.get(&key) {
                if now.duration_since(*last) < self.inner.config.key_backup_check_rate_limit {
                    trace!(?room_id, session_id, "Not querying the key backup, rate limited");
                    return Ok(None);
                }
            }

            attempts.insert(key, now);
        }

        self.restore_from_backup(Some(room_id), Some(session_id)).await.map(Some)
    }

    /// Download and import room keys from the active backup.
    ///
    /// The download can be restricted to a room or a single session. The
    /// imported keys are marked as backed up. A backed up key only replaces a
    /// local copy of the session if it reaches further back. Returns the
    /// number of keys that were added or replaced.
    #[instrument(skip(self))]
    pub async fn restore_from_backup(
        &self,
        room_id: Option<&RoomId>,
        session_id: Option<&str>,
    ) -> Result<usize, KeyBackupError> {
        let ActiveBackup { version, algorithm } = self.active()?;

        if !algorithm.has_decryption_key() {
            return Err(KeyBackupError::MissingDecryptionKey);
        }

        let backup =
            self.inner.transport.download_room_keys(&version.version, room_id, session_id).await?;

        let mut imported = Vec::new();

        for (room_id, room_backup) in &backup.rooms {
            for key in algorithm.decrypt_sessions(room_id, &room_backup.sessions) {
                if self.inner.olm.merge_room_key(&key).await? {
                    imported.push((key.sender_key.clone(), key.session_id.clone()));
                }
            }
        }

        self.inner.olm.store().mark_inbound_group_sessions_as_backed_up(&imported).await?;

        info!(imported = imported.len(), downloaded = backup.session_count(), "Restored room keys from the backup");

        Ok(imported.len())
    }
}
