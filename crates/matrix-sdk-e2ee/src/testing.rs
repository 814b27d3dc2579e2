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

//! Test doubles for the transport and the application callbacks.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use ruma::{
    event_id, OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId,
    TransactionId,
};
use serde_json::Value;
use vodozemac::Ed25519SecretKey;
use zeroize::Zeroizing;

use crate::{
    callbacks::{CryptoCallbacks, SecretRequestInfo},
    error::{CrossSigningError, SecretStorageError},
    secret_storage::SecretStorageKeyDescription,
    requests::{
        CryptoTransport, KeysClaimResponse, KeysQueryResponse, KeysUploadRequest,
        SignatureUploadRequest, ToDeviceMessages, TransportError,
    },
    types::{
        backup::{KeyBackupVersion, RoomKeyBackupInfo, RoomKeysUpload},
        CrossSigningKeys, KeyUsage,
    },
};

/// A to-device request the [`MockTransport`] received.
#[derive(Clone, Debug)]
pub(crate) struct SentToDevice {
    pub event_type: String,
    pub txn_id: OwnedTransactionId,
    pub messages: ToDeviceMessages,
}

impl SentToDevice {
    /// The content sent to the given user and device, or `*`.
    pub fn content_for(&self, user_id: &ruma::UserId, device: &str) -> Option<&Value> {
        self.messages.get(user_id)?.get(device)
    }
}

/// A room event the [`MockTransport`] received.
#[derive(Clone, Debug)]
pub(crate) struct SentRoomEvent {
    pub room_id: OwnedRoomId,
    pub event_type: String,
    pub content: Value,
}

/// A transport that records every request and answers with canned responses.
#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    pub to_device: StdMutex<Vec<SentToDevice>>,
    pub room_events: StdMutex<Vec<SentRoomEvent>>,
    pub account_data: StdMutex<BTreeMap<String, Value>>,
    pub keys_query_response: StdMutex<KeysQueryResponse>,
    pub keys_query_calls: StdMutex<Vec<Vec<OwnedUserId>>>,
    pub keys_query_delay: StdMutex<Option<Duration>>,
    pub keys_claim_response: StdMutex<KeysClaimResponse>,
    pub keys_claim_calls: AtomicUsize,
    pub keys_claim_delay: StdMutex<Option<Duration>>,
    pub uploaded_keys: StdMutex<Vec<KeysUploadRequest>>,
    pub uploaded_signatures: StdMutex<Vec<SignatureUploadRequest>>,
    pub uploaded_cross_signing_keys: StdMutex<Vec<CrossSigningKeys>>,
    pub backup_version: StdMutex<Option<KeyBackupVersion>>,
    pub uploaded_room_keys: StdMutex<Vec<(String, RoomKeysUpload)>>,
    pub stored_room_keys: StdMutex<RoomKeysUpload>,
    /// The number of following room key uploads that fail.
    pub failing_room_key_uploads: AtomicUsize,
    /// The number of room key uploads that succeed before the failing ones.
    pub succeeding_room_key_uploads: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_to_device(&self) -> Vec<SentToDevice> {
        self.to_device.lock().unwrap().clone()
    }

    pub fn take_to_device(&self) -> Vec<SentToDevice> {
        std::mem::take(&mut *self.to_device.lock().unwrap())
    }

    pub fn sent_room_events(&self) -> Vec<SentRoomEvent> {
        self.room_events.lock().unwrap().clone()
    }

    pub fn set_keys_query_response(&self, response: KeysQueryResponse) {
        *self.keys_query_response.lock().unwrap() = response;
    }

    pub fn set_keys_claim_response(&self, response: KeysClaimResponse) {
        *self.keys_claim_response.lock().unwrap() = response;
    }

    pub fn fail_next_room_key_uploads(&self, count: usize) {
        self.fail_room_key_uploads_after(0, count);
    }

    pub fn fail_room_key_uploads_after(&self, succeeding: usize, failing: usize) {
        self.succeeding_room_key_uploads.store(succeeding, Ordering::SeqCst);
        self.failing_room_key_uploads.store(failing, Ordering::SeqCst);
    }

    pub fn uploaded_session_count(&self) -> usize {
        self.uploaded_room_keys.lock().unwrap().iter().map(|(_, u)| u.session_count()).sum()
    }

    async fn maybe_sleep(delay: &StdMutex<Option<Duration>>) {
        let delay = *delay.lock().unwrap();

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl CryptoTransport for MockTransport {
    async fn upload_keys(
        &self,
        request: KeysUploadRequest,
    ) -> Result<BTreeMap<String, u64>, TransportError> {
        let count = request.one_time_keys.len() as u64;
        self.uploaded_keys.lock().unwrap().push(request);

        Ok(BTreeMap::from([("signed_curve25519".to_owned(), count)]))
    }

    async fn query_keys(&self, users: &[OwnedUserId]) -> Result<KeysQueryResponse, TransportError> {
        self.keys_query_calls.lock().unwrap().push(users.to_vec());
        Self::maybe_sleep(&self.keys_query_delay).await;

        Ok(self.keys_query_response.lock().unwrap().clone())
    }

    async fn claim_one_time_keys(
        &self,
        _: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>>,
        _: Duration,
    ) -> Result<KeysClaimResponse, TransportError> {
        self.keys_claim_calls.fetch_add(1, Ordering::SeqCst);
        Self::maybe_sleep(&self.keys_claim_delay).await;

        Ok(self.keys_claim_response.lock().unwrap().clone())
    }

    async fn upload_signatures(
        &self,
        signatures: SignatureUploadRequest,
    ) -> Result<(), TransportError> {
        self.uploaded_signatures.lock().unwrap().push(signatures);
        Ok(())
    }

    async fn upload_cross_signing_keys(&self, keys: CrossSigningKeys) -> Result<(), TransportError> {
        self.uploaded_cross_signing_keys.lock().unwrap().push(keys);
        Ok(())
    }

    async fn send_to_device(
        &self,
        event_type: &str,
        txn_id: &TransactionId,
        messages: ToDeviceMessages,
    ) -> Result<(), TransportError> {
        self.to_device.lock().unwrap().push(SentToDevice {
            event_type: event_type.to_owned(),
            txn_id: txn_id.to_owned(),
            messages,
        });

        Ok(())
    }

    async fn send_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        _: &TransactionId,
        content: Value,
    ) -> Result<OwnedEventId, TransportError> {
        self.room_events.lock().unwrap().push(SentRoomEvent {
            room_id: room_id.to_owned(),
            event_type: event_type.to_owned(),
            content,
        });

        Ok(event_id!("$sent:example.org").to_owned())
    }

    async fn get_account_data(&self, event_type: &str) -> Result<Option<Value>, TransportError> {
        Ok(self.account_data.lock().unwrap().get(event_type).cloned())
    }

    async fn set_account_data(&self, event_type: &str, content: Value) -> Result<(), TransportError> {
        self.account_data.lock().unwrap().insert(event_type.to_owned(), content);
        Ok(())
    }

    async fn get_key_backup_version(&self) -> Result<Option<KeyBackupVersion>, TransportError> {
        Ok(self.backup_version.lock().unwrap().clone())
    }

    async fn create_key_backup_version(
        &self,
        info: RoomKeyBackupInfo,
    ) -> Result<String, TransportError> {
        let mut version = self.backup_version.lock().unwrap();
        let next = version
            .as_ref()
            .and_then(|v| v.version.parse::<u64>().ok())
            .map(|v| v + 1)
            .unwrap_or(1)
            .to_string();

        *version = Some(KeyBackupVersion {
            info,
            version: next.clone(),
            count: 0,
            etag: String::new(),
        });

        Ok(next)
    }

    async fn upload_room_keys(
        &self,
        version: &str,
        keys: RoomKeysUpload,
    ) -> Result<(), TransportError> {
        let succeeding = self.succeeding_room_key_uploads.load(Ordering::SeqCst);
        let failing = self.failing_room_key_uploads.load(Ordering::SeqCst);

        if succeeding > 0 {
            self.succeeding_room_key_uploads.store(succeeding - 1, Ordering::SeqCst);
        } else if failing > 0 {
            self.failing_room_key_uploads.store(failing - 1, Ordering::SeqCst);
            return Err(TransportError::Network("connection reset".to_owned()));
        }

        {
            let mut stored = self.stored_room_keys.lock().unwrap();

            for (room_id, backup) in &keys.rooms {
                stored.rooms.entry(room_id.clone()).or_default().sessions.extend(
                    backup.sessions.iter().map(|(id, data)| (id.clone(), data.clone())),
                );
            }
        }

        self.uploaded_room_keys.lock().unwrap().push((version.to_owned(), keys));

        Ok(())
    }

    async fn download_room_keys(
        &self,
        _: &str,
        room_id: Option<&RoomId>,
        session_id: Option<&str>,
    ) -> Result<RoomKeysUpload, TransportError> {
        let stored = self.stored_room_keys.lock().unwrap().clone();

        let rooms = stored
            .rooms
            .into_iter()
            .filter(|(r, _)| room_id.map_or(true, |room_id| r == room_id))
            .map(|(r, mut backup)| {
                if let Some(session_id) = session_id {
                    backup.sessions.retain(|id, _| id == session_id);
                }

                (r, backup)
            })
            .collect();

        Ok(RoomKeysUpload { rooms })
    }
}

/// Callbacks that keep every private key in memory.
#[derive(Debug, Default)]
pub struct TestCallbacks {
    /// Private cross-signing keys, as base64.
    pub cross_signing_keys: StdMutex<BTreeMap<KeyUsage, String>>,
    /// Secret storage keys the "user" can provide, by key id.
    pub secret_storage_keys: StdMutex<BTreeMap<String, [u8; 32]>>,
    /// Ids of the secret storage keys that passed their key check.
    pub cached_secret_storage_keys: StdMutex<Vec<String>>,
    /// Secrets we hand out to other devices, by name.
    pub shared_secrets: StdMutex<BTreeMap<String, String>>,
    /// The secret requests we were asked about.
    pub secret_requests: StdMutex<Vec<SecretRequestInfo>>,
}

impl TestCallbacks {
    pub fn add_secret_storage_key(&self, key_id: &str, key: [u8; 32]) {
        self.secret_storage_keys.lock().unwrap().insert(key_id.to_owned(), key);
    }

    pub fn share_secret(&self, name: &str, secret: &str) {
        self.shared_secrets.lock().unwrap().insert(name.to_owned(), secret.to_owned());
    }
}

#[async_trait]
impl CryptoCallbacks for TestCallbacks {
    async fn get_cross_signing_key(&self, usage: KeyUsage, _: &str) -> Option<Ed25519SecretKey> {
        let keys = self.cross_signing_keys.lock().unwrap();
        keys.get(&usage).and_then(|k| Ed25519SecretKey::from_base64(k).ok())
    }

    async fn save_cross_signing_keys(
        &self,
        keys: BTreeMap<KeyUsage, Ed25519SecretKey>,
    ) -> Result<(), CrossSigningError> {
        self.cross_signing_keys
            .lock()
            .unwrap()
            .extend(keys.into_iter().map(|(u, k)| (u, k.to_base64())));
        Ok(())
    }

    async fn get_secret_storage_key(
        &self,
        key_ids: &[String],
        _: &str,
    ) -> Result<Option<(String, Zeroizing<[u8; 32]>)>, SecretStorageError> {
        let keys = self.secret_storage_keys.lock().unwrap();

        Ok(key_ids
            .iter()
            .find_map(|id| keys.get(id).map(|key| (id.clone(), Zeroizing::new(*key)))))
    }

    async fn cache_secret_storage_key(
        &self,
        key_id: &str,
        _: &SecretStorageKeyDescription,
        _: &[u8; 32],
    ) {
        self.cached_secret_storage_keys.lock().unwrap().push(key_id.to_owned());
    }

    async fn on_secret_request(&self, request: SecretRequestInfo) -> Option<String> {
        let secret = self.shared_secrets.lock().unwrap().get(&request.name).cloned();
        self.secret_requests.lock().unwrap().push(request);

        secret
    }
}
