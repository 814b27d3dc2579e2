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

//! A store persisting every row as JSON into a flat key-value backend.
//!
//! Reads are served from an in-memory copy that is loaded when the store is
//! opened. Every set of changes is written to the backend as a single batch,
//! and lands in memory only once the batch was applied.

use std::{collections::BTreeMap, fmt, sync::RwLock as StdRwLock};

use async_trait::async_trait;
use ruma::{OwnedRoomId, RoomId, TransactionId};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::{Changes, CryptoStore, MemoryStore, Result, RoomKeyCounts};
use crate::{
    gossiping::{OutgoingRoomKeyRequest, RequestState},
    identities::DeviceDataBlob,
    olm::{
        EncryptionSettings, OlmMessageHash, ParkedSharedHistory, PickledAccount,
        PickledInboundGroupSession, PickledOutboundGroupSession, PickledSession,
    },
    types::events::{RequestedKeyInfo, RoomKeyWithheldContent},
};

const ACCOUNT: &str = "crypto.account";
const SESSIONS: &str = "crypto.sessions|";
const INBOUND_GROUP_SESSIONS: &str = "crypto.inbound_group_sessions|";
const OUTBOUND_GROUP_SESSIONS: &str = "crypto.outbound_group_sessions|";
const WITHHELD: &str = "crypto.withheld|";
const DEVICE_DATA: &str = "crypto.device_data";
const ROOM_SETTINGS: &str = "crypto.rooms|";
const MESSAGE_HASHES: &str = "crypto.message_hashes|";
const KEY_REQUESTS: &str = "crypto.key_requests|";
const SECRETS: &str = "crypto.secrets|";
const PARKED: &str = "crypto.parked_shared_history|";
const BACKUP_VERSION: &str = "crypto.backup_version";

/// A list of rows to write, a `None` value removes the row.
pub type WriteBatch = Vec<(String, Option<Vec<u8>>)>;

/// A synchronous, flat key-value storage backend.
pub trait KeyValueBackend: fmt::Debug + Send + Sync {
    /// Get the value stored under the given key.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// List all keys starting with the given prefix.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Apply all the writes of the batch, in order.
    ///
    /// The batch is atomic: if this returns an error none of its writes may
    /// be visible.
    fn write_batch(&self, batch: WriteBatch) -> Result<()>;
}

/// Collects the rows of one set of changes before they're handed to the
/// backend.
///
/// A later write to the same key replaces an earlier one.
#[derive(Debug, Default)]
struct Batch {
    rows: BTreeMap<String, Option<Vec<u8>>>,
}

impl Batch {
    fn put<T: Serialize>(&mut self, key: String, value: &T) -> Result<()> {
        self.rows.insert(key, Some(serde_json::to_vec(value)?));
        Ok(())
    }

    fn remove(&mut self, key: String) {
        self.rows.insert(key, None);
    }

    fn contains(&self, key: &str) -> bool {
        self.rows.contains_key(key)
    }

    fn commit<B: KeyValueBackend + ?Sized>(self, backend: &B) -> Result<()> {
        if self.rows.is_empty() {
            return Ok(());
        }

        backend.write_batch(self.rows.into_iter().collect())
    }
}

/// A [`KeyValueBackend`] keeping its values in a map.
#[derive(Debug, Default)]
pub struct MemoryKeyValueBackend {
    values: StdRwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKeyValueBackend {
    /// Create a new, empty, backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueBackend for MemoryKeyValueBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.read().unwrap().get(key).cloned())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .values
            .read()
            .unwrap()
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut values = self.values.write().unwrap();

        for (key, value) in batch {
            match value {
                Some(value) => values.insert(key, value),
                None => values.remove(&key),
            };
        }

        Ok(())
    }
}

impl<T: KeyValueBackend + ?Sized> KeyValueBackend for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).keys_with_prefix(prefix)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        (**self).write_batch(batch)
    }
}

/// A [`CryptoStore`] on top of a [`KeyValueBackend`].
#[derive(Debug)]
pub struct KvStore<B: KeyValueBackend> {
    backend: B,
    memory: MemoryStore,
}

impl<B: KeyValueBackend> KvStore<B> {
    /// Open the store, loading all the rows of the backend.
    pub fn open(backend: B) -> Result<Self> {
        let changes = Self::load(&backend)?;
        debug!(
            sessions = changes.sessions.len(),
            inbound_group_sessions = changes.inbound_group_sessions.len(),
            "Opened a key-value crypto store"
        );

        Ok(Self { backend, memory: MemoryStore::from_changes(changes) })
    }

    fn read<T: DeserializeOwned>(backend: &B, key: &str) -> Result<Option<T>> {
        backend.get(key)?.map(|v| serde_json::from_slice(&v)).transpose().map_err(Into::into)
    }

    fn read_all<T: DeserializeOwned>(backend: &B, prefix: &str) -> Result<Vec<T>> {
        backend
            .keys_with_prefix(prefix)?
            .into_iter()
            .filter_map(|key| Self::read(backend, &key).transpose())
            .collect()
    }

    fn load(backend: &B) -> Result<Changes> {
        let room_settings: Vec<(OwnedRoomId, EncryptionSettings)> =
            Self::read_all(backend, ROOM_SETTINGS)?;
        let secrets: Vec<(String, String)> = Self::read_all(backend, SECRETS)?;
        let parked: Vec<Vec<ParkedSharedHistory>> = Self::read_all(backend, PARKED)?;

        Ok(Changes {
            account: Self::read(backend, ACCOUNT)?,
            sessions: Self::read_all(backend, SESSIONS)?,
            inbound_group_sessions: Self::read_all(backend, INBOUND_GROUP_SESSIONS)?,
            outbound_group_sessions: Self::read_all(backend, OUTBOUND_GROUP_SESSIONS)?,
            withheld_info: Self::read_all(backend, WITHHELD)?,
            device_data: Self::read(backend, DEVICE_DATA)?,
            room_settings: room_settings.into_iter().collect(),
            message_hashes: Self::read_all(backend, MESSAGE_HASHES)?,
            key_requests: Self::read_all(backend, KEY_REQUESTS)?,
            secrets: secrets.into_iter().collect(),
            parked_shared_history: parked
                .into_iter()
                .flatten()
                .map(|p| (p.key.room_id.clone(), p))
                .collect(),
            backup_version: Self::read::<String>(backend, BACKUP_VERSION)?.map(Some),
            ..Default::default()
        })
    }

    fn inbound_group_session_key(session: &PickledInboundGroupSession) -> String {
        format!("{INBOUND_GROUP_SESSIONS}{}|{}", session.sender_key, session.session_id)
    }

    fn write_changes(&self, changes: &Changes) -> Result<()> {
        let mut batch = Batch::default();
        let reset_backup = matches!(changes.backup_version, Some(None));

        if let Some(account) = &changes.account {
            batch.put(ACCOUNT.to_owned(), account)?;
        }

        for session in &changes.sessions {
            let key = format!("{SESSIONS}{}|{}", session.sender_key.to_base64(), session.session_id);
            batch.put(key, session)?;
        }

        for session in &changes.inbound_group_sessions {
            let key = Self::inbound_group_session_key(session);

            if reset_backup && session.backed_up {
                batch.put(key, &PickledInboundGroupSession { backed_up: false, ..session.clone() })?;
            } else {
                batch.put(key, session)?;
            }
        }

        for session in &changes.outbound_group_sessions {
            batch.put(format!("{OUTBOUND_GROUP_SESSIONS}{}", session.room_id), session)?;
        }

        for info in &changes.withheld_info {
            let session_id = info.session_id.as_deref().unwrap_or_default();
            batch.put(format!("{WITHHELD}{}|{session_id}", info.sender_key), info)?;
        }

        // The sync token lives inside the blob, it can't get ahead of the
        // device data it belongs to.
        if let Some(device_data) = &changes.device_data {
            batch.put(DEVICE_DATA.to_owned(), device_data)?;
        }

        for (room_id, settings) in &changes.room_settings {
            batch.put(format!("{ROOM_SETTINGS}{room_id}"), &(room_id, settings))?;
        }

        for hash in &changes.message_hashes {
            batch.put(format!("{MESSAGE_HASHES}{}|{}", hash.sender_key, hash.hash), hash)?;
        }

        for request_id in &changes.removed_key_requests {
            batch.remove(format!("{KEY_REQUESTS}{request_id}"));
        }

        for request in &changes.key_requests {
            batch.put(format!("{KEY_REQUESTS}{}", request.request_id), request)?;
        }

        for name in &changes.removed_secrets {
            batch.remove(format!("{SECRETS}{name}"));
        }

        for (name, secret) in &changes.secrets {
            batch.put(format!("{SECRETS}{name}"), &(name, secret))?;
        }

        for room_id in &changes.taken_parked_shared_history {
            batch.remove(format!("{PARKED}{room_id}"));
        }

        let mut parked: BTreeMap<&OwnedRoomId, Vec<ParkedSharedHistory>> = BTreeMap::new();
        for (room_id, entry) in &changes.parked_shared_history {
            parked.entry(room_id).or_default().push(entry.clone());
        }

        for (room_id, mut entries) in parked {
            let mut existing: Vec<ParkedSharedHistory> =
                if changes.taken_parked_shared_history.iter().any(|r| r == room_id) {
                    Vec::new()
                } else {
                    Self::read(&self.backend, &format!("{PARKED}{room_id}"))?.unwrap_or_default()
                };
            existing.append(&mut entries);

            batch.put(format!("{PARKED}{room_id}"), &existing)?;
        }

        match &changes.backup_version {
            Some(Some(version)) => batch.put(BACKUP_VERSION.to_owned(), version)?,
            Some(None) => {
                batch.remove(BACKUP_VERSION.to_owned());
                self.reset_backup_state_rows(&mut batch)?;
            }
            None => {}
        }

        batch.commit(&self.backend)
    }

    /// Clear the backup flag of every stored inbound group session that
    /// isn't part of the batch already.
    fn reset_backup_state_rows(&self, batch: &mut Batch) -> Result<()> {
        let sessions: Vec<PickledInboundGroupSession> =
            Self::read_all(&self.backend, INBOUND_GROUP_SESSIONS)?;

        for mut session in sessions.into_iter().filter(|s| s.backed_up) {
            let key = Self::inbound_group_session_key(&session);

            if !batch.contains(&key) {
                session.backed_up = false;
                batch.put(key, &session)?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl<B: KeyValueBackend> CryptoStore for KvStore<B> {
    async fn load_account(&self) -> Result<Option<PickledAccount>> {
        self.memory.load_account().await
    }

    async fn save_changes(&self, changes: Changes) -> Result<()> {
        self.write_changes(&changes)?;
        self.memory.save_changes(changes).await
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Vec<PickledSession>> {
        self.memory.get_sessions(sender_key).await
    }

    async fn get_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<PickledInboundGroupSession>> {
        self.memory.get_inbound_group_session(sender_key, session_id).await
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<PickledInboundGroupSession>> {
        self.memory.get_inbound_group_sessions().await
    }

    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts> {
        self.memory.inbound_group_session_counts().await
    }

    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<PickledInboundGroupSession>> {
        self.memory.inbound_group_sessions_for_backup(limit).await
    }

    async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        sessions: &[(String, String)],
    ) -> Result<()> {
        let mut batch = Batch::default();

        for (sender_key, session_id) in sessions {
            let key = format!("{INBOUND_GROUP_SESSIONS}{sender_key}|{session_id}");

            if let Some(mut session) =
                Self::read::<PickledInboundGroupSession>(&self.backend, &key)?
            {
                session.backed_up = true;
                batch.put(key, &session)?;
            }
        }

        batch.commit(&self.backend)?;
        self.memory.mark_inbound_group_sessions_as_backed_up(sessions).await
    }

    async fn reset_backup_state(&self) -> Result<()> {
        let mut batch = Batch::default();
        self.reset_backup_state_rows(&mut batch)?;
        batch.commit(&self.backend)?;

        self.memory.reset_backup_state().await
    }

    async fn get_withheld_info(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<RoomKeyWithheldContent>> {
        self.memory.get_withheld_info(sender_key, session_id).await
    }

    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<PickledOutboundGroupSession>> {
        self.memory.get_outbound_group_session(room_id).await
    }

    async fn load_device_data(&self) -> Result<Option<DeviceDataBlob>> {
        self.memory.load_device_data().await
    }

    async fn get_room_settings(&self, room_id: &RoomId) -> Result<Option<EncryptionSettings>> {
        self.memory.get_room_settings(room_id).await
    }

    async fn is_message_known(&self, message_hash: &OlmMessageHash) -> Result<bool> {
        self.memory.is_message_known(message_hash).await
    }

    async fn get_outgoing_key_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<OutgoingRoomKeyRequest>> {
        self.memory.get_outgoing_key_request(request_id).await
    }

    async fn get_outgoing_key_request_by_info(
        &self,
        info: &RequestedKeyInfo,
    ) -> Result<Option<OutgoingRoomKeyRequest>> {
        self.memory.get_outgoing_key_request_by_info(info).await
    }

    async fn get_outgoing_key_requests_by_state(
        &self,
        states: &[RequestState],
    ) -> Result<Vec<OutgoingRoomKeyRequest>> {
        self.memory.get_outgoing_key_requests_by_state(states).await
    }

    async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        self.memory.get_secret(name).await
    }

    async fn get_parked_shared_history(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<ParkedSharedHistory>> {
        self.memory.get_parked_shared_history(room_id).await
    }

    async fn get_backup_version(&self) -> Result<Option<String>> {
        self.memory.get_backup_version().await
    }

    async fn snapshot(&self) -> Result<Changes> {
        self.memory.snapshot().await
    }

    async fn clear(&self) -> Result<()> {
        let mut batch = Batch::default();

        for key in self.backend.keys_with_prefix("crypto.")? {
            batch.remove(key);
        }

        batch.commit(&self.backend)?;
        self.memory.clear().await
    }
}
