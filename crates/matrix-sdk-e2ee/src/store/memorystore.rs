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

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::RwLock as StdRwLock,
};

use async_trait::async_trait;
use ruma::{OwnedRoomId, OwnedTransactionId, RoomId, TransactionId};

use super::{Changes, CryptoStore, Result, RoomKeyCounts};
use crate::{
    gossiping::{OutgoingRoomKeyRequest, RequestState},
    identities::DeviceDataBlob,
    olm::{
        EncryptionSettings, OlmMessageHash, ParkedSharedHistory, PickledAccount,
        PickledInboundGroupSession, PickledOutboundGroupSession, PickledSession,
    },
    types::events::{RequestedKeyInfo, RoomKeyWithheldContent},
};

/// `(sender_key, session_id)`, the key under which group sessions and their
/// withheld info are filed.
type GroupSessionKey = (String, String);

#[derive(Debug, Default)]
struct MemoryStoreInner {
    account: Option<PickledAccount>,
    // Map of sender_key to map of session_id to the pickle
    sessions: BTreeMap<String, BTreeMap<String, PickledSession>>,
    inbound_group_sessions: BTreeMap<GroupSessionKey, PickledInboundGroupSession>,
    outbound_group_sessions: BTreeMap<OwnedRoomId, PickledOutboundGroupSession>,
    withheld_info: BTreeMap<GroupSessionKey, RoomKeyWithheldContent>,
    device_data: Option<DeviceDataBlob>,
    room_settings: BTreeMap<OwnedRoomId, EncryptionSettings>,
    message_hashes: BTreeSet<OlmMessageHash>,
    key_requests: BTreeMap<OwnedTransactionId, OutgoingRoomKeyRequest>,
    secrets: BTreeMap<String, String>,
    parked_shared_history: BTreeMap<OwnedRoomId, Vec<ParkedSharedHistory>>,
    backup_version: Option<String>,
}

impl MemoryStoreInner {
    fn apply(&mut self, changes: Changes) {
        if let Some(account) = changes.account {
            self.account = Some(account);
        }

        for session in changes.sessions {
            self.sessions
                .entry(session.sender_key.to_base64())
                .or_default()
                .insert(session.session_id.clone(), session);
        }

        for session in changes.inbound_group_sessions {
            self.inbound_group_sessions
                .insert((session.sender_key.clone(), session.session_id.clone()), session);
        }

        for session in changes.outbound_group_sessions {
            self.outbound_group_sessions.insert(session.room_id.clone(), session);
        }

        for info in changes.withheld_info {
            let key = (info.sender_key.clone(), info.session_id.clone().unwrap_or_default());
            self.withheld_info.insert(key, info);
        }

        if let Some(device_data) = changes.device_data {
            self.device_data = Some(device_data);
        }

        self.room_settings.extend(changes.room_settings);
        self.message_hashes.extend(changes.message_hashes);

        for request_id in changes.removed_key_requests {
            self.key_requests.remove(&request_id);
        }

        for request in changes.key_requests {
            self.key_requests.insert(request.request_id.clone(), request);
        }

        for name in changes.removed_secrets {
            self.secrets.remove(&name);
        }

        self.secrets.extend(changes.secrets);

        for room_id in changes.taken_parked_shared_history {
            self.parked_shared_history.remove(&room_id);
        }

        for (room_id, parked) in changes.parked_shared_history {
            self.parked_shared_history.entry(room_id).or_default().push(parked);
        }

        if let Some(version) = changes.backup_version {
            if version.is_none() {
                self.reset_backup_state();
            }

            self.backup_version = version;
        }
    }

    fn reset_backup_state(&mut self) {
        for session in self.inbound_group_sessions.values_mut() {
            session.backed_up = false;
        }
    }

    fn snapshot(&self) -> Changes {
        Changes {
            account: self.account.clone(),
            sessions: self.sessions.values().flat_map(|s| s.values().cloned()).collect(),
            inbound_group_sessions: self.inbound_group_sessions.values().cloned().collect(),
            outbound_group_sessions: self.outbound_group_sessions.values().cloned().collect(),
            withheld_info: self.withheld_info.values().cloned().collect(),
            device_data: self.device_data.clone(),
            room_settings: self.room_settings.clone(),
            message_hashes: self.message_hashes.iter().cloned().collect(),
            key_requests: self.key_requests.values().cloned().collect(),
            secrets: self.secrets.clone(),
            parked_shared_history: self
                .parked_shared_history
                .iter()
                .flat_map(|(room_id, p)| p.iter().map(|p| (room_id.clone(), p.clone())))
                .collect(),
            backup_version: self.backup_version.clone().map(Some),
            ..Default::default()
        }
    }
}

/// An in-memory only store that will forget all the E2EE key once it's
/// dropped.
///
/// The other store backends build on top of it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: StdRwLock<MemoryStoreInner>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a `MemoryStore` holding the given changes.
    pub fn from_changes(changes: Changes) -> Self {
        let store = Self::new();
        store.apply(changes);

        store
    }

    pub(crate) fn apply(&self, changes: Changes) {
        self.inner.write().unwrap().apply(changes);
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<PickledAccount>> {
        Ok(self.inner.read().unwrap().account.clone())
    }

    async fn save_changes(&self, changes: Changes) -> Result<()> {
        self.apply(changes);
        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Vec<PickledSession>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .sessions
            .get(sender_key)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<PickledInboundGroupSession>> {
        let key = (sender_key.to_owned(), session_id.to_owned());
        Ok(self.inner.read().unwrap().inbound_group_sessions.get(&key).cloned())
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<PickledInboundGroupSession>> {
        Ok(self.inner.read().unwrap().inbound_group_sessions.values().cloned().collect())
    }

    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts> {
        let inner = self.inner.read().unwrap();
        let total = inner.inbound_group_sessions.len();
        let backed_up = inner.inbound_group_sessions.values().filter(|s| s.backed_up).count();

        Ok(RoomKeyCounts { total, backed_up })
    }

    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<PickledInboundGroupSession>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .inbound_group_sessions
            .values()
            .filter(|s| !s.backed_up)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        sessions: &[(String, String)],
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();

        for key in sessions {
            if let Some(session) = inner.inbound_group_sessions.get_mut(key) {
                session.backed_up = true;
            }
        }

        Ok(())
    }

    async fn reset_backup_state(&self) -> Result<()> {
        self.inner.write().unwrap().reset_backup_state();
        Ok(())
    }

    async fn get_withheld_info(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<RoomKeyWithheldContent>> {
        let key = (sender_key.to_owned(), session_id.to_owned());
        Ok(self.inner.read().unwrap().withheld_info.get(&key).cloned())
    }

    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<PickledOutboundGroupSession>> {
        Ok(self.inner.read().unwrap().outbound_group_sessions.get(room_id).cloned())
    }

    async fn load_device_data(&self) -> Result<Option<DeviceDataBlob>> {
        Ok(self.inner.read().unwrap().device_data.clone())
    }

    async fn get_room_settings(&self, room_id: &RoomId) -> Result<Option<EncryptionSettings>> {
        Ok(self.inner.read().unwrap().room_settings.get(room_id).cloned())
    }

    async fn is_message_known(&self, message_hash: &OlmMessageHash) -> Result<bool> {
        Ok(self.inner.read().unwrap().message_hashes.contains(message_hash))
    }

    async fn get_outgoing_key_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<OutgoingRoomKeyRequest>> {
        Ok(self.inner.read().unwrap().key_requests.get(request_id).cloned())
    }

    async fn get_outgoing_key_request_by_info(
        &self,
        info: &RequestedKeyInfo,
    ) -> Result<Option<OutgoingRoomKeyRequest>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .key_requests
            .values()
            .find(|r| &r.request_body == info)
            .cloned())
    }

    async fn get_outgoing_key_requests_by_state(
        &self,
        states: &[RequestState],
    ) -> Result<Vec<OutgoingRoomKeyRequest>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .key_requests
            .values()
            .filter(|r| states.contains(&r.state))
            .cloned()
            .collect())
    }

    async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        Ok(self.inner.read().unwrap().secrets.get(name).cloned())
    }

    async fn get_parked_shared_history(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<ParkedSharedHistory>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .parked_shared_history
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_backup_version(&self) -> Result<Option<String>> {
        Ok(self.inner.read().unwrap().backup_version.clone())
    }

    async fn snapshot(&self) -> Result<Changes> {
        Ok(self.inner.read().unwrap().snapshot())
    }

    async fn clear(&self) -> Result<()> {
        *self.inner.write().unwrap() = MemoryStoreInner::default();
        Ok(())
    }
}
