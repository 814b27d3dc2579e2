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

//! Types and traits to implement the storage layer for the crypto machinery.
//!
//! The state of the crypto machinery is persisted through the [`CryptoStore`]
//! trait. Three backends are provided: the [`MemoryStore`], which keeps
//! everything in memory and is the base the others build on, and the
//! [`KvStore`] which persists every row into a flat [`KeyValueBackend`].
//!
//! Inside the crate the backend is wrapped in a [`Store`], which serializes
//! read-modify-write sequences through [`Store::transaction()`] and falls back
//! to a [`MemoryStore`] if the backend stops accepting writes.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock as StdRwLock,
    },
};

use async_trait::async_trait;
use ruma::{OwnedRoomId, OwnedTransactionId, RoomId, TransactionId};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, warn};

use crate::{
    gossiping::{OutgoingRoomKeyRequest, RequestState},
    identities::DeviceDataBlob,
    olm::{
        EncryptionSettings, OlmMessageHash, ParkedSharedHistory, PickledAccount,
        PickledInboundGroupSession, PickledOutboundGroupSession, PickledSession,
    },
    types::events::{RequestedKeyInfo, RoomKeyWithheldContent},
};


mod error;
mod kvstore;
mod memorystore;
mod traits;

pub use error::{CryptoStoreError, Result};
pub use kvstore::{KeyValueBackend, KvStore, MemoryKeyValueBackend, WriteBatch};
pub use memorystore::MemoryStore;
pub use traits::CryptoStore;

/// Aggregated changes to be saved in the database.
///
/// Every field is written as one unit, a backend either persists all of them
/// or fails.
#[derive(Clone, Debug, Default)]
#[allow(missing_docs)]
pub struct Changes {
    pub account: Option<PickledAccount>,
    pub sessions: Vec<PickledSession>,
    pub inbound_group_sessions: Vec<PickledInboundGroupSession>,
    pub outbound_group_sessions: Vec<PickledOutboundGroupSession>,
    pub withheld_info: Vec<RoomKeyWithheldContent>,
    pub device_data: Option<DeviceDataBlob>,
    pub room_settings: BTreeMap<OwnedRoomId, EncryptionSettings>,
    pub message_hashes: Vec<OlmMessageHash>,
    pub key_requests: Vec<OutgoingRoomKeyRequest>,
    pub removed_key_requests: Vec<OwnedTransactionId>,
    pub secrets: BTreeMap<String, String>,
    pub removed_secrets: Vec<String>,
    pub parked_shared_history: Vec<(OwnedRoomId, ParkedSharedHistory)>,
    pub taken_parked_shared_history: Vec<OwnedRoomId>,
    /// `Some(None)` disables the backup and resets the backup flags of all
    /// inbound group sessions.
    pub backup_version: Option<Option<String>>,
}

impl Changes {
    /// Are there any changes stored or is this an empty `Changes` struct.
    pub fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.sessions.is_empty()
            && self.inbound_group_sessions.is_empty()
            && self.outbound_group_sessions.is_empty()
            && self.withheld_info.is_empty()
            && self.device_data.is_none()
            && self.room_settings.is_empty()
            && self.message_hashes.is_empty()
            && self.key_requests.is_empty()
            && self.removed_key_requests.is_empty()
            && self.secrets.is_empty()
            && self.removed_secrets.is_empty()
            && self.parked_shared_history.is_empty()
            && self.taken_parked_shared_history.is_empty()
            && self.backup_version.is_none()
    }
}

/// Struct holding info about how many room keys the store has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomKeyCounts {
    /// The total number of room keys the store has.
    pub total: usize,
    /// The number of backed up room keys the store has.
    pub backed_up: usize,
}

/// A wrapper around a [`CryptoStore`] backend.
///
/// If the backend fails to persist a set of changes, the `Store` switches to
/// a [`MemoryStore`] seeded with everything the backend still returns, so the
/// current process keeps working without durability.
#[derive(Clone)]
pub(crate) struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    backend: StdRwLock<Arc<dyn CryptoStore>>,
    degraded: AtomicBool,
    transaction_lock: Arc<Mutex<()>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.backend())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl Store {
    pub(crate) fn new(backend: Arc<dyn CryptoStore>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend: StdRwLock::new(backend),
                degraded: AtomicBool::new(false),
                transaction_lock: Default::default(),
            }),
        }
    }

    fn backend(&self) -> Arc<dyn CryptoStore> {
        self.inner.backend.read().unwrap().clone()
    }

    /// Did the backend fail and are we running on the in-memory fallback.
    pub(crate) fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    /// Start a new transaction.
    ///
    /// Only one transaction can be alive at a time, a second caller waits
    /// until the first one is committed or dropped.
    pub(crate) async fn transaction(&self) -> StoreTransaction {
        let guard = self.inner.transaction_lock.clone().lock_owned().await;
        StoreTransaction { store: self.clone(), changes: Changes::default(), _guard: guard }
    }

    async fn degrade(&self, changes: Changes, error: CryptoStoreError) -> Result<()> {
        error!(?error, "The crypto store failed to persist changes, falling back to memory");

        let backend = self.backend();
        let snapshot = match backend.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = ?e, "Couldn't snapshot the failed crypto store, starting empty");
                Changes::default()
            }
        };

        let fallback = MemoryStore::from_changes(snapshot);
        fallback.apply(changes);

        *self.inner.backend.write().unwrap() = Arc::new(fallback);
        self.inner.degraded.store(true, Ordering::SeqCst);

        Ok(())
    }
}

#[async_trait]
impl CryptoStore for Store {
    async fn load_account(&self) -> Result<Option<PickledAccount>> {
        self.backend().load_account().await
    }

    async fn save_changes(&self, changes: Changes) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let backend = self.backend();

        match backend.save_changes(changes.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => self.degrade(changes, e).await,
        }
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Vec<PickledSession>> {
        self.backend().get_sessions(sender_key).await
    }

    async fn get_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<PickledInboundGroupSession>> {
        self.backend().get_inbound_group_session(sender_key, session_id).await
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<PickledInboundGroupSession>> {
        self.backend().get_inbound_group_sessions().await
    }

    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts> {
        self.backend().inbound_group_session_counts().await
    }

    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<PickledInboundGroupSession>> {
        self.backend().inbound_group_sessions_for_backup(limit).await
    }

    async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        sessions: &[(String, String)],
    ) -> Result<()> {
        if let Err(e) = self.backend().mark_inbound_group_sessions_as_backed_up(sessions).await {
            self.degrade(Changes::default(), e).await?;
            self.backend().mark_inbound_group_sessions_as_backed_up(sessions).await?;
        }

        Ok(())
    }

    async fn reset_backup_state(&self) -> Result<()> {
        if let Err(e) = self.backend().reset_backup_state().await {
            self.degrade(Changes::default(), e).await?;
            self.backend().reset_backup_state().await?;
        }

        Ok(())
    }

    async fn get_withheld_info(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<RoomKeyWithheldContent>> {
        self.backend().get_withheld_info(sender_key, session_id).await
    }

    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<PickledOutboundGroupSession>> {
        self.backend().get_outbound_group_session(room_id).await
    }

    async fn load_device_data(&self) -> Result<Option<DeviceDataBlob>> {
        self.backend().load_device_data().await
    }

    async fn get_room_settings(&self, room_id: &RoomId) -> Result<Option<EncryptionSettings>> {
        self.backend().get_room_settings(room_id).await
    }

    async fn is_message_known(&self, message_hash: &OlmMessageHash) -> Result<bool> {
        self.backend().is_message_known(message_hash).await
    }

    async fn get_outgoing_key_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<OutgoingRoomKeyRequest>> {
        self.backend().get_outgoing_key_request(request_id).await
    }

    async fn get_outgoing_key_request_by_info(
        &self,
        info: &RequestedKeyInfo,
    ) -> Result<Option<OutgoingRoomKeyRequest>> {
        self.backend().get_outgoing_key_request_by_info(info).await
    }

    async fn get_outgoing_key_requests_by_state(
        &self,
        states: &[RequestState],
    ) -> Result<Vec<OutgoingRoomKeyRequest>> {
        self.backend().get_outgoing_key_requests_by_state(states).await
    }

    async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        self.backend().get_secret(name).await
    }

    async fn get_parked_shared_history(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<ParkedSharedHistory>> {
        self.backend().get_parked_shared_history(room_id).await
    }

    async fn get_backup_version(&self) -> Result<Option<String>> {
        self.backend().get_backup_version().await
    }

    async fn snapshot(&self) -> Result<Changes> {
        self.backend().snapshot().await
    }

    async fn clear(&self) -> Result<()> {
        self.backend().clear().await
    }
}

/// A unit of work on the [`Store`].
///
/// Changes are collected in the transaction and written as one unit on
/// [`StoreTransaction::commit()`]. Dropping the transaction discards them.
pub(crate) struct StoreTransaction {
    store: Store,
    changes: Changes,
    _guard: OwnedMutexGuard<()>,
}

impl fmt::Debug for StoreTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreTransaction").field("changes", &self.changes).finish_non_exhaustive()
    }
}

impl StoreTransaction {
    /// The store the transaction runs on, for reads.
    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    /// The changes that will be written on commit.
    pub(crate) fn changes(&mut self) -> &mut Changes {
        &mut self.changes
    }

    /// Write the collected changes.
    pub(crate) async fn commit(self) -> Result<()> {
        self.store.save_changes(self.changes).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use ruma::{RoomId, TransactionId};

    use super::{Changes, CryptoStore, CryptoStoreError, MemoryStore, Result, RoomKeyCounts, Store};
    use crate::{
        gossiping::{OutgoingRoomKeyRequest, RequestState},
        identities::DeviceDataBlob,
        olm::{
            EncryptionSettings, OlmMessageHash, ParkedSharedHistory, PickledAccount,
            PickledInboundGroupSession, PickledOutboundGroupSession, PickledSession,
        },
        types::events::{RequestedKeyInfo, RoomKeyWithheldContent},
    };

    /// A store that serves reads from memory but refuses every write.
    #[derive(Debug, Default)]
    struct FailingStore {
        memory: MemoryStore,
    }

    #[async_trait]
    impl CryptoStore for FailingStore {
        async fn load_account(&self) -> Result<Option<PickledAccount>> {
            self.memory.load_account().await
        }

        async fn save_changes(&self, _: Changes) -> Result<()> {
            Err(CryptoStoreError::Unavailable("quota exceeded".to_owned()))
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
            _: &[(String, String)],
        ) -> Result<()> {
            Err(CryptoStoreError::Unavailable("quota exceeded".to_owned()))
        }

        async fn reset_backup_state(&self) -> Result<()> {
            Err(CryptoStoreError::Unavailable("quota exceeded".to_owned()))
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

        async fn get_room_settings(
            &self,
            room_id: &RoomId,
        ) -> Result<Option<EncryptionSettings>> {
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
            self.memory.clear().await
        }
    }

    #[tokio::test]
    async fn failing_backend_degrades_to_memory() {
        let backend = FailingStore::default();
        backend.memory.apply(Changes {
            secrets: [("existing".to_owned(), "old".to_owned())].into(),
            ..Default::default()
        });

        let store = Store::new(Arc::new(backend));
        assert!(!store.is_degraded());

        let changes = Changes {
            secrets: [("new".to_owned(), "fresh".to_owned())].into(),
            ..Default::default()
        };
        store.save_changes(changes).await.unwrap();

        assert!(store.is_degraded());
        assert_eq!(store.get_secret("existing").await.unwrap().as_deref(), Some("old"));
        assert_eq!(store.get_secret("new").await.unwrap().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn transactions_are_serialized() {
        let store = Store::new(Arc::new(MemoryStore::new()));

        let mut transaction = store.transaction().await;
        transaction.changes().secrets.insert("first".to_owned(), "1".to_owned());

        let second = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut transaction = store.transaction().await;
                let first = transaction.store().get_secret("first").await.unwrap();
                transaction.changes().secrets.insert("second".to_owned(), "2".to_owned());
                transaction.commit().await.unwrap();

                first
            })
        };

        tokio::task::yield_now().await;
        transaction.commit().await.unwrap();

        let seen_by_second = second.await.unwrap();
        assert_eq!(seen_by_second.as_deref(), Some("1"));
        assert_eq!(store.get_secret("second").await.unwrap().as_deref(), Some("2"));
    }

    async fn get_store(_name: &str) -> Store {
        Store::new(Arc::new(MemoryStore::new()))
    }

    cryptostore_integration_tests!();
}
