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

use std::fmt;

use async_trait::async_trait;
use ruma::{RoomId, TransactionId};

use super::{Changes, Result, RoomKeyCounts};
use crate::{
    gossiping::{OutgoingRoomKeyRequest, RequestState},
    identities::DeviceDataBlob,
    olm::{
        EncryptionSettings, OlmMessageHash, ParkedSharedHistory, PickledAccount,
        PickledInboundGroupSession, PickledOutboundGroupSession, PickledSession,
    },
    types::events::{RequestedKeyInfo, RoomKeyWithheldContent},
};

/// Trait abstracting a store that the crypto machinery uses to persist its
/// state.
///
/// All values are handed over in their pickled form, the store never sees
/// unencrypted Olm state.
#[async_trait]
pub trait CryptoStore: fmt::Debug + Send + Sync {
    /// Load an account that was previously stored.
    async fn load_account(&self) -> Result<Option<PickledAccount>>;

    /// Save the set of changes to the store.
    ///
    /// # Arguments
    ///
    /// * `changes` - The set of changes that should be stored.
    async fn save_changes(&self, changes: Changes) -> Result<()>;

    /// Get all the sessions that belong to the given sender key.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The sender key that was used to establish the sessions.
    async fn get_sessions(&self, sender_key: &str) -> Result<Vec<PickledSession>>;

    /// Get the inbound group session from our store.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The sender key that sent us the session.
    ///
    /// * `session_id` - The unique id of the session.
    async fn get_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<PickledInboundGroupSession>>;

    /// Get all the inbound group sessions we have stored.
    async fn get_inbound_group_sessions(&self) -> Result<Vec<PickledInboundGroupSession>>;

    /// Get the number inbound group sessions we have and how many of them are
    /// backed up.
    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts>;

    /// Get up to `limit` inbound group sessions we have not backed up yet.
    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<PickledInboundGroupSession>>;

    /// Mark the given inbound group sessions, given as `(sender_key,
    /// session_id)` pairs, as backed up.
    async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        sessions: &[(String, String)],
    ) -> Result<()>;

    /// Reset the backup state of all the stored inbound group sessions.
    async fn reset_backup_state(&self) -> Result<()>;

    /// Get the reason why the given group session was withheld from us, if
    /// it was.
    async fn get_withheld_info(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<RoomKeyWithheldContent>>;

    /// Get the outbound group session we have stored that is used for the
    /// given room.
    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<PickledOutboundGroupSession>>;

    /// Load the device data blob, the devices, cross-signing info, tracking
    /// status and sync token, written as one unit.
    async fn load_device_data(&self) -> Result<Option<DeviceDataBlob>>;

    /// Get the encryption settings of the given room.
    async fn get_room_settings(&self, room_id: &RoomId) -> Result<Option<EncryptionSettings>>;

    /// Check if a hash for an Olm message stored in the database.
    async fn is_message_known(&self, message_hash: &OlmMessageHash) -> Result<bool>;

    /// Get an outgoing room key request by its request id.
    async fn get_outgoing_key_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<OutgoingRoomKeyRequest>>;

    /// Get an outgoing room key request that asks for the given key.
    async fn get_outgoing_key_request_by_info(
        &self,
        info: &RequestedKeyInfo,
    ) -> Result<Option<OutgoingRoomKeyRequest>>;

    /// Get all outgoing room key requests that are in one of the given states.
    async fn get_outgoing_key_requests_by_state(
        &self,
        states: &[RequestState],
    ) -> Result<Vec<OutgoingRoomKeyRequest>>;

    /// Get a secret from the local secret cache.
    async fn get_secret(&self, name: &str) -> Result<Option<String>>;

    /// Get the room keys that are parked for the given room.
    async fn get_parked_shared_history(&self, room_id: &RoomId)
        -> Result<Vec<ParkedSharedHistory>>;

    /// Get the version of the key backup we're backing up to.
    async fn get_backup_version(&self) -> Result<Option<String>>;

    /// Dump the whole content of the store as a set of changes that would
    /// recreate it.
    async fn snapshot(&self) -> Result<Changes>;

    /// Remove everything from the store.
    async fn clear(&self) -> Result<()>;
}
