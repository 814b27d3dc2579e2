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

//! The contract between the crypto machinery and the HTTP layer.
//!
//! The crypto machinery never talks to the homeserver itself, every request
//! goes through an implementation of [`CryptoTransport`].

use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use ruma::{OwnedDeviceId, OwnedEventId, OwnedUserId, RoomId, TransactionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{
    backup::{KeyBackupVersion, RoomKeyBackupInfo, RoomKeysUpload},
    CrossSigningKey, CrossSigningKeys, DeviceKeys, SignedKey,
};

/// Messages of a to-device request, keyed by the user and then by the device
/// id, or `*` for all the devices of the user.
pub type ToDeviceMessages = BTreeMap<OwnedUserId, BTreeMap<String, Value>>;

/// Error type for failed transport requests.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The transport doesn't implement the request.
    #[error("the request {0} isn't supported by the transport")]
    Unsupported(&'static str),

    /// The request didn't reach the server or the response got lost.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with an error.
    #[error("the server returned an error, status {status}: {message}")]
    Server {
        /// The HTTP status code.
        status: u16,
        /// The error message of the server.
        message: String,
    },

    /// The server asked us to slow down.
    #[error("the request was rate limited")]
    RateLimited {
        /// How long the server asked us to wait.
        retry_after: Option<Duration>,
    },
}

impl TransportError {
    /// Can the failed request be retried as is.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Network(_) | TransportError::RateLimited { .. })
            || matches!(self, TransportError::Server { status, .. } if *status >= 500)
    }
}

/// The response of a `/keys/query` request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    /// The device keys, per user and device.
    #[serde(default)]
    pub device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>,
    /// The master cross-signing keys of the users.
    #[serde(default)]
    pub master_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    /// The self-signing keys of the users.
    #[serde(default)]
    pub self_signing_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    /// The user-signing keys, only returned for our own user.
    #[serde(default)]
    pub user_signing_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    /// The servers that couldn't be reached.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// The response of a `/keys/claim` request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// The claimed one-time keys, per user, device and key id.
    #[serde(default)]
    pub one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, BTreeMap<String, SignedKey>>>,
    /// The servers that couldn't be reached.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// The body of a `/keys/upload` request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadRequest {
    /// The signed device keys, only uploaded once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// The signed one-time keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub one_time_keys: BTreeMap<String, SignedKey>,
    /// The signed fallback keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fallback_keys: BTreeMap<String, SignedKey>,
}

/// Signatures to upload, per signed user and then per signed key id, the
/// whole signed object.
pub type SignatureUploadRequest = BTreeMap<OwnedUserId, BTreeMap<String, Value>>;

/// The HTTP operations the crypto machinery needs.
///
/// Every method has a default implementation failing with
/// [`TransportError::Unsupported`], so test doubles only need to implement
/// what they exercise.
#[async_trait]
pub trait CryptoTransport: fmt::Debug + Send + Sync {
    /// Upload our device keys, one-time keys and fallback keys.
    ///
    /// Returns the number of one-time keys the server holds, per algorithm.
    async fn upload_keys(
        &self,
        request: KeysUploadRequest,
    ) -> Result<BTreeMap<String, u64>, TransportError> {
        let _ = request;
        Err(TransportError::Unsupported("upload_keys"))
    }

    /// Download the device and cross-signing keys of the given users.
    async fn query_keys(&self, users: &[OwnedUserId]) -> Result<KeysQueryResponse, TransportError> {
        let _ = users;
        Err(TransportError::Unsupported("query_keys"))
    }

    /// Claim one-time keys, of the given algorithm, for the given devices.
    async fn claim_one_time_keys(
        &self,
        devices: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>>,
        timeout: Duration,
    ) -> Result<KeysClaimResponse, TransportError> {
        let _ = (devices, timeout);
        Err(TransportError::Unsupported("claim_one_time_keys"))
    }

    /// Upload signatures of devices and cross-signing keys.
    async fn upload_signatures(
        &self,
        signatures: SignatureUploadRequest,
    ) -> Result<(), TransportError> {
        let _ = signatures;
        Err(TransportError::Unsupported("upload_signatures"))
    }

    /// Upload new public cross-signing keys.
    async fn upload_cross_signing_keys(&self, keys: CrossSigningKeys) -> Result<(), TransportError> {
        let _ = keys;
        Err(TransportError::Unsupported("upload_cross_signing_keys"))
    }

    /// Send a to-device event.
    async fn send_to_device(
        &self,
        event_type: &str,
        txn_id: &TransactionId,
        messages: ToDeviceMessages,
    ) -> Result<(), TransportError> {
        let _ = (event_type, txn_id, messages);
        Err(TransportError::Unsupported("send_to_device"))
    }

    /// Send an event into a room, returns the event id of the sent event.
    async fn send_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        txn_id: &TransactionId,
        content: Value,
    ) -> Result<OwnedEventId, TransportError> {
        let _ = (room_id, event_type, txn_id, content);
        Err(TransportError::Unsupported("send_room_event"))
    }

    /// Get a global account data event of our own user.
    async fn get_account_data(&self, event_type: &str) -> Result<Option<Value>, TransportError> {
        let _ = event_type;
        Err(TransportError::Unsupported("get_account_data"))
    }

    /// Set a global account data event of our own user.
    async fn set_account_data(&self, event_type: &str, content: Value) -> Result<(), TransportError> {
        let _ = (event_type, content);
        Err(TransportError::Unsupported("set_account_data"))
    }

    /// Get the current key backup version, `None` if there's no backup.
    async fn get_key_backup_version(&self) -> Result<Option<KeyBackupVersion>, TransportError> {
        Err(TransportError::Unsupported("get_key_backup_version"))
    }

    /// Create a new key backup version, returns the version string.
    async fn create_key_backup_version(
        &self,
        info: RoomKeyBackupInfo,
    ) -> Result<String, TransportError> {
        let _ = info;
        Err(TransportError::Unsupported("create_key_backup_version"))
    }

    /// Upload room keys to the given backup version.
    async fn upload_room_keys(
        &self,
        version: &str,
        keys: RoomKeysUpload,
    ) -> Result<(), TransportError> {
        let _ = (version, keys);
        Err(TransportError::Unsupported("upload_room_keys"))
    }

    /// Download room keys of the given backup version, optionally restricted
    /// to a room or a single session.
    async fn download_room_keys(
        &self,
        version: &str,
        room_id: Option<&RoomId>,
        session_id: Option<&str>,
    ) -> Result<RoomKeysUpload, TransportError> {
        let _ = (version, room_id, session_id);
        Err(TransportError::Unsupported("download_room_keys"))
    }
}
