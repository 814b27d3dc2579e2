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

//! Outgoing room key requests.
//!
//! Requests for missing room keys are kept in a persisted queue, every
//! request moves through the following states:
//!
//! ```text
//! Unsent -> Sent -> CancellationPending -> (deleted)
//!             \---> CancellationPendingAndWillResend -> Sent
//! ```

mod machine;

pub(crate) use machine::GossipMachine;
use ruma::{OwnedDeviceId, OwnedTransactionId, OwnedUserId, TransactionId};
use serde::{Deserialize, Serialize};

use crate::types::events::RequestedKeyInfo;

/// The state of an [`OutgoingRoomKeyRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    /// The request was queued but not sent yet.
    Unsent,
    /// The request was sent out.
    Sent,
    /// The request was sent, a cancellation still needs to go out.
    CancellationPending,
    /// The request was sent, a cancellation needs to go out and the request
    /// is then sent again under a new id.
    CancellationPendingAndWillResend,
}

/// A user, and optionally a single device of the user, that receives a room
/// key request.
///
/// A missing device id addresses all the devices of the user.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyRequestRecipient {
    /// The user that receives the request.
    pub user_id: OwnedUserId,
    /// The device that receives the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<OwnedDeviceId>,
}

impl KeyRequestRecipient {
    /// Address all the devices of the given user.
    pub fn all_devices(user_id: OwnedUserId) -> Self {
        Self { user_id, device_id: None }
    }
}

/// A persisted request for a room key we're missing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingRoomKeyRequest {
    /// The unique id of the request, it's reused by its cancellation.
    pub request_id: OwnedTransactionId,
    /// The requested key.
    pub request_body: RequestedKeyInfo,
    /// The users and devices the request is sent to.
    pub recipients: Vec<KeyRequestRecipient>,
    /// The state of the request.
    pub state: RequestState,
    /// The transaction id of the pending cancellation, if there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_txn_id: Option<OwnedTransactionId>,
}

impl OutgoingRoomKeyRequest {
    /// Create a new, unsent, request.
    pub fn new(request_body: RequestedKeyInfo, recipients: Vec<KeyRequestRecipient>) -> Self {
        Self {
            request_id: TransactionId::new(),
            request_body,
            recipients,
            state: RequestState::Unsent,
            cancellation_txn_id: None,
        }
    }
}
