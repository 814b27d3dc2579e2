// Copyright 2022 The Matrix.org Foundation C.I.C.
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

use std::collections::BTreeMap;

use ruma::{
    DeviceId, OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId,
    TransactionId, UserId,
};
use serde_json::{json, Value};
use tracing::debug;

use super::{
    event_enums::{REQUEST_TYPE, ROOM_MESSAGE_TYPE, START_TYPE},
    FlowId,
};
use crate::requests::{CryptoTransport, TransportError};

/// The way the events of a verification flow travel to the other side.
#[derive(Clone, Debug)]
pub(crate) enum VerificationChannel {
    /// To-device messages, the flow is identified by a transaction id.
    ToDevice {
        other_user: OwnedUserId,
        /// The device we talk to, `None` until one of the devices of the
        /// other user answered the request.
        other_device: Option<OwnedDeviceId>,
        transaction_id: OwnedTransactionId,
    },
    /// Events in a DM room, the flow is identified by the event id of the
    /// request.
    InRoom {
        room_id: OwnedRoomId,
        other_user: OwnedUserId,
        other_device: Option<OwnedDeviceId>,
        /// `None` until the request was sent.
        request_event_id: Option<OwnedEventId>,
    },
}

impl VerificationChannel {
    pub fn to_device(other_user: OwnedUserId, other_device: Option<OwnedDeviceId>) -> Self {
        Self::ToDevice { other_user, other_device, transaction_id: TransactionId::new() }
    }

    pub fn in_room(room_id: OwnedRoomId, other_user: OwnedUserId) -> Self {
        Self::InRoom { room_id, other_user, other_device: None, request_event_id: None }
    }

    /// The channel of a flow the other side started.
    pub fn from_flow_id(
        flow_id: &FlowId,
        other_user: OwnedUserId,
        other_device: OwnedDeviceId,
    ) -> Self {
        match flow_id {
            FlowId::ToDevice(t) => Self::ToDevice {
                other_user,
                other_device: Some(other_device),
                transaction_id: t.clone(),
            },
            FlowId::InRoom(r, e) => Self::InRoom {
                room_id: r.clone(),
                other_user,
                other_device: Some(other_device),
                request_event_id: Some(e.clone()),
            },
        }
    }

    pub fn flow_id(&self) -> Option<FlowId> {
        match self {
            Self::ToDevice { transaction_id, .. } => Some(FlowId::ToDevice(transaction_id.clone())),
            Self::InRoom { room_id, request_event_id, .. } => {
                request_event_id.as_ref().map(|e| FlowId::InRoom(room_id.clone(), e.clone()))
            }
        }
    }

    /// The string form of the flow id, the transaction id of to-device flows
    /// or the event id of the request for in-room flows.
    pub fn transaction_id(&self) -> Option<String> {
        self.flow_id().map(|f| f.as_str().to_owned())
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::ToDevice { .. } => None,
            Self::InRoom { room_id, .. } => Some(room_id),
        }
    }

    pub fn other_user(&self) -> &UserId {
        match self {
            Self::ToDevice { other_user, .. } | Self::InRoom { other_user, .. } => other_user,
        }
    }

    pub fn other_device(&self) -> Option<&DeviceId> {
        match self {
            Self::ToDevice { other_device, .. } | Self::InRoom { other_device, .. } => {
                other_device.as_deref()
            }
        }
    }

    pub fn set_other_device(&mut self, device_id: OwnedDeviceId) {
        match self {
            Self::ToDevice { other_device, .. } | Self::InRoom { other_device, .. } => {
                *other_device = Some(device_id)
            }
        }
    }

    pub fn set_request_event_id(&mut self, event_id: OwnedEventId) {
        if let Self::InRoom { request_event_id, .. } = self {
            *request_event_id = Some(event_id);
        }
    }

    /// Can an event of the given type, on a flow we don't know yet, create a
    /// new verification request.
    ///
    /// To-device flows may also skip the request and start right away.
    pub fn can_create_request(flow_id: &FlowId, event_type: &str) -> bool {
        match flow_id {
            FlowId::ToDevice(_) => event_type == REQUEST_TYPE || event_type == START_TYPE,
            FlowId::InRoom(..) => event_type == REQUEST_TYPE,
        }
    }

    /// Add the fields that tie the content to this flow.
    pub fn complete_content(&self, event_type: &str, mut content: Value) -> Value {
        let Some(object) = content.as_object_mut() else { return content };

        match self {
            Self::ToDevice { transaction_id, .. } => {
                object.insert("transaction_id".to_owned(), json!(transaction_id));
            }
            Self::InRoom { other_user, request_event_id, .. } => {
                if event_type == REQUEST_TYPE {
                    object.insert("msgtype".to_owned(), json!(REQUEST_TYPE));
                    object.insert("to".to_owned(), json!(other_user));
                    object.insert(
                        "body".to_owned(),
                        json!(format!(
                            "Attempting verification request ({REQUEST_TYPE}). Apparently your \
                             client doesn't support this."
                        )),
                    );
                } else if let Some(event_id) = request_event_id {
                    object.insert(
                        "m.relates_to".to_owned(),
                        json!({ "rel_type": "m.reference", "event_id": event_id }),
                    );
                }
            }
        }

        content
    }

    /// Send an event of the flow to the other side.
    ///
    /// Returns the event id of in-room events.
    pub async fn send(
        &self,
        transport: &dyn CryptoTransport,
        event_type: &str,
        content: Value,
    ) -> Result<Option<OwnedEventId>, TransportError> {
        let content = self.complete_content(event_type, content);

        debug!(flow_id = ?self.flow_id(), event_type, "Sending a verification event");

        match self {
            Self::ToDevice { other_user, other_device, .. } => {
                let device = other_device.as_ref().map_or("*", |d| d.as_str()).to_owned();
                let messages =
                    BTreeMap::from([(other_user.clone(), BTreeMap::from([(device, content)]))]);

                transport.send_to_device(event_type, &TransactionId::new(), messages).await?;

                Ok(None)
            }
            Self::InRoom { room_id, .. } => {
                let event_type =
                    if event_type == REQUEST_TYPE { ROOM_MESSAGE_TYPE } else { event_type };

                let event_id = transport
                    .send_room_event(room_id, event_type, &TransactionId::new(), content)
                    .await?;

                Ok(Some(event_id))
            }
        }
    }
}
