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

use std::{collections::BTreeMap, fmt};

use ruma::{MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedEventId, OwnedUserId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::warn;

use super::{CancelCode, FlowId};
use crate::types::events::{RoomEvent, ToDeviceEvent};

pub(crate) const REQUEST_TYPE: &str = "m.key.verification.request";
pub(crate) const READY_TYPE: &str = "m.key.verification.ready";
pub(crate) const START_TYPE: &str = "m.key.verification.start";
pub(crate) const ACCEPT_TYPE: &str = "m.key.verification.accept";
pub(crate) const KEY_TYPE: &str = "m.key.verification.key";
pub(crate) const MAC_TYPE: &str = "m.key.verification.mac";
pub(crate) const CANCEL_TYPE: &str = "m.key.verification.cancel";
pub(crate) const DONE_TYPE: &str = "m.key.verification.done";

/// In-room verification requests are sent as room messages.
pub(crate) const ROOM_MESSAGE_TYPE: &str = "m.room.message";

/// A verification method.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VerificationMethod {
    /// The short auth string method, `m.sas.v1`.
    SasV1,
    /// We can scan a QR code, `m.qr_code.scan.v1`.
    QrCodeScanV1,
    /// We can show a QR code, `m.qr_code.show.v1`.
    QrCodeShowV1,
    /// The method used to confirm a scanned QR code, `m.reciprocate.v1`.
    ReciprocateV1,
    /// A method we don't know about.
    Unknown(String),
}

impl VerificationMethod {
    /// The string form of the method.
    pub fn as_str(&self) -> &str {
        match self {
            VerificationMethod::SasV1 => "m.sas.v1",
            VerificationMethod::QrCodeScanV1 => "m.qr_code.scan.v1",
            VerificationMethod::QrCodeShowV1 => "m.qr_code.show.v1",
            VerificationMethod::ReciprocateV1 => "m.reciprocate.v1",
            VerificationMethod::Unknown(m) => m,
        }
    }

    /// The methods we support.
    pub fn supported() -> Vec<VerificationMethod> {
        vec![
            VerificationMethod::SasV1,
            VerificationMethod::QrCodeScanV1,
            VerificationMethod::QrCodeShowV1,
            VerificationMethod::ReciprocateV1,
        ]
    }
}

impl From<&str> for VerificationMethod {
    fn from(value: &str) -> Self {
        match value {
            "m.sas.v1" => Self::SasV1,
            "m.qr_code.scan.v1" => Self::QrCodeScanV1,
            "m.qr_code.show.v1" => Self::QrCodeShowV1,
            "m.reciprocate.v1" => Self::ReciprocateV1,
            m => Self::Unknown(m.to_owned()),
        }
    }
}

impl fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for VerificationMethod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for VerificationMethod {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.as_str().into())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct RequestContent {
    pub from_device: OwnedDeviceId,
    pub methods: Vec<VerificationMethod>,
    /// Only set for to-device requests, in-room requests use the timestamp
    /// of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<MilliSecondsSinceUnixEpoch>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ReadyContent {
    pub from_device: OwnedDeviceId,
    pub methods: Vec<VerificationMethod>,
}

/// The start event, for both the SAS and the reciprocate method.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct StartContent {
    pub from_device: OwnedDeviceId,
    pub method: VerificationMethod,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_agreement_protocols: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hashes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_authentication_codes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub short_authentication_string: Vec<String>,
    /// The unpadded base64 shared secret of a scanned QR code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct AcceptContent {
    pub method: VerificationMethod,
    pub key_agreement_protocol: String,
    pub hash: String,
    pub message_authentication_code: String,
    pub short_authentication_string: Vec<String>,
    pub commitment: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct KeyContent {
    pub key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct MacContent {
    pub mac: BTreeMap<String, String>,
    pub keys: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct CancelContent {
    pub code: CancelCode,
    #[serde(default)]
    pub reason: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct DoneContent {}

/// The parsed content of a verification event.
#[derive(Clone, Debug)]
pub(crate) enum VerificationContent {
    Request(RequestContent),
    Ready(ReadyContent),
    Start(StartContent),
    Accept(AcceptContent),
    Key(KeyContent),
    Mac(MacContent),
    Cancel(CancelContent),
    Done(DoneContent),
}

impl VerificationContent {
    /// Parse the content of an event with the given type.
    ///
    /// Returns `None` if the event isn't a verification event.
    pub fn parse(event_type: &str, content: &Value) -> Result<Option<Self>, serde_json::Error> {
        let content = content.clone();

        Ok(Some(match event_type {
            REQUEST_TYPE => Self::Request(serde_json::from_value(content)?),
            READY_TYPE => Self::Ready(serde_json::from_value(content)?),
            START_TYPE => Self::Start(serde_json::from_value(content)?),
            ACCEPT_TYPE => Self::Accept(serde_json::from_value(content)?),
            KEY_TYPE => Self::Key(serde_json::from_value(content)?),
            MAC_TYPE => Self::Mac(serde_json::from_value(content)?),
            CANCEL_TYPE => Self::Cancel(serde_json::from_value(content)?),
            DONE_TYPE => Self::Done(serde_json::from_value(content)?),
            ROOM_MESSAGE_TYPE
                if content.get("msgtype").and_then(Value::as_str) == Some(REQUEST_TYPE) =>
            {
                Self::Request(serde_json::from_value(content)?)
            }
            _ => return Ok(None),
        }))
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Request(_) => REQUEST_TYPE,
            Self::Ready(_) => READY_TYPE,
            Self::Start(_) => START_TYPE,
            Self::Accept(_) => ACCEPT_TYPE,
            Self::Key(_) => KEY_TYPE,
            Self::Mac(_) => MAC_TYPE,
            Self::Cancel(_) => CANCEL_TYPE,
            Self::Done(_) => DONE_TYPE,
        }
    }

    /// The device that sent the event, if the content carries it.
    pub fn from_device(&self) -> Option<&OwnedDeviceId> {
        match self {
            Self::Request(c) => Some(&c.from_device),
            Self::Ready(c) => Some(&c.from_device),
            Self::Start(c) => Some(&c.from_device),
            _ => None,
        }
    }
}

/// A verification event, received over to-device messaging or in a room.
#[derive(Clone, Debug)]
pub(crate) struct IncomingVerificationEvent {
    pub sender: OwnedUserId,
    pub flow_id: FlowId,
    pub content: VerificationContent,
    /// The content as it was received, needed for the SAS commitment.
    pub raw_content: Value,
    pub timestamp: Option<MilliSecondsSinceUnixEpoch>,
}

impl IncomingVerificationEvent {
    pub fn from_to_device(event: &ToDeviceEvent) -> Result<Option<Self>, serde_json::Error> {
        let Some(content) = VerificationContent::parse(&event.event_type, &event.content)? else {
            return Ok(None);
        };

        let Some(transaction_id) = event.content.get("transaction_id").and_then(Value::as_str)
        else {
            warn!(
                sender = ?event.sender,
                event_type = event.event_type,
                "Received a to-device verification event without a transaction id"
            );
            return Ok(None);
        };

        let timestamp = match &content {
            VerificationContent::Request(r) => r.timestamp,
            _ => None,
        };

        Ok(Some(Self {
            sender: event.sender.clone(),
            flow_id: FlowId::ToDevice(transaction_id.into()),
            content,
            raw_content: event.content.clone(),
            timestamp,
        }))
    }

    pub fn from_room_event(event: &RoomEvent) -> Result<Option<Self>, serde_json::Error> {
        let Some(content) = VerificationContent::parse(&event.event_type, &event.content)? else {
            return Ok(None);
        };

        let flow_id = if let VerificationContent::Request(_) = content {
            FlowId::InRoom(event.room_id.clone(), event.event_id.clone())
        } else {
            let Some(relation) = event
                .content
                .get("m.relates_to")
                .and_then(|r| r.get("event_id"))
                .and_then(Value::as_str)
                .and_then(|e| OwnedEventId::try_from(e).ok())
            else {
                warn!(
                    sender = ?event.sender,
                    event_type = event.event_type,
                    "Received an in-room verification event without a relation"
                );
                return Ok(None);
            };

            FlowId::InRoom(event.room_id.clone(), relation)
        };

        Ok(Some(Self {
            sender: event.sender.clone(),
            flow_id,
            content,
            raw_content: event.content.clone(),
            timestamp: Some(event.origin_server_ts),
        }))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{event_id, room_id, user_id, MilliSecondsSinceUnixEpoch, UInt};
    use serde_json::json;

    use super::{IncomingVerificationEvent, VerificationContent, VerificationMethod};
    use crate::{
        types::events::{RoomEvent, ToDeviceEvent},
        verification::{CancelCode, FlowId},
    };

    #[test]
    fn methods_keep_unknown_values() {
        let methods: Vec<VerificationMethod> =
            serde_json::from_value(json!(["m.sas.v1", "org.example.v1"])).unwrap();

        assert_eq!(
            methods,
            [VerificationMethod::SasV1, VerificationMethod::Unknown("org.example.v1".to_owned())]
        );
        assert_eq!(serde_json::to_value(&methods).unwrap(), json!(["m.sas.v1", "org.example.v1"]));
    }

    #[test]
    fn to_device_events() {
        let event = ToDeviceEvent::new(
            user_id!("@bob:localhost").to_owned(),
            "m.key.verification.cancel",
            json!({ "transaction_id": "txn", "code": "m.user", "reason": "Nope" }),
        );

        let event = IncomingVerificationEvent::from_to_device(&event).unwrap().unwrap();

        assert_eq!(event.flow_id, FlowId::ToDevice("txn".into()));
        assert_matches!(event.content, VerificationContent::Cancel(cancel));
        assert_eq!(cancel.code, CancelCode::User);

        let event = ToDeviceEvent::new(
            user_id!("@bob:localhost").to_owned(),
            "m.key.verification.done",
            json!({}),
        );
        assert!(IncomingVerificationEvent::from_to_device(&event).unwrap().is_none());

        let event = ToDeviceEvent::new(
            user_id!("@bob:localhost").to_owned(),
            "m.room_key",
            json!({ "transaction_id": "txn" }),
        );
        assert!(IncomingVerificationEvent::from_to_device(&event).unwrap().is_none());
    }

    #[test]
    fn room_events() {
        let request = RoomEvent {
            sender: user_id!("@bob:localhost").to_owned(),
            event_id: event_id!("$request").to_owned(),
            room_id: room_id!("!room:localhost").to_owned(),
            origin_server_ts: MilliSecondsSinceUnixEpoch(UInt::from(1_000u32)),
            event_type: "m.room.message".to_owned(),
            content: json!({
                "msgtype": "m.key.verification.request",
                "body": "Bob wants to verify",
                "from_device": "BOBDEVICE",
                "methods": ["m.sas.v1"],
                "to": "@alice:localhost",
            }),
        };

        let parsed = IncomingVerificationEvent::from_room_event(&request).unwrap().unwrap();
        let flow_id = FlowId::InRoom(request.room_id.clone(), request.event_id.clone());

        assert_eq!(parsed.flow_id, flow_id);
        assert_eq!(parsed.timestamp, Some(request.origin_server_ts));
        assert_matches!(parsed.content, VerificationContent::Request(_));

        let ready = RoomEvent {
            event_id: event_id!("$ready").to_owned(),
            event_type: "m.key.verification.ready".to_owned(),
            content: json!({
                "from_device": "ALICEDEVICE",
                "methods": ["m.sas.v1"],
                "m.relates_to": { "rel_type": "m.reference", "event_id": "$request" },
            }),
            ..request.clone()
        };

        let parsed = IncomingVerificationEvent::from_room_event(&ready).unwrap().unwrap();
        assert_eq!(parsed.flow_id, flow_id);

        let text = RoomEvent {
            content: json!({ "msgtype": "m.text", "body": "hello" }),
            ..request
        };
        assert!(IncomingVerificationEvent::from_room_event(&text).unwrap().is_none());
    }
}
