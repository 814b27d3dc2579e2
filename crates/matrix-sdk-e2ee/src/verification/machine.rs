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
    collections::BTreeMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use ruma::{DeviceId, MilliSecondsSinceUnixEpoch, OwnedUserId, RoomId, UserId};
use serde_json::Value;
use tracing::{debug, info, instrument, trace, warn};

use super::{
    event_enums::VerificationContent, CancelCode, IncomingVerificationEvent, VerificationChannel,
    VerificationContext, VerificationDone, VerificationMethod, VerificationRequest,
};
use crate::{
    error::VerificationError,
    types::events::{RoomEvent, ToDeviceEvent},
};

type RequestMap = BTreeMap<OwnedUserId, BTreeMap<String, VerificationRequest>>;

/// Keeps track of all the verification requests and routes incoming
/// verification events to them.
#[derive(Clone, Debug)]
pub struct VerificationMachine {
    inner: Arc<MachineInner>,
}

#[derive(Debug)]
struct MachineInner {
    context: VerificationContext,
    requests: StdMutex<RequestMap>,
}

impl VerificationMachine {
    pub(crate) fn new(context: VerificationContext) -> Self {
        Self { inner: Arc::new(MachineInner { context, requests: Default::default() }) }
    }

    /// Our own user id.
    pub fn own_user_id(&self) -> &UserId {
        self.inner.context.own_user_id()
    }

    fn insert_request(&self, request: &VerificationRequest) {
        if let Some(flow_id) = request.flow_id() {
            self.inner
                .requests
                .lock()
                .unwrap()
                .entry(request.other_user_id().to_owned())
                .or_default()
                .insert(flow_id.as_str().to_owned(), request.clone());
        }
    }

    async fn send_new_request(
        &self,
        channel: VerificationChannel,
        methods: Option<Vec<VerificationMethod>>,
    ) -> Result<VerificationRequest, VerificationError> {
        let methods = methods.unwrap_or_else(VerificationMethod::supported);
        let request = VerificationRequest::outgoing(self.inner.context.clone(), channel, methods);

        request.send_request().await?;
        self.insert_request(&request);

        Ok(request)
    }

    /// Request a verification with all the devices of the given user.
    ///
    /// The first device that accepts the request takes part in the
    /// verification, the other devices are told the request was accepted
    /// elsewhere.
    pub async fn request_verification(
        &self,
        user_id: &UserId,
        methods: Option<Vec<VerificationMethod>>,
    ) -> Result<VerificationRequest, VerificationError> {
        let channel = VerificationChannel::to_device(user_id.to_owned(), None);
        self.send_new_request(channel, methods).await
    }

    /// Request a verification with a single device.
    pub async fn request_device_verification(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        methods: Option<Vec<VerificationMethod>>,
    ) -> Result<VerificationRequest, VerificationError> {
        if self.inner.context.devices.get_device(user_id, device_id).is_none() {
            return Err(VerificationError::UnknownDevice(user_id.to_owned(), device_id.to_owned()));
        }

        let channel = VerificationChannel::to_device(user_id.to_owned(), Some(device_id.to_owned()));
        self.send_new_request(channel, methods).await
    }

    /// Request a verification of another user in a DM room.
    pub async fn request_verification_in_room(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        methods: Option<Vec<VerificationMethod>>,
    ) -> Result<VerificationRequest, VerificationError> {
        let channel = VerificationChannel::in_room(room_id.to_owned(), user_id.to_owned());
        self.send_new_request(channel, methods).await
    }

    /// Get the request with the given flow id.
    pub fn get_request(&self, user_id: &UserId, flow_id: &str) -> Option<VerificationRequest> {
        self.inner.requests.lock().unwrap().get(user_id)?.get(flow_id).cloned()
    }

    /// Get all the requests we have with the given user.
    pub fn get_requests(&self, user_id: &UserId) -> Vec<VerificationRequest> {
        self.inner
            .requests
            .lock()
            .unwrap()
            .get(user_id)
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Cancel requests that timed out and forget the ones that finished.
    pub async fn garbage_collect(&self) {
        let requests: Vec<VerificationRequest> = self
            .inner
            .requests
            .lock()
            .unwrap()
            .values()
            .flat_map(|r| r.values().cloned())
            .collect();

        for request in requests.iter().filter(|r| r.timed_out()) {
            info!(
                other_user = ?request.other_user_id(),
                flow_id = ?request.flow_id(),
                "Verification request timed out"
            );

            if let Err(e) = request.cancel_with_code(CancelCode::Timeout).await {
                warn!(flow_id = ?request.flow_id(), "Failed to cancel a timed out request: {e}");
            }
        }

        let mut map = self.inner.requests.lock().unwrap();

        for requests in map.values_mut() {
            requests.retain(|_, r| !r.phase().is_terminal());
        }

        map.retain(|_, r| !r.is_empty());
    }

    /// How long ago the request was sent, or `None` if it's too old or too
    /// far in the future to be handled.
    ///
    /// The clock skew leniency is granted in both directions, an old request
    /// is considered to be younger by that amount.
    fn request_age(&self, timestamp: Option<MilliSecondsSinceUnixEpoch>) -> Option<Duration> {
        let Some(timestamp) = timestamp else { return Some(Duration::ZERO) };

        let config = &self.inner.context.config;
        let now = u64::from(MilliSecondsSinceUnixEpoch::now().get());
        let timestamp = u64::from(timestamp.get());

        if timestamp > now {
            let skew = Duration::from_millis(timestamp - now);
            (skew <= config.clock_skew_leniency).then_some(Duration::ZERO)
        } else {
            let age = Duration::from_millis(now - timestamp);
            (age <= config.verification_request_timeout + config.clock_skew_leniency)
                .then(|| age.saturating_sub(config.clock_skew_leniency))
        }
    }

    /// Handle a to-device event, events that aren't verification events are
    /// ignored.
    pub async fn receive_to_device_event(
        &self,
        event: &ToDeviceEvent,
    ) -> Result<Option<VerificationDone>, VerificationError> {
        match IncomingVerificationEvent::from_to_device(event) {
            Ok(Some(event)) => self.receive_event(event).await,
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(sender = ?event.sender, event_type = %event.event_type, "Malformed verification event: {e}");
                Ok(None)
            }
        }
    }

    /// Handle a room event, events that aren't verification events are
    /// ignored.
    pub async fn receive_room_event(
        &self,
        event: &RoomEvent,
    ) -> Result<Option<VerificationDone>, VerificationError> {
        match IncomingVerificationEvent::from_room_event(event) {
            Ok(Some(incoming)) => {
                if let VerificationContent::Request(_) = incoming.content {
                    let to = event.content.get("to").and_then(Value::as_str);

                    if to != Some(self.own_user_id().as_str()) {
                        trace!(event_id = ?event.event_id, "Ignoring a verification request for another user");
                        return Ok(None);
                    }
                }

                self.receive_event(incoming).await
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(event_id = ?event.event_id, "Malformed verification event: {e}");
                Ok(None)
            }
        }
    }

    #[instrument(skip_all, fields(sender = ?event.sender, flow_id = event.flow_id.as_str()))]
    async fn receive_event(
        &self,
        event: IncomingVerificationEvent,
    ) -> Result<Option<VerificationDone>, VerificationError> {
        let context = &self.inner.context;
        let event_type = event.content.event_type();

        if let Some(from_device) = event.content.from_device() {
            if event.sender == context.own_user_id() && from_device == context.own_device_id() {
                trace!(event_type, "Ignoring a verification event we sent ourselves");
                return Ok(None);
            }
        }

        if let Some(request) = self.get_request(&event.sender, event.flow_id.as_str()) {
            return request.receive_event(&event).await;
        }

        if !VerificationChannel::can_create_request(&event.flow_id, event_type) {
            debug!(event_type, "Ignoring a verification event of an unknown flow");
            return Ok(None);
        }

        match &event.content {
            VerificationContent::Request(content) => {
                let Some(age) = self.request_age(event.timestamp) else {
                    warn!(timestamp = ?event.timestamp, "Ignoring a verification request that is too old or too far in the future");
                    return Ok(None);
                };

                info!(from_device = ?content.from_device, "Received a new verification request");

                let request = VerificationRequest::incoming(
                    context.clone(),
                    &event.flow_id,
                    event.sender.clone(),
                    content,
                    age,
                );
                self.insert_request(&request);

                Ok(None)
            }
            VerificationContent::Start(start) => {
                info!(from_device = ?start.from_device, "The other side started a verification without a request");

                let request = VerificationRequest::from_start(
                    context.clone(),
                    &event.flow_id,
                    event.sender.clone(),
                    start,
                );
                self.insert_request(&request);

                request.receive_event(&event).await
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches2::assert_matches;
    use ruma::{
        device_id, event_id, room_id, user_id, MilliSecondsSinceUnixEpoch, RoomId, UserId,
    };
    use serde_json::json;

    use super::VerificationMachine;
    use crate::{
        types::events::{RoomEvent, ToDeviceEvent},
        verification::{
            tests::{introduce, TestSide},
            CancelCode, QrPhase, QrVerificationData, SasPhase, VerificationDone,
            VerificationMethod, VerificationPhase,
        },
    };

    struct Peer {
        side: TestSide,
        machine: VerificationMachine,
    }

    impl Peer {
        async fn new(user_id: &UserId, device_id: &ruma::DeviceId) -> Self {
            let side = TestSide::new(user_id, device_id).await;
            let machine = VerificationMachine::new(side.context.clone());

            Self { side, machine }
        }

        fn user_id(&self) -> &UserId {
            self.side.olm.user_id()
        }
    }

    async fn alice_and_bob() -> (Peer, Peer) {
        let alice = Peer::new(user_id!("@alice:localhost"), device_id!("ALICE1")).await;
        let bob = Peer::new(user_id!("@bob:localhost"), device_id!("BOB1")).await;
        introduce(&alice.side, &bob.side).await;

        (alice, bob)
    }

    /// Deliver the to-device messages `from` sent to `to`.
    async fn pipe(from: &Peer, to: &Peer) -> Vec<VerificationDone> {
        let mut done = Vec::new();

        for sent in from.side.transport.take_to_device() {
            let Some(devices) = sent.messages.get(to.user_id()) else { continue };
            let Some(content) =
                devices.get(to.side.olm.device_id().as_str()).or_else(|| devices.get("*"))
            else {
                continue;
            };

            let event =
                ToDeviceEvent::new(from.user_id().to_owned(), sent.event_type, content.clone());

            if let Some(d) = to.machine.receive_to_device_event(&event).await.unwrap() {
                done.push(d);
            }
        }

        done
    }

    /// Deliver the room events `from` sent, all of them get the same event
    /// id from the mock transport.
    async fn pipe_room(from: &Peer, to: &Peer) {
        let sent = std::mem::take(&mut *from.side.transport.room_events.lock().unwrap());

        for event in sent {
            let event = RoomEvent {
                sender: from.user_id().to_owned(),
                event_id: event_id!("$sent:example.org").to_owned(),
                room_id: event.room_id,
                origin_server_ts: MilliSecondsSinceUnixEpoch::now(),
                event_type: event.event_type,
                content: event.content,
            };

            to.machine.receive_room_event(&event).await.unwrap();
        }
    }

    fn request_event(sender: &UserId, transaction_id: &str, timestamp: u64) -> ToDeviceEvent {
        ToDeviceEvent::new(
            sender.to_owned(),
            "m.key.verification.request",
            json!({
                "from_device": "ALICE1",
                "methods": ["m.sas.v1"],
                "timestamp": timestamp,
                "transaction_id": transaction_id,
            }),
        )
    }

    fn now_ms() -> u64 {
        u64::from(MilliSecondsSinceUnixEpoch::now().get())
    }

    #[tokio::test]
    async fn sas_verification_through_requests() {
        let (alice, bob) = alice_and_bob().await;

        let request = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        assert_eq!(request.phase(), VerificationPhase::Requested);
        assert!(request.other_device_id().is_none());

        pipe(&alice, &bob).await;

        let flow_id = request.flow_id().unwrap();
        let bob_request = bob.machine.get_request(alice.user_id(), flow_id.as_str()).unwrap();
        assert_eq!(bob_request.phase(), VerificationPhase::Requested);
        assert!(!bob_request.we_started());

        bob_request.accept().await.unwrap();
        pipe(&bob, &alice).await;

        assert_eq!(request.phase(), VerificationPhase::Ready);
        assert_eq!(request.other_device_id().as_deref(), Some(device_id!("BOB1")));
        assert_eq!(request.common_methods(), VerificationMethod::supported());

        let alice_sas = request.start_sas().await.unwrap();
        pipe(&alice, &bob).await;

        assert_eq!(bob_request.phase(), VerificationPhase::Started);
        let bob_sas = bob_request.sas().unwrap();
        assert_eq!(bob_sas.phase(), SasPhase::Started);

        bob_sas.accept().await.unwrap();
        pipe(&bob, &alice).await;
        pipe(&alice, &bob).await;
        pipe(&bob, &alice).await;

        assert_eq!(alice_sas.emoji(), bob_sas.emoji());

        alice_sas.confirm().await.unwrap();
        bob_sas.confirm().await.unwrap();

        pipe(&alice, &bob).await;
        let alice_done = pipe(&bob, &alice).await;
        let bob_done = pipe(&alice, &bob).await;

        assert_eq!(alice_done.len(), 1);
        assert_eq!(bob_done.len(), 1);
        assert!(request.is_done());
        assert!(bob_request.is_done());

        alice.machine.garbage_collect().await;
        assert!(alice.machine.get_requests(bob.user_id()).is_empty());
    }

    #[tokio::test]
    async fn start_race_is_won_by_the_smaller_user_id() {
        let (alice, bob) = alice_and_bob().await;

        let request = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        pipe(&alice, &bob).await;
        let flow_id = request.flow_id().unwrap();
        let bob_request = bob.machine.get_request(alice.user_id(), flow_id.as_str()).unwrap();
        bob_request.accept().await.unwrap();
        pipe(&bob, &alice).await;

        // Both sides start at the same time.
        let alice_sas = request.start_sas().await.unwrap();
        let bob_own_sas = bob_request.start_sas().await.unwrap();
        assert!(bob_own_sas.we_started());

        pipe(&alice, &bob).await;
        pipe(&bob, &alice).await;

        let bob_sas = bob_request.sas().unwrap();
        assert!(!bob_sas.we_started());
        assert_eq!(bob_sas.phase(), SasPhase::Accepted);
        assert!(request.sas().unwrap().we_started());

        pipe(&alice, &bob).await;
        pipe(&bob, &alice).await;

        assert_eq!(alice_sas.phase(), SasPhase::KeysExchanged);
        assert_eq!(alice_sas.decimals(), bob_sas.decimals());
    }

    #[tokio::test]
    async fn qr_code_verification() {
        let (alice, bob) = alice_and_bob().await;

        let alice_identity = alice.side.bootstrap_cross_signing().await;
        let bob_identity = bob.side.bootstrap_cross_signing().await;
        alice.side.devices.store_cross_signing_info(bob_identity);
        bob.side.devices.store_cross_signing_info(alice_identity);

        let request = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        pipe(&alice, &bob).await;
        let flow_id = request.flow_id().unwrap();
        let bob_request = bob.machine.get_request(alice.user_id(), flow_id.as_str()).unwrap();
        bob_request.accept().await.unwrap();
        pipe(&bob, &alice).await;

        let shown = bob_request.generate_qr_code().unwrap().unwrap();
        let data = QrVerificationData::from_bytes(shown.to_bytes().unwrap()).unwrap();

        let scanned = request.scan_qr_code(data).await.unwrap();
        assert_eq!(scanned.phase(), QrPhase::Scanned);
        assert_eq!(request.phase(), VerificationPhase::Started);

        pipe(&alice, &bob).await;
        assert!(shown.has_been_scanned());
        assert_eq!(bob_request.phase(), VerificationPhase::Started);

        shown.confirm().await.unwrap();
        let alice_done = pipe(&bob, &alice).await;
        let bob_done = pipe(&alice, &bob).await;

        assert!(alice_done[0].verified_master_key);
        assert!(bob_done[0].verified_master_key);
        assert!(request.is_done());
        assert!(bob_request.is_done());
    }

    #[tokio::test]
    async fn wrong_qr_secrets_cancel() {
        let (alice, bob) = alice_and_bob().await;

        let alice_identity = alice.side.bootstrap_cross_signing().await;
        let bob_identity = bob.side.bootstrap_cross_signing().await;
        alice.side.devices.store_cross_signing_info(bob_identity);
        bob.side.devices.store_cross_signing_info(alice_identity);

        let request = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        pipe(&alice, &bob).await;
        let flow_id = request.flow_id().unwrap();
        let bob_request = bob.machine.get_request(alice.user_id(), flow_id.as_str()).unwrap();
        bob_request.accept().await.unwrap();
        pipe(&bob, &alice).await;

        let shown = bob_request.generate_qr_code().unwrap().unwrap();

        let start = ToDeviceEvent::new(
            alice.user_id().to_owned(),
            "m.key.verification.start",
            json!({
                "from_device": "ALICE1",
                "method": "m.reciprocate.v1",
                "secret": "AAAAAAAAAAAAAAAAAAAAAA",
                "transaction_id": flow_id.as_str(),
            }),
        );
        bob.machine.receive_to_device_event(&start).await.unwrap();

        assert_matches!(shown.phase(), QrPhase::Cancelled(info));
        assert_eq!(info.cancel_code(), &CancelCode::KeyMismatch);
        assert!(bob_request.is_cancelled());
    }

    #[tokio::test]
    async fn unknown_methods_cancel_the_request() {
        let (alice, bob) = alice_and_bob().await;

        let request = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        pipe(&alice, &bob).await;
        let flow_id = request.flow_id().unwrap();
        let bob_request = bob.machine.get_request(alice.user_id(), flow_id.as_str()).unwrap();
        bob_request.accept().await.unwrap();
        bob.side.transport.take_to_device();

        let start = ToDeviceEvent::new(
            alice.user_id().to_owned(),
            "m.key.verification.start",
            json!({
                "from_device": "ALICE1",
                "method": "org.example.verification.v1",
                "transaction_id": flow_id.as_str(),
            }),
        );
        bob.machine.receive_to_device_event(&start).await.unwrap();

        assert!(bob_request.is_cancelled());
        assert_eq!(bob_request.cancel_info().unwrap().cancel_code(), &CancelCode::UnknownMethod);
        assert!(bob_request.verifier().unwrap().verify().await.is_err());

        pipe(&bob, &alice).await;
        assert!(request.is_cancelled());
        assert!(!request.cancel_info().unwrap().cancelled_by_us());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_requests_are_cancelled() {
        let (alice, bob) = alice_and_bob().await;

        let request = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        alice.side.transport.take_to_device();

        tokio::time::advance(Duration::from_secs(9 * 60)).await;
        assert!(!request.timed_out());

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        assert!(request.timed_out());

        alice.machine.garbage_collect().await;

        assert!(request.is_cancelled());
        assert_eq!(request.cancel_info().unwrap().cancel_code(), &CancelCode::Timeout);
        assert!(alice.machine.get_requests(bob.user_id()).is_empty());

        let sent = alice.side.transport.take_to_device();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, "m.key.verification.cancel");
        assert_eq!(sent[0].content_for(bob.user_id(), "*").unwrap()["code"], "m.timeout");
    }

    #[tokio::test]
    async fn request_timestamps_are_checked() {
        let (alice, bob) = alice_and_bob().await;
        let minute = 60 * 1000;

        let old = request_event(alice.user_id(), "old", now_ms() - 20 * minute);
        let future = request_event(alice.user_id(), "future", now_ms() + 10 * minute);
        let skewed = request_event(alice.user_id(), "skewed", now_ms() + 2 * minute);
        let late = request_event(alice.user_id(), "late", now_ms() - 12 * minute);

        for event in [old, future, skewed, late] {
            bob.machine.receive_to_device_event(&event).await.unwrap();
        }

        assert!(bob.machine.get_request(alice.user_id(), "old").is_none());
        assert!(bob.machine.get_request(alice.user_id(), "future").is_none());
        assert!(bob.machine.get_request(alice.user_id(), "skewed").is_some());

        let late = bob.machine.get_request(alice.user_id(), "late").unwrap();
        assert!(!late.timed_out());
    }

    #[tokio::test]
    async fn own_requests_are_ignored() {
        let (alice, _bob) = alice_and_bob().await;

        let event = request_event(alice.user_id(), "mine", now_ms());
        alice.machine.receive_to_device_event(&event).await.unwrap();

        assert!(alice.machine.get_request(alice.user_id(), "mine").is_none());
    }

    #[tokio::test]
    async fn in_room_requests() {
        let (alice, bob) = alice_and_bob().await;
        let room_id: &RoomId = room_id!("!dm:localhost");

        let request = alice
            .machine
            .request_verification_in_room(room_id, bob.user_id(), None)
            .await
            .unwrap();
        assert_eq!(request.flow_id().unwrap().as_str(), "$sent:example.org");
        assert_eq!(request.room_id().as_deref(), Some(room_id));

        pipe_room(&alice, &bob).await;

        let bob_request = bob.machine.get_request(alice.user_id(), "$sent:example.org").unwrap();
        assert_eq!(bob_request.room_id().as_deref(), Some(room_id));

        bob_request.accept().await.unwrap();
        let ready = bob.side.transport.sent_room_events().pop().unwrap();
        assert_eq!(ready.event_type, "m.key.verification.ready");
        assert_eq!(ready.content["m.relates_to"]["event_id"], "$sent:example.org");

        pipe_room(&bob, &alice).await;
        assert_eq!(request.phase(), VerificationPhase::Ready);
    }
}
