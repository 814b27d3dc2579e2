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

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use ruma::{
    DeviceId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedUserId, RoomId, TransactionId,
    UserId,
};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    event_enums::{
        ReadyContent, RequestContent, StartContent, VerificationContent, CANCEL_TYPE,
        READY_TYPE, REQUEST_TYPE,
    },
    timer::Deadline,
    CancelCode, CancelInfo, FlowId, IncomingVerificationEvent, QrVerification,
    QrVerificationData, SasVerifier, UnsupportedVerifier, VerificationChannel,
    VerificationContext, VerificationDone, VerificationMethod, Verifier,
};
use crate::{error::VerificationError, identities::DeviceData};

/// The phase of a verification request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationPhase {
    /// The request was created but not sent yet.
    Unsent,
    /// The request was sent or received, the receiving side needs to accept
    /// it.
    Requested,
    /// The request was accepted, a verification method can be started.
    Ready,
    /// A verification method was started.
    Started,
    /// The verification finished successfully.
    Done,
    /// The request was cancelled.
    Cancelled,
}

impl VerificationPhase {
    /// Is moving from this phase to the given one a valid transition.
    pub fn can_transition_to(&self, next: VerificationPhase) -> bool {
        use VerificationPhase::*;

        matches!(
            (self, next),
            (Unsent, Requested)
                | (Requested, Ready)
                | (Ready, Started)
                | (Started, Done)
                | (Unsent | Requested | Ready | Started, Cancelled)
        )
    }

    /// Is this a final phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VerificationPhase::Done | VerificationPhase::Cancelled)
    }
}

/// Did our start event win against the start event of the other side.
///
/// If both sides start a verification at the same time the start of the
/// side with the lexicographically smaller user id wins, if the user ids are
/// the same the device ids decide.
pub(crate) fn is_winning_start_race(
    own_user_id: &UserId,
    own_device_id: &DeviceId,
    their_user_id: &UserId,
    their_device_id: &DeviceId,
) -> bool {
    (own_user_id.as_str(), own_device_id.as_str())
        < (their_user_id.as_str(), their_device_id.as_str())
}

struct RequestState {
    phase: VerificationPhase,
    channel: VerificationChannel,
    their_methods: Vec<VerificationMethod>,
    verifier: Option<Verifier>,
    shown_qr: Option<QrVerification>,
    cancel_info: Option<CancelInfo>,
    deadline: Deadline,
}

/// A request to verify another user or one of our own devices.
///
/// The request negotiates which verification methods both sides support,
/// once it's ready a [`SasVerifier`] or a [`QrVerification`] can be started.
#[derive(Clone)]
pub struct VerificationRequest {
    inner: Arc<RequestInner>,
}

struct RequestInner {
    context: VerificationContext,
    other_user: OwnedUserId,
    we_started: bool,
    our_methods: Vec<VerificationMethod>,
    state: StdMutex<RequestState>,
    phase: watch::Sender<VerificationPhase>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for VerificationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationRequest")
            .field("other_user", &self.inner.other_user)
            .field("flow_id", &self.flow_id())
            .field("we_started", &self.inner.we_started)
            .field("phase", &self.phase())
            .finish()
    }
}

impl VerificationRequest {
    fn new(
        context: VerificationContext,
        channel: VerificationChannel,
        we_started: bool,
        our_methods: Vec<VerificationMethod>,
        their_methods: Vec<VerificationMethod>,
        phase: VerificationPhase,
        deadline: Deadline,
    ) -> Self {
        let (sender, _) = watch::channel(phase);

        Self {
            inner: Arc::new(RequestInner {
                other_user: channel.other_user().to_owned(),
                context,
                we_started,
                our_methods,
                state: StdMutex::new(RequestState {
                    phase,
                    channel,
                    their_methods,
                    verifier: None,
                    shown_qr: None,
                    cancel_info: None,
                    deadline,
                }),
                phase: sender,
            }),
        }
    }

    /// A request we are going to send.
    pub(crate) fn outgoing(
        context: VerificationContext,
        channel: VerificationChannel,
        methods: Vec<VerificationMethod>,
    ) -> Self {
        let deadline = Deadline::new(context.config.verification_request_timeout);
        Self::new(context, channel, true, methods, Vec::new(), VerificationPhase::Unsent, deadline)
    }

    /// A request the other side sent us, `age` is how long ago it was sent.
    pub(crate) fn incoming(
        context: VerificationContext,
        flow_id: &FlowId,
        sender: OwnedUserId,
        content: &RequestContent,
        age: Duration,
    ) -> Self {
        let channel = VerificationChannel::from_flow_id(flow_id, sender, content.from_device.clone());
        let deadline = Deadline::started_ago(context.config.verification_request_timeout, age);

        Self::new(
            context,
            channel,
            false,
            VerificationMethod::supported(),
            content.methods.clone(),
            VerificationPhase::Requested,
            deadline,
        )
    }

    /// A flow the other side started without sending a request first.
    pub(crate) fn from_start(
        context: VerificationContext,
        flow_id: &FlowId,
        sender: OwnedUserId,
        start: &StartContent,
    ) -> Self {
        let channel = VerificationChannel::from_flow_id(flow_id, sender, start.from_device.clone());
        let deadline = Deadline::new(context.config.verification_request_timeout);

        Self::new(
            context,
            channel,
            false,
            VerificationMethod::supported(),
            vec![start.method.clone()],
            VerificationPhase::Ready,
            deadline,
        )
    }

    /// The id of the flow, `None` if this is an in-room request that wasn't
    /// sent yet.
    pub fn flow_id(&self) -> Option<FlowId> {
        self.inner.state.lock().unwrap().channel.flow_id()
    }

    /// The user we want to verify.
    pub fn other_user_id(&self) -> &UserId {
        &self.inner.other_user
    }

    /// The device of the other user that takes part in the verification.
    ///
    /// `None` until one of the devices of the other user accepted a request
    /// we sent.
    pub fn other_device_id(&self) -> Option<OwnedDeviceId> {
        self.inner.state.lock().unwrap().channel.other_device().map(ToOwned::to_owned)
    }

    /// The room of an in-room verification.
    pub fn room_id(&self) -> Option<ruma::OwnedRoomId> {
        self.inner.state.lock().unwrap().channel.room_id().map(RoomId::to_owned)
    }

    /// Did we send the request.
    pub fn we_started(&self) -> bool {
        self.inner.we_started
    }

    /// Are we verifying one of our own devices.
    pub fn is_self_verification(&self) -> bool {
        self.inner.other_user == self.inner.context.own_user_id()
    }

    /// The methods we advertise.
    pub fn our_supported_methods(&self) -> &[VerificationMethod] {
        &self.inner.our_methods
    }

    /// The methods the other side advertised, empty until they told us.
    pub fn their_supported_methods(&self) -> Vec<VerificationMethod> {
        self.inner.state.lock().unwrap().their_methods.clone()
    }

    /// The methods both sides support.
    pub fn common_methods(&self) -> Vec<VerificationMethod> {
        let their_methods = self.their_supported_methods();

        self.inner.our_methods.iter().filter(|m| their_methods.contains(m)).cloned().collect()
    }

    /// The current phase.
    pub fn phase(&self) -> VerificationPhase {
        self.sync_with_verifier();
        *self.inner.phase.borrow()
    }

    /// Get notified about phase changes.
    pub fn subscribe(&self) -> watch::Receiver<VerificationPhase> {
        self.inner.phase.subscribe()
    }

    /// Has the verification finished successfully.
    pub fn is_done(&self) -> bool {
        self.phase() == VerificationPhase::Done
    }

    /// Was the request cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.phase() == VerificationPhase::Cancelled
    }

    /// The cancellation info, if the request was cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        self.sync_with_verifier();
        self.inner.state.lock().unwrap().cancel_info.clone()
    }

    /// The verifier of the started method.
    pub fn verifier(&self) -> Option<Verifier> {
        self.inner.state.lock().unwrap().verifier.clone()
    }

    /// The SAS verifier, if SAS was started.
    pub fn sas(&self) -> Option<SasVerifier> {
        self.verifier()?.sas().cloned()
    }

    /// The QR code verification, if we show a code or scanned one.
    pub fn qr(&self) -> Option<QrVerification> {
        let state = self.inner.state.lock().unwrap();

        state.verifier.as_ref().and_then(Verifier::qr).cloned().or_else(|| state.shown_qr.clone())
    }

    /// Did the request or the started verification time out.
    pub fn timed_out(&self) -> bool {
        let state = self.inner.state.lock().unwrap();

        match state.phase {
            VerificationPhase::Unsent | VerificationPhase::Done | VerificationPhase::Cancelled => {
                false
            }
            VerificationPhase::Requested | VerificationPhase::Ready => state.deadline.is_expired(),
            VerificationPhase::Started => {
                state.verifier.as_ref().is_some_and(Verifier::timed_out)
            }
        }
    }

    fn set_phase(&self, state: &mut RequestState, phase: VerificationPhase) -> bool {
        if !state.phase.can_transition_to(phase) {
            debug!(from = ?state.phase, to = ?phase, "Ignoring an invalid request phase transition");
            return false;
        }

        state.phase = phase;
        self.inner.phase.send_replace(phase);

        true
    }

    fn set_cancelled(&self, state: &mut RequestState, info: CancelInfo) {
        if self.set_phase(state, VerificationPhase::Cancelled) {
            if let Some(qr) = &state.shown_qr {
                qr.receive_cancel(info.clone());
            }

            state.cancel_info = Some(info);
        }
    }

    /// Move the request into a final phase if its verifier finished.
    fn sync_with_verifier(&self) {
        let mut state = self.inner.state.lock().unwrap();

        if state.phase != VerificationPhase::Started {
            return;
        }

        let Some(verifier) = state.verifier.clone() else { return };

        if verifier.is_done() {
            self.set_phase(&mut state, VerificationPhase::Done);
        } else if let Some(info) = verifier.cancel_info() {
            self.set_cancelled(&mut state, info);
        }
    }

    fn other_device(&self, channel: &VerificationChannel) -> Result<DeviceData, VerificationError> {
        let device_id = channel
            .other_device()
            .ok_or_else(|| VerificationError::InvalidPhase { action: "start", phase: self.phase() })?;

        self.inner.context.devices.get_device(&self.inner.other_user, device_id).ok_or_else(|| {
            VerificationError::UnknownDevice(self.inner.other_user.clone(), device_id.to_owned())
        })
    }

    /// Send the request to the other side.
    pub(crate) async fn send_request(&self) -> Result<(), VerificationError> {
        let channel = {
            let state = self.inner.state.lock().unwrap();

            if state.phase != VerificationPhase::Unsent {
                return Err(VerificationError::InvalidPhase { action: "send", phase: state.phase });
            }

            state.channel.clone()
        };

        let mut content = json!({
            "from_device": self.inner.context.own_device_id(),
            "methods": self.inner.our_methods,
        });

        if channel.room_id().is_none() {
            content["timestamp"] = json!(MilliSecondsSinceUnixEpoch::now());
        }

        let event_id = channel.send(&*self.inner.context.transport, REQUEST_TYPE, content).await?;

        let mut state = self.inner.state.lock().unwrap();

        if let Some(event_id) = event_id {
            state.channel.set_request_event_id(event_id);
        }

        state.deadline.reset();
        self.set_phase(&mut state, VerificationPhase::Requested);

        info!(
            other_user = ?self.inner.other_user,
            flow_id = ?state.channel.flow_id(),
            "Sent a verification request"
        );

        Ok(())
    }

    /// Accept a request the other side sent.
    pub async fn accept(&self) -> Result<(), VerificationError> {
        let channel = {
            let mut state = self.inner.state.lock().unwrap();

            if self.inner.we_started || state.phase != VerificationPhase::Requested {
                return Err(VerificationError::InvalidPhase { action: "accept", phase: state.phase });
            }

            self.set_phase(&mut state, VerificationPhase::Ready);
            state.channel.clone()
        };

        let content = json!({
            "from_device": self.inner.context.own_device_id(),
            "methods": self.inner.our_methods,
        });

        channel.send(&*self.inner.context.transport, READY_TYPE, content).await?;

        Ok(())
    }

    /// Start a SAS verification.
    pub async fn start_sas(&self) -> Result<SasVerifier, VerificationError> {
        let (channel, flow_id) = self.start_preconditions(
            VerificationMethod::SasV1,
            VerificationMethod::SasV1,
            "start SAS",
        )?;
        let other_device = self.other_device(&channel)?;

        let sas =
            SasVerifier::start(self.inner.context.clone(), channel, flow_id, other_device).await?;

        let mut state = self.inner.state.lock().unwrap();

        if state.phase == VerificationPhase::Ready {
            state.verifier = Some(Verifier::Sas(sas.clone()));
            self.set_phase(&mut state, VerificationPhase::Started);
        }

        Ok(sas)
    }

    /// Check that the request is ready and that we support `ours` while the
    /// other side supports `theirs`.
    fn start_preconditions(
        &self,
        ours: VerificationMethod,
        theirs: VerificationMethod,
        action: &'static str,
    ) -> Result<(VerificationChannel, FlowId), VerificationError> {
        let state = self.inner.state.lock().unwrap();

        if state.phase != VerificationPhase::Ready {
            return Err(VerificationError::InvalidPhase { action, phase: state.phase });
        }

        if !self.inner.our_methods.contains(&ours) {
            return Err(VerificationError::UnsupportedMethod(ours.to_string()));
        } else if !state.their_methods.contains(&theirs) {
            return Err(VerificationError::UnsupportedMethod(theirs.to_string()));
        }

        let flow_id = state
            .channel
            .flow_id()
            .ok_or(VerificationError::InvalidPhase { action, phase: state.phase })?;

        Ok((state.channel.clone(), flow_id))
    }

    /// Generate the QR code we show to the other device.
    ///
    /// Returns `None` if the other side can't scan codes or if we lack the
    /// keys to put into one.
    pub fn generate_qr_code(&self) -> Result<Option<QrVerification>, VerificationError> {
        let (channel, flow_id) = match self.start_preconditions(
            VerificationMethod::QrCodeShowV1,
            VerificationMethod::QrCodeScanV1,
            "show a QR code",
        ) {
            Ok(ready) => ready,
            Err(VerificationError::UnsupportedMethod(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        if !self.common_methods().contains(&VerificationMethod::ReciprocateV1) {
            return Ok(None);
        }

        let other_device = self.other_device(&channel)?;
        let qr = QrVerification::show(self.inner.context.clone(), channel, flow_id, other_device);

        self.inner.state.lock().unwrap().shown_qr = qr.clone();

        Ok(qr)
    }

    /// Handle a QR code we scanned from the other device.
    pub async fn scan_qr_code(
        &self,
        data: QrVerificationData,
    ) -> Result<QrVerification, VerificationError> {
        let (channel, flow_id) = self.start_preconditions(
            VerificationMethod::QrCodeScanV1,
            VerificationMethod::QrCodeShowV1,
            "scan a QR code",
        )?;

        let other_device = self.other_device(&channel)?;
        let qr =
            QrVerification::scan(self.inner.context.clone(), channel, flow_id, other_device, data)
                .await?;

        {
            let mut state = self.inner.state.lock().unwrap();

            if state.phase == VerificationPhase::Ready {
                state.verifier = Some(Verifier::Qr(qr.clone()));
                self.set_phase(&mut state, VerificationPhase::Started);
            }
        }

        self.sync_with_verifier();

        Ok(qr)
    }

    /// Cancel the request or the started verification.
    pub async fn cancel(&self) -> Result<(), VerificationError> {
        self.cancel_with_code(CancelCode::User).await
    }

    pub(crate) async fn cancel_with_code(&self, code: CancelCode) -> Result<(), VerificationError> {
        let (was_sent, channel, verifier) = {
            let mut state = self.inner.state.lock().unwrap();

            if state.phase.is_terminal() {
                return Ok(());
            }

            let was_sent = state.phase != VerificationPhase::Unsent;
            let verifier = state.verifier.clone();
            self.set_cancelled(&mut state, CancelInfo::ours(code.clone()));

            (was_sent, state.channel.clone(), verifier)
        };

        info!(other_user = ?self.inner.other_user, %code, "Cancelling a verification request");

        match verifier {
            Some(verifier) => verifier.cancel_with_code(code).await?,
            None if was_sent => {
                let info = CancelInfo::ours(code);
                channel.send(&*self.inner.context.transport, CANCEL_TYPE, info.to_content()).await?;
            }
            None => {}
        }

        Ok(())
    }

    /// Feed an event of this flow into the request.
    pub(crate) async fn receive_event(
        &self,
        event: &IncomingVerificationEvent,
    ) -> Result<Option<VerificationDone>, VerificationError> {
        if event.sender != self.inner.other_user {
            return Ok(None);
        }

        let done = match &event.content {
            VerificationContent::Request(_) => {
                debug!(flow_id = event.flow_id.as_str(), "Ignoring a duplicate verification request");
                None
            }
            VerificationContent::Ready(ready) => {
                self.receive_ready(ready).await?;
                None
            }
            VerificationContent::Start(start) => self.receive_start(event, start).await?,
            VerificationContent::Cancel(cancel) => {
                self.receive_cancel(CancelInfo::theirs(cancel.code.clone(), cancel.reason.clone()));
                None
            }
            _ => {
                let verifier = self.inner.state.lock().unwrap().verifier.clone();

                match verifier {
                    Some(verifier) => verifier.receive_event(event).await?,
                    None => {
                        warn!(
                            flow_id = event.flow_id.as_str(),
                            event_type = event.content.event_type(),
                            "Received a verification event before a method was started"
                        );
                        None
                    }
                }
            }
        };

        self.sync_with_verifier();

        Ok(done)
    }

    async fn receive_ready(&self, ready: &ReadyContent) -> Result<(), VerificationError> {
        let (channel, sent_to_all) = {
            let mut state = self.inner.state.lock().unwrap();

            if !self.inner.we_started || state.phase != VerificationPhase::Requested {
                debug!(phase = ?state.phase, "Ignoring an unexpected ready event");
                return Ok(());
            }

            let sent_to_all = state.channel.other_device().is_none();

            state.channel.set_other_device(ready.from_device.clone());
            state.their_methods = ready.methods.clone();
            state.deadline.reset();
            self.set_phase(&mut state, VerificationPhase::Ready);

            (state.channel.clone(), sent_to_all)
        };

        info!(
            other_user = ?self.inner.other_user,
            other_device = ?ready.from_device,
            "The verification request was accepted"
        );

        if sent_to_all {
            if let VerificationChannel::ToDevice { transaction_id, .. } = &channel {
                self.cancel_other_devices(transaction_id.as_str(), &ready.from_device).await?;
            }
        }

        Ok(())
    }

    /// Tell the devices that didn't accept the request that another device
    /// did.
    async fn cancel_other_devices(
        &self,
        transaction_id: &str,
        accepted_by: &DeviceId,
    ) -> Result<(), VerificationError> {
        let own_device_id = self.inner.context.own_device_id();
        let info = CancelInfo::ours(CancelCode::Accepted);

        let mut content = info.to_content();
        content["transaction_id"] = json!(transaction_id);

        let recipients: BTreeMap<String, serde_json::Value> = self
            .inner
            .context
            .devices
            .user_devices(&self.inner.other_user)
            .into_keys()
            .filter(|d| d != accepted_by && !(self.is_self_verification() && d == own_device_id))
            .map(|d| (d.to_string(), content.clone()))
            .collect();

        if !recipients.is_empty() {
            let messages = BTreeMap::from([(self.inner.other_user.clone(), recipients)]);
            self.inner
                .context
                .transport
                .send_to_device(CANCEL_TYPE, &TransactionId::new(), messages)
                .await?;
        }

        Ok(())
    }

    async fn receive_start(
        &self,
        event: &IncomingVerificationEvent,
        start: &StartContent,
    ) -> Result<Option<VerificationDone>, VerificationError> {
        let (phase, existing, shown_qr, mut channel) = {
            let state = self.inner.state.lock().unwrap();
            (state.phase, state.verifier.clone(), state.shown_qr.clone(), state.channel.clone())
        };

        let context = &self.inner.context;
        let lost_race = match phase {
            VerificationPhase::Ready => false,
            VerificationPhase::Started
                if existing.as_ref().is_some_and(Verifier::is_unanswered_start) =>
            {
                if is_winning_start_race(
                    context.own_user_id(),
                    context.own_device_id(),
                    &event.sender,
                    &start.from_device,
                ) {
                    debug!(flow_id = event.flow_id.as_str(), "Won the start race, ignoring their start");
                    return Ok(None);
                }

                info!(
                    flow_id = event.flow_id.as_str(),
                    "Lost the start race, continuing with the flow of the other side"
                );
                true
            }
            phase => {
                warn!(?phase, flow_id = event.flow_id.as_str(), "Received an unexpected start event");
                return Ok(None);
            }
        };

        if channel.other_device().is_none() {
            channel.set_other_device(start.from_device.clone());
        }

        let other_device = match self.other_device(&channel) {
            Ok(device) => device,
            Err(e) => {
                self.cancel_with_code(CancelCode::InvalidMessage).await?;
                return Err(e);
            }
        };

        let flow_id = event.flow_id.clone();
        let verifier = match (&start.method, shown_qr) {
            (VerificationMethod::SasV1, _)
                if self.common_methods().contains(&VerificationMethod::SasV1) =>
            {
                let sas = SasVerifier::from_start(
                    context.clone(),
                    channel.clone(),
                    flow_id,
                    other_device,
                    start,
                    &event.raw_content,
                )
                .await?;

                if lost_race {
                    sas.accept().await?;
                }

                Verifier::Sas(sas)
            }
            (VerificationMethod::ReciprocateV1, Some(qr)) => {
                qr.receive_reciprocate(start).await?;
                Verifier::Qr(qr)
            }
            (method, _) => {
                warn!(%method, "The other side started a verification method we can't handle");

                let verifier = UnsupportedVerifier::new(method.clone());
                let info = CancelInfo::ours(CancelCode::UnknownMethod);
                channel.send(&*context.transport, CANCEL_TYPE, info.to_content()).await?;

                Verifier::Unsupported(verifier)
            }
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            state.channel = channel;
            state.verifier = Some(verifier);

            if state.phase == VerificationPhase::Ready {
                self.set_phase(&mut state, VerificationPhase::Started);
            }
        }

        Ok(None)
    }

    pub(crate) fn receive_cancel(&self, info: CancelInfo) {
        info!(other_user = ?self.inner.other_user, %info, "The verification was cancelled");

        let mut state = self.inner.state.lock().unwrap();

        if let Some(verifier) = &state.verifier {
            verifier.receive_cancel(info.clone());
        }

        self.set_cancelled(&mut state, info);
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::{is_winning_start_race, VerificationPhase};

    #[test]
    fn phase_transitions() {
        use VerificationPhase::*;

        assert!(Unsent.can_transition_to(Requested));
        assert!(Requested.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Started));
        assert!(Started.can_transition_to(Done));

        for phase in [Unsent, Requested, Ready, Started] {
            assert!(phase.can_transition_to(Cancelled));
        }

        assert!(!Requested.can_transition_to(Started));
        assert!(!Requested.can_transition_to(Done));
        assert!(!Started.can_transition_to(Ready));

        for next in [Unsent, Requested, Ready, Started, Done, Cancelled] {
            assert!(!Done.can_transition_to(next));
            assert!(!Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn start_race() {
        let alice = user_id!("@alice:localhost");
        let bob = user_id!("@bob:localhost");

        assert!(is_winning_start_race(alice, device_id!("B"), bob, device_id!("A")));
        assert!(!is_winning_start_race(bob, device_id!("A"), alice, device_id!("B")));
        assert!(is_winning_start_race(alice, device_id!("A"), alice, device_id!("B")));
        assert!(!is_winning_start_race(alice, device_id!("B"), alice, device_id!("A")));
    }
}
