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

//! Short authentication string verification.
//!
//! Both sides exchange ephemeral Curve25519 keys, the side that didn't start
//! the flow commits to its key before it learns the key of the starter. The
//! shared secret is shown as emoji or decimals, once the user confirms they
//! match on both devices the sides exchange MACs of their identity keys.

use std::{
    collections::BTreeMap,
    fmt, mem,
    sync::{Arc, Mutex as StdMutex},
};

use ruma::{CanonicalJsonValue, DeviceId, UserId};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::{sync::watch, time::Instant};
use tracing::{debug, info, trace, warn};
use vodozemac::{
    base64_encode,
    sas::{EstablishedSas, Mac, Sas},
};

use super::{
    emoji::emoji_from_index,
    event_enums::{
        AcceptContent, MacContent, StartContent, VerificationContent, ACCEPT_TYPE, CANCEL_TYPE,
        DONE_TYPE, KEY_TYPE, MAC_TYPE, START_TYPE,
    },
    timer::{wait_for_deadline, Deadline},
    CancelCode, CancelInfo, Emoji, FlowId, IncomingVerificationEvent, VerificationChannel,
    VerificationContext, VerificationDone, VerificationMethod, VerificationPhase, VerifiedKeys,
};
use crate::{error::VerificationError, identities::DeviceData};

const KEY_AGREEMENT_PROTOCOL: &str = "curve25519-hkdf-sha256";
const HASH: &str = "sha256";
const MAC_METHOD: &str = "hkdf-hmac-sha256.v2";
const SAS_METHODS: [&str; 2] = ["decimal", "emoji"];

/// The phase of a SAS verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SasPhase {
    /// We sent the start event and wait for the other side to accept.
    Created,
    /// The other side started the flow, we need to accept it.
    Started,
    /// The flow was accepted, the keys are being exchanged.
    Accepted,
    /// The short auth string can be presented to the user.
    KeysExchanged,
    /// The user confirmed that the short auth strings match.
    Confirmed,
    /// The verification finished successfully.
    Done,
    /// The verification was cancelled.
    Cancelled(CancelInfo),
}

impl SasPhase {
    fn is_terminal(&self) -> bool {
        matches!(self, SasPhase::Done | SasPhase::Cancelled(_))
    }
}

struct Established {
    sas: EstablishedSas,
    sas_methods: Vec<String>,
}

enum InnerSas {
    Created { sas: Sas, start_content: Value },
    Started { sas: Sas, accept_content: Value, sas_methods: Vec<String> },
    WeAccepted { sas: Sas, sas_methods: Vec<String> },
    TheyAccepted { sas: Sas, start_content: Value, commitment: String, sas_methods: Vec<String> },
    KeysExchanged(Established),
    MacReceived { established: Established, verified: VerifiedKeys },
    Confirmed { established: Established, their_done: bool },
    WaitingForDone { verified: VerifiedKeys },
    Done,
    Cancelled(CancelInfo),
    Transitioning,
}

impl InnerSas {
    fn phase(&self) -> Option<SasPhase> {
        Some(match self {
            InnerSas::Created { .. } => SasPhase::Created,
            InnerSas::Started { .. } => SasPhase::Started,
            InnerSas::WeAccepted { .. } | InnerSas::TheyAccepted { .. } => SasPhase::Accepted,
            InnerSas::KeysExchanged(_) | InnerSas::MacReceived { .. } => SasPhase::KeysExchanged,
            InnerSas::Confirmed { .. } | InnerSas::WaitingForDone { .. } => SasPhase::Confirmed,
            InnerSas::Done => SasPhase::Done,
            InnerSas::Cancelled(info) => SasPhase::Cancelled(info.clone()),
            InnerSas::Transitioning => return None,
        })
    }

    fn established(&self) -> Option<&Established> {
        match self {
            InnerSas::KeysExchanged(e)
            | InnerSas::MacReceived { established: e, .. }
            | InnerSas::Confirmed { established: e, .. } => Some(e),
            _ => None,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, InnerSas::Done | InnerSas::Cancelled(_))
    }
}

/// What needs to happen after a state transition, performed once the state
/// lock is released.
enum Action {
    Nothing,
    Send(Vec<(&'static str, Value)>),
    Cancel(CancelInfo),
    Finish { verified: VerifiedKeys, send_done: bool },
}

fn cancelled(code: CancelCode) -> (InnerSas, Action) {
    let info = CancelInfo::ours(code);
    (InnerSas::Cancelled(info.clone()), Action::Cancel(info))
}

/// The commitment to our public key, the hash of the key and the canonical
/// JSON of the start content.
fn calculate_commitment(public_key: &str, start_content: &Value) -> Option<String> {
    let canonical = CanonicalJsonValue::try_from(start_content.clone()).ok()?;

    let hash = Sha256::new()
        .chain_update(public_key)
        .chain_update(canonical.to_string())
        .finalize();

    Some(base64_encode(hash))
}

/// Pick the short auth string methods both sides support, the decimal one is
/// mandatory.
fn negotiate_sas_methods(theirs: &[String]) -> Option<Vec<String>> {
    let common: Vec<String> = SAS_METHODS
        .iter()
        .filter(|m| theirs.iter().any(|t| t == *m))
        .map(|m| (*m).to_owned())
        .collect();

    common.iter().any(|m| m == "decimal").then_some(common)
}

fn check_start(start: &StartContent) -> Result<Vec<String>, CancelCode> {
    let supports = |offered: &[String], ours: &str| offered.iter().any(|o| o == ours);

    if start.method != VerificationMethod::SasV1
        || !supports(&start.key_agreement_protocols, KEY_AGREEMENT_PROTOCOL)
        || !supports(&start.hashes, HASH)
        || !supports(&start.message_authentication_codes, MAC_METHOD)
    {
        return Err(CancelCode::UnknownMethod);
    }

    negotiate_sas_methods(&start.short_authentication_string).ok_or(CancelCode::UnknownMethod)
}

fn check_accept(accept: &AcceptContent) -> Result<Vec<String>, CancelCode> {
    let sas_methods = &accept.short_authentication_string;

    if accept.method != VerificationMethod::SasV1
        || accept.key_agreement_protocol != KEY_AGREEMENT_PROTOCOL
        || accept.hash != HASH
        || accept.message_authentication_code != MAC_METHOD
        || sas_methods.iter().any(|m| !SAS_METHODS.contains(&m.as_str()))
        || !sas_methods.iter().any(|m| m == "decimal")
    {
        Err(CancelCode::UnknownMethod)
    } else {
        Ok(sas_methods.clone())
    }
}

/// A short auth string verification flow with one device.
#[derive(Clone)]
pub struct SasVerifier {
    inner: Arc<SasInner>,
}

struct SasInner {
    context: VerificationContext,
    channel: VerificationChannel,
    flow_id: FlowId,
    other_device: DeviceData,
    we_started: bool,
    state: StdMutex<InnerSas>,
    deadline: StdMutex<Deadline>,
    phase: watch::Sender<SasPhase>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SasVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SasVerifier")
            .field("flow_id", &self.inner.flow_id)
            .field("other_user", &self.other_user_id())
            .field("other_device", &self.other_device_id())
            .field("we_started", &self.inner.we_started)
            .field("phase", &self.phase())
            .finish()
    }
}

impl SasVerifier {
    fn new(
        context: VerificationContext,
        channel: VerificationChannel,
        flow_id: FlowId,
        other_device: DeviceData,
        we_started: bool,
        state: InnerSas,
    ) -> Self {
        let deadline = Deadline::new(context.config.verification_event_timeout);
        let phase = state.phase().unwrap_or(SasPhase::Created);
        let (sender, _) = watch::channel(phase);

        Self {
            inner: Arc::new(SasInner {
                context,
                channel,
                flow_id,
                other_device,
                we_started,
                state: StdMutex::new(state),
                deadline: StdMutex::new(deadline),
                phase: sender,
            }),
        }
    }

    /// Start a new SAS flow and send the start event to the other device.
    pub(crate) async fn start(
        context: VerificationContext,
        channel: VerificationChannel,
        flow_id: FlowId,
        other_device: DeviceData,
    ) -> Result<Self, VerificationError> {
        let content = json!({
            "from_device": context.own_device_id(),
            "method": VerificationMethod::SasV1,
            "key_agreement_protocols": [KEY_AGREEMENT_PROTOCOL],
            "hashes": [HASH],
            "message_authentication_codes": [MAC_METHOD],
            "short_authentication_string": SAS_METHODS,
        });

        let start_content = channel.complete_content(START_TYPE, content.clone());
        let sas = Sas::new();

        let verifier = Self::new(
            context,
            channel,
            flow_id,
            other_device,
            true,
            InnerSas::Created { sas, start_content },
        );

        info!(flow_id = verifier.flow_id().as_str(), "Starting a SAS verification");
        verifier.send(START_TYPE, content).await?;

        Ok(verifier)
    }

    /// Create a SAS flow from the start event of the other side.
    ///
    /// The flow needs to be accepted with [`SasVerifier::accept()`]. If the
    /// start event asks for protocols we don't support the flow is cancelled
    /// right away.
    pub(crate) async fn from_start(
        context: VerificationContext,
        channel: VerificationChannel,
        flow_id: FlowId,
        other_device: DeviceData,
        start: &StartContent,
        raw_content: &Value,
    ) -> Result<Self, VerificationError> {
        let sas = Sas::new();

        let state = match check_start(start) {
            Ok(sas_methods) => {
                match calculate_commitment(&sas.public_key().to_base64(), raw_content) {
                    Some(commitment) => {
                        let accept_content = json!({
                            "method": VerificationMethod::SasV1,
                            "key_agreement_protocol": KEY_AGREEMENT_PROTOCOL,
                            "hash": HASH,
                            "message_authentication_code": MAC_METHOD,
                            "short_authentication_string": sas_methods,
                            "commitment": commitment,
                        });

                        Ok(InnerSas::Started { sas, accept_content, sas_methods })
                    }
                    None => Err(CancelCode::InvalidMessage),
                }
            }
            Err(code) => Err(code),
        };

        match state {
            Ok(state) => Ok(Self::new(context, channel, flow_id, other_device, false, state)),
            Err(code) => {
                warn!(flow_id = flow_id.as_str(), %code, "Can't handle the SAS start event");

                let info = CancelInfo::ours(code);
                let verifier = Self::new(
                    context,
                    channel,
                    flow_id,
                    other_device,
                    false,
                    InnerSas::Cancelled(info.clone()),
                );
                verifier.send(CANCEL_TYPE, info.to_content()).await?;

                Ok(verifier)
            }
        }
    }

    async fn send(&self, event_type: &str, content: Value) -> Result<(), VerificationError> {
        self.inner.channel.send(&*self.inner.context.transport, event_type, content).await?;
        Ok(())
    }

    /// The id of the flow.
    pub fn flow_id(&self) -> &FlowId {
        &self.inner.flow_id
    }

    /// The user we verify.
    pub fn other_user_id(&self) -> &UserId {
        self.inner.other_device.user_id()
    }

    /// The device we verify.
    pub fn other_device_id(&self) -> &DeviceId {
        self.inner.other_device.device_id()
    }

    /// Did we send the start event.
    pub fn we_started(&self) -> bool {
        self.inner.we_started
    }

    /// The current phase.
    pub fn phase(&self) -> SasPhase {
        self.inner.phase.borrow().clone()
    }

    /// Get notified about phase changes.
    pub fn subscribe(&self) -> watch::Receiver<SasPhase> {
        self.inner.phase.subscribe()
    }

    /// Has the verification finished successfully.
    pub fn is_done(&self) -> bool {
        self.phase() == SasPhase::Done
    }

    /// Can the short auth string be shown to the user.
    pub fn can_be_presented(&self) -> bool {
        self.inner.state.lock().unwrap().established().is_some()
    }

    /// The cancellation info, if the flow was cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        match self.phase() {
            SasPhase::Cancelled(info) => Some(info),
            _ => None,
        }
    }

    pub(crate) fn is_unanswered_start(&self) -> bool {
        self.inner.we_started
            && matches!(*self.inner.state.lock().unwrap(), InnerSas::Created { .. })
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        let state = self.inner.state.lock().unwrap();
        (!state.is_terminal()).then(|| self.inner.deadline.lock().unwrap().instant())
    }

    fn sas_info(&self, sas: &EstablishedSas) -> String {
        let context = &self.inner.context;

        let ours = format!(
            "{}|{}|{}",
            context.own_user_id(),
            context.own_device_id(),
            sas.our_public_key().to_base64()
        );
        let theirs = format!(
            "{}|{}|{}",
            self.other_user_id(),
            self.other_device_id(),
            sas.their_public_key().to_base64()
        );

        let (first, second) = if self.inner.we_started { (ours, theirs) } else { (theirs, ours) };

        format!("MATRIX_KEY_VERIFICATION_SAS|{first}|{second}|{}", self.inner.flow_id)
    }

    /// The seven emoji of the short auth string.
    ///
    /// Returns `None` if the keys weren't exchanged yet or if the other side
    /// doesn't support emoji.
    pub fn emoji(&self) -> Option<[Emoji; 7]> {
        let state = self.inner.state.lock().unwrap();
        let established = state.established()?;

        if !established.sas_methods.iter().any(|m| m == "emoji") {
            return None;
        }

        let indices = established.sas.bytes(&self.sas_info(&established.sas)).emoji_indices();

        Some(indices.map(emoji_from_index))
    }

    /// The three decimal numbers of the short auth string.
    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        let state = self.inner.state.lock().unwrap();
        let established = state.established()?;

        Some(established.sas.bytes(&self.sas_info(&established.sas)).decimals())
    }

    fn mac_content(&self, sas: &EstablishedSas) -> Value {
        let context = &self.inner.context;
        let info = format!(
            "MATRIX_KEY_VERIFICATION_MAC{}{}{}{}{}",
            context.own_user_id(),
            context.own_device_id(),
            self.other_user_id(),
            self.other_device_id(),
            self.inner.flow_id,
        );

        let mut mac = BTreeMap::new();

        let key_id = format!("ed25519:{}", context.own_device_id());
        let key = context.olm.ed25519_key().to_base64();
        mac.insert(key_id.clone(), sas.calculate_mac(&key, &format!("{info}{key_id}")).to_base64());

        if let Some(master_key) = context.trusted_own_master_key() {
            let key_id = format!("ed25519:{master_key}");
            let master_mac = sas.calculate_mac(&master_key, &format!("{info}{key_id}"));
            mac.insert(key_id, master_mac.to_base64());
        }

        let key_ids = mac.keys().map(String::as_str).collect::<Vec<_>>().join(",");
        let keys = sas.calculate_mac(&key_ids, &format!("{info}KEY_IDS"));

        json!({ "mac": mac, "keys": keys.to_base64() })
    }

    /// Check the MACs of the other side, returns the keys that turned out to
    /// be valid.
    fn verify_mac(&self, sas: &EstablishedSas, content: &MacContent) -> Result<VerifiedKeys, CancelCode> {
        let context = &self.inner.context;
        let info = format!(
            "MATRIX_KEY_VERIFICATION_MAC{}{}{}{}{}",
            self.other_user_id(),
            self.other_device_id(),
            context.own_user_id(),
            context.own_device_id(),
            self.inner.flow_id,
        );

        let check = |input: &str, key_id: &str, mac: &str| {
            let mac = Mac::from_base64(mac).map_err(|_| CancelCode::KeyMismatch)?;
            sas.verify_mac(input, &format!("{info}{key_id}"), &mac)
                .map_err(|_| CancelCode::KeyMismatch)
        };

        let key_ids = content.mac.keys().map(String::as_str).collect::<Vec<_>>().join(",");
        check(&key_ids, "KEY_IDS", &content.keys)?;

        let device_key_id = format!("ed25519:{}", self.other_device_id());
        let master_key = context.master_key_of(self.other_user_id());
        let mut verified = VerifiedKeys::default();

        for (key_id, key_mac) in &content.mac {
            trace!(key_id, "Checking a SAS MAC");

            if *key_id == device_key_id {
                let key = self.inner.other_device.ed25519_key().ok_or(CancelCode::KeyMismatch)?;
                check(&key.to_base64(), key_id, key_mac)?;
                verified.device = Some(self.inner.other_device.clone());
            } else if let Some(master_key) =
                master_key.as_ref().filter(|k| *key_id == format!("ed25519:{k}"))
            {
                check(master_key, key_id, key_mac)?;
                verified.identity = context.devices.cross_signing_info(self.other_user_id());
            } else {
                warn!(
                    key_id,
                    user_id = ?self.other_user_id(),
                    device_id = ?self.other_device_id(),
                    "The key id in the MAC event doesn't belong to the device or the master key"
                );
            }
        }

        if verified.is_empty() {
            Err(CancelCode::KeyMismatch)
        } else {
            Ok(verified)
        }
    }

    fn transition(&self, state: InnerSas, content: &VerificationContent) -> (InnerSas, Action) {
        match (state, content) {
            (InnerSas::Created { sas, start_content }, VerificationContent::Accept(accept)) => {
                match check_accept(accept) {
                    Ok(sas_methods) => {
                        let key = sas.public_key().to_base64();

                        (
                            InnerSas::TheyAccepted {
                                sas,
                                start_content,
                                commitment: accept.commitment.clone(),
                                sas_methods,
                            },
                            Action::Send(vec![(KEY_TYPE, json!({ "key": key }))]),
                        )
                    }
                    Err(code) => cancelled(code),
                }
            }
            (
                InnerSas::TheyAccepted { sas, start_content, commitment, sas_methods },
                VerificationContent::Key(key),
            ) => {
                if calculate_commitment(&key.key, &start_content).as_deref()
                    != Some(commitment.as_str())
                {
                    warn!(flow_id = self.inner.flow_id.as_str(), "The SAS commitment doesn't match");
                    return cancelled(CancelCode::MismatchedCommitment);
                }

                match sas.diffie_hellman_with_raw(&key.key) {
                    Ok(sas) => {
                        (InnerSas::KeysExchanged(Established { sas, sas_methods }), Action::Nothing)
                    }
                    Err(_) => cancelled(CancelCode::InvalidMessage),
                }
            }
            (InnerSas::WeAccepted { sas, sas_methods }, VerificationContent::Key(key)) => {
                let our_key = sas.public_key().to_base64();

                match sas.diffie_hellman_with_raw(&key.key) {
                    Ok(sas) => (
                        InnerSas::KeysExchanged(Established { sas, sas_methods }),
                        Action::Send(vec![(KEY_TYPE, json!({ "key": our_key }))]),
                    ),
                    Err(_) => cancelled(CancelCode::InvalidMessage),
                }
            }
            (InnerSas::KeysExchanged(established), VerificationContent::Mac(mac)) => {
                match self.verify_mac(&established.sas, mac) {
                    Ok(verified) => (InnerSas::MacReceived { established, verified }, Action::Nothing),
                    Err(code) => cancelled(code),
                }
            }
            (InnerSas::Confirmed { established, their_done }, VerificationContent::Mac(mac)) => {
                match self.verify_mac(&established.sas, mac) {
                    Ok(verified) if their_done => {
                        (InnerSas::Done, Action::Finish { verified, send_done: true })
                    }
                    Ok(verified) => (
                        InnerSas::WaitingForDone { verified },
                        Action::Send(vec![(DONE_TYPE, json!({}))]),
                    ),
                    Err(code) => cancelled(code),
                }
            }
            (InnerSas::Confirmed { established, .. }, VerificationContent::Done(_)) => {
                (InnerSas::Confirmed { established, their_done: true }, Action::Nothing)
            }
            (InnerSas::WaitingForDone { verified }, VerificationContent::Done(_)) => {
                (InnerSas::Done, Action::Finish { verified, send_done: false })
            }
            (state, _) if state.is_terminal() => (state, Action::Nothing),
            (_, content) => {
                warn!(
                    flow_id = self.inner.flow_id.as_str(),
                    event_type = content.event_type(),
                    "Received an unexpected SAS event"
                );
                cancelled(CancelCode::UnexpectedMessage)
            }
        }
    }

    fn publish(&self, state: &InnerSas) {
        if let Some(phase) = state.phase() {
            self.inner.phase.send_if_modified(|current| {
                if *current != phase {
                    *current = phase;
                    true
                } else {
                    false
                }
            });
        }
    }

    async fn perform(&self, action: Action) -> Result<Option<VerificationDone>, VerificationError> {
        match action {
            Action::Nothing => Ok(None),
            Action::Send(messages) => {
                for (event_type, content) in messages {
                    self.send(event_type, content).await?;
                }

                Ok(None)
            }
            Action::Cancel(info) => {
                self.send(CANCEL_TYPE, info.to_content()).await?;
                Ok(None)
            }
            Action::Finish { verified, send_done } => {
                if send_done {
                    self.send(DONE_TYPE, json!({})).await?;
                }

                info!(
                    flow_id = self.inner.flow_id.as_str(),
                    user_id = ?self.other_user_id(),
                    device_id = ?self.other_device_id(),
                    "SAS verification finished successfully"
                );

                self.inner.context.mark_as_verified(&verified).await?;

                Ok(Some(VerificationDone {
                    user_id: self.other_user_id().to_owned(),
                    device_id: self.other_device_id().to_owned(),
                    flow_id: self.inner.flow_id.clone(),
                    verified_master_key: verified.identity.is_some(),
                    self_verification: self.other_user_id() == self.inner.context.own_user_id(),
                }))
            }
        }
    }

    pub(crate) async fn receive_event(
        &self,
        event: &IncomingVerificationEvent,
    ) -> Result<Option<VerificationDone>, VerificationError> {
        if event.sender != self.other_user_id() {
            return Ok(None);
        }

        let action = {
            let mut state = self.inner.state.lock().unwrap();
            let (next, action) = self.transition(mem::replace(&mut *state, InnerSas::Transitioning), &event.content);
            *state = next;

            if !matches!(action, Action::Cancel(_)) {
                self.inner.deadline.lock().unwrap().reset();
            }

            self.publish(&state);
            action
        };

        self.perform(action).await
    }

    /// Update the state with `f` unless the flow already finished.
    ///
    /// `f` gets the current state and returns the next one along with the
    /// action, or the error to return if the state doesn't allow the operation.
    fn update(
        &self,
        action: &'static str,
        f: impl FnOnce(&Self, InnerSas) -> Result<(InnerSas, Action), InnerSas>,
    ) -> Result<Action, VerificationError> {
        let mut state = self.inner.state.lock().unwrap();
        let current = mem::replace(&mut *state, InnerSas::Transitioning);

        match f(self, current) {
            Ok((next, result)) => {
                *state = next;
                self.inner.deadline.lock().unwrap().reset();
                self.publish(&state);

                Ok(result)
            }
            Err(current) => {
                let error = match &current {
                    InnerSas::Cancelled(info) => VerificationError::Cancelled(info.clone()),
                    _ => VerificationError::InvalidPhase { action, phase: VerificationPhase::Started },
                };
                *state = current;

                Err(error)
            }
        }
    }

    /// Accept a flow the other side started.
    pub async fn accept(&self) -> Result<(), VerificationError> {
        let action = self.update("accept", |_, state| match state {
            InnerSas::Started { sas, accept_content, sas_methods } => Ok((
                InnerSas::WeAccepted { sas, sas_methods },
                Action::Send(vec![(ACCEPT_TYPE, accept_content)]),
            )),
            other => Err(other),
        })?;

        debug!(flow_id = self.inner.flow_id.as_str(), "Accepted the SAS verification");
        self.perform(action).await?;

        Ok(())
    }

    /// Confirm that the short auth string matches the one the other device
    /// shows.
    ///
    /// Our MAC is sent to the other side, the flow finishes once both sides
    /// confirmed and the MACs check out.
    pub async fn confirm(&self) -> Result<(), VerificationError> {
        let action = self.update("confirm", |this, state| match state {
            InnerSas::KeysExchanged(established) => {
                let mac = this.mac_content(&established.sas);
                Ok((
                    InnerSas::Confirmed { established, their_done: false },
                    Action::Send(vec![(MAC_TYPE, mac)]),
                ))
            }
            InnerSas::MacReceived { established, verified } => {
                let mac = this.mac_content(&established.sas);
                Ok((
                    InnerSas::WaitingForDone { verified },
                    Action::Send(vec![(MAC_TYPE, mac), (DONE_TYPE, json!({}))]),
                ))
            }
            other => Err(other),
        })?;

        info!(flow_id = self.inner.flow_id.as_str(), "Confirmed the short auth string");
        self.perform(action).await?;

        Ok(())
    }

    /// Tell the other side the short auth strings don't match, this cancels
    /// the flow.
    pub async fn mismatch(&self) -> Result<(), VerificationError> {
        self.cancel_with_code(CancelCode::MismatchedSas).await
    }

    /// Cancel the verification.
    pub async fn cancel(&self) -> Result<(), VerificationError> {
        self.cancel_with_code(CancelCode::User).await
    }

    pub(crate) async fn cancel_with_code(&self, code: CancelCode) -> Result<(), VerificationError> {
        let info = {
            let mut state = self.inner.state.lock().unwrap();

            if state.is_terminal() {
                return Ok(());
            }

            let info = CancelInfo::ours(code);
            *state = InnerSas::Cancelled(info.clone());
            self.publish(&state);
            info
        };

        self.send(CANCEL_TYPE, info.to_content()).await
    }

    pub(crate) fn receive_cancel(&self, info: CancelInfo) {
        let mut state = self.inner.state.lock().unwrap();

        if !state.is_terminal() {
            *state = InnerSas::Cancelled(info);
            self.publish(&state);
        }
    }

    /// Wait until the verification finishes.
    ///
    /// The flow is cancelled with a timeout if the other side doesn't send
    /// the next event in time.
    pub async fn verify(&self) -> Result<(), VerificationError> {
        let mut changes = self.subscribe();

        tokio::select! {
            _ = changes.wait_for(SasPhase::is_terminal) => {}
            _ = wait_for_deadline(|| self.deadline()) => {
                self.cancel_with_code(CancelCode::Timeout).await?;
            }
        }

        match self.phase() {
            SasPhase::Done => Ok(()),
            SasPhase::Cancelled(info) => Err(VerificationError::Cancelled(info)),
            _ => Err(VerificationError::Cancelled(CancelInfo::ours(CancelCode::Timeout))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches2::assert_matches;
    use ruma::{device_id, user_id};
    use serde_json::{json, Value};

    use super::{calculate_commitment, negotiate_sas_methods, SasPhase, SasVerifier};
    use crate::{
        error::VerificationError,
        types::events::ToDeviceEvent,
        verification::{
            event_enums::VerificationContent,
            tests::{introduce, TestSide},
            CancelCode, CancelInfo, FlowId, IncomingVerificationEvent, VerificationChannel,
            VerificationDone,
        },
    };

    fn flow_id() -> FlowId {
        FlowId::ToDevice("sas_txn".into())
    }

    /// Take the to-device events one side sent and turn them into incoming
    /// events for the other side.
    fn outgoing(side: &TestSide) -> Vec<IncomingVerificationEvent> {
        side.transport
            .take_to_device()
            .into_iter()
            .filter_map(|sent| {
                let content = sent.messages.values().next()?.values().next()?.clone();
                let event = ToDeviceEvent::new(side.olm.user_id().to_owned(), sent.event_type, content);
                IncomingVerificationEvent::from_to_device(&event).unwrap()
            })
            .collect()
    }

    async fn deliver(events: Vec<IncomingVerificationEvent>, to: &SasVerifier) -> Option<VerificationDone> {
        let mut done = None;

        for event in events {
            if let VerificationContent::Cancel(c) = &event.content {
                to.receive_cancel(CancelInfo::theirs(c.code.clone(), c.reason.clone()));
            } else if let Some(d) = to.receive_event(&event).await.unwrap() {
                done = Some(d);
            }
        }

        done
    }

    fn channel_to(side: &TestSide) -> VerificationChannel {
        VerificationChannel::from_flow_id(
            &flow_id(),
            side.olm.user_id().to_owned(),
            side.olm.device_id().to_owned(),
        )
    }

    async fn setup() -> (TestSide, TestSide, SasVerifier, SasVerifier) {
        let alice = TestSide::new(user_id!("@alice:localhost"), device_id!("ALICE1")).await;
        let bob = TestSide::new(user_id!("@bob:localhost"), device_id!("BOB1")).await;
        introduce(&alice, &bob).await;

        let bob_device = alice.devices.get_device(bob.olm.user_id(), bob.olm.device_id()).unwrap();
        let alice_device =
            bob.devices.get_device(alice.olm.user_id(), alice.olm.device_id()).unwrap();

        let alice_sas =
            SasVerifier::start(alice.context.clone(), channel_to(&bob), flow_id(), bob_device)
                .await
                .unwrap();

        let start = outgoing(&alice).remove(0);
        assert_matches!(&start.content, VerificationContent::Start(start_content));

        let bob_sas = SasVerifier::from_start(
            bob.context.clone(),
            channel_to(&alice),
            flow_id(),
            alice_device,
            start_content,
            &start.raw_content,
        )
        .await
        .unwrap();

        (alice, bob, alice_sas, bob_sas)
    }

    /// Run the flow until both sides can show the short auth string.
    async fn exchange_keys(alice: &TestSide, bob: &TestSide, alice_sas: &SasVerifier, bob_sas: &SasVerifier) {
        bob_sas.accept().await.unwrap();
        assert_eq!(bob_sas.phase(), SasPhase::Accepted);

        deliver(outgoing(bob), alice_sas).await;
        deliver(outgoing(alice), bob_sas).await;
        deliver(outgoing(bob), alice_sas).await;

        assert_eq!(alice_sas.phase(), SasPhase::KeysExchanged);
        assert_eq!(bob_sas.phase(), SasPhase::KeysExchanged);
    }

    #[test]
    fn sas_method_negotiation() {
        assert_eq!(
            negotiate_sas_methods(&["emoji".to_owned(), "decimal".to_owned()]),
            Some(vec!["decimal".to_owned(), "emoji".to_owned()])
        );
        assert_eq!(negotiate_sas_methods(&["decimal".to_owned()]), Some(vec!["decimal".to_owned()]));
        assert_eq!(negotiate_sas_methods(&["emoji".to_owned()]), None);
    }

    #[test]
    fn commitments_cover_the_content() {
        let content = json!({ "method": "m.sas.v1", "transaction_id": "txn" });
        let reordered: Value =
            serde_json::from_str(r#"{"transaction_id":"txn","method":"m.sas.v1"}"#).unwrap();

        let commitment = calculate_commitment("key", &content).unwrap();
        assert_eq!(calculate_commitment("key", &reordered).unwrap(), commitment);
        assert_ne!(calculate_commitment("other_key", &content).unwrap(), commitment);
    }

    #[tokio::test]
    async fn full_flow() {
        let (alice, bob, alice_sas, bob_sas) = setup().await;

        assert!(alice_sas.we_started());
        assert!(alice_sas.is_unanswered_start());
        assert_eq!(bob_sas.phase(), SasPhase::Started);
        assert!(alice_sas.emoji().is_none());

        exchange_keys(&alice, &bob, &alice_sas, &bob_sas).await;
        assert!(!alice_sas.is_unanswered_start());

        assert!(alice_sas.can_be_presented());
        assert_eq!(alice_sas.emoji(), bob_sas.emoji());
        assert_eq!(alice_sas.decimals(), bob_sas.decimals());
        assert!(alice_sas.emoji().is_some());

        alice_sas.confirm().await.unwrap();
        assert_eq!(alice_sas.phase(), SasPhase::Confirmed);

        deliver(outgoing(&alice), &bob_sas).await;
        // Bob still needs to confirm.
        assert_eq!(bob_sas.phase(), SasPhase::KeysExchanged);

        bob_sas.confirm().await.unwrap();
        let alice_done = deliver(outgoing(&bob), &alice_sas).await.unwrap();
        let bob_done = deliver(outgoing(&alice), &bob_sas).await.unwrap();

        assert!(alice_sas.is_done());
        assert!(bob_sas.is_done());
        assert_eq!(alice_done.user_id, bob.olm.user_id());
        assert_eq!(bob_done.device_id, alice.olm.device_id());
        assert!(!alice_done.self_verification);

        let trust =
            alice.devices.get_device_trust(bob.olm.user_id(), bob.olm.device_id()).unwrap();
        assert!(trust.is_locally_verified());

        let trust =
            bob.devices.get_device_trust(alice.olm.user_id(), alice.olm.device_id()).unwrap();
        assert!(trust.is_locally_verified());

        alice_sas.verify().await.unwrap();
    }

    #[tokio::test]
    async fn master_keys_are_verified() {
        let (alice, bob, alice_sas, bob_sas) = setup().await;

        let alice_identity = alice.bootstrap_cross_signing().await;
        let bob_identity = bob.bootstrap_cross_signing().await;
        alice.devices.store_cross_signing_info(bob_identity);
        bob.devices.store_cross_signing_info(alice_identity);

        exchange_keys(&alice, &bob, &alice_sas, &bob_sas).await;

        alice_sas.confirm().await.unwrap();
        bob_sas.confirm().await.unwrap();
        deliver(outgoing(&alice), &bob_sas).await;
        let done = deliver(outgoing(&bob), &alice_sas).await.unwrap();
        deliver(outgoing(&alice), &bob_sas).await.unwrap();

        assert!(done.verified_master_key);

        // Alice signed Bob's master key with her user signing key.
        let uploads = alice.transport.uploaded_signatures.lock().unwrap().clone();
        assert!(uploads.iter().any(|u| u.contains_key(bob.olm.user_id())));
    }

    #[tokio::test]
    async fn mismatched_sas_cancels() {
        let (alice, bob, alice_sas, bob_sas) = setup().await;
        exchange_keys(&alice, &bob, &alice_sas, &bob_sas).await;

        alice_sas.mismatch().await.unwrap();
        assert_matches!(alice_sas.phase(), SasPhase::Cancelled(info));
        assert_eq!(info.cancel_code(), &CancelCode::MismatchedSas);

        deliver(outgoing(&alice), &bob_sas).await;
        let info = bob_sas.cancel_info().unwrap();
        assert!(!info.cancelled_by_us());

        assert_matches!(bob_sas.confirm().await, Err(VerificationError::Cancelled(_)));
        assert_matches!(bob_sas.verify().await, Err(VerificationError::Cancelled(info)));
        assert_eq!(info.cancel_code(), &CancelCode::MismatchedSas);
    }

    #[tokio::test]
    async fn mismatched_commitment_cancels() {
        let (alice, bob, alice_sas, bob_sas) = setup().await;

        bob_sas.accept().await.unwrap();
        deliver(outgoing(&bob), &alice_sas).await;
        deliver(outgoing(&alice), &bob_sas).await;

        // Replace Bob's key with one he didn't commit to.
        let mut events = outgoing(&bob);
        let other_key = vodozemac::sas::Sas::new().public_key().to_base64();
        events[0].content = VerificationContent::parse(
            "m.key.verification.key",
            &json!({ "key": other_key, "transaction_id": "sas_txn" }),
        )
        .unwrap()
        .unwrap();

        deliver(events, &alice_sas).await;

        assert_matches!(alice_sas.phase(), SasPhase::Cancelled(info));
        assert_eq!(info.cancel_code(), &CancelCode::MismatchedCommitment);
        assert_eq!(alice.transport.sent_to_device()[0].event_type, "m.key.verification.cancel");
    }

    #[tokio::test]
    async fn unexpected_events_cancel() {
        let (alice, _bob, alice_sas, _bob_sas) = setup().await;

        let event = IncomingVerificationEvent {
            sender: user_id!("@bob:localhost").to_owned(),
            flow_id: flow_id(),
            content: VerificationContent::parse(
                "m.key.verification.mac",
                &json!({ "mac": {}, "keys": "", "transaction_id": "sas_txn" }),
            )
            .unwrap()
            .unwrap(),
            raw_content: json!({}),
            timestamp: None,
        };

        alice_sas.receive_event(&event).await.unwrap();

        assert_eq!(alice_sas.cancel_info().unwrap().cancel_code(), &CancelCode::UnexpectedMessage);
        assert_eq!(alice.transport.sent_to_device().len(), 1);
    }

    #[tokio::test]
    async fn unknown_protocols_cancel() {
        let alice = TestSide::new(user_id!("@alice:localhost"), device_id!("ALICE1")).await;
        let bob = TestSide::new(user_id!("@bob:localhost"), device_id!("BOB1")).await;
        introduce(&alice, &bob).await;

        let raw = json!({
            "from_device": "ALICE1",
            "method": "m.sas.v1",
            "key_agreement_protocols": ["curve25519"],
            "hashes": ["sha256"],
            "message_authentication_codes": ["hkdf-hmac-sha256"],
            "short_authentication_string": ["decimal"],
            "transaction_id": "sas_txn",
        });
        let start = serde_json::from_value(raw.clone()).unwrap();
        let alice_device =
            bob.devices.get_device(alice.olm.user_id(), alice.olm.device_id()).unwrap();

        let bob_sas = SasVerifier::from_start(
            bob.context.clone(),
            channel_to(&alice),
            flow_id(),
            alice_device,
            &start,
            &raw,
        )
        .await
        .unwrap();

        assert_eq!(bob_sas.cancel_info().unwrap().cancel_code(), &CancelCode::UnknownMethod);
        assert_matches!(bob_sas.accept().await, Err(VerificationError::Cancelled(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_flows_time_out() {
        let (alice, _bob, alice_sas, _bob_sas) = setup().await;

        let start = tokio::time::Instant::now();
        let result = alice_sas.verify().await;

        assert_matches!(result, Err(VerificationError::Cancelled(info)));
        assert_eq!(info.cancel_code(), &CancelCode::Timeout);
        assert!(info.cancelled_by_us());
        assert!(start.elapsed() >= Duration::from_secs(60));

        let sent = alice.transport.sent_to_device();
        assert_eq!(sent.last().unwrap().event_type, "m.key.verification.cancel");
    }
}
