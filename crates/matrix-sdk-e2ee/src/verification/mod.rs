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

//! Interactive verification of devices and users.
//!
//! A verification starts with a [`VerificationRequest`], sent either as
//! to-device messages or as an event in a DM room. Once the other side is
//! ready, one of the methods both sides support is started: comparing a short
//! auth string ([`SasVerifier`]) or scanning a QR code ([`QrVerification`]).
//!
//! The [`VerificationMachine`] routes incoming verification events to the
//! matching request.

mod channel;
mod emoji;
mod event_enums;
mod machine;
mod qrcode;
mod requests;
mod sas;
mod timer;

use std::{fmt, sync::Arc};

pub(crate) use channel::VerificationChannel;
pub use emoji::{format_emojis, Emoji};
pub(crate) use event_enums::IncomingVerificationEvent;
pub use event_enums::VerificationMethod;
pub use machine::VerificationMachine;
pub use qrcode::{
    generate_buffer, DecodingError, EncodingError, QrMode, QrPhase, QrVerification,
    QrVerificationData,
};
pub use requests::{VerificationPhase, VerificationRequest};
use ruma::{
    DeviceId, OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedTransactionId, OwnedUserId, UserId,
};
pub use sas::{SasPhase, SasVerifier};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    callbacks::CryptoCallbacks,
    config::E2eeConfig,
    error::VerificationError,
    identities::{CrossSigningInfo, DeviceData, DeviceListManager, LocalTrust},
    olm::OlmDevice,
    requests::{CryptoTransport, SignatureUploadRequest},
    types::KeyUsage,
};

/// The code why a verification was cancelled.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CancelCode {
    /// The user cancelled the verification, `m.user`.
    User,
    /// The verification timed out, `m.timeout`.
    Timeout,
    /// The device doesn't know the transaction id, `m.unknown_transaction`.
    UnknownTransaction,
    /// The device can't handle the requested method, `m.unknown_method`.
    UnknownMethod,
    /// The device received an unexpected message, `m.unexpected_message`.
    UnexpectedMessage,
    /// A key didn't match the one we expected, `m.key_mismatch`.
    KeyMismatch,
    /// The user didn't match the one we expected, `m.user_mismatch`.
    UserMismatch,
    /// A message couldn't be parsed or was invalid, `m.invalid_message`.
    InvalidMessage,
    /// The request was accepted by another device, `m.accepted`.
    Accepted,
    /// The hash commitment didn't match, `m.mismatched_commitment`.
    MismatchedCommitment,
    /// The short auth strings didn't match, `m.mismatched_sas`.
    MismatchedSas,
    /// A code we don't know about.
    Custom(String),
}

impl CancelCode {
    /// The string form of the code.
    pub fn as_str(&self) -> &str {
        match self {
            CancelCode::User => "m.user",
            CancelCode::Timeout => "m.timeout",
            CancelCode::UnknownTransaction => "m.unknown_transaction",
            CancelCode::UnknownMethod => "m.unknown_method",
            CancelCode::UnexpectedMessage => "m.unexpected_message",
            CancelCode::KeyMismatch => "m.key_mismatch",
            CancelCode::UserMismatch => "m.user_mismatch",
            CancelCode::InvalidMessage => "m.invalid_message",
            CancelCode::Accepted => "m.accepted",
            CancelCode::MismatchedCommitment => "m.mismatched_commitment",
            CancelCode::MismatchedSas => "m.mismatched_sas",
            CancelCode::Custom(c) => c,
        }
    }

    /// The human readable reason that is sent along with the code.
    pub fn reason(&self) -> &'static str {
        match self {
            CancelCode::User => "The user cancelled the verification.",
            CancelCode::Timeout => "The verification process timed out.",
            CancelCode::UnknownTransaction => {
                "The device does not know about the given transaction ID."
            }
            CancelCode::UnknownMethod => {
                "The device does not know how to handle the requested method."
            }
            CancelCode::UnexpectedMessage => "The device received an unexpected message.",
            CancelCode::KeyMismatch => "The expected key did not match the verified one.",
            CancelCode::UserMismatch => "The expected user did not match the verified user.",
            CancelCode::InvalidMessage => "The received message was invalid.",
            CancelCode::Accepted => {
                "A m.key.verification.request was accepted by a different device."
            }
            CancelCode::MismatchedCommitment => "The hash commitment did not match.",
            CancelCode::MismatchedSas => "The short authentication string did not match.",
            CancelCode::Custom(_) => "Unknown cancel reason.",
        }
    }
}

impl From<&str> for CancelCode {
    fn from(value: &str) -> Self {
        match value {
            "m.user" => Self::User,
            "m.timeout" => Self::Timeout,
            "m.unknown_transaction" => Self::UnknownTransaction,
            "m.unknown_method" => Self::UnknownMethod,
            "m.unexpected_message" => Self::UnexpectedMessage,
            "m.key_mismatch" => Self::KeyMismatch,
            "m.user_mismatch" => Self::UserMismatch,
            "m.invalid_message" => Self::InvalidMessage,
            "m.accepted" => Self::Accepted,
            "m.mismatched_commitment" => Self::MismatchedCommitment,
            "m.mismatched_sas" => Self::MismatchedSas,
            c => Self::Custom(c.to_owned()),
        }
    }
}

impl fmt::Display for CancelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CancelCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CancelCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.as_str().into())
    }
}

/// Information about the cancellation of a verification request or
/// verification flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelInfo {
    cancelled_by_us: bool,
    cancel_code: CancelCode,
    reason: String,
}

impl CancelInfo {
    pub(crate) fn ours(cancel_code: CancelCode) -> Self {
        let reason = cancel_code.reason().to_owned();
        Self { cancelled_by_us: true, cancel_code, reason }
    }

    pub(crate) fn theirs(cancel_code: CancelCode, reason: String) -> Self {
        Self { cancelled_by_us: false, cancel_code, reason }
    }

    /// Get the human readable reason of the cancellation.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Get the `CancelCode` that cancelled this verification.
    pub fn cancel_code(&self) -> &CancelCode {
        &self.cancel_code
    }

    /// Was the verification cancelled by us?
    pub fn cancelled_by_us(&self) -> bool {
        self.cancelled_by_us
    }

    pub(crate) fn to_content(&self) -> serde_json::Value {
        serde_json::json!({ "code": self.cancel_code, "reason": self.reason })
    }
}

impl fmt::Display for CancelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let by = if self.cancelled_by_us { "us" } else { "the other side" };
        write!(f, "{} ({}), cancelled by {by}", self.reason, self.cancel_code)
    }
}

/// The id of a verification flow.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlowId {
    /// The flow uses to-device messages and is identified by a transaction id.
    ToDevice(OwnedTransactionId),
    /// The flow happens in a room and is identified by the event id of the
    /// request.
    InRoom(OwnedRoomId, OwnedEventId),
}

impl FlowId {
    /// The flow id as a string.
    pub fn as_str(&self) -> &str {
        match self {
            FlowId::ToDevice(t) => t.as_str(),
            FlowId::InRoom(_, e) => e.as_str(),
        }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successfully finished verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationDone {
    /// The user we verified.
    pub user_id: OwnedUserId,
    /// The device we verified with.
    pub device_id: OwnedDeviceId,
    /// The flow that finished.
    pub flow_id: FlowId,
    /// Did the flow verify the master key of the other user.
    pub verified_master_key: bool,
    /// Did we verify one of our own devices.
    pub self_verification: bool,
}

/// The keys a verification flow proved to be the right ones.
#[derive(Clone, Debug, Default)]
pub(crate) struct VerifiedKeys {
    pub device: Option<DeviceData>,
    pub identity: Option<CrossSigningInfo>,
}

impl VerifiedKeys {
    pub fn is_empty(&self) -> bool {
        self.device.is_none() && self.identity.is_none()
    }
}

/// Everything a verification flow needs to talk to the rest of the machinery.
#[derive(Clone)]
pub(crate) struct VerificationContext {
    pub olm: OlmDevice,
    pub devices: DeviceListManager,
    pub transport: Arc<dyn CryptoTransport>,
    pub callbacks: Arc<dyn CryptoCallbacks>,
    pub config: E2eeConfig,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for VerificationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationContext")
            .field("user_id", &self.olm.user_id())
            .field("device_id", &self.olm.device_id())
            .finish_non_exhaustive()
    }
}

impl VerificationContext {
    pub fn own_user_id(&self) -> &UserId {
        self.olm.user_id()
    }

    pub fn own_device_id(&self) -> &DeviceId {
        self.olm.device_id()
    }

    /// The base64 master key of the given user, as we know it.
    pub fn master_key_of(&self, user_id: &UserId) -> Option<String> {
        let info = self.devices.cross_signing_info(user_id)?;
        info.get_key(KeyUsage::Master)?.public_key_base64().map(str::to_owned)
    }

    /// Our own master key, only if we trust it.
    pub fn trusted_own_master_key(&self) -> Option<String> {
        let info = self.devices.own_identity()?;
        info.get_key(KeyUsage::Master)?.public_key_base64().map(str::to_owned)
    }

    /// Persist the outcome of a successful verification.
    ///
    /// The device is marked as locally verified. Our own devices and the
    /// master keys of other users are signed with our cross-signing keys if
    /// the application can provide the private keys, a verified own master
    /// key becomes our trusted identity.
    pub async fn mark_as_verified(&self, keys: &VerifiedKeys) -> Result<(), VerificationError> {
        let own_user_id = self.own_user_id();
        let own_identity = self.devices.own_identity();
        let mut signatures = SignatureUploadRequest::new();

        if let Some(device) = &keys.device {
            info!(
                user_id = ?device.user_id(),
                device_id = ?device.device_id(),
                "Marking a device as verified"
            );

            self.devices.set_device_local_trust(
                device.user_id(),
                device.device_id(),
                LocalTrust::Verified,
            );

            if device.user_id() == own_user_id {
                if let Some(own_identity) = &own_identity {
                    match own_identity.sign_device(device.device_keys(), &*self.callbacks).await {
                        Ok(signed) => {
                            signatures
                                .entry(own_user_id.to_owned())
                                .or_default()
                                .insert(device.device_id().to_string(), signed.to_json()?);
                        }
                        Err(e) => debug!("Can't sign the verified device: {e}"),
                    }
                }
            }
        }

        if let Some(identity) = &keys.identity {
            if identity.user_id() == own_user_id {
                info!("The other device verified our master key, trusting our identity");
                self.devices.set_own_identity(identity.clone());
            } else if let Some(own_identity) = &own_identity {
                match own_identity.sign_user(identity, &*self.callbacks).await {
                    Ok(master) => {
                        if let Some(key) = master.public_key_base64() {
                            signatures
                                .entry(identity.user_id().to_owned())
                                .or_default()
                                .insert(key.to_owned(), master.to_json()?);
                        }
                    }
                    Err(e) => warn!(
                        user_id = ?identity.user_id(),
                        "Can't sign the master key of the verified user: {e}"
                    ),
                }
            }
        }

        if !signatures.is_empty() {
            self.transport.upload_signatures(signatures).await?;
        }

        self.devices.save_if_dirty(None).await?;

        Ok(())
    }
}

/// A verifier for a method we don't support.
///
/// It's cancelled from the start, waiting for it returns the cancellation.
#[derive(Clone, Debug)]
pub struct UnsupportedVerifier {
    method: VerificationMethod,
    cancel_info: CancelInfo,
}

impl UnsupportedVerifier {
    pub(crate) fn new(method: VerificationMethod) -> Self {
        Self { method, cancel_info: CancelInfo::ours(CancelCode::UnknownMethod) }
    }

    /// The method the other side tried to start.
    pub fn method(&self) -> &VerificationMethod {
        &self.method
    }
}

/// The verifier of a started verification flow.
#[derive(Clone, Debug)]
pub enum Verifier {
    /// Comparing short auth strings.
    Sas(SasVerifier),
    /// Scanning a QR code.
    Qr(QrVerification),
    /// A method we don't know how to handle.
    Unsupported(UnsupportedVerifier),
}

impl Verifier {
    /// Wait until the verification finishes.
    ///
    /// Fails with [`VerificationError::Cancelled`] if the flow gets cancelled
    /// or if the other side doesn't answer in time.
    pub async fn verify(&self) -> Result<(), VerificationError> {
        match self {
            Verifier::Sas(s) => s.verify().await,
            Verifier::Qr(q) => q.verify().await,
            Verifier::Unsupported(u) => Err(VerificationError::Cancelled(u.cancel_info.clone())),
        }
    }

    /// Cancel the verification, the other side is notified.
    pub async fn cancel(&self) -> Result<(), VerificationError> {
        self.cancel_with_code(CancelCode::User).await
    }

    pub(crate) async fn cancel_with_code(&self, code: CancelCode) -> Result<(), VerificationError> {
        match self {
            Verifier::Sas(s) => s.cancel_with_code(code).await,
            Verifier::Qr(q) => q.cancel_with_code(code).await,
            Verifier::Unsupported(_) => Ok(()),
        }
    }

    pub(crate) fn receive_cancel(&self, info: CancelInfo) {
        match self {
            Verifier::Sas(s) => s.receive_cancel(info),
            Verifier::Qr(q) => q.receive_cancel(info),
            Verifier::Unsupported(_) => {}
        }
    }

    pub(crate) async fn receive_event(
        &self,
        event: &IncomingVerificationEvent,
    ) -> Result<Option<VerificationDone>, VerificationError> {
        match self {
            Verifier::Sas(s) => s.receive_event(event).await,
            Verifier::Qr(q) => q.receive_event(event).await,
            Verifier::Unsupported(_) => Ok(None),
        }
    }

    /// Did we start this flow.
    pub fn we_started(&self) -> bool {
        match self {
            Verifier::Sas(s) => s.we_started(),
            Verifier::Qr(q) => q.we_started(),
            Verifier::Unsupported(_) => false,
        }
    }

    /// Has the flow finished successfully.
    pub fn is_done(&self) -> bool {
        match self {
            Verifier::Sas(s) => s.is_done(),
            Verifier::Qr(q) => q.is_done(),
            Verifier::Unsupported(_) => false,
        }
    }

    /// The cancellation info, if the flow was cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        match self {
            Verifier::Sas(s) => s.cancel_info(),
            Verifier::Qr(q) => q.cancel_info(),
            Verifier::Unsupported(u) => Some(u.cancel_info.clone()),
        }
    }

    /// When the flow times out, `None` once it finished.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        match self {
            Verifier::Sas(s) => s.deadline(),
            Verifier::Qr(q) => q.deadline(),
            Verifier::Unsupported(_) => None,
        }
    }

    pub(crate) fn timed_out(&self) -> bool {
        self.deadline().is_some_and(|d| Instant::now() >= d)
    }

    /// Is this a flow we started and the other side didn't react to yet.
    ///
    /// Only such flows take part in the start race.
    pub(crate) fn is_unanswered_start(&self) -> bool {
        match self {
            Verifier::Sas(s) => s.is_unanswered_start(),
            Verifier::Qr(_) | Verifier::Unsupported(_) => false,
        }
    }

    /// The SAS verifier, if this is a SAS flow.
    pub fn sas(&self) -> Option<&SasVerifier> {
        if let Verifier::Sas(s) = self {
            Some(s)
        } else {
            None
        }
    }

    /// The QR code verifier, if this is a QR code flow.
    pub fn qr(&self) -> Option<&QrVerification> {
        if let Verifier::Qr(q) = self {
            Some(q)
        } else {
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use ruma::{device_id, user_id, DeviceId, UserId};
    use serde_json::json;

    use super::{CancelCode, CancelInfo, FlowId, VerificationContext, VerifiedKeys};
    use crate::{
        callbacks::CryptoCallbacks,
        config::E2eeConfig,
        identities::{CrossSigningInfo, CrossSigningLevel, DeviceData, DeviceListManager, LocalTrust},
        olm::{tests::olm_device, OlmDevice},
        testing::{MockTransport, TestCallbacks},
    };

    /// One side of a verification in the tests.
    pub(crate) struct TestSide {
        pub olm: OlmDevice,
        pub devices: DeviceListManager,
        pub transport: Arc<MockTransport>,
        pub callbacks: Arc<TestCallbacks>,
        pub context: VerificationContext,
    }

    impl TestSide {
        pub async fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
            let olm = olm_device(user_id, device_id).await;
            let transport = Arc::new(MockTransport::new());
            let callbacks = Arc::new(TestCallbacks::default());
            let config = E2eeConfig::default();

            let devices = DeviceListManager::load(
                user_id.to_owned(),
                device_id.to_owned(),
                olm.store().clone(),
                transport.clone(),
                config.clone(),
            )
            .await
            .unwrap();

            let context = VerificationContext {
                olm: olm.clone(),
                devices: devices.clone(),
                transport: transport.clone(),
                callbacks: callbacks.clone(),
                config,
            };

            Self { olm, devices, transport, callbacks, context }
        }

        pub async fn device_data(&self) -> DeviceData {
            DeviceData::new(self.olm.device_keys().await.unwrap(), LocalTrust::Unverified)
        }

        /// Create and trust a fresh cross-signing identity.
        pub async fn bootstrap_cross_signing(&self) -> CrossSigningInfo {
            let mut identity = CrossSigningInfo::new(self.olm.user_id().to_owned());
            identity
                .reset_keys(CrossSigningLevel::all(), &*self.callbacks as &dyn CryptoCallbacks)
                .await
                .unwrap();
            self.devices.set_own_identity(identity.clone());

            identity
        }
    }

    /// Make both sides know each other's devices.
    pub(crate) async fn introduce(alice: &TestSide, bob: &TestSide) {
        alice.devices.store_device(bob.device_data().await);
        bob.devices.store_device(alice.device_data().await);
    }

    #[test]
    fn cancel_codes() {
        for code in [
            "m.user",
            "m.timeout",
            "m.unknown_method",
            "m.unexpected_message",
            "m.key_mismatch",
            "m.invalid_message",
        ] {
            let parsed: CancelCode = serde_json::from_value(json!(code)).unwrap();
            assert!(!matches!(parsed, CancelCode::Custom(_)));
            assert_eq!(serde_json::to_value(&parsed).unwrap(), json!(code));
        }

        assert_eq!(
            CancelCode::from("org.example.code"),
            CancelCode::Custom("org.example.code".to_owned())
        );
    }

    #[test]
    fn cancel_info() {
        let info = CancelInfo::ours(CancelCode::Timeout);

        assert!(info.cancelled_by_us());
        assert_eq!(info.reason(), "The verification process timed out.");
        assert_eq!(
            info.to_content(),
            json!({ "code": "m.timeout", "reason": "The verification process timed out." })
        );

        let info = CancelInfo::theirs(CancelCode::User, "Bye".to_owned());
        assert!(!info.cancelled_by_us());
        assert_eq!(info.to_string(), "Bye (m.user), cancelled by the other side");
    }

    #[test]
    fn flow_ids() {
        let flow_id = FlowId::ToDevice("txn".into());
        assert_eq!(flow_id.as_str(), "txn");
    }

    #[tokio::test]
    async fn verified_devices_are_trusted_and_signed() {
        let alice = TestSide::new(user_id!("@alice:localhost"), device_id!("ALICE1")).await;
        let other = TestSide::new(user_id!("@alice:localhost"), device_id!("ALICE2")).await;

        alice.bootstrap_cross_signing().await;
        alice.devices.store_device(other.device_data().await);

        let keys = VerifiedKeys { device: Some(other.device_data().await), identity: None };
        alice.context.mark_as_verified(&keys).await.unwrap();

        let trust =
            alice.devices.get_device_trust(other.olm.user_id(), other.olm.device_id()).unwrap();
        assert!(trust.is_verified());
        assert!(trust.is_locally_verified());

        let uploads = alice.transport.uploaded_signatures.lock().unwrap().clone();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0][other.olm.user_id()].contains_key("ALICE2"));
    }

    #[tokio::test]
    async fn verified_own_master_keys_are_trusted() {
        let alice = TestSide::new(user_id!("@alice:localhost"), device_id!("ALICE1")).await;
        let new_device = TestSide::new(user_id!("@alice:localhost"), device_id!("ALICE2")).await;

        let identity = alice.bootstrap_cross_signing().await;
        new_device.devices.store_cross_signing_info(identity.clone());
        assert!(new_device.devices.own_identity().is_none());

        let keys = VerifiedKeys { device: None, identity: Some(identity) };
        new_device.context.mark_as_verified(&keys).await.unwrap();

        assert!(new_device.devices.own_identity().is_some());
        // We don't hold the private keys, nothing gets signed.
        assert!(new_device.transport.uploaded_signatures.lock().unwrap().is_empty());
    }
}
