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
    fmt,
    io::{Cursor, Read},
    num::TryFromIntError,
    string::FromUtf8Error,
    sync::{Arc, Mutex as StdMutex},
};

use byteorder::{BigEndian, ReadBytesExt};
use qrcode::QrCode;
use rand::{thread_rng, RngCore};
use ruma::{DeviceId, UserId};
use serde_json::json;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tracing::{info, warn};
use vodozemac::{base64_decode, base64_encode, Ed25519PublicKey};

use super::{
    event_enums::{StartContent, VerificationContent, CANCEL_TYPE, DONE_TYPE, START_TYPE},
    timer::{wait_for_deadline, Deadline},
    CancelCode, CancelInfo, FlowId, IncomingVerificationEvent, VerificationChannel,
    VerificationContext, VerificationDone, VerificationMethod, VerificationPhase, VerifiedKeys,
};
use crate::{error::VerificationError, identities::DeviceData};

const HEADER: &[u8] = b"MATRIX";
const VERSION: u8 = 0x2;
const MIN_SECRET_LEN: usize = 8;
const SECRET_SIZE: usize = 16;

/// Error type describing errors that happen while QR data is being decoded.
#[derive(Error, Debug)]
pub enum DecodingError {
    /// The QR code data is missing the mandatory Matrix header.
    #[error("the decoded QR code is missing the Matrix header")]
    Header,
    /// One of the keys in the QR code isn't a valid Ed25519 key.
    #[error(transparent)]
    Keys(#[from] vodozemac::KeyError),
    /// The QR code data uses an invalid or unsupported mode.
    #[error("the QR code contains an invalid mode {0}")]
    Mode(u8),
    /// The flow id isn't valid UTF-8.
    #[error(transparent)]
    Utf8(#[from] FromUtf8Error),
    /// The QR code data is too short.
    #[error(transparent)]
    Read(#[from] std::io::Error),
    /// The shared secret of the QR code is too short.
    #[error("the QR code contains a too short shared secret, length: {0}")]
    SharedSecret(usize),
    /// The QR code uses an unsupported version.
    #[error("the QR code contains an invalid version of {0}, expected 2")]
    Version(u8),
}

/// Error type describing errors that happen while QR data is being encoded.
#[derive(Error, Debug)]
pub enum EncodingError {
    /// The data doesn't fit into a QR code.
    #[error(transparent)]
    Qr(#[from] qrcode::types::QrError),
    /// One of the keys or the secret isn't valid base64.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),
    /// The flow id is too long to be encoded.
    #[error("the flow id is too long to be encoded: {0}")]
    FlowId(#[from] TryFromIntError),
}

/// The mode of a QR code, it determines what the two keys in the code are.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QrMode {
    /// Verifying another user. The first key is the master key of the
    /// displaying user, the second one what the displaying device believes
    /// is the master key of the scanning user.
    Verification,
    /// Self-verification where the displaying device trusts the master key.
    /// The first key is the master key, the second one what the displaying
    /// device believes is the key of the scanning device.
    SelfVerification,
    /// Self-verification where the displaying device doesn't trust the
    /// master key yet. The first key is the key of the displaying device, the
    /// second one what it believes is the master key.
    SelfVerificationNoMasterKey,
}

impl QrMode {
    /// The byte that represents the mode in the QR code.
    pub fn as_byte(&self) -> u8 {
        match self {
            QrMode::Verification => 0x00,
            QrMode::SelfVerification => 0x01,
            QrMode::SelfVerificationNoMasterKey => 0x02,
        }
    }

    fn from_byte(mode: u8) -> Result<Self, DecodingError> {
        match mode {
            0x00 => Ok(QrMode::Verification),
            0x01 => Ok(QrMode::SelfVerification),
            0x02 => Ok(QrMode::SelfVerificationNoMasterKey),
            m => Err(DecodingError::Mode(m)),
        }
    }
}

/// Build the binary payload of a QR code.
///
/// The keys and the secret are given as unpadded base64, they are put into
/// the buffer as the raw decoded bytes.
pub fn generate_buffer(
    mode: QrMode,
    flow_id: &str,
    first_key: &str,
    second_key: &str,
    shared_secret: &str,
) -> Result<Vec<u8>, EncodingError> {
    let first_key = base64_decode(first_key)?;
    let second_key = base64_decode(second_key)?;
    let shared_secret = base64_decode(shared_secret)?;

    Ok(encode(mode, flow_id, &first_key, &second_key, &shared_secret)?)
}

fn encode(
    mode: QrMode,
    flow_id: &str,
    first_key: &[u8],
    second_key: &[u8],
    shared_secret: &[u8],
) -> Result<Vec<u8>, TryFromIntError> {
    let flow_id_len: u16 = flow_id.len().try_into()?;

    Ok([
        HEADER,
        &[VERSION, mode.as_byte()],
        flow_id_len.to_be_bytes().as_ref(),
        flow_id.as_bytes(),
        first_key,
        second_key,
        shared_secret,
    ]
    .concat())
}

/// The decoded content of a verification QR code.
#[derive(Clone, PartialEq, Eq)]
pub struct QrVerificationData {
    mode: QrMode,
    flow_id: String,
    first_key: Ed25519PublicKey,
    second_key: Ed25519PublicKey,
    shared_secret: Vec<u8>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for QrVerificationData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QrVerificationData")
            .field("mode", &self.mode)
            .field("flow_id", &self.flow_id)
            .field("first_key", &self.first_key)
            .field("second_key", &self.second_key)
            .finish_non_exhaustive()
    }
}

impl QrVerificationData {
    /// Create new QR code data with a random shared secret.
    pub fn new(
        mode: QrMode,
        flow_id: String,
        first_key: Ed25519PublicKey,
        second_key: Ed25519PublicKey,
    ) -> Self {
        let mut shared_secret = vec![0u8; SECRET_SIZE];
        thread_rng().fill_bytes(&mut shared_secret);

        Self { mode, flow_id, first_key, second_key, shared_secret }
    }

    /// Parse the decoded payload of a QR code.
    ///
    /// The payload consists of:
    ///
    /// * the ASCII string MATRIX
    /// * one byte indicating the QR code version, must be 0x02
    /// * one byte indicating the mode
    /// * the flow id, prefixed by its length as a big-endian u16
    /// * the first key, as 32 bytes
    /// * the second key, as 32 bytes
    /// * the shared secret, the remainder of the payload
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self, DecodingError> {
        let mut decoded = Cursor::new(bytes);

        let mut header = [0u8; 6];
        let mut first_key = [0u8; 32];
        let mut second_key = [0u8; 32];

        decoded.read_exact(&mut header)?;
        let version = decoded.read_u8()?;
        let mode = decoded.read_u8()?;

        if header != HEADER {
            return Err(DecodingError::Header);
        } else if version != VERSION {
            return Err(DecodingError::Version(version));
        }

        let mode = QrMode::from_byte(mode)?;

        let flow_id_len = decoded.read_u16::<BigEndian>()?;
        let mut flow_id = vec![0; flow_id_len.into()];

        decoded.read_exact(&mut flow_id)?;
        decoded.read_exact(&mut first_key)?;
        decoded.read_exact(&mut second_key)?;

        let mut shared_secret = Vec::new();
        decoded.read_to_end(&mut shared_secret)?;

        if shared_secret.len() < MIN_SECRET_LEN {
            return Err(DecodingError::SharedSecret(shared_secret.len()));
        }

        Ok(Self {
            mode,
            flow_id: String::from_utf8(flow_id)?,
            first_key: Ed25519PublicKey::from_slice(&first_key)?,
            second_key: Ed25519PublicKey::from_slice(&second_key)?,
            shared_secret,
        })
    }

    /// Encode the data into the binary QR code payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        Ok(encode(
            self.mode,
            &self.flow_id,
            self.first_key.as_bytes(),
            self.second_key.as_bytes(),
            &self.shared_secret,
        )?)
    }

    /// Encode the data into a QR code that can be rendered.
    pub fn to_qr_code(&self) -> Result<QrCode, EncodingError> {
        Ok(QrCode::new(self.to_bytes()?)?)
    }

    /// The mode of the QR code.
    pub fn mode(&self) -> QrMode {
        self.mode
    }

    /// The flow id of the verification the code belongs to.
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// The first key of the code.
    pub fn first_key(&self) -> Ed25519PublicKey {
        self.first_key
    }

    /// The second key of the code.
    pub fn second_key(&self) -> Ed25519PublicKey {
        self.second_key
    }

    /// The shared secret, as unpadded base64.
    pub fn secret(&self) -> String {
        base64_encode(&self.shared_secret)
    }

    fn secret_matches(&self, secret: &str) -> bool {
        base64_decode(secret)
            .map(|decoded| bool::from(decoded.as_slice().ct_eq(&self.shared_secret)))
            .unwrap_or(false)
    }
}

/// The phase of a QR code verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QrPhase {
    /// We show a QR code and wait for the other side to scan it.
    Shown,
    /// We scanned the code of the other side and wait for them to confirm.
    Scanned,
    /// The other side scanned our code, the user needs to confirm that the
    /// other device shows a successful scan.
    Reciprocated,
    /// We confirmed the scan and wait for the other side to finish.
    Confirmed,
    /// The verification finished successfully.
    Done,
    /// The verification was cancelled.
    Cancelled(CancelInfo),
}

impl QrPhase {
    fn is_terminal(&self) -> bool {
        matches!(self, QrPhase::Done | QrPhase::Cancelled(_))
    }
}

#[derive(Debug)]
struct QrState {
    phase: QrPhase,
    verified: VerifiedKeys,
}

/// A verification flow using QR codes.
///
/// Either we show the code and the other side scans it, or we scanned the
/// code of the other side.
#[derive(Clone)]
pub struct QrVerification {
    inner: Arc<QrInner>,
}

struct QrInner {
    context: VerificationContext,
    channel: VerificationChannel,
    flow_id: FlowId,
    other_device: DeviceData,
    data: QrVerificationData,
    we_scanned: bool,
    state: StdMutex<QrState>,
    deadline: StdMutex<Deadline>,
    phase: watch::Sender<QrPhase>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for QrVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QrVerification")
            .field("flow_id", &self.inner.flow_id)
            .field("other_user", &self.other_user_id())
            .field("other_device", &self.other_device_id())
            .field("we_scanned", &self.inner.we_scanned)
            .field("phase", &self.phase())
            .finish()
    }
}

fn same_key(expected: Option<String>, key: Ed25519PublicKey) -> bool {
    expected.is_some_and(|expected| expected == key.to_base64())
}

impl QrVerification {
    fn new(
        context: VerificationContext,
        channel: VerificationChannel,
        flow_id: FlowId,
        other_device: DeviceData,
        data: QrVerificationData,
        we_scanned: bool,
        phase: QrPhase,
        verified: VerifiedKeys,
    ) -> Self {
        let deadline = Deadline::new(context.config.verification_event_timeout);
        let (sender, _) = watch::channel(phase.clone());

        Self {
            inner: Arc::new(QrInner {
                context,
                channel,
                flow_id,
                other_device,
                data,
                we_scanned,
                state: StdMutex::new(QrState { phase, verified }),
                deadline: StdMutex::new(deadline),
                phase: sender,
            }),
        }
    }

    /// Create the QR code we show to the other device.
    ///
    /// Returns `None` if we lack the keys to put into the code.
    pub(crate) fn show(
        context: VerificationContext,
        channel: VerificationChannel,
        flow_id: FlowId,
        other_device: DeviceData,
    ) -> Option<Self> {
        let own_user_id = context.own_user_id().to_owned();
        let other_user_id = other_device.user_id().to_owned();
        let key = |k: String| Ed25519PublicKey::from_base64(&k).ok();

        let (mode, first_key, second_key, verified) = if other_user_id != own_user_id {
            let own_master = key(context.trusted_own_master_key()?)?;
            let their_master = key(context.master_key_of(&other_user_id)?)?;
            let identity = context.devices.cross_signing_info(&other_user_id);

            (QrMode::Verification, own_master, their_master, VerifiedKeys { device: None, identity })
        } else if let Some(master) = context.trusted_own_master_key() {
            let device_key = other_device.ed25519_key()?;
            let verified = VerifiedKeys { device: Some(other_device.clone()), identity: None };

            (QrMode::SelfVerification, key(master)?, device_key, verified)
        } else {
            let master = key(context.master_key_of(&own_user_id)?)?;
            let identity = context.devices.cross_signing_info(&own_user_id);

            (
                QrMode::SelfVerificationNoMasterKey,
                context.olm.ed25519_key(),
                master,
                VerifiedKeys { device: None, identity },
            )
        };

        let data = QrVerificationData::new(mode, flow_id.as_str().to_owned(), first_key, second_key);

        Some(Self::new(context, channel, flow_id, other_device, data, false, QrPhase::Shown, verified))
    }

    /// Check a code we scanned and tell the other side about the scan.
    ///
    /// A code that doesn't contain the keys we expect cancels the flow.
    pub(crate) async fn scan(
        context: VerificationContext,
        channel: VerificationChannel,
        flow_id: FlowId,
        other_device: DeviceData,
        data: QrVerificationData,
    ) -> Result<Self, VerificationError> {
        let own_user_id = context.own_user_id().to_owned();
        let other_user_id = other_device.user_id().to_owned();
        let is_self_verification = own_user_id == other_user_id;

        let check = |verified: VerifiedKeys, matches: bool| matches.then_some(verified);

        let verified = if data.flow_id() != flow_id.as_str() {
            warn!(expected = flow_id.as_str(), found = data.flow_id(), "Scanned a QR code of another flow");
            Err(CancelCode::UnknownTransaction)
        } else {
            match data.mode() {
                QrMode::Verification if !is_self_verification => check(
                    VerifiedKeys {
                        device: None,
                        identity: context.devices.cross_signing_info(&other_user_id),
                    },
                    same_key(context.master_key_of(&other_user_id), data.first_key())
                        && same_key(context.master_key_of(&own_user_id), data.second_key()),
                )
                .ok_or(CancelCode::KeyMismatch),
                QrMode::SelfVerification if is_self_verification => check(
                    VerifiedKeys {
                        device: Some(other_device.clone()),
                        identity: context.devices.cross_signing_info(&own_user_id),
                    },
                    same_key(context.master_key_of(&own_user_id), data.first_key())
                        && context.olm.ed25519_key() == data.second_key(),
                )
                .ok_or(CancelCode::KeyMismatch),
                QrMode::SelfVerificationNoMasterKey if is_self_verification => check(
                    VerifiedKeys { device: Some(other_device.clone()), identity: None },
                    other_device.ed25519_key() == Some(data.first_key())
                        && same_key(context.trusted_own_master_key(), data.second_key()),
                )
                .ok_or(CancelCode::KeyMismatch),
                _ => Err(CancelCode::UserMismatch),
            }
        };

        match verified {
            Ok(verified) => {
                let content = json!({
                    "from_device": context.own_device_id(),
                    "method": VerificationMethod::ReciprocateV1,
                    "secret": data.secret(),
                });

                channel.send(&*context.transport, START_TYPE, content).await?;

                Ok(Self::new(context, channel, flow_id, other_device, data, true, QrPhase::Scanned, verified))
            }
            Err(code) => {
                let info = CancelInfo::ours(code);
                channel.send(&*context.transport, CANCEL_TYPE, info.to_content()).await?;

                Ok(Self::new(
                    context,
                    channel,
                    flow_id,
                    other_device,
                    data,
                    true,
                    QrPhase::Cancelled(info),
                    VerifiedKeys::default(),
                ))
            }
        }
    }

    /// The data of the QR code.
    pub fn data(&self) -> &QrVerificationData {
        &self.inner.data
    }

    /// Render our QR code.
    pub fn to_qr_code(&self) -> Result<QrCode, EncodingError> {
        self.inner.data.to_qr_code()
    }

    /// The binary payload of our QR code.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        self.inner.data.to_bytes()
    }

    /// The flow id of the verification.
    pub fn flow_id(&self) -> &FlowId {
        &self.inner.flow_id
    }

    /// The user we verify.
    pub fn other_user_id(&self) -> &UserId {
        self.inner.other_device.user_id()
    }

    /// The device we verify with.
    pub fn other_device_id(&self) -> &DeviceId {
        self.inner.other_device.device_id()
    }

    /// Did we scan the code of the other side.
    pub fn we_started(&self) -> bool {
        self.inner.we_scanned
    }

    /// The current phase.
    pub fn phase(&self) -> QrPhase {
        self.inner.state.lock().unwrap().phase.clone()
    }

    /// Get notified about phase changes.
    pub fn subscribe(&self) -> watch::Receiver<QrPhase> {
        self.inner.phase.subscribe()
    }

    /// Has the verification finished successfully.
    pub fn is_done(&self) -> bool {
        self.phase() == QrPhase::Done
    }

    /// Has the other side scanned our code, i.e. should the user be asked if
    /// the other device shows a successful scan.
    pub fn has_been_scanned(&self) -> bool {
        self.phase() == QrPhase::Reciprocated
    }

    /// The cancellation info, if the flow was cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        match self.phase() {
            QrPhase::Cancelled(info) => Some(info),
            _ => None,
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        let state = self.inner.state.lock().unwrap();
        (!state.phase.is_terminal()).then(|| self.inner.deadline.lock().unwrap().instant())
    }

    fn set_phase(&self, state: &mut QrState, phase: QrPhase) {
        state.phase = phase.clone();
        self.inner.phase.send_replace(phase);
    }

    /// Confirm that the other device successfully scanned our code.
    pub async fn confirm(&self) -> Result<(), VerificationError> {
        {
            let mut state = self.inner.state.lock().unwrap();

            match &state.phase {
                QrPhase::Reciprocated => self.set_phase(&mut state, QrPhase::Confirmed),
                QrPhase::Confirmed => return Ok(()),
                QrPhase::Cancelled(info) => return Err(VerificationError::Cancelled(info.clone())),
                QrPhase::Shown => {
                    return Err(VerificationError::InvalidPhase {
                        action: "confirm",
                        phase: VerificationPhase::Ready,
                    })
                }
                QrPhase::Scanned | QrPhase::Done => {
                    return Err(VerificationError::InvalidPhase {
                        action: "confirm",
                        phase: VerificationPhase::Started,
                    })
                }
            }
        }

        info!(flow_id = self.inner.flow_id.as_str(), "Confirmed the QR code scan");
        self.inner.deadline.lock().unwrap().reset();
        self.inner.channel.send(&*self.inner.context.transport, DONE_TYPE, json!({})).await?;

        Ok(())
    }

    /// Cancel the verification.
    pub async fn cancel(&self) -> Result<(), VerificationError> {
        self.cancel_with_code(CancelCode::User).await
    }

    pub(crate) async fn cancel_with_code(&self, code: CancelCode) -> Result<(), VerificationError> {
        let info = {
            let mut state = self.inner.state.lock().unwrap();

            if state.phase.is_terminal() {
                return Ok(());
            }

            let info = CancelInfo::ours(code);
            self.set_phase(&mut state, QrPhase::Cancelled(info.clone()));
            info
        };

        self.inner.channel.send(&*self.inner.context.transport, CANCEL_TYPE, info.to_content()).await?;

        Ok(())
    }

    pub(crate) fn receive_cancel(&self, info: CancelInfo) {
        let mut state = self.inner.state.lock().unwrap();

        if !state.phase.is_terminal() {
            self.set_phase(&mut state, QrPhase::Cancelled(info));
        }
    }

    /// The other side scanned our code and sent us the secret.
    pub(crate) async fn receive_reciprocate(
        &self,
        start: &StartContent,
    ) -> Result<(), VerificationError> {
        let matches = start.secret.as_deref().is_some_and(|s| self.inner.data.secret_matches(s));

        if !matches {
            warn!(flow_id = self.inner.flow_id.as_str(), "The QR code secret doesn't match");
            return self.cancel_with_code(CancelCode::KeyMismatch).await;
        }

        let mut state = self.inner.state.lock().unwrap();

        if state.phase == QrPhase::Shown {
            self.inner.deadline.lock().unwrap().reset();
            self.set_phase(&mut state, QrPhase::Reciprocated);
        }

        Ok(())
    }

    pub(crate) async fn receive_event(
        &self,
        event: &IncomingVerificationEvent,
    ) -> Result<Option<VerificationDone>, VerificationError> {
        if event.sender != self.other_user_id() {
            return Ok(None);
        }

        let VerificationContent::Done(_) = event.content else {
            return Ok(None);
        };

        let outcome = {
            let mut state = self.inner.state.lock().unwrap();

            match state.phase {
                QrPhase::Scanned | QrPhase::Confirmed => {
                    let send_done = state.phase == QrPhase::Scanned;
                    self.set_phase(&mut state, QrPhase::Done);
                    Some((send_done, state.verified.clone()))
                }
                QrPhase::Done | QrPhase::Cancelled(_) => return Ok(None),
                QrPhase::Shown | QrPhase::Reciprocated => None,
            }
        };

        let Some((send_done, verified)) = outcome else {
            self.cancel_with_code(CancelCode::UnexpectedMessage).await?;
            return Ok(None);
        };

        if send_done {
            self.inner.channel.send(&*self.inner.context.transport, DONE_TYPE, json!({})).await?;
        }

        self.inner.context.mark_as_verified(&verified).await?;

        Ok(Some(VerificationDone {
            user_id: self.other_user_id().to_owned(),
            device_id: self.other_device_id().to_owned(),
            flow_id: self.inner.flow_id.clone(),
            verified_master_key: verified.identity.is_some(),
            self_verification: self.other_user_id() == self.inner.context.own_user_id(),
        }))
    }

    /// Wait until the verification finishes.
    pub async fn verify(&self) -> Result<(), VerificationError> {
        let mut changes = self.subscribe();

        tokio::select! {
            _ = changes.wait_for(QrPhase::is_terminal) => {}
            _ = wait_for_deadline(|| self.deadline()) => {
                self.cancel_with_code(CancelCode::Timeout).await?;
            }
        }

        match self.phase() {
            QrPhase::Done => Ok(()),
            QrPhase::Cancelled(info) => Err(VerificationError::Cancelled(info)),
            _ => Err(VerificationError::Cancelled(CancelInfo::ours(CancelCode::Timeout))),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use proptest::prelude::*;
    use ruma::{device_id, user_id};
    use vodozemac::{base64_encode, Ed25519SecretKey};

    use super::{generate_buffer, DecodingError, QrMode, QrPhase, QrVerification, QrVerificationData};
    use crate::verification::{
        tests::{introduce, TestSide},
        CancelCode, FlowId, VerificationChannel,
    };

    #[test]
    fn decode_invalid_header() {
        let data = b"NonMatrixCode";
        let result = QrVerificationData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::Header));
    }

    #[test]
    fn decode_invalid_mode() {
        let data = b"MATRIX\x02\x03";
        let result = QrVerificationData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::Mode(3)));
    }

    #[test]
    fn decode_invalid_version() {
        let data = b"MATRIX\x01\x03";
        let result = QrVerificationData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::Version(1)));
    }

    #[test]
    fn decode_missing_data() {
        let data = b"MATRIX\x02\x02";
        let result = QrVerificationData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::Read(_)));
    }

    #[test]
    fn decode_short_secret() {
        let data = b"MATRIX\
                   \x02\x02\x00\x07\
                   FLOW_ID\
                   AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\
                   BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB\
                   SECRET";

        let result = QrVerificationData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::SharedSecret(6)));
    }

    #[test]
    fn buffer_layout() {
        let first = Ed25519SecretKey::new().public_key();
        let second = Ed25519SecretKey::new().public_key();
        let secret = [7u8; 16];

        let buffer = generate_buffer(
            QrMode::Verification,
            "$flow",
            &first.to_base64(),
            &second.to_base64(),
            &base64_encode(secret),
        )
        .unwrap();

        assert_eq!(&buffer[..6], b"MATRIX");
        assert_eq!(buffer[6], 0x02);
        assert_eq!(buffer[7], 0x00);
        assert_eq!(&buffer[8..10], &[0x00, 0x05]);
        assert_eq!(&buffer[10..15], b"$flow");
        assert_eq!(&buffer[15..47], first.as_bytes());
        assert_eq!(&buffer[47..79], second.as_bytes());
        assert_eq!(&buffer[79..], &secret);

        let data = QrVerificationData::from_bytes(&buffer).unwrap();
        assert_eq!(data.mode(), QrMode::Verification);
        assert_eq!(data.flow_id(), "$flow");
        assert_eq!(data.first_key(), first);
        assert_eq!(data.second_key(), second);
        assert_eq!(data.secret(), base64_encode(secret));
        assert_eq!(data.to_bytes().unwrap(), buffer);

        data.to_qr_code().unwrap();
    }

    #[test]
    fn secrets_are_compared() {
        let key = Ed25519SecretKey::new().public_key();
        let data =
            QrVerificationData::new(QrMode::SelfVerification, "txn".to_owned(), key, key);

        assert!(data.secret_matches(&data.secret()));
        assert!(!data.secret_matches(&base64_encode([0u8; 16])));
        assert!(!data.secret_matches("not base64!"));
    }

    proptest! {
        #[test]
        fn buffer_is_length_prefixed(flow_id in "[a-zA-Z0-9$:.]{0,64}", secret in prop::collection::vec(any::<u8>(), 8..64)) {
            let key = Ed25519SecretKey::new().public_key();

            let buffer = generate_buffer(
                QrMode::SelfVerificationNoMasterKey,
                &flow_id,
                &key.to_base64(),
                &key.to_base64(),
                &base64_encode(&secret),
            ).unwrap();

            let len = u16::from_be_bytes([buffer[8], buffer[9]]) as usize;

            prop_assert_eq!(buffer[7], 0x02);
            prop_assert_eq!(len, flow_id.len());
            prop_assert_eq!(buffer.len(), 10 + len + 64 + secret.len());
            prop_assert_eq!(&buffer[10 + len + 64..], secret.as_slice());
        }
    }

    #[tokio::test]
    async fn scanning_a_code_with_unexpected_keys_cancels() {
        let alice = TestSide::new(user_id!("@alice:localhost"), device_id!("ALICE1")).await;
        let bob = TestSide::new(user_id!("@bob:localhost"), device_id!("BOB1")).await;
        introduce(&alice, &bob).await;

        alice.bootstrap_cross_signing().await;
        let bob_identity = bob.bootstrap_cross_signing().await;
        alice.devices.store_cross_signing_info(bob_identity);

        let flow_id = FlowId::ToDevice("txn".into());
        let bob_device = alice.devices.get_device(bob.olm.user_id(), bob.olm.device_id()).unwrap();
        let channel = VerificationChannel::from_flow_id(
            &flow_id,
            bob.olm.user_id().to_owned(),
            bob.olm.device_id().to_owned(),
        );

        // Alice doesn't know the master key Bob's code claims to be his own.
        let data = QrVerificationData::new(
            QrMode::Verification,
            "txn".to_owned(),
            Ed25519SecretKey::new().public_key(),
            Ed25519SecretKey::new().public_key(),
        );

        let verification =
            QrVerification::scan(alice.context.clone(), channel, flow_id, bob_device, data)
                .await
                .unwrap();

        assert_matches!(verification.phase(), QrPhase::Cancelled(info));
        assert_eq!(info.cancel_code(), &CancelCode::KeyMismatch);

        let sent = alice.transport.sent_to_device();
        assert_eq!(sent[0].event_type, "m.key.verification.cancel");
    }

    #[tokio::test]
    async fn codes_need_keys() {
        let alice = TestSide::new(user_id!("@alice:localhost"), device_id!("ALICE1")).await;
        let bob = TestSide::new(user_id!("@bob:localhost"), device_id!("BOB1")).await;
        introduce(&alice, &bob).await;

        let flow_id = FlowId::ToDevice("txn".into());
        let bob_device = alice.devices.get_device(bob.olm.user_id(), bob.olm.device_id()).unwrap();
        let channel = VerificationChannel::from_flow_id(
            &flow_id,
            bob.olm.user_id().to_owned(),
            bob.olm.device_id().to_owned(),
        );

        assert!(QrVerification::show(alice.context.clone(), channel.clone(), flow_id.clone(), bob_device.clone())
            .is_none());

        alice.bootstrap_cross_signing().await;
        alice.devices.store_cross_signing_info(bob.bootstrap_cross_signing().await);

        let shown = QrVerification::show(alice.context.clone(), channel, flow_id, bob_device).unwrap();
        assert_eq!(shown.data().mode(), QrMode::Verification);
        assert_eq!(shown.phase(), QrPhase::Shown);
    }
}
