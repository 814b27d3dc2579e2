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

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use ruma::{OwnedDeviceId, OwnedUserId, TransactionId, UserId};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::{
    callbacks::{CryptoCallbacks, SecretRequestInfo},
    error::{OlmResult, SecretRequestError},
    identities::DeviceListManager,
    requests::{CryptoTransport, ToDeviceMessages},
    session_manager::SessionManager,
    types::events::{RequestAction, SecretRequestContent, SecretSendContent},
};

type SecretResult = Result<String, SecretRequestError>;

struct PendingRequest {
    name: String,
    /// The devices we asked, `None` if we asked all of them.
    devices: Option<Vec<OwnedDeviceId>>,
    sender: oneshot::Sender<SecretResult>,
}

struct SecretSharingInner {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    devices: DeviceListManager,
    sessions: SessionManager,
    transport: Arc<dyn CryptoTransport>,
    callbacks: Arc<dyn CryptoCallbacks>,
    requests: StdMutex<BTreeMap<String, PendingRequest>>,
}

/// Shares secrets between the devices of our own user.
///
/// Requests go out as plain `m.secret.request` to-device events, answers
/// arrive as Olm encrypted `m.secret.send` events and are only accepted from
/// verified devices we asked.
#[derive(Clone)]
pub struct SecretSharing {
    inner: Arc<SecretSharingInner>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SecretSharing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretSharing")
            .field("user_id", &self.inner.user_id)
            .field("device_id", &self.inner.device_id)
            .finish_non_exhaustive()
    }
}

/// A secret request we sent out.
///
/// The request stays active until an answer arrives, it is cancelled or
/// [`OutgoingSecretRequest::wait_with_timeout()`] gives up.
pub struct OutgoingSecretRequest {
    request_id: String,
    name: String,
    receiver: oneshot::Receiver<SecretResult>,
    sharing: SecretSharing,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for OutgoingSecretRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingSecretRequest")
            .field("request_id", &self.request_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl OutgoingSecretRequest {
    /// The id of the request.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The name of the requested secret.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel the request.
    ///
    /// Anybody waiting for the secret gets [`SecretRequestError::Cancelled`].
    pub async fn cancel(&self) {
        self.sharing.cancel_request(&self.request_id).await;
    }

    /// Wait until the secret arrives or the request is cancelled.
    pub async fn wait(self) -> SecretResult {
        self.receiver.await.unwrap_or(Err(SecretRequestError::Cancelled))
    }

    /// Wait for the secret, cancelling the request if it doesn't arrive in
    /// time.
    pub async fn wait_with_timeout(self, timeout: Duration) -> SecretResult {
        let Self { request_id, receiver, sharing, .. } = self;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(result) => result.unwrap_or(Err(SecretRequestError::Cancelled)),
            Err(_) => {
                sharing.cancel_request(&request_id).await;
                Err(SecretRequestError::TimedOut)
            }
        }
    }
}

impl SecretSharing {
    pub(crate) fn new(
        devices: DeviceListManager,
        sessions: SessionManager,
        transport: Arc<dyn CryptoTransport>,
        callbacks: Arc<dyn CryptoCallbacks>,
    ) -> Self {
        Self {
            inner: Arc::new(SecretSharingInner {
                user_id: devices.user_id().to_owned(),
                device_id: devices.device_id().to_owned(),
                devices,
                sessions,
                transport,
                callbacks,
                requests: Default::default(),
            }),
        }
    }

    fn messages_for(
        &self,
        devices: Option<&[OwnedDeviceId]>,
        content: &SecretRequestContent,
    ) -> Result<ToDeviceMessages, serde_json::Error> {
        let content = serde_json::to_value(content)?;

        let per_device = match devices {
            Some(devices) => devices.iter().map(|d| (d.to_string(), content.clone())).collect(),
            None => BTreeMap::from([("*".to_owned(), content)]),
        };

        Ok(BTreeMap::from([(self.inner.user_id.clone(), per_device)]))
    }

    /// Ask our other devices for a secret.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the secret, for example `m.megolm_backup.v1`.
    ///
    /// * `devices` - The devices to ask, all of our devices if `None`.
    #[instrument(skip(self))]
    pub async fn request(
        &self,
        name: &str,
        devices: Option<&[OwnedDeviceId]>,
    ) -> Result<OutgoingSecretRequest, SecretRequestError> {
        let request_id = TransactionId::new().to_string();

        let content = SecretRequestContent {
            name: Some(name.to_owned()),
            action: RequestAction::Request,
            requesting_device_id: self.inner.device_id.clone(),
            request_id: request_id.clone(),
        };

        let messages = self
            .messages_for(devices, &content)
            .map_err(|e| SecretRequestError::Transport(e.to_string()))?;

        let (sender, receiver) = oneshot::channel();

        self.inner.requests.lock().unwrap().insert(
            request_id.clone(),
            PendingRequest {
                name: name.to_owned(),
                devices: devices.map(<[_]>::to_vec),
                sender,
            },
        );

        if let Err(e) =
            self.inner.transport.send_to_device("m.secret.request", &TransactionId::new(), messages).await
        {
            self.inner.requests.lock().unwrap().remove(&request_id);
            return Err(SecretRequestError::Transport(e.to_string()));
        }

        info!(request_id, "Sent out a secret request");

        Ok(OutgoingSecretRequest {
            request_id,
            name: name.to_owned(),
            receiver,
            sharing: self.clone(),
        })
    }

    /// The ids of the requests that are still waiting for an answer.
    pub fn pending_requests(&self) -> Vec<String> {
        self.inner.requests.lock().unwrap().keys().cloned().collect()
    }

    async fn send_cancellation(
        &self,
        request_id: &str,
        devices: Option<&[OwnedDeviceId]>,
    ) {
        let content = SecretRequestContent {
            name: None,
            action: RequestAction::RequestCancellation,
            requesting_device_id: self.inner.device_id.clone(),
            request_id: request_id.to_owned(),
        };

        let result = match self.messages_for(devices, &content) {
            Ok(messages) => self
                .inner
                .transport
                .send_to_device("m.secret.request", &TransactionId::new(), messages)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        if let Err(error) = result {
            warn!(request_id, error, "Couldn't send out a secret request cancellation");
        }
    }

    /// Cancel an outgoing request and tell the devices we asked.
    pub async fn cancel_request(&self, request_id: &str) {
        let request = self.inner.requests.lock().unwrap().remove(request_id);

        if let Some(request) = request {
            debug!(request_id, name = request.name, "Cancelling a secret request");

            self.send_cancellation(request_id, request.devices.as_deref()).await;
            let _ = request.sender.send(Err(SecretRequestError::Cancelled));
        }
    }

    /// Handle an incoming `m.secret.request` event.
    ///
    /// The application decides through the `on_secret_request` callback
    /// whether the secret is shared. Returns `true` if the secret was sent.
    #[instrument(skip_all, fields(sender = ?sender, request_id = content.request_id))]
    pub async fn on_request_received(
        &self,
        sender: &UserId,
        content: SecretRequestContent,
    ) -> OlmResult<bool> {
        if sender != &*self.inner.user_id {
            warn!("Ignoring a secret request from another user");
            return Ok(false);
        }

        if content.requesting_device_id == self.inner.device_id {
            return Ok(false);
        }

        let name = match (content.action, content.name) {
            (RequestAction::RequestCancellation, _) => {
                debug!("A secret request was cancelled");
                return Ok(false);
            }
            (RequestAction::Request, None) => {
                warn!("Ignoring a secret request without a name");
                return Ok(false);
            }
            (RequestAction::Request, Some(name)) => name,
        };

        let Some(device) = self.inner.devices.get_device(sender, &content.requesting_device_id)
        else {
            warn!(device_id = ?content.requesting_device_id, "Secret request from an unknown device");
            return Ok(false);
        };

        if device.is_blocked() {
            warn!(device_id = ?device.device_id(), "Ignoring a secret request from a blocked device");
            return Ok(false);
        }

        let Some(device_trust) = self.inner.devices.get_device_trust(sender, device.device_id())
        else {
            return Ok(false);
        };

        let info = SecretRequestInfo {
            user_id: sender.to_owned(),
            device_id: device.device_id().to_owned(),
            request_id: content.request_id.clone(),
            name: name.clone(),
            device_trust,
        };

        let Some(secret) = self.inner.callbacks.on_secret_request(info).await else {
            debug!(name, "The application didn't share the secret");
            return Ok(false);
        };

        let content =
            serde_json::to_value(SecretSendContent { request_id: content.request_id, secret })?;

        let sent = self.inner.sessions.send_encrypted_to_devices("m.secret.send", &content, &[device]).await?;

        if sent == 0 {
            warn!(name, "Couldn't establish an Olm session to share the secret");
        } else {
            info!(name, "Shared a secret with one of our devices");
        }

        Ok(sent > 0)
    }

    /// Handle a decrypted `m.secret.send` event.
    ///
    /// `sender_key` is the Curve25519 key of the Olm session the event was
    /// decrypted with. Returns `true` if the secret answered one of our
    /// requests.
    #[instrument(skip_all, fields(sender = ?sender, request_id = content.request_id))]
    pub async fn on_secret_received(
        &self,
        sender: &UserId,
        sender_key: &str,
        content: SecretSendContent,
    ) -> bool {
        if sender != &*self.inner.user_id {
            warn!("Ignoring a secret sent by another user");
            return false;
        }

        let Some(device) = self
            .inner
            .devices
            .device_by_curve25519_key(sender_key)
            .filter(|d| d.user_id() == &*self.inner.user_id)
        else {
            warn!(sender_key, "Ignoring a secret sent by an unknown device");
            return false;
        };

        let is_verified = self
            .inner
            .devices
            .get_device_trust(sender, device.device_id())
            .is_some_and(|t| t.is_verified());

        if !is_verified {
            warn!(device_id = ?device.device_id(), "Ignoring a secret sent by an unverified device");
            return false;
        }

        let request = {
            let mut requests = self.inner.requests.lock().unwrap();

            let asked = requests.get(&content.request_id).map(|r| {
                r.devices.as_ref().map_or(true, |devices| {
                    devices.iter().any(|d| d.as_str() == device.device_id().as_str())
                })
            });

            match asked {
                Some(true) => requests.remove(&content.request_id),
                Some(false) => {
                    warn!(device_id = ?device.device_id(), "Ignoring a secret from a device we didn't ask");
                    None
                }
                None => {
                    debug!("Received a secret for an unknown request");
                    None
                }
            }
        };

        let Some(request) = request else {
            return false;
        };

        info!(name = request.name, device_id = ?device.device_id(), "Received a requested secret");

        // Tell the other devices they can stop answering.
        let others: Option<Vec<_>> = request
            .devices
            .as_ref()
            .map(|devices| {
                devices.iter().filter(|d| d.as_str() != device.device_id().as_str()).cloned().collect()
            });

        if others.as_ref().map_or(true, |o| !o.is_empty()) {
            self.send_cancellation(&content.request_id, others.as_deref()).await;
        }

        let _ = request.sender.send(Ok(content.secret));

        true
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc, time::Duration};

    use assert_matches2::assert_matches;
    use ruma::{device_id, user_id, OwnedDeviceId};
    use serde_json::json;

    use super::SecretSharing;
    use crate::{
        config::E2eeConfig,
        error::SecretRequestError,
        identities::{DeviceData, DeviceListManager, LocalTrust},
        olm::{tests::olm_device, OlmDevice},
        requests::KeysClaimResponse,
        session_manager::SessionManager,
        store::{MemoryStore, Store},
        testing::{MockTransport, TestCallbacks},
        types::events::{
            EncryptedContent, OlmPayload, RequestAction, SecretRequestContent, SecretSendContent,
        },
    };

    struct Setup {
        sharing: SecretSharing,
        transport: Arc<MockTransport>,
        callbacks: Arc<TestCallbacks>,
        devices: DeviceListManager,
        other: OlmDevice,
    }

    async fn setup() -> Setup {
        let own = olm_device(user_id!("@alice:localhost"), device_id!("FIRST")).await;
        let other = olm_device(user_id!("@alice:localhost"), device_id!("SECOND")).await;

        let transport = Arc::new(MockTransport::new());
        let callbacks = Arc::new(TestCallbacks::default());

        let devices = DeviceListManager::load(
            own.user_id().to_owned(),
            own.device_id().to_owned(),
            Store::new(Arc::new(MemoryStore::new())),
            transport.clone(),
            E2eeConfig::default(),
        )
        .await
        .unwrap();
        devices.store_device(DeviceData::new(other.device_keys().await.unwrap(), LocalTrust::Unverified));

        let sessions = SessionManager::new(own, transport.clone(), E2eeConfig::default());
        let sharing = SecretSharing::new(devices.clone(), sessions, transport.clone(), callbacks.clone());

        Setup { sharing, transport, callbacks, devices, other }
    }

    fn verify(devices: &DeviceListManager, other: &OlmDevice) {
        devices.set_device_local_trust(other.user_id(), other.device_id(), LocalTrust::Verified);
    }

    #[tokio::test]
    async fn requested_secrets_arrive() {
        let Setup { sharing, transport, devices, other, .. } = setup().await;
        verify(&devices, &other);

        let request = sharing.request("m.megolm_backup.v1", None).await.unwrap();

        let sent = transport.take_to_device();
        assert_eq!(sent[0].event_type, "m.secret.request");
        let content = sent[0].content_for(other.user_id(), "*").unwrap();
        assert_eq!(content["name"], "m.megolm_backup.v1");
        assert_eq!(content["action"], "request");
        assert_eq!(content["request_id"], request.request_id());

        let accepted = sharing
            .on_secret_received(
                other.user_id(),
                &other.curve25519_key().to_base64(),
                SecretSendContent {
                    request_id: request.request_id().to_owned(),
                    secret: "backup key".to_owned(),
                },
            )
            .await;

        assert!(accepted);
        assert_eq!(request.wait().await.unwrap(), "backup key");
        assert!(sharing.pending_requests().is_empty());

        // The other devices are told to stop answering.
        let sent = transport.take_to_device();
        let content = sent[0].content_for(other.user_id(), "*").unwrap();
        assert_eq!(content["action"], "request_cancellation");
    }

    #[tokio::test]
    async fn secrets_from_unverified_devices_are_ignored() {
        let Setup { sharing, other, .. } = setup().await;

        let request = sharing.request("m.megolm_backup.v1", None).await.unwrap();

        let accepted = sharing
            .on_secret_received(
                other.user_id(),
                &other.curve25519_key().to_base64(),
                SecretSendContent {
                    request_id: request.request_id().to_owned(),
                    secret: "backup key".to_owned(),
                },
            )
            .await;

        assert!(!accepted);
        assert_eq!(sharing.pending_requests(), vec![request.request_id().to_owned()]);
    }

    #[tokio::test]
    async fn secrets_from_devices_we_did_not_ask_are_ignored() {
        let Setup { sharing, devices, other, .. } = setup().await;
        verify(&devices, &other);

        let asked: Vec<OwnedDeviceId> = vec![device_id!("THIRD").to_owned()];
        let request = sharing.request("m.megolm_backup.v1", Some(&asked)).await.unwrap();

        let accepted = sharing
            .on_secret_received(
                other.user_id(),
                &other.curve25519_key().to_base64(),
                SecretSendContent {
                    request_id: request.request_id().to_owned(),
                    secret: "backup key".to_owned(),
                },
            )
            .await;

        assert!(!accepted);
    }

    #[tokio::test]
    async fn cancelled_requests() {
        let Setup { sharing, transport, other, .. } = setup().await;

        let request = sharing.request("m.cross_signing.master", None).await.unwrap();
        transport.take_to_device();

        request.cancel().await;
        assert_matches!(request.wait().await, Err(SecretRequestError::Cancelled));

        let sent = transport.take_to_device();
        let content = sent[0].content_for(other.user_id(), "*").unwrap();
        assert_eq!(content["action"], "request_cancellation");
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_requests_time_out() {
        let Setup { sharing, transport, .. } = setup().await;

        let request = sharing.request("m.cross_signing.master", None).await.unwrap();

        assert_matches!(
            request.wait_with_timeout(Duration::from_secs(30)).await,
            Err(SecretRequestError::TimedOut)
        );
        assert!(sharing.pending_requests().is_empty());
        assert_eq!(transport.sent_to_device().len(), 2);
    }

    #[tokio::test]
    async fn incoming_requests_are_answered_over_olm() {
        let Setup { sharing, transport, callbacks, other, .. } = setup().await;
        callbacks.share_secret("m.megolm_backup.v1", "backup key");

        other.generate_one_time_keys(1).await.unwrap();
        let upload = other.keys_for_upload().await.unwrap();
        transport.set_keys_claim_response(KeysClaimResponse {
            one_time_keys: BTreeMap::from([(
                other.user_id().to_owned(),
                BTreeMap::from([(other.device_id().to_owned(), upload.one_time_keys)]),
            )]),
            failures: BTreeMap::new(),
        });

        let content = SecretRequestContent {
            name: Some("m.megolm_backup.v1".to_owned()),
            action: RequestAction::Request,
            requesting_device_id: other.device_id().to_owned(),
            request_id: "request".to_owned(),
        };

        assert!(sharing.on_request_received(other.user_id(), content).await.unwrap());
        assert_eq!(callbacks.secret_requests.lock().unwrap()[0].name, "m.megolm_backup.v1");

        let sent = transport.take_to_device();
        assert_eq!(sent[0].event_type, "m.room.encrypted");
        let content = sent[0].content_for(other.user_id(), other.device_id().as_str()).unwrap();

        assert_matches!(EncryptedContent::from_json(content).unwrap(), EncryptedContent::OlmV1(content));
        let ciphertext = &content.ciphertext[&other.curve25519_key().to_base64()];
        let decrypted = other.decrypt_olm_event(&content.sender_key, ciphertext).await.unwrap();
        let payload: OlmPayload = serde_json::from_str(&decrypted.plaintext).unwrap();

        assert_eq!(payload.event_type, "m.secret.send");
        similar_asserts::assert_eq!(
            payload.content,
            json!({ "request_id": "request", "secret": "backup key" })
        );
    }

    #[tokio::test]
    async fn requests_the_application_declines_are_not_answered() {
        let Setup { sharing, transport, other, .. } = setup().await;

        let content = SecretRequestContent {
            name: Some("m.cross_signing.master".to_owned()),
            action: RequestAction::Request,
            requesting_device_id: other.device_id().to_owned(),
            request_id: "request".to_owned(),
        };

        assert!(!sharing.on_request_received(other.user_id(), content.clone()).await.unwrap());
        assert!(!sharing
            .on_request_received(user_id!("@mallory:localhost"), content)
            .await
            .unwrap());
        assert!(transport.sent_to_device().is_empty());
    }
}
