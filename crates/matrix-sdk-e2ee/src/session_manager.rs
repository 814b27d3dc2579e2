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

//! Establishment of Olm sessions with other devices and encryption of
//! to-device messages over them.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use ruma::{OwnedDeviceId, OwnedUserId, TransactionId};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::E2eeConfig,
    error::{OlmError, OlmResult, SessionCreationError, SignatureError},
    identities::DeviceData,
    olm::{OlmDevice, SessionInProgress},
    requests::{CryptoTransport, KeysClaimResponse, ToDeviceMessages},
    types::{
        ed25519_key_id,
        events::{EncryptedContent, OlmPayload, OlmPayloadKeys, OlmV1Content},
        SignedKey,
    },
    utilities::{verify_json, FailuresCache},
};

const SIGNED_CURVE25519: &str = "signed_curve25519";

type DeviceKey = (OwnedUserId, OwnedDeviceId);

/// The Olm session we can use to talk to each device, `None` if no session
/// could be established.
pub type SessionIds = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Option<String>>>;

/// Makes sure we have Olm sessions with the devices we want to send
/// encrypted to-device messages to.
///
/// Only one session is ever established with a device at a time, concurrent
/// callers wait for the running establishment and share its result.
#[derive(Clone)]
pub struct SessionManager {
    olm: OlmDevice,
    transport: Arc<dyn CryptoTransport>,
    config: E2eeConfig,
    /// Devices we recently failed to establish a session with.
    failures: FailuresCache<DeviceKey>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager").field("olm", &self.olm).finish_non_exhaustive()
    }
}

impl SessionManager {
    pub(crate) fn new(olm: OlmDevice, transport: Arc<dyn CryptoTransport>, config: E2eeConfig) -> Self {
        Self { olm, transport, config, failures: FailuresCache::new() }
    }

    fn insert(ids: &mut SessionIds, device: &DeviceKey, session_id: Option<String>) {
        ids.entry(device.0.clone()).or_default().insert(device.1.clone(), session_id);
    }

    /// Make sure we have an Olm session with each of the given devices.
    ///
    /// With `force` set, a new session is created even if one exists already.
    /// Devices that recently failed to give us a usable one-time key are
    /// skipped until their backoff expires, unless `force` is set.
    #[instrument(skip_all, fields(device_count = devices.len(), force))]
    pub async fn ensure_olm_sessions_for_devices(
        &self,
        devices: &[DeviceData],
        force: bool,
    ) -> OlmResult<SessionIds> {
        let mut result = SessionIds::new();
        let mut to_claim = Vec::new();
        let mut to_wait = Vec::new();
        let mut seen = BTreeSet::new();
        // Devices sharing a curve key with one handled earlier in this call,
        // they get the session of that earlier device.
        let mut first_with_curve_key: BTreeMap<String, DeviceKey> = BTreeMap::new();
        let mut aliases = Vec::new();

        for device in devices {
            let key: DeviceKey = (device.user_id().to_owned(), device.device_id().to_owned());

            if device.user_id() == self.olm.user_id() && device.device_id() == self.olm.device_id()
            {
                continue;
            }

            if !seen.insert(key.clone()) {
                continue;
            }

            let Some(curve_key) = device.curve25519_key() else {
                warn!(
                    user_id = ?key.0,
                    device_id = ?key.1,
                    "Not establishing an Olm session with a device without a Curve25519 key"
                );
                Self::insert(&mut result, &key, None);
                continue;
            };
            let curve_key = curve_key.to_base64();

            // Waiting on an establishment this call started itself would
            // never finish, the claim only runs after the loop.
            if let Some(first) = first_with_curve_key.get(&curve_key) {
                aliases.push((key, first.clone()));
                continue;
            }
            first_with_curve_key.insert(curve_key.clone(), key.clone());

            if !force {
                if let Some(session_id) = self.olm.get_session_id_for_device(&curve_key, false).await? {
                    Self::insert(&mut result, &key, Some(session_id));
                    continue;
                }

                if self.failures.contains(&key) {
                    debug!(user_id = ?key.0, device_id = ?key.1, "Skipping a device that recently failed");
                    Self::insert(&mut result, &key, None);
                    continue;
                }
            }

            match self.olm.start_session_establishment(&curve_key) {
                Ok(in_progress) => {
                    // A session might have been finished since we looked.
                    let existing = if force {
                        None
                    } else {
                        self.olm.get_session_id_for_device(&curve_key, true).await?
                    };

                    if let Some(session_id) = existing {
                        in_progress.finish(Some(session_id.clone()));
                        Self::insert(&mut result, &key, Some(session_id));
                    } else {
                        to_claim.push((device.clone(), in_progress));
                    }
                }
                Err(future) => to_wait.push((key, future)),
            }
        }

        if !to_claim.is_empty() {
            self.claim_and_create_sessions(to_claim, &mut result).await?;
        }

        for (key, future) in to_wait {
            let session_id = future.await;
            Self::insert(&mut result, &key, session_id);
        }

        for (key, first) in aliases {
            let session_id = result.get(&first.0).and_then(|d| d.get(&first.1)).cloned().flatten();
            Self::insert(&mut result, &key, session_id);
        }

        Ok(result)
    }

    async fn claim_and_create_sessions(
        &self,
        to_claim: Vec<(DeviceData, SessionInProgress)>,
        result: &mut SessionIds,
    ) -> OlmResult<()> {
        let mut request: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>> = BTreeMap::new();

        for (device, _) in &to_claim {
            request
                .entry(device.user_id().to_owned())
                .or_default()
                .insert(device.device_id().to_owned(), SIGNED_CURVE25519.to_owned());
        }

        info!(device_count = to_claim.len(), "Claiming one-time keys");

        let response = match self
            .transport
            .claim_one_time_keys(request, self.config.one_time_key_claim_timeout)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = ?e, "Failed to claim one-time keys");

                // Dropping the markers wakes up everybody waiting on them.
                self.failures.extend(
                    to_claim
                        .iter()
                        .map(|(d, _)| (d.user_id().to_owned(), d.device_id().to_owned())),
                );

                return Err(e.into());
            }
        };

        if !response.failures.is_empty() {
            warn!(failures = ?response.failures.keys().collect::<Vec<_>>(), "Some servers failed to answer the key claim");
        }

        for (device, in_progress) in to_claim {
            let key: DeviceKey = (device.user_id().to_owned(), device.device_id().to_owned());

            match self.create_session(&device, &response).await {
                Ok(session_id) => {
                    info!(
                        user_id = ?key.0,
                        device_id = ?key.1,
                        session_id,
                        "Established a new Olm session"
                    );

                    self.failures.remove([&key].into_iter());
                    in_progress.finish(Some(session_id.clone()));
                    Self::insert(result, &key, Some(session_id));
                }
                Err(e) => {
                    warn!(user_id = ?key.0, device_id = ?key.1, error = ?e, "Failed to establish an Olm session");

                    self.failures.insert(key.clone());
                    in_progress.finish(None);
                    Self::insert(result, &key, None);
                }
            }
        }

        Ok(())
    }

    async fn create_session(
        &self,
        device: &DeviceData,
        response: &KeysClaimResponse,
    ) -> OlmResult<String> {
        let user_id = device.user_id();
        let device_id = device.device_id();

        let one_time_key = response
            .one_time_keys
            .get(user_id)
            .and_then(|d| d.get(device_id))
            .and_then(|keys| {
                keys.iter().find(|(key_id, _)| key_id.starts_with(&format!("{SIGNED_CURVE25519}:")))
            })
            .map(|(_, key)| key)
            .ok_or_else(|| {
                SessionCreationError::OneTimeKeyMissing(user_id.to_owned(), device_id.to_owned())
            })?;

        Self::verify_one_time_key(device, one_time_key)?;

        let identity_key = device
            .curve25519_key()
            .ok_or_else(|| {
                SessionCreationError::DeviceMissingCurveKey(user_id.to_owned(), device_id.to_owned())
            })?
            .to_base64();

        self.olm
            .create_outbound_session(
                &identity_key,
                &one_time_key.key,
                one_time_key.fallback.unwrap_or(false),
            )
            .await
    }

    fn verify_one_time_key(device: &DeviceData, key: &SignedKey) -> Result<(), SessionCreationError> {
        let signing_key = device.ed25519_key();

        let verified = match signing_key {
            Some(signing_key) => key
                .to_json()
                .map_err(SignatureError::from)
                .and_then(|json| {
                    verify_json(
                        device.user_id(),
                        &ed25519_key_id(device.device_id().as_str()),
                        &signing_key,
                        &json,
                    )
                }),
            None => Err(SignatureError::MissingSigningKey),
        };

        verified.map_err(|error| SessionCreationError::InvalidSignature {
            one_time_key: key.key.clone(),
            signing_key: signing_key.map(|k| k.to_base64()),
            error: Box::new(error),
        })
    }

    /// Encrypt an event for a single device, over the given Olm session.
    ///
    /// Returns the `m.room.encrypted` content.
    pub async fn encrypt_for_device(
        &self,
        device: &DeviceData,
        session_id: &str,
        event_type: &str,
        content: Value,
    ) -> OlmResult<Value> {
        let identity_key = device
            .curve25519_key()
            .ok_or_else(|| {
                OlmError::MissingDeviceKeys(device.user_id().to_owned(), device.device_id().to_owned())
            })?
            .to_base64();
        let recipient_ed25519 = device.ed25519_key().ok_or_else(|| {
            OlmError::MissingDeviceKeys(device.user_id().to_owned(), device.device_id().to_owned())
        })?;

        let payload = OlmPayload {
            sender: self.olm.user_id().to_owned(),
            sender_device: Some(self.olm.device_id().to_owned()),
            keys: OlmPayloadKeys { ed25519: self.olm.ed25519_key().to_base64() },
            recipient: device.user_id().to_owned(),
            recipient_keys: OlmPayloadKeys { ed25519: recipient_ed25519.to_base64() },
            event_type: event_type.to_owned(),
            content,
        };

        let plaintext = serde_json::to_string(&payload)?;
        let ciphertext = self.olm.encrypt_message(&identity_key, session_id, &plaintext).await?;

        let content = EncryptedContent::OlmV1(OlmV1Content {
            sender_key: self.olm.curve25519_key().to_base64(),
            ciphertext: BTreeMap::from([(identity_key, ciphertext)]),
        });

        Ok(content.to_json()?)
    }

    /// Encrypt an event for each of the given devices.
    ///
    /// Sessions are established where needed, devices we can't get a session
    /// with are left out of the returned messages.
    pub async fn encrypt_to_devices(
        &self,
        event_type: &str,
        content: &Value,
        devices: &[DeviceData],
    ) -> OlmResult<ToDeviceMessages> {
        let sessions = self.ensure_olm_sessions_for_devices(devices, false).await?;
        let mut messages = ToDeviceMessages::new();

        for device in devices {
            let Some(Some(session_id)) =
                sessions.get(device.user_id()).and_then(|d| d.get(device.device_id()))
            else {
                continue;
            };

            if messages
                .get(device.user_id())
                .is_some_and(|d| d.contains_key(device.device_id().as_str()))
            {
                continue;
            }

            let encrypted =
                self.encrypt_for_device(device, session_id, event_type, content.clone()).await?;

            messages
                .entry(device.user_id().to_owned())
                .or_default()
                .insert(device.device_id().to_string(), encrypted);
        }

        Ok(messages)
    }

    /// Encrypt an event for the given devices and send it out as a to-device
    /// event.
    ///
    /// Returns the number of devices the event was sent to.
    pub async fn send_encrypted_to_devices(
        &self,
        event_type: &str,
        content: &Value,
        devices: &[DeviceData],
    ) -> OlmResult<usize> {
        let messages = self.encrypt_to_devices(event_type, content, devices).await?;
        let count = messages.values().map(BTreeMap::len).sum();

        if count > 0 {
            self.transport
                .send_to_device("m.room.encrypted", &TransactionId::new(), messages)
                .await?;
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc, time::Duration};

    use assert_matches2::assert_matches;
    use ruma::{device_id, user_id};
    use serde_json::json;

    use super::SessionManager;
    use crate::{
        config::E2eeConfig,
        identities::{DeviceData, LocalTrust},
        olm::{tests::olm_device, OlmDevice},
        requests::KeysClaimResponse,
        testing::MockTransport,
        types::events::{EncryptedContent, OlmPayload},
    };

    struct Setup {
        manager: SessionManager,
        transport: Arc<MockTransport>,
        alice: OlmDevice,
        bob: OlmDevice,
        bob_device: DeviceData,
    }

    async fn setup() -> Setup {
        let alice = olm_device(user_id!("@alice:localhost"), device_id!("ALICEDEVICE")).await;
        let bob = olm_device(user_id!("@bob:localhost"), device_id!("BOBDEVICE")).await;

        bob.generate_one_time_keys(1).await.unwrap();
        let upload = bob.keys_for_upload().await.unwrap();
        bob.mark_keys_as_uploaded(1).await.unwrap();

        let transport = Arc::new(MockTransport::new());
        transport.set_keys_claim_response(KeysClaimResponse {
            one_time_keys: BTreeMap::from([(
                bob.user_id().to_owned(),
                BTreeMap::from([(bob.device_id().to_owned(), upload.one_time_keys)]),
            )]),
            failures: BTreeMap::new(),
        });

        let bob_device = DeviceData::new(bob.device_keys().await.unwrap(), LocalTrust::Unverified);
        let manager = SessionManager::new(alice.clone(), transport.clone(), E2eeConfig::default());

        Setup { manager, transport, alice, bob, bob_device }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_session() {
        let Setup { manager, transport, bob_device, .. } = setup().await;
        *transport.keys_claim_delay.lock().unwrap() = Some(Duration::from_millis(50));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let manager = manager.clone();
                let device = bob_device.clone();
                tokio::spawn(async move {
                    manager.ensure_olm_sessions_for_devices(&[device], false).await
                })
            })
            .collect();

        let mut session_ids = Vec::new();

        for task in tasks {
            let result = task.await.unwrap().unwrap();
            let session_id = result[bob_device.user_id()][bob_device.device_id()].clone();
            session_ids.push(session_id.unwrap());
        }

        session_ids.dedup();
        assert_eq!(session_ids.len(), 1);
        assert_eq!(transport.keys_claim_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicated_devices_get_a_single_session() {
        let Setup { manager, transport, bob_device, .. } = setup().await;

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            manager.ensure_olm_sessions_for_devices(&[bob_device.clone(), bob_device.clone()], false),
        )
        .await
        .expect("establishing a session with a duplicated device must not hang")
        .unwrap();

        assert_matches!(&result[bob_device.user_id()][bob_device.device_id()], Some(_));
        assert_eq!(transport.keys_claim_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn devices_sharing_a_curve_key_share_the_session() {
        let Setup { manager, transport, bob, bob_device, .. } = setup().await;

        let mut keys = bob.device_keys().await.unwrap();
        keys.device_id = device_id!("BOBCOPY").to_owned();
        let copy = DeviceData::new(keys, LocalTrust::Unverified);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            manager.ensure_olm_sessions_for_devices(&[bob_device.clone(), copy.clone()], false),
        )
        .await
        .expect("establishing sessions with devices sharing a key must not hang")
        .unwrap();

        let session_id = result[bob_device.user_id()][bob_device.device_id()].clone();
        assert!(session_id.is_some());
        assert_eq!(result[copy.user_id()][copy.device_id()], session_id);
        assert_eq!(transport.keys_claim_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn existing_sessions_are_reused() {
        let Setup { manager, transport, bob_device, .. } = setup().await;

        let first = manager.ensure_olm_sessions_for_devices(&[bob_device.clone()], false).await.unwrap();
        let second = manager.ensure_olm_sessions_for_devices(&[bob_device.clone()], false).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(transport.keys_claim_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn badly_signed_one_time_keys_are_rejected() {
        let Setup { manager, transport, bob_device, .. } = setup().await;

        let mut response = transport.keys_claim_response.lock().unwrap().clone();
        for keys in response.one_time_keys.values_mut().flat_map(|d| d.values_mut()) {
            for key in keys.values_mut() {
                key.key = "ZG9lcyBub3QgbWF0Y2ggdGhlIHNpZ25hdHVyZSBhdCBhbGwhISE".to_owned();
            }
        }
        transport.set_keys_claim_response(response);

        let result = manager.ensure_olm_sessions_for_devices(&[bob_device.clone()], false).await.unwrap();
        assert_matches!(&result[bob_device.user_id()][bob_device.device_id()], None);

        // The failure is remembered, no new claim goes out.
        manager.ensure_olm_sessions_for_devices(&[bob_device.clone()], false).await.unwrap();
        assert_eq!(transport.keys_claim_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn encrypted_to_device_messages_decrypt() {
        let Setup { manager, transport, alice, bob, bob_device } = setup().await;

        let count = manager
            .send_encrypted_to_devices("m.dummy", &json!({"hello": "world"}), &[bob_device])
            .await
            .unwrap();
        assert_eq!(count, 1);

        let sent = transport.sent_to_device();
        assert_eq!(sent[0].event_type, "m.room.encrypted");
        let content = sent[0].content_for(bob.user_id(), bob.device_id().as_str()).unwrap();

        assert_matches!(EncryptedContent::from_json(content).unwrap(), EncryptedContent::OlmV1(content));
        assert_eq!(content.sender_key, alice.curve25519_key().to_base64());

        let ciphertext = &content.ciphertext[&bob.curve25519_key().to_base64()];
        let decrypted = bob.decrypt_olm_event(&content.sender_key, ciphertext).await.unwrap();
        let payload: OlmPayload = serde_json::from_str(&decrypted.plaintext).unwrap();

        assert_eq!(payload.sender, alice.user_id());
        assert_eq!(payload.recipient, bob.user_id());
        assert_eq!(payload.keys.ed25519, alice.ed25519_key().to_base64());
        assert_eq!(payload.event_type, "m.dummy");
        similar_asserts::assert_eq!(payload.content, json!({"hello": "world"}));
    }
}
