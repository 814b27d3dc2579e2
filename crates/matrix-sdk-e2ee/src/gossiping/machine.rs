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

use std::{collections::BTreeMap, sync::Arc};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, TransactionId, UserId};
use tracing::{debug, info, instrument, trace};

use super::{KeyRequestRecipient, OutgoingRoomKeyRequest, RequestState};
use crate::{
    error::OlmResult,
    requests::{CryptoTransport, ToDeviceMessages},
    store::{CryptoStore, Store},
    types::events::{RequestAction, RequestedKeyInfo, RoomKeyRequestContent},
};

const ROOM_KEY_REQUEST: &str = "m.room_key_request";

/// Drives the queue of outgoing room key requests.
#[derive(Debug, Clone)]
pub(crate) struct GossipMachine {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    store: Store,
    transport: Arc<dyn CryptoTransport>,
}

impl GossipMachine {
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        store: Store,
        transport: Arc<dyn CryptoTransport>,
    ) -> Self {
        Self { user_id, device_id, store, transport }
    }

    /// Our own user id.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Our own device ID.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Queue a request for the given room key.
    ///
    /// If a request for the same key exists already it's reused. With
    /// `resend` set, a request that was already sent is cancelled and sent
    /// again under a new id.
    pub async fn queue_room_key_request(
        &self,
        info: RequestedKeyInfo,
        recipients: Vec<KeyRequestRecipient>,
        resend: bool,
    ) -> OlmResult<OutgoingRoomKeyRequest> {
        let mut transaction = self.store.transaction().await;

        let request = match transaction.store().get_outgoing_key_request_by_info(&info).await? {
            None => {
                let request = OutgoingRoomKeyRequest::new(info, recipients);
                debug!(
                    request_id = ?request.request_id,
                    session_id = request.request_body.session_id,
                    "Queueing a new room key request",
                );
                request
            }
            Some(mut request) => {
                match request.state {
                    RequestState::Unsent | RequestState::CancellationPendingAndWillResend => {
                        trace!(request_id = ?request.request_id, "Room key request already queued");
                        return Ok(request);
                    }
                    RequestState::CancellationPending => {
                        // The cancellation didn't go out yet, so the original
                        // request is still live on the other side.
                        request.state = if resend {
                            RequestState::CancellationPendingAndWillResend
                        } else {
                            request.cancellation_txn_id = None;
                            RequestState::Sent
                        };
                    }
                    RequestState::Sent => {
                        if !resend {
                            return Ok(request);
                        }

                        request.state = RequestState::CancellationPendingAndWillResend;
                        request.cancellation_txn_id = Some(TransactionId::new());
                    }
                }

                request
            }
        };

        transaction.changes().key_requests.push(request.clone());
        transaction.commit().await?;

        Ok(request)
    }

    /// Cancel the request for the given room key, usually because we got the
    /// key in the meantime.
    pub async fn cancel_room_key_request(&self, info: &RequestedKeyInfo) -> OlmResult<()> {
        let mut transaction = self.store.transaction().await;

        let Some(mut request) = transaction.store().get_outgoing_key_request_by_info(info).await?
        else {
            return Ok(());
        };

        match request.state {
            RequestState::Unsent => {
                trace!(request_id = ?request.request_id, "Deleting an unsent room key request");
                transaction.changes().removed_key_requests.push(request.request_id);
            }
            RequestState::Sent => {
                request.state = RequestState::CancellationPending;
                request.cancellation_txn_id = Some(TransactionId::new());
                transaction.changes().key_requests.push(request);
            }
            RequestState::CancellationPending | RequestState::CancellationPendingAndWillResend => {
                return Ok(());
            }
        }

        Ok(transaction.commit().await?)
    }

    fn messages(
        &self,
        recipients: &[KeyRequestRecipient],
        content: &RoomKeyRequestContent,
    ) -> OlmResult<ToDeviceMessages> {
        let content = serde_json::to_value(content)?;
        let mut messages: ToDeviceMessages = BTreeMap::new();

        for recipient in recipients {
            let device = recipient.device_id.as_ref().map_or("*", |d| d.as_str());
            messages
                .entry(recipient.user_id.clone())
                .or_default()
                .insert(device.to_owned(), content.clone());
        }

        Ok(messages)
    }

    async fn send_request(&self, request: &OutgoingRoomKeyRequest) -> OlmResult<()> {
        let content = RoomKeyRequestContent {
            action: RequestAction::Request,
            body: Some(request.request_body.clone()),
            request_id: request.request_id.clone(),
            requesting_device_id: self.device_id.clone(),
        };

        let messages = self.messages(&request.recipients, &content)?;
        self.transport.send_to_device(ROOM_KEY_REQUEST, &request.request_id, messages).await?;

        Ok(())
    }

    async fn send_cancellation(&self, request: &OutgoingRoomKeyRequest) -> OlmResult<()> {
        let content = RoomKeyRequestContent {
            action: RequestAction::RequestCancellation,
            body: None,
            request_id: request.request_id.clone(),
            requesting_device_id: self.device_id.clone(),
        };

        let txn_id = request.cancellation_txn_id.clone().unwrap_or_else(TransactionId::new);
        let messages = self.messages(&request.recipients, &content)?;
        self.transport.send_to_device(ROOM_KEY_REQUEST, &txn_id, messages).await?;

        Ok(())
    }

    /// Send out every queued request and cancellation.
    ///
    /// A request that fails to go out stays in its state and is retried on
    /// the next call.
    #[instrument(skip_all)]
    pub async fn send_queued_requests(&self) -> OlmResult<()> {
        let requests = self
            .store
            .get_outgoing_key_requests_by_state(&[
                RequestState::Unsent,
                RequestState::CancellationPending,
                RequestState::CancellationPendingAndWillResend,
            ])
            .await?;

        for request in requests {
            let mut transaction = self.store.transaction().await;

            // The state might have moved while we were sending earlier
            // requests.
            let Some(mut request) =
                transaction.store().get_outgoing_key_request(&request.request_id).await?
            else {
                continue;
            };

            match request.state {
                RequestState::Unsent => {
                    self.send_request(&request).await?;
                    request.state = RequestState::Sent;
                    transaction.changes().key_requests.push(request);
                }
                RequestState::CancellationPending => {
                    self.send_cancellation(&request).await?;
                    transaction.changes().removed_key_requests.push(request.request_id);
                }
                RequestState::CancellationPendingAndWillResend => {
                    self.send_cancellation(&request).await?;
                    transaction.changes().removed_key_requests.push(request.request_id.clone());

                    let mut renewed =
                        OutgoingRoomKeyRequest::new(request.request_body, request.recipients);
                    info!(
                        old_request_id = ?request.request_id,
                        new_request_id = ?renewed.request_id,
                        "Resending a room key request",
                    );

                    self.send_request(&renewed).await?;
                    renewed.state = RequestState::Sent;
                    transaction.changes().key_requests.push(renewed);
                }
                RequestState::Sent => continue,
            }

            transaction.commit().await?;
        }

        Ok(())
    }
}
