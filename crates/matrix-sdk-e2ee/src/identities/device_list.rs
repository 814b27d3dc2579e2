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

//! Tracking of the device lists and cross-signing identities of other users.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, RwLock as StdRwLock,
    },
    time::Duration,
};

use futures_util::{
    future::{join_all, BoxFuture, Shared},
    FutureExt,
};
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, trace, warn};

use super::{
    cross_signing::{CrossSigningInfo, UserTrustLevel},
    device::{DeviceData, DeviceTrustLevel, LocalTrust},
};
use crate::{
    config::E2eeConfig,
    requests::{CryptoTransport, KeysQueryResponse, TransportError},
    store::{CryptoStore, CryptoStoreError, Store},
    types::{CrossSigningKeys, DeviceKeys},
};

/// The state of the device list of a user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingStatus {
    /// We don't keep the device list of the user up to date.
    #[default]
    NotTracked,
    /// The device list is outdated and needs to be downloaded.
    PendingDownload,
    /// A download for the device list is running.
    DownloadInProgress,
    /// The device list is up to date.
    UpToDate,
}

/// Everything the [`DeviceListManager`] persists.
///
/// The blob is always written as one unit, so the sync token never gets
/// ahead of the device data it belongs to.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceDataBlob {
    /// The devices of every user we know about.
    #[serde(default)]
    pub devices: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceData>>,
    /// The public cross-signing identities of every user we know about.
    #[serde(default)]
    pub cross_signing_info: BTreeMap<OwnedUserId, CrossSigningInfo>,
    /// Our own identity, once we trust it.
    #[serde(default)]
    pub own_identity: Option<CrossSigningInfo>,
    /// The tracking status of the device list of every user.
    #[serde(default)]
    pub tracking_status: BTreeMap<OwnedUserId, TrackingStatus>,
    /// The sync token the device lists are current as of.
    #[serde(default)]
    pub sync_token: Option<String>,
}

/// Notification sent out after the device lists of some users changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DevicesUpdated {
    /// The users whose device lists were downloaded.
    pub user_ids: Vec<OwnedUserId>,
    /// Was this the first download for every one of those users.
    pub initial_fetch: bool,
}

type SharedDownload = Shared<BoxFuture<'static, Result<(), TransportError>>>;

/// Keeps track of the devices of the users we share rooms with.
#[derive(Clone)]
pub struct DeviceListManager {
    inner: Arc<DeviceListInner>,
}

struct DeviceListInner {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    store: Store,
    transport: Arc<dyn CryptoTransport>,
    config: E2eeConfig,
    data: StdRwLock<DeviceDataBlob>,
    /// Bumped on every change of `data`.
    generation: AtomicU64,
    saved_generation: AtomicU64,
    save_lock: Mutex<()>,
    download_counter: AtomicU64,
    in_flight: StdMutex<BTreeMap<OwnedUserId, (u64, SharedDownload)>>,
    updates: broadcast::Sender<DevicesUpdated>,
}

impl fmt::Debug for DeviceListManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceListManager")
            .field("user_id", &self.inner.user_id)
            .field("device_id", &self.inner.device_id)
            .finish_non_exhaustive()
    }
}

impl DeviceListManager {
    /// Load the device lists from the store.
    ///
    /// Downloads that were running when the state was saved are marked as
    /// pending again.
    pub(crate) async fn load(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        store: Store,
        transport: Arc<dyn CryptoTransport>,
        config: E2eeConfig,
    ) -> Result<Self, CryptoStoreError> {
        let mut data = store.load_device_data().await?.unwrap_or_default();

        for status in data.tracking_status.values_mut() {
            if *status == TrackingStatus::DownloadInProgress {
                *status = TrackingStatus::PendingDownload;
            }
        }

        let (updates, _) = broadcast::channel(16);

        Ok(Self {
            inner: Arc::new(DeviceListInner {
                user_id,
                device_id,
                store,
                transport,
                config,
                data: StdRwLock::new(data),
                generation: AtomicU64::new(0),
                saved_generation: AtomicU64::new(0),
                save_lock: Mutex::new(()),
                download_counter: AtomicU64::new(0),
                in_flight: Default::default(),
                updates,
            }),
        })
    }

    /// Our own user id.
    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    /// Our own device id.
    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    fn read<T>(&self, f: impl FnOnce(&DeviceDataBlob) -> T) -> T {
        f(&self.inner.data.read().unwrap())
    }

    /// Modify the data and mark it as dirty.
    fn update<T>(&self, f: impl FnOnce(&mut DeviceDataBlob) -> T) -> T {
        let mut data = self.inner.data.write().unwrap();
        let ret = f(&mut data);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        ret
    }

    /// Subscribe to device list updates.
    ///
    /// An update is sent after the downloaded data was merged in.
    pub fn subscribe(&self) -> broadcast::Receiver<DevicesUpdated> {
        self.inner.updates.subscribe()
    }

    /// Get the tracking status of the device list of the given user.
    pub fn tracking_status(&self, user_id: &UserId) -> TrackingStatus {
        self.read(|d| d.tracking_status.get(user_id).copied().unwrap_or_default())
    }

    /// Start keeping the device list of the user up to date.
    pub fn start_tracking_user(&self, user_id: &UserId) {
        if self.tracking_status(user_id) == TrackingStatus::NotTracked {
            debug!(?user_id, "Starting to track the device list");
            self.update(|d| {
                d.tracking_status.insert(user_id.to_owned(), TrackingStatus::PendingDownload)
            });
        }
    }

    /// Stop keeping the device list of the user up to date.
    pub fn stop_tracking_user(&self, user_id: &UserId) {
        if self.tracking_status(user_id) != TrackingStatus::NotTracked {
            debug!(?user_id, "Stopping to track the device list");
            self.update(|d| {
                d.tracking_status.insert(user_id.to_owned(), TrackingStatus::NotTracked)
            });
        }
    }

    /// Mark the device list of the user as outdated.
    ///
    /// Does nothing if we're not tracking the user. A download that is
    /// already running won't mark the list as up to date once it finishes.
    pub fn invalidate_user_device_list(&self, user_id: &UserId) {
        if self.tracking_status(user_id) != TrackingStatus::NotTracked {
            trace!(?user_id, "Invalidating the device list");
            self.update(|d| {
                d.tracking_status.insert(user_id.to_owned(), TrackingStatus::PendingDownload)
            });
        }
    }

    /// The users whose device lists need to be downloaded.
    pub fn users_pending_download(&self) -> Vec<OwnedUserId> {
        self.read(|d| {
            d.tracking_status
                .iter()
                .filter(|(_, s)| **s == TrackingStatus::PendingDownload)
                .map(|(u, _)| u.clone())
                .collect()
        })
    }

    /// Download every outdated device list.
    pub async fn refresh_outdated_device_lists(&self) -> Result<(), TransportError> {
        let users = self.users_pending_download();

        if users.is_empty() {
            Ok(())
        } else {
            self.download_keys(&users, false).await
        }
    }

    /// The sync token the device lists are current as of.
    pub fn sync_token(&self) -> Option<String> {
        self.read(|d| d.sync_token.clone())
    }

    /// Advance the sync token.
    ///
    /// The token is persisted together with the device data on the next
    /// save.
    pub fn set_sync_token(&self, token: String) {
        self.update(|d| d.sync_token = Some(token));
    }

    /// Download the device lists of the given users.
    ///
    /// Users with an up to date device list are skipped unless `force` is
    /// set. If a download for a user is already running, this waits for
    /// that download instead of starting a new one.
    #[instrument(skip_all, fields(user_count = users.len(), force = force))]
    pub async fn download_keys(
        &self,
        users: &[OwnedUserId],
        force: bool,
    ) -> Result<(), TransportError> {
        let mut waiting = Vec::new();
        let mut to_download = Vec::new();

        {
            let mut in_flight = self.inner.in_flight.lock().unwrap();

            for user_id in users.iter().collect::<BTreeSet<_>>() {
                if let Some((_, download)) = in_flight.get(user_id) {
                    waiting.push(download.clone());
                } else if force || self.tracking_status(user_id) != TrackingStatus::UpToDate {
                    to_download.push(user_id.clone());
                }
            }

            for chunk in to_download.chunks(self.inner.config.device_list_chunk_size.max(1)) {
                let id = self.inner.download_counter.fetch_add(1, Ordering::SeqCst);
                let download = self.clone().download_chunk(id, chunk.to_vec()).boxed().shared();

                for user_id in chunk {
                    in_flight.insert(user_id.clone(), (id, download.clone()));
                }

                waiting.push(download);
            }
        }

        for result in join_all(waiting).await {
            result?;
        }

        Ok(())
    }

    async fn download_chunk(self, id: u64, users: Vec<OwnedUserId>) -> Result<(), TransportError> {
        self.update(|d| {
            for user_id in &users {
                if let Some(status) = d.tracking_status.get_mut(user_id) {
                    if *status != TrackingStatus::NotTracked {
                        *status = TrackingStatus::DownloadInProgress;
                    }
                }
            }
        });

        debug!(?users, "Downloading device keys");

        let result = self.inner.transport.query_keys(&users).await;

        let result = match result {
            Ok(response) => {
                self.receive_keys_query_response(&users, response);
                Ok(())
            }
            Err(e) => {
                warn!(error = ?e, "Failed to download device keys");

                self.update(|d| {
                    for user_id in &users {
                        if let Some(status) = d.tracking_status.get_mut(user_id) {
                            if *status == TrackingStatus::DownloadInProgress {
                                *status = TrackingStatus::PendingDownload;
                            }
                        }
                    }
                });

                Err(e)
            }
        };

        self.inner.in_flight.lock().unwrap().retain(|_, (download_id, _)| *download_id != id);

        result
    }

    fn receive_keys_query_response(&self, users: &[OwnedUserId], mut response: KeysQueryResponse) {
        let own_identity = self
            .own_identity()
            .unwrap_or_else(|| CrossSigningInfo::new(self.inner.user_id.clone()));

        let mut updated = Vec::new();
        let mut initial_fetch = true;

        self.update(|data| {
            for user_id in users {
                let devices = response.device_keys.remove(user_id);
                let cross_signing = CrossSigningKeys {
                    master: response.master_keys.remove(user_id),
                    self_signing: response.self_signing_keys.remove(user_id),
                    user_signing: response.user_signing_keys.remove(user_id),
                };

                if devices.is_none() && cross_signing.is_empty() {
                    debug!(?user_id, "The server didn't return any keys for the user");

                    if let Some(status) = data.tracking_status.get_mut(user_id) {
                        if *status == TrackingStatus::DownloadInProgress {
                            *status = TrackingStatus::PendingDownload;
                        }
                    }

                    continue;
                }

                if let Some(devices) = devices {
                    initial_fetch &= !data.devices.contains_key(user_id);
                    Self::update_user_devices(data, user_id, devices);
                }

                if !cross_signing.is_empty() {
                    Self::update_cross_signing(data, &own_identity, user_id, cross_signing);
                }

                if let Some(status) = data.tracking_status.get_mut(user_id) {
                    if *status == TrackingStatus::DownloadInProgress {
                        *status = TrackingStatus::UpToDate;
                    }
                }

                updated.push(user_id.clone());
            }
        });

        if !updated.is_empty() {
            info!(users = ?updated, "Device lists updated");
            let _ = self.inner.updates.send(DevicesUpdated { user_ids: updated, initial_fetch });
        }
    }

    fn update_user_devices(
        data: &mut DeviceDataBlob,
        user_id: &UserId,
        devices: BTreeMap<OwnedDeviceId, serde_json::Value>,
    ) {
        let stored = data.devices.entry(user_id.to_owned()).or_default();
        let mut seen = BTreeSet::new();

        for (device_id, value) in devices {
            let device_keys: DeviceKeys = match serde_json::from_value(value) {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(?user_id, ?device_id, error = ?e, "Received malformed device keys");
                    continue;
                }
            };

            if device_keys.user_id != user_id || device_keys.device_id != device_id {
                warn!(?user_id, ?device_id, "Device keys don't match the user or device id");
                continue;
            }

            seen.insert(device_id.clone());

            match stored.get_mut(&device_id) {
                Some(device) => {
                    if let Err(e) = device.update_device(&device_keys) {
                        warn!(
                            ?user_id,
                            ?device_id,
                            error = ?e,
                            "Rejecting an update of the device keys, keeping the old ones"
                        );
                    }
                }
                None => match DeviceData::try_from(&device_keys) {
                    Ok(device) => {
                        debug!(?user_id, ?device_id, "Adding a new device");
                        stored.insert(device_id, device);
                    }
                    Err(e) => {
                        warn!(?user_id, ?device_id, error = ?e, "Device keys failed to verify");
                    }
                },
            }
        }

        stored.retain(|device_id, _| {
            let keep = seen.contains(device_id);

            if !keep {
                debug!(?user_id, ?device_id, "Removing a deleted device");
            }

            keep
        });
    }

    fn update_cross_signing(
        data: &mut DeviceDataBlob,
        own_identity: &CrossSigningInfo,
        user_id: &UserId,
        keys: CrossSigningKeys,
    ) {
        let mut info = data
            .cross_signing_info
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| CrossSigningInfo::new(user_id.to_owned()));

        if let Err(e) = info.set_keys(keys) {
            warn!(?user_id, error = ?e, "Received invalid cross-signing keys");
            return;
        }

        let trust = own_identity.check_user_trust(&info);
        info.update_cross_signing_verified_before(trust.is_cross_signing_verified());

        data.cross_signing_info.insert(user_id.to_owned(), info);
    }

    /// Persist the device lists if they changed since the last save.
    ///
    /// With a `delay` the save waits for that long first, so that multiple
    /// changes land in one write. The returned future resolves once the
    /// write landed. Returns `true` if anything was written.
    pub async fn save_if_dirty(&self, delay: Option<Duration>) -> Result<bool, CryptoStoreError> {
        if !self.is_dirty() {
            return Ok(false);
        }

        if let Some(delay) = delay {
            tokio::time::sleep(delay + self.inner.config.device_list_save_delay).await;
        }

        let _guard = self.inner.save_lock.lock().await;

        let (generation, blob) = {
            let data = self.inner.data.read().unwrap();
            (self.inner.generation.load(Ordering::SeqCst), data.clone())
        };

        if generation <= self.inner.saved_generation.load(Ordering::SeqCst) {
            // Another save wrote our changes while we were waiting.
            return Ok(true);
        }

        let mut transaction = self.inner.store.transaction().await;
        transaction.changes().device_data = Some(blob);
        transaction.commit().await?;

        self.inner.saved_generation.fetch_max(generation, Ordering::SeqCst);
        trace!(generation, "Saved the device lists");

        Ok(true)
    }

    /// Are there changes that weren't persisted yet.
    pub fn is_dirty(&self) -> bool {
        self.inner.generation.load(Ordering::SeqCst)
            > self.inner.saved_generation.load(Ordering::SeqCst)
    }

    /// Get all the devices of the given user.
    pub fn user_devices(&self, user_id: &UserId) -> BTreeMap<OwnedDeviceId, DeviceData> {
        self.read(|d| d.devices.get(user_id).cloned().unwrap_or_default())
    }

    /// Get a single device.
    pub fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceData> {
        self.read(|d| d.devices.get(user_id)?.get(device_id).cloned())
    }

    /// Find the device that owns the given Curve25519 key.
    pub fn device_by_curve25519_key(&self, sender_key: &str) -> Option<DeviceData> {
        self.read(|d| {
            d.devices
                .values()
                .flat_map(BTreeMap::values)
                .find(|device| {
                    device.curve25519_key().is_some_and(|key| key.to_base64() == sender_key)
                })
                .cloned()
        })
    }

    /// Get the public cross-signing identity of the given user.
    pub fn cross_signing_info(&self, user_id: &UserId) -> Option<CrossSigningInfo> {
        self.read(|d| d.cross_signing_info.get(user_id).cloned())
    }

    /// Store a cross-signing identity we obtained outside of a key download.
    pub fn store_cross_signing_info(&self, info: CrossSigningInfo) {
        self.update(|d| d.cross_signing_info.insert(info.user_id().to_owned(), info));
    }

    /// Our own trusted cross-signing identity.
    pub fn own_identity(&self) -> Option<CrossSigningInfo> {
        self.read(|d| d.own_identity.clone())
    }

    /// Set our own trusted cross-signing identity.
    ///
    /// The identity is also stored as the public identity of our user.
    pub fn set_own_identity(&self, info: CrossSigningInfo) {
        self.update(|d| {
            d.cross_signing_info.insert(info.user_id().to_owned(), info.clone());
            d.own_identity = Some(info);
        });
    }

    /// Set the local trust state of a device.
    ///
    /// Returns `false` if we don't know the device.
    pub fn set_device_local_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: LocalTrust,
    ) -> bool {
        self.update(|d| {
            d.devices
                .get_mut(user_id)
                .and_then(|devices| devices.get_mut(device_id))
                .map(|device| device.set_local_trust(trust))
                .is_some()
        })
    }

    /// Mark all the current devices of the user as known.
    pub fn mark_devices_as_known(&self, user_id: &UserId) {
        self.update(|d| {
            if let Some(devices) = d.devices.get_mut(user_id) {
                devices.values_mut().for_each(DeviceData::mark_as_known);
            }
        });
    }

    /// Add a device we received outside of a key download.
    pub(crate) fn store_device(&self, device: DeviceData) {
        self.update(|d| {
            d.devices
                .entry(device.user_id().to_owned())
                .or_default()
                .insert(device.device_id().to_owned(), device)
        });
    }

    /// How much we trust the given user.
    pub fn get_user_trust(&self, user_id: &UserId) -> UserTrustLevel {
        let own = self
            .own_identity()
            .unwrap_or_else(|| CrossSigningInfo::new(self.inner.user_id.clone()));
        let other = self
            .cross_signing_info(user_id)
            .unwrap_or_else(|| CrossSigningInfo::new(user_id.to_owned()));

        let trust = own.check_user_trust(&other);

        if trust.is_cross_signing_verified() && !other.was_cross_signing_verified_before() {
            self.update(|d| {
                if let Some(info) = d.cross_signing_info.get_mut(user_id) {
                    info.update_cross_signing_verified_before(true);
                }
            });
        }

        trust
    }

    /// How much we trust the given device.
    ///
    /// Our own device is always trusted.
    pub fn get_device_trust(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceTrustLevel> {
        let trust_cross_signed = self.inner.config.trust_cross_signed_devices;

        if user_id == self.inner.user_id && device_id == self.inner.device_id {
            return Some(DeviceTrustLevel::new(true, false, LocalTrust::Verified, trust_cross_signed));
        }

        let device = self.get_device(user_id, device_id)?;
        let own = self
            .own_identity()
            .unwrap_or_else(|| CrossSigningInfo::new(self.inner.user_id.clone()));
        let other = self
            .cross_signing_info(user_id)
            .unwrap_or_else(|| CrossSigningInfo::new(user_id.to_owned()));

        Some(own.check_device_trust(
            &other,
            device.device_keys(),
            device.local_trust_state(),
            trust_cross_signed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc, time::Duration};

    use assert_matches2::assert_matches;
    use ruma::{device_id, user_id, OwnedUserId};

    use super::{DeviceListManager, TrackingStatus};
    use crate::{
        config::E2eeConfig,
        identities::LocalTrust,
        olm::Account,
        requests::KeysQueryResponse,
        store::{CryptoStore, MemoryStore, Store},
        testing::MockTransport,
        types::DeviceKeys,
    };

    fn bob() -> OwnedUserId {
        user_id!("@bob:localhost").to_owned()
    }

    fn query_response(devices: &[&DeviceKeys]) -> KeysQueryResponse {
        let mut response = KeysQueryResponse::default();

        for keys in devices {
            response
                .device_keys
                .entry(keys.user_id.clone())
                .or_default()
                .insert(keys.device_id.clone(), serde_json::to_value(keys).unwrap());
        }

        response
    }

    async fn manager(config: E2eeConfig) -> (DeviceListManager, Arc<MockTransport>, Store) {
        let transport = Arc::new(MockTransport::new());
        let store = Store::new(Arc::new(MemoryStore::new()));
        let manager = DeviceListManager::load(
            user_id!("@alice:localhost").to_owned(),
            device_id!("ALICEDEVICE").to_owned(),
            store.clone(),
            transport.clone(),
            config,
        )
        .await
        .unwrap();

        (manager, transport, store)
    }

    #[tokio::test]
    async fn tracking_state_machine() {
        let (manager, transport, _) = manager(E2eeConfig::default()).await;
        let bob = bob();
        let bob_keys = Account::new(&bob, device_id!("BOBDEVICE")).device_keys().unwrap();
        transport.set_keys_query_response(query_response(&[&bob_keys]));

        // Invalidating an untracked user does nothing.
        manager.invalidate_user_device_list(&bob);
        assert_eq!(manager.tracking_status(&bob), TrackingStatus::NotTracked);

        manager.start_tracking_user(&bob);
        assert_eq!(manager.tracking_status(&bob), TrackingStatus::PendingDownload);

        manager.refresh_outdated_device_lists().await.unwrap();
        assert_eq!(manager.tracking_status(&bob), TrackingStatus::UpToDate);
        assert!(manager.get_device(&bob, device_id!("BOBDEVICE")).is_some());

        manager.invalidate_user_device_list(&bob);
        assert_eq!(manager.tracking_status(&bob), TrackingStatus::PendingDownload);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_downloads_are_coalesced() {
        let (manager, transport, _) = manager(E2eeConfig::default()).await;
        let bob = bob();
        let bob_keys = Account::new(&bob, device_id!("BOBDEVICE")).device_keys().unwrap();
        transport.set_keys_query_response(query_response(&[&bob_keys]));
        *transport.keys_query_delay.lock().unwrap() = Some(Duration::from_secs(1));

        manager.start_tracking_user(&bob);

        let users = [bob.clone()];
        let (first, second) =
            tokio::join!(manager.download_keys(&users, false), manager.download_keys(&users, true));
        first.unwrap();
        second.unwrap();

        assert_eq!(transport.keys_query_calls.lock().unwrap().len(), 1);
        assert_eq!(manager.tracking_status(&bob), TrackingStatus::UpToDate);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_during_download_keeps_the_list_pending() {
        let (manager, transport, _) = manager(E2eeConfig::default()).await;
        let bob = bob();
        let bob_keys = Account::new(&bob, device_id!("BOBDEVICE")).device_keys().unwrap();
        transport.set_keys_query_response(query_response(&[&bob_keys]));
        *transport.keys_query_delay.lock().unwrap() = Some(Duration::from_secs(1));

        manager.start_tracking_user(&bob);

        let download = {
            let manager = manager.clone();
            let bob = bob.clone();
            tokio::spawn(async move { manager.download_keys(&[bob], false).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.tracking_status(&bob), TrackingStatus::DownloadInProgress);
        manager.invalidate_user_device_list(&bob);

        download.await.unwrap().unwrap();
        assert_eq!(manager.tracking_status(&bob), TrackingStatus::PendingDownload);
        assert!(manager.get_device(&bob, device_id!("BOBDEVICE")).is_some());
    }

    #[tokio::test]
    async fn downloads_are_chunked() {
        let (manager, transport, _) =
            manager(E2eeConfig::default().with_device_list_chunk_size(2)).await;

        let users: Vec<OwnedUserId> = (0..5)
            .map(|i| OwnedUserId::try_from(format!("@user{i}:localhost")).unwrap())
            .collect();

        manager.download_keys(&users, false).await.unwrap();

        let calls = transport.keys_query_calls.lock().unwrap().clone();
        let mut sizes: Vec<_> = calls.iter().map(Vec::len).collect();
        sizes.sort();
        assert_eq!(sizes, [1, 2, 2]);
    }

    #[tokio::test]
    async fn changed_device_key_is_rejected() {
        let (manager, transport, _) = manager(E2eeConfig::default()).await;
        let bob = bob();
        let original = Account::new(&bob, device_id!("BOBDEVICE")).device_keys().unwrap();
        let impostor = Account::new(&bob, device_id!("BOBDEVICE")).device_keys().unwrap();

        transport.set_keys_query_response(query_response(&[&original]));
        manager.download_keys(&[bob.clone()], true).await.unwrap();

        transport.set_keys_query_response(query_response(&[&impostor]));
        manager.download_keys(&[bob.clone()], true).await.unwrap();

        let device = manager.get_device(&bob, device_id!("BOBDEVICE")).unwrap();
        assert_eq!(device.device_keys(), &original);
    }

    #[tokio::test]
    async fn deleted_devices_are_removed() {
        let (manager, transport, _) = manager(E2eeConfig::default()).await;
        let bob = bob();
        let first = Account::new(&bob, device_id!("FIRST")).device_keys().unwrap();
        let second = Account::new(&bob, device_id!("SECOND")).device_keys().unwrap();

        transport.set_keys_query_response(query_response(&[&first, &second]));
        manager.download_keys(&[bob.clone()], true).await.unwrap();
        assert_eq!(manager.user_devices(&bob).len(), 2);

        transport.set_keys_query_response(query_response(&[&second]));
        manager.download_keys(&[bob.clone()], true).await.unwrap();

        let devices = manager.user_devices(&bob);
        assert_eq!(devices.len(), 1);
        assert!(devices.contains_key(device_id!("SECOND")));
    }

    #[tokio::test]
    async fn updates_are_broadcast() {
        let (manager, transport, _) = manager(E2eeConfig::default()).await;
        let bob = bob();
        let keys = Account::new(&bob, device_id!("BOBDEVICE")).device_keys().unwrap();
        transport.set_keys_query_response(query_response(&[&keys]));

        let mut updates = manager.subscribe();
        manager.download_keys(&[bob.clone()], false).await.unwrap();

        let update = updates.recv().await.unwrap();
        assert_eq!(update.user_ids, [bob]);
        assert!(update.initial_fetch);
    }

    #[tokio::test]
    async fn sync_token_is_saved_with_the_devices() {
        let (manager, transport, store) = manager(E2eeConfig::default()).await;
        let bob = bob();
        let keys = Account::new(&bob, device_id!("BOBDEVICE")).device_keys().unwrap();
        transport.set_keys_query_response(query_response(&[&keys]));

        assert!(!manager.save_if_dirty(None).await.unwrap());

        manager.start_tracking_user(&bob);
        manager.download_keys(&[bob.clone()], false).await.unwrap();
        manager.set_sync_token("s72594_4483_1934".to_owned());

        assert!(manager.save_if_dirty(Some(Duration::from_millis(1))).await.unwrap());
        assert!(!manager.is_dirty());

        let blob = store.load_device_data().await.unwrap().unwrap();
        assert_eq!(blob.sync_token.as_deref(), Some("s72594_4483_1934"));
        assert!(blob.devices[&bob].contains_key(device_id!("BOBDEVICE")));
        assert_eq!(blob.tracking_status[&bob], TrackingStatus::UpToDate);
    }

    #[tokio::test]
    async fn loading_resets_running_downloads() {
        let store = Store::new(Arc::new(MemoryStore::new()));
        let mut transaction = store.transaction().await;
        transaction.changes().device_data = Some(super::DeviceDataBlob {
            tracking_status: BTreeMap::from([(bob(), TrackingStatus::DownloadInProgress)]),
            ..Default::default()
        });
        transaction.commit().await.unwrap();

        let manager = DeviceListManager::load(
            user_id!("@alice:localhost").to_owned(),
            device_id!("ALICEDEVICE").to_owned(),
            store,
            Arc::new(MockTransport::new()),
            E2eeConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(manager.tracking_status(&bob()), TrackingStatus::PendingDownload);
    }

    #[tokio::test]
    async fn device_trust() {
        let (manager, transport, _) = manager(E2eeConfig::default()).await;
        let bob = bob();
        let keys = Account::new(&bob, device_id!("BOBDEVICE")).device_keys().unwrap();
        transport.set_keys_query_response(query_response(&[&keys]));
        manager.download_keys(&[bob.clone()], false).await.unwrap();

        let own = manager
            .get_device_trust(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"))
            .unwrap();
        assert!(own.is_verified());

        let trust = manager.get_device_trust(&bob, device_id!("BOBDEVICE")).unwrap();
        assert!(!trust.is_verified());

        assert!(manager.set_device_local_trust(&bob, device_id!("BOBDEVICE"), LocalTrust::Verified));
        let trust = manager.get_device_trust(&bob, device_id!("BOBDEVICE")).unwrap();
        assert!(trust.is_verified());

        assert_matches!(manager.get_device_trust(&bob, device_id!("UNKNOWN")), None);
    }
}
