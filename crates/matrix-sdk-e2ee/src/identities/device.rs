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

use ruma::{DeviceId, MilliSecondsSinceUnixEpoch, UserId};
use serde::{Deserialize, Serialize};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use super::cross_signing::UserTrustLevel;
use crate::{
    algorithms::EventEncryptionAlgorithm,
    error::SignatureError,
    types::{DeviceKeys, Signatures},
};

/// The local trust state of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The device has been verified and is trusted.
    Verified,
    /// The device has been blocked from communicating.
    Blocked,
    /// The device wasn't verified yet.
    #[default]
    Unverified,
}

/// A device of a user, as it was downloaded from the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceData {
    device_keys: DeviceKeys,
    #[serde(default)]
    local_trust: LocalTrust,
    #[serde(default)]
    known: bool,
    first_time_seen_ts: MilliSecondsSinceUnixEpoch,
}

impl DeviceData {
    /// Create a new device, this constructor skips signature verification of
    /// the keys, [`DeviceData::try_from()`] should be used for completely new
    /// devices we receive.
    pub fn new(device_keys: DeviceKeys, local_trust: LocalTrust) -> Self {
        Self {
            device_keys,
            local_trust,
            known: false,
            first_time_seen_ts: MilliSecondsSinceUnixEpoch::now(),
        }
    }

    /// The user id of the device owner.
    pub fn user_id(&self) -> &UserId {
        &self.device_keys.user_id
    }

    /// The unique ID of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_keys.device_id
    }

    /// Get the human readable name of the device.
    pub fn display_name(&self) -> Option<&str> {
        self.device_keys.unsigned.device_display_name.as_deref()
    }

    /// Get the Curve25519 key of the given device.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.device_keys.curve25519_key()
    }

    /// Get the Ed25519 key of the given device.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.device_keys.ed25519_key()
    }

    /// Get the device keys as they were uploaded by the device.
    pub fn device_keys(&self) -> &DeviceKeys {
        &self.device_keys
    }

    /// Get a map containing all the device signatures.
    pub fn signatures(&self) -> &Signatures {
        &self.device_keys.signatures
    }

    /// Get the list of algorithms this device supports.
    pub fn algorithms(&self) -> &[EventEncryptionAlgorithm] {
        &self.device_keys.algorithms
    }

    /// Does this device support the Olm encryption algorithm.
    pub fn supports_olm(&self) -> bool {
        self.algorithms().contains(&EventEncryptionAlgorithm::OlmV1Curve25519AesSha2)
    }

    /// Get the trust state of the device.
    pub fn local_trust_state(&self) -> LocalTrust {
        self.local_trust
    }

    /// Is the device locally marked as trusted.
    pub fn is_locally_trusted(&self) -> bool {
        self.local_trust == LocalTrust::Verified
    }

    /// Is the device locally marked as blocked.
    ///
    /// Blocked devices won't receive any group sessions.
    pub fn is_blocked(&self) -> bool {
        self.local_trust == LocalTrust::Blocked
    }

    pub(crate) fn set_local_trust(&mut self, state: LocalTrust) {
        self.local_trust = state;
    }

    /// Has the user been told about this device.
    pub fn is_known(&self) -> bool {
        self.known
    }

    pub(crate) fn mark_as_known(&mut self) {
        self.known = true;
    }

    /// When did we first download the keys of the device.
    pub fn first_time_seen_ts(&self) -> MilliSecondsSinceUnixEpoch {
        self.first_time_seen_ts
    }

    /// Update the device keys with a newer version we downloaded.
    ///
    /// The new keys need to be self-signed and the Ed25519 key of a device
    /// must never change. Returns `true` if the keys changed.
    pub(crate) fn update_device(&mut self, device_keys: &DeviceKeys) -> Result<bool, SignatureError> {
        device_keys.check_self_signature()?;

        if self.user_id() != device_keys.user_id || self.device_id() != device_keys.device_id {
            return Err(SignatureError::UserIdMismatch);
        }

        if self.ed25519_key() != device_keys.ed25519_key() {
            return Err(SignatureError::VerificationError);
        }

        if &self.device_keys == device_keys {
            Ok(false)
        } else {
            self.device_keys = device_keys.clone();
            Ok(true)
        }
    }
}

impl TryFrom<&DeviceKeys> for DeviceData {
    type Error = SignatureError;

    fn try_from(device_keys: &DeviceKeys) -> Result<Self, Self::Error> {
        device_keys.check_self_signature()?;
        Ok(Self::new(device_keys.clone(), LocalTrust::Unverified))
    }
}

/// How much we trust a device.
///
/// A device is verified if it was verified locally, or if it's signed by the
/// cross-signing identity of a verified user and we're configured to trust
/// cross-signed devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceTrustLevel {
    cross_signing_verified: bool,
    tofu: bool,
    local: LocalTrust,
    trust_cross_signed_devices: bool,
}

impl DeviceTrustLevel {
    pub(crate) fn new(
        cross_signing_verified: bool,
        tofu: bool,
        local: LocalTrust,
        trust_cross_signed_devices: bool,
    ) -> Self {
        Self { cross_signing_verified, tofu, local, trust_cross_signed_devices }
    }

    pub(crate) fn from_user_trust(
        user_trust: &UserTrustLevel,
        local: LocalTrust,
        trust_cross_signed_devices: bool,
    ) -> Self {
        Self::new(
            user_trust.is_cross_signing_verified(),
            user_trust.is_tofu(),
            local,
            trust_cross_signed_devices,
        )
    }

    /// Is the device verified, either locally or through cross-signing.
    pub fn is_verified(&self) -> bool {
        self.is_locally_verified()
            || (self.trust_cross_signed_devices && self.is_cross_signing_verified())
    }

    /// Is the device signed by the cross-signing identity of a verified user.
    pub fn is_cross_signing_verified(&self) -> bool {
        self.cross_signing_verified
    }

    /// Was the device verified locally.
    pub fn is_locally_verified(&self) -> bool {
        self.local == LocalTrust::Verified
    }

    /// Is the device blocked.
    pub fn is_blocked(&self) -> bool {
        self.local == LocalTrust::Blocked
    }

    /// Is the identity of the device owner trusted on first use.
    pub fn is_tofu(&self) -> bool {
        self.tofu
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, user_id};

    use super::{DeviceData, DeviceTrustLevel, LocalTrust};
    use crate::{error::SignatureError, olm::Account};

    fn device_keys() -> crate::types::DeviceKeys {
        Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE")).device_keys().unwrap()
    }

    #[test]
    fn new_devices_need_a_self_signature() {
        let keys = device_keys();
        let device = DeviceData::try_from(&keys).unwrap();
        assert_eq!(device.local_trust_state(), LocalTrust::Unverified);
        assert!(device.supports_olm());

        let mut unsigned = keys;
        unsigned.signatures = Default::default();
        assert_matches!(DeviceData::try_from(&unsigned), Err(SignatureError::NoSignatureFound));
    }

    #[test]
    fn changed_ed25519_key_is_rejected() {
        let mut device = DeviceData::try_from(&device_keys()).unwrap();
        let original = device.device_keys().clone();

        // A different account for the same user and device id.
        let other = device_keys();
        assert!(device.update_device(&other).is_err());
        assert_eq!(device.device_keys(), &original);

        let same = device.device_keys().clone();
        assert!(!device.update_device(&same).unwrap());
    }

    #[test]
    fn trust_composition() {
        let trust = DeviceTrustLevel::new(true, false, LocalTrust::Unverified, true);
        assert!(trust.is_verified());

        let trust = DeviceTrustLevel::new(true, false, LocalTrust::Unverified, false);
        assert!(!trust.is_verified());

        let trust = DeviceTrustLevel::new(false, false, LocalTrust::Verified, false);
        assert!(trust.is_verified());
        assert!(!trust.is_cross_signing_verified());
    }
}
