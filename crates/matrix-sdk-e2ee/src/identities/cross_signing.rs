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

//! The cross-signing identity of a user and the trust computations based on
//! it.

use std::collections::BTreeMap;

use bitflags::bitflags;
use ruma::{OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{device::DeviceTrustLevel, signing::Signing, LocalTrust};
use crate::{
    callbacks::CryptoCallbacks,
    error::{CrossSigningError, SignatureError},
    types::{CrossSigningKey, CrossSigningKeys, DeviceKeys, KeyUsage},
    utilities::verify_json,
};

bitflags! {
    /// A set of cross-signing keys.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CrossSigningLevel: u8 {
        /// The master key.
        const MASTER = 0b001;
        /// The self-signing key.
        const SELF_SIGNING = 0b010;
        /// The user-signing key.
        const USER_SIGNING = 0b100;
    }
}

/// The outcome of checking the cross-signing chain towards a user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrossSigningVerification {
    /// The master key of the user is signed by our user-signing key, or it's
    /// our own identity.
    Verified,
    /// We could check the signature and the user isn't verified.
    Unverified,
    /// We lack the keys to check the signature at all.
    Unverifiable,
}

/// How much we trust a user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserTrustLevel {
    cross_signing: CrossSigningVerification,
    cross_signing_verified_before: bool,
    tofu: bool,
}

impl UserTrustLevel {
    pub(crate) fn new(
        cross_signing: CrossSigningVerification,
        cross_signing_verified_before: bool,
        tofu: bool,
    ) -> Self {
        Self { cross_signing, cross_signing_verified_before, tofu }
    }

    /// The detailed cross-signing verification state.
    pub fn cross_signing(&self) -> CrossSigningVerification {
        self.cross_signing
    }

    /// Is the user verified through cross-signing.
    pub fn is_cross_signing_verified(&self) -> bool {
        self.cross_signing == CrossSigningVerification::Verified
    }

    /// Is the user verified.
    pub fn is_verified(&self) -> bool {
        self.is_cross_signing_verified()
    }

    /// Was the user ever cross-signing verified.
    pub fn was_cross_signing_verified(&self) -> bool {
        self.cross_signing_verified_before
    }

    /// Is the identity of the user trusted on first use.
    pub fn is_tofu(&self) -> bool {
        self.tofu
    }
}

/// The public cross-signing keys of a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossSigningInfo {
    user_id: OwnedUserId,
    #[serde(default)]
    keys: CrossSigningKeys,
    #[serde(default)]
    first_use: bool,
    #[serde(default)]
    cross_signing_verified_before: bool,
}

impl CrossSigningInfo {
    /// Create an empty identity for the given user.
    pub fn new(user_id: OwnedUserId) -> Self {
        Self {
            user_id,
            keys: CrossSigningKeys::default(),
            first_use: true,
            cross_signing_verified_before: false,
        }
    }

    /// The owner of the identity.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The public keys of the identity.
    pub fn keys(&self) -> &CrossSigningKeys {
        &self.keys
    }

    /// Get the key with the given usage.
    pub fn get_key(&self, usage: KeyUsage) -> Option<&CrossSigningKey> {
        match usage {
            KeyUsage::Master => self.keys.master.as_ref(),
            KeyUsage::SelfSigning => self.keys.self_signing.as_ref(),
            KeyUsage::UserSigning => self.keys.user_signing.as_ref(),
        }
    }

    /// Get the base64 public key of the key with the given usage.
    pub fn get_id(&self, usage: KeyUsage) -> Option<&str> {
        self.get_key(usage).and_then(CrossSigningKey::public_key_base64)
    }

    /// Is this the first master key we have seen for the user.
    pub fn is_first_use(&self) -> bool {
        self.first_use
    }

    /// Was the user ever cross-signing verified.
    pub fn was_cross_signing_verified_before(&self) -> bool {
        self.cross_signing_verified_before
    }

    /// Remember that the user was cross-signing verified.
    ///
    /// This can only ever set the flag, once the user was verified this
    /// stays recorded.
    pub fn update_cross_signing_verified_before(&mut self, is_verified: bool) {
        if is_verified && !self.cross_signing_verified_before {
            debug!(user_id = ?self.user_id, "Remembering that the user was verified");
            self.cross_signing_verified_before = true;
        }
    }

    /// Update the public keys of the identity.
    ///
    /// Sub-keys have to be signed by the master key, either the new one or
    /// the one we already know. If a new master key is set, the old sub-keys
    /// are dropped. Nothing is changed if any check fails.
    ///
    /// Returns the set of keys that changed.
    pub fn set_keys(
        &mut self,
        keys: CrossSigningKeys,
    ) -> Result<CrossSigningLevel, CrossSigningError> {
        for (usage, key) in [
            (KeyUsage::Master, &keys.master),
            (KeyUsage::SelfSigning, &keys.self_signing),
            (KeyUsage::UserSigning, &keys.user_signing),
        ] {
            if let Some(key) = key {
                if key.user_id != self.user_id {
                    return Err(CrossSigningError::UserIdMismatch {
                        expected: self.user_id.clone(),
                        got: key.user_id.clone(),
                    });
                }

                if !key.has_usage(usage) {
                    return Err(CrossSigningError::InvalidUsage(usage));
                }
            }
        }

        let master = keys
            .master
            .as_ref()
            .or(self.keys.master.as_ref())
            .ok_or(CrossSigningError::MissingMasterKey)?;

        let master_changed = keys
            .master
            .as_ref()
            .is_some_and(|new| self.get_id(KeyUsage::Master) != new.public_key_base64());

        for (usage, key) in
            [(KeyUsage::SelfSigning, &keys.self_signing), (KeyUsage::UserSigning, &keys.user_signing)]
        {
            if let Some(key) = key {
                key.verify_signed_by(master)
                    .map_err(|e| CrossSigningError::InvalidSignature(usage, e))?;
            }
        }

        let mut changed = CrossSigningLevel::empty();

        if let Some(master) = keys.master {
            if master_changed {
                if self.keys.master.is_some() {
                    info!(user_id = ?self.user_id, "The master key of the user changed");
                    self.first_use = false;
                }

                self.keys.self_signing = None;
                self.keys.user_signing = None;
                changed |= CrossSigningLevel::MASTER;
            }

            self.keys.master = Some(master);
        }

        if let Some(key) = keys.self_signing {
            if self.keys.self_signing.as_ref() != Some(&key) {
                changed |= CrossSigningLevel::SELF_SIGNING;
            }
            self.keys.self_signing = Some(key);
        }

        if let Some(key) = keys.user_signing {
            if self.keys.user_signing.as_ref() != Some(&key) {
                changed |= CrossSigningLevel::USER_SIGNING;
            }
            self.keys.user_signing = Some(key);
        }

        Ok(changed)
    }

    /// Create new cross-signing keys.
    ///
    /// Resetting the master key, or resetting anything while there's no
    /// master key, resets all three keys. The new private keys are handed to
    /// [`CryptoCallbacks::save_cross_signing_keys()`] and then forgotten.
    ///
    /// Returns the new public keys, signed by the master key, ready for the
    /// upload.
    pub async fn reset_keys(
        &mut self,
        level: CrossSigningLevel,
        callbacks: &dyn CryptoCallbacks,
    ) -> Result<CrossSigningKeys, CrossSigningError> {
        let level = if level.contains(CrossSigningLevel::MASTER) || self.keys.master.is_none() {
            CrossSigningLevel::all()
        } else {
            level
        };

        info!(user_id = ?self.user_id, ?level, "Resetting the cross-signing keys");

        let master = if level.contains(CrossSigningLevel::MASTER) {
            Signing::new()
        } else {
            self.private_key(KeyUsage::Master, callbacks).await?
        };

        let mut new_keys = CrossSigningKeys::default();
        let mut private_keys = Vec::new();

        for (flag, usage) in [
            (CrossSigningLevel::SELF_SIGNING, KeyUsage::SelfSigning),
            (CrossSigningLevel::USER_SIGNING, KeyUsage::UserSigning),
        ] {
            if level.contains(flag) {
                let private = Signing::new();
                let mut public = private.cross_signing_key(&self.user_id, usage);
                master.sign_cross_signing_key(&self.user_id, &mut public)?;

                match usage {
                    KeyUsage::SelfSigning => new_keys.self_signing = Some(public),
                    _ => new_keys.user_signing = Some(public),
                }

                private_keys.push((usage, private));
            }
        }

        if level.contains(CrossSigningLevel::MASTER) {
            new_keys.master = Some(master.cross_signing_key(&self.user_id, KeyUsage::Master));
            private_keys.push((KeyUsage::Master, master));
        }

        let private_keys: BTreeMap<_, _> =
            private_keys.into_iter().map(|(usage, key)| (usage, key.into_secret_key())).collect();
        callbacks.save_cross_signing_keys(private_keys).await?;

        let mut updated = self.clone();
        updated.set_keys(new_keys.clone())?;
        *self = updated;

        Ok(new_keys)
    }

    /// Fetch the private part of one of our keys from the application and
    /// check that it matches the public key.
    pub(crate) async fn private_key(
        &self,
        usage: KeyUsage,
        callbacks: &dyn CryptoCallbacks,
    ) -> Result<Signing, CrossSigningError> {
        let public_key = self.get_id(usage).ok_or(CrossSigningError::MissingPrivateKey(usage))?;

        let secret = callbacks
            .get_cross_signing_key(usage, public_key)
            .await
            .ok_or(CrossSigningError::MissingPrivateKey(usage))?;

        let signing = Signing::from_secret_key(secret);

        if signing.public_key().to_base64() != public_key {
            warn!(?usage, "The private cross-signing key doesn't match the public key");
            Err(CrossSigningError::PublicKeyMismatch(usage))
        } else {
            Ok(signing)
        }
    }

    /// Sign the master key of another user with our user-signing key.
    ///
    /// Returns the master key of the other user carrying our signature.
    pub async fn sign_user(
        &self,
        other: &CrossSigningInfo,
        callbacks: &dyn CryptoCallbacks,
    ) -> Result<CrossSigningKey, CrossSigningError> {
        let mut master = other
            .keys
            .master
            .clone()
            .ok_or(CrossSigningError::MissingMasterKey)?;

        let user_signing = self.private_key(KeyUsage::UserSigning, callbacks).await?;
        user_signing.sign_cross_signing_key(&self.user_id, &mut master)?;

        Ok(master)
    }

    /// Sign one of our own devices with our self-signing key.
    pub async fn sign_device(
        &self,
        device: &DeviceKeys,
        callbacks: &dyn CryptoCallbacks,
    ) -> Result<DeviceKeys, CrossSigningError> {
        if device.user_id != self.user_id {
            return Err(CrossSigningError::UserIdMismatch {
                expected: self.user_id.clone(),
                got: device.user_id.clone(),
            });
        }

        let mut device = device.clone();
        let self_signing = self.private_key(KeyUsage::SelfSigning, callbacks).await?;
        self_signing.sign_device(&self.user_id, &mut device)?;

        Ok(device)
    }

    /// Check how much the owner of this identity trusts the given user.
    ///
    /// `self` has to be the trusted identity of our own user.
    pub fn check_user_trust(&self, other: &CrossSigningInfo) -> UserTrustLevel {
        if self.user_id == other.user_id
            && self.get_id(KeyUsage::Master).is_some()
            && self.get_id(KeyUsage::Master) == other.get_id(KeyUsage::Master)
            && self.get_id(KeyUsage::SelfSigning).is_some()
            && self.get_id(KeyUsage::SelfSigning) == other.get_id(KeyUsage::SelfSigning)
        {
            return UserTrustLevel::new(
                CrossSigningVerification::Verified,
                true,
                self.first_use,
            );
        }

        let (Some(user_signing), Some(master)) = (self.get_key(KeyUsage::UserSigning), &other.keys.master)
        else {
            return UserTrustLevel::new(
                CrossSigningVerification::Unverifiable,
                other.cross_signing_verified_before,
                other.first_use,
            );
        };

        let verification = match master.verify_signed_by(user_signing) {
            Ok(()) => CrossSigningVerification::Verified,
            Err(_) => CrossSigningVerification::Unverified,
        };

        UserTrustLevel::new(verification, other.cross_signing_verified_before, other.first_use)
    }

    /// Check how much the owner of this identity trusts a device of the given
    /// user.
    pub fn check_device_trust(
        &self,
        other: &CrossSigningInfo,
        device: &DeviceKeys,
        local_trust: LocalTrust,
        trust_cross_signed_devices: bool,
    ) -> DeviceTrustLevel {
        let untrusted = DeviceTrustLevel::new(false, false, local_trust, trust_cross_signed_devices);

        let (Some(master), Some(self_signing)) = (&other.keys.master, &other.keys.self_signing)
        else {
            return untrusted;
        };

        let user_trust = self.check_user_trust(other);

        let device_signed = || -> Result<(), SignatureError> {
            self_signing.verify_signed_by(master)?;

            let key = self_signing.get_first_key().ok_or(SignatureError::MissingSigningKey)?;
            let key_id = self_signing.key_id().ok_or(SignatureError::MissingSigningKey)?;

            verify_json(&other.user_id, &key_id, &key, &device.to_json()?)
        };

        match device_signed() {
            Ok(()) => {
                DeviceTrustLevel::from_user_trust(&user_trust, local_trust, trust_cross_signed_devices)
            }
            Err(_) => untrusted,
        }
    }
}
