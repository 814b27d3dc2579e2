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

use std::{collections::BTreeMap, fmt, time::Duration};

use ruma::{DeviceId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};
use vodozemac::{
    base64_encode,
    olm::{Account as InnerAccount, AccountPickle, IdentityKeys, PreKeyMessage, SessionConfig},
    Curve25519PublicKey, Ed25519Signature, PickleError,
};

use super::Session;
use crate::{
    algorithms::EventEncryptionAlgorithm,
    error::{SessionCreationError, SignatureError},
    types::{ed25519_key_id, DeviceKeys, SignedKey},
    utilities::canonical_json_for_signing,
};

/// The id of a signed Curve25519 one-time or fallback key, as uploaded.
pub fn signed_curve25519_key_id(key_id: &str) -> String {
    format!("signed_curve25519:{key_id}")
}

/// Account holding identity keys for which sessions can be created.
///
/// An account is the central identity for encrypted communication between two
/// devices.
pub struct Account {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    inner: Box<InnerAccount>,
    identity_keys: IdentityKeys,
    shared: bool,
    uploaded_signed_key_count: u64,
    creation_local_time: MilliSecondsSinceUnixEpoch,
    fallback_creation_timestamp: Option<MilliSecondsSinceUnixEpoch>,
}

/// A typed representation of a base64 encoded string containing the account
/// pickle, encrypted with the pickle key, plus the unencrypted metadata.
#[derive(Clone, Serialize, Deserialize)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: OwnedUserId,
    /// The device ID of the account owner.
    pub device_id: OwnedDeviceId,
    /// The encrypted pickle of the Olm account.
    pub pickle: String,
    /// Was the account shared.
    pub shared: bool,
    /// The number of uploaded one-time keys we have on the server.
    pub uploaded_signed_key_count: u64,
    /// The local time this account was created at.
    pub creation_local_time: MilliSecondsSinceUnixEpoch,
    /// The timestamp of the last time we generated a fallback key.
    #[serde(default)]
    pub fallback_key_creation_timestamp: Option<MilliSecondsSinceUnixEpoch>,
}

impl fmt::Debug for PickledAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickledAccount")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys)
            .field("shared", &self.shared)
            .finish()
    }
}

/// The hash of an Olm message, used to detect replayed pre-key messages.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OlmMessageHash {
    /// The curve25519 key of the sender that sent us the Olm message.
    pub sender_key: String,
    /// The hash of the message.
    pub hash: String,
}

impl OlmMessageHash {
    pub(crate) fn new(sender_key: &str, message_type: usize, ciphertext: &str) -> Self {
        let mut sha = Sha256::new();
        sha.update(message_type.to_be_bytes());
        sha.update(ciphertext.as_bytes());

        Self { sender_key: sender_key.to_owned(), hash: base64_encode(sha.finalize()) }
    }
}

impl Account {
    /// Create a fresh new account, this will generate the identity key-pair.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        let inner = InnerAccount::new();
        let identity_keys = inner.identity_keys();

        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            inner: Box::new(inner),
            identity_keys,
            shared: false,
            uploaded_signed_key_count: 0,
            creation_local_time: MilliSecondsSinceUnixEpoch::now(),
            fallback_creation_timestamp: None,
        }
    }

    /// The user id of the account owner.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device id of the account.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Get the public parts of the identity keys of the account.
    pub fn identity_keys(&self) -> IdentityKeys {
        self.identity_keys
    }

    /// Has the account been shared with the server.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Mark the account as shared.
    pub fn mark_as_shared(&mut self) {
        self.shared = true;
    }

    /// The number of signed one-time keys the server holds for us.
    pub fn uploaded_key_count(&self) -> u64 {
        self.uploaded_signed_key_count
    }

    /// Update the number of signed one-time keys the server holds for us.
    pub fn update_uploaded_key_count(&mut self, count: u64) {
        self.uploaded_signed_key_count = count;
    }

    /// Sign the given string using the accounts signing key.
    pub fn sign(&self, string: &str) -> Ed25519Signature {
        self.inner.sign(string)
    }

    /// Convert a JSON value to the canonical representation and sign it.
    ///
    /// The `signatures` and `unsigned` fields are ignored.
    pub fn sign_json(&self, json: &Value) -> Result<Ed25519Signature, SignatureError> {
        Ok(self.sign(&canonical_json_for_signing(json)?))
    }

    /// The unpublished one-time keys, keyed by their `signed_curve25519` id.
    pub fn one_time_keys(&self) -> BTreeMap<String, Curve25519PublicKey> {
        self.inner
            .one_time_keys()
            .into_iter()
            .map(|(key_id, key)| (signed_curve25519_key_id(&key_id.to_base64()), key))
            .collect()
    }

    /// Generate new one-time keys.
    ///
    /// Returns the number of keys that were created.
    pub fn generate_one_time_keys(&mut self, count: usize) -> usize {
        let result = self.inner.generate_one_time_keys(count);
        trace!(created = result.created.len(), removed = result.removed.len(), "Generated one-time keys");

        result.created.len()
    }

    /// The maximum number of one-time keys the account can hold.
    pub fn max_number_of_one_time_keys(&self) -> usize {
        self.inner.max_number_of_one_time_keys()
    }

    /// Mark the current set of one-time and fallback keys as being published.
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Generate a new fallback key, the previous one is kept around until
    /// [`Account::forget_fallback_key()`] is called.
    pub fn generate_fallback_key(&mut self) {
        let removed = self.inner.generate_fallback_key();
        self.fallback_creation_timestamp = Some(MilliSecondsSinceUnixEpoch::now());

        debug!(?removed, "Generated a new fallback key");
    }

    /// The unpublished fallback key, keyed by its `signed_curve25519` id.
    pub fn fallback_key(&self) -> BTreeMap<String, Curve25519PublicKey> {
        self.inner
            .fallback_key()
            .into_iter()
            .map(|(key_id, key)| (signed_curve25519_key_id(&key_id.to_base64()), key))
            .collect()
    }

    /// Forget the previous fallback key.
    pub fn forget_fallback_key(&mut self) -> bool {
        self.inner.forget_fallback_key()
    }

    /// Is our most recent fallback key older than the given age.
    ///
    /// Accounts that never created a fallback key count as expired.
    pub fn fallback_key_expired(&self, max_age: Duration) -> bool {
        let Some(time) = self.fallback_creation_timestamp else {
            return true;
        };

        let Some(system_time) = time.to_system_time() else {
            return true;
        };

        // A creation time in the future means the clock went backwards.
        let Ok(elapsed) = system_time.elapsed() else {
            return true;
        };

        elapsed > max_age
    }

    /// Sign the device keys of the account and return them so they can be
    /// uploaded.
    pub fn device_keys(&self) -> Result<DeviceKeys, SignatureError> {
        let mut device_keys = DeviceKeys::new(
            self.user_id.clone(),
            self.device_id.clone(),
            vec![
                EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
                EventEncryptionAlgorithm::MegolmV1AesSha2,
            ],
            self.identity_keys.curve25519,
            self.identity_keys.ed25519,
        );

        let signature = self.sign_json(&device_keys.to_json()?)?;
        device_keys.signatures.add_signature(
            self.user_id.clone(),
            ed25519_key_id(self.device_id.as_str()),
            signature,
        );

        Ok(device_keys)
    }

    /// Sign and prepare the unpublished one-time keys for the upload.
    pub fn signed_one_time_keys(&self) -> Result<BTreeMap<String, SignedKey>, SignatureError> {
        self.signed_keys(self.one_time_keys(), false)
    }

    /// Sign and prepare the unpublished fallback key for the upload.
    pub fn signed_fallback_keys(&self) -> Result<BTreeMap<String, SignedKey>, SignatureError> {
        self.signed_keys(self.fallback_key(), true)
    }

    fn signed_keys(
        &self,
        keys: BTreeMap<String, Curve25519PublicKey>,
        fallback: bool,
    ) -> Result<BTreeMap<String, SignedKey>, SignatureError> {
        keys.into_iter()
            .map(|(key_id, key)| {
                let mut key =
                    if fallback { SignedKey::new_fallback(key) } else { SignedKey::new(key) };
                let signature = self.sign_json(&key.to_json()?)?;
                key.signatures.add_signature(
                    self.user_id.clone(),
                    ed25519_key_id(self.device_id.as_str()),
                    signature,
                );

                Ok((key_id, key))
            })
            .collect()
    }

    /// Create a new outbound session with another account given its identity
    /// key and one of its one-time keys.
    pub fn create_outbound_session(
        &self,
        identity_key: Curve25519PublicKey,
        one_time_key: Curve25519PublicKey,
        fallback_used: bool,
    ) -> Session {
        let session =
            self.inner.create_outbound_session(SessionConfig::version_1(), identity_key, one_time_key);

        Session::new(session, identity_key, fallback_used)
    }

    /// Create a new session with another account given a pre-key Olm message.
    ///
    /// The one-time key the message was encrypted for is removed from the
    /// account. Returns the session and the decrypted plaintext.
    pub fn create_inbound_session(
        &mut self,
        their_identity_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<(Session, String), SessionCreationError> {
        trace!(session_id = message.session_id(), "Creating a new Olm session from a pre-key message");

        let result = self.inner.create_inbound_session(their_identity_key, message)?;
        let session = Session::new(result.session, their_identity_key, false);
        let plaintext = String::from_utf8_lossy(&result.plaintext).into_owned();

        Ok((session, plaintext))
    }

    /// Get a serializable version of the `Account` so it can be persisted.
    ///
    /// The Olm state is encrypted with the given pickle key.
    pub fn pickle(&self, pickle_key: &[u8; 32]) -> PickledAccount {
        PickledAccount {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            pickle: self.inner.pickle().encrypt(pickle_key),
            shared: self.shared,
            uploaded_signed_key_count: self.uploaded_signed_key_count,
            creation_local_time: self.creation_local_time,
            fallback_key_creation_timestamp: self.fallback_creation_timestamp,
        }
    }

    /// Restore an account from a previously pickled one.
    pub fn from_pickle(pickle: &PickledAccount, pickle_key: &[u8; 32]) -> Result<Self, PickleError> {
        let inner = InnerAccount::from_pickle(AccountPickle::from_encrypted(&pickle.pickle, pickle_key)?);
        let identity_keys = inner.identity_keys();

        Ok(Self {
            user_id: pickle.user_id.clone(),
            device_id: pickle.device_id.clone(),
            inner: Box::new(inner),
            identity_keys,
            shared: pickle.shared,
            uploaded_signed_key_count: pickle.uploaded_signed_key_count,
            creation_local_time: pickle.creation_local_time,
            fallback_creation_timestamp: pickle.fallback_key_creation_timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ruma::{device_id, user_id};

    use super::Account;
    use crate::utilities::verify_json;

    const PICKLE_KEY: [u8; 32] = [1u8; 32];

    fn account() -> Account {
        Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"))
    }

    #[test]
    fn device_keys_are_self_signed() {
        let account = account();
        let device_keys = account.device_keys().unwrap();

        device_keys.check_self_signature().unwrap();
        assert_eq!(device_keys.curve25519_key(), Some(account.identity_keys().curve25519));
    }

    #[test]
    fn one_time_keys_are_signed_and_published() {
        let mut account = account();
        assert!(account.one_time_keys().is_empty());

        assert_eq!(account.generate_one_time_keys(5), 5);
        let keys = account.signed_one_time_keys().unwrap();
        assert_eq!(keys.len(), 5);

        let (key_id, key) = keys.iter().next().unwrap();
        assert!(key_id.starts_with("signed_curve25519:"));
        verify_json(
            account.user_id(),
            "ed25519:ALICEDEVICE",
            &account.identity_keys().ed25519,
            &key.to_json().unwrap(),
        )
        .unwrap();

        account.mark_keys_as_published();
        assert!(account.one_time_keys().is_empty());
    }

    #[test]
    fn fallback_key_expiry() {
        let mut account = account();
        assert!(account.fallback_key_expired(Duration::from_secs(60)));

        account.generate_fallback_key();
        assert!(!account.fallback_key_expired(Duration::from_secs(60)));
        assert!(account.fallback_key_expired(Duration::ZERO) || !account.fallback_key().is_empty());

        let fallback = account.signed_fallback_keys().unwrap();
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback.values().next().unwrap().fallback, Some(true));
    }

    #[test]
    fn pickle_cycle() {
        let mut account = account();
        account.mark_as_shared();
        account.update_uploaded_key_count(42);

        let pickle = account.pickle(&PICKLE_KEY);
        let unpickled = Account::from_pickle(&pickle, &PICKLE_KEY).unwrap();

        assert_eq!(account.identity_keys(), unpickled.identity_keys());
        assert!(unpickled.shared());
        assert_eq!(unpickled.uploaded_key_count(), 42);

        assert!(Account::from_pickle(&pickle, &[2u8; 32]).is_err());
    }
}
