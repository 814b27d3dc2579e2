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

//! Secret storage.
//!
//! Secrets are encrypted with AES-CTR-256 and HMAC-SHA-256 and kept in the
//! global account data of our user, under the name of the secret. A secret
//! can be encrypted under several secret storage keys at once, the
//! description of each key lives in the `m.secret_storage.key.<key id>`
//! account data event.
//!
//! The keys themselves never leave the device, the application hands them
//! to us through [`CryptoCallbacks::get_secret_storage_key()`].
//!
//! Secrets can also be shared between our own devices over to-device
//! messages, see [`SecretSharing`].

mod sharing;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use rand::{thread_rng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

pub use self::sharing::{OutgoingSecretRequest, SecretSharing};
use crate::{
    backups::BackupDecryptionKey,
    callbacks::CryptoCallbacks,
    ciphers::{calculate_key_check, verify_key_check, AesHmacSha2Error, AesHmacSha2Key},
    error::SecretStorageError,
    requests::CryptoTransport,
    types::AesHmacSha2EncryptedData,
    utilities::random_string,
};

/// The only secret storage algorithm we support.
pub const SECRET_STORAGE_ALGORITHM: &str = "m.secret_storage.v1.aes-hmac-sha2";

/// The algorithm used to derive keys from passphrases.
pub const PBKDF2_ALGORITHM: &str = "m.pbkdf2";

/// The account data event holding the id of the default key.
pub const DEFAULT_KEY_EVENT_TYPE: &str = "m.secret_storage.default_key";

const DEFAULT_PBKDF2_ITERATIONS: u32 = 500_000;

type Result<T, E = SecretStorageError> = std::result::Result<T, E>;

/// The account data event type holding the description of a key.
pub fn key_event_type(key_id: &str) -> String {
    format!("m.secret_storage.key.{key_id}")
}

/// How a secret storage key is derived from a passphrase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassphraseInfo {
    /// The key derivation algorithm, `m.pbkdf2`.
    pub algorithm: String,
    /// The salt of the derivation.
    pub salt: String,
    /// The number of PBKDF2 rounds.
    pub iterations: u32,
    /// The length of the derived key in bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bits: Option<u32>,
}

/// The description of a secret storage key, as stored in account data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretStorageKeyDescription {
    /// A human readable name of the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The encryption algorithm of the key.
    pub algorithm: String,
    /// Set if the key is derived from a passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<PassphraseInfo>,
    /// The initialization vector of the key-check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    /// The MAC of the key-check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

impl SecretStorageKeyDescription {
    /// Is the algorithm of the key one we support.
    pub fn is_supported(&self) -> bool {
        self.algorithm == SECRET_STORAGE_ALGORITHM
    }

    /// Does the description carry a key-check.
    pub fn has_key_check(&self) -> bool {
        self.iv.is_some() && self.mac.is_some()
    }

    /// Check if the given key is the key this description is for.
    ///
    /// Keys without a key-check can't be checked and are accepted.
    pub fn check_key(&self, key: &[u8; 32]) -> bool {
        match (&self.iv, &self.mac) {
            (Some(iv), Some(mac)) => verify_key_check(key, iv, mac),
            _ => true,
        }
    }

    /// Derive the key from the given passphrase, if the key is passphrase
    /// based.
    pub fn key_from_passphrase(&self, passphrase: &str) -> Option<Zeroizing<[u8; 32]>> {
        let info = self.passphrase.as_ref().filter(|p| p.algorithm == PBKDF2_ALGORITHM)?;
        let key = AesHmacSha2Key::passphrase_to_key(passphrase, &info.salt, info.iterations);

        Some(Zeroizing::new(**key))
    }
}

/// Options for [`SecretStorage::add_key()`].
#[derive(Default)]
pub struct AddKeyOptions {
    /// A human readable name for the key.
    pub name: Option<String>,
    /// Derive the key from this passphrase.
    pub passphrase: Option<String>,
    /// The number of PBKDF2 rounds for passphrase derivation.
    pub iterations: Option<u32>,
    /// Use this key instead of generating a random one.
    pub key: Option<Zeroizing<[u8; 32]>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for AddKeyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddKeyOptions")
            .field("name", &self.name)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "*****"))
            .field("iterations", &self.iterations)
            .field("key", &self.key.as_ref().map(|_| "*****"))
            .finish()
    }
}

/// A freshly added secret storage key.
pub struct NewSecretStorageKey {
    /// The id of the key.
    pub key_id: String,
    /// The description that was stored in account data.
    pub description: SecretStorageKeyDescription,
    key: Zeroizing<[u8; 32]>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for NewSecretStorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewSecretStorageKey")
            .field("key_id", &self.key_id)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl NewSecretStorageKey {
    /// The raw key.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// The key encoded the way recovery keys are shown to users.
    pub fn to_base58(&self) -> String {
        BackupDecryptionKey::from_bytes(&self.key).to_base58()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EncryptedSecret {
    #[serde(default)]
    encrypted: BTreeMap<String, AesHmacSha2EncryptedData>,
}

/// Access to the secrets in the account data of our user.
#[derive(Clone)]
pub struct SecretStorage {
    transport: Arc<dyn CryptoTransport>,
    callbacks: Arc<dyn CryptoCallbacks>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SecretStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStorage").field("callbacks", &self.callbacks).finish_non_exhaustive()
    }
}

impl SecretStorage {
    /// Create a new `SecretStorage` on top of the given transport.
    pub fn new(transport: Arc<dyn CryptoTransport>, callbacks: Arc<dyn CryptoCallbacks>) -> Self {
        Self { transport, callbacks }
    }

    /// Add a new secret storage key.
    ///
    /// Only the description of the key is stored, the key itself is returned
    /// and it's up to the caller to keep it somewhere safe.
    ///
    /// # Arguments
    ///
    /// * `options` - Where the key comes from, a random key is generated if
    ///   neither a passphrase nor a key is given.
    ///
    /// * `key_id` - The id of the new key, a random id is used if none is
    ///   given.
    #[instrument(skip(self, options))]
    pub async fn add_key(
        &self,
        options: AddKeyOptions,
        key_id: Option<&str>,
    ) -> Result<NewSecretStorageKey> {
        let key_id = key_id.map(ToOwned::to_owned).unwrap_or_else(|| random_string(32));

        if self.get_key(&key_id).await?.is_some() {
            return Err(SecretStorageError::KeyExists(key_id));
        }

        let (key, passphrase) = match (options.key, options.passphrase) {
            (Some(key), _) => (key, None),
            (None, Some(passphrase)) => {
                let info = PassphraseInfo {
                    algorithm: PBKDF2_ALGORITHM.to_owned(),
                    salt: random_string(32),
                    iterations: options.iterations.unwrap_or(DEFAULT_PBKDF2_ITERATIONS),
                    bits: Some(256),
                };
                let key =
                    AesHmacSha2Key::passphrase_to_key(&passphrase, &info.salt, info.iterations);

                (Zeroizing::new(**key), Some(info))
            }
            (None, None) => {
                let mut key = Zeroizing::new([0u8; 32]);
                thread_rng().fill_bytes(key.as_mut_slice());

                (key, None)
            }
        };

        let (iv, mac) = calculate_key_check(&key);

        let description = SecretStorageKeyDescription {
            name: options.name,
            algorithm: SECRET_STORAGE_ALGORITHM.to_owned(),
            passphrase,
            iv: Some(iv),
            mac: Some(mac),
        };

        self.transport
            .set_account_data(&key_event_type(&key_id), serde_json::to_value(&description)?)
            .await?;

        debug!(key_id, "Added a new secret storage key");

        Ok(NewSecretStorageKey { key_id, description, key })
    }

    /// Get the description of the key with the given id.
    pub async fn get_key(&self, key_id: &str) -> Result<Option<SecretStorageKeyDescription>> {
        let event_type = key_event_type(key_id);

        match self.transport.get_account_data(&event_type).await? {
            Some(content) => Ok(Some(
                serde_json::from_value(content)
                    .map_err(|_| SecretStorageError::Malformed(event_type))?,
            )),
            None => Ok(None),
        }
    }

    /// Does the key with the given id exist, or the default key if no id is
    /// given.
    pub async fn has_key(&self, key_id: Option<&str>) -> Result<bool> {
        let key_id = match key_id {
            Some(key_id) => key_id.to_owned(),
            None => match self.default_key_id().await? {
                Some(key_id) => key_id,
                None => return Ok(false),
            },
        };

        Ok(self.get_key(&key_id).await?.is_some())
    }

    /// Get the id of the default key.
    pub async fn default_key_id(&self) -> Result<Option<String>> {
        Ok(self
            .transport
            .get_account_data(DEFAULT_KEY_EVENT_TYPE)
            .await?
            .and_then(|c| c.get("key").and_then(|k| k.as_str()).map(ToOwned::to_owned)))
    }

    /// Make the key with the given id the default key.
    pub async fn set_default_key_id(&self, key_id: &str) -> Result<()> {
        if self.get_key(key_id).await?.is_none() {
            return Err(SecretStorageError::UnknownKey(key_id.to_owned()));
        }

        self.transport.set_account_data(DEFAULT_KEY_EVENT_TYPE, json!({ "key": key_id })).await?;

        Ok(())
    }

    /// Check if the given key belongs to the key description with the given
    /// id.
    pub async fn check_key(&self, key_id: &str, key: &[u8; 32]) -> Result<bool> {
        let description = self
            .get_key(key_id)
            .await?
            .ok_or_else(|| SecretStorageError::UnknownKey(key_id.to_owned()))?;

        Ok(description.is_supported() && description.check_key(key))
    }

    /// Encrypt a secret and store it in account data.
    ///
    /// The secret is encrypted separately under each of the given keys, or
    /// under the default key if none are given. The application is asked for
    /// each key through the `get_secret_storage_key` callback.
    #[instrument(skip(self, secret))]
    pub async fn store(&self, name: &str, secret: &str, key_ids: Option<&[String]>) -> Result<()> {
        let key_ids = match key_ids {
            Some(key_ids) => key_ids.to_vec(),
            None => vec![self.default_key_id().await?.ok_or(SecretStorageError::NoDefaultKey)?],
        };

        let mut encrypted = BTreeMap::new();

        for key_id in key_ids {
            let description = self
                .get_key(&key_id)
                .await?
                .ok_or_else(|| SecretStorageError::UnknownKey(key_id.clone()))?;

            if !description.is_supported() {
                return Err(SecretStorageError::UnsupportedAlgorithm(description.algorithm));
            }

            let key = match self
                .callbacks
                .get_secret_storage_key(std::slice::from_ref(&key_id), name)
                .await?
            {
                Some((returned_id, key)) if returned_id == key_id => key,
                _ => return Err(SecretStorageError::NoUsableKey(name.to_owned())),
            };

            if !description.check_key(&key) {
                return Err(SecretStorageError::KeyCheckFailed(name.to_owned()));
            }

            let data = AesHmacSha2Key::from_secret_key(&key, name).encrypt_to_data(secret.as_bytes());
            encrypted.insert(key_id, data);
        }

        self.transport
            .set_account_data(name, serde_json::to_value(EncryptedSecret { encrypted })?)
            .await?;

        Ok(())
    }

    async fn encrypted_secret(&self, name: &str) -> Result<Option<EncryptedSecret>> {
        match self.transport.get_account_data(name).await? {
            Some(content) => Ok(Some(
                serde_json::from_value(content)
                    .map_err(|_| SecretStorageError::Malformed(name.to_owned()))?,
            )),
            None => Ok(None),
        }
    }

    /// The descriptions of the keys the secret is encrypted under that we
    /// are able to use.
    async fn supported_keys(
        &self,
        secret: &EncryptedSecret,
    ) -> Result<BTreeMap<String, SecretStorageKeyDescription>> {
        let mut keys = BTreeMap::new();

        for key_id in secret.encrypted.keys() {
            match self.get_key(key_id).await? {
                Some(description) if description.is_supported() => {
                    keys.insert(key_id.clone(), description);
                }
                Some(description) => {
                    debug!(key_id, algorithm = description.algorithm, "Unsupported secret storage key")
                }
                None => debug!(key_id, "A secret is encrypted under an unknown key"),
            }
        }

        Ok(keys)
    }

    /// Get and decrypt a secret from account data.
    ///
    /// The application picks one of the keys the secret is encrypted under
    /// through the `get_secret_storage_key` callback.
    #[instrument(skip(self))]
    pub async fn get(&self, name: &str) -> Result<String> {
        let secret = self
            .encrypted_secret(name)
            .await?
            .ok_or_else(|| SecretStorageError::MissingSecret(name.to_owned()))?;

        let keys = self.supported_keys(&secret).await?;

        if keys.is_empty() {
            return Err(SecretStorageError::NoUsableKey(name.to_owned()));
        }

        let key_ids: Vec<_> = keys.keys().cloned().collect();

        let (key_id, key) = self
            .callbacks
            .get_secret_storage_key(&key_ids, name)
            .await?
            .ok_or_else(|| SecretStorageError::NoUsableKey(name.to_owned()))?;

        let (Some(description), Some(data)) = (keys.get(&key_id), secret.encrypted.get(&key_id))
        else {
            warn!(key_id, "The application returned a key we didn't ask for");
            return Err(SecretStorageError::NoUsableKey(name.to_owned()));
        };

        if !description.check_key(&key) {
            return Err(SecretStorageError::KeyCheckFailed(name.to_owned()));
        }

        self.callbacks.cache_secret_storage_key(&key_id, description, &key).await;

        let plaintext = Zeroizing::new(
            AesHmacSha2Key::from_secret_key(&key, name).decrypt_data(data).map_err(|e| match e {
                AesHmacSha2Error::Mac(_) => SecretStorageError::MacMismatch(name.to_owned()),
                AesHmacSha2Error::Base64(e) => SecretStorageError::Base64(e),
                AesHmacSha2Error::InvalidLength => SecretStorageError::Malformed(name.to_owned()),
            })?,
        );

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| SecretStorageError::Malformed(name.to_owned()))
    }

    /// Get the ids of the keys that protect the given secret.
    ///
    /// Only trusted keys are reported: keys whose description exists in
    /// account data, uses a supported algorithm and carries a key-check.
    /// An empty set means the secret isn't stored, or not under a key we
    /// would rely on.
    pub async fn is_stored(&self, name: &str) -> Result<BTreeSet<String>> {
        let Some(secret) = self.encrypted_secret(name).await? else {
            return Ok(BTreeSet::new());
        };

        Ok(self
            .supported_keys(&secret)
            .await?
            .into_iter()
            .filter(|(_, description)| description.has_key_check())
            .map(|(key_id, _)| key_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches2::assert_matches;
    use serde_json::json;
    use zeroize::Zeroizing;

    use super::{key_event_type, AddKeyOptions, SecretStorage, SECRET_STORAGE_ALGORITHM};
    use crate::{
        error::SecretStorageError,
        testing::{MockTransport, TestCallbacks},
    };

    fn secret_storage() -> (SecretStorage, Arc<MockTransport>, Arc<TestCallbacks>) {
        let transport = Arc::new(MockTransport::new());
        let callbacks = Arc::new(TestCallbacks::default());

        (SecretStorage::new(transport.clone(), callbacks.clone()), transport, callbacks)
    }

    #[tokio::test]
    async fn store_and_get() -> anyhow::Result<()> {
        let (storage, transport, callbacks) = secret_storage();

        let new_key = storage.add_key(AddKeyOptions::default(), Some("key")).await?;
        storage.set_default_key_id("key").await?;
        callbacks.add_secret_storage_key("key", *new_key.key());

        storage.store("m.cross_signing.master", "It's a secret to everybody", None).await?;

        let stored = transport.account_data.lock().unwrap()["m.cross_signing.master"].clone();
        assert!(stored["encrypted"]["key"]["ciphertext"].is_string());
        assert!(!stored.to_string().contains("It's a secret"));

        assert_eq!(storage.get("m.cross_signing.master").await?, "It's a secret to everybody");
        assert_eq!(*callbacks.cached_secret_storage_keys.lock().unwrap(), vec!["key".to_owned()]);

        Ok(())
    }

    #[tokio::test]
    async fn adding_an_existing_key_fails() {
        let (storage, ..) = secret_storage();

        storage.add_key(AddKeyOptions::default(), Some("key")).await.unwrap();
        assert_matches!(
            storage.add_key(AddKeyOptions::default(), Some("key")).await,
            Err(SecretStorageError::KeyExists(_))
        );
    }

    #[tokio::test]
    async fn passphrase_keys_can_be_rederived() {
        let (storage, ..) = secret_storage();

        let options = AddKeyOptions {
            passphrase: Some("correct horse battery staple".to_owned()),
            iterations: Some(10),
            ..Default::default()
        };
        let new_key = storage.add_key(options, None).await.unwrap();

        let description = storage.get_key(&new_key.key_id).await.unwrap().unwrap();
        assert_eq!(description.algorithm, SECRET_STORAGE_ALGORITHM);
        assert_eq!(description.passphrase.as_ref().unwrap().iterations, 10);

        let derived = description.key_from_passphrase("correct horse battery staple").unwrap();
        assert_eq!(*derived, *new_key.key());
        assert!(storage.check_key(&new_key.key_id, &derived).await.unwrap());

        let wrong = description.key_from_passphrase("incorrect horse").unwrap();
        assert!(!storage.check_key(&new_key.key_id, &wrong).await.unwrap());
    }

    #[tokio::test]
    async fn secrets_fan_out_to_every_key() {
        let (storage, _, callbacks) = secret_storage();

        let first = storage.add_key(AddKeyOptions::default(), Some("first")).await.unwrap();
        let second = storage.add_key(AddKeyOptions::default(), Some("second")).await.unwrap();
        callbacks.add_secret_storage_key("first", *first.key());
        callbacks.add_secret_storage_key("second", *second.key());

        let key_ids = vec!["first".to_owned(), "second".to_owned()];
        storage.store("m.megolm_backup.v1", "backup key", Some(&key_ids)).await.unwrap();

        // Forget the first key, the second one still opens the secret.
        callbacks.secret_storage_keys.lock().unwrap().remove("first");
        assert_eq!(storage.get("m.megolm_backup.v1").await.unwrap(), "backup key");

        let stored = storage.is_stored("m.megolm_backup.v1").await.unwrap();
        assert_eq!(stored.into_iter().collect::<Vec<_>>(), key_ids);
    }

    #[tokio::test]
    async fn wrong_keys_are_rejected() {
        let (storage, _, callbacks) = secret_storage();

        let key = storage.add_key(AddKeyOptions::default(), Some("key")).await.unwrap();
        storage.set_default_key_id("key").await.unwrap();
        callbacks.add_secret_storage_key("key", *key.key());
        storage.store("secret", "value", None).await.unwrap();

        callbacks.add_secret_storage_key("key", [0u8; 32]);
        assert_matches!(storage.get("secret").await, Err(SecretStorageError::KeyCheckFailed(_)));
        assert_matches!(
            storage.store("secret", "value", None).await,
            Err(SecretStorageError::KeyCheckFailed(_))
        );
    }

    #[tokio::test]
    async fn tampered_secrets_fail_the_mac_check() {
        let (storage, transport, callbacks) = secret_storage();

        let key = storage.add_key(AddKeyOptions::default(), Some("key")).await.unwrap();
        storage.set_default_key_id("key").await.unwrap();
        callbacks.add_secret_storage_key("key", *key.key());
        storage.store("secret", "value", None).await.unwrap();

        {
            let mut account_data = transport.account_data.lock().unwrap();
            let secret = account_data.get_mut("secret").unwrap();
            secret["encrypted"]["key"]["ciphertext"] = json!("AAAAAA");
        }

        assert_matches!(storage.get("secret").await, Err(SecretStorageError::MacMismatch(_)));
    }

    #[tokio::test]
    async fn missing_secrets_and_default_keys() {
        let (storage, ..) = secret_storage();

        assert_matches!(storage.get("nothing").await, Err(SecretStorageError::MissingSecret(_)));
        assert_matches!(
            storage.store("nothing", "value", None).await,
            Err(SecretStorageError::NoDefaultKey)
        );
        assert_matches!(
            storage.set_default_key_id("unknown").await,
            Err(SecretStorageError::UnknownKey(_))
        );
        assert!(!storage.has_key(None).await.unwrap());
        assert!(storage.is_stored("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keys_without_a_key_check_are_not_trusted() {
        let (storage, transport, callbacks) = secret_storage();

        let key = Zeroizing::new([9u8; 32]);
        let trusted = storage
            .add_key(AddKeyOptions { key: Some(key.clone()), ..Default::default() }, Some("good"))
            .await
            .unwrap();
        callbacks.add_secret_storage_key("good", *trusted.key());

        // A key that somebody added without a key-check, and one that uses an
        // algorithm we don't know.
        transport.account_data.lock().unwrap().extend([
            (key_event_type("unchecked"), json!({ "algorithm": SECRET_STORAGE_ALGORITHM })),
            (key_event_type("unknown"), json!({ "algorithm": "m.secret_storage.v2" })),
        ]);
        callbacks.add_secret_storage_key("unchecked", [1u8; 32]);

        let key_ids = vec!["good".to_owned(), "unchecked".to_owned()];
        storage.store("secret", "value", Some(&key_ids)).await.unwrap();

        {
            let mut account_data = transport.account_data.lock().unwrap();
            let secret = account_data.get_mut("secret").unwrap();
            let good = secret["encrypted"]["good"].clone();
            secret["encrypted"]["unknown"] = good;
        }

        let stored = storage.is_stored("secret").await.unwrap();
        assert_eq!(stored.into_iter().collect::<Vec<_>>(), vec!["good".to_owned()]);
    }
}
