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
    borrow::Borrow,
    collections::HashMap,
    hash::Hash,
    sync::{Arc, RwLock},
    time::Duration,
};

use rand::{distributions::Alphanumeric, thread_rng, Rng};
use ruma::{CanonicalJsonValue, UserId};
use serde_json::Value;
use tokio::time::Instant;
use vodozemac::{Ed25519PublicKey, Ed25519Signature};

use crate::error::SignatureError;

#[cfg(test)]
pub(crate) fn json_convert<T, U>(value: &T) -> serde_json::Result<U>
where
    T: serde::Serialize,
    U: serde::de::DeserializeOwned,
{
    let json = serde_json::to_string(value)?;
    serde_json::from_str(&json)
}

/// Convert a JSON object into the canonical form that gets signed.
///
/// The `signatures` and `unsigned` fields are not part of the signed data.
pub(crate) fn canonical_json_for_signing(json: &Value) -> Result<String, SignatureError> {
    let mut json = json.clone();
    let json_object = json.as_object_mut().ok_or(SignatureError::NotAnObject)?;
    json_object.remove("signatures");
    json_object.remove("unsigned");

    let canonical_json: CanonicalJsonValue = json.try_into()?;

    Ok(canonical_json.to_string())
}

/// Verify a signed JSON object.
///
/// The object must have a signatures key associated with an object of the
/// form `user_id: {key_id: signature}`.
///
/// # Arguments
///
/// * `user_id` - The user who signed the JSON object.
///
/// * `key_id` - The id of the key that signed the JSON object, for example
///   `ed25519:DEVICEID`.
///
/// * `signing_key` - The public ed25519 key which was used to sign the JSON
///   object.
///
/// * `json` - The JSON object that should be verified.
pub(crate) fn verify_json(
    user_id: &UserId,
    key_id: &str,
    signing_key: &Ed25519PublicKey,
    json: &Value,
) -> Result<(), SignatureError> {
    if !key_id.starts_with("ed25519:") {
        return Err(SignatureError::UnsupportedAlgorithm);
    }

    let signature = json
        .get("signatures")
        .and_then(|s| s.get(user_id.as_str()))
        .and_then(|s| s.get(key_id))
        .and_then(|s| s.as_str())
        .ok_or(SignatureError::NoSignatureFound)?;

    let signature =
        Ed25519Signature::from_base64(signature).map_err(|_| SignatureError::InvalidBase64)?;
    let canonical_json = canonical_json_for_signing(json)?;

    signing_key
        .verify(canonical_json.as_bytes(), &signature)
        .map_err(|_| SignatureError::VerificationError)
}

/// Generate a random alphanumeric string, used for key and request ids.
pub(crate) fn random_string(length: usize) -> String {
    thread_rng().sample_iter(&Alphanumeric).take(length).map(char::from).collect()
}

/// A TTL cache where items get inactive instead of discarded.
///
/// The items need to be explicitly removed from the cache. This allows us to
/// implement exponential backoff based TTL.
#[derive(Clone, Debug)]
pub(crate) struct FailuresCache<T: Eq + Hash> {
    inner: Arc<RwLock<HashMap<T, FailuresItem>>>,
}

#[derive(Debug, Clone, Copy)]
struct FailuresItem {
    insertion_time: Instant,
    duration: Duration,
    failure_count: u8,
}

impl FailuresItem {
    fn expired(&self) -> bool {
        self.insertion_time.elapsed() >= self.duration
    }
}

impl<T> FailuresCache<T>
where
    T: Eq + Hash,
{
    pub fn new() -> Self {
        Self { inner: Default::default() }
    }

    const MAX_DELAY: u64 = 15 * 60;
    const MULTIPLIER: u64 = 15;

    /// Is the given key non-expired and part of the cache.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let lock = self.inner.read().unwrap();
        lock.get(key).is_some_and(|item| !item.expired())
    }

    /// The exponential backoff sequence, in seconds: 15, 30, 60, ... capped
    /// at 15 minutes.
    pub fn calculate_delay(failure_count: u8) -> Duration {
        let exponential_backoff = 2u64.saturating_pow(failure_count.into());
        let delay = exponential_backoff.saturating_mul(Self::MULTIPLIER).clamp(1, Self::MAX_DELAY);

        Duration::from_secs(delay)
    }

    pub fn insert(&self, item: T) {
        self.extend([item]);
    }

    /// Extend the cache with the given iterator of items.
    ///
    /// Items that are already part of the cache, whether they are expired or
    /// not, will have their TTL extended using an exponential backoff
    /// algorithm.
    pub fn extend(&self, iterator: impl IntoIterator<Item = T>) {
        let mut lock = self.inner.write().unwrap();

        let now = Instant::now();

        for key in iterator {
            let failure_count = if let Some(value) = lock.get(&key) {
                value.failure_count.saturating_add(1)
            } else {
                0
            };

            let delay = Self::calculate_delay(failure_count);
            let item = FailuresItem { insertion_time: now, duration: delay, failure_count };

            lock.insert(key, item);
        }
    }

    pub fn remove<'a, I, Q>(&'a self, iterator: I)
    where
        I: Iterator<Item = &'a Q>,
        T: Borrow<Q>,
        Q: Hash + Eq + 'a + ?Sized,
    {
        let mut lock = self.inner.write().unwrap();

        for item in iterator {
            lock.remove(item);
        }
    }
}
