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

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs of the end-to-end encryption core.
///
/// Every duration is (de)serialized as a number of milliseconds, missing
/// fields fall back to their default value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct E2eeConfig {
    /// How many users are put into a single `/keys/query` request.
    pub device_list_chunk_size: usize,
    /// The default delay of a debounced device list save.
    #[serde(with = "duration_ms")]
    pub device_list_save_delay: Duration,
    /// Should devices that are signed by a verified user's self-signing key
    /// be considered verified.
    pub trust_cross_signed_devices: bool,
    /// How far in the future a verification request timestamp may be before
    /// the request is ignored.
    #[serde(with = "duration_ms")]
    pub clock_skew_leniency: Duration,
    /// The age after which an unused fallback key is forgotten.
    #[serde(with = "duration_ms")]
    pub fallback_key_max_age: Duration,
    /// The timeout that is sent with one-time key claims.
    #[serde(with = "duration_ms")]
    pub one_time_key_claim_timeout: Duration,
    /// How many sessions are loaded from the store per backup iteration.
    pub key_backup_keys_per_request: usize,
    /// How many sessions are put into a single backup upload.
    pub key_backup_upload_chunk_size: usize,
    /// How many consecutive upload failures are tolerated before the backup
    /// loop gives up.
    pub key_backup_max_retries: u32,
    /// The minimal time between two backup queries for the same session.
    #[serde(with = "duration_ms")]
    pub key_backup_check_rate_limit: Duration,
    /// How long a verification request stays valid.
    #[serde(with = "duration_ms")]
    pub verification_request_timeout: Duration,
    /// How long a verification waits for the next event of the other side.
    #[serde(with = "duration_ms")]
    pub verification_event_timeout: Duration,
    /// How long a secret request waits for a reply.
    #[serde(with = "duration_ms")]
    pub secret_request_timeout: Duration,
}

impl Default for E2eeConfig {
    fn default() -> Self {
        Self {
            device_list_chunk_size: 250,
            device_list_save_delay: Duration::ZERO,
            trust_cross_signed_devices: true,
            clock_skew_leniency: Duration::from_secs(6 * 60),
            fallback_key_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            one_time_key_claim_timeout: Duration::from_secs(10),
            key_backup_keys_per_request: 200,
            key_backup_upload_chunk_size: 50,
            key_backup_max_retries: 5,
            key_backup_check_rate_limit: Duration::from_secs(5),
            verification_request_timeout: Duration::from_secs(10 * 60),
            verification_event_timeout: Duration::from_secs(60),
            secret_request_timeout: Duration::from_secs(30),
        }
    }
}

impl E2eeConfig {
    /// Set the number of users per `/keys/query` request.
    pub fn with_device_list_chunk_size(mut self, size: usize) -> Self {
        self.device_list_chunk_size = size.max(1);
        self
    }

    /// Set the default delay of debounced device list saves.
    pub fn with_device_list_save_delay(mut self, delay: Duration) -> Self {
        self.device_list_save_delay = delay;
        self
    }

    /// Should cross-signed devices of verified users count as verified.
    pub fn with_trust_cross_signed_devices(mut self, trust: bool) -> Self {
        self.trust_cross_signed_devices = trust;
        self
    }

    /// Set the tolerated clock skew for incoming verification requests.
    pub fn with_clock_skew_leniency(mut self, leniency: Duration) -> Self {
        self.clock_skew_leniency = leniency;
        self
    }

    /// Set the maximal age of an unused fallback key.
    pub fn with_fallback_key_max_age(mut self, age: Duration) -> Self {
        self.fallback_key_max_age = age;
        self
    }

    /// Set the upload chunk size of the key backup.
    pub fn with_key_backup_upload_chunk_size(mut self, size: usize) -> Self {
        self.key_backup_upload_chunk_size = size.max(1);
        self
    }

    /// Set the number of sessions loaded per backup iteration.
    pub fn with_key_backup_keys_per_request(mut self, count: usize) -> Self {
        self.key_backup_keys_per_request = count.max(1);
        self
    }

    /// Set the number of retries of the backup loop.
    pub fn with_key_backup_max_retries(mut self, retries: u32) -> Self {
        self.key_backup_max_retries = retries;
        self
    }

    /// Set the rate limit of backup queries for a single session.
    pub fn with_key_backup_check_rate_limit(mut self, limit: Duration) -> Self {
        self.key_backup_check_rate_limit = limit;
        self
    }

    /// Set the lifetime of verification requests.
    pub fn with_verification_request_timeout(mut self, timeout: Duration) -> Self {
        self.verification_request_timeout = timeout;
        self
    }

    /// Set the time a verification waits for the other side.
    pub fn with_verification_event_timeout(mut self, timeout: Duration) -> Self {
        self.verification_event_timeout = timeout;
        self
    }

    /// Set the time a secret request waits for a reply.
    pub fn with_secret_request_timeout(mut self, timeout: Duration) -> Self {
        self.secret_request_timeout = timeout;
        self
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
