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

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The closed set of encryption algorithms this crate knows about.
///
/// Anything else is kept as [`EventEncryptionAlgorithm::Unknown`] so it
/// survives a round trip through storage.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventEncryptionAlgorithm {
    /// Olm version 1 using Curve25519, AES-256, and SHA-256.
    OlmV1Curve25519AesSha2,
    /// Megolm version 1 using AES-256 and SHA-256.
    MegolmV1AesSha2,
    /// Asymmetric key backup using Curve25519 and AES-256.
    MegolmBackupV1Curve25519AesSha2,
    /// Symmetric key backup using AES-256 and HMAC-SHA-256.
    MegolmBackupV1AesHmacSha2,
    /// An algorithm we don't support.
    Unknown(String),
}

impl EventEncryptionAlgorithm {
    /// The string form that is used on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            Self::OlmV1Curve25519AesSha2 => "m.olm.v1.curve25519-aes-sha2",
            Self::MegolmV1AesSha2 => "m.megolm.v1.aes-sha2",
            Self::MegolmBackupV1Curve25519AesSha2 => "m.megolm_backup.v1.curve25519-aes-sha2",
            Self::MegolmBackupV1AesHmacSha2 => "org.matrix.msc3270.v1.aes-hmac-sha2",
            Self::Unknown(s) => s,
        }
    }

    /// Can events be encrypted or decrypted with this algorithm.
    pub fn is_event_algorithm(&self) -> bool {
        matches!(self, Self::OlmV1Curve25519AesSha2 | Self::MegolmV1AesSha2)
    }

    /// Is this one of the key backup algorithms.
    pub fn is_backup_algorithm(&self) -> bool {
        matches!(self, Self::MegolmBackupV1Curve25519AesSha2 | Self::MegolmBackupV1AesHmacSha2)
    }
}

impl From<&str> for EventEncryptionAlgorithm {
    fn from(value: &str) -> Self {
        match value {
            "m.olm.v1.curve25519-aes-sha2" => Self::OlmV1Curve25519AesSha2,
            "m.megolm.v1.aes-sha2" => Self::MegolmV1AesSha2,
            "m.megolm_backup.v1.curve25519-aes-sha2" => Self::MegolmBackupV1Curve25519AesSha2,
            "org.matrix.msc3270.v1.aes-hmac-sha2" | "m.megolm_backup.v1.aes-hmac-sha2" => {
                Self::MegolmBackupV1AesHmacSha2
            }
            other => Self::Unknown(other.to_owned()),
        }
    }
}

impl fmt::Display for EventEncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventEncryptionAlgorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventEncryptionAlgorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.as_str().into())
    }
}
