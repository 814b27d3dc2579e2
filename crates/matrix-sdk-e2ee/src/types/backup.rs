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

//! Types of the server-side room key backup.

use std::collections::BTreeMap;

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Signatures;
use crate::algorithms::EventEncryptionAlgorithm;

/// Auth data for the `m.megolm_backup.v1.curve25519-aes-sha2` backup
/// algorithm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MegolmV1AuthData {
    /// The Curve25519 public key used to encrypt the backups, base64 encoded.
    pub public_key: String,
    /// Signatures of the auth_data, as Signed JSON.
    #[serde(default)]
    pub signatures: Signatures,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl MegolmV1AuthData {
    pub(crate) fn new(public_key: String, signatures: Signatures) -> Self {
        Self { public_key, signatures, extra: Default::default() }
    }
}

/// Auth data for the symmetric AES-HMAC-SHA2 backup algorithm.
///
/// The `iv` and `mac` fields are the key-check of the backup key, the
/// encryption of 32 zero bytes under the key with an empty name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AesHmacSha2AuthData {
    /// The initialization vector of the key-check.
    pub iv: String,
    /// The MAC of the key-check.
    pub mac: String,
    /// Signatures of the auth_data, as Signed JSON.
    #[serde(default)]
    pub signatures: Signatures,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl AesHmacSha2AuthData {
    pub(crate) fn new(iv: String, mac: String, signatures: Signatures) -> Self {
        Self { iv, mac, signatures, extra: Default::default() }
    }
}

/// Information pertaining to a room key backup version.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "BackupInfoHelper")]
pub enum RoomKeyBackupInfo {
    /// The `m.megolm_backup.v1.curve25519-aes-sha2` variant of a backup.
    MegolmBackupV1Curve25519AesSha2(MegolmV1AuthData),
    /// The symmetric AES-HMAC-SHA2 variant of a backup.
    MegolmBackupV1AesHmacSha2(AesHmacSha2AuthData),
    /// Any other unknown backup variant.
    Other {
        /// The algorithm of the unknown backup variant.
        algorithm: String,
        /// The auth data of the unknown backup variant.
        auth_data: BTreeMap<String, Value>,
    },
}

impl RoomKeyBackupInfo {
    /// The algorithm of the backup.
    pub fn algorithm(&self) -> EventEncryptionAlgorithm {
        match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(_) => {
                EventEncryptionAlgorithm::MegolmBackupV1Curve25519AesSha2
            }
            RoomKeyBackupInfo::MegolmBackupV1AesHmacSha2(_) => {
                EventEncryptionAlgorithm::MegolmBackupV1AesHmacSha2
            }
            RoomKeyBackupInfo::Other { algorithm, .. } => algorithm.as_str().into(),
        }
    }

    /// The auth data as a JSON object, this is the object the signatures are
    /// made over.
    pub fn auth_data_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(d) => serde_json::to_value(d),
            RoomKeyBackupInfo::MegolmBackupV1AesHmacSha2(d) => serde_json::to_value(d),
            RoomKeyBackupInfo::Other { auth_data, .. } => serde_json::to_value(auth_data),
        }
    }

    /// The signatures of the auth data.
    pub fn signatures(&self) -> Signatures {
        match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(d) => d.signatures.clone(),
            RoomKeyBackupInfo::MegolmBackupV1AesHmacSha2(d) => d.signatures.clone(),
            RoomKeyBackupInfo::Other { auth_data, .. } => auth_data
                .get("signatures")
                .and_then(|s| serde_json::from_value(s.clone()).ok())
                .unwrap_or_default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BackupInfoHelper {
    algorithm: String,
    auth_data: Value,
}

impl TryFrom<BackupInfoHelper> for RoomKeyBackupInfo {
    type Error = serde_json::Error;

    fn try_from(value: BackupInfoHelper) -> Result<Self, Self::Error> {
        Ok(match EventEncryptionAlgorithm::from(value.algorithm.as_str()) {
            EventEncryptionAlgorithm::MegolmBackupV1Curve25519AesSha2 => {
                RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(serde_json::from_value(
                    value.auth_data,
                )?)
            }
            EventEncryptionAlgorithm::MegolmBackupV1AesHmacSha2 => {
                RoomKeyBackupInfo::MegolmBackupV1AesHmacSha2(serde_json::from_value(
                    value.auth_data,
                )?)
            }
            _ => RoomKeyBackupInfo::Other {
                algorithm: value.algorithm,
                auth_data: serde_json::from_value(value.auth_data)?,
            },
        })
    }
}

impl Serialize for RoomKeyBackupInfo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let helper = BackupInfoHelper {
            algorithm: self.algorithm().to_string(),
            auth_data: self.auth_data_json().map_err(serde::ser::Error::custom)?,
        };

        helper.serialize(serializer)
    }
}

/// A backup version as returned by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBackupVersion {
    /// The algorithm and auth data of the backup.
    #[serde(flatten)]
    pub info: RoomKeyBackupInfo,
    /// The version string of the backup.
    pub version: String,
    /// The number of keys in the backup.
    #[serde(default)]
    pub count: u64,
    /// An opaque string that changes when the keys in the backup change.
    #[serde(default)]
    pub etag: String,
}

/// The encrypted form of a backed up session.
///
/// The Curve25519 algorithm sets `ephemeral`, the symmetric one sets `iv`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSessionData {
    /// The Curve25519 ephemeral key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<String>,
    /// The initialization vector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    /// The ciphertext.
    pub ciphertext: String,
    /// The MAC.
    pub mac: String,
}

/// A single backed up session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBackupData {
    /// The index of the first message in the session that the key can
    /// decrypt.
    pub first_message_index: u32,
    /// The number of times this key has been forwarded.
    pub forwarded_count: u32,
    /// Whether the device backing up the key verified the device that the
    /// key is from.
    pub is_verified: bool,
    /// The encrypted session.
    pub session_data: EncryptedSessionData,
}

/// The backed up sessions of a room.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyBackup {
    /// The sessions, keyed by session id.
    pub sessions: BTreeMap<String, KeyBackupData>,
}

/// The body of a backup upload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeysUpload {
    /// The sessions, keyed by room id.
    pub rooms: BTreeMap<OwnedRoomId, RoomKeyBackup>,
}

impl RoomKeysUpload {
    /// The number of sessions in the upload.
    pub fn session_count(&self) -> usize {
        self.rooms.values().map(|r| r.sessions.len()).sum()
    }
}

/// The plaintext of a backed up session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackedUpRoomKey {
    /// The encryption algorithm of the session.
    pub algorithm: EventEncryptionAlgorithm,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The exported session key.
    pub session_key: String,
    /// The keys that the creator of the session claims to own.
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// The chain of Curve25519 keys the session was forwarded through.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use serde_json::json;

    use super::{KeyBackupVersion, RoomKeyBackupInfo};
    use crate::algorithms::EventEncryptionAlgorithm;

    #[test]
    fn serialization() {
        let json = json!({
            "algorithm": "m.megolm_backup.v2",
            "auth_data": {
                "some": "data"
            }
        });

        let deserialized: RoomKeyBackupInfo = serde_json::from_value(json.clone()).unwrap();
        assert_matches!(&deserialized, RoomKeyBackupInfo::Other { .. });

        let serialized = serde_json::to_value(deserialized).unwrap();
        assert_eq!(json, serialized);

        let json = json!({
            "algorithm": "m.megolm_backup.v1.curve25519-aes-sha2",
            "auth_data": {
                "public_key":"XjhWTCjW7l59pbfx9tlCBQolfnIQWARoKOzjTOPSlWM",
                "signatures": {
                    "@alice:example.org": {
                        "ed25519:deviceid": "signature"
                    }
                }
            }
        });

        let deserialized: RoomKeyBackupInfo = serde_json::from_value(json.clone()).unwrap();
        assert_matches!(&deserialized, RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(_));

        let serialized = serde_json::to_value(deserialized).unwrap();
        assert_eq!(json, serialized);
    }

    #[test]
    fn backup_version_flattens_info() {
        let json = json!({
            "algorithm": "org.matrix.msc3270.v1.aes-hmac-sha2",
            "auth_data": { "iv": "IV", "mac": "MAC" },
            "version": "3",
            "count": 12,
            "etag": "abc",
        });

        let version: KeyBackupVersion = serde_json::from_value(json).unwrap();
        assert_eq!(version.version, "3");
        assert_eq!(version.info.algorithm(), EventEncryptionAlgorithm::MegolmBackupV1AesHmacSha2);
    }
}
