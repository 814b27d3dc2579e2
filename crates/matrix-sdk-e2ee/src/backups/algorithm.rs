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

use std::{collections::BTreeMap, fmt};

use ruma::RoomId;
use tracing::warn;
use vodozemac::{
    base64_decode, base64_encode,
    pk_encryption::{Message, PkEncryption},
    Curve25519PublicKey,
};
use zeroize::Zeroizing;

use super::BackupDecryptionKey;
use crate::{
    algorithms::EventEncryptionAlgorithm,
    ciphers::{calculate_key_check, verify_key_check, AesHmacSha2Key, IV_SIZE, MAC_SIZE},
    error::KeyBackupError,
    olm::ExportedRoomKey,
    types::{
        backup::{
            AesHmacSha2AuthData, BackedUpRoomKey, EncryptedSessionData, KeyBackupData,
            MegolmV1AuthData, RoomKeyBackupInfo,
        },
        AesHmacSha2EncryptedData, Signatures,
    },
};

/// One of the supported backup algorithms, ready to encrypt room keys.
#[derive(Clone)]
pub enum BackupAlgorithm {
    /// `m.megolm_backup.v1.curve25519-aes-sha2`, anybody with the public key
    /// can add keys to the backup.
    Curve25519 {
        /// The public key the sessions are encrypted to.
        public_key: Curve25519PublicKey,
        /// The private key, needed to restore from the backup.
        key: Option<BackupDecryptionKey>,
    },
    /// The symmetric AES-HMAC-SHA2 algorithm, the key is needed for
    /// encryption as well.
    Aes256 {
        /// The symmetric backup key.
        key: BackupDecryptionKey,
    },
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for BackupAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Curve25519 { public_key, key } => f
                .debug_struct("Curve25519")
                .field("public_key", &public_key.to_base64())
                .field("has_key", &key.is_some())
                .finish(),
            Self::Aes256 { .. } => f.debug_struct("Aes256").finish_non_exhaustive(),
        }
    }
}

impl BackupAlgorithm {
    /// Create the auth data of a new backup.
    ///
    /// A new key is generated if none is given. The returned info isn't
    /// signed yet.
    pub fn prepare(
        algorithm: &EventEncryptionAlgorithm,
        key: Option<BackupDecryptionKey>,
    ) -> Result<(BackupDecryptionKey, RoomKeyBackupInfo), KeyBackupError> {
        let key = key.unwrap_or_default();

        let info = match algorithm {
            EventEncryptionAlgorithm::MegolmBackupV1Curve25519AesSha2 => {
                RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(MegolmV1AuthData::new(
                    key.megolm_v1_public_key().to_base64(),
                    Signatures::new(),
                ))
            }
            EventEncryptionAlgorithm::MegolmBackupV1AesHmacSha2 => {
                let (iv, mac) = calculate_key_check(key.as_bytes());
                RoomKeyBackupInfo::MegolmBackupV1AesHmacSha2(AesHmacSha2AuthData::new(
                    iv,
                    mac,
                    Signatures::new(),
                ))
            }
            other => return Err(KeyBackupError::UnsupportedAlgorithm(other.to_string())),
        };

        Ok((key, info))
    }

    /// Sanity check the auth data of a backup we got from the server.
    pub fn check_backup_version(info: &RoomKeyBackupInfo) -> Result<(), KeyBackupError> {
        match info {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(data) => {
                Curve25519PublicKey::from_base64(&data.public_key).map_err(|e| {
                    KeyBackupError::InvalidBackupInfo(format!("invalid public key: {e}"))
                })?;
            }
            RoomKeyBackupInfo::MegolmBackupV1AesHmacSha2(data) => {
                let iv_ok = base64_decode(&data.iv).is_ok_and(|iv| iv.len() == IV_SIZE);
                let mac_ok = base64_decode(&data.mac).is_ok_and(|mac| mac.len() == MAC_SIZE);

                if !(iv_ok && mac_ok) {
                    return Err(KeyBackupError::InvalidBackupInfo(
                        "the key check has an invalid iv or mac".to_owned(),
                    ));
                }
            }
            RoomKeyBackupInfo::Other { algorithm, .. } => {
                return Err(KeyBackupError::UnsupportedAlgorithm(algorithm.to_owned()));
            }
        }

        Ok(())
    }

    /// Set up the algorithm for the given backup.
    ///
    /// The symmetric algorithm can't do anything without the key, the
    /// Curve25519 one only needs it to decrypt. A given key must belong to
    /// the backup.
    pub fn init(
        info: &RoomKeyBackupInfo,
        key: Option<BackupDecryptionKey>,
    ) -> Result<Self, KeyBackupError> {
        Self::check_backup_version(info)?;

        let algorithm = match info {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(data) => {
                let public_key = Curve25519PublicKey::from_base64(&data.public_key)?;
                Self::Curve25519 { public_key, key }
            }
            RoomKeyBackupInfo::MegolmBackupV1AesHmacSha2(_) => {
                Self::Aes256 { key: key.ok_or(KeyBackupError::MissingDecryptionKey)? }
            }
            RoomKeyBackupInfo::Other { algorithm, .. } => {
                return Err(KeyBackupError::UnsupportedAlgorithm(algorithm.to_owned()));
            }
        };

        match &algorithm {
            Self::Curve25519 { key: Some(key), .. } | Self::Aes256 { key } => {
                if !Self::key_matches_info(info, key) {
                    return Err(KeyBackupError::KeyMismatch);
                }
            }
            Self::Curve25519 { key: None, .. } => {}
        }

        Ok(algorithm)
    }

    /// The algorithm identifier.
    pub fn algorithm(&self) -> EventEncryptionAlgorithm {
        match self {
            Self::Curve25519 { .. } => EventEncryptionAlgorithm::MegolmBackupV1Curve25519AesSha2,
            Self::Aes256 { .. } => EventEncryptionAlgorithm::MegolmBackupV1AesHmacSha2,
        }
    }

    /// Can we restore keys from the backup.
    pub fn has_decryption_key(&self) -> bool {
        match self {
            Self::Curve25519 { key, .. } => key.is_some(),
            Self::Aes256 { .. } => true,
        }
    }

    /// Check if the candidate key is the key of this backup.
    pub fn key_matches(&self, candidate: &BackupDecryptionKey) -> bool {
        match self {
            Self::Curve25519 { public_key, .. } => {
                candidate.megolm_v1_public_key() == *public_key
            }
            Self::Aes256 { key } => key.as_bytes() == candidate.as_bytes(),
        }
    }

    /// Check if the candidate key belongs to the given backup info.
    pub fn key_matches_info(info: &RoomKeyBackupInfo, candidate: &BackupDecryptionKey) -> bool {
        match info {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(data) => {
                candidate.megolm_v1_public_key().to_base64() == data.public_key
            }
            RoomKeyBackupInfo::MegolmBackupV1AesHmacSha2(data) => {
                verify_key_check(candidate.as_bytes(), &data.iv, &data.mac)
            }
            RoomKeyBackupInfo::Other { .. } => false,
        }
    }

    /// Encrypt a single room key for the backup.
    pub fn encrypt_session(
        &self,
        session_id: &str,
        room_key: &BackedUpRoomKey,
    ) -> Result<EncryptedSessionData, KeyBackupError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(room_key)?);

        Ok(match self {
            Self::Curve25519 { public_key, .. } => {
                let message = PkEncryption::from_key(*public_key).encrypt(&plaintext);

                EncryptedSessionData {
                    ephemeral: Some(message.ephemeral_key.to_base64()),
                    iv: None,
                    ciphertext: base64_encode(message.ciphertext),
                    mac: base64_encode(message.mac),
                }
            }
            Self::Aes256 { key } => {
                let data = AesHmacSha2Key::from_secret_key(key.as_bytes(), session_id)
                    .encrypt_to_data(&plaintext);

                EncryptedSessionData {
                    ephemeral: None,
                    iv: Some(data.iv),
                    ciphertext: data.ciphertext,
                    mac: data.mac,
                }
            }
        })
    }

    /// Decrypt a single room key from the backup.
    pub fn decrypt_session(
        &self,
        session_id: &str,
        data: &EncryptedSessionData,
    ) -> Result<BackedUpRoomKey, KeyBackupError> {
        let plaintext = Zeroizing::new(match self {
            Self::Curve25519 { key, .. } => {
                let key = key.as_ref().ok_or(KeyBackupError::MissingDecryptionKey)?;
                let ephemeral = data.ephemeral.as_deref().ok_or_else(|| {
                    KeyBackupError::Decryption("the ephemeral key is missing".to_owned())
                })?;

                let message = Message::from_base64(&data.ciphertext, &data.mac, ephemeral)
                    .map_err(|e| KeyBackupError::Decryption(e.to_string()))?;

                key.pk_decryption()
                    .decrypt(&message)
                    .map_err(|e| KeyBackupError::Decryption(e.to_string()))?
            }
            Self::Aes256 { key } => {
                let iv = data.iv.clone().ok_or_else(|| {
                    KeyBackupError::Decryption("the initialization vector is missing".to_owned())
                })?;
                let encrypted = AesHmacSha2EncryptedData {
                    iv,
                    ciphertext: data.ciphertext.clone(),
                    mac: data.mac.clone(),
                };

                AesHmacSha2Key::from_secret_key(key.as_bytes(), session_id)
                    .decrypt_data(&encrypted)
                    .map_err(|e| KeyBackupError::Decryption(e.to_string()))?
            }
        });

        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Decrypt the backed up sessions of a room.
    ///
    /// Sessions that fail to decrypt are skipped.
    pub fn decrypt_sessions(
        &self,
        room_id: &RoomId,
        sessions: &BTreeMap<String, KeyBackupData>,
    ) -> Vec<ExportedRoomKey> {
        sessions
            .iter()
            .filter_map(|(session_id, data)| {
                match self.decrypt_session(session_id, &data.session_data) {
                    Ok(key) => Some(ExportedRoomKey::from_backed_up(
                        room_id.to_owned(),
                        session_id.to_owned(),
                        key,
                    )),
                    Err(e) => {
                        warn!(?room_id, session_id, error = ?e, "Failed to decrypt a backed up room key");
                        None
                    }
                }
            })
            .collect()
    }
}
