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
    fmt,
    io::{Cursor, Read},
};

use rand::{thread_rng, RngCore};
use thiserror::Error;
use vodozemac::{
    base64_decode, base64_encode, pk_encryption::PkDecryption, Curve25519PublicKey,
    Curve25519SecretKey,
};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Errors when decoding a backup decryption key.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The decoded key doesn't start with the recovery key prefix.
    #[error("The decoded recovery key has an invalid prefix: expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),
    /// The parity byte doesn't match the key.
    #[error("The parity byte of the recovery key doesn't match: expected {0:?}, got {1:?}")]
    Parity(u8, u8),
    /// The key has the wrong length.
    #[error("The decoded recovery key has a invalid length: expected {0}, got {1}")]
    Length(usize, usize),
    /// The key isn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),
    /// The key isn't valid base64.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),
    /// The decoded key is too short.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The private key of a server-side key backup.
///
/// For the Curve25519 backup algorithm this is the Curve25519 secret key the
/// sessions are encrypted to, for the symmetric algorithm it's the AES key.
/// Shown to users as a recovery key: base58 with a two byte prefix and a
/// parity byte, in groups of four characters.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct BackupDecryptionKey {
    key: Box<[u8; BackupDecryptionKey::KEY_SIZE]>,
}

impl Clone for BackupDecryptionKey {
    fn clone(&self) -> Self {
        Self::from_bytes(&self.key)
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for BackupDecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BackupDecryptionKey").field(&"*****").finish()
    }
}

impl fmt::Display for BackupDecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = Zeroizing::new(self.to_base58());

        let string = Zeroizing::new(
            string
                .chars()
                .collect::<Vec<char>>()
                .chunks(Self::DISPLAY_CHUNK_SIZE)
                .map(|c| c.iter().collect::<String>())
                .collect::<Vec<_>>()
                .join(" "),
        );

        write!(f, "{}", string.as_str())
    }
}

impl BackupDecryptionKey {
    /// The length of the key in bytes.
    pub const KEY_SIZE: usize = 32;
    const PREFIX: [u8; 2] = [0x8b, 0x01];
    const PREFIX_PARITY: u8 = Self::PREFIX[0] ^ Self::PREFIX[1];
    const DISPLAY_CHUNK_SIZE: usize = 4;

    fn parity_byte(bytes: &[u8]) -> u8 {
        bytes.iter().fold(Self::PREFIX_PARITY, |acc, x| acc ^ x)
    }

    /// Generate a new random key.
    pub fn new() -> Self {
        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        thread_rng().fill_bytes(key.as_mut_slice());

        Self { key }
    }

    /// Create a key from raw bytes.
    pub fn from_bytes(key: &[u8; Self::KEY_SIZE]) -> Self {
        Self { key: Box::new(*key) }
    }

    /// The raw bytes of the key.
    pub fn as_bytes(&self) -> &[u8; Self::KEY_SIZE] {
        &self.key
    }

    /// Decode a base64 encoded key.
    pub fn from_base64(key: &str) -> Result<Self, DecodeError> {
        let decoded = Zeroizing::new(base64_decode(key)?);

        let key: &[u8; Self::KEY_SIZE] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| DecodeError::Length(Self::KEY_SIZE, decoded.len()))?;

        Ok(Self::from_bytes(key))
    }

    /// Encode the key as base64.
    pub fn to_base64(&self) -> String {
        base64_encode(self.key.as_slice())
    }

    /// Decode a recovery key.
    ///
    /// Whitespace is ignored, so the grouped form is accepted too.
    pub fn from_base58(value: &str) -> Result<Self, DecodeError> {
        let value: String = value.chars().filter(|c| !c.is_whitespace()).collect();

        let decoded =
            Zeroizing::new(bs58::decode(value).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()?);
        let expected_length = Self::PREFIX.len() + Self::KEY_SIZE + 1;

        if decoded.len() != expected_length {
            return Err(DecodeError::Length(expected_length, decoded.len()));
        }

        let mut decoded = Cursor::new(decoded.as_slice());

        let mut prefix = [0u8; 2];
        let mut key = Zeroizing::new([0u8; Self::KEY_SIZE]);
        let mut expected_parity = [0u8; 1];

        decoded.read_exact(&mut prefix)?;
        decoded.read_exact(key.as_mut_slice())?;
        decoded.read_exact(&mut expected_parity)?;

        let expected_parity = expected_parity[0];
        let parity = Self::parity_byte(key.as_ref());

        if prefix != Self::PREFIX {
            Err(DecodeError::Prefix(Self::PREFIX, prefix))
        } else if expected_parity != parity {
            Err(DecodeError::Parity(expected_parity, parity))
        } else {
            Ok(Self::from_bytes(&key))
        }
    }

    /// Encode the key as a recovery key, without the grouping.
    pub fn to_base58(&self) -> String {
        let bytes = Zeroizing::new(
            [
                Self::PREFIX.as_ref(),
                self.key.as_ref(),
                [Self::parity_byte(self.key.as_ref())].as_ref(),
            ]
            .concat(),
        );

        bs58::encode(bytes.as_slice()).with_alphabet(bs58::Alphabet::BITCOIN).into_string()
    }

    pub(crate) fn pk_decryption(&self) -> PkDecryption {
        PkDecryption::from_key(Curve25519SecretKey::from_slice(&self.key))
    }

    /// The Curve25519 public key that matches this key, used by the
    /// `m.megolm_backup.v1.curve25519-aes-sha2` algorithm.
    pub fn megolm_v1_public_key(&self) -> Curve25519PublicKey {
        self.pk_decryption().public_key()
    }
}

impl Default for BackupDecryptionKey {
    fn default() -> Self {
        Self::new()
    }
}
