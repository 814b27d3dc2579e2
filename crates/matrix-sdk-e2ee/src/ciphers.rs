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

use aes::{
    cipher::{generic_array::GenericArray, IvSizeUser, KeyIvInit, KeySizeUser, StreamCipher},
    Aes256,
};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use hmac::{
    digest::{FixedOutput, MacError},
    Hmac, Mac as _,
};
use pbkdf2::pbkdf2;
use rand::{thread_rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use vodozemac::{base64_decode, base64_encode};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub(crate) const IV_SIZE: usize = 16;
pub(crate) const KEY_SIZE: usize = 32;
pub(crate) const MAC_SIZE: usize = 32;

type Aes256Ctr = Ctr128BE<Aes256>;

type Aes256Key = GenericArray<u8, <Aes256Ctr as KeySizeUser>::KeySize>;
type Aes256Iv = GenericArray<u8, <Aes256Ctr as IvSizeUser>::IvSize>;

/// An authentication tag for the HMAC-SHA-256 message authentication algorithm.
#[derive(Debug)]
pub(crate) struct HmacSha256Mac([u8; MAC_SIZE]);

impl HmacSha256Mac {
    pub(crate) fn as_bytes(&self) -> &[u8; MAC_SIZE] {
        &self.0
    }
}

/// Errors when decrypting an [`AesHmacSha2EncryptedData`] payload.
#[derive(Debug, thiserror::Error)]
pub(crate) enum AesHmacSha2Error {
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),
    #[error("the initialization vector or MAC has an invalid length")]
    InvalidLength,
    #[error("the MAC doesn't match")]
    Mac(#[from] MacError),
}

/// Keys used for our combination of AES-CTR-256 and HMAC-SHA-256.
///
/// ⚠️  This struct provides low-level cryptographic primitives.
///
/// The combination is used by secret storage and the symmetric key backup
/// algorithm. Both derive the pair of keys from a 32 byte key and a name
/// using HKDF-SHA-256.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct AesHmacSha2Key {
    aes_key: Box<[u8; KEY_SIZE]>,
    mac_key: Box<[u8; KEY_SIZE]>,
}

impl AesHmacSha2Key {
    /// Derive the AES and MAC keys from a secret key, the `name` is used as
    /// the HKDF info, the salt is 32 zero bytes.
    pub(crate) fn from_secret_key(key: &[u8; KEY_SIZE], name: &str) -> Self {
        let salt = [0u8; KEY_SIZE];
        let hkdf: Hkdf<Sha256> = Hkdf::new(Some(&salt), key);
        let mut expanded_keys = Zeroizing::new([0u8; KEY_SIZE * 2]);

        // The output length is fixed and well below the HKDF limit.
        hkdf.expand(name.as_bytes(), expanded_keys.as_mut_slice())
            .unwrap_or_else(|_| unreachable!("64 bytes is a valid HKDF-SHA-256 output length"));

        let (aes_key, mac_key) = Self::split_keys(&expanded_keys);

        Self { aes_key, mac_key }
    }

    /// Expand a passphrase into a 32 byte secret key using PBKDF2 with
    /// HMAC-SHA-512.
    pub(crate) fn passphrase_to_key(
        passphrase: &str,
        salt: &str,
        rounds: u32,
    ) -> Zeroizing<Box<[u8; KEY_SIZE]>> {
        let mut key = Zeroizing::new(Box::new([0u8; KEY_SIZE]));
        pbkdf2::<Hmac<Sha512>>(passphrase.as_bytes(), salt.as_bytes(), rounds, key.as_mut_slice())
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any size"));

        key
    }

    /// Encrypt the given plaintext using a fresh random initialization vector.
    pub(crate) fn encrypt(&self, plaintext: Vec<u8>) -> (Vec<u8>, [u8; IV_SIZE]) {
        let initialization_vector = Self::generate_iv();
        let ciphertext = self.encrypt_with_iv(plaintext, &initialization_vector);

        (ciphertext, initialization_vector)
    }

    /// Encrypt the given plaintext with a caller-provided initialization
    /// vector.
    ///
    /// This is only used to reproduce the key-check ciphertext of secret
    /// storage keys, fresh data is always encrypted with
    /// [`AesHmacSha2Key::encrypt()`].
    pub(crate) fn encrypt_with_iv(
        &self,
        mut plaintext: Vec<u8>,
        initialization_vector: &[u8; IV_SIZE],
    ) -> Vec<u8> {
        let iv = Aes256Iv::from_slice(initialization_vector);
        let mut cipher = Aes256Ctr::new(self.aes_key(), iv);
        cipher.apply_keystream(&mut plaintext);

        plaintext
    }

    /// Create a MAC tag over the given ciphertext.
    pub(crate) fn create_mac_tag(&self, ciphertext: &[u8]) -> HmacSha256Mac {
        let mut hmac = Hmac::<Sha256>::new_from_slice(self.mac_key.as_slice())
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any size"));
        hmac.update(ciphertext);

        HmacSha256Mac(hmac.finalize_fixed().into())
    }

    /// Verify the MAC tag of the given ciphertext in constant time.
    pub(crate) fn verify_mac(&self, message: &[u8], mac: &[u8; MAC_SIZE]) -> Result<(), MacError> {
        let mut hmac = Hmac::<Sha256>::new_from_slice(self.mac_key.as_slice())
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any size"));
        hmac.update(message);

        hmac.verify_slice(mac)
    }

    /// Decrypt the given ciphertext and return the decrypted plaintext.
    ///
    /// The method does not provide authenticity. You *must* call the
    /// [`AesHmacSha2Key::verify_mac()`] method before the decryption step to
    /// verify the authentication tag.
    pub(crate) fn decrypt(
        &self,
        ciphertext: Vec<u8>,
        initialization_vector: &[u8; IV_SIZE],
    ) -> Vec<u8> {
        // CTR mode is symmetric.
        self.encrypt_with_iv(ciphertext, initialization_vector)
    }

    /// Encrypt and authenticate the plaintext, producing the base64 encoded
    /// JSON representation.
    pub(crate) fn encrypt_to_data(&self, plaintext: &[u8]) -> AesHmacSha2EncryptedData {
        let (ciphertext, iv) = self.encrypt(plaintext.to_vec());
        let mac = self.create_mac_tag(&ciphertext);

        AesHmacSha2EncryptedData {
            iv: base64_encode(iv),
            ciphertext: base64_encode(ciphertext),
            mac: base64_encode(mac.as_bytes()),
        }
    }

    /// Check the MAC and decrypt the base64 encoded JSON representation.
    pub(crate) fn decrypt_data(
        &self,
        data: &AesHmacSha2EncryptedData,
    ) -> Result<Vec<u8>, AesHmacSha2Error> {
        let iv: [u8; IV_SIZE] =
            base64_decode(&data.iv)?.try_into().map_err(|_| AesHmacSha2Error::InvalidLength)?;
        let mac: [u8; MAC_SIZE] =
            base64_decode(&data.mac)?.try_into().map_err(|_| AesHmacSha2Error::InvalidLength)?;
        let ciphertext = base64_decode(&data.ciphertext)?;

        self.verify_mac(&ciphertext, &mac)?;

        Ok(self.decrypt(ciphertext, &iv))
    }

    fn split_keys(expanded_keys: &[u8; KEY_SIZE * 2]) -> (Box<[u8; KEY_SIZE]>, Box<[u8; KEY_SIZE]>) {
        let mut aes_key = Box::new([0u8; KEY_SIZE]);
        let mut mac_key = Box::new([0u8; KEY_SIZE]);

        aes_key.copy_from_slice(&expanded_keys[0..32]);
        mac_key.copy_from_slice(&expanded_keys[32..64]);

        (aes_key, mac_key)
    }

    /// Generate a new, random initialization vector.
    ///
    /// The initialization vector will be clamped and will be used to encrypt
    /// the ciphertext.
    fn generate_iv() -> [u8; IV_SIZE] {
        let mut rng = thread_rng();
        let mut iv = [0u8; IV_SIZE];

        rng.fill_bytes(&mut iv);

        Self::clamp_iv(iv)
    }

    /// Bit 63 of the IV is cleared to work around differences in AES-CTR
    /// implementations.
    fn clamp_iv(iv: [u8; IV_SIZE]) -> [u8; IV_SIZE] {
        let mut iv = u128::from_be_bytes(iv);
        iv &= !(1 << 63);
        iv.to_be_bytes()
    }

    fn aes_key(&self) -> &Aes256Key {
        Aes256Key::from_slice(self.aes_key.as_slice())
    }
}

/// The base64 encoded output of an [`AesHmacSha2Key`] encryption.
/// Encrypt 32 zero bytes under the key with an empty name.
///
/// The returned `(iv, mac)` pair, both base64 encoded, lets anybody holding
/// a candidate key check that it's the right one without storing the key.
pub(crate) fn calculate_key_check(key: &[u8; KEY_SIZE]) -> (String, String) {
    let key = AesHmacSha2Key::from_secret_key(key, "");
    let (ciphertext, iv) = key.encrypt(vec![0u8; KEY_SIZE]);
    let mac = key.create_mac_tag(&ciphertext);

    (base64_encode(iv), base64_encode(mac.as_bytes()))
}

/// Check a candidate key against a key-check created by
/// [`calculate_key_check()`].
pub(crate) fn verify_key_check(key: &[u8; KEY_SIZE], iv: &str, mac: &str) -> bool {
    let (Ok(iv), Ok(mac)) = (base64_decode(iv), base64_decode(mac)) else {
        return false;
    };
    let (Ok(iv), Ok(mac)) = (<[u8; IV_SIZE]>::try_from(iv), <[u8; MAC_SIZE]>::try_from(mac))
    else {
        return false;
    };

    let key = AesHmacSha2Key::from_secret_key(key, "");
    let ciphertext = key.encrypt_with_iv(vec![0u8; KEY_SIZE], &iv);

    key.verify_mac(&ciphertext, &mac).is_ok()
}

/// The `iv`, `ciphertext` and `mac` of a message encrypted with
/// AES-CTR-256 and authenticated with HMAC-SHA-256, all base64 encoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AesHmacSha2EncryptedData {
    /// The initialization vector.
    pub iv: String,
    /// The AES-CTR-256 ciphertext.
    pub ciphertext: String,
    /// The HMAC-SHA-256 tag of the ciphertext.
    pub mac: String,
}
