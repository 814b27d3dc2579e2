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

use ruma::{CanonicalJsonError, OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde_json::Error as SerdeError;
use thiserror::Error;

use super::store::CryptoStoreError;
use crate::{requests::TransportError, types::events::WithheldCode, types::KeyUsage};

pub type OlmResult<T> = Result<T, OlmError>;
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// The received room key couldn't be converted into a valid Megolm session.
    #[error(transparent)]
    SessionCreation(#[from] SessionCreationError),

    /// The underlying Olm session failed to decrypt a message.
    #[error("can't decrypt an Olm message: {0}")]
    Decryption(#[from] vodozemac::olm::DecryptionError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// A pickled account or session couldn't be restored.
    #[error("failed to unpickle an Olm object: {0}")]
    Pickle(#[from] vodozemac::PickleError),

    /// A public key couldn't be decoded.
    #[error(transparent)]
    Key(#[from] vodozemac::KeyError),

    /// A signature couldn't be created or verified.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// The transport refused or failed a request.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The `OlmDevice` was used before it was initialized.
    #[error("the Olm device hasn't been initialized")]
    NotInitialized,

    /// No Olm session with the given id exists for the given sender key.
    #[error("unknown Olm session {session_id} for the sender key {sender_key}")]
    MissingSession {
        /// The Curve25519 key of the other side.
        sender_key: String,
        /// The id of the session that was requested.
        session_id: String,
    },

    /// None of our sessions could decrypt a normal Olm message.
    #[error("no Olm session for {0} could decrypt the message")]
    NoMatchingSession(String),

    /// The exact same Olm message was already decrypted once.
    #[error("decryption failed because an Olm message from {0} was replayed")]
    ReplayedMessage(String),

    /// The outbound group session with the given id doesn't exist.
    #[error("unknown outbound group session {0}")]
    MissingOutboundGroupSession(String),

    /// A device doesn't advertise the identity keys needed for Olm.
    #[error("the device {1} of {0} is missing its identity keys")]
    MissingDeviceKeys(OwnedUserId, OwnedDeviceId),

    /// Our own inbound copy of a freshly created room key was rejected.
    #[error("can't store the inbound copy of our own room key: {0}")]
    OwnRoomKey(Box<MegolmError>),
}

/// Error type for the setting of the encryption settings of a room.
#[derive(Error, Debug)]
pub enum SetRoomSettingsError {
    /// The new settings would weaken the encryption of the room.
    #[error("the new settings would cause a downgrade of encryption security")]
    EncryptionDowngrade,

    /// The new settings are invalid.
    #[error("the new settings are invalid")]
    InvalidSettings,

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// The current outbound group session couldn't be invalidated.
    #[error(transparent)]
    Olm(#[from] OlmError),
}

/// Error representing a failure during a group encryption operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// Decryption failed because we're missing the room key that was used to
    /// encrypt the event.
    #[error("can't find the room key to decrypt the event, withheld code: {0:?}")]
    MissingRoomKey(Option<WithheldCode>),

    /// The sender of the room key told us that the key was withheld from us.
    #[error("the room key was withheld: {0}")]
    Withheld(WithheldCode),

    /// The room where a group session should be shared is not encrypted.
    #[error("the room key for the room {0} belongs to a different room")]
    MismatchedRoom(OwnedRoomId),

    /// The underlying group session operation returned an error.
    #[error("can't decrypt a Megolm message: {0}")]
    Decryption(#[from] vodozemac::megolm::DecryptionError),

    /// The Megolm message couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] vodozemac::DecodeError),

    /// The session key of a room key couldn't be decoded.
    #[error(transparent)]
    SessionKeyDecode(#[from] vodozemac::megolm::SessionKeyDecodeError),

    /// A key export was requested for a message index the session can't
    /// reach.
    #[error(
        "the session only knows messages starting at index {first_known_index}, \
         index {requested} was requested"
    )]
    UnknownMessageIndex {
        /// The first message index the session is able to decrypt.
        first_known_index: u32,
        /// The requested message index.
        requested: u32,
    },

    /// The same message index was used by two different events.
    #[error("the message index {0} was already used by a different event")]
    Replay(u32),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// A pickled session couldn't be restored.
    #[error("failed to unpickle a group session: {0}")]
    Pickle(#[from] vodozemac::PickleError),
}

/// Error that occurs when a room key or to-device event is malformed.
#[derive(Error, Debug)]
pub enum EventError {
    /// The encrypted event uses an algorithm we don't support.
    #[error("the encrypted event uses an unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The Olm message type is not 0 or 1.
    #[error("the Olm message has an unsupported type {0}")]
    UnsupportedOlmType(usize),

    /// The encrypted event doesn't contain a ciphertext for our device.
    #[error("the encrypted message isn't encrypted for our device")]
    MissingCiphertext,

    /// A field of the event is missing.
    #[error("the event is missing the {0} field")]
    MissingField(String),

    /// The sender of the plaintext doesn't match the sender of the encrypted
    /// message.
    #[error(
        "the sender of the plaintext doesn't match the sender of the encrypted \
         message, got {0}, expected {1}"
    )]
    MismatchedSender(OwnedUserId, OwnedUserId),

    /// The recipient of the plaintext isn't us.
    #[error("the decrypted event was meant for {0}, not for us")]
    MismatchedRecipient(OwnedUserId),

    /// The keys that are attached to an event don't match the keys of the
    /// sending device.
    #[error("the public keys of the event don't match the keys of the sending device")]
    MismatchedKeys,

    /// The room id of the room key doesn't match the room id of the encrypted
    /// event.
    #[error("the room id of the room key doesn't match the room id of the event {0:?}")]
    MismatchedRoom(Option<OwnedRoomId>),
}

/// Error representing a failure while creating a new Olm session.
#[derive(Error, Debug)]
pub enum SessionCreationError {
    /// The claim response didn't contain a one-time key for the device.
    #[error("the one-time key for the device {1} of {0} is missing")]
    OneTimeKeyMissing(OwnedUserId, OwnedDeviceId),

    /// The signature of the one-time key couldn't be verified.
    #[error(
        "failed to verify the signature of a one-time key, key: {one_time_key}, \
         signing key: {signing_key:?}: {error}"
    )]
    InvalidSignature {
        /// The one-time key that failed the signature verification.
        one_time_key: String,
        /// The key that was used to verify the signature.
        signing_key: Option<String>,
        /// The actual error that occurred.
        error: Box<SignatureError>,
    },

    /// The device is missing its Curve25519 identity key.
    #[error("the device {1} of {0} is missing its Curve25519 key")]
    DeviceMissingCurveKey(OwnedUserId, OwnedDeviceId),

    /// A key in the claim response couldn't be decoded.
    #[error(transparent)]
    InvalidKey(#[from] vodozemac::KeyError),

    /// Only pre-key messages can create inbound sessions.
    #[error("only pre-key messages can create new Olm sessions")]
    NotPreKeyMessage,

    /// The pre-key message couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] vodozemac::DecodeError),

    /// Creating the inbound session failed.
    #[error(transparent)]
    InboundCreation(#[from] vodozemac::olm::SessionCreationError),
}

/// Errors that can be returned while signing or verifying JSON objects.
///
/// The display strings of [`SignatureError::InvalidBase64`] and
/// [`SignatureError::VerificationError`] are part of the public contract of
/// `OlmDevice::verify_signature()`.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The signature was made using an unsupported algorithm.
    #[error("the signature used an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The ID of the signing key isn't a valid key ID.
    #[error("the ID of the signing key is invalid")]
    InvalidKeyId,

    /// The signing key that should create or check a signature is missing.
    #[error("the signing key is missing from the object that signed the message")]
    MissingSigningKey,

    /// The user id of signing key differs from the user id that provided the
    /// signature.
    #[error("the user id of the signing key differs user id that provided the signature")]
    UserIdMismatch,

    /// The provided JSON value that was signed and the signature should be
    /// checked isn't a valid JSON object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The provided JSON value that was signed and the signature should be
    /// checked isn't a valid JSON object.
    #[error("the provided JSON object doesn't contain a signatures field")]
    NoSignatureFound,

    /// A key or signature couldn't be decoded.
    #[error("OLM.INVALID_BASE64")]
    InvalidBase64,

    /// The signature couldn't be verified.
    #[error("OLM.BAD_MESSAGE_MAC")]
    VerificationError,

    /// The signed object couldn't be converted to canonical JSON.
    #[error(transparent)]
    JsonError(#[from] CanonicalJsonError),

    /// The signed object couldn't be serialized.
    #[error(transparent)]
    Serialization(#[from] SerdeError),
}

/// Errors of cross-signing key management.
#[derive(Error, Debug)]
pub enum CrossSigningError {
    /// A cross-signing key belongs to a different user.
    #[error("mismatched user ID {got} in a cross-signing key of {expected}")]
    UserIdMismatch {
        /// The user the keys should belong to.
        expected: OwnedUserId,
        /// The user id found in the key.
        got: OwnedUserId,
    },

    /// Sub-keys were provided while neither the update nor the stored state
    /// contains a master key.
    #[error("tried to set cross-signing keys without a master key")]
    MissingMasterKey,

    /// A key was provided in the slot of a different usage.
    #[error("the cross-signing key doesn't have the {0:?} usage")]
    InvalidUsage(KeyUsage),

    /// A sub-key isn't signed by the master key.
    #[error("the {0:?} key isn't signed by the master key: {1}")]
    InvalidSignature(KeyUsage, SignatureError),

    /// The private part of a cross-signing key isn't available.
    #[error("the private {0:?} key isn't available")]
    MissingPrivateKey(KeyUsage),

    /// The private key returned by the application doesn't match the public
    /// key we know about.
    #[error("the private {0:?} key doesn't match the public key")]
    PublicKeyMismatch(KeyUsage),

    /// A callback that is needed for the operation isn't configured.
    #[error("the {0} callback isn't configured")]
    MissingCallback(&'static str),

    /// The application failed to persist the private keys.
    #[error("the application failed to save the private cross-signing keys: {0}")]
    SaveFailed(String),

    /// A public key couldn't be decoded.
    #[error(transparent)]
    Key(#[from] vodozemac::KeyError),

    /// The JSON object couldn't be signed.
    #[error(transparent)]
    Signature(#[from] SignatureError),
}

/// Errors of the server-side secret storage.
#[derive(Error, Debug)]
pub enum SecretStorageError {
    /// The key uses an algorithm we don't know.
    #[error("unknown secret storage algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// There's no default key and no explicit key was given.
    #[error("no default secret storage key is set")]
    NoDefaultKey,

    /// The key description for the key id doesn't exist.
    #[error("the secret storage key {0} doesn't exist")]
    UnknownKey(String),

    /// A key with the requested id already exists.
    #[error("a secret storage key with the id {0} already exists")]
    KeyExists(String),

    /// The `get_secret_storage_key` callback isn't configured.
    #[error("the get_secret_storage_key callback isn't configured")]
    MissingCallback,

    /// The secret isn't stored in the account data.
    #[error("the secret {0} isn't stored")]
    MissingSecret(String),

    /// The secret exists but isn't encrypted under any usable key.
    #[error("the secret {0} isn't encrypted under any usable key")]
    NoUsableKey(String),

    /// The application returned a key that failed the key check.
    #[error("the key for {0} failed the key check")]
    KeyCheckFailed(String),

    /// The stored secret failed its MAC check.
    #[error("the MAC of the secret {0} doesn't match")]
    MacMismatch(String),

    /// The account data of a secret or key is malformed.
    #[error("the secret storage account data {0} is malformed")]
    Malformed(String),

    /// Base64 decoding failed.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),

    /// The account data couldn't be read or written.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The account data couldn't be (de)serialized.
    #[error(transparent)]
    Json(#[from] SerdeError),
}

/// Errors of an outgoing secret request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretRequestError {
    /// The request was cancelled before a secret arrived.
    #[error("the secret request was cancelled")]
    Cancelled,

    /// The request wasn't answered in time.
    #[error("the secret request timed out")]
    TimedOut,

    /// The request couldn't be sent.
    #[error("the secret request couldn't be sent: {0}")]
    Transport(String),
}

/// Errors of the server-side key backup.
#[derive(Error, Debug)]
pub enum KeyBackupError {
    /// The backup uses an algorithm we don't know.
    #[error("unknown key backup algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// The backup info is missing required fields.
    #[error("the key backup info is invalid: {0}")]
    InvalidBackupInfo(String),

    /// A decryption key is needed but missing.
    #[error("the backup decryption key is missing")]
    MissingDecryptionKey,

    /// The decryption key doesn't belong to the backup.
    #[error("the backup decryption key doesn't match the backup")]
    KeyMismatch,

    /// No backup is currently enabled.
    #[error("key backup isn't enabled")]
    BackupDisabled,

    /// A backed up session couldn't be decrypted.
    #[error("failed to decrypt a backed up session: {0}")]
    Decryption(String),

    /// The recovery key couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] crate::backups::DecodeError),

    /// The session couldn't be exported.
    #[error(transparent)]
    Megolm(#[from] MegolmError),

    /// The backup auth data couldn't be signed with the device key.
    #[error(transparent)]
    Olm(#[from] OlmError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// The server request failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The session data couldn't be (de)serialized.
    #[error(transparent)]
    Json(#[from] SerdeError),

    /// A key couldn't be decoded.
    #[error(transparent)]
    Key(#[from] vodozemac::KeyError),

    /// The backup auth data couldn't be signed.
    #[error(transparent)]
    Signature(#[from] SignatureError),
}

/// Errors of the interactive verification.
#[derive(Error, Debug)]
pub enum VerificationError {
    /// The verification was cancelled, either by us or by the other side.
    #[error("the verification was cancelled: {0}")]
    Cancelled(crate::verification::CancelInfo),

    /// The operation isn't possible in the current phase of the request.
    #[error("can't {action} a verification request in the {phase:?} phase")]
    InvalidPhase {
        /// What we tried to do.
        action: &'static str,
        /// The phase the request is in.
        phase: crate::verification::VerificationPhase,
    },

    /// Neither side supports the requested method.
    #[error("the verification method {0} isn't supported by both sides")]
    UnsupportedMethod(String),

    /// The device of the other side isn't known.
    #[error("the device {1} of {0} is unknown")]
    UnknownDevice(OwnedUserId, OwnedDeviceId),

    /// A scanned QR code doesn't belong to this verification.
    #[error(transparent)]
    QrCode(#[from] crate::verification::DecodingError),

    /// Our keys couldn't be put into a QR code.
    #[error(transparent)]
    QrEncoding(#[from] crate::verification::EncodingError),

    /// The event couldn't be (de)serialized.
    #[error(transparent)]
    Json(#[from] SerdeError),

    /// Signing a verified identity failed.
    #[error(transparent)]
    CrossSigning(#[from] CrossSigningError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// Sending an event failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
