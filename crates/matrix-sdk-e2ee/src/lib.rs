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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

mod algorithms;
pub mod backups;
mod callbacks;
mod ciphers;
mod config;
mod error;
pub mod gossiping;
pub mod identities;
mod machine;
pub mod olm;
pub mod requests;
pub mod secret_storage;
mod session_manager;
pub mod store;
pub mod types;
mod utilities;
pub mod verification;

#[cfg(test)]
pub(crate) mod testing;

pub use algorithms::EventEncryptionAlgorithm;
pub use callbacks::{CryptoCallbacks, SecretRequestInfo};
pub use config::E2eeConfig;
pub use error::{
    CrossSigningError, EventError, KeyBackupError, MegolmError, OlmError, SecretRequestError,
    SecretStorageError, SessionCreationError, SetRoomSettingsError, SignatureError,
    VerificationError,
};
pub use identities::{
    CrossSigningInfo, CrossSigningLevel, CrossSigningVerification, DeviceData, DeviceListManager,
    DeviceTrustLevel, LocalTrust, TrackingStatus, UserTrustLevel,
};
pub use machine::{
    CryptoMachine, DecryptedRoomEvent, DecryptedToDeviceEvent, PendingSecrets, ReceivedSecrets,
};
pub use olm::OlmDevice;
pub use requests::{CryptoTransport, TransportError};
pub use session_manager::SessionManager;
pub use store::{CryptoStore, CryptoStoreError, MemoryStore};
pub use verification::{
    format_emojis, CancelCode, CancelInfo, Emoji, FlowId, SasVerifier, VerificationDone,
    VerificationMachine, VerificationPhase, VerificationRequest,
};

#[cfg(all(test, not(target_arch = "wasm32")))]
#[ctor::ctor]
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
}
