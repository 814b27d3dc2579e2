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

//! The crypto specific Olm objects.
//!
//! Note: You'll only be interested in these if you are implementing a custom
//! `CryptoStore`.

mod account;
mod group_sessions;
mod olm_device;
mod session;

pub use account::{signed_curve25519_key_id, Account, OlmMessageHash, PickledAccount};
pub use group_sessions::{
    EncryptionSettings, ExportedRoomKey, ExportedSessionKey, InboundGroupSession,
    OutboundGroupSession, ParkedSharedHistory, PickledInboundGroupSession,
    PickledOutboundGroupSession, SessionKey,
};
pub use olm_device::{
    DecryptedGroupMessage, DecryptedOlmMessage, ExportedDevice, InboundSessionResult, OlmDevice,
};
pub(crate) use olm_device::SessionInProgress;
pub use session::{PickledSession, Session};
