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

//! Collection of public identities used in Matrix.
//!
//! Matrix supports two main types of identities, a per-device identity and a
//! per-user identity.
//!
//! ## Device
//!
//! Every E2EE capable Matrix client will create a new Olm account and upload
//! the public keys of the Olm account to the server. This is represented as a
//! [`DeviceData`]. Devices can be verified locally, or through the
//! cross-signing identity of their owner.
//!
//! ## User
//!
//! Cross-signing allows users to vouch for their own devices and for the
//! identities of other users. The public part of such an identity is a
//! [`CrossSigningInfo`]. The [`DeviceListManager`] keeps both up to date.

mod cross_signing;
mod device;
mod device_list;
pub(crate) mod signing;

pub use cross_signing::{
    CrossSigningInfo, CrossSigningLevel, CrossSigningVerification, UserTrustLevel,
};
pub use device::{DeviceData, DeviceTrustLevel, LocalTrust};
pub use device_list::{DeviceDataBlob, DeviceListManager, DevicesUpdated, TrackingStatus};
