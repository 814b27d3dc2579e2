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

use std::sync::Arc;

use serde_json::Error as SerdeError;
use thiserror::Error;

/// A `CryptoStore` specific result type.
pub type Result<T, E = CryptoStoreError> = std::result::Result<T, E>;

/// The crypto store's error type.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// The account that owns the sessions, group sessions, and devices wasn't
    /// found.
    #[error("can't save/load sessions or group sessions in the store before an account is stored")]
    AccountUnset,

    /// The store can't be used anymore, it was closed, deleted, or ran out of
    /// space.
    #[error("the crypto store is unavailable: {0}")]
    Unavailable(String),

    /// The store contains data that can't be understood.
    #[error("the crypto store contains invalid data: {0}")]
    InvalidData(String),

    /// A pickled object couldn't be restored.
    #[error(transparent)]
    Pickle(#[from] vodozemac::PickleError),

    /// A stored value couldn't be (de)serialized.
    #[error(transparent)]
    Serialization(#[from] SerdeError),

    /// A shared operation failed, the error is shared between all the
    /// callers that awaited it.
    #[error(transparent)]
    Shared(Arc<CryptoStoreError>),

    /// An error of a custom storage backend.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl CryptoStoreError {
    /// Create a new [`Backend`][Self::Backend] error.
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}
