//! Error handling in [`steward_client`][crate]
use std::time::Duration;

use thiserror::Error;

pub use steward_core::ErrorResponse;

/// Possible errors when working with a resource store
#[derive(Error, Debug)]
pub enum Error {
    /// ApiError for when the store rejects a request
    ///
    /// It's also used in `WatchEvent` from watch calls.
    /// It's quite common to get a `410 Gone` when the `resourceVersion` is too old.
    #[error("ApiError: {0} ({0:?})")]
    Api(#[source] ErrorResponse),

    /// The call did not complete within its deadline
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Common error case when converting objects into own structs
    #[error("Error deserializing response")]
    SerdeError(#[source] serde_json::Error),
}

impl Error {
    /// The store response, if this error carries one
    #[must_use]
    pub fn response(&self) -> Option<&ErrorResponse> {
        match self {
            Error::Api(resp) => Some(resp),
            _ => None,
        }
    }

    /// Whether the object did not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.response().is_some_and(ErrorResponse::is_not_found)
    }

    /// Whether a write lost an optimistic concurrency race
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.response().is_some_and(ErrorResponse::is_conflict)
    }

    /// Whether a create collided with an existing name
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        self.response().is_some_and(ErrorResponse::is_already_exists)
    }
}

impl From<ErrorResponse> for Error {
    fn from(resp: ErrorResponse) -> Self {
        Error::Api(resp)
    }
}
