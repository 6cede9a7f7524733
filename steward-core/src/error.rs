use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error response from a resource store.
#[derive(Error, Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
#[error("{message}: {reason}")]
pub struct ErrorResponse {
    /// The status
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    pub code: u16,
}

impl ErrorResponse {
    fn failure(code: u16, reason: &str, message: String) -> Self {
        Self {
            status: "Failure".into(),
            message,
            reason: reason.into(),
            code,
        }
    }

    /// The object does not exist
    #[must_use]
    pub fn not_found(kind: &str, name: &str) -> Self {
        Self::failure(404, "NotFound", format!("{kind} \"{name}\" not found"))
    }

    /// An optimistic concurrency check failed
    #[must_use]
    pub fn conflict(kind: &str, name: &str) -> Self {
        Self::failure(
            409,
            "Conflict",
            format!("the object {kind} \"{name}\" has been modified; please apply your changes to the latest version and try again"),
        )
    }

    /// An object with the same name already exists
    #[must_use]
    pub fn already_exists(kind: &str, name: &str) -> Self {
        Self::failure(409, "AlreadyExists", format!("{kind} \"{name}\" already exists"))
    }

    /// The requested resource version is no longer retained
    #[must_use]
    pub fn expired(resource_version: &str) -> Self {
        Self::failure(410, "Expired", format!("too old resource version: {resource_version}"))
    }

    /// The object is invalid
    #[must_use]
    pub fn invalid(kind: &str, name: &str, why: &str) -> Self {
        Self::failure(422, "Invalid", format!("{kind} \"{name}\" is invalid: {why}"))
    }

    /// The store is temporarily unavailable
    #[must_use]
    pub fn unavailable(message: &str) -> Self {
        Self::failure(503, "ServiceUnavailable", message.into())
    }

    /// Whether this is a 404
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code == 404
    }

    /// Whether this is a 409 caused by a stale resource version
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.code == 409 && self.reason == "Conflict"
    }

    /// Whether this is a 409 caused by a name collision on create
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        self.code == 409 && self.reason == "AlreadyExists"
    }

    /// Whether a watch must be restarted with a fresh list
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.code == 410
    }
}
