//! Classification of reconcile errors into retry behaviour
use steward_client::Error as ClientError;
use steward_core::ParseSpecError;

/// How the worker boundary reacts to a failed reconciliation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The object vanished, treated as success
    NotFound,
    /// An optimistic concurrency write race, retried immediately without touching backoff
    Conflict,
    /// Store or network unavailability, retried with exponential backoff
    Transient,
    /// Unfixable input such as a malformed spec, only retried at the slow resync cadence
    Permanent,
    /// The reconciliation deadline was exceeded, retried like [`ErrorClass::Transient`]
    Timeout,
}

/// Errors that know how they should be retried
pub trait Classify {
    /// The retry class of this error
    fn class(&self) -> ErrorClass;
}

impl Classify for ClientError {
    fn class(&self) -> ErrorClass {
        match self {
            ClientError::Api(resp) => match resp.code {
                404 => ErrorClass::NotFound,
                // a lost create race is resolved by a fresh read just like a stale write
                409 => ErrorClass::Conflict,
                400 | 403 | 422 => ErrorClass::Permanent,
                _ => ErrorClass::Transient,
            },
            ClientError::Timeout(_) => ErrorClass::Timeout,
            ClientError::SerdeError(_) => ErrorClass::Permanent,
        }
    }
}

impl Classify for ParseSpecError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use steward_core::ErrorResponse;

    #[test]
    fn client_errors_map_to_classes() {
        let class = |resp: ErrorResponse| ClientError::Api(resp).class();
        assert_eq!(class(ErrorResponse::not_found("Replica", "a")), ErrorClass::NotFound);
        assert_eq!(class(ErrorResponse::conflict("Replica", "a")), ErrorClass::Conflict);
        assert_eq!(class(ErrorResponse::already_exists("Replica", "a")), ErrorClass::Conflict);
        assert_eq!(class(ErrorResponse::invalid("Replica", "a", "bad")), ErrorClass::Permanent);
        assert_eq!(class(ErrorResponse::unavailable("down")), ErrorClass::Transient);
        assert_eq!(class(ErrorResponse::expired("3")), ErrorClass::Transient);
        assert_eq!(
            ClientError::Timeout(Duration::from_secs(1)).class(),
            ErrorClass::Timeout
        );
    }
}
