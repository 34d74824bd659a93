//! Error types for the HWC2 compat layer
//!
//! Every composer operation returns [`crate::Result`]. `Ok` is `NONE` (0) at
//! the C boundary and each [`Error`] variant carries its HWC2 wire code.

use thiserror::Error;

/// Code returned across the C ABI for success.
pub const ERROR_NONE: i32 = 0;

/// Historical error code that validate reuses to mean "has changes".
pub const ERROR_HAS_CHANGES: i32 = 5;

/// Normalized HWC2 error, shared by both protocol adapters.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    #[error("bad config")]
    BadConfig,

    #[error("bad display")]
    BadDisplay,

    #[error("bad layer")]
    BadLayer,

    #[error("bad parameter")]
    BadParameter,

    /// Not a failure. Validate succeeded but left composition-type or request
    /// changes that the caller must read and accept.
    #[error("has changes")]
    HasChanges,

    #[error("no resources")]
    NoResources,

    #[error("not validated")]
    NotValidated,

    #[error("unsupported")]
    Unsupported,

    #[error("seamless not allowed")]
    SeamlessNotAllowed,

    #[error("seamless not possible")]
    SeamlessNotPossible,

    #[error("unknown error {0}")]
    Unknown(i32),
}

impl Error {
    /// Wire code of this error.
    pub fn code(self) -> i32 {
        match self {
            Error::BadConfig => 1,
            Error::BadDisplay => 2,
            Error::BadLayer => 3,
            Error::BadParameter => 4,
            Error::HasChanges => ERROR_HAS_CHANGES,
            Error::NoResources => 6,
            Error::NotValidated => 7,
            Error::Unsupported => 8,
            Error::SeamlessNotAllowed => 9,
            Error::SeamlessNotPossible => 10,
            Error::Unknown(code) => code,
        }
    }

    /// Decode a wire code. `0` decodes to `Ok(())`.
    pub fn check(code: i32) -> crate::Result<()> {
        let error = match code {
            ERROR_NONE => return Ok(()),
            1 => Error::BadConfig,
            2 => Error::BadDisplay,
            3 => Error::BadLayer,
            4 => Error::BadParameter,
            ERROR_HAS_CHANGES => Error::HasChanges,
            6 => Error::NoResources,
            7 => Error::NotValidated,
            8 => Error::Unsupported,
            9 => Error::SeamlessNotAllowed,
            10 => Error::SeamlessNotPossible,
            other => Error::Unknown(other),
        };
        Err(error)
    }

    pub fn is_has_changes(self) -> bool {
        self == Error::HasChanges
    }
}

/// Collapse a result into the integer the C ABI hands back.
pub fn to_code<T>(result: &crate::Result<T>) -> i32 {
    match result {
        Ok(_) => ERROR_NONE,
        Err(e) => e.code(),
    }
}

/// Failure of a call into the composition server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The server ran the call and answered with an HWC2 error code.
    #[error("service-specific error {0}")]
    ServiceSpecific(i32),

    /// The call never completed (dead binder, queue failure, ...).
    #[error("transport failure: {0}")]
    Transport(String),
}

impl From<Error> for RpcError {
    fn from(e: Error) -> Self {
        RpcError::ServiceSpecific(e.code())
    }
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::ServiceSpecific(code) => match Error::check(code) {
                Err(error) => error,
                // A failed status that claims success carries no usable code.
                Ok(()) => Error::NoResources,
            },
            RpcError::Transport(_) => Error::NoResources,
        }
    }
}

/// Result of a transport call.
pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Normalize a transport result, logging calls that never reached the server.
pub(crate) fn from_rpc<T>(call: &str, result: RpcResult<T>) -> crate::Result<T> {
    result.map_err(|e| {
        match &e {
            RpcError::Transport(reason) => tracing::error!("{} failed: {}", call, reason),
            RpcError::ServiceSpecific(code) => tracing::debug!("{} returned {}", call, code),
        }
        Error::from(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip_through_check() {
        for code in 1..=10 {
            let err = Error::check(code).unwrap_err();
            assert_eq!(err.code(), code);
        }
        assert_eq!(Error::check(0), Ok(()));
        assert_eq!(Error::check(42), Err(Error::Unknown(42)));
    }

    #[test]
    fn test_has_changes_is_named_sentinel() {
        assert_eq!(Error::HasChanges.code(), 5);
        assert!(Error::check(5).unwrap_err().is_has_changes());
        assert!(!Error::NoResources.is_has_changes());
    }

    #[test]
    fn test_rpc_error_conversion() {
        assert_eq!(Error::from(RpcError::Transport("dead".into())), Error::NoResources);
        assert_eq!(Error::from(RpcError::ServiceSpecific(8)), Error::Unsupported);
        assert_eq!(Error::from(RpcError::ServiceSpecific(0)), Error::NoResources);
    }

    #[test]
    fn test_from_rpc_passes_values_through() {
        assert_eq!(from_rpc("get", Ok::<u32, RpcError>(9)), Ok(9));
        assert_eq!(
            from_rpc::<()>("set", Err(RpcError::ServiceSpecific(2))),
            Err(Error::BadDisplay)
        );
    }

    #[test]
    fn test_to_code() {
        let ok: crate::Result<u32> = Ok(3);
        let err: crate::Result<u32> = Err(Error::BadLayer);
        assert_eq!(to_code(&ok), ERROR_NONE);
        assert_eq!(to_code(&err), 3);
    }
}
