//! A minimal gRPC-style status type used to carry errors across the LB
//! policy tree (see `PickResult::Fail`/`Drop` and `UpdateArgs.addresses`).
//!
//! Kept crate-local (rather than depending on a full gRPC transport crate)
//! the same way `crate::client::lb::LoadBalancingError` and
//! `crate::xds::uri::XdsUriError` define their own small error enums.

use std::fmt;

/// gRPC status codes relevant to load balancing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A status describing the outcome of a pick or an update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_status_is_ok() {
        assert!(Status::ok().is_ok());
        assert!(!Status::unavailable("down").is_ok());
    }

    #[test]
    fn display_includes_code_and_message() {
        let s = Status::unavailable("empty address list: no addresses resolved");
        let rendered = s.to_string();
        assert!(rendered.contains("Unavailable"));
        assert!(rendered.contains("empty address list"));
    }
}
