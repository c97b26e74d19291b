// Copyright 2025 Lablup Inc. and Jeongkyu Shin
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

//! Error taxonomy shared by the SFTP gateway and the web authenticator.
//!
//! Display strings are deliberately generic: they are safe to hand back to a
//! remote client and never contain a resolved or absolute filesystem path.

use std::io;

use russh_sftp::protocol::StatusCode;
use thiserror::Error;

/// Errors produced while confining, authenticating, or serving a request.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The cleaned request path still climbs above the share root.
    #[error("path escapes the shared directory")]
    PathTraversal,

    /// The request path matches a configured exclude pattern.
    #[error("no such file")]
    ExcludedPath,

    /// The operation is never permitted (writes, symlinks).
    #[error("operation not permitted: {0}")]
    Unsupported(&'static str),

    /// Credentials were rejected.
    #[error("authentication failed")]
    AuthenticationFailure,

    /// The source address has too many recent failures.
    #[error("too many failed attempts")]
    RateLimitExceeded,

    /// A session token was malformed, forged, or expired.
    #[error("session invalid or expired")]
    SessionInvalidOrExpired,

    /// Malformed framing; fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The backing storage failed.
    #[error("storage error")]
    Storage(#[source] io::Error),

    /// No I/O happened within the configured idle window.
    #[error("connection idle timeout")]
    IdleTimeout,
}

impl GatewayError {
    /// Map to the nearest SFTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::PathTraversal => StatusCode::PermissionDenied,
            GatewayError::ExcludedPath => StatusCode::NoSuchFile,
            GatewayError::Unsupported("readlink") => StatusCode::OpUnsupported,
            GatewayError::Unsupported(_) => StatusCode::PermissionDenied,
            GatewayError::AuthenticationFailure
            | GatewayError::RateLimitExceeded
            | GatewayError::SessionInvalidOrExpired => StatusCode::PermissionDenied,
            GatewayError::Storage(err) => match err.kind() {
                io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
                _ => StatusCode::NoSuchFile,
            },
            GatewayError::Protocol(_) | GatewayError::IdleTimeout => StatusCode::Failure,
        }
    }

    /// Returns `true` for errors that mean "this path does not exist as far
    /// as the client is concerned".
    pub fn is_not_found(&self) -> bool {
        matches!(self.status_code(), StatusCode::NoSuchFile)
    }
}

impl From<io::Error> for GatewayError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            GatewayError::IdleTimeout
        } else {
            GatewayError::Storage(err)
        }
    }
}

/// Convenience alias used throughout the crate.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::PathTraversal.status_code(),
            StatusCode::PermissionDenied
        );
        assert_eq!(GatewayError::ExcludedPath.status_code(), StatusCode::NoSuchFile);
        assert_eq!(
            GatewayError::Unsupported("write").status_code(),
            StatusCode::PermissionDenied
        );
        assert_eq!(
            GatewayError::Unsupported("readlink").status_code(),
            StatusCode::OpUnsupported
        );
        assert_eq!(
            GatewayError::Protocol("bad frame".into()).status_code(),
            StatusCode::Failure
        );
    }

    #[test]
    fn test_storage_errors_look_like_missing_files() {
        let err = GatewayError::from(io::Error::new(io::ErrorKind::Other, "disk on fire"));
        assert!(err.is_not_found());

        let err = GatewayError::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(err.status_code(), StatusCode::PermissionDenied);
    }

    #[test]
    fn test_messages_never_carry_paths() {
        let err = GatewayError::from(io::Error::new(
            io::ErrorKind::NotFound,
            "/srv/share/secret.txt not found",
        ));
        assert!(!err.to_string().contains("/srv"));
        assert_eq!(GatewayError::ExcludedPath.to_string(), "no such file");
    }

    #[test]
    fn test_timed_out_io_is_idle_timeout() {
        let err = GatewayError::from(io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(err, GatewayError::IdleTimeout));
    }
}
