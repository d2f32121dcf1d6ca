use std::io;

use thiserror::Error;

use crate::protocol::ErrorCode;

/// Terminal conditions of a transfer session.
///
/// `Local` is reported to the peer as an ERROR packet exactly once before
/// the session closes; `Peer` and `TransmitTimeout` close the session with
/// no reply (the peer either already knows or has vanished).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{code}: {message}")]
    Local { code: ErrorCode, message: String },
    #[error("peer error {code}: {message}")]
    Peer { code: ErrorCode, message: String },
    #[error("no reply after {retries} retransmissions")]
    TransmitTimeout { retries: u32 },
}

impl SessionError {
    pub fn local(code: ErrorCode, message: impl Into<String>) -> Self {
        SessionError::Local {
            code,
            message: message.into(),
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileExists,
            _ => ErrorCode::Undefined,
        };
        SessionError::Local {
            code,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_kinds_map_to_tftp_codes() {
        let err = SessionError::from(io::Error::new(io::ErrorKind::NotFound, "nope"));
        assert!(matches!(
            err,
            SessionError::Local {
                code: ErrorCode::FileNotFound,
                ..
            }
        ));

        let err = SessionError::from(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(matches!(
            err,
            SessionError::Local {
                code: ErrorCode::AccessViolation,
                ..
            }
        ));

        let err = SessionError::from(io::Error::other("boom"));
        assert!(matches!(
            err,
            SessionError::Local {
                code: ErrorCode::Undefined,
                ..
            }
        ));
    }
}
