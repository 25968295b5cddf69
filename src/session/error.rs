use crate::capture::CaptureError;
use crate::transport::TransportError;

/// Errors surfaced by the session controller
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{0} permission denied")]
    PermissionDenied(&'static str),

    #[error("capture failed: {0}")]
    CaptureFailure(CaptureError),

    #[error("no response within {0:?}")]
    ResponseTimeout(std::time::Duration),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("a session is already active")]
    SessionActive,
}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied(what) => SessionError::PermissionDenied(what),
            other => SessionError::CaptureFailure(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_errors_are_distinguished() {
        assert!(matches!(
            SessionError::from(CaptureError::PermissionDenied("microphone")),
            SessionError::PermissionDenied("microphone")
        ));
        assert!(matches!(
            SessionError::from(CaptureError::NoDevice("microphone")),
            SessionError::CaptureFailure(CaptureError::NoDevice("microphone"))
        ));
    }

    #[test]
    fn test_display() {
        let err = SessionError::ProtocolViolation("duplicate turn completion".to_string());
        assert_eq!(err.to_string(), "protocol violation: duplicate turn completion");
    }
}
