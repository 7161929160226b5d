use thiserror::Error;

/// Creates an anyhow error with the current file and line number
#[macro_export]
macro_rules! file_error {
    ($($arg:tt)*) => {
        anyhow::anyhow!(
            "[{}:{}] {}",
            std::path::Path::new(file!()).file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            line!(),
            format!($($arg)*)
        )
    };
}

/// Creates an anyhow error with the current file and line number, and includes a source error
#[macro_export]
macro_rules! file_error_with_source {
    ($source:expr, $($arg:tt)*) => {
        anyhow::anyhow!(
            "[{}:{}] {}: {}",
            std::path::Path::new(file!()).file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            line!(),
            format!($($arg)*),
            $source
        )
    };
}

/// Failure taxonomy of the protocol engine.
///
/// These travel inside `anyhow::Error`; the session driver uses
/// `downcast_ref::<ProtocolError>()` to tell per-device outcomes
/// (invalid password, end of data) apart from fatal ones.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("no data received")]
    NoData,
    #[error("bad argument: {0}")]
    BadArgument(String),
    #[error("checksum invalid: computed {computed:#06x}, received {received:#06x}")]
    ChecksumInvalid { computed: u16, received: u16 },
    #[error("buffer overflow: {0} bytes")]
    BufferOverflow(usize),
    #[error("archive holds no data for the requested span")]
    ArchiveNoData,
    #[error("initialization failed: {0}")]
    InitFailed(String),
    #[error("invalid password")]
    InvalidPassword,
    // never leaves the correlator
    #[error("retry requested")]
    RetryRequested,
    #[error("end of data")]
    EndOfData,
    #[error("privilege denied")]
    PrivilegeDenied,
    #[error("logon failed with code {0:#06x}")]
    LogonFailed(u16),
    #[error("communication error: {0}")]
    CommunicationError(String),
    #[error("truncated frame: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("malformed frame: {0}")]
    Format(String),
}

impl ProtocolError {
    /// Looks for a `ProtocolError` inside an `anyhow::Error`.
    pub fn of(err: &anyhow::Error) -> Option<&ProtocolError> {
        err.downcast_ref::<ProtocolError>()
    }

    /// Errors that end a whole request rather than a single frame.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::RetryRequested | Self::Format(_) | Self::Truncated { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_errors_survive_anyhow() {
        let err: anyhow::Error = ProtocolError::InvalidPassword.into();
        assert_eq!(ProtocolError::of(&err), Some(&ProtocolError::InvalidPassword));

        let err = file_error!("plain {}", 1);
        assert!(ProtocolError::of(&err).is_none());
        assert!(err.to_string().contains("error.rs"));
    }

    #[test]
    fn malformed_frames_are_not_fatal() {
        assert!(!ProtocolError::Format("x".into()).is_fatal());
        assert!(!ProtocolError::Truncated { needed: 4, got: 2 }.is_fatal());
        assert!(ProtocolError::ChecksumInvalid { computed: 1, received: 2 }.is_fatal());
        assert!(ProtocolError::NoData.is_fatal());
    }
}
