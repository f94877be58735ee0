//! Error types for Cormorant

use thiserror::Error;

/// Main error type for Cormorant
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Cormorant
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used by the protocol layer to pick
/// the status response for a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Command not valid in the current state
    Sequencing,
    /// Unknown user, wrong password, malformed SASL payload
    Credentials,
    /// Mailbox or message does not exist
    NotFound,
    /// Request conflicts with existing state
    Conflict,
    /// The connection cannot continue
    Transport,
    /// Anything else
    Internal,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidCredentials | Error::Auth(_) => ErrorKind::Credentials,
            Error::InvalidState(_) | Error::Unsupported(_) | Error::Validation(_) => {
                ErrorKind::Sequencing
            }
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) | Error::PermissionDenied(_) => ErrorKind::Conflict,
            Error::Tls(_) | Error::Io(_) => ErrorKind::Transport,
            Error::Config(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the connection must be torn down after this error
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// Returns the RFC 5530 response code for this error
    pub fn response_code(&self) -> &'static str {
        match self {
            Error::InvalidCredentials | Error::Auth(_) => "AUTHENTICATIONFAILED",
            Error::Unsupported(_) => "CANNOT",
            Error::InvalidState(_) | Error::Validation(_) => "CLIENTBUG",
            Error::NotFound(_) => "NONEXISTENT",
            Error::AlreadyExists(_) => "ALREADYEXISTS",
            Error::PermissionDenied(_) => "CANNOT",
            Error::Tls(_) | Error::Io(_) => "UNAVAILABLE",
            Error::Config(_) | Error::Internal(_) => "SERVERBUG",
        }
    }

    /// Text that can be shown to the client without disclosing which
    /// credential check failed or leaking internal details.
    pub fn client_message(&self) -> String {
        match self.kind() {
            ErrorKind::Credentials => "Authentication failed".to_string(),
            ErrorKind::Internal | ErrorKind::Transport => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_credential_errors_are_indistinguishable() {
        let wrong_password = Error::InvalidCredentials;
        let malformed = Error::Auth("expected 3 fields, got 2".to_string());

        assert_eq!(wrong_password.kind(), ErrorKind::Credentials);
        assert_eq!(malformed.kind(), ErrorKind::Credentials);
        assert_eq!(wrong_password.client_message(), malformed.client_message());
        assert_eq!(wrong_password.response_code(), malformed.response_code());
    }

    #[test]
    fn test_not_found_keeps_its_message() {
        let err = Error::NotFound("No such mailbox: Archive".to_string());
        assert_eq!(err.response_code(), "NONEXISTENT");
        assert!(err.client_message().contains("Archive"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_io_is_fatal() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert!(err.is_fatal());
        assert_eq!(err.client_message(), "Internal server error");
    }
}
