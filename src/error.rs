use thiserror::Error;

/// Why a generation request did not produce a response body.
///
/// `Display` is the text shown to the user, verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerateError {
    #[error("Error: API key not set")]
    CredentialMissing,

    #[error("Error: Failed to connect (status {status})")]
    ConnectionFailed { status: u16, reason: String },

    #[error("API error {status}:\n{body}")]
    ServerError { status: u16, body: String },

    #[error("Error: a generation is already in progress")]
    Busy,
}
