use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy shared by every client and the orchestrator.
///
/// `Validation` never reaches the network. `MissingCredential` is raised
/// before a request is attempted. `ExternalService` is the uniform shape
/// for non-2xx responses, transport failures and malformed payloads, one
/// per provider.
#[derive(Debug, Error)]
pub enum LanternError {
    #[error("{0}")]
    Validation(String),

    #[error("{provider} credential missing: set {variable}")]
    MissingCredential {
        provider: &'static str,
        variable: &'static str,
    },

    #[error("{provider}: {message}")]
    ExternalService { provider: String, message: String },

    #[error("unsupported file type: {}", .0.display())]
    UnsupportedFile(PathBuf),
}

impl LanternError {
    pub fn external(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalService {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Stable name used in event payloads and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::MissingCredential { .. } => "missing_credential",
            Self::ExternalService { .. } => "external_service",
            Self::UnsupportedFile(_) => "unsupported_file",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LanternError;

    #[test]
    fn external_service_message_names_the_provider() {
        let err = LanternError::external("serper", "request failed (500): boom");
        assert_eq!(err.to_string(), "serper: request failed (500): boom");
        assert_eq!(err.kind(), "external_service");
    }

    #[test]
    fn missing_credential_points_at_the_variable() {
        let err = LanternError::MissingCredential {
            provider: "together",
            variable: "TOGETHER_API_KEY",
        };
        assert_eq!(
            err.to_string(),
            "together credential missing: set TOGETHER_API_KEY"
        );
        assert_eq!(err.kind(), "missing_credential");
    }
}
