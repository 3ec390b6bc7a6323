use serde::ser::Serializer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("float parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),
    #[error("render error: {0}")]
    Render(String),
    #[error("reconnect attempts exhausted after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },
    #[error("session closed")]
    SessionClosed,
}

/// Coarse classification used to pick a recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientNetwork,
    MalformedMessage,
    WorkerUnavailable,
    Storage,
    ExhaustedRetries,
    InvalidInput,
    Internal,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WebSocket(_) | Self::Io(_) => ErrorKind::TransientNetwork,
            Self::MalformedMessage(_) | Self::SimdJson(_) | Self::ParseFloat(_) => {
                ErrorKind::MalformedMessage
            }
            Self::WorkerUnavailable(_) | Self::Render(_) => ErrorKind::WorkerUnavailable,
            Self::Sqlx(_) | Self::Migration(_) => ErrorKind::Storage,
            Self::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            Self::InvalidArgument(_) => ErrorKind::InvalidInput,
            Self::SessionClosed => ErrorKind::Internal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientNetwork
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors_into_recovery_kinds() {
        let io = AppError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(io.kind(), ErrorKind::TransientNetwork);
        assert!(io.is_transient());

        let malformed = AppError::MalformedMessage("missing symbol".to_string());
        assert_eq!(malformed.kind(), ErrorKind::MalformedMessage);
        assert!(!malformed.is_transient());

        assert_eq!(
            AppError::ExhaustedRetries { attempts: 3 }.kind(),
            ErrorKind::ExhaustedRetries
        );
        assert_eq!(
            AppError::WorkerUnavailable("spawn failed".to_string()).kind(),
            ErrorKind::WorkerUnavailable
        );
    }

    #[test]
    fn serializes_as_display_string() {
        let error = AppError::ExhaustedRetries { attempts: 4 };
        let encoded = simd_json::serde::to_string(&error).expect("error should serialize");
        assert_eq!(encoded, "\"reconnect attempts exhausted after 4 attempts\"");
    }
}
