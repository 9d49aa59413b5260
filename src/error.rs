use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    // Auth errors
    InvalidApiKey,
    InvalidToken,
    TokenExpired,
    // Routing and consensus errors
    NotOwner(String),
    NotLeader(Option<String>),
    EmptyRing,
    InsufficientNodes { available: usize, requested: usize },
    PeerUnreachable(String),
    // Store errors
    VersionConflict(u64),
    // Process errors
    ConfigurationError(String),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InvalidApiKey => write!(f, "Invalid API key"),
            AppError::InvalidToken => write!(f, "Invalid token"),
            AppError::TokenExpired => write!(f, "Token expired"),
            AppError::NotOwner(owner) => write!(f, "Key belongs to node {}", owner),
            AppError::NotLeader(leader) => match leader {
                Some(id) => write!(f, "Not leader. Current leader: {}", id),
                None => write!(f, "Not leader. No leader elected"),
            },
            AppError::EmptyRing => write!(f, "Hash ring is empty"),
            AppError::InsufficientNodes {
                available,
                requested,
            } => write!(
                f,
                "Not enough nodes for requested replication: {} available, {} requested",
                available, requested
            ),
            AppError::PeerUnreachable(msg) => write!(f, "Peer unreachable: {}", msg),
            AppError::VersionConflict(current) => {
                write!(f, "Version conflict: current version is {}", current)
            }
            AppError::ConfigurationError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::InvalidApiKey | AppError::InvalidToken | AppError::TokenExpired => {
                (StatusCode::UNAUTHORIZED, self.to_string())
            }
            AppError::NotOwner(_) | AppError::NotLeader(_) => {
                (StatusCode::MISDIRECTED_REQUEST, self.to_string())
            }
            AppError::VersionConflict(_) => (StatusCode::CONFLICT, self.to_string()),
            AppError::EmptyRing
            | AppError::InsufficientNodes { .. }
            | AppError::PeerUnreachable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::ConfigurationError(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_keep_client_visible_substrings() {
        assert_eq!(AppError::InvalidApiKey.to_string(), "Invalid API key");
        assert_eq!(AppError::InvalidToken.to_string(), "Invalid token");
        assert_eq!(AppError::TokenExpired.to_string(), "Token expired");
        assert!(AppError::NotOwner("node_2".to_string())
            .to_string()
            .contains("belongs to node node_2"));
        assert!(AppError::NotLeader(Some("node_1".to_string()))
            .to_string()
            .contains("Not leader"));
        assert!(AppError::VersionConflict(4)
            .to_string()
            .contains("Version conflict"));
    }
}
