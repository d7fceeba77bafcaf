use derive_more::Display;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the chest lifecycle engine, matching the six HTTP
/// status families the external interface promises.
#[derive(Debug, Display)]
pub enum Error {
    #[display("bad request: {msg}")]
    BadRequest { msg: String },

    #[display("unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[display("TOTP code required")]
    TotpRequired,

    #[display("invalid TOTP code")]
    InvalidTotp,

    #[display("forbidden: {reason}")]
    Forbidden { reason: String },

    #[display("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[display("session already sealed: {session_id}")]
    AlreadySealed { session_id: String },

    #[display("retrieval code not found")]
    CodeNotFound,

    #[display("file not found: {file_id}")]
    FileNotFound { file_id: String },

    #[display("blob missing from store: {key}")]
    BlobMissing { key: String },

    #[display("retrieval code collision, retries exhausted")]
    CodeCollision,

    #[display("internal error: {msg}")]
    Internal { msg: String },
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Internal {
            msg: error.to_string(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Error::Internal {
            msg: format!("metadata store error: {error}"),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Error::Internal {
            msg: format!("migration error: {error}"),
        }
    }
}

impl From<crate::token::TokenError> for Error {
    fn from(error: crate::token::TokenError) -> Self {
        Error::Unauthorized {
            reason: error.to_string(),
        }
    }
}

/// Attaches the path a filesystem operation failed on to the error message,
/// since a bare `io::Error` gives no hint which of many paths was involved.
pub trait ResultIoExt<T> {
    fn map_io_err(self, path: &std::path::Path) -> Result<T>;
}

impl<T> ResultIoExt<T> for std::result::Result<T, std::io::Error> {
    fn map_io_err(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| Error::Internal {
            msg: format!("{}: {e}", path.display()),
        })
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            Error::BadRequest { msg } => (axum::http::StatusCode::BAD_REQUEST, msg.clone()),
            Error::Unauthorized { reason } => {
                tracing::debug!(reason, "unauthorized request");
                (
                    axum::http::StatusCode::UNAUTHORIZED,
                    "unauthorized".to_string(),
                )
            }
            Error::TotpRequired => (
                axum::http::StatusCode::UNAUTHORIZED,
                "TOTP code required".to_string(),
            ),
            Error::InvalidTotp => (
                axum::http::StatusCode::UNAUTHORIZED,
                "invalid TOTP code".to_string(),
            ),
            Error::Forbidden { reason } => (axum::http::StatusCode::FORBIDDEN, reason.clone()),
            Error::SessionNotFound { .. } => (
                axum::http::StatusCode::NOT_FOUND,
                "session not found".to_string(),
            ),
            Error::AlreadySealed { .. } => (
                axum::http::StatusCode::NOT_FOUND,
                "session already sealed".to_string(),
            ),
            Error::CodeNotFound => (
                axum::http::StatusCode::NOT_FOUND,
                "retrieval code not found".to_string(),
            ),
            Error::FileNotFound { .. } => (
                axum::http::StatusCode::NOT_FOUND,
                "file not found".to_string(),
            ),
            Error::BlobMissing { key } => {
                tracing::error!(key, "blob missing from store for a live file row");
                (
                    axum::http::StatusCode::NOT_FOUND,
                    "file not found".to_string(),
                )
            }
            Error::CodeCollision => (
                axum::http::StatusCode::CONFLICT,
                "could not allocate a unique retrieval code, try again".to_string(),
            ),
            Error::Internal { msg } => {
                tracing::error!(error = %msg, "internal error");
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let body = axum::Json(serde_json::json!({ "error": message }));
        (status, body).into_response()
    }
}
