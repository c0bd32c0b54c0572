use thiserror::Error;

/// Errors returned by partita-pg operations.
#[derive(Debug, Error)]
pub enum PgError {
    /// I/O error from the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation or unexpected message from server.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Auth error: {0}")]
    Auth(String),

    /// Server-sent ErrorResponse.
    #[error("PG {severity}: {message} ({code})")]
    Server {
        severity: String,
        code: String,
        message: String,
    },

    /// The server hung up, or the connection was already marked broken.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl PgError {
    /// The SQLSTATE of a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            PgError::Server { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether the connection can no longer be used after this error.
    ///
    /// Covers socket failures and the server-side codes for a connection
    /// that is being torn down (class 08, admin/crash shutdown).
    pub fn is_connection_loss(&self) -> bool {
        match self {
            PgError::Io(_) | PgError::Protocol(_) | PgError::ConnectionClosed => true,
            PgError::Server { code, .. } => {
                code.starts_with("08") || matches!(code.as_str(), "57P01" | "57P02" | "57P03")
            }
            PgError::Auth(_) => false,
        }
    }
}

pub type PgResult<T> = Result<T, PgError>;
