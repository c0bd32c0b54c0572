//! PostgreSQL v3 wire protocol constants.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

/// Protocol version 3.0 as sent in the StartupMessage.
pub const PROTOCOL_VERSION: i32 = 196608;

/// Largest backend message accepted (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Backend (server → client) message tag bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendTag {
    AuthenticationRequest,
    ParameterStatus,
    BackendKeyData,
    ReadyForQuery,
    RowDescription,
    DataRow,
    CommandComplete,
    ErrorResponse,
    NoticeResponse,
    ParseComplete,
    BindComplete,
    NoData,
    EmptyQueryResponse,
    Other(u8),
}

impl From<u8> for BackendTag {
    fn from(b: u8) -> Self {
        match b {
            b'R' => BackendTag::AuthenticationRequest,
            b'S' => BackendTag::ParameterStatus,
            b'K' => BackendTag::BackendKeyData,
            b'Z' => BackendTag::ReadyForQuery,
            b'T' => BackendTag::RowDescription,
            b'D' => BackendTag::DataRow,
            b'C' => BackendTag::CommandComplete,
            b'E' => BackendTag::ErrorResponse,
            b'N' => BackendTag::NoticeResponse,
            b'1' => BackendTag::ParseComplete,
            b'2' => BackendTag::BindComplete,
            b'n' => BackendTag::NoData,
            b'I' => BackendTag::EmptyQueryResponse,
            other => BackendTag::Other(other),
        }
    }
}

/// Authentication sub-types from AuthenticationRequest messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Ok,
    CleartextPassword,
    MD5Password,
    SASLInit,
    SASLContinue,
    SASLFinal,
}

impl AuthType {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(AuthType::Ok),
            3 => Some(AuthType::CleartextPassword),
            5 => Some(AuthType::MD5Password),
            10 => Some(AuthType::SASLInit),
            11 => Some(AuthType::SASLContinue),
            12 => Some(AuthType::SASLFinal),
            _ => None,
        }
    }
}

/// Transaction status indicator from ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}
