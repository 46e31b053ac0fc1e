use crate::models::{Handle, ProvenValue};
use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Failures of ledger operations. Every variant leaves marketplace state untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarketError {
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("invalid time range: start {start} must be before end {end}")]
    InvalidTimeRange { start: u64, end: u64 },

    #[error("price must be greater than zero")]
    InvalidPrice,

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    #[error("dataset {0} already sold")]
    AlreadySold(u64),

    /// Carries the committed plaintexts so callers can use them directly.
    #[error("target already has a proven plaintext")]
    AlreadyProven { values: Vec<ProvenValue> },

    #[error("insufficient payment: price {price}, paid {paid}")]
    InsufficientPayment { price: u64, paid: u64 },

    #[error("no funds to withdraw")]
    NoFunds,

    #[error("access denied for handle {0}")]
    AccessDenied(Handle),

    #[error("decryption proof rejected: {0}")]
    ProofInvalid(String),

    #[error("decryption request names no handles")]
    EmptyRequest,

    #[error("handle {0} requested twice")]
    DuplicateHandle(Handle),

    #[error("handle {0} does not belong to the target")]
    HandleNotInTarget(Handle),

    #[error("decryption request {0} not found")]
    RequestNotFound(Uuid),

    #[error("payout transfer failed: {0}")]
    TransferFailed(String),

    #[error("balance overflow")]
    BalanceOverflow,

    #[error("corrupt ledger state: {0}")]
    CorruptState(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Market(#[from] MarketError),

    #[error("internal error")]
    Internal,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    proven: Option<Vec<ProvenValue>>,
}

fn market_status(err: &MarketError) -> StatusCode {
    match err {
        MarketError::NotFound { .. } | MarketError::RequestNotFound(_) => StatusCode::NOT_FOUND,
        MarketError::AlreadySold(_) | MarketError::AlreadyProven { .. } => StatusCode::CONFLICT,
        MarketError::AccessDenied(_) => StatusCode::FORBIDDEN,
        MarketError::InsufficientPayment { .. } | MarketError::NoFunds => StatusCode::PAYMENT_REQUIRED,
        MarketError::ProofInvalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
        MarketError::TransferFailed(_) => StatusCode::BAD_GATEWAY,
        MarketError::BalanceOverflow | MarketError::CorruptState(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg, proven) = match &self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone(), None),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string(), None),
            ApiError::Market(e) => {
                let proven = match e {
                    MarketError::AlreadyProven { values } => Some(values.clone()),
                    _ => None,
                };
                (market_status(e), e.to_string(), proven)
            }
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string(), None),
        };

        (status, Json(ErrorBody { error: msg, proven })).into_response()
    }
}
