use crate::capability::DecryptionResult;
use crate::datasets::DatasetListing;
use crate::db;
use crate::decryption::{CommitOutcome, DecryptionState, PendingDecryption};
use crate::errors::{ApiError, MarketError};
use crate::models::*;
use crate::records::RecordSubmission;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;
use zk_proofs::groth16::serialize_vk;
use zk_proofs::types::FrHex;

pub const PRINCIPAL_HEADER: &str = "X-PRINCIPAL";

#[derive(Debug, Deserialize)]
pub struct ListEventsParams {
    pub after: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct EventItem {
    pub seq: u64,
    #[serde(flatten)]
    pub event: MarketEvent,
}

pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/api/v1/records", post(submit_record))
        .route("/api/v1/datasets", post(create_dataset))
        .route("/api/v1/datasets/:id/purchase", post(purchase))
        .route("/api/v1/escrow/withdraw", post(withdraw))
        .route("/api/v1/decryptions", post(request_decryption))
        .route("/api/v1/decryptions/:id/commit", post(commit_decryption))
        .route("/api/v1/dev/encrypt", post(dev_encrypt))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/records/:id", get(get_record))
        .route("/api/v1/datasets/:id", get(get_dataset))
        .route("/api/v1/datasets/:id/available", get(availability))
        .route("/api/v1/escrow/:owner", get(escrow_balance))
        .route("/api/v1/decryptions", get(pending_decryptions))
        .route("/api/v1/decryptions/:id", get(get_decryption))
        .route("/api/v1/events", get(list_events))
        .route("/api/v1/zk/keys", get(zk_keys))
        .merge(protected_routes)
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(provided_key) = headers.get("X-API-KEY") {
        if provided_key == state.config.api_key.as_str() {
            return Ok(next.run(request).await);
        }
    }

    tracing::warn!("unauthorized access attempt");
    Err(StatusCode::UNAUTHORIZED)
}

/// The calling principal, from `X-PRINCIPAL`.
fn caller(headers: &HeaderMap) -> Result<Principal, ApiError> {
    let name = headers
        .get(PRINCIPAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("missing {PRINCIPAL_HEADER} header")))?;
    Ok(Principal::new(name))
}

async fn submit_record(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RecordSubmitRequest>,
) -> Result<Json<RecordSubmitResponse>, ApiError> {
    let ctx = TxContext::now(caller(&headers)?);
    let submission = RecordSubmission {
        speed: req.speed.try_into()?,
        location_x: req.location_x.try_into()?,
        location_y: req.location_y.try_into()?,
    };

    let record_id = state.execute(|ledger| ledger.submit_record(&ctx, submission)).await?;
    Ok(Json(RecordSubmitResponse { record_id }))
}

async fn get_record(State(state): State<AppState>, Path(id): Path<u64>) -> Result<Json<RecordGetResponse>, ApiError> {
    let response = state
        .read(|ledger| {
            Ok::<_, MarketError>(RecordGetResponse {
                record: ledger.get_record(id)?.clone(),
                proven: ledger.record_plaintexts(id)?,
            })
        })
        .await?;
    Ok(Json(response))
}

async fn create_dataset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DatasetCreateRequest>,
) -> Result<Json<DatasetCreateResponse>, ApiError> {
    let ctx = TxContext::now(caller(&headers)?);
    let listing = DatasetListing {
        value: req.value.try_into()?,
        start_time: req.start_time,
        end_time: req.end_time,
        price: req.price,
    };

    let dataset_id = state.execute(|ledger| ledger.create_dataset(&ctx, listing)).await?;
    Ok(Json(DatasetCreateResponse { dataset_id }))
}

async fn get_dataset(State(state): State<AppState>, Path(id): Path<u64>) -> Result<Json<DatasetGetResponse>, ApiError> {
    let response = state
        .read(|ledger| {
            let dataset = ledger.get_dataset(id)?.clone();
            Ok::<_, MarketError>(DatasetGetResponse { available: !dataset.sold, dataset })
        })
        .await?;
    Ok(Json(response))
}

async fn availability(State(state): State<AppState>, Path(id): Path<u64>) -> Json<AvailabilityResponse> {
    let available = state.read(|ledger| ledger.is_available(id)).await;
    Json(AvailabilityResponse { dataset_id: id, available })
}

async fn purchase(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    headers: HeaderMap,
    Json(req): Json<PurchaseRequest>,
) -> Result<StatusCode, ApiError> {
    let ctx = TxContext::now(caller(&headers)?);
    state.execute(|ledger| ledger.purchase(&ctx, id, req.payment)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn withdraw(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<WithdrawResponse>, ApiError> {
    let amount = state.withdraw(caller(&headers)?).await?;
    Ok(Json(WithdrawResponse { amount }))
}

async fn escrow_balance(State(state): State<AppState>, Path(owner): Path<String>) -> Json<EscrowResponse> {
    let owner = Principal::new(owner);
    let balance = state.read(|ledger| ledger.escrow_balance(&owner)).await;
    Json(EscrowResponse { owner, balance })
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(
        state
            .read(|ledger| StatsResponse {
                total_records: ledger.total_records(),
                total_datasets: ledger.total_datasets(),
                funds_held: ledger.funds_held(),
                pending_decryptions: ledger.pending_decryptions().len(),
            })
            .await,
    )
}

async fn request_decryption(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DecryptionCreateRequest>,
) -> Result<Json<DecryptionCreateResponse>, ApiError> {
    let ctx = TxContext::now(caller(&headers)?);
    let request_id = state
        .execute(|ledger| ledger.request_decryption(&ctx, req.target, req.handles))
        .await?;
    Ok(Json(DecryptionCreateResponse { request_id, state: DecryptionState::Requested }))
}

async fn commit_decryption(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<DecryptionCommitRequest>,
) -> Result<Json<DecryptionCommitResponse>, ApiError> {
    let ctx = TxContext::now(caller(&headers)?);
    let proof = base64::engine::general_purpose::STANDARD
        .decode(req.proof_b64)
        .map_err(|_| ApiError::BadRequest("invalid proof_b64".to_string()))?;
    let result = DecryptionResult { clear_values: req.clear_values, proof };

    let outcome = state.execute(|ledger| ledger.commit_decryption(&ctx, &id, &result)).await?;
    Ok(Json(DecryptionCommitResponse {
        request_id: id,
        newly_committed: matches!(outcome, CommitOutcome::Committed(_)),
        values: outcome.values().to_vec(),
    }))
}

async fn pending_decryptions(State(state): State<AppState>) -> Json<DecryptionListResponse> {
    let requests = state
        .read(|ledger| ledger.pending_decryptions().into_iter().cloned().collect())
        .await;
    Json(DecryptionListResponse { requests })
}

async fn get_decryption(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PendingDecryption>, ApiError> {
    let pending = state.read(|ledger| ledger.decryption(&id).cloned()).await?;
    Ok(Json(pending))
}

async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<ListEventsParams>,
) -> Result<Json<Vec<EventItem>>, ApiError> {
    let after = params.after.unwrap_or(0);
    let limit = params.limit.unwrap_or(100).min(1_000);

    let events = db::list_events(&state.db, after, limit).await?;
    Ok(Json(events.into_iter().map(|(seq, event)| EventItem { seq, event }).collect()))
}

async fn zk_keys(State(state): State<AppState>) -> Result<Json<ZkKeysResponse>, ApiError> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let input_vk = serialize_vk(&state.keys.input_vk).map_err(|_| ApiError::Internal)?;
    let decryption_vk = serialize_vk(&state.keys.decryption_vk).map_err(|_| ApiError::Internal)?;
    let commitment = FrHex::from_fr(&state.keys.network.commitment()).map_err(|_| ApiError::Internal)?;

    Ok(Json(ZkKeysResponse {
        curve: "bn254".to_string(),
        proof_system: "groth16".to_string(),
        key_commitment_hex: commitment.hex,
        input_vk_b64: b64.encode(input_vk),
        decryption_vk_b64: b64.encode(decryption_vk),
    }))
}

/// Development only: encrypt under the server's network key.
async fn dev_encrypt(State(state): State<AppState>, Json(req): Json<EncryptRequest>) -> Result<Json<EncryptResponse>, ApiError> {
    let keys = state.keys.clone();
    let value = tokio::task::spawn_blocking(move || keys.encrypt(&mut OsRng, req.value))
        .await
        .map_err(|_| ApiError::Internal)?
        .map_err(|e| {
            tracing::error!(error = %e, "dev encryption failed");
            ApiError::Internal
        })?;

    Ok(Json(EncryptResponse {
        handle: value.handle,
        ciphertext_hex: hex::encode(&value.ciphertext),
        proof_b64: base64::engine::general_purpose::STANDARD.encode(&value.proof),
    }))
}
