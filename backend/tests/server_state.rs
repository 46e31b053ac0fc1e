//! Persistence and relayer behaviour of the server state.

use rand::rngs::OsRng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use traffic_ledger::capability::{DecryptionRequest, DecryptionResult, DecryptionService, ServiceError};
use traffic_ledger::config::Config;
use traffic_ledger::datasets::DatasetListing;
use traffic_ledger::db;
use traffic_ledger::decryption::{DecryptionState, DecryptionTarget};
use traffic_ledger::errors::{ApiError, MarketError};
use traffic_ledger::models::{EncryptedInput, MarketEvent, Principal, TxContext};
use traffic_ledger::records::RecordSubmission;
use traffic_ledger::relayer::{relay_pending, RelayReport};
use traffic_ledger::state::AppState;

fn config(dir: &TempDir) -> Config {
    Config {
        addr: "127.0.0.1:0".to_string(),
        api_key: "test-key".to_string(),
        data_dir: dir.path().to_path_buf(),
        context: "test-ledger".to_string(),
        relayer_poll: Duration::from_millis(10),
        relayer_max_attempts: 2,
    }
}

fn encrypt(state: &AppState, value: u64) -> EncryptedInput {
    let encrypted = state.keys.encrypt(&mut OsRng, value).unwrap();
    EncryptedInput { ciphertext: encrypted.ciphertext, proof: encrypted.proof }
}

async fn list_dataset(state: &AppState, owner: &str, value: u64, price: u64) -> u64 {
    let ctx = TxContext::now(Principal::new(owner));
    let listing = DatasetListing { value: encrypt(state, value), start_time: 100, end_time: 200, price };
    state.execute(|ledger| ledger.create_dataset(&ctx, listing)).await.unwrap()
}

#[tokio::test]
async fn ledger_survives_restart() {
    let dir = TempDir::new().unwrap();
    let record_handle;
    {
        let state = AppState::open(config(&dir)).await.unwrap();

        let ctx = TxContext::now(Principal::new("sensor"));
        let submission = RecordSubmission {
            speed: encrypt(&state, 55),
            location_x: encrypt(&state, 10),
            location_y: encrypt(&state, 20),
        };
        let record_id = state.execute(|ledger| ledger.submit_record(&ctx, submission)).await.unwrap();
        record_handle = state.read(|ledger| ledger.get_record(record_id).unwrap().encrypted_speed).await;

        list_dataset(&state, "alice", 4, 10).await;
        list_dataset(&state, "bob", 8, 10).await;
        let buyer = TxContext::now(Principal::new("carol"));
        state.execute(|ledger| ledger.purchase(&buyer, 0, 15)).await.unwrap();
        state.execute(|ledger| ledger.purchase(&buyer, 1, 10)).await.unwrap();
        assert_eq!(state.withdraw(Principal::new("bob")).await.unwrap(), 10);

        assert!(matches!(
            state.withdraw(Principal::new("bob")).await,
            Err(ApiError::Market(MarketError::NoFunds))
        ));
        assert_eq!(db::count_payouts(&state.db).await.unwrap(), 1);
    }

    let state = AppState::open(config(&dir)).await.unwrap();
    state
        .read(|ledger| {
            assert_eq!(ledger.total_records(), 1);
            assert_eq!(ledger.total_datasets(), 2);
            assert_eq!(ledger.get_record(0).unwrap().encrypted_speed, record_handle);
            assert!(!ledger.is_available(0));
            assert_eq!(ledger.escrow_balance(&Principal::new("alice")), 15);
            assert_eq!(ledger.escrow_balance(&Principal::new("bob")), 0);
            assert_eq!(ledger.funds_held(), 15);
        })
        .await;

    let buyer = TxContext::now(Principal::new("dave"));
    assert!(matches!(
        state.execute(|ledger| ledger.purchase(&buyer, 0, 100)).await,
        Err(ApiError::Market(MarketError::AlreadySold(0)))
    ));
    let next = list_dataset(&state, "alice", 1, 1).await;
    assert_eq!(next, 2);

    let events = db::list_events(&state.db, 0, 100).await.unwrap();
    assert_eq!(events.len(), 7);
    assert!(matches!(events[0].1, MarketEvent::RecordAdded { record_id: 0, .. }));
    assert!(matches!(events[5].1, MarketEvent::Withdrawal { amount: 10, .. }));
    assert!(matches!(events[6].1, MarketEvent::DatasetCreated { dataset_id: 2, .. }));
}

#[tokio::test]
async fn relayer_drives_requests_to_commit_once() {
    let dir = TempDir::new().unwrap();
    let state = AppState::open(config(&dir)).await.unwrap();
    let decryptor = state.keys.decryptor();

    list_dataset(&state, "alice", 321, 10).await;
    let handle = state.read(|ledger| ledger.get_dataset(0).unwrap().encrypted_value).await;

    let requester = TxContext::now(Principal::new("buyer"));
    let first = state
        .execute(|ledger| ledger.request_decryption(&requester, DecryptionTarget::Dataset(0), vec![handle]))
        .await
        .unwrap();
    let second = state
        .execute(|ledger| ledger.request_decryption(&requester, DecryptionTarget::Dataset(0), vec![handle]))
        .await
        .unwrap();

    let report = relay_pending(&state, &decryptor).await.unwrap();
    assert_eq!(report.committed, 1);
    assert_eq!(report.already_proven, 1);

    state
        .read(|ledger| {
            assert_eq!(ledger.get_dataset(0).unwrap().proven_plaintext, Some(321));
            assert_eq!(ledger.decryption(&first).unwrap().state, DecryptionState::Committed);
            assert_eq!(ledger.decryption(&second).unwrap().state, DecryptionState::Committed);
            assert!(ledger.pending_decryptions().is_empty());
        })
        .await;

    assert_eq!(relay_pending(&state, &decryptor).await.unwrap(), RelayReport::default());

    let again = state
        .execute(|ledger| ledger.request_decryption(&requester, DecryptionTarget::Dataset(0), vec![handle]))
        .await;
    assert!(matches!(
        again,
        Err(ApiError::Market(MarketError::AlreadyProven { values })) if values[0].value == 321
    ));

    drop(state);
    let reopened = AppState::open(config(&dir)).await.unwrap();
    reopened
        .read(|ledger| {
            assert_eq!(ledger.get_dataset(0).unwrap().proven_plaintext, Some(321));
            assert_eq!(ledger.decryption(&first).unwrap().state, DecryptionState::Committed);
        })
        .await;
}

#[tokio::test]
async fn failed_write_rolls_memory_back_to_disk() {
    let dir = TempDir::new().unwrap();
    let state = AppState::open(config(&dir)).await.unwrap();
    list_dataset(&state, "alice", 4, 10).await;

    sqlx::query("DROP TABLE events").execute(&state.db).await.unwrap();
    let buyer = TxContext::now(Principal::new("carol"));
    assert!(matches!(
        state.execute(|ledger| ledger.purchase(&buyer, 0, 10)).await,
        Err(ApiError::Internal)
    ));
    state
        .read(|ledger| {
            assert!(ledger.is_available(0));
            assert_eq!(ledger.escrow_balance(&Principal::new("alice")), 0);
            assert_eq!(ledger.funds_held(), 0);
        })
        .await;

    db::init_schema(&state.db).await.unwrap();
    state.execute(|ledger| ledger.purchase(&buyer, 0, 10)).await.unwrap();
    assert_eq!(state.read(|ledger| ledger.escrow_balance(&Principal::new("alice"))).await, 10);

    sqlx::query("DROP TABLE events").execute(&state.db).await.unwrap();
    assert!(matches!(state.withdraw(Principal::new("alice")).await, Err(ApiError::Internal)));
    assert_eq!(state.read(|ledger| ledger.escrow_balance(&Principal::new("alice"))).await, 10);
    assert_eq!(db::count_payouts(&state.db).await.unwrap(), 0);

    db::init_schema(&state.db).await.unwrap();
    drop(state);
    let reopened = AppState::open(config(&dir)).await.unwrap();
    reopened
        .read(|ledger| {
            assert!(!ledger.is_available(0));
            assert_eq!(ledger.escrow_balance(&Principal::new("alice")), 10);
        })
        .await;
    assert_eq!(reopened.withdraw(Principal::new("alice")).await.unwrap(), 10);
    assert_eq!(db::count_payouts(&reopened.db).await.unwrap(), 1);
}

struct DeadService {
    calls: AtomicUsize,
}

impl DecryptionService for DeadService {
    async fn decrypt(&self, _: &DecryptionRequest) -> Result<DecryptionResult, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ServiceError::Unavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn unavailable_service_exhausts_attempts() {
    let dir = TempDir::new().unwrap();
    let state = AppState::open(config(&dir)).await.unwrap();
    list_dataset(&state, "alice", 77, 10).await;
    let handle = state.read(|ledger| ledger.get_dataset(0).unwrap().encrypted_value).await;

    let requester = TxContext::now(Principal::new("buyer"));
    let id = state
        .execute(|ledger| ledger.request_decryption(&requester, DecryptionTarget::Dataset(0), vec![handle]))
        .await
        .unwrap();

    let service = DeadService { calls: AtomicUsize::new(0) };
    for _ in 0..2 {
        let report = relay_pending(&state, &service).await.unwrap();
        assert_eq!(report.unavailable, 1);
    }
    assert_eq!(relay_pending(&state, &service).await.unwrap(), RelayReport::default());
    assert_eq!(service.calls.load(Ordering::SeqCst), 2);

    state
        .read(|ledger| {
            let pending = ledger.decryption(&id).unwrap();
            assert_eq!(pending.state, DecryptionState::Failed);
            assert_eq!(pending.attempts, 2);
            assert!(pending.last_error.as_deref().unwrap().contains("connection refused"));
        })
        .await;

    let events = db::list_events(&state.db, 0, 100).await.unwrap();
    let failures = events
        .iter()
        .filter(|(_, event)| matches!(event, MarketEvent::DecryptionFailed { .. }))
        .count();
    assert_eq!(failures, 2);
}

#[tokio::test]
async fn event_cursor_past_i64_range_is_empty() {
    let dir = TempDir::new().unwrap();
    let state = AppState::open(config(&dir)).await.unwrap();
    list_dataset(&state, "alice", 1, 1).await;

    assert_eq!(db::list_events(&state.db, 0, u64::MAX).await.unwrap().len(), 1);
    assert!(db::list_events(&state.db, u64::MAX, 100).await.unwrap().is_empty());
    assert!(db::list_events(&state.db, i64::MAX as u64 + 1, 100).await.unwrap().is_empty());
}
