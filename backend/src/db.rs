//! sqlite mirror of the ledger.
//!
//! The in-memory [`Marketplace`] is authoritative. After every operation the events it
//! emitted are applied here in one transaction, reading the rows they touch from the
//! marketplace itself. On startup [`load_snapshot`] rebuilds it.

use crate::capability::{DecryptionVerifier, EncryptedValues};
use crate::datasets::AggregatedDataset;
use crate::decryption::{DecryptionTarget, PendingDecryption};
use crate::errors::ApiError;
use crate::market::{MarketSnapshot, Marketplace};
use crate::models::{Handle, MarketEvent, Principal};
use crate::records::TrafficRecord;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use std::str::FromStr;
use tracing::error;

pub type Db = Pool<Sqlite>;

fn internal(context: &'static str) -> impl Fn(sqlx::Error) -> ApiError {
    move |e| {
        error!(error = %e, "{context}");
        ApiError::Internal
    }
}

fn corrupt(what: String) -> ApiError {
    error!(%what, "corrupt database row");
    ApiError::Internal
}

pub async fn connect(db_url: &str) -> Result<Db, ApiError> {
    let options = SqliteConnectOptions::from_str(db_url)
        .map_err(internal("invalid database url"))?
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(internal("database connect failed"))
}

pub async fn init_schema(db: &Db) -> Result<(), ApiError> {
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS records (
  id INTEGER PRIMARY KEY,
  speed_handle TEXT NOT NULL,
  location_x_handle TEXT NOT NULL,
  location_y_handle TEXT NOT NULL,
  timestamp INTEGER NOT NULL,
  owner TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS datasets (
  id INTEGER PRIMARY KEY,
  value_handle TEXT NOT NULL,
  start_time INTEGER NOT NULL,
  end_time INTEGER NOT NULL,
  price INTEGER NOT NULL,
  owner TEXT NOT NULL,
  sold INTEGER NOT NULL,
  proven_plaintext INTEGER
);

CREATE TABLE IF NOT EXISTS escrow (
  owner TEXT PRIMARY KEY,
  balance INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ciphertexts (
  handle TEXT PRIMARY KEY,
  ciphertext BLOB NOT NULL,
  policy_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS record_plaintexts (
  record_id INTEGER NOT NULL,
  handle TEXT NOT NULL,
  value INTEGER NOT NULL,
  PRIMARY KEY(record_id, handle)
);

CREATE TABLE IF NOT EXISTS decryptions (
  request_id TEXT PRIMARY KEY,
  state TEXT NOT NULL,
  body_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS payouts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  recipient TEXT NOT NULL,
  amount INTEGER NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  created_at TEXT NOT NULL,
  event_json TEXT NOT NULL
);
"#,
    )
    .execute(db)
    .await
    .map_err(internal("schema init failed"))?;

    Ok(())
}

/// Apply one operation's events atomically.
pub async fn persist_events<B>(db: &Db, market: &Marketplace<B>, events: &[MarketEvent]) -> Result<(), ApiError>
where
    B: EncryptedValues + DecryptionVerifier,
{
    let mut tx = db.begin().await.map_err(internal("begin failed"))?;
    let created_at = Utc::now().to_rfc3339();

    for event in events {
        match event {
            MarketEvent::RecordAdded { record_id, .. } => {
                let record = market.get_record(*record_id)?;
                insert_record(&mut tx, record).await?;
                for handle in record.handles() {
                    upsert_ciphertext(&mut tx, market, &handle).await?;
                }
            }
            MarketEvent::DatasetCreated { dataset_id, .. } => {
                let dataset = market.get_dataset(*dataset_id)?;
                upsert_dataset(&mut tx, dataset).await?;
                upsert_ciphertext(&mut tx, market, &dataset.encrypted_value).await?;
            }
            MarketEvent::DataSold { dataset_id, .. } => {
                let dataset = market.get_dataset(*dataset_id)?;
                upsert_dataset(&mut tx, dataset).await?;
                set_balance(&mut tx, &dataset.owner, market.escrow_balance(&dataset.owner)).await?;
            }
            MarketEvent::Withdrawal { recipient, amount } => {
                set_balance(&mut tx, recipient, market.escrow_balance(recipient)).await?;
                sqlx::query(r#"INSERT INTO payouts (recipient, amount, created_at) VALUES (?, ?, ?)"#)
                    .bind(recipient.as_str())
                    .bind(*amount as i64)
                    .bind(&created_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(internal("payout insert failed"))?;
            }
            MarketEvent::DecryptionRequested { request_id, .. }
            | MarketEvent::DecryptionFailed { request_id, .. }
            | MarketEvent::DecryptionClosed { request_id, .. } => {
                upsert_decryption(&mut tx, market.decryption(request_id)?).await?;
            }
            MarketEvent::DecryptionProven { request_id, target, values } => {
                upsert_decryption(&mut tx, market.decryption(request_id)?).await?;
                match target {
                    DecryptionTarget::Dataset(id) => upsert_dataset(&mut tx, market.get_dataset(*id)?).await?,
                    DecryptionTarget::Record(id) => {
                        for proven in values {
                            sqlx::query(
                                r#"INSERT OR IGNORE INTO record_plaintexts (record_id, handle, value)
                                   VALUES (?, ?, ?)"#,
                            )
                            .bind(*id as i64)
                            .bind(proven.handle.to_string())
                            .bind(proven.value as i64)
                            .execute(&mut *tx)
                            .await
                            .map_err(internal("plaintext insert failed"))?;
                        }
                    }
                }
            }
        }

        let event_json = serde_json::to_string(event).map_err(|_| ApiError::Internal)?;
        sqlx::query(r#"INSERT INTO events (created_at, event_json) VALUES (?, ?)"#)
            .bind(&created_at)
            .bind(event_json)
            .execute(&mut *tx)
            .await
            .map_err(internal("event insert failed"))?;
    }

    tx.commit().await.map_err(internal("commit failed"))?;
    Ok(())
}

async fn insert_record(conn: &mut SqliteConnection, record: &TrafficRecord) -> Result<(), ApiError> {
    sqlx::query(
        r#"INSERT INTO records (id, speed_handle, location_x_handle, location_y_handle, timestamp, owner)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(record.id as i64)
    .bind(record.encrypted_speed.to_string())
    .bind(record.encrypted_location_x.to_string())
    .bind(record.encrypted_location_y.to_string())
    .bind(record.timestamp as i64)
    .bind(record.owner.as_str())
    .execute(conn)
    .await
    .map_err(internal("record insert failed"))?;
    Ok(())
}

async fn upsert_dataset(conn: &mut SqliteConnection, dataset: &AggregatedDataset) -> Result<(), ApiError> {
    sqlx::query(
        r#"INSERT OR REPLACE INTO datasets
           (id, value_handle, start_time, end_time, price, owner, sold, proven_plaintext)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(dataset.id as i64)
    .bind(dataset.encrypted_value.to_string())
    .bind(dataset.start_time as i64)
    .bind(dataset.end_time as i64)
    .bind(dataset.price as i64)
    .bind(dataset.owner.as_str())
    .bind(if dataset.sold { 1i64 } else { 0i64 })
    .bind(dataset.proven_plaintext.map(|v| v as i64))
    .execute(conn)
    .await
    .map_err(internal("dataset upsert failed"))?;
    Ok(())
}

async fn upsert_ciphertext<B>(conn: &mut SqliteConnection, market: &Marketplace<B>, handle: &Handle) -> Result<(), ApiError>
where
    B: EncryptedValues + DecryptionVerifier,
{
    let stored = market
        .stored_value(handle)
        .ok_or_else(|| corrupt(format!("no stored value for handle {handle}")))?;
    let policy_json = serde_json::to_string(&stored.policy).map_err(|_| ApiError::Internal)?;

    sqlx::query(r#"INSERT OR REPLACE INTO ciphertexts (handle, ciphertext, policy_json) VALUES (?, ?, ?)"#)
        .bind(handle.to_string())
        .bind(stored.ciphertext.as_slice())
        .bind(policy_json)
        .execute(conn)
        .await
        .map_err(internal("ciphertext upsert failed"))?;
    Ok(())
}

async fn set_balance(conn: &mut SqliteConnection, owner: &Principal, balance: u64) -> Result<(), ApiError> {
    let query = if balance == 0 {
        sqlx::query(r#"DELETE FROM escrow WHERE owner = ?"#).bind(owner.as_str())
    } else {
        sqlx::query(r#"INSERT OR REPLACE INTO escrow (owner, balance) VALUES (?, ?)"#)
            .bind(owner.as_str())
            .bind(balance as i64)
    };
    query.execute(conn).await.map_err(internal("escrow update failed"))?;
    Ok(())
}

async fn upsert_decryption(conn: &mut SqliteConnection, pending: &PendingDecryption) -> Result<(), ApiError> {
    let state = serde_json::to_value(pending.state).map_err(|_| ApiError::Internal)?;
    let body_json = serde_json::to_string(pending).map_err(|_| ApiError::Internal)?;

    sqlx::query(r#"INSERT OR REPLACE INTO decryptions (request_id, state, body_json) VALUES (?, ?, ?)"#)
        .bind(pending.request_id.to_string())
        .bind(state.as_str().unwrap_or_default().to_string())
        .bind(body_json)
        .execute(conn)
        .await
        .map_err(internal("decryption upsert failed"))?;
    Ok(())
}

fn parse_handle(s: &str) -> Result<Handle, ApiError> {
    s.parse().map_err(corrupt)
}

/// Read the whole ledger back.
pub async fn load_snapshot(db: &Db) -> Result<MarketSnapshot, ApiError> {
    let mut snapshot = MarketSnapshot::default();

    let rows = sqlx::query(
        r#"SELECT id, speed_handle, location_x_handle, location_y_handle, timestamp, owner
           FROM records ORDER BY id"#,
    )
    .fetch_all(db)
    .await
    .map_err(internal("records load failed"))?;
    for row in rows {
        let id: i64 = row.get(0);
        let timestamp: i64 = row.get(4);
        let owner: String = row.get(5);
        snapshot.records.push(TrafficRecord {
            id: id as u64,
            encrypted_speed: parse_handle(row.get(1))?,
            encrypted_location_x: parse_handle(row.get(2))?,
            encrypted_location_y: parse_handle(row.get(3))?,
            timestamp: timestamp as u64,
            owner: Principal(owner),
        });
    }

    let rows = sqlx::query(r#"SELECT record_id, handle, value FROM record_plaintexts ORDER BY record_id"#)
        .fetch_all(db)
        .await
        .map_err(internal("plaintexts load failed"))?;
    for row in rows {
        let record_id: i64 = row.get(0);
        let value: i64 = row.get(2);
        snapshot
            .record_plaintexts
            .push((record_id as u64, parse_handle(row.get(1))?, value as u64));
    }

    let rows = sqlx::query(
        r#"SELECT id, value_handle, start_time, end_time, price, owner, sold, proven_plaintext
           FROM datasets ORDER BY id"#,
    )
    .fetch_all(db)
    .await
    .map_err(internal("datasets load failed"))?;
    for row in rows {
        let id: i64 = row.get(0);
        let start_time: i64 = row.get(2);
        let end_time: i64 = row.get(3);
        let price: i64 = row.get(4);
        let owner: String = row.get(5);
        let sold: i64 = row.get(6);
        let proven: Option<i64> = row.get(7);
        snapshot.datasets.push(AggregatedDataset {
            id: id as u64,
            encrypted_value: parse_handle(row.get(1))?,
            start_time: start_time as u64,
            end_time: end_time as u64,
            price: price as u64,
            owner: Principal(owner),
            sold: sold == 1,
            proven_plaintext: proven.map(|v| v as u64),
        });
    }

    let rows = sqlx::query(r#"SELECT handle, ciphertext, policy_json FROM ciphertexts"#)
        .fetch_all(db)
        .await
        .map_err(internal("ciphertexts load failed"))?;
    for row in rows {
        let handle = parse_handle(row.get(0))?;
        let ciphertext: Vec<u8> = row.get(1);
        let policy_json: String = row.get(2);
        let policy = serde_json::from_str(&policy_json).map_err(|e| corrupt(format!("policy of {handle}: {e}")))?;
        snapshot
            .values
            .push((handle, crate::capability::StoredValue { ciphertext, policy }));
    }

    let rows = sqlx::query(r#"SELECT owner, balance FROM escrow"#)
        .fetch_all(db)
        .await
        .map_err(internal("escrow load failed"))?;
    for row in rows {
        let owner: String = row.get(0);
        let balance: i64 = row.get(1);
        snapshot.balances.push((Principal(owner), balance as u64));
    }

    let rows = sqlx::query(r#"SELECT body_json FROM decryptions"#)
        .fetch_all(db)
        .await
        .map_err(internal("decryptions load failed"))?;
    for row in rows {
        let body_json: String = row.get(0);
        let pending: PendingDecryption =
            serde_json::from_str(&body_json).map_err(|e| corrupt(format!("decryption row: {e}")))?;
        snapshot.decryptions.push(pending);
    }

    Ok(snapshot)
}

/// Journal entries after `after_seq`, oldest first.
pub async fn list_events(db: &Db, after_seq: u64, limit: u64) -> Result<Vec<(u64, MarketEvent)>, ApiError> {
    let rows = sqlx::query(
        r#"SELECT seq, event_json FROM events
           WHERE seq > ?
           ORDER BY seq
           LIMIT ?"#,
    )
    .bind(i64::try_from(after_seq).unwrap_or(i64::MAX))
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(db)
    .await
    .map_err(internal("events load failed"))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let seq: i64 = row.get(0);
        let event_json: String = row.get(1);
        let event = serde_json::from_str(&event_json).map_err(|e| corrupt(format!("event {seq}: {e}")))?;
        out.push((seq as u64, event));
    }
    Ok(out)
}

pub async fn count_payouts(db: &Db) -> Result<u64, ApiError> {
    let row = sqlx::query(r#"SELECT COUNT(*) AS c FROM payouts"#)
        .fetch_one(db)
        .await
        .map_err(internal("payout count failed"))?;
    let c: i64 = row.get("c");
    Ok(c as u64)
}
