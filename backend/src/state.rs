use crate::config::Config;
use crate::db::{self, Db};
use crate::errors::{ApiError, MarketError};
use crate::escrow::{Payout, PayoutError};
use crate::market::Marketplace;
use crate::models::{Principal, TxContext};
use crate::zk::{ZkBackend, ZkKeys};
use rand::rngs::OsRng;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use zk_proofs::groth16::{deserialize_pk, deserialize_vk, serialize_pk, serialize_vk};
use zk_proofs::types::NetworkKey;

pub type Ledger = Marketplace<ZkBackend>;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Arc<Config>,
    pub keys: ZkKeys,
    ledger: Arc<Mutex<Ledger>>,
    /// Set while memory may hold a mutation the database never accepted.
    stale: Arc<AtomicBool>,
}

/// Queues withdrawals. The `payouts` row is written in the same transaction as the
/// `Withdrawal` event, so a payout exists only once the withdrawal is durable.
struct SettlementLog;

impl Payout for SettlementLog {
    fn transfer(&mut self, recipient: &Principal, amount: u64) -> Result<(), PayoutError> {
        info!(%recipient, amount, "payout queued");
        Ok(())
    }
}

impl AppState {
    /// Open the database, load (or create) keys and rebuild the ledger from disk.
    pub async fn open(config: Config) -> Result<Self, ApiError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            error!(error = %e, dir = %config.data_dir.display(), "cannot create data dir");
            ApiError::Internal
        })?;

        let db = db::connect(&config.db_url()).await?;
        db::init_schema(&db).await?;

        let keys = ensure_keys(config.data_dir.clone()).await?;

        let snapshot = db::load_snapshot(&db).await?;
        let ledger = Marketplace::restore(keys.backend(), config.context.clone(), snapshot).map_err(|e| {
            error!(error = %e, "ledger restore failed");
            ApiError::Internal
        })?;
        info!(
            records = ledger.total_records(),
            datasets = ledger.total_datasets(),
            funds_held = ledger.funds_held(),
            "ledger restored"
        );

        Ok(Self {
            db,
            config: Arc::new(config),
            keys,
            ledger: Arc::new(Mutex::new(ledger)),
            stale: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Run one ledger operation and persist its events before releasing the ledger.
    ///
    /// If the write fails the operation is undone by reloading the ledger from disk, so
    /// memory never runs ahead of the database.
    pub async fn execute<T>(&self, op: impl FnOnce(&mut Ledger) -> Result<T, MarketError>) -> Result<T, ApiError> {
        let mut ledger = self.ledger.lock().await;
        if self.stale.load(Ordering::Acquire) {
            self.reload(&mut *ledger).await?;
        }

        let result = op(&mut *ledger);

        let events = ledger.drain_events();
        if !events.is_empty() {
            if let Err(e) = db::persist_events(&self.db, &*ledger, &events).await {
                error!(error = %e, events = events.len(), "persist failed, rolling ledger back");
                self.stale.store(true, Ordering::Release);
                self.reload(&mut *ledger).await?;
                return Err(e);
            }
        }

        Ok(result?)
    }

    /// Replace the in-memory ledger with what the database holds.
    async fn reload(&self, ledger: &mut Ledger) -> Result<(), ApiError> {
        let snapshot = db::load_snapshot(&self.db).await?;
        *ledger = Marketplace::restore(self.keys.backend(), self.config.context.clone(), snapshot).map_err(|e| {
            error!(error = %e, "ledger reload failed");
            ApiError::Internal
        })?;
        self.stale.store(false, Ordering::Release);
        info!(funds_held = ledger.funds_held(), "ledger reloaded from disk");
        Ok(())
    }

    pub async fn withdraw(&self, caller: Principal) -> Result<u64, ApiError> {
        let ctx = TxContext::now(caller);
        self.execute(|ledger| ledger.withdraw(&ctx, &mut SettlementLog)).await
    }

    pub async fn read<T>(&self, view: impl FnOnce(&Ledger) -> T) -> T {
        let ledger = self.ledger.lock().await;
        view(&*ledger)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, ApiError> {
    std::fs::read(path).map_err(|e| {
        error!(error = %e, path = %path.display(), "key read failed");
        ApiError::Internal
    })
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ApiError> {
    std::fs::write(path, bytes).map_err(|e| {
        error!(error = %e, path = %path.display(), "key write failed");
        ApiError::Internal
    })
}

/// Ensure the network key and both Groth16 key pairs exist on disk, and load them.
///
/// Runs the trusted setup (prototype) on first start.
async fn ensure_keys(data_dir: PathBuf) -> Result<ZkKeys, ApiError> {
    tokio::task::spawn_blocking(move || -> Result<ZkKeys, ApiError> {
        let keys_dir = data_dir.join("keys");
        std::fs::create_dir_all(&keys_dir).map_err(|_| ApiError::Internal)?;

        let network_path = keys_dir.join("network_key.bin");
        let input_pk_path = keys_dir.join("input_pk.bin");
        let input_vk_path = keys_dir.join("input_vk.bin");
        let decryption_pk_path = keys_dir.join("decryption_pk.bin");
        let decryption_vk_path = keys_dir.join("decryption_vk.bin");

        let all = [&network_path, &input_pk_path, &input_vk_path, &decryption_pk_path, &decryption_vk_path];
        if all.iter().all(|p| p.exists()) {
            let zk = |e: zk_proofs::groth16::ZkError| {
                error!(error = %e, "stored key is unreadable");
                ApiError::Internal
            };
            return Ok(ZkKeys {
                network: NetworkKey::from_bytes(&read_file(&network_path)?).map_err(zk)?,
                input_pk: Arc::new(deserialize_pk(&read_file(&input_pk_path)?).map_err(zk)?),
                input_vk: Arc::new(deserialize_vk(&read_file(&input_vk_path)?).map_err(zk)?),
                decryption_pk: Arc::new(deserialize_pk(&read_file(&decryption_pk_path)?).map_err(zk)?),
                decryption_vk: Arc::new(deserialize_vk(&read_file(&decryption_vk_path)?).map_err(zk)?),
            });
        }

        // IMPORTANT: In production, use an MPC setup and keep the network key in the
        // decryption service only.
        info!("running trusted setup");
        let keys = ZkKeys::generate(&mut OsRng).map_err(|_| ApiError::Internal)?;

        let network = keys.network.to_bytes().map_err(|_| ApiError::Internal)?;
        write_file(&network_path, &network)?;
        write_file(&input_pk_path, &serialize_pk(&keys.input_pk).map_err(|_| ApiError::Internal)?)?;
        write_file(&input_vk_path, &serialize_vk(&keys.input_vk).map_err(|_| ApiError::Internal)?)?;
        write_file(&decryption_pk_path, &serialize_pk(&keys.decryption_pk).map_err(|_| ApiError::Internal)?)?;
        write_file(&decryption_vk_path, &serialize_vk(&keys.decryption_vk).map_err(|_| ApiError::Internal)?)?;

        Ok(keys)
    })
    .await
    .map_err(|_| ApiError::Internal)?
}
