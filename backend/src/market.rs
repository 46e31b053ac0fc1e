//! The marketplace controller: one value holding every table of the ledger.
//!
//! Each `&mut self` method is one atomic ledger operation. Either it succeeds and queues
//! its events after the mutation, or it fails and nothing changed (a rejected decryption
//! proof only updates the request's own bookkeeping).

use crate::capability::{
    DecryptionRequest, DecryptionResult, DecryptionVerifier, EncryptedValues, StoredValue, ValueTable,
};
use crate::datasets::{AggregatedDataset, DatasetListing, DatasetStore};
use crate::decryption::{CommitOutcome, DecryptionBook, DecryptionTarget, PendingDecryption, Targets};
use crate::errors::MarketError;
use crate::escrow::{EscrowLedger, Payout};
use crate::models::{Handle, MarketEvent, Principal, ProvenValue, TxContext};
use crate::records::{RecordStore, RecordSubmission, TrafficRecord};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Everything needed to rebuild a [`Marketplace`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub records: Vec<TrafficRecord>,
    pub record_plaintexts: Vec<(u64, Handle, u64)>,
    pub datasets: Vec<AggregatedDataset>,
    pub values: Vec<(Handle, StoredValue)>,
    pub balances: Vec<(Principal, u64)>,
    pub decryptions: Vec<PendingDecryption>,
}

pub struct Marketplace<B> {
    backend: B,
    /// Address of this ledger; also the principal that holds standing access to every value.
    context: Principal,
    values: ValueTable,
    records: RecordStore,
    datasets: DatasetStore,
    escrow: EscrowLedger,
    decryptions: DecryptionBook,
    events: Vec<MarketEvent>,
}

impl<B> Marketplace<B>
where
    B: EncryptedValues + DecryptionVerifier,
{
    pub fn new(backend: B, context: impl Into<String>) -> Self {
        Self {
            backend,
            context: Principal::new(context),
            values: ValueTable::default(),
            records: RecordStore::default(),
            datasets: DatasetStore::default(),
            escrow: EscrowLedger::default(),
            decryptions: DecryptionBook::default(),
            events: Vec::new(),
        }
    }

    pub fn restore(backend: B, context: impl Into<String>, snapshot: MarketSnapshot) -> Result<Self, MarketError> {
        let records = RecordStore::restore(snapshot.records, snapshot.record_plaintexts)?;
        let datasets = DatasetStore::restore(snapshot.datasets)?;
        let values = ValueTable::restore(snapshot.values);

        let referenced = records
            .iter()
            .flat_map(|record| record.handles())
            .chain(datasets.iter().map(|dataset| dataset.encrypted_value));
        for handle in referenced {
            if values.get(&handle).is_none() {
                return Err(MarketError::CorruptState(format!("missing ciphertext for handle {handle}")));
            }
        }

        Ok(Self {
            backend,
            context: Principal::new(context),
            values,
            records,
            datasets,
            escrow: EscrowLedger::restore(snapshot.balances)?,
            decryptions: DecryptionBook::restore(snapshot.decryptions),
            events: Vec::new(),
        })
    }

    pub fn snapshot(&self) -> MarketSnapshot {
        let record_plaintexts = self
            .records
            .iter()
            .flat_map(|record| {
                self.records
                    .proven_values(record.id)
                    .into_iter()
                    .map(move |proven| (record.id, proven.handle, proven.value))
            })
            .collect();

        MarketSnapshot {
            records: self.records.iter().cloned().collect(),
            record_plaintexts,
            datasets: self.datasets.iter().cloned().collect(),
            values: self.values.iter().map(|(h, v)| (*h, v.clone())).collect(),
            balances: self.escrow.balances().map(|(p, b)| (p.clone(), *b)).collect(),
            decryptions: self.decryptions.iter().cloned().collect(),
        }
    }

    pub fn context(&self) -> &str {
        self.context.as_str()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub fn submit_record(&mut self, ctx: &TxContext, submission: RecordSubmission) -> Result<u64, MarketError> {
        let record_id = self
            .records
            .submit(&self.backend, &mut self.values, &self.context, ctx, submission)?;

        info!(record_id, submitter = %ctx.sender, "record added");
        self.events.push(MarketEvent::RecordAdded { record_id, submitter: ctx.sender.clone() });
        Ok(record_id)
    }

    pub fn create_dataset(&mut self, ctx: &TxContext, listing: DatasetListing) -> Result<u64, MarketError> {
        let dataset_id = self
            .datasets
            .create(&self.backend, &mut self.values, &self.context, ctx, listing)?;

        info!(dataset_id, creator = %ctx.sender, "dataset created");
        self.events.push(MarketEvent::DatasetCreated { dataset_id, creator: ctx.sender.clone() });
        Ok(dataset_id)
    }

    pub fn purchase(&mut self, ctx: &TxContext, dataset_id: u64, payment: u64) -> Result<(), MarketError> {
        let owner = self.escrow.purchase(&mut self.datasets, dataset_id, payment)?;

        info!(dataset_id, buyer = %ctx.sender, %owner, payment, "dataset sold");
        self.events.push(MarketEvent::DataSold {
            dataset_id,
            buyer: ctx.sender.clone(),
            amount: payment,
        });
        Ok(())
    }

    pub fn withdraw<P: Payout>(&mut self, ctx: &TxContext, payout: &mut P) -> Result<u64, MarketError> {
        let amount = self.escrow.withdraw(&ctx.sender, payout)?;

        info!(recipient = %ctx.sender, amount, "escrow withdrawn");
        self.events.push(MarketEvent::Withdrawal { recipient: ctx.sender.clone(), amount });
        Ok(amount)
    }

    /// Phase one. Returns the correlation id the answer must be committed under.
    pub fn request_decryption(
        &mut self,
        ctx: &TxContext,
        target: DecryptionTarget,
        handles: Vec<Handle>,
    ) -> Result<Uuid, MarketError> {
        let targets = Targets { records: &mut self.records, datasets: &mut self.datasets };
        let request_id = self.decryptions.request(ctx, &targets, &self.values, target, handles)?;

        self.events.push(MarketEvent::DecryptionRequested {
            request_id,
            target,
            requester: ctx.sender.clone(),
        });
        Ok(request_id)
    }

    /// Phase two. Anyone may deliver the answer; only a verified one is committed.
    pub fn commit_decryption(
        &mut self,
        ctx: &TxContext,
        request_id: &Uuid,
        result: &DecryptionResult,
    ) -> Result<CommitOutcome, MarketError> {
        let before = self.decryptions.get(request_id)?.state;

        let mut targets = Targets { records: &mut self.records, datasets: &mut self.datasets };
        let outcome = self.decryptions.commit(
            &mut targets,
            &self.values,
            &self.backend,
            self.context.as_str(),
            request_id,
            result,
        );

        let pending = self.decryptions.get(request_id)?;
        let target = pending.target;
        match &outcome {
            Ok(CommitOutcome::Committed(values)) => {
                info!(%request_id, submitter = %ctx.sender, "plaintext proven");
                self.events.push(MarketEvent::DecryptionProven {
                    request_id: *request_id,
                    target,
                    values: values.clone(),
                });
            }
            Ok(CommitOutcome::AlreadyProven(_)) if before != pending.state => {
                self.events.push(MarketEvent::DecryptionClosed { request_id: *request_id, target });
            }
            Ok(CommitOutcome::AlreadyProven(_)) => {}
            Err(MarketError::ProofInvalid(reason)) => {
                self.events.push(MarketEvent::DecryptionFailed {
                    request_id: *request_id,
                    target,
                    reason: reason.clone(),
                });
            }
            Err(_) => {}
        }
        outcome
    }

    /// Note that the decryption service failed to answer `request_id`.
    pub fn record_service_failure(&mut self, request_id: &Uuid, reason: &str) -> Result<(), MarketError> {
        if self.decryptions.record_service_failure(request_id, reason)? {
            let target = self.decryptions.get(request_id)?.target;
            self.events.push(MarketEvent::DecryptionFailed {
                request_id: *request_id,
                target,
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    pub fn get_record(&self, record_id: u64) -> Result<&TrafficRecord, MarketError> {
        self.records.get(record_id)
    }

    pub fn record_plaintexts(&self, record_id: u64) -> Result<Vec<ProvenValue>, MarketError> {
        self.records.get(record_id)?;
        Ok(self.records.proven_values(record_id))
    }

    pub fn get_dataset(&self, dataset_id: u64) -> Result<&AggregatedDataset, MarketError> {
        self.datasets.get(dataset_id)
    }

    pub fn total_records(&self) -> u64 {
        self.records.len()
    }

    pub fn total_datasets(&self) -> u64 {
        self.datasets.len()
    }

    pub fn is_available(&self, dataset_id: u64) -> bool {
        self.datasets.is_available(dataset_id)
    }

    pub fn escrow_balance(&self, owner: &Principal) -> u64 {
        self.escrow.balance_of(owner)
    }

    pub fn funds_held(&self) -> u64 {
        self.escrow.held()
    }

    pub fn stored_value(&self, handle: &Handle) -> Option<&StoredValue> {
        self.values.get(handle)
    }

    pub fn decryption(&self, request_id: &Uuid) -> Result<&PendingDecryption, MarketError> {
        self.decryptions.get(request_id)
    }

    /// Open requests, oldest first.
    pub fn pending_decryptions(&self) -> Vec<&PendingDecryption> {
        let mut open: Vec<_> = self.decryptions.iter().filter(|p| p.is_open()).collect();
        open.sort_by_key(|p| (p.requested_at, p.request_id));
        open
    }

    /// The message to hand to the decryption service for `request_id`.
    pub fn decryption_request(&self, request_id: &Uuid) -> Result<DecryptionRequest, MarketError> {
        self.decryptions
            .service_request(request_id, &self.values, self.context.as_str())
    }

    /// Events queued since the last drain, in emission order.
    pub fn drain_events(&mut self) -> Vec<MarketEvent> {
        std::mem::take(&mut self.events)
    }
}
