//! Two-phase decryption verification.
//!
//! Phase one records a request for a set of handles and hands it, with the stored
//! ciphertexts, to an off-ledger decryption service. Phase two takes the service's
//! answer back, checks its proof against the ciphertexts the ledger actually holds, and
//! commits the plaintext exactly once. Nothing waits in between: the service may answer
//! late, twice, or never.
//!
//! ```text
//! Requested ──> ProofReceived ──> Committed
//!     │  ^             │
//!     v  └── retry ─── v
//!   Failed <───────────┘
//! ```

use crate::capability::{DecryptionRequest, DecryptionResult, DecryptionVerifier, ValueTable};
use crate::datasets::DatasetStore;
use crate::errors::MarketError;
use crate::models::{Handle, Principal, ProvenValue, TxContext};
use crate::records::RecordStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum DecryptionTarget {
    Record(u64),
    Dataset(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecryptionState {
    Requested,
    ProofReceived,
    Committed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDecryption {
    pub request_id: Uuid,
    pub target: DecryptionTarget,
    pub handles: Vec<Handle>,
    pub requester: Principal,
    pub requested_at: u64,
    pub state: DecryptionState,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl PendingDecryption {
    /// Still waiting for a verifiable answer.
    pub fn is_open(&self) -> bool {
        matches!(self.state, DecryptionState::Requested | DecryptionState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// This call wrote the plaintexts.
    Committed(Vec<ProvenValue>),
    /// The target was already proven; these are the stored values.
    AlreadyProven(Vec<ProvenValue>),
}

impl CommitOutcome {
    pub fn values(&self) -> &[ProvenValue] {
        match self {
            CommitOutcome::Committed(values) | CommitOutcome::AlreadyProven(values) => values,
        }
    }
}

/// The stores a decryption can land in.
pub(crate) struct Targets<'a> {
    pub records: &'a mut RecordStore,
    pub datasets: &'a mut DatasetStore,
}

impl Targets<'_> {
    fn handles(&self, target: DecryptionTarget) -> Result<Vec<Handle>, MarketError> {
        match target {
            DecryptionTarget::Record(id) => Ok(self.records.get(id)?.handles().to_vec()),
            DecryptionTarget::Dataset(id) => Ok(vec![self.datasets.get(id)?.encrypted_value]),
        }
    }

    fn proven(&self, target: DecryptionTarget, handle: &Handle) -> Option<u64> {
        match target {
            DecryptionTarget::Record(id) => self.records.proven(id, handle),
            DecryptionTarget::Dataset(id) => self.datasets.get(id).ok()?.proven_plaintext,
        }
    }

    /// Stored values for `handles`, or `None` if any is still unproven.
    fn all_proven(&self, target: DecryptionTarget, handles: &[Handle]) -> Option<Vec<ProvenValue>> {
        handles
            .iter()
            .map(|handle| {
                self.proven(target, handle)
                    .map(|value| ProvenValue { handle: *handle, value })
            })
            .collect()
    }

    fn write(&mut self, target: DecryptionTarget, values: &[ProvenValue]) -> Result<(), MarketError> {
        for proven in values {
            match target {
                DecryptionTarget::Record(id) => self.records.set_proven(id, proven.handle, proven.value),
                DecryptionTarget::Dataset(id) => self.datasets.set_proven(id, proven.value)?,
            }
        }
        Ok(())
    }
}

/// Every decryption request the ledger has seen, by correlation id.
#[derive(Debug, Default)]
pub struct DecryptionBook {
    requests: HashMap<Uuid, PendingDecryption>,
}

impl DecryptionBook {
    pub fn get(&self, request_id: &Uuid) -> Result<&PendingDecryption, MarketError> {
        self.requests
            .get(request_id)
            .ok_or(MarketError::RequestNotFound(*request_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingDecryption> {
        self.requests.values()
    }

    /// Idle -> Requested.
    pub(crate) fn request(
        &mut self,
        ctx: &TxContext,
        targets: &Targets<'_>,
        values: &ValueTable,
        target: DecryptionTarget,
        handles: Vec<Handle>,
    ) -> Result<Uuid, MarketError> {
        if handles.is_empty() {
            return Err(MarketError::EmptyRequest);
        }
        let mut seen = BTreeSet::new();
        for handle in &handles {
            if !seen.insert(*handle) {
                return Err(MarketError::DuplicateHandle(*handle));
            }
        }

        let owned = targets.handles(target)?;
        if let Some(stray) = handles.iter().find(|handle| !owned.contains(handle)) {
            return Err(MarketError::HandleNotInTarget(*stray));
        }

        if let Some(stored) = targets.all_proven(target, &handles) {
            return Err(MarketError::AlreadyProven { values: stored });
        }

        if let Some(denied) = handles.iter().find(|handle| !values.can_decrypt(handle, &ctx.sender)) {
            return Err(MarketError::AccessDenied(*denied));
        }

        let request_id = Uuid::new_v4();
        self.requests.insert(
            request_id,
            PendingDecryption {
                request_id,
                target,
                handles,
                requester: ctx.sender.clone(),
                requested_at: ctx.timestamp,
                state: DecryptionState::Requested,
                attempts: 0,
                last_error: None,
            },
        );

        info!(%request_id, ?target, requester = %ctx.sender, "decryption requested");
        Ok(request_id)
    }

    /// Build the message for the decryption service from the ciphertexts on the ledger.
    pub(crate) fn service_request(
        &self,
        request_id: &Uuid,
        values: &ValueTable,
        context: &str,
    ) -> Result<DecryptionRequest, MarketError> {
        let pending = self.get(request_id)?;
        let ciphertexts = pending
            .handles
            .iter()
            .map(|handle| {
                values
                    .ciphertext(handle)
                    .map(|ciphertext| (*handle, ciphertext.to_vec()))
                    .ok_or_else(|| MarketError::CorruptState(format!("no ciphertext for handle {handle}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DecryptionRequest {
            request_id: *request_id,
            context: context.to_string(),
            ciphertexts,
        })
    }

    /// Requested/Failed -> ProofReceived -> Committed | Failed.
    ///
    /// On `ProofInvalid` the request is left `Failed` and the target untouched; the same
    /// request may be committed again with a fresh answer.
    pub(crate) fn commit<V: DecryptionVerifier>(
        &mut self,
        targets: &mut Targets<'_>,
        values: &ValueTable,
        verifier: &V,
        context: &str,
        request_id: &Uuid,
        result: &DecryptionResult,
    ) -> Result<CommitOutcome, MarketError> {
        let pending = self
            .requests
            .get_mut(request_id)
            .ok_or(MarketError::RequestNotFound(*request_id))?;

        // Duplicate answers, and answers that lost the race to a competing request.
        if let Some(stored) = targets.all_proven(pending.target, &pending.handles) {
            pending.state = DecryptionState::Committed;
            return Ok(CommitOutcome::AlreadyProven(stored));
        }

        pending.state = DecryptionState::ProofReceived;
        pending.attempts += 1;

        match check_result(pending, values, verifier, context, result) {
            Ok(proven) => {
                targets.write(pending.target, &proven)?;
                pending.state = DecryptionState::Committed;
                pending.last_error = None;
                info!(%request_id, target = ?pending.target, "decryption committed");
                Ok(CommitOutcome::Committed(proven))
            }
            Err(reason) => {
                warn!(%request_id, target = ?pending.target, %reason, "decryption proof rejected");
                pending.state = DecryptionState::Failed;
                pending.last_error = Some(reason.clone());
                Err(MarketError::ProofInvalid(reason))
            }
        }
    }

    /// The decryption service could not answer. Counts as an attempt; the request stays
    /// open. Returns false when the request was already closed.
    pub(crate) fn record_service_failure(&mut self, request_id: &Uuid, reason: &str) -> Result<bool, MarketError> {
        let pending = self
            .requests
            .get_mut(request_id)
            .ok_or(MarketError::RequestNotFound(*request_id))?;
        if !pending.is_open() {
            return Ok(false);
        }

        pending.attempts += 1;
        pending.state = DecryptionState::Failed;
        pending.last_error = Some(reason.to_string());
        warn!(%request_id, attempts = pending.attempts, %reason, "decryption service failed");
        Ok(true)
    }

    pub(crate) fn restore(requests: Vec<PendingDecryption>) -> Self {
        Self {
            requests: requests
                .into_iter()
                .map(|pending| (pending.request_id, pending))
                .collect(),
        }
    }
}

/// Order the claimed values by the request's handles and verify them against the ledger's
/// own ciphertexts.
fn check_result<V: DecryptionVerifier>(
    pending: &PendingDecryption,
    values: &ValueTable,
    verifier: &V,
    context: &str,
    result: &DecryptionResult,
) -> Result<Vec<ProvenValue>, String> {
    if result.clear_values.len() != pending.handles.len() {
        return Err(format!(
            "expected {} clear values, got {}",
            pending.handles.len(),
            result.clear_values.len()
        ));
    }

    let mut stored = Vec::with_capacity(pending.handles.len());
    let mut clear = Vec::with_capacity(pending.handles.len());
    for handle in &pending.handles {
        let value = result
            .clear_values
            .get(handle)
            .ok_or_else(|| format!("no clear value for handle {handle}"))?;
        let ciphertext = values
            .ciphertext(handle)
            .ok_or_else(|| format!("handle {handle} is not stored on the ledger"))?;
        stored.push((*handle, ciphertext));
        clear.push(*value);
    }

    if !verifier.verify_decryption(&stored, &clear, &result.proof, context) {
        return Err("proof does not match the stored ciphertexts".to_string());
    }

    Ok(pending
        .handles
        .iter()
        .zip(clear)
        .map(|(handle, value)| ProvenValue { handle: *handle, value })
        .collect())
}
