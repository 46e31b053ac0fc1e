//! Append-only store of producer submissions.

use crate::capability::{EncryptedValues, ValueTable};
use crate::errors::MarketError;
use crate::models::{EncryptedInput, Handle, Principal, ProvenValue, TxContext};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub id: u64,
    pub encrypted_speed: Handle,
    pub encrypted_location_x: Handle,
    pub encrypted_location_y: Handle,
    pub timestamp: u64,
    pub owner: Principal,
}

impl TrafficRecord {
    pub fn handles(&self) -> [Handle; 3] {
        [self.encrypted_speed, self.encrypted_location_x, self.encrypted_location_y]
    }
}

#[derive(Debug, Clone)]
pub struct RecordSubmission {
    pub speed: EncryptedInput,
    pub location_x: EncryptedInput,
    pub location_y: EncryptedInput,
}

/// Records indexed by id. Proven plaintexts live beside the records, never inside them.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: Vec<TrafficRecord>,
    proven: HashMap<u64, BTreeMap<Handle, u64>>,
}

impl RecordStore {
    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Validate all three values, then store the record. Nothing is written unless
    /// every proof checks out.
    pub(crate) fn submit<E: EncryptedValues>(
        &mut self,
        backend: &E,
        values: &mut ValueTable,
        ledger: &Principal,
        ctx: &TxContext,
        submission: RecordSubmission,
    ) -> Result<u64, MarketError> {
        let speed = backend.validate(&submission.speed.ciphertext, &submission.speed.proof)?;
        let location_x = backend.validate(&submission.location_x.ciphertext, &submission.location_x.proof)?;
        let location_y = backend.validate(&submission.location_y.ciphertext, &submission.location_y.proof)?;

        let id = self.len();
        self.records.push(TrafficRecord {
            id,
            encrypted_speed: speed,
            encrypted_location_x: location_x,
            encrypted_location_y: location_y,
            timestamp: ctx.timestamp,
            owner: ctx.sender.clone(),
        });

        for (handle, input) in [
            (speed, submission.speed),
            (location_x, submission.location_x),
            (location_y, submission.location_y),
        ] {
            values.register(handle, input.ciphertext);
            values.grant_access(&handle, ledger);
            values.mark_publicly_decryptable(&handle);
        }

        Ok(id)
    }

    pub fn get(&self, id: u64) -> Result<&TrafficRecord, MarketError> {
        self.records
            .get(id as usize)
            .ok_or(MarketError::NotFound { kind: "record", id })
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrafficRecord> {
        self.records.iter()
    }

    pub fn proven(&self, id: u64, handle: &Handle) -> Option<u64> {
        self.proven.get(&id).and_then(|values| values.get(handle).copied())
    }

    pub fn proven_values(&self, id: u64) -> Vec<ProvenValue> {
        self.proven
            .get(&id)
            .map(|values| {
                values
                    .iter()
                    .map(|(handle, value)| ProvenValue { handle: *handle, value: *value })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First write per handle wins.
    pub(crate) fn set_proven(&mut self, id: u64, handle: Handle, value: u64) {
        self.proven.entry(id).or_default().entry(handle).or_insert(value);
    }

    pub(crate) fn restore(
        records: Vec<TrafficRecord>,
        proven: Vec<(u64, Handle, u64)>,
    ) -> Result<Self, MarketError> {
        for (index, record) in records.iter().enumerate() {
            if record.id != index as u64 {
                return Err(MarketError::CorruptState(format!(
                    "record at position {index} has id {}",
                    record.id
                )));
            }
        }

        let mut store = Self { records, proven: HashMap::new() };
        for (id, handle, value) in proven {
            let record = store.get(id)?;
            if !record.handles().contains(&handle) {
                return Err(MarketError::CorruptState(format!("record {id} has no handle {handle}")));
            }
            store.set_proven(id, handle, value);
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{encrypted, rejected, MockBackend};

    fn submission(base: u64) -> RecordSubmission {
        RecordSubmission {
            speed: encrypted(base, 0),
            location_x: encrypted(base + 1, 1),
            location_y: encrypted(base + 2, 2),
        }
    }

    #[test]
    fn ids_are_dense_and_start_at_zero() {
        let mut store = RecordStore::default();
        let mut values = ValueTable::default();
        let ledger = Principal::new("ledger");
        let ctx = TxContext::new(Principal::new("alice"), 1_000);

        for expected in 0..3u64 {
            assert_eq!(store.len(), expected);
            let id = store.submit(&MockBackend, &mut values, &ledger, &ctx, submission(expected * 10)).unwrap();
            assert_eq!(id, expected);
        }

        let record = store.get(2).unwrap();
        assert_eq!(record.timestamp, 1_000);
        assert_eq!(record.owner, Principal::new("alice"));
        assert!(matches!(store.get(3), Err(MarketError::NotFound { kind: "record", id: 3 })));
    }

    #[test]
    fn one_bad_proof_stores_nothing() {
        let mut store = RecordStore::default();
        let mut values = ValueTable::default();
        let ledger = Principal::new("ledger");
        let ctx = TxContext::new(Principal::new("alice"), 1);

        let mut bad = submission(5);
        bad.location_y = rejected(7);

        let err = store.submit(&MockBackend, &mut values, &ledger, &ctx, bad).unwrap_err();
        assert!(matches!(err, MarketError::InvalidCiphertext(_)));
        assert_eq!(store.len(), 0);
        assert_eq!(values.iter().count(), 0);
    }

    #[test]
    fn stored_values_are_public_and_held_by_ledger() {
        let mut store = RecordStore::default();
        let mut values = ValueTable::default();
        let ledger = Principal::new("ledger");
        let ctx = TxContext::new(Principal::new("alice"), 1);

        let id = store.submit(&MockBackend, &mut values, &ledger, &ctx, submission(1)).unwrap();
        for handle in store.get(id).unwrap().handles() {
            assert!(values.can_decrypt(&handle, &Principal::new("stranger")));
            assert!(values.ciphertext(&handle).is_some());
        }
    }

    #[test]
    fn restore_rejects_gaps() {
        let record = TrafficRecord {
            id: 1,
            encrypted_speed: Handle([1u8; 32]),
            encrypted_location_x: Handle([2u8; 32]),
            encrypted_location_y: Handle([3u8; 32]),
            timestamp: 0,
            owner: Principal::new("alice"),
        };
        assert!(matches!(
            RecordStore::restore(vec![record], Vec::new()),
            Err(MarketError::CorruptState(_))
        ));
    }
}
