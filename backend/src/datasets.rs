//! Append-only store of derived, sellable datasets.

use crate::capability::{EncryptedValues, ValueTable};
use crate::errors::MarketError;
use crate::models::{EncryptedInput, Handle, Principal, TxContext};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedDataset {
    pub id: u64,
    pub encrypted_value: Handle,
    pub start_time: u64,
    pub end_time: u64,
    pub price: u64,
    pub owner: Principal,
    pub sold: bool,
    pub proven_plaintext: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DatasetListing {
    pub value: EncryptedInput,
    pub start_time: u64,
    pub end_time: u64,
    pub price: u64,
}

#[derive(Debug, Default)]
pub struct DatasetStore {
    datasets: Vec<AggregatedDataset>,
}

impl DatasetStore {
    pub fn len(&self) -> u64 {
        self.datasets.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// The ciphertext is checked first; the window and price checks only run on a
    /// valid value.
    pub(crate) fn create<E: EncryptedValues>(
        &mut self,
        backend: &E,
        values: &mut ValueTable,
        ledger: &Principal,
        ctx: &TxContext,
        listing: DatasetListing,
    ) -> Result<u64, MarketError> {
        let handle = backend.validate(&listing.value.ciphertext, &listing.value.proof)?;

        if listing.start_time >= listing.end_time {
            return Err(MarketError::InvalidTimeRange {
                start: listing.start_time,
                end: listing.end_time,
            });
        }
        if listing.price == 0 {
            return Err(MarketError::InvalidPrice);
        }

        let id = self.len();
        self.datasets.push(AggregatedDataset {
            id,
            encrypted_value: handle,
            start_time: listing.start_time,
            end_time: listing.end_time,
            price: listing.price,
            owner: ctx.sender.clone(),
            sold: false,
            proven_plaintext: None,
        });

        values.register(handle, listing.value.ciphertext);
        values.grant_access(&handle, ledger);
        values.mark_publicly_decryptable(&handle);

        Ok(id)
    }

    pub fn get(&self, id: u64) -> Result<&AggregatedDataset, MarketError> {
        self.datasets
            .get(id as usize)
            .ok_or(MarketError::NotFound { kind: "dataset", id })
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Result<&mut AggregatedDataset, MarketError> {
        self.datasets
            .get_mut(id as usize)
            .ok_or(MarketError::NotFound { kind: "dataset", id })
    }

    /// Exists and is still for sale.
    pub fn is_available(&self, id: u64) -> bool {
        self.get(id).is_ok_and(|dataset| !dataset.sold)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AggregatedDataset> {
        self.datasets.iter()
    }

    /// Unset -> set once; later writes are ignored.
    pub(crate) fn set_proven(&mut self, id: u64, value: u64) -> Result<(), MarketError> {
        let dataset = self.get_mut(id)?;
        if dataset.proven_plaintext.is_none() {
            dataset.proven_plaintext = Some(value);
        }
        Ok(())
    }

    pub(crate) fn restore(datasets: Vec<AggregatedDataset>) -> Result<Self, MarketError> {
        for (index, dataset) in datasets.iter().enumerate() {
            if dataset.id != index as u64 {
                return Err(MarketError::CorruptState(format!(
                    "dataset at position {index} has id {}",
                    dataset.id
                )));
            }
            if dataset.start_time >= dataset.end_time || dataset.price == 0 {
                return Err(MarketError::CorruptState(format!("dataset {} has invalid terms", dataset.id)));
            }
        }
        Ok(Self { datasets })
    }
}
