//! Per-owner sale proceeds, released only by explicit withdrawal.

use crate::datasets::DatasetStore;
use crate::errors::MarketError;
use crate::models::Principal;
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PayoutError(pub String);

/// Moves funds out of the ledger.
pub trait Payout {
    fn transfer(&mut self, recipient: &Principal, amount: u64) -> Result<(), PayoutError>;
}

/// Invariant: `held == sum(balances)`.
#[derive(Debug, Default)]
pub struct EscrowLedger {
    balances: HashMap<Principal, u64>,
    held: u64,
}

impl EscrowLedger {
    pub fn balance_of(&self, owner: &Principal) -> u64 {
        self.balances.get(owner).copied().unwrap_or(0)
    }

    /// Funds received by the ledger and not yet paid out.
    pub fn held(&self) -> u64 {
        self.held
    }

    pub fn balances(&self) -> impl Iterator<Item = (&Principal, &u64)> {
        self.balances.iter()
    }

    /// Buy a dataset. The whole payment is credited to the owner, overpayment included.
    /// Returns the dataset owner.
    pub(crate) fn purchase(
        &mut self,
        datasets: &mut DatasetStore,
        dataset_id: u64,
        payment: u64,
    ) -> Result<Principal, MarketError> {
        let dataset = datasets.get_mut(dataset_id)?;
        if dataset.sold {
            return Err(MarketError::AlreadySold(dataset_id));
        }
        if payment < dataset.price {
            return Err(MarketError::InsufficientPayment { price: dataset.price, paid: payment });
        }

        let balance = self
            .balance_of(&dataset.owner)
            .checked_add(payment)
            .ok_or(MarketError::BalanceOverflow)?;
        let held = self.held.checked_add(payment).ok_or(MarketError::BalanceOverflow)?;

        self.balances.insert(dataset.owner.clone(), balance);
        self.held = held;
        dataset.sold = true;

        Ok(dataset.owner.clone())
    }

    /// Zero the balance, then transfer. A failed transfer restores the balance.
    pub(crate) fn withdraw<P: Payout>(&mut self, caller: &Principal, payout: &mut P) -> Result<u64, MarketError> {
        let amount = self.balance_of(caller);
        if amount == 0 {
            return Err(MarketError::NoFunds);
        }

        self.balances.remove(caller);
        self.held -= amount;

        if let Err(e) = payout.transfer(caller, amount) {
            warn!(%caller, amount, error = %e, "payout failed, restoring balance");
            self.balances.insert(caller.clone(), amount);
            self.held += amount;
            return Err(MarketError::TransferFailed(e.0));
        }

        Ok(amount)
    }

    pub(crate) fn restore(balances: Vec<(Principal, u64)>) -> Result<Self, MarketError> {
        let mut held = 0u64;
        let mut map = HashMap::new();
        for (owner, balance) in balances {
            if balance == 0 {
                continue;
            }
            held = held.checked_add(balance).ok_or(MarketError::BalanceOverflow)?;
            map.insert(owner, balance);
        }
        Ok(Self { balances: map, held })
    }
}
