//! Seams to the encryption backend and the off-ledger decryption service.
//!
//! The ledger never looks inside ciphertext bytes. It asks a backend to validate them,
//! keeps the accepted bytes under an opaque [`Handle`], and tags every handle with an
//! [`AccessPolicy`] of its own.

use crate::errors::MarketError;
use crate::models::{Handle, Principal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use thiserror::Error;
use uuid::Uuid;

/// Input side of the encryption capability.
pub trait EncryptedValues {
    /// Check `ciphertext` against its proof of well-formedness and derive its handle.
    ///
    /// Must be free of side effects: the ledger validates every value of an operation
    /// before storing any of them.
    fn validate(&self, ciphertext: &[u8], proof: &[u8]) -> Result<Handle, MarketError>;
}

/// Ledger-side check of a decryption result.
pub trait DecryptionVerifier {
    /// `stored[i]` is the handle and the ciphertext bytes held by the ledger; `clear_values[i]`
    /// is the plaintext claimed for it. Returns true only if `proof` attests every pair
    /// under `context`.
    fn verify_decryption(
        &self,
        stored: &[(Handle, &[u8])],
        clear_values: &[u64],
        proof: &[u8],
        context: &str,
    ) -> bool;
}

/// What the ledger sends to the decryption service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionRequest {
    pub request_id: Uuid,
    pub context: String,
    pub ciphertexts: Vec<(Handle, Vec<u8>)>,
}

/// Unverified payload returned by the decryption service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionResult {
    pub clear_values: BTreeMap<Handle, u64>,
    pub proof: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("decryption service unavailable: {0}")]
    Unavailable(String),

    #[error("decryption service rejected the request: {0}")]
    Rejected(String),
}

/// Off-ledger decryption. May be slow, may fail, is never trusted.
pub trait DecryptionService: Send + Sync {
    fn decrypt(
        &self,
        request: &DecryptionRequest,
    ) -> impl Future<Output = Result<DecryptionResult, ServiceError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "principals", rename_all = "snake_case")]
pub enum AccessPolicy {
    Restricted(BTreeSet<Principal>),
    Public,
}

impl AccessPolicy {
    pub fn allows(&self, principal: &Principal) -> bool {
        match self {
            AccessPolicy::Public => true,
            AccessPolicy::Restricted(principals) => principals.contains(principal),
        }
    }
}

impl Default for AccessPolicy {
    fn default() -> Self {
        AccessPolicy::Restricted(BTreeSet::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    pub ciphertext: Vec<u8>,
    pub policy: AccessPolicy,
}

/// Ciphertexts held by the ledger, keyed by handle.
#[derive(Debug, Default)]
pub struct ValueTable {
    values: HashMap<Handle, StoredValue>,
}

impl ValueTable {
    pub(crate) fn register(&mut self, handle: Handle, ciphertext: Vec<u8>) {
        self.values.entry(handle).or_insert_with(|| StoredValue {
            ciphertext,
            policy: AccessPolicy::default(),
        });
    }

    pub(crate) fn grant_access(&mut self, handle: &Handle, principal: &Principal) {
        if let Some(stored) = self.values.get_mut(handle) {
            if let AccessPolicy::Restricted(principals) = &mut stored.policy {
                principals.insert(principal.clone());
            }
        }
    }

    /// One-way: a public value never becomes restricted again.
    pub(crate) fn mark_publicly_decryptable(&mut self, handle: &Handle) {
        if let Some(stored) = self.values.get_mut(handle) {
            stored.policy = AccessPolicy::Public;
        }
    }

    pub fn can_decrypt(&self, handle: &Handle, principal: &Principal) -> bool {
        self.values
            .get(handle)
            .is_some_and(|stored| stored.policy.allows(principal))
    }

    pub fn get(&self, handle: &Handle) -> Option<&StoredValue> {
        self.values.get(handle)
    }

    pub fn ciphertext(&self, handle: &Handle) -> Option<&[u8]> {
        self.values.get(handle).map(|stored| stored.ciphertext.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Handle, &StoredValue)> {
        self.values.iter()
    }

    pub(crate) fn restore(entries: Vec<(Handle, StoredValue)>) -> Self {
        Self { values: entries.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_policy_grants_and_publishes() {
        let mut table = ValueTable::default();
        let handle = Handle([3u8; 32]);
        let ledger = Principal::new("ledger");
        let buyer = Principal::new("buyer");

        table.register(handle, vec![1, 2, 3]);
        assert!(!table.can_decrypt(&handle, &ledger));

        table.grant_access(&handle, &ledger);
        assert!(table.can_decrypt(&handle, &ledger));
        assert!(!table.can_decrypt(&handle, &buyer));

        table.mark_publicly_decryptable(&handle);
        assert!(table.can_decrypt(&handle, &buyer));

        table.grant_access(&handle, &buyer);
        assert_eq!(table.get(&handle).unwrap().policy, AccessPolicy::Public);
    }

    #[test]
    fn unknown_handles_are_never_decryptable() {
        let table = ValueTable::default();
        assert!(!table.can_decrypt(&Handle([9u8; 32]), &Principal::new("anyone")));
    }

    #[test]
    fn re_registering_keeps_first_ciphertext() {
        let mut table = ValueTable::default();
        let handle = Handle([4u8; 32]);
        table.register(handle, vec![1]);
        table.mark_publicly_decryptable(&handle);
        table.register(handle, vec![2]);

        assert_eq!(table.ciphertext(&handle), Some(&[1u8][..]));
        assert_eq!(table.get(&handle).unwrap().policy, AccessPolicy::Public);
    }
}
