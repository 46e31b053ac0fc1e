//! Deterministic stand-in for the crypto backend.
//!
//! A mock ciphertext is the little-endian value followed by a salt byte; its handle is the
//! ciphertext zero-padded to 32 bytes. Input proofs are accepted iff they read
//! `well-formed`; decryption proofs iff they read `decrypts:<context>` and every claimed
//! value matches the stored ciphertext.

use crate::capability::{DecryptionRequest, DecryptionResult, DecryptionVerifier, EncryptedValues};
use crate::errors::MarketError;
use crate::models::{EncryptedInput, Handle};

pub(crate) const WELL_FORMED: &[u8] = b"well-formed";

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct MockBackend;

fn value_of(ciphertext: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = ciphertext.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

impl EncryptedValues for MockBackend {
    fn validate(&self, ciphertext: &[u8], proof: &[u8]) -> Result<Handle, MarketError> {
        if proof != WELL_FORMED || ciphertext.len() < 8 || ciphertext.len() > 32 {
            return Err(MarketError::InvalidCiphertext("mock proof rejected".to_string()));
        }
        let mut handle = [0u8; 32];
        handle[..ciphertext.len()].copy_from_slice(ciphertext);
        Ok(Handle(handle))
    }
}

impl DecryptionVerifier for MockBackend {
    fn verify_decryption(
        &self,
        stored: &[(Handle, &[u8])],
        clear_values: &[u64],
        proof: &[u8],
        context: &str,
    ) -> bool {
        proof == format!("decrypts:{context}").as_bytes()
            && stored.len() == clear_values.len()
            && stored
                .iter()
                .zip(clear_values)
                .all(|((_, ciphertext), value)| value_of(ciphertext) == Some(*value))
    }
}

pub(crate) fn encrypted(value: u64, salt: u8) -> EncryptedInput {
    let mut ciphertext = value.to_le_bytes().to_vec();
    ciphertext.push(salt);
    EncryptedInput { ciphertext, proof: WELL_FORMED.to_vec() }
}

pub(crate) fn rejected(value: u64) -> EncryptedInput {
    EncryptedInput { proof: b"forged".to_vec(), ..encrypted(value, 0) }
}

pub(crate) fn handle_of(input: &EncryptedInput) -> Handle {
    let mut handle = [0u8; 32];
    handle[..input.ciphertext.len()].copy_from_slice(&input.ciphertext);
    Handle(handle)
}

/// What an honest decryption service would answer.
pub(crate) fn honest_result(request: &DecryptionRequest) -> DecryptionResult {
    DecryptionResult {
        clear_values: request
            .ciphertexts
            .iter()
            .map(|(handle, ciphertext)| (*handle, value_of(ciphertext).unwrap_or_default()))
            .collect(),
        proof: format!("decrypts:{}", request.context).into_bytes(),
    }
}
