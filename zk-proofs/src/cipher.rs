//! Native side of the masked-value cipher.
//!
//! Everything here MUST match the gadgets in `circuit.rs`: same tags, same absorb order.

use crate::constants::{poseidon_params, FR_BYTES, TAG_CONTEXT, TAG_HANDLE, TAG_KEY, TAG_MASK};
use crate::groth16::ZkError;
use crate::types::{fr_to_bytes, Ciphertext, NetworkKey};
use ark_bn254::Fr;
use ark_crypto_primitives::sponge::poseidon::PoseidonSponge;
use ark_crypto_primitives::sponge::CryptographicSponge;
use ark_ff::PrimeField;
use ark_std::UniformRand;
use rand::{CryptoRng, RngCore};

/// Poseidon hash of a short sequence of field elements.
pub fn poseidon_hash(inputs: &[Fr]) -> Fr {
    let mut sponge = PoseidonSponge::<Fr>::new(poseidon_params());
    sponge.absorb(&inputs.to_vec());
    sponge.squeeze_field_elements::<Fr>(1)[0]
}

pub fn key_commitment(secret: Fr) -> Fr {
    poseidon_hash(&[Fr::from(TAG_KEY), secret])
}

pub fn mask(secret: Fr, nonce: Fr) -> Fr {
    poseidon_hash(&[Fr::from(TAG_MASK), secret, nonce])
}

/// Encrypt `value` under `key` with a fresh nonce.
pub fn encrypt<R: RngCore + CryptoRng>(rng: &mut R, key: &NetworkKey, value: u64) -> Ciphertext {
    let nonce = Fr::rand(rng);
    Ciphertext {
        nonce,
        masked: Fr::from(value) + mask(key.secret(), nonce),
    }
}

/// Recover the clear value. Fails if the unmasked element does not fit in a `u64`,
/// which means the ciphertext was not produced under this key.
pub fn decrypt(key: &NetworkKey, ct: &Ciphertext) -> Result<u64, ZkError> {
    let value = ct.masked - mask(key.secret(), ct.nonce);
    fr_to_u64(&value).ok_or(ZkError::ValueOutOfRange)
}

pub fn fr_to_u64(x: &Fr) -> Option<u64> {
    let limbs = x.into_bigint().0;
    if limbs[1..].iter().any(|l| *l != 0) {
        return None;
    }
    Some(limbs[0])
}

/// Opaque 32-byte handle for a ciphertext.
pub fn handle(ct: &Ciphertext) -> Result<[u8; FR_BYTES], ZkError> {
    fr_to_bytes(&poseidon_hash(&[Fr::from(TAG_HANDLE), ct.nonce, ct.masked]))
}

/// Map a ledger context address onto a single field element.
///
/// Bytes are packed 31 at a time so every chunk is below the modulus.
pub fn context_element(context: &str) -> Fr {
    let mut inputs = vec![Fr::from(TAG_CONTEXT), Fr::from(context.len() as u64)];
    for chunk in context.as_bytes().chunks(31) {
        inputs.push(Fr::from_le_bytes_mod_order(chunk));
    }
    poseidon_hash(&inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn encrypt_then_decrypt_recovers_value() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let key = NetworkKey::generate(&mut rng);

        for value in [0u64, 1, 88, u64::MAX] {
            let ct = encrypt(&mut rng, &key, value);
            assert_eq!(decrypt(&key, &ct).unwrap(), value);
        }
    }

    #[test]
    fn wrong_key_does_not_decrypt() {
        let mut rng = ChaCha20Rng::seed_from_u64(8);
        let key = NetworkKey::generate(&mut rng);
        let other = NetworkKey::generate(&mut rng);

        let ct = encrypt(&mut rng, &key, 42);
        assert!(matches!(decrypt(&other, &ct), Err(ZkError::ValueOutOfRange)));
    }

    #[test]
    fn handles_differ_per_encryption() {
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let key = NetworkKey::generate(&mut rng);

        let a = encrypt(&mut rng, &key, 5);
        let b = encrypt(&mut rng, &key, 5);
        assert_ne!(handle(&a).unwrap(), handle(&b).unwrap());
        assert_eq!(handle(&a).unwrap(), handle(&a).unwrap());
    }

    #[test]
    fn ciphertext_bytes_reject_wrong_length() {
        assert!(matches!(Ciphertext::from_bytes(&[0u8; 10]), Err(ZkError::InvalidCiphertext(_))));
    }

    #[test]
    fn context_element_separates_contexts() {
        assert_ne!(context_element("ledger-a"), context_element("ledger-b"));
        assert_eq!(context_element("ledger-a"), context_element("ledger-a"));
    }
}
