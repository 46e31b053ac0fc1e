//! R1CS circuits over the masked-value cipher.
//!
//! Two statements are proven:
//! 1) Well-formedness (producer side): the prover knows `(sk, value)` such that
//!    `K = Poseidon(TAG_KEY, sk)`, `masked = value + Poseidon(TAG_MASK, sk, nonce)` and
//!    `value < 2^64`. The value stays a witness.
//! 2) Decryption correctness (decryption service side): same relation, but `value` is a
//!    public input and the proof is bound to a ledger context element.
//!
//! Public input ordering MUST match `groth16::well_formed_public_inputs` and
//! `groth16::decryption_public_inputs`.

use crate::constants::{poseidon_params, TAG_KEY, TAG_MASK, VALUE_BITS};
use ark_bn254::Fr;
use ark_crypto_primitives::sponge::constraints::CryptographicSpongeVar;
use ark_crypto_primitives::sponge::poseidon::constraints::PoseidonSpongeVar;
use ark_r1cs_std::fields::fp::FpVar;
use ark_r1cs_std::prelude::*;
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystemRef, SynthesisError};

/// Convert little-endian boolean bits into an FpVar.
fn bits_le_to_fp(bits_le: &[Boolean<Fr>]) -> Result<FpVar<Fr>, SynthesisError> {
    let mut acc = FpVar::<Fr>::constant(Fr::from(0u64));
    let mut coeff = FpVar::<Fr>::constant(Fr::from(1u64));

    for b in bits_le {
        // b ? coeff : 0
        let term = b.select(&coeff, &FpVar::<Fr>::constant(Fr::from(0u64)))?;
        acc += term;
        coeff += coeff.clone();
    }

    Ok(acc)
}

/// Enforce that `v` fits in `n` bits.
fn constrain_bits(v: &FpVar<Fr>, n: usize) -> Result<(), SynthesisError> {
    let bits = v.to_bits_le()?;
    let reconstructed = bits_le_to_fp(&bits[..n])?;
    reconstructed.enforce_equal(v)
}

fn poseidon_var(cs: ConstraintSystemRef<Fr>, inputs: Vec<FpVar<Fr>>) -> Result<FpVar<Fr>, SynthesisError> {
    let mut sponge = PoseidonSpongeVar::<Fr>::new(cs, poseidon_params());
    sponge.absorb(&inputs)?;
    let out = sponge.squeeze_field_elements(1)?;
    Ok(out[0].clone())
}

/// The shared relation: key commitment, mask and range.
fn enforce_opening(
    cs: ConstraintSystemRef<Fr>,
    key_commitment: &FpVar<Fr>,
    nonce: &FpVar<Fr>,
    masked: &FpVar<Fr>,
    value: &FpVar<Fr>,
    secret: &FpVar<Fr>,
) -> Result<(), SynthesisError> {
    let derived_key = poseidon_var(
        cs.clone(),
        vec![FpVar::<Fr>::constant(Fr::from(TAG_KEY)), secret.clone()],
    )?;
    derived_key.enforce_equal(key_commitment)?;

    let mask = poseidon_var(
        cs,
        vec![FpVar::<Fr>::constant(Fr::from(TAG_MASK)), secret.clone(), nonce.clone()],
    )?;
    let unmasked = value + &mask;
    unmasked.enforce_equal(masked)?;

    constrain_bits(value, VALUE_BITS)
}

/// Circuit proving a ciphertext was produced from some `u64` under the network key.
#[derive(Clone, Debug)]
pub struct WellFormedCircuit {
    // Public.
    pub key_commitment: Fr,
    pub nonce: Fr,
    pub masked: Fr,

    // Private.
    pub secret: Fr,
    pub value: u64,
}

impl ConstraintSynthesizer<Fr> for WellFormedCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        let key_commitment = FpVar::<Fr>::new_input(cs.clone(), || Ok(self.key_commitment))?;
        let nonce = FpVar::<Fr>::new_input(cs.clone(), || Ok(self.nonce))?;
        let masked = FpVar::<Fr>::new_input(cs.clone(), || Ok(self.masked))?;

        let secret = FpVar::<Fr>::new_witness(cs.clone(), || Ok(self.secret))?;
        let value = FpVar::<Fr>::new_witness(cs.clone(), || Ok(Fr::from(self.value)))?;

        enforce_opening(cs, &key_commitment, &nonce, &masked, &value, &secret)
    }
}

/// Circuit proving `value` is the decryption of `(nonce, masked)` under the network key.
#[derive(Clone, Debug)]
pub struct DecryptionCircuit {
    // Public.
    pub key_commitment: Fr,
    pub nonce: Fr,
    pub masked: Fr,
    pub value: u64,
    pub context: Fr,

    // Private.
    pub secret: Fr,
}

impl ConstraintSynthesizer<Fr> for DecryptionCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        let key_commitment = FpVar::<Fr>::new_input(cs.clone(), || Ok(self.key_commitment))?;
        let nonce = FpVar::<Fr>::new_input(cs.clone(), || Ok(self.nonce))?;
        let masked = FpVar::<Fr>::new_input(cs.clone(), || Ok(self.masked))?;
        let value = FpVar::<Fr>::new_input(cs.clone(), || Ok(Fr::from(self.value)))?;
        let context = FpVar::<Fr>::new_input(cs.clone(), || Ok(self.context))?;

        let secret = FpVar::<Fr>::new_witness(cs.clone(), || Ok(self.secret))?;

        enforce_opening(cs, &key_commitment, &nonce, &masked, &value, &secret)?;

        // Ties the context into the constraint system.
        let _ = context.square()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{context_element, encrypt};
    use crate::types::NetworkKey;
    use ark_relations::r1cs::ConstraintSystem;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn well_formed_circuit_is_satisfied_by_honest_witness() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let key = NetworkKey::generate(&mut rng);
        let ct = encrypt(&mut rng, &key, 61);

        let cs = ConstraintSystem::<Fr>::new_ref();
        WellFormedCircuit {
            key_commitment: key.commitment(),
            nonce: ct.nonce,
            masked: ct.masked,
            secret: key.secret(),
            value: 61,
        }
        .generate_constraints(cs.clone())
        .unwrap();

        assert!(cs.is_satisfied().unwrap());
    }

    #[test]
    fn decryption_circuit_rejects_wrong_value() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let key = NetworkKey::generate(&mut rng);
        let ct = encrypt(&mut rng, &key, 61);

        let cs = ConstraintSystem::<Fr>::new_ref();
        DecryptionCircuit {
            key_commitment: key.commitment(),
            nonce: ct.nonce,
            masked: ct.masked,
            value: 62,
            context: context_element("test"),
            secret: key.secret(),
        }
        .generate_constraints(cs.clone())
        .unwrap();

        assert!(!cs.is_satisfied().unwrap());
    }
}
