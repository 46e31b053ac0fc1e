//! Groth16 prover/verifier orchestration for the cipher circuits.
//!
//! SECURITY NOTE (prototype): Groth16 requires a trusted setup that produces a proving key (PK)
//! and verifying key (VK). This prototype generates keys locally. In production, an MPC ceremony
//! (or a transparent system) should be used.

use crate::cipher::{decrypt, encrypt};
use crate::circuit::{DecryptionCircuit, WellFormedCircuit};
use crate::types::{Ciphertext, NetworkKey};
use ark_bn254::{Bn254, Fr};
use ark_groth16::{prepare_verifying_key, Groth16, Proof, ProvingKey, VerifyingKey};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use rand::{CryptoRng, RngCore};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZkError {
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("decrypted value does not fit in 64 bits")]
    ValueOutOfRange,

    #[error("proof bundle holds {got} proofs, expected {expected}")]
    BundleSizeMismatch { expected: usize, got: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("proof verification failed")]
    VerificationFailed,

    #[error("arkworks error: {0}")]
    Ark(String),
}

/// A Groth16 key pair for one circuit.
#[derive(Clone)]
pub struct CircuitKeys {
    pub pk: ProvingKey<Bn254>,
    pub vk: VerifyingKey<Bn254>,
}

/// ORDERING MUST MATCH `WellFormedCircuit`'s `new_input` allocation order.
pub fn well_formed_public_inputs(key_commitment: Fr, ct: &Ciphertext) -> Vec<Fr> {
    vec![key_commitment, ct.nonce, ct.masked]
}

/// ORDERING MUST MATCH `DecryptionCircuit`'s `new_input` allocation order.
pub fn decryption_public_inputs(key_commitment: Fr, ct: &Ciphertext, value: u64, context: Fr) -> Vec<Fr> {
    vec![key_commitment, ct.nonce, ct.masked, Fr::from(value), context]
}

/// A satisfying witness for setup; constraints do not depend on its values.
fn dummy_opening() -> (NetworkKey, Ciphertext) {
    let key = NetworkKey::from_secret(Fr::from(1u64));
    let ct = Ciphertext {
        nonce: Fr::from(0u64),
        masked: crate::cipher::mask(key.secret(), Fr::from(0u64)),
    };
    (key, ct)
}

pub fn setup_well_formed_keys<R: RngCore + CryptoRng>(rng: &mut R) -> Result<CircuitKeys, ZkError> {
    let (key, ct) = dummy_opening();
    let circuit = WellFormedCircuit {
        key_commitment: key.commitment(),
        nonce: ct.nonce,
        masked: ct.masked,
        secret: key.secret(),
        value: 0,
    };

    let pk = Groth16::<Bn254>::generate_random_parameters_with_reduction(circuit, rng)
        .map_err(|e| ZkError::Ark(format!("{e}")))?;
    let vk = pk.vk.clone();
    Ok(CircuitKeys { pk, vk })
}

pub fn setup_decryption_keys<R: RngCore + CryptoRng>(rng: &mut R) -> Result<CircuitKeys, ZkError> {
    let (key, ct) = dummy_opening();
    let circuit = DecryptionCircuit {
        key_commitment: key.commitment(),
        nonce: ct.nonce,
        masked: ct.masked,
        value: 0,
        context: Fr::from(0u64),
        secret: key.secret(),
    };

    let pk = Groth16::<Bn254>::generate_random_parameters_with_reduction(circuit, rng)
        .map_err(|e| ZkError::Ark(format!("{e}")))?;
    let vk = pk.vk.clone();
    Ok(CircuitKeys { pk, vk })
}

/// Encrypt `value` and prove the resulting ciphertext is well formed.
pub fn encrypt_and_prove<R: RngCore + CryptoRng>(
    rng: &mut R,
    pk: &ProvingKey<Bn254>,
    key: &NetworkKey,
    value: u64,
) -> Result<(Ciphertext, Proof<Bn254>), ZkError> {
    let ct = encrypt(rng, key, value);

    let circuit = WellFormedCircuit {
        key_commitment: key.commitment(),
        nonce: ct.nonce,
        masked: ct.masked,
        secret: key.secret(),
        value,
    };

    let proof = Groth16::<Bn254>::create_random_proof_with_reduction(circuit, pk, rng)
        .map_err(|e| ZkError::Ark(format!("{e}")))?;

    Ok((ct, proof))
}

pub fn verify_well_formed(
    vk: &VerifyingKey<Bn254>,
    key_commitment: Fr,
    ct: &Ciphertext,
    proof: &Proof<Bn254>,
) -> Result<(), ZkError> {
    let public_inputs = well_formed_public_inputs(key_commitment, ct);
    verify(vk, proof, &public_inputs)
}

/// Decrypt and prove the result, one proof per ciphertext.
pub fn decrypt_and_prove<R: RngCore + CryptoRng>(
    rng: &mut R,
    pk: &ProvingKey<Bn254>,
    key: &NetworkKey,
    ciphertexts: &[Ciphertext],
    context: Fr,
) -> Result<(Vec<u64>, Vec<Proof<Bn254>>), ZkError> {
    let mut values = Vec::with_capacity(ciphertexts.len());
    let mut proofs = Vec::with_capacity(ciphertexts.len());

    for ct in ciphertexts {
        let value = decrypt(key, ct)?;

        let circuit = DecryptionCircuit {
            key_commitment: key.commitment(),
            nonce: ct.nonce,
            masked: ct.masked,
            value,
            context,
            secret: key.secret(),
        };

        let proof = Groth16::<Bn254>::create_random_proof_with_reduction(circuit, pk, rng)
            .map_err(|e| ZkError::Ark(format!("{e}")))?;

        values.push(value);
        proofs.push(proof);
    }

    Ok((values, proofs))
}

/// Verify a decryption bundle: `proofs[i]` must attest `values[i]` for `ciphertexts[i]`.
pub fn verify_decryption(
    vk: &VerifyingKey<Bn254>,
    key_commitment: Fr,
    ciphertexts: &[Ciphertext],
    values: &[u64],
    context: Fr,
    proofs: &[Proof<Bn254>],
) -> Result<(), ZkError> {
    if values.len() != ciphertexts.len() || proofs.len() != ciphertexts.len() {
        return Err(ZkError::BundleSizeMismatch {
            expected: ciphertexts.len(),
            got: proofs.len().min(values.len()),
        });
    }

    for ((ct, value), proof) in ciphertexts.iter().zip(values).zip(proofs) {
        let public_inputs = decryption_public_inputs(key_commitment, ct, *value, context);
        verify(vk, proof, &public_inputs)?;
    }
    Ok(())
}

fn verify(vk: &VerifyingKey<Bn254>, proof: &Proof<Bn254>, public_inputs: &[Fr]) -> Result<(), ZkError> {
    let pvk = prepare_verifying_key(vk);
    let ok = Groth16::<Bn254>::verify_proof(&pvk, proof, public_inputs)
        .map_err(|e| ZkError::Ark(format!("{e}")))?;
    if !ok {
        return Err(ZkError::VerificationFailed);
    }
    Ok(())
}

/// Serialize a proving key to bytes.
pub fn serialize_pk(pk: &ProvingKey<Bn254>) -> Result<Vec<u8>, ZkError> {
    let mut out = Vec::new();
    pk.serialize_compressed(&mut out)
        .map_err(|e| ZkError::Serialization(format!("{e}")))?;
    Ok(out)
}

pub fn deserialize_pk(bytes: &[u8]) -> Result<ProvingKey<Bn254>, ZkError> {
    ProvingKey::<Bn254>::deserialize_compressed(bytes)
        .map_err(|e| ZkError::Serialization(format!("{e}")))
}

pub fn serialize_vk(vk: &VerifyingKey<Bn254>) -> Result<Vec<u8>, ZkError> {
    let mut out = Vec::new();
    vk.serialize_compressed(&mut out)
        .map_err(|e| ZkError::Serialization(format!("{e}")))?;
    Ok(out)
}

pub fn deserialize_vk(bytes: &[u8]) -> Result<VerifyingKey<Bn254>, ZkError> {
    VerifyingKey::<Bn254>::deserialize_compressed(bytes)
        .map_err(|e| ZkError::Serialization(format!("{e}")))
}

pub fn serialize_proof(proof: &Proof<Bn254>) -> Result<Vec<u8>, ZkError> {
    let mut out = Vec::new();
    proof
        .serialize_compressed(&mut out)
        .map_err(|e| ZkError::Serialization(format!("{e}")))?;
    Ok(out)
}

pub fn deserialize_proof(bytes: &[u8]) -> Result<Proof<Bn254>, ZkError> {
    Proof::<Bn254>::deserialize_compressed(bytes)
        .map_err(|e| ZkError::Serialization(format!("{e}")))
}

/// A batch of decryption proofs travels as one length-prefixed blob.
pub fn serialize_proof_bundle(proofs: &[Proof<Bn254>]) -> Result<Vec<u8>, ZkError> {
    let mut out = Vec::new();
    proofs
        .to_vec()
        .serialize_compressed(&mut out)
        .map_err(|e| ZkError::Serialization(format!("{e}")))?;
    Ok(out)
}

pub fn deserialize_proof_bundle(bytes: &[u8]) -> Result<Vec<Proof<Bn254>>, ZkError> {
    Vec::<Proof<Bn254>>::deserialize_compressed(bytes)
        .map_err(|e| ZkError::Serialization(format!("{e}")))
}
