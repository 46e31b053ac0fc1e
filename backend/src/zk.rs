//! Groth16 implementation of the ledger's crypto seams.

use crate::capability::{
    DecryptionRequest, DecryptionResult, DecryptionService, DecryptionVerifier, EncryptedValues, ServiceError,
};
use crate::errors::MarketError;
use crate::models::Handle;
use ark_bn254::{Bn254, Fr};
use ark_groth16::{ProvingKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use std::sync::Arc;
use tracing::debug;
use zk_proofs::cipher::{context_element, handle};
use zk_proofs::groth16::{
    decrypt_and_prove, deserialize_proof, deserialize_proof_bundle, encrypt_and_prove, serialize_proof,
    serialize_proof_bundle, setup_decryption_keys, setup_well_formed_keys, verify_decryption,
    verify_well_formed, ZkError,
};
use zk_proofs::types::{Ciphertext, NetworkKey};

/// Everything the server holds for the reference scheme.
#[derive(Clone)]
pub struct ZkKeys {
    pub network: NetworkKey,
    pub input_pk: Arc<ProvingKey<Bn254>>,
    pub input_vk: Arc<VerifyingKey<Bn254>>,
    pub decryption_pk: Arc<ProvingKey<Bn254>>,
    pub decryption_vk: Arc<VerifyingKey<Bn254>>,
}

impl ZkKeys {
    /// Fresh network key and trusted setup for both circuits (prototype).
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Self, ZkError> {
        let network = NetworkKey::generate(rng);
        let input = setup_well_formed_keys(rng)?;
        let decryption = setup_decryption_keys(rng)?;
        Ok(Self {
            network,
            input_pk: Arc::new(input.pk),
            input_vk: Arc::new(input.vk),
            decryption_pk: Arc::new(decryption.pk),
            decryption_vk: Arc::new(decryption.vk),
        })
    }

    /// The ledger-side verifier. Holds no secrets.
    pub fn backend(&self) -> ZkBackend {
        ZkBackend {
            key_commitment: self.network.commitment(),
            input_vk: self.input_vk.clone(),
            decryption_vk: self.decryption_vk.clone(),
        }
    }

    pub fn decryptor(&self) -> LocalDecryptor {
        LocalDecryptor {
            key: self.network.clone(),
            pk: self.decryption_pk.clone(),
        }
    }

    /// Encrypt `value` under the network key with a proof of well-formedness.
    pub fn encrypt<R: RngCore + CryptoRng>(&self, rng: &mut R, value: u64) -> Result<EncryptedValue, ZkError> {
        let (ct, proof) = encrypt_and_prove(rng, &self.input_pk, &self.network, value)?;
        Ok(EncryptedValue {
            handle: Handle(handle(&ct)?),
            ciphertext: ct.to_bytes()?,
            proof: serialize_proof(&proof)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EncryptedValue {
    pub handle: Handle,
    pub ciphertext: Vec<u8>,
    pub proof: Vec<u8>,
}

#[derive(Clone)]
pub struct ZkBackend {
    key_commitment: Fr,
    input_vk: Arc<VerifyingKey<Bn254>>,
    decryption_vk: Arc<VerifyingKey<Bn254>>,
}

impl EncryptedValues for ZkBackend {
    fn validate(&self, ciphertext: &[u8], proof: &[u8]) -> Result<Handle, MarketError> {
        let invalid = |e: ZkError| MarketError::InvalidCiphertext(e.to_string());

        let ct = Ciphertext::from_bytes(ciphertext).map_err(invalid)?;
        let proof = deserialize_proof(proof).map_err(invalid)?;
        verify_well_formed(&self.input_vk, self.key_commitment, &ct, &proof).map_err(invalid)?;

        Ok(Handle(handle(&ct).map_err(invalid)?))
    }
}

impl DecryptionVerifier for ZkBackend {
    fn verify_decryption(
        &self,
        stored: &[(Handle, &[u8])],
        clear_values: &[u64],
        proof: &[u8],
        context: &str,
    ) -> bool {
        let check = || -> Result<(), ZkError> {
            let mut ciphertexts = Vec::with_capacity(stored.len());
            for (expected, bytes) in stored {
                let ct = Ciphertext::from_bytes(bytes)?;
                if handle(&ct)? != expected.0 {
                    return Err(ZkError::InvalidCiphertext(format!("handle {expected} does not match its ciphertext")));
                }
                ciphertexts.push(ct);
            }
            let proofs = deserialize_proof_bundle(proof)?;
            verify_decryption(
                &self.decryption_vk,
                self.key_commitment,
                &ciphertexts,
                clear_values,
                context_element(context),
                &proofs,
            )
        };

        match check() {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "decryption bundle rejected");
                false
            }
        }
    }
}

/// Reference decryption service: holds the network key and proves every answer.
#[derive(Clone)]
pub struct LocalDecryptor {
    key: NetworkKey,
    pk: Arc<ProvingKey<Bn254>>,
}

impl DecryptionService for LocalDecryptor {
    async fn decrypt(&self, request: &DecryptionRequest) -> Result<DecryptionResult, ServiceError> {
        let key = self.key.clone();
        let pk = self.pk.clone();
        let request = request.clone();

        // Proving is CPU-heavy; keep it off the async workers.
        tokio::task::spawn_blocking(move || {
            let ciphertexts = request
                .ciphertexts
                .iter()
                .map(|(_, bytes)| Ciphertext::from_bytes(bytes))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ServiceError::Rejected(e.to_string()))?;

            let mut rng = OsRng;
            let (values, proofs) = decrypt_and_prove(&mut rng, &pk, &key, &ciphertexts, context_element(&request.context))
                .map_err(|e| ServiceError::Rejected(e.to_string()))?;
            let proof = serialize_proof_bundle(&proofs).map_err(|e| ServiceError::Unavailable(e.to_string()))?;

            Ok(DecryptionResult {
                clear_values: request
                    .ciphertexts
                    .iter()
                    .map(|(handle, _)| *handle)
                    .zip(values)
                    .collect(),
                proof,
            })
        })
        .await
        .map_err(|e| ServiceError::Unavailable(format!("prover task failed: {e}")))?
    }
}
