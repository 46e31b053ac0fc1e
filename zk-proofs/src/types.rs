//! Types shared between the circuits and the host-side prover/verifier.

use crate::constants::{CIPHERTEXT_BYTES, FR_BYTES};
use crate::groth16::ZkError;
use ark_bn254::Fr;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::UniformRand;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Encode a field element with arkworks' canonical compressed encoding.
pub fn fr_to_bytes(x: &Fr) -> Result<[u8; FR_BYTES], ZkError> {
    let mut bytes = Vec::with_capacity(FR_BYTES);
    x.serialize_compressed(&mut bytes)
        .map_err(|e| ZkError::Serialization(format!("{e}")))?;
    bytes
        .try_into()
        .map_err(|_| ZkError::Serialization("unexpected field element width".to_string()))
}

pub fn fr_from_bytes(bytes: &[u8]) -> Result<Fr, ZkError> {
    Fr::deserialize_compressed(bytes).map_err(|e| ZkError::Serialization(format!("{e}")))
}

/// A value encrypted under the network key.
///
/// `masked = value + Poseidon(TAG_MASK, sk, nonce)`; the nonce is public and fresh per
/// encryption.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ciphertext {
    pub nonce: Fr,
    pub masked: Fr,
}

impl Ciphertext {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ZkError> {
        let mut out = Vec::with_capacity(CIPHERTEXT_BYTES);
        out.extend_from_slice(&fr_to_bytes(&self.nonce)?);
        out.extend_from_slice(&fr_to_bytes(&self.masked)?);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ZkError> {
        if bytes.len() != CIPHERTEXT_BYTES {
            return Err(ZkError::InvalidCiphertext(format!(
                "expected {CIPHERTEXT_BYTES} bytes, got {}",
                bytes.len()
            )));
        }

        let nonce = fr_from_bytes(&bytes[..FR_BYTES])
            .map_err(|e| ZkError::InvalidCiphertext(format!("nonce: {e}")))?;
        let masked = fr_from_bytes(&bytes[FR_BYTES..])
            .map_err(|e| ZkError::InvalidCiphertext(format!("masked: {e}")))?;

        Ok(Self { nonce, masked })
    }
}

/// The network decryption key.
///
/// Only the decryption service should hold one. Producers in the reference scheme use it
/// to encrypt as well.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkKey {
    secret: Fr,
}

impl NetworkKey {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self { secret: Fr::rand(rng) }
    }

    pub fn from_secret(secret: Fr) -> Self {
        Self { secret }
    }

    pub fn secret(&self) -> Fr {
        self.secret
    }

    /// Public commitment every proof is checked against.
    pub fn commitment(&self) -> Fr {
        crate::cipher::key_commitment(self.secret)
    }

    pub fn to_bytes(&self) -> Result<[u8; FR_BYTES], ZkError> {
        fr_to_bytes(&self.secret)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ZkError> {
        Ok(Self { secret: fr_from_bytes(bytes)? })
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NetworkKey(..)")
    }
}

/// JSON-friendly representation of a field element.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrHex {
    pub hex: String,
}

impl FrHex {
    pub fn from_fr(x: &Fr) -> Result<Self, ZkError> {
        Ok(Self { hex: hex::encode(fr_to_bytes(x)?) })
    }

    pub fn to_fr(&self) -> Result<Fr, ZkError> {
        let bytes = hex::decode(&self.hex).map_err(|e| ZkError::Serialization(format!("invalid hex: {e}")))?;
        fr_from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn fr_hex_round_trips() {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let x = Fr::rand(&mut rng);
        let encoded = FrHex::from_fr(&x).unwrap();
        assert_eq!(encoded.hex.len(), FR_BYTES * 2);
        assert_eq!(encoded.to_fr().unwrap(), x);
    }

    #[test]
    fn fr_hex_rejects_garbage() {
        assert!(FrHex { hex: "zz".to_string() }.to_fr().is_err());
        assert!(FrHex { hex: "00".to_string() }.to_fr().is_err());
    }
}
