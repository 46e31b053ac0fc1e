//! Reference cryptographic backend for the confidential traffic ledger.
//!
//! This crate contains:
//! - A Poseidon-masked ciphertext over BN254 with opaque 32-byte handles.
//! - A SNARK circuit proving a ciphertext is well formed (input proof).
//! - A SNARK circuit proving a clear value is the true decryption of a ciphertext.
//! - Prover + verifier orchestration and serialization helpers.

pub mod cipher;
pub mod circuit;
pub mod constants;
pub mod groth16;
pub mod types;
