//! Crate-wide constants used by the native cipher and the circuits.

use ark_bn254::Fr;
use ark_crypto_primitives::sponge::poseidon::{find_poseidon_ark_and_mds, PoseidonConfig};
use ark_ff::PrimeField;
use std::sync::OnceLock;

/// Bit width of an encrypted plaintext. Clear values are `u64`.
pub const VALUE_BITS: usize = 64;

/// Size of a compressed BN254 scalar.
pub const FR_BYTES: usize = 32;

/// Serialized ciphertext: `nonce || masked`.
pub const CIPHERTEXT_BYTES: usize = 2 * FR_BYTES;

// Domain tags absorbed ahead of every Poseidon call.
pub const TAG_KEY: u64 = 0x4b45_5900;
pub const TAG_MASK: u64 = 0x4d41_534b;
pub const TAG_HANDLE: u64 = 0x4841_4e44;
pub const TAG_CONTEXT: u64 = 0x4354_5800;

// Poseidon sponge configuration.
//
// We use a width-3 sponge (rate=2, capacity=1). The native hasher and the in-circuit
// gadget must agree on these constants.
pub const POSEIDON_RATE: usize = 2;
pub const POSEIDON_CAPACITY: usize = 1;

// Typical Poseidon parameters for width=3.
pub const POSEIDON_FULL_ROUNDS: usize = 8;
pub const POSEIDON_PARTIAL_ROUNDS: usize = 57;

/// Poseidon S-box exponent (alpha).
pub const POSEIDON_ALPHA: u64 = 5;

/// Deterministically derive Poseidon parameters for BN254::Fr.
pub fn poseidon_config() -> PoseidonConfig<Fr> {
    let prime_bits = Fr::MODULUS_BIT_SIZE as u64;

    // Derive the round constants (ARK) and MDS matrix.
    let (ark, mds) = find_poseidon_ark_and_mds::<Fr>(
        prime_bits,
        POSEIDON_RATE,
        POSEIDON_FULL_ROUNDS as u64,
        POSEIDON_PARTIAL_ROUNDS as u64,
        0,
    );

    PoseidonConfig::new(
        POSEIDON_FULL_ROUNDS,
        POSEIDON_PARTIAL_ROUNDS,
        POSEIDON_ALPHA,
        mds,
        ark,
        POSEIDON_RATE,
        POSEIDON_CAPACITY,
    )
}

/// Shared parameters; derivation runs once per process.
pub fn poseidon_params() -> &'static PoseidonConfig<Fr> {
    static PARAMS: OnceLock<PoseidonConfig<Fr>> = OnceLock::new();
    PARAMS.get_or_init(poseidon_config)
}
