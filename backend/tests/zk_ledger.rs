//! End-to-end ledger flows against the Groth16 backend.

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use traffic_ledger::capability::DecryptionService;
use traffic_ledger::datasets::DatasetListing;
use traffic_ledger::decryption::{CommitOutcome, DecryptionState, DecryptionTarget};
use traffic_ledger::errors::MarketError;
use traffic_ledger::market::Marketplace;
use traffic_ledger::models::{EncryptedInput, Principal, ProvenValue, TxContext};
use traffic_ledger::records::RecordSubmission;
use traffic_ledger::zk::ZkKeys;

fn input(keys: &ZkKeys, rng: &mut ChaCha20Rng, value: u64) -> EncryptedInput {
    let encrypted = keys.encrypt(rng, value).unwrap();
    EncryptedInput { ciphertext: encrypted.ciphertext, proof: encrypted.proof }
}

fn tx(who: &str) -> TxContext {
    TxContext::new(Principal::new(who), 1_000)
}

#[tokio::test]
async fn record_fields_are_revealed_only_through_verified_proofs() {
    let mut rng = ChaCha20Rng::seed_from_u64(42);
    let keys = ZkKeys::generate(&mut rng).unwrap();
    let mut market = Marketplace::new(keys.backend(), "city-ledger");

    let submission = RecordSubmission {
        speed: input(&keys, &mut rng, 63),
        location_x: input(&keys, &mut rng, 1_204),
        location_y: input(&keys, &mut rng, 877),
    };
    let record_id = market.submit_record(&tx("sensor-1"), submission).unwrap();
    let record = market.get_record(record_id).unwrap().clone();

    let request_id = market
        .request_decryption(
            &tx("analyst"),
            DecryptionTarget::Record(record_id),
            vec![record.encrypted_speed, record.encrypted_location_y],
        )
        .unwrap();
    let request = market.decryption_request(&request_id).unwrap();
    let answer = keys.decryptor().decrypt(&request).await.unwrap();

    let mut lying = answer.clone();
    lying.clear_values.insert(record.encrypted_speed, 120);
    assert!(matches!(
        market.commit_decryption(&tx("relayer"), &request_id, &lying),
        Err(MarketError::ProofInvalid(_))
    ));
    assert!(market.record_plaintexts(record_id).unwrap().is_empty());
    assert_eq!(market.decryption(&request_id).unwrap().state, DecryptionState::Failed);

    let outcome = market.commit_decryption(&tx("relayer"), &request_id, &answer).unwrap();
    assert!(matches!(outcome, CommitOutcome::Committed(_)));
    let mut proven = market.record_plaintexts(record_id).unwrap();
    proven.sort_by_key(|p| p.value);
    assert_eq!(
        proven,
        vec![
            ProvenValue { handle: record.encrypted_speed, value: 63 },
            ProvenValue { handle: record.encrypted_location_y, value: 877 },
        ]
    );

    let x_request = market
        .request_decryption(&tx("analyst"), DecryptionTarget::Record(record_id), vec![record.encrypted_location_x])
        .unwrap();
    assert_eq!(market.decryption(&x_request).unwrap().state, DecryptionState::Requested);
}

#[tokio::test]
async fn proofs_do_not_replay_across_ledgers() {
    let mut rng = ChaCha20Rng::seed_from_u64(7);
    let keys = ZkKeys::generate(&mut rng).unwrap();
    let mut east = Marketplace::new(keys.backend(), "east");
    let mut west = Marketplace::new(keys.backend(), "west");

    let value = input(&keys, &mut rng, 250);
    for market in [&mut east, &mut west] {
        let listing = DatasetListing { value: value.clone(), start_time: 10, end_time: 20, price: 5 };
        market.create_dataset(&tx("aggregator"), listing).unwrap();
    }
    let handle = east.get_dataset(0).unwrap().encrypted_value;

    let east_id = east
        .request_decryption(&tx("buyer"), DecryptionTarget::Dataset(0), vec![handle])
        .unwrap();
    let west_id = west
        .request_decryption(&tx("buyer"), DecryptionTarget::Dataset(0), vec![handle])
        .unwrap();

    let east_answer = keys
        .decryptor()
        .decrypt(&east.decryption_request(&east_id).unwrap())
        .await
        .unwrap();

    assert!(matches!(
        west.commit_decryption(&tx("relayer"), &west_id, &east_answer),
        Err(MarketError::ProofInvalid(_))
    ));
    assert_eq!(west.get_dataset(0).unwrap().proven_plaintext, None);

    east.commit_decryption(&tx("relayer"), &east_id, &east_answer).unwrap();
    assert_eq!(east.get_dataset(0).unwrap().proven_plaintext, Some(250));
}

#[test]
fn inputs_proven_under_another_key_are_rejected() {
    let mut rng = ChaCha20Rng::seed_from_u64(3);
    let ours = ZkKeys::generate(&mut rng).unwrap();
    let theirs = ZkKeys::generate(&mut rng).unwrap();
    let mut market = Marketplace::new(ours.backend(), "ledger");

    let listing = DatasetListing { value: input(&theirs, &mut rng, 9), start_time: 1, end_time: 2, price: 1 };
    assert!(matches!(
        market.create_dataset(&tx("aggregator"), listing),
        Err(MarketError::InvalidCiphertext(_))
    ));
    assert_eq!(market.total_datasets(), 0);
}
