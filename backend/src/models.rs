use crate::datasets::AggregatedDataset;
use crate::decryption::{DecryptionState, DecryptionTarget, PendingDecryption};
use crate::errors::ApiError;
use crate::records::TrafficRecord;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// An account on the ledger: producer, buyer, dataset owner or the ledger context itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(pub String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to a stored ciphertext. Hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub [u8; 32]);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", hex::encode(&self.0[..6]))
    }
}

impl FromStr for Handle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid handle hex: {e}"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "handle must be 32 bytes".to_string())?;
        Ok(Handle(bytes))
    }
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Caller and ledger time of one state-mutating operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxContext {
    pub sender: Principal,
    pub timestamp: u64,
}

impl TxContext {
    pub fn new(sender: Principal, timestamp: u64) -> Self {
        Self { sender, timestamp }
    }

    /// Stamp with the current wall clock.
    pub fn now(sender: Principal) -> Self {
        let timestamp = chrono::Utc::now().timestamp().max(0) as u64;
        Self { sender, timestamp }
    }
}

/// A ciphertext as submitted, with its proof of well-formedness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedInput {
    pub ciphertext: Vec<u8>,
    pub proof: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenValue {
    pub handle: Handle,
    pub value: u64,
}

/// Notifications emitted after the store mutation they describe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    RecordAdded {
        record_id: u64,
        submitter: Principal,
    },
    DatasetCreated {
        dataset_id: u64,
        creator: Principal,
    },
    DataSold {
        dataset_id: u64,
        buyer: Principal,
        amount: u64,
    },
    Withdrawal {
        recipient: Principal,
        amount: u64,
    },
    DecryptionRequested {
        request_id: Uuid,
        target: DecryptionTarget,
        requester: Principal,
    },
    DecryptionProven {
        request_id: Uuid,
        target: DecryptionTarget,
        values: Vec<ProvenValue>,
    },
    DecryptionFailed {
        request_id: Uuid,
        target: DecryptionTarget,
        reason: String,
    },
    /// A request whose target was proven by a competing request.
    DecryptionClosed {
        request_id: Uuid,
        target: DecryptionTarget,
    },
}

// ---------------------------------------------------------------------------
// HTTP payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct EncryptedInputDto {
    pub ciphertext_hex: String,
    pub proof_b64: String,
}

impl TryFrom<EncryptedInputDto> for EncryptedInput {
    type Error = ApiError;

    fn try_from(dto: EncryptedInputDto) -> Result<Self, Self::Error> {
        let ciphertext = hex::decode(dto.ciphertext_hex)
            .map_err(|_| ApiError::BadRequest("invalid ciphertext_hex".to_string()))?;
        let proof = base64::engine::general_purpose::STANDARD
            .decode(dto.proof_b64)
            .map_err(|_| ApiError::BadRequest("invalid proof_b64".to_string()))?;
        Ok(EncryptedInput { ciphertext, proof })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordSubmitRequest {
    pub speed: EncryptedInputDto,
    pub location_x: EncryptedInputDto,
    pub location_y: EncryptedInputDto,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordSubmitResponse {
    pub record_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordGetResponse {
    #[serde(flatten)]
    pub record: TrafficRecord,
    pub proven: Vec<ProvenValue>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatasetCreateRequest {
    pub value: EncryptedInputDto,
    pub start_time: u64,
    pub end_time: u64,
    pub price: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatasetCreateResponse {
    pub dataset_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatasetGetResponse {
    #[serde(flatten)]
    pub dataset: AggregatedDataset,
    pub available: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AvailabilityResponse {
    pub dataset_id: u64,
    pub available: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub payment: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WithdrawResponse {
    pub amount: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub total_records: u64,
    pub total_datasets: u64,
    pub funds_held: u64,
    pub pending_decryptions: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EscrowResponse {
    pub owner: Principal,
    pub balance: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DecryptionCreateRequest {
    pub target: DecryptionTarget,
    pub handles: Vec<Handle>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DecryptionCreateResponse {
    pub request_id: Uuid,
    pub state: DecryptionState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DecryptionCommitRequest {
    pub clear_values: BTreeMap<Handle, u64>,
    pub proof_b64: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DecryptionCommitResponse {
    pub request_id: Uuid,
    /// False when the target had already been proven by an earlier commit.
    pub newly_committed: bool,
    pub values: Vec<ProvenValue>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DecryptionListResponse {
    pub requests: Vec<PendingDecryption>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ZkKeysResponse {
    pub curve: String,
    pub proof_system: String,
    pub key_commitment_hex: String,
    pub input_vk_b64: String,
    pub decryption_vk_b64: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EncryptRequest {
    pub value: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EncryptResponse {
    pub handle: Handle,
    pub ciphertext_hex: String,
    pub proof_b64: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_round_trips_through_hex() {
        let handle = Handle([0xab; 32]);
        let parsed: Handle = handle.to_string().parse().unwrap();
        assert_eq!(parsed, handle);

        assert!("abcd".parse::<Handle>().is_err());
        assert!("zz".repeat(32).parse::<Handle>().is_err());
    }

    #[test]
    fn handles_work_as_json_map_keys() {
        let mut values = BTreeMap::new();
        values.insert(Handle([1u8; 32]), 17u64);

        let json = serde_json::to_string(&values).unwrap();
        let back: BTreeMap<Handle, u64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn events_are_tagged() {
        let event = MarketEvent::Withdrawal { recipient: Principal::new("alice"), amount: 9 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "withdrawal");
        assert_eq!(json["recipient"], "alice");
    }
}
