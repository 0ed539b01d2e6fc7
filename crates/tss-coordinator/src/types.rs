//! Validator, event and signing request types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoordinatorError, Result};

/// Party identifier inside a protocol run (the validator address)
pub type PartyId = String;

/// Network peer identifier
pub type PeerId = String;

/// Block height on the validator chain
pub type BlockHeight = u64;

/// Lifecycle status of a validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidatorStatus {
    Active,
    PendingJoin,
    PendingLeave,
    Inactive,
}

/// Validator as seen by the registry cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// Party identifier (unique)
    pub address: PartyId,
    /// Network identity used by the transport
    pub peer_id: PeerId,
    /// Advertised listen addresses
    #[serde(default)]
    pub multiaddrs: Vec<String>,
    pub status: ValidatorStatus,
}

impl Validator {
    pub fn new(
        address: impl Into<String>,
        peer_id: impl Into<String>,
        status: ValidatorStatus,
    ) -> Self {
        Self {
            address: address.into(),
            peer_id: peer_id.into(),
            multiaddrs: Vec::new(),
            status,
        }
    }

    pub fn with_multiaddrs(mut self, multiaddrs: Vec<String>) -> Self {
        self.multiaddrs = multiaddrs;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == ValidatorStatus::Active
    }
}

/// Threshold protocol driven by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolType {
    Keygen,
    Keyrefresh,
    QuorumChange,
    Sign,
}

impl ProtocolType {
    pub const ALL: [ProtocolType; 4] = [
        ProtocolType::Keygen,
        ProtocolType::Keyrefresh,
        ProtocolType::QuorumChange,
        ProtocolType::Sign,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::Keygen => "KEYGEN",
            ProtocolType::Keyrefresh => "KEYREFRESH",
            ProtocolType::QuorumChange => "QUORUM_CHANGE",
            ProtocolType::Sign => "SIGN",
        }
    }

    /// Protocols that rewrite key material need every eligible validator
    pub fn requires_all_eligible(&self) -> bool {
        !matches!(self, ProtocolType::Sign)
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolType {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "KEYGEN" => Ok(ProtocolType::Keygen),
            "KEYREFRESH" => Ok(ProtocolType::Keyrefresh),
            "QUORUM_CHANGE" => Ok(ProtocolType::QuorumChange),
            "SIGN" => Ok(ProtocolType::Sign),
            other => Err(CoordinatorError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Lifecycle status of a protocol event
///
/// Transitions after `Confirmed` belong to downstream components; the
/// coordinator only reads them to count in-flight SIGN events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Confirmed,
    InProgress,
    Signed,
    Broadcasted,
    Finalized,
    Reverted,
}

impl EventStatus {
    /// Nonce assigned, outbound transaction not yet confirmed
    pub fn is_in_flight(&self) -> bool {
        matches!(self, EventStatus::InProgress | EventStatus::Signed)
    }
}

/// Confirmed action that needs a threshold protocol run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolEvent {
    pub event_id: String,
    pub protocol: ProtocolType,
    pub block_height: BlockHeight,
    /// Protocol specific; an [`OutboundTransfer`] for SIGN
    #[serde(default)]
    pub payload: Vec<u8>,
    pub status: EventStatus,
}

impl ProtocolEvent {
    pub fn new(
        event_id: impl Into<String>,
        protocol: ProtocolType,
        block_height: BlockHeight,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            protocol,
            block_height,
            payload,
            status: EventStatus::Confirmed,
        }
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }
}

/// Current TSS key as registered on chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TssKey {
    pub key_id: String,
    pub public_key: Vec<u8>,
}

/// Outbound transfer carried by a SIGN event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundTransfer {
    #[serde(default)]
    pub tx_id: String,
    #[serde(default)]
    pub destination_chain: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub asset_addr: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub gas_limit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_type: Option<String>,
}

impl OutboundTransfer {
    /// Parse and sanity check a SIGN event payload
    pub fn from_event_payload(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(CoordinatorError::InvalidPayload("empty event payload".into()));
        }

        let transfer: OutboundTransfer = serde_json::from_slice(bytes).map_err(|e| {
            CoordinatorError::InvalidPayload(format!("failed to decode outbound transfer: {}", e))
        })?;

        if transfer.tx_id.is_empty() {
            return Err(CoordinatorError::InvalidPayload(
                "outbound transfer is missing tx_id".into(),
            ));
        }
        if transfer.destination_chain.is_empty() {
            return Err(CoordinatorError::InvalidPayload(
                "outbound transfer is missing destination_chain".into(),
            ));
        }

        Ok(transfer)
    }
}

/// Unsigned outbound transaction as built by the coordinator
///
/// Attached to the SIGN setup message so every participant can rebuild the
/// transaction and compare signing hashes before contributing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequest {
    #[serde(with = "hex::serde")]
    pub signing_hash: Vec<u8>,
    pub nonce: u64,
    pub gas_price: u128,
}
