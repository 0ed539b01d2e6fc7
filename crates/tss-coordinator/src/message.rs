//! Handshake wire messages
//!
//! JSON envelope, byte fields hex encoded:
//!
//! ```text
//! {"type":"setup","event_id":"..","payload":"0a0b..","participants":["a","b"],
//!  "signing_metadata":{"signing_hash":"..","nonce":7,"gas_price":1000}}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{PartyId, SigningRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Coordinator -> participants: engine setup payload
    Setup,
    /// Participant -> coordinator: setup received
    Ack,
    /// Coordinator -> participants: everyone acked, start the rounds
    Begin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub event_id: String,
    #[serde(default, with = "hex::serde")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub participants: Vec<PartyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_metadata: Option<SigningRequest>,
}

impl Message {
    pub fn setup(
        event_id: impl Into<String>,
        payload: Vec<u8>,
        participants: Vec<PartyId>,
        signing_metadata: Option<SigningRequest>,
    ) -> Self {
        Self {
            message_type: MessageType::Setup,
            event_id: event_id.into(),
            payload,
            participants,
            signing_metadata,
        }
    }

    pub fn ack(event_id: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Ack,
            event_id: event_id.into(),
            payload: Vec::new(),
            participants: Vec::new(),
            signing_metadata: None,
        }
    }

    /// Begin carries the participant list and no payload
    pub fn begin(event_id: impl Into<String>, participants: Vec<PartyId>) -> Self {
        Self {
            message_type: MessageType::Begin,
            event_id: event_id.into(),
            payload: Vec::new(),
            participants,
            signing_metadata: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_wire_format() {
        let msg = Message::setup(
            "evt-1",
            vec![0xde, 0xad],
            vec!["a".into(), "b".into()],
            Some(SigningRequest {
                signing_hash: vec![0xff; 2],
                nonce: 7,
                gas_price: 1000,
            }),
        );

        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "setup");
        assert_eq!(json["event_id"], "evt-1");
        assert_eq!(json["payload"], "dead");
        assert_eq!(json["participants"][1], "b");
        assert_eq!(json["signing_metadata"]["signing_hash"], "ffff");
        assert_eq!(json["signing_metadata"]["nonce"], 7);

        assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_ack_omits_metadata() {
        let bytes = Message::ack("evt-9").encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["type"], "ack");
        assert!(json.get("signing_metadata").is_none());
    }

    #[test]
    fn test_decode_minimal_begin() {
        let raw = br#"{"type":"begin","event_id":"e","participants":["x"]}"#;
        let msg = Message::decode(raw).unwrap();
        assert_eq!(msg.message_type, MessageType::Begin);
        assert!(msg.payload.is_empty());
        assert_eq!(msg.participants, vec!["x".to_string()]);
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert!(Message::decode(br#"{"type":"abort","event_id":"e"}"#).is_err());
    }
}
