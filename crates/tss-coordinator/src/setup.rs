//! Protocol specific setup construction
//!
//! Produces the opaque engine setup for each protocol. Participant ids are
//! always handed to the engine sorted; quorum change indices refer to that
//! same order.

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::chain::{ChainDataProvider, TxBuilder};
use crate::engine::{encode_participant_ids, KeyshareStore, LoadedKeyshare, TssEngine};
use crate::error::{CoordinatorError, Result};
use crate::threshold::threshold;
use crate::types::{OutboundTransfer, PartyId, SigningRequest, TssKey, Validator, ValidatorStatus};

/// Engine setup plus the unsigned transaction it signs (SIGN only)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupPayload {
    pub bytes: Vec<u8>,
    pub signing_metadata: Option<SigningRequest>,
}

impl SetupPayload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            signing_metadata: None,
        }
    }
}

/// 32-byte engine key identifier: SHA-256 of the key id string
pub fn derive_key_id_bytes(key_id: &str) -> [u8; 32] {
    Sha256::digest(key_id.as_bytes()).into()
}

/// Old and new participant indices for a quorum change over `participants`
///
/// Both index the participant list sorted by address. Old indices are the
/// currently ACTIVE validators, new indices are every position.
pub fn quorum_change_indices(participants: &[Validator]) -> Result<(Vec<u8>, Vec<u8>)> {
    if participants.len() > usize::from(u8::MAX) + 1 {
        return Err(CoordinatorError::InvalidParticipants(format!(
            "{} participants exceed the engine index range",
            participants.len()
        )));
    }

    let mut sorted: Vec<&Validator> = participants.iter().collect();
    sorted.sort_by(|a, b| a.address.cmp(&b.address));

    let old_indices = sorted
        .iter()
        .enumerate()
        .filter(|(_, v)| v.status == ValidatorStatus::Active)
        .map(|(i, _)| i as u8)
        .collect();
    let new_indices = (0..sorted.len()).map(|i| i as u8).collect();

    Ok((old_indices, new_indices))
}

/// Builds engine setups against one engine and keyshare store
pub struct SetupBuilder<'a> {
    engine: &'a dyn TssEngine,
    keyshares: &'a dyn KeyshareStore,
}

impl<'a> SetupBuilder<'a> {
    pub fn new(engine: &'a dyn TssEngine, keyshares: &'a dyn KeyshareStore) -> Self {
        Self { engine, keyshares }
    }

    /// Fresh key setup, shared by KEYGEN and KEYREFRESH
    pub fn keygen(&self, participants: &[PartyId]) -> Result<SetupPayload> {
        let t = threshold(participants.len());
        let bytes = self.engine.keygen_setup(t, &encode_participant_ids(participants))?;
        debug!(participants = participants.len(), threshold = t, "built keygen setup");
        Ok(SetupPayload::new(bytes))
    }

    /// Move the current key to `participants`
    ///
    /// `old_quorum` is the size of the quorum holding the current key; the
    /// ACTIVE validators among `participants` must still meet its threshold.
    pub async fn quorum_change(
        &self,
        key: &TssKey,
        participants: &[Validator],
        old_quorum: usize,
    ) -> Result<SetupPayload> {
        let (old_indices, new_indices) = quorum_change_indices(participants)?;

        let needed = threshold(old_quorum);
        if old_indices.len() < needed {
            return Err(CoordinatorError::InvalidParticipants(format!(
                "{} continuing validators, quorum change needs {} of the old {}",
                old_indices.len(),
                needed,
                old_quorum
            )));
        }

        let share_bytes = self
            .keyshares
            .get(&key.key_id)
            .await?
            .ok_or_else(|| CoordinatorError::MissingKeyshare(key.key_id.clone()))?;
        let share = LoadedKeyshare::load(self.engine, &share_bytes)?;

        let ids: Vec<PartyId> = participants.iter().map(|v| v.address.clone()).collect();
        let t = threshold(ids.len());
        let bytes = self.engine.quorum_change_setup(
            share.handle(),
            t,
            &encode_participant_ids(&ids),
            &old_indices,
            &new_indices,
        )?;

        debug!(
            key_id = %key.key_id,
            old = old_indices.len(),
            new = new_indices.len(),
            threshold = t,
            "built quorum change setup"
        );
        Ok(SetupPayload::new(bytes))
    }

    /// Signing setup over an already built outbound transaction
    pub fn sign(
        &self,
        key: &TssKey,
        participants: &[PartyId],
        request: SigningRequest,
    ) -> Result<SetupPayload> {
        let key_id = derive_key_id_bytes(&key.key_id);
        let bytes = self
            .engine
            .sign_setup(&key_id, &request.signing_hash, &encode_participant_ids(participants))?;

        debug!(key_id = %key.key_id, nonce = request.nonce, "built sign setup");
        Ok(SetupPayload {
            bytes,
            signing_metadata: Some(request),
        })
    }
}

/// Build the unsigned outbound transaction at the oracle gas price
pub async fn prepare_signing_request(
    provider: &dyn ChainDataProvider,
    builder: &dyn TxBuilder,
    transfer: &OutboundTransfer,
    nonce: u64,
) -> Result<SigningRequest> {
    let gas_price = provider.gas_price(&transfer.destination_chain).await?;
    builder.outbound_signing_request(transfer, gas_price, nonce).await
}

/// Participant side check of a coordinator's signing request
///
/// The gas price must lie within `tolerance_percent` of our own oracle price,
/// and rebuilding the transaction with the coordinator's gas price and nonce
/// must give the same signing hash.
pub async fn verify_signing_request(
    builder: &dyn TxBuilder,
    transfer: &OutboundTransfer,
    oracle_gas_price: u128,
    metadata: &SigningRequest,
    tolerance_percent: u32,
) -> Result<()> {
    let tolerance = u128::from(tolerance_percent);
    let min = oracle_gas_price.saturating_mul(100u128.saturating_sub(tolerance)) / 100;
    let max = oracle_gas_price.saturating_mul(100 + tolerance) / 100;

    if metadata.gas_price < min || metadata.gas_price > max {
        return Err(CoordinatorError::GasPriceOutOfRange {
            got: metadata.gas_price,
            oracle: oracle_gas_price,
            min,
            max,
        });
    }

    let rebuilt = builder
        .outbound_signing_request(transfer, metadata.gas_price, metadata.nonce)
        .await?;

    if rebuilt.signing_hash != metadata.signing_hash {
        return Err(CoordinatorError::SigningHashMismatch {
            expected: hex::encode(&rebuilt.signing_hash),
            got: hex::encode(&metadata.signing_hash),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{EngineCall, MemoryChain, MemoryKeyshareStore, MockEngine};

    fn validator(address: &str, status: ValidatorStatus) -> Validator {
        Validator::new(address, format!("peer-{}", address), status)
    }

    fn key() -> TssKey {
        TssKey {
            key_id: "key-1".into(),
            public_key: vec![2; 33],
        }
    }

    fn transfer() -> OutboundTransfer {
        serde_json::from_value(serde_json::json!({
            "tx_id": "0xabc",
            "destination_chain": "eip155:1",
            "recipient": "0xdead",
            "amount": "1000",
            "gas_limit": "21000"
        }))
        .unwrap()
    }

    #[test]
    fn test_key_id_bytes_are_sha256() {
        let bytes = derive_key_id_bytes("key-1");
        assert_eq!(bytes, derive_key_id_bytes("key-1"));
        assert_ne!(bytes, derive_key_id_bytes("key-2"));
        assert_eq!(
            hex::encode(derive_key_id_bytes("")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_quorum_change_indices_follow_sorted_order() {
        let participants = vec![
            validator("d", ValidatorStatus::PendingJoin),
            validator("a", ValidatorStatus::Active),
            validator("c", ValidatorStatus::Active),
            validator("b", ValidatorStatus::PendingJoin),
        ];

        let (old, new) = quorum_change_indices(&participants).unwrap();
        // sorted: a b c d
        assert_eq!(old, vec![0, 2]);
        assert_eq!(new, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_keygen_setup_uses_threshold() {
        let engine = MockEngine::new();
        let store = MemoryKeyshareStore::new();
        let builder = SetupBuilder::new(&engine, &store);

        let parties: Vec<PartyId> =
            ["c", "a", "b", "e", "d"].iter().map(|s| s.to_string()).collect();
        let setup = builder.keygen(&parties).unwrap();
        assert!(setup.signing_metadata.is_none());
        assert!(!setup.bytes.is_empty());

        assert_eq!(
            engine.calls(),
            vec![EngineCall::Keygen {
                threshold: 4,
                participant_ids: b"a\0b\0c\0d\0e".to_vec(),
            }]
        );
    }

    #[tokio::test]
    async fn test_quorum_change_frees_keyshare() {
        let engine = MockEngine::new();
        let store = MemoryKeyshareStore::new();
        store.insert("key-1", vec![7; 16]);
        let builder = SetupBuilder::new(&engine, &store);

        let participants = vec![
            validator("a", ValidatorStatus::Active),
            validator("b", ValidatorStatus::Active),
            validator("c", ValidatorStatus::Active),
            validator("d", ValidatorStatus::PendingJoin),
        ];

        builder.quorum_change(&key(), &participants, 3).await.unwrap();
        assert_eq!(engine.live_handles(), 0);

        match &engine.calls()[0] {
            EngineCall::QuorumChange {
                threshold,
                old_indices,
                new_indices,
                ..
            } => {
                assert_eq!(*threshold, 3);
                assert_eq!(old_indices, &vec![0, 1, 2]);
                assert_eq!(new_indices, &vec![0, 1, 2, 3]);
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_quorum_change_missing_keyshare() {
        let engine = MockEngine::new();
        let store = MemoryKeyshareStore::new();
        let builder = SetupBuilder::new(&engine, &store);

        let participants = vec![validator("a", ValidatorStatus::Active)];
        let err = builder.quorum_change(&key(), &participants, 1).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::MissingKeyshare(k) if k == "key-1"));
    }

    #[tokio::test]
    async fn test_quorum_change_needs_old_quorum() {
        let engine = MockEngine::new();
        let store = MemoryKeyshareStore::new();
        store.insert("key-1", vec![7; 16]);
        let builder = SetupBuilder::new(&engine, &store);

        let participants = vec![
            validator("a", ValidatorStatus::Active),
            validator("d", ValidatorStatus::PendingJoin),
            validator("e", ValidatorStatus::PendingJoin),
        ];

        // one continuing validator out of an old quorum of four
        let err = builder.quorum_change(&key(), &participants, 4).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidParticipants(_)));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sign_setup_carries_request() {
        let engine = MockEngine::new();
        let store = MemoryKeyshareStore::new();
        let chain = MemoryChain::new();
        let tx_builder = chain.add_chain("eip155:1", 1_000, 5, 5);

        let request = prepare_signing_request(&chain, tx_builder.as_ref(), &transfer(), 5)
            .await
            .unwrap();
        assert_eq!(request.gas_price, 1_000);
        assert_eq!(request.nonce, 5);

        let parties: Vec<PartyId> = vec!["b".into(), "a".into()];
        let setup = SetupBuilder::new(&engine, &store)
            .sign(&key(), &parties, request.clone())
            .unwrap();
        assert_eq!(setup.signing_metadata, Some(request.clone()));

        assert_eq!(
            engine.calls(),
            vec![EngineCall::Sign {
                key_id: derive_key_id_bytes("key-1"),
                signing_hash: request.signing_hash,
                participant_ids: b"a\0b".to_vec(),
            }]
        );
    }

    #[tokio::test]
    async fn test_verify_signing_request() {
        let chain = MemoryChain::new();
        let builder = chain.add_chain("eip155:1", 1_000, 0, 0);
        let transfer = transfer();

        let request = builder.outbound_signing_request(&transfer, 1_050, 9).await.unwrap();
        verify_signing_request(builder.as_ref(), &transfer, 1_000, &request, 10)
            .await
            .unwrap();

        // oracle moved too far
        let err = verify_signing_request(builder.as_ref(), &transfer, 900, &request, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::GasPriceOutOfRange { min: 810, max: 990, .. }));

        // coordinator lied about the hash
        let mut forged = request.clone();
        forged.signing_hash[0] ^= 0xff;
        let err = verify_signing_request(builder.as_ref(), &transfer, 1_000, &forged, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::SigningHashMismatch { .. }));
    }
}
