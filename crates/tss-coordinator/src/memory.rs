//! In-memory collaborators for local simulation and tests

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::chain::{ChainClients, ChainDataProvider, EventStore, TxBuilder};
use crate::engine::{KeyshareHandle, KeyshareStore, TssEngine};
use crate::error::{CoordinatorError, Result};
use crate::message::{Message, MessageType};
use crate::transport::Transport;
use crate::types::{
    BlockHeight, EventStatus, OutboundTransfer, PeerId, ProtocolEvent, ProtocolType,
    SigningRequest, TssKey,
    Validator,
};

#[derive(Default)]
struct ChainState {
    height: BlockHeight,
    validators: Vec<Validator>,
    tss_key: Option<TssKey>,
    gas_prices: HashMap<String, u128>,
}

/// Validator chain plus destination chains, all in memory
#[derive(Default)]
pub struct MemoryChain {
    state: RwLock<ChainState>,
    builders: RwLock<HashMap<String, Arc<MemoryTxBuilder>>>,
    fail_validators: AtomicBool,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_height(&self, height: BlockHeight) {
        self.state.write().height = height;
    }

    pub fn set_validators(&self, validators: Vec<Validator>) {
        self.state.write().validators = validators;
    }

    pub fn set_tss_key(&self, key: Option<TssKey>) {
        self.state.write().tss_key = key;
    }

    pub fn set_gas_price(&self, chain: &str, price: u128) {
        self.state.write().gas_prices.insert(chain.to_string(), price);
    }

    /// Make validator queries fail until reset
    pub fn set_fail_validators(&self, fail: bool) {
        self.fail_validators.store(fail, Ordering::SeqCst);
    }

    /// Register a destination chain with its pending and finalized nonces
    pub fn add_chain(
        &self,
        chain: &str,
        gas_price: u128,
        pending: u64,
        finalized: u64,
    ) -> Arc<MemoryTxBuilder> {
        let builder = Arc::new(MemoryTxBuilder::new(chain, pending, finalized));
        self.builders.write().insert(chain.to_string(), Arc::clone(&builder));
        self.set_gas_price(chain, gas_price);
        builder
    }
}

#[async_trait]
impl ChainDataProvider for MemoryChain {
    async fn latest_block_height(&self) -> Result<BlockHeight> {
        Ok(self.state.read().height)
    }

    async fn all_validators(&self) -> Result<Vec<Validator>> {
        if self.fail_validators.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Chain("validator query failed".into()));
        }
        Ok(self.state.read().validators.clone())
    }

    async fn current_tss_key(&self) -> Result<Option<TssKey>> {
        Ok(self.state.read().tss_key.clone())
    }

    async fn gas_price(&self, chain: &str) -> Result<u128> {
        self.state
            .read()
            .gas_prices
            .get(chain)
            .copied()
            .ok_or_else(|| CoordinatorError::Chain(format!("no gas price for {}", chain)))
    }
}

impl ChainClients for MemoryChain {
    fn tx_builder(&self, chain: &str) -> Result<Arc<dyn TxBuilder>> {
        self.builders
            .read()
            .get(chain)
            .map(|b| Arc::clone(b) as Arc<dyn TxBuilder>)
            .ok_or_else(|| CoordinatorError::UnsupportedChain(chain.to_string()))
    }
}

/// Destination chain builder with settable nonces
pub struct MemoryTxBuilder {
    chain: String,
    pending: AtomicU64,
    finalized: AtomicU64,
    nonce_queries: Mutex<Vec<bool>>,
}

impl MemoryTxBuilder {
    pub fn new(chain: &str, pending: u64, finalized: u64) -> Self {
        Self {
            chain: chain.to_string(),
            pending: AtomicU64::new(pending),
            finalized: AtomicU64::new(finalized),
            nonce_queries: Mutex::new(Vec::new()),
        }
    }

    pub fn set_nonces(&self, pending: u64, finalized: u64) {
        self.pending.store(pending, Ordering::SeqCst);
        self.finalized.store(finalized, Ordering::SeqCst);
    }

    /// `use_finalized` flag of every nonce query so far
    pub fn nonce_queries(&self) -> Vec<bool> {
        self.nonce_queries.lock().clone()
    }
}

#[async_trait]
impl TxBuilder for MemoryTxBuilder {
    async fn outbound_signing_request(
        &self,
        transfer: &OutboundTransfer,
        gas_price: u128,
        nonce: u64,
    ) -> Result<SigningRequest> {
        let mut hasher = Sha256::new();
        hasher.update(self.chain.as_bytes());
        hasher.update(serde_json::to_vec(transfer)?);
        hasher.update(gas_price.to_be_bytes());
        hasher.update(nonce.to_be_bytes());

        Ok(SigningRequest {
            signing_hash: hasher.finalize().to_vec(),
            nonce,
            gas_price,
        })
    }

    async fn next_nonce(&self, _address: &str, use_finalized: bool) -> Result<u64> {
        self.nonce_queries.lock().push(use_finalized);
        Ok(if use_finalized {
            self.finalized.load(Ordering::SeqCst)
        } else {
            self.pending.load(Ordering::SeqCst)
        })
    }

    fn signer_address(&self, tss_public_key: &[u8]) -> Result<String> {
        if tss_public_key.is_empty() {
            return Err(CoordinatorError::Chain("empty TSS public key".into()));
        }
        let digest = Sha256::digest(tss_public_key);
        Ok(format!("0x{}", hex::encode(&digest[12..])))
    }
}

/// Event queue held in a vec, oldest first
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<ProtocolEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, event: ProtocolEvent) {
        self.events.lock().push(event);
    }

    pub fn set_status(&self, event_id: &str, status: EventStatus) -> bool {
        match self.events.lock().iter_mut().find(|e| e.event_id == event_id) {
            Some(event) => {
                event.status = status;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, event_id: &str) -> Option<ProtocolEvent> {
        self.events.lock().iter().find(|e| e.event_id == event_id).cloned()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn confirmed_events(
        &self,
        max_block_height: BlockHeight,
        limit: usize,
        min_age: u64,
    ) -> Result<Vec<ProtocolEvent>> {
        let mut events: Vec<ProtocolEvent> = self
            .events
            .lock()
            .iter()
            .filter(|e| e.status == EventStatus::Confirmed)
            .filter(|e| e.block_height.saturating_add(min_age) <= max_block_height)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.block_height);
        events.truncate(limit);
        Ok(events)
    }

    async fn in_flight_sign_events(&self) -> Result<Vec<ProtocolEvent>> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| e.protocol == ProtocolType::Sign && e.status.is_in_flight())
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryKeyshareStore {
    shares: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyshareStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key_id: &str, share: Vec<u8>) {
        self.shares.lock().insert(key_id.to_string(), share);
    }
}

#[async_trait]
impl KeyshareStore for MemoryKeyshareStore {
    async fn get(&self, key_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.shares.lock().get(key_id).cloned())
    }
}

/// One recorded engine call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Keygen {
        threshold: usize,
        participant_ids: Vec<u8>,
    },
    Sign {
        key_id: [u8; 32],
        signing_hash: Vec<u8>,
        participant_ids: Vec<u8>,
    },
    QuorumChange {
        handle: u64,
        threshold: usize,
        participant_ids: Vec<u8>,
        old_indices: Vec<u8>,
        new_indices: Vec<u8>,
    },
}

/// Engine producing deterministic setup bytes and tracking keyshare handles
#[derive(Default)]
pub struct MockEngine {
    calls: Mutex<Vec<EngineCall>>,
    live: Mutex<HashSet<u64>>,
    next_handle: AtomicU64,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    /// Keyshare handles loaded and not yet freed
    pub fn live_handles(&self) -> usize {
        self.live.lock().len()
    }

    fn setup_bytes(tag: &str, parts: &[&[u8]]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(tag.as_bytes());
        for part in parts {
            hasher.update(part);
        }
        let mut bytes = tag.as_bytes().to_vec();
        bytes.extend_from_slice(&hasher.finalize());
        bytes
    }
}

impl TssEngine for MockEngine {
    fn keygen_setup(&self, threshold: usize, participant_ids: &[u8]) -> Result<Vec<u8>> {
        if participant_ids.is_empty() {
            return Err(CoordinatorError::Engine("keygen needs participants".into()));
        }
        self.calls.lock().push(EngineCall::Keygen {
            threshold,
            participant_ids: participant_ids.to_vec(),
        });
        Ok(Self::setup_bytes("keygen", &[&threshold.to_be_bytes()[..], participant_ids]))
    }

    fn sign_setup(
        &self,
        key_id: &[u8; 32],
        signing_hash: &[u8],
        participant_ids: &[u8],
    ) -> Result<Vec<u8>> {
        self.calls.lock().push(EngineCall::Sign {
            key_id: *key_id,
            signing_hash: signing_hash.to_vec(),
            participant_ids: participant_ids.to_vec(),
        });
        Ok(Self::setup_bytes("sign", &[&key_id[..], signing_hash, participant_ids]))
    }

    fn quorum_change_setup(
        &self,
        old_keyshare: &KeyshareHandle,
        threshold: usize,
        participant_ids: &[u8],
        old_indices: &[u8],
        new_indices: &[u8],
    ) -> Result<Vec<u8>> {
        if !self.live.lock().contains(&old_keyshare.0) {
            return Err(CoordinatorError::Engine(format!(
                "keyshare handle {} not loaded",
                old_keyshare.0
            )));
        }
        self.calls.lock().push(EngineCall::QuorumChange {
            handle: old_keyshare.0,
            threshold,
            participant_ids: participant_ids.to_vec(),
            old_indices: old_indices.to_vec(),
            new_indices: new_indices.to_vec(),
        });
        Ok(Self::setup_bytes(
            "quorum_change",
            &[&threshold.to_be_bytes()[..], participant_ids, old_indices, new_indices],
        ))
    }

    fn load_keyshare(&self, keyshare: &[u8]) -> Result<KeyshareHandle> {
        if keyshare.is_empty() {
            return Err(CoordinatorError::Engine("empty keyshare".into()));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        self.live.lock().insert(handle);
        Ok(KeyshareHandle(handle))
    }

    fn free_keyshare(&self, handle: KeyshareHandle) {
        self.live.lock().remove(&handle.0);
    }
}

/// Transport that records every send and can drop peers
#[derive(Default)]
pub struct LoopbackTransport {
    sent: Mutex<Vec<(PeerId, Vec<u8>)>>,
    unreachable: Mutex<HashSet<PeerId>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every send to `peer_id`
    pub fn fail_peer(&self, peer_id: &str) {
        self.unreachable.lock().insert(peer_id.to_string());
    }

    pub fn heal_peer(&self, peer_id: &str) {
        self.unreachable.lock().remove(peer_id);
    }

    /// Decoded messages delivered so far, in send order
    pub fn sent(&self) -> Vec<(PeerId, Message)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|(peer, bytes)| Message::decode(bytes).ok().map(|m| (peer.clone(), m)))
            .collect()
    }

    pub fn sent_of_type(&self, message_type: MessageType) -> Vec<(PeerId, Message)> {
        self.sent()
            .into_iter()
            .filter(|(_, m)| m.message_type == message_type)
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, peer_id: &str, data: Vec<u8>) -> Result<()> {
        if self.unreachable.lock().contains(peer_id) {
            return Err(CoordinatorError::Transport {
                peer_id: peer_id.to_string(),
                reason: "peer unreachable".into(),
            });
        }
        self.sent.lock().push((peer_id.to_string(), data));
        Ok(())
    }
}
