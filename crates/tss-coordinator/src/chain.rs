//! Chain-facing collaborators: validator chain data, event queue, outbound tx builders
//!
//! Implementations enforce their own timeouts; the coordinator treats every
//! call as fail-fast.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{BlockHeight, OutboundTransfer, ProtocolEvent, SigningRequest, TssKey, Validator};

/// Read access to the validator chain
#[async_trait]
pub trait ChainDataProvider: Send + Sync {
    /// Latest committed block height
    async fn latest_block_height(&self) -> Result<BlockHeight>;

    /// Full validator set with network identities and statuses
    async fn all_validators(&self) -> Result<Vec<Validator>>;

    /// Current TSS key, `None` before the first keygen lands
    async fn current_tss_key(&self) -> Result<Option<TssKey>>;

    /// Oracle gas price for a destination chain
    async fn gas_price(&self, chain: &str) -> Result<u128>;
}

/// Queue of confirmed protocol events
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Confirmed events at least `min_age` blocks older than `max_block_height`,
    /// oldest first, at most `limit`
    async fn confirmed_events(
        &self,
        max_block_height: BlockHeight,
        limit: usize,
        min_age: u64,
    ) -> Result<Vec<ProtocolEvent>>;

    /// SIGN events whose nonce is assigned but not yet confirmed
    async fn in_flight_sign_events(&self) -> Result<Vec<ProtocolEvent>>;
}

/// Builds outbound transactions for one destination chain
#[async_trait]
pub trait TxBuilder: Send + Sync {
    /// Unsigned transaction and its signing hash
    async fn outbound_signing_request(
        &self,
        transfer: &OutboundTransfer,
        gas_price: u128,
        nonce: u64,
    ) -> Result<SigningRequest>;

    /// Next nonce for `address`; `use_finalized` reads the finalized state
    /// instead of the pending pool
    async fn next_nonce(&self, address: &str, use_finalized: bool) -> Result<u64>;

    /// Chain specific address controlled by the TSS key
    fn signer_address(&self, tss_public_key: &[u8]) -> Result<String>;
}

/// Lookup of per-chain transaction builders
pub trait ChainClients: Send + Sync {
    fn tx_builder(&self, chain: &str) -> Result<Arc<dyn TxBuilder>>;
}
