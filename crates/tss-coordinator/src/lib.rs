//! TSS Coordinator - threshold protocol orchestration for a rotating validator set
//!
//! One validator per block epoch coordinates keygen, key refresh, quorum
//! change and signing runs. It picks the participants, builds the engine
//! setup, and holds the cryptographic rounds back until every participant
//! has acknowledged the same setup.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          POLL TICK (10s)                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  refresh validator cache ──► coordinator for epoch == me?        │
//! │                                        │ yes                     │
//! │                                        ▼                         │
//! │  confirmed events ──► eligibility ──► setup builder ──► engine   │
//! │                            │               │                     │
//! │                   threshold subset   nonce admission (SIGN)      │
//! └────────────────────────────────────────┬─────────────────────────┘
//!                                          │ setup
//!                                          ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         PARTICIPANTS                             │
//! │   ack ──► AckTracker ──► all acked? ──► begin ──► engine rounds  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quorum
//!
//! - Coordinator rotates over ACTIVE validators every `coordinator_range` blocks
//! - KEYGEN / KEYREFRESH / QUORUM_CHANGE need every eligible validator
//! - SIGN uses a random subset of `2n/3 + 1` eligible validators
//!
//! All collaborators (chain, event store, keyshare store, engine, transport)
//! are traits; [`memory`] provides in-memory versions for local runs.

pub mod chain;
pub mod config;
pub mod coordinator;
pub mod eligibility;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod memory;
pub mod message;
pub mod nonce;
pub mod registry;
pub mod setup;
pub mod threshold;
pub mod transport;
pub mod types;

pub use chain::{ChainClients, ChainDataProvider, EventStore, TxBuilder};
pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{Collaborators, Coordinator, PollSummary};
pub use eligibility::{
    eligible_validators, is_eligible, select_participants, validate_participants,
};
pub use engine::{KeyshareHandle, KeyshareStore, LoadedKeyshare, TssEngine};
pub use error::{CoordinatorError, Result};
pub use handshake::{AckOutcome, AckState, AckTracker};
pub use message::{Message, MessageType};
pub use nonce::{Admission, NonceAdmission, NonceReservation, NonceTick, SkipReason};
pub use registry::{coordinator_for, ValidatorCache};
pub use setup::{derive_key_id_bytes, verify_signing_request, SetupBuilder, SetupPayload};
pub use threshold::{select_random_threshold, threshold};
pub use transport::Transport;
pub use types::*;

/// Poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

/// Blocks per coordinator epoch
pub const DEFAULT_COORDINATOR_RANGE: u64 = 100;

/// Max unconfirmed SIGN transactions per destination chain
pub const PER_CHAIN_CAP: usize = 16;

/// Completed handshakes are remembered this long (30 polls at the default interval)
pub const DEFAULT_COMPLETED_HANDSHAKE_TTL_MS: u64 = 300_000;

/// Ticks a busy chain waits before nonce recovery (~200s at 10s polls)
pub const CONSECUTIVE_WAIT_THRESHOLD: u32 = 20;
