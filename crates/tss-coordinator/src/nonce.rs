//! Per-chain nonce admission for outbound SIGN events
//!
//! Every poll tick opens a [`NonceTick`] over the in-flight counts at tick
//! start. The first event for a chain resolves a base nonce from the chain;
//! later events on the same chain count up locally until the per-chain cap.
//!
//! Chains with unconfirmed work wait up to `wait_threshold` ticks for it to
//! drain. After that the chain is treated as stuck and restarted from its
//! finalized nonce, ignoring the cap.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::chain::TxBuilder;
use crate::error::Result;
use crate::types::{OutboundTransfer, ProtocolEvent, ProtocolType};

/// Why an event got no nonce this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Chain still has unconfirmed transactions; `waits` consecutive ticks so far
    AwaitingConfirmations { waits: u32 },
    /// Chain already has `in_flight` unconfirmed transactions
    AtCapacity { in_flight: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Assigned(u64),
    Skipped(SkipReason),
}

/// Nonce carried by a SIGN setup that has gone out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceReservation {
    pub chain: String,
    pub nonce: u64,
}

/// Long-lived admission state: limits plus per-chain wait counters
pub struct NonceAdmission {
    per_chain_cap: usize,
    wait_threshold: u32,
    waits: Mutex<HashMap<String, u32>>,
}

impl NonceAdmission {
    pub fn new(per_chain_cap: usize, wait_threshold: u32) -> Self {
        Self {
            per_chain_cap,
            wait_threshold,
            waits: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_chain_cap(&self) -> usize {
        self.per_chain_cap
    }

    /// Consecutive ticks `chain` has been waiting
    pub fn wait_count(&self, chain: &str) -> u32 {
        self.waits.lock().get(chain).copied().unwrap_or(0)
    }

    /// Start a tick over the in-flight SIGN counts per chain
    ///
    /// Wait counters of chains with nothing in flight are dropped.
    pub fn begin_tick(&self, in_flight: HashMap<String, usize>) -> NonceTick<'_> {
        self.waits
            .lock()
            .retain(|chain, _| in_flight.get(chain).copied().unwrap_or(0) > 0);

        NonceTick {
            admission: self,
            in_flight,
            resolved: HashMap::new(),
            waiting: HashSet::new(),
        }
    }
}

#[derive(Debug)]
struct ChainSlot {
    next_nonce: u64,
    in_flight: usize,
}

/// Nonce assignment state for one poll tick
pub struct NonceTick<'a> {
    admission: &'a NonceAdmission,
    in_flight: HashMap<String, usize>,
    resolved: HashMap<String, ChainSlot>,
    waiting: HashSet<String>,
}

impl NonceTick<'_> {
    /// Admit one SIGN event targeting `chain` signed by `address`
    pub async fn admit(
        &mut self,
        chain: &str,
        builder: &dyn TxBuilder,
        address: &str,
    ) -> Result<Admission> {
        if self.waiting.contains(chain) {
            return Ok(Admission::Skipped(SkipReason::AwaitingConfirmations {
                waits: self.admission.wait_count(chain),
            }));
        }

        if let Some(slot) = self.resolved.get_mut(chain) {
            if slot.in_flight >= self.admission.per_chain_cap {
                debug!(chain = %chain, in_flight = slot.in_flight, "chain at capacity, skipping");
                return Ok(Admission::Skipped(SkipReason::AtCapacity {
                    in_flight: slot.in_flight,
                }));
            }
            let nonce = slot.next_nonce;
            slot.next_nonce += 1;
            slot.in_flight += 1;
            return Ok(Admission::Assigned(nonce));
        }

        let in_flight = self.in_flight.get(chain).copied().unwrap_or(0);

        let nonce = if in_flight == 0 {
            let nonce = builder.next_nonce(address, false).await?;
            self.admission.waits.lock().remove(chain);
            nonce
        } else {
            let waited = {
                let mut waits = self.admission.waits.lock();
                let count = waits.entry(chain.to_string()).or_insert(0);
                if *count < self.admission.wait_threshold {
                    *count += 1;
                    Some(*count)
                } else {
                    None
                }
            };

            if let Some(waits) = waited {
                debug!(chain = %chain, in_flight, waits, "chain has unconfirmed work, waiting");
                self.waiting.insert(chain.to_string());
                return Ok(Admission::Skipped(SkipReason::AwaitingConfirmations { waits }));
            }

            warn!(chain = %chain, in_flight, "nonce stream looks stuck, restarting from finalized");
            let nonce = builder.next_nonce(address, true).await?;
            self.admission.waits.lock().insert(chain.to_string(), 0);
            info!(chain = %chain, nonce, "recovered chain from finalized nonce");
            nonce
        };

        self.resolved.insert(
            chain.to_string(),
            ChainSlot {
                next_nonce: nonce + 1,
                in_flight: in_flight + 1,
            },
        );
        Ok(Admission::Assigned(nonce))
    }

    /// Give back `nonce` on `chain` after its event failed to set up
    ///
    /// Only the most recent assignment can be returned; anything else would
    /// leave a gap. Returns whether the nonce was released.
    pub fn release(&mut self, chain: &str, nonce: u64) -> bool {
        match self.resolved.get_mut(chain) {
            Some(slot) if slot.next_nonce == nonce + 1 => {
                slot.next_nonce = nonce;
                slot.in_flight = slot.in_flight.saturating_sub(1);
                debug!(chain = %chain, nonce, "released nonce");
                true
            }
            _ => false,
        }
    }
}

/// In-flight SIGN events grouped by destination chain
///
/// Events whose payload does not parse are left out.
pub fn count_in_flight_by_chain(events: &[ProtocolEvent]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();

    for event in events {
        if event.protocol != ProtocolType::Sign || !event.status.is_in_flight() {
            continue;
        }
        match OutboundTransfer::from_event_payload(&event.payload) {
            Ok(transfer) => *counts.entry(transfer.destination_chain).or_insert(0) += 1,
            Err(e) => {
                debug!(event_id = %event.event_id, error = %e, "skipping in-flight event payload")
            }
        }
    }

    counts
}

/// In-flight work per chain: stored in-flight SIGN events plus `reserved`
/// nonces of dispatched setups the store does not list as in flight yet
pub fn count_in_flight(
    stored: &[ProtocolEvent],
    reserved: &[(String, NonceReservation)],
) -> HashMap<String, usize> {
    let mut counts = count_in_flight_by_chain(stored);
    let stored_ids: HashSet<&str> = stored.iter().map(|e| e.event_id.as_str()).collect();

    for (event_id, reservation) in reserved {
        if stored_ids.contains(event_id.as_str()) {
            continue;
        }
        *counts.entry(reservation.chain.clone()).or_insert(0) += 1;
    }

    counts
}
