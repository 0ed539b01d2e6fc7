//! Setup -> ack -> begin rendezvous
//!
//! One [`AckState`] per event the coordinator has sent a setup for. ACKs are
//! recorded concurrently from message delivery; the ACK that completes the set
//! closes the handshake and hands the participant list back so the caller can
//! send begin exactly once.
//!
//! Closed handshakes are remembered until the event leaves the confirmed
//! queue or the memo expires, so a slow store never causes a second setup.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CoordinatorError, Result};
use crate::nonce::NonceReservation;
use crate::types::{PartyId, PeerId};

/// Handshake progress for one event
#[derive(Debug, Clone)]
pub struct AckState {
    pub participants: Vec<PartyId>,
    pub acked_by: HashSet<PeerId>,
    pub ack_count: usize,
    /// Nonce the setup carries, SIGN only
    pub reservation: Option<NonceReservation>,
}

impl AckState {
    fn new(participants: Vec<PartyId>, reservation: Option<NonceReservation>) -> Self {
        Self {
            participants,
            acked_by: HashSet::new(),
            ack_count: 0,
            reservation,
        }
    }
}

#[derive(Debug)]
struct CompletedHandshake {
    completed_at: Instant,
    reservation: Option<NonceReservation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// No handshake for this event
    Ignored,
    /// Sender already acked
    Duplicate,
    Recorded { acked: usize, expected: usize },
    /// Last ACK arrived; the handshake is closed and begin is due
    Completed { participants: Vec<PartyId> },
}

#[derive(Default)]
struct Handshakes {
    open: HashMap<String, AckState>,
    completed: HashMap<String, CompletedHandshake>,
}

/// In-memory ACK bookkeeping, keyed by event id
#[derive(Default)]
pub struct AckTracker {
    inner: Mutex<Handshakes>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a handshake; false if one is open or recently completed for `event_id`
    pub fn begin(
        &self,
        event_id: &str,
        participants: Vec<PartyId>,
        reservation: Option<NonceReservation>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.open.contains_key(event_id) || inner.completed.contains_key(event_id) {
            return false;
        }
        inner
            .open
            .insert(event_id.to_string(), AckState::new(participants, reservation));
        true
    }

    /// Whether `event_id` has an open handshake
    pub fn contains(&self, event_id: &str) -> bool {
        self.inner.lock().open.contains_key(event_id)
    }

    /// Whether `event_id` completed its handshake and is still remembered
    pub fn is_completed(&self, event_id: &str) -> bool {
        self.inner.lock().completed.contains_key(event_id)
    }

    pub fn ack_count(&self, event_id: &str) -> Option<usize> {
        self.inner.lock().open.get(event_id).map(|s| s.ack_count)
    }

    /// Event ids with an open handshake
    pub fn pending(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().open.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop an open handshake without sending begin
    pub fn abandon(&self, event_id: &str) -> bool {
        self.inner.lock().open.remove(event_id).is_some()
    }

    /// Nonces held by open and remembered handshakes, by event id
    pub fn reservations(&self) -> Vec<(String, NonceReservation)> {
        let inner = self.inner.lock();
        let open = inner
            .open
            .iter()
            .filter_map(|(id, state)| state.reservation.clone().map(|r| (id.clone(), r)));
        let completed = inner
            .completed
            .iter()
            .filter_map(|(id, done)| done.reservation.clone().map(|r| (id.clone(), r)));
        open.chain(completed).collect()
    }

    /// Forget completed handshakes older than `ttl`; returns how many
    pub fn expire_completed(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.completed.len();
        inner
            .completed
            .retain(|_, done| now.duration_since(done.completed_at) < ttl);
        before - inner.completed.len()
    }

    /// Keep only the completed handshakes for which `keep` holds
    pub fn retain_completed(&self, mut keep: impl FnMut(&str) -> bool) {
        self.inner.lock().completed.retain(|id, _| keep(id.as_str()));
    }

    /// Record an ACK from `sender_peer`, resolved to `sender_party`
    ///
    /// A sender that is unknown or not a participant is rejected without
    /// touching the state.
    pub fn record_ack(
        &self,
        event_id: &str,
        sender_peer: &str,
        sender_party: Option<&str>,
    ) -> Result<AckOutcome> {
        let mut inner = self.inner.lock();

        let Some(state) = inner.open.get_mut(event_id) else {
            debug!(event_id = %event_id, peer_id = %sender_peer, "ack for unknown event, ignoring");
            return Ok(AckOutcome::Ignored);
        };

        let is_participant = sender_party
            .map(|party| state.participants.iter().any(|p| p == party))
            .unwrap_or(false);
        if !is_participant {
            warn!(event_id = %event_id, peer_id = %sender_peer, "ack from non-participant");
            return Err(CoordinatorError::NotParticipant {
                peer_id: sender_peer.to_string(),
                event_id: event_id.to_string(),
            });
        }

        if !state.acked_by.insert(sender_peer.to_string()) {
            debug!(event_id = %event_id, peer_id = %sender_peer, "duplicate ack ignored");
            return Ok(AckOutcome::Duplicate);
        }
        state.ack_count += 1;

        let expected = state.participants.len();
        if state.ack_count < expected {
            debug!(event_id = %event_id, acked = state.ack_count, expected, "ack recorded");
            return Ok(AckOutcome::Recorded {
                acked: state.ack_count,
                expected,
            });
        }

        let Some(state) = inner.open.remove(event_id) else {
            return Ok(AckOutcome::Ignored);
        };
        inner.completed.insert(
            event_id.to_string(),
            CompletedHandshake {
                completed_at: Instant::now(),
                reservation: state.reservation,
            },
        );
        Ok(AckOutcome::Completed {
            participants: state.participants,
        })
    }
}
