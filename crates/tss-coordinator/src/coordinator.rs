//! Poll loop driving coordinator election, setup dispatch and the ACK handshake
//!
//! Each tick:
//! 1. refresh the validator cache
//! 2. stop unless this node coordinates the current epoch
//! 3. fetch confirmed events and build a setup for each one
//! 4. register the handshake and send setup to every participant
//!
//! ACKs arrive through [`Coordinator::handle_ack`], concurrently with the loop.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::chain::{ChainClients, ChainDataProvider, EventStore};
use crate::config::CoordinatorConfig;
use crate::eligibility::{eligible_validators, select_participants};
use crate::engine::{KeyshareStore, TssEngine};
use crate::error::{CoordinatorError, Result};
use crate::handshake::{AckOutcome, AckTracker};
use crate::message::Message;
use crate::nonce::{count_in_flight, Admission, NonceAdmission, NonceReservation, NonceTick};
use crate::registry::{coordinator_for, ValidatorCache};
use crate::setup::{prepare_signing_request, SetupBuilder, SetupPayload};
use crate::transport::{broadcast, Transport};
use crate::types::{
    OutboundTransfer, PartyId, PeerId, ProtocolEvent, ProtocolType, TssKey, Validator,
};

/// External services the coordinator drives
#[derive(Clone)]
pub struct Collaborators {
    pub chain: Arc<dyn ChainDataProvider>,
    pub events: Arc<dyn EventStore>,
    pub keyshares: Arc<dyn KeyshareStore>,
    pub clients: Arc<dyn ChainClients>,
    pub engine: Arc<dyn TssEngine>,
    pub transport: Arc<dyn Transport>,
}

/// What one poll tick did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub height: u64,
    /// Whether this node coordinated the tick
    pub coordinator: bool,
    pub setups_sent: usize,
    /// Events left for a later tick (nonce backpressure, no key yet)
    pub deferred: usize,
    /// Events with an open handshake
    pub awaiting_acks: usize,
    /// Events whose handshake completed but the store still lists as confirmed
    pub already_begun: usize,
    pub failed: usize,
}

enum EventOutcome {
    SetupSent,
    Deferred,
}

/// TSS coordinator for one validator node
pub struct Coordinator {
    config: CoordinatorConfig,
    deps: Collaborators,
    cache: ValidatorCache,
    acks: AckTracker,
    nonces: NonceAdmission,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, deps: Collaborators) -> Self {
        let nonces = NonceAdmission::new(config.per_chain_cap, config.consecutive_wait_threshold);
        Self {
            config,
            deps,
            cache: ValidatorCache::new(),
            acks: AckTracker::new(),
            nonces,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.cache.is_running()
    }

    /// Spawn the poll loop; `None` if it is already running
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let (stop_tx, stop_rx) = oneshot::channel();
        if !self.cache.mark_running(stop_tx) {
            debug!("coordinator already running");
            return None;
        }

        info!(
            party_id = %self.config.party_id,
            poll_interval_ms = self.config.poll_interval_ms,
            coordinator_range = self.config.coordinator_range,
            "starting TSS coordinator"
        );
        Some(tokio::spawn(Arc::clone(self).run(stop_rx)))
    }

    /// Signal the poll loop to exit; a no-op when not running
    pub fn stop(&self) {
        if let Some(stop_tx) = self.cache.mark_stopped() {
            let _ = stop_tx.send(());
            info!(party_id = %self.config.party_id, "stopping TSS coordinator");
        }
    }

    async fn run(self: Arc<Self>, mut stop_rx: oneshot::Receiver<()>) {
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(summary) if summary.coordinator => {
                            debug!(?summary, "poll tick done")
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "poll tick failed"),
                    }
                }
            }
        }

        debug!("coordinator loop exited");
    }

    /// Refresh the validator cache from the chain
    pub async fn refresh_validators(&self) -> bool {
        self.cache.refresh(self.deps.chain.as_ref()).await
    }

    /// Run one poll tick
    pub async fn poll_once(&self) -> Result<PollSummary> {
        self.refresh_validators().await;

        let height = self.deps.chain.latest_block_height().await?;
        let mut summary = PollSummary {
            height,
            ..Default::default()
        };

        let validators = self.cache.snapshot();
        match coordinator_for(&validators, self.config.coordinator_range, height) {
            Some(coordinator) if coordinator == self.config.party_id => summary.coordinator = true,
            Some(coordinator) => {
                debug!(height, coordinator = %coordinator, "not coordinator for this epoch");
                return Ok(summary);
            }
            None => {
                debug!(height, "no validators cached, nothing to coordinate");
                return Ok(summary);
            }
        }

        let expired = self.acks.expire_completed(self.config.completed_handshake_ttl());
        if expired > 0 {
            debug!(expired, "forgot expired completed handshakes");
        }

        let limit = self.config.event_batch_limit;
        let events = self
            .deps
            .events
            .confirmed_events(height, limit, self.config.min_event_age_blocks)
            .await?;

        // a short batch is the whole queue; anything missing has moved on
        if events.len() < limit {
            let confirmed: HashSet<&str> = events.iter().map(|e| e.event_id.as_str()).collect();
            self.acks.retain_completed(|id| confirmed.contains(id));
        }
        if events.is_empty() {
            return Ok(summary);
        }

        let mut tick = if events.iter().any(|e| e.protocol == ProtocolType::Sign) {
            match self.deps.events.in_flight_sign_events().await {
                Ok(stored) => {
                    let in_flight = count_in_flight(&stored, &self.acks.reservations());
                    Some(self.nonces.begin_tick(in_flight))
                }
                Err(e) => {
                    warn!(error = %e, "failed to count in-flight sign events, deferring them");
                    None
                }
            }
        } else {
            None
        };

        for event in &events {
            if self.acks.contains(&event.event_id) {
                summary.awaiting_acks += 1;
                continue;
            }
            if self.acks.is_completed(&event.event_id) {
                debug!(event_id = %event.event_id, "handshake already completed, skipping");
                summary.already_begun += 1;
                continue;
            }

            match self.process_event(event, &validators, tick.as_mut()).await {
                Ok(EventOutcome::SetupSent) => summary.setups_sent += 1,
                Ok(EventOutcome::Deferred) => summary.deferred += 1,
                Err(CoordinatorError::MissingKey) => {
                    debug!(
                        event_id = %event.event_id,
                        protocol = %event.protocol,
                        "no TSS key yet, deferring"
                    );
                    summary.deferred += 1;
                }
                Err(e) => {
                    warn!(
                        event_id = %event.event_id,
                        protocol = %event.protocol,
                        error = %e,
                        "failed to process event"
                    );
                    summary.failed += 1;
                }
            }
        }

        if summary.setups_sent > 0 {
            info!(
                height,
                setups_sent = summary.setups_sent,
                deferred = summary.deferred,
                failed = summary.failed,
                "dispatched protocol setups"
            );
        }
        Ok(summary)
    }

    #[instrument(skip_all, fields(event_id = %event.event_id, protocol = %event.protocol))]
    async fn process_event(
        &self,
        event: &ProtocolEvent,
        validators: &[Validator],
        tick: Option<&mut NonceTick<'_>>,
    ) -> Result<EventOutcome> {
        let participants = select_participants(event.protocol, validators);
        if participants.is_empty() {
            return Err(CoordinatorError::InvalidParticipants(format!(
                "no eligible validators for {}",
                event.protocol
            )));
        }
        let party_ids: Vec<PartyId> = participants.iter().map(|v| v.address.clone()).collect();
        let builder = SetupBuilder::new(self.deps.engine.as_ref(), self.deps.keyshares.as_ref());

        match event.protocol {
            ProtocolType::Keygen | ProtocolType::Keyrefresh => {
                let setup = builder.keygen(&party_ids)?;
                self.dispatch_setup(event, &participants, setup, None).await?;
            }
            ProtocolType::QuorumChange => {
                let key = self.current_key().await?;
                let old_quorum = eligible_validators(ProtocolType::Keyrefresh, validators).len();
                let setup = builder.quorum_change(&key, &participants, old_quorum).await?;
                self.dispatch_setup(event, &participants, setup, None).await?;
            }
            ProtocolType::Sign => {
                let Some(tick) = tick else {
                    return Ok(EventOutcome::Deferred);
                };
                return self
                    .process_sign(event, &builder, &participants, &party_ids, tick)
                    .await;
            }
        }

        Ok(EventOutcome::SetupSent)
    }

    async fn process_sign(
        &self,
        event: &ProtocolEvent,
        builder: &SetupBuilder<'_>,
        participants: &[Validator],
        party_ids: &[PartyId],
        tick: &mut NonceTick<'_>,
    ) -> Result<EventOutcome> {
        let transfer = OutboundTransfer::from_event_payload(&event.payload)?;
        let key = self.current_key().await?;
        let chain = transfer.destination_chain.as_str();
        let tx_builder = self.deps.clients.tx_builder(chain)?;
        let signer = tx_builder.signer_address(&key.public_key)?;

        let nonce = match tick.admit(chain, tx_builder.as_ref(), &signer).await? {
            Admission::Assigned(nonce) => nonce,
            Admission::Skipped(reason) => {
                debug!(chain = %chain, ?reason, "no nonce this tick");
                return Ok(EventOutcome::Deferred);
            }
        };

        let dispatched = async {
            let request = prepare_signing_request(
                self.deps.chain.as_ref(),
                tx_builder.as_ref(),
                &transfer,
                nonce,
            )
            .await?;
            let setup = builder.sign(&key, party_ids, request)?;
            let reservation = NonceReservation {
                chain: chain.to_string(),
                nonce,
            };
            self.dispatch_setup(event, participants, setup, Some(reservation)).await
        }
        .await;

        match dispatched {
            Ok(()) => {
                info!(chain = %chain, nonce, tx_id = %transfer.tx_id, "assigned nonce");
                Ok(EventOutcome::SetupSent)
            }
            Err(e) => {
                tick.release(chain, nonce);
                Err(e)
            }
        }
    }

    async fn current_key(&self) -> Result<TssKey> {
        self.deps.chain.current_tss_key().await?.ok_or(CoordinatorError::MissingKey)
    }

    /// Open the handshake and send setup to every participant
    async fn dispatch_setup(
        &self,
        event: &ProtocolEvent,
        participants: &[Validator],
        setup: SetupPayload,
        reservation: Option<NonceReservation>,
    ) -> Result<()> {
        let party_ids: Vec<PartyId> = participants.iter().map(|v| v.address.clone()).collect();
        let peers: Vec<PeerId> = participants.iter().map(|v| v.peer_id.clone()).collect();

        let message = Message::setup(
            &event.event_id,
            setup.bytes,
            party_ids.clone(),
            setup.signing_metadata,
        );
        let bytes = message.encode()?;

        if !self.acks.begin(&event.event_id, party_ids, reservation) {
            debug!(event_id = %event.event_id, "handshake already open");
            return Ok(());
        }

        let report = broadcast(self.deps.transport.as_ref(), &peers, &bytes).await;
        if report.all_failed() {
            self.acks.abandon(&event.event_id);
            return Err(CoordinatorError::Transport {
                peer_id: report.failed.join(","),
                reason: "setup reached no participant".into(),
            });
        }

        info!(
            event_id = %event.event_id,
            protocol = %event.protocol,
            participants = peers.len(),
            delivered = report.delivered.len(),
            "sent setup"
        );
        Ok(())
    }

    /// Record an ACK from `sender_peer`; sends begin once every participant acked
    pub async fn handle_ack(&self, sender_peer: &str, event_id: &str) -> Result<AckOutcome> {
        let sender_party = self.cache.party_for_peer(sender_peer);
        let outcome = self.acks.record_ack(event_id, sender_peer, sender_party.as_deref())?;

        if let AckOutcome::Completed { participants } = &outcome {
            self.send_begin(event_id, participants).await?;
        }
        Ok(outcome)
    }

    async fn send_begin(&self, event_id: &str, participants: &[PartyId]) -> Result<()> {
        let bytes = Message::begin(event_id, participants.to_vec()).encode()?;

        let peers: Vec<PeerId> = participants
            .iter()
            .filter_map(|party| {
                let peer = self.cache.peer_for_party(party);
                if peer.is_none() {
                    warn!(event_id = %event_id, party_id = %party, "no peer id, skipping begin");
                }
                peer
            })
            .collect();

        let report = broadcast(self.deps.transport.as_ref(), &peers, &bytes).await;
        info!(
            event_id = %event_id,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "all participants acked, sent begin"
        );
        Ok(())
    }

    /// Whether `peer_id` coordinates the current epoch
    pub async fn is_peer_coordinator(&self, peer_id: &str) -> Result<bool> {
        let Some(party) = self.cache.party_for_peer(peer_id) else {
            return Ok(false);
        };
        Ok(self.current_coordinator().await?.as_deref() == Some(party.as_str()))
    }

    /// Party id of the coordinator at the latest block height
    pub async fn current_coordinator(&self) -> Result<Option<PartyId>> {
        let height = self.deps.chain.latest_block_height().await?;
        Ok(self.cache.coordinator_at(self.config.coordinator_range, height))
    }

    pub fn party_id_for_peer(&self, peer_id: &str) -> Option<PartyId> {
        self.cache.party_for_peer(peer_id)
    }

    pub fn peer_id_for_party(&self, party_id: &str) -> Option<PeerId> {
        self.cache.peer_for_party(party_id)
    }

    /// Every cached validator eligible for `protocol`
    pub fn eligible_validators(&self, protocol: ProtocolType) -> Vec<Validator> {
        eligible_validators(protocol, &self.cache.snapshot())
    }

    /// Events with an open handshake
    pub fn pending_handshakes(&self) -> Vec<String> {
        self.acks.pending()
    }

    /// Consecutive ticks `chain` has waited for confirmations
    pub fn chain_wait_count(&self, chain: &str) -> u32 {
        self.nonces.wait_count(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        LoopbackTransport, MemoryChain, MemoryEventStore, MemoryKeyshareStore, MockEngine,
    };
    use crate::types::ValidatorStatus;
    use std::time::Duration;

    fn coordinator(chain: Arc<MemoryChain>, transport: Arc<LoopbackTransport>) -> Arc<Coordinator> {
        let mut config = CoordinatorConfig::new("A");
        config.poll_interval_ms = 50;
        Arc::new(Coordinator::new(
            config,
            Collaborators {
                chain: chain.clone(),
                events: Arc::new(MemoryEventStore::new()),
                keyshares: Arc::new(MemoryKeyshareStore::new()),
                clients: chain,
                engine: Arc::new(MockEngine::new()),
                transport,
            },
        ))
    }

    fn chain_with(validators: &[(&str, ValidatorStatus)]) -> Arc<MemoryChain> {
        let chain = Arc::new(MemoryChain::new());
        chain.set_validators(
            validators
                .iter()
                .map(|(a, s)| Validator::new(*a, format!("peer-{}", a), *s))
                .collect(),
        );
        chain
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_idempotent() {
        let chain = chain_with(&[("A", ValidatorStatus::Active)]);
        let coord = coordinator(chain, Arc::new(LoopbackTransport::new()));

        let handle = coord.start().expect("first start spawns the loop");
        assert!(coord.start().is_none());
        assert!(coord.is_running());

        // let the loop run a few polls on the paused clock
        tokio::time::sleep(Duration::from_millis(175)).await;

        coord.stop();
        coord.stop();
        assert!(!coord.is_running());
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        // can start again after a stop
        let handle = coord.start().unwrap();
        coord.stop();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_not_coordinator_does_nothing() {
        let chain =
            chain_with(&[("B", ValidatorStatus::Active), ("A", ValidatorStatus::Active)]);
        chain.set_height(0);
        let coord = coordinator(chain, Arc::new(LoopbackTransport::new()));

        let summary = coord.poll_once().await.unwrap();
        assert!(!summary.coordinator);
        assert_eq!(coord.current_coordinator().await.unwrap().as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_peer_coordinator_lookup() {
        let chain =
            chain_with(&[("A", ValidatorStatus::Active), ("B", ValidatorStatus::Active)]);
        chain.set_height(150);
        let coord = coordinator(chain, Arc::new(LoopbackTransport::new()));
        coord.refresh_validators().await;

        assert!(coord.is_peer_coordinator("peer-B").await.unwrap());
        assert!(!coord.is_peer_coordinator("peer-A").await.unwrap());
        assert!(!coord.is_peer_coordinator("peer-unknown").await.unwrap());
        assert_eq!(coord.party_id_for_peer("peer-A").as_deref(), Some("A"));
        assert_eq!(coord.peer_id_for_party("B").as_deref(), Some("peer-B"));
    }

    #[tokio::test]
    async fn test_eligible_validators_over_cache() {
        let chain = chain_with(&[
            ("A", ValidatorStatus::Active),
            ("B", ValidatorStatus::PendingJoin),
            ("C", ValidatorStatus::PendingLeave),
        ]);
        let coord = coordinator(chain, Arc::new(LoopbackTransport::new()));
        coord.refresh_validators().await;

        let sign: Vec<String> = coord
            .eligible_validators(ProtocolType::Sign)
            .into_iter()
            .map(|v| v.address)
            .collect();
        assert_eq!(sign, vec!["A".to_string(), "C".to_string()]);
    }

    #[tokio::test]
    async fn test_ack_for_unknown_event_is_noop() {
        let chain = chain_with(&[("A", ValidatorStatus::Active)]);
        let transport = Arc::new(LoopbackTransport::new());
        let coord = coordinator(chain, transport.clone());

        let outcome = coord.handle_ack("peer-A", "missing").await.unwrap();
        assert_eq!(outcome, AckOutcome::Ignored);
        assert!(transport.sent().is_empty());
    }
}
