//! Validator registry cache and coordinator rotation
//!
//! The cache is replaced wholesale on refresh. Readers take an `Arc` snapshot
//! and never observe a half-updated set. The same lock guards the
//! coordinator's running flag so start/stop races resolve against one owner.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::chain::ChainDataProvider;
use crate::types::{BlockHeight, PartyId, PeerId, Validator};

/// Address of the coordinator for `block_height`
///
/// Only ACTIVE validators rotate; when none are active (bootstrap) the whole
/// set is used. The coordinator is stable for `coordinator_range` blocks.
/// Returns `None` for an empty validator set.
pub fn coordinator_for(
    validators: &[Validator],
    coordinator_range: u64,
    block_height: BlockHeight,
) -> Option<PartyId> {
    if validators.is_empty() {
        return None;
    }

    let active: Vec<&Validator> = validators.iter().filter(|v| v.is_active()).collect();
    let pool: Vec<&Validator> = if active.is_empty() {
        validators.iter().collect()
    } else {
        active
    };

    let epoch = block_height / coordinator_range.max(1);
    let index = (epoch % pool.len() as u64) as usize;
    Some(pool[index].address.clone())
}

#[derive(Default)]
struct RegistryState {
    validators: Arc<Vec<Validator>>,
    running: bool,
    stop_tx: Option<oneshot::Sender<()>>,
}

/// Cached validator set plus the coordinator lifecycle flag
#[derive(Default)]
pub struct ValidatorCache {
    state: RwLock<RegistryState>,
}

impl ValidatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache pre-filled with `validators`
    pub fn with_validators(validators: Vec<Validator>) -> Self {
        let cache = Self::new();
        cache.replace(validators);
        cache
    }

    /// Fetch the validator set and swap it in
    ///
    /// On failure the previous set stays in place. Returns whether the cache
    /// was updated.
    pub async fn refresh(&self, provider: &dyn ChainDataProvider) -> bool {
        match provider.all_validators().await {
            Ok(validators) => {
                debug!(count = validators.len(), "validator cache refreshed");
                self.replace(validators);
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to refresh validator cache, keeping stale set");
                false
            }
        }
    }

    pub fn replace(&self, validators: Vec<Validator>) {
        self.state.write().validators = Arc::new(validators);
    }

    /// Current validator set
    pub fn snapshot(&self) -> Arc<Vec<Validator>> {
        Arc::clone(&self.state.read().validators)
    }

    pub fn party_for_peer(&self, peer_id: &str) -> Option<PartyId> {
        self.state
            .read()
            .validators
            .iter()
            .find(|v| v.peer_id == peer_id)
            .map(|v| v.address.clone())
    }

    pub fn peer_for_party(&self, party_id: &str) -> Option<PeerId> {
        self.state
            .read()
            .validators
            .iter()
            .find(|v| v.address == party_id)
            .map(|v| v.peer_id.clone())
    }

    /// Coordinator for `block_height` over the cached set
    pub fn coordinator_at(
        &self,
        coordinator_range: u64,
        block_height: BlockHeight,
    ) -> Option<PartyId> {
        coordinator_for(&self.snapshot(), coordinator_range, block_height)
    }

    pub fn is_running(&self) -> bool {
        self.state.read().running
    }

    /// Flip to running and keep `stop_tx`; false if already running
    pub(crate) fn mark_running(&self, stop_tx: oneshot::Sender<()>) -> bool {
        let mut state = self.state.write();
        if state.running {
            return false;
        }
        state.running = true;
        state.stop_tx = Some(stop_tx);
        true
    }

    /// Flip to stopped, handing back the stop signal if one was held
    pub(crate) fn mark_stopped(&self) -> Option<oneshot::Sender<()>> {
        let mut state = self.state.write();
        state.running = false;
        state.stop_tx.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CoordinatorError, Result};
    use crate::types::{TssKey, ValidatorStatus};
    use async_trait::async_trait;
    use proptest::prelude::*;

    fn validator(address: &str, status: ValidatorStatus) -> Validator {
        Validator::new(address, format!("peer-{}", address), status)
    }

    fn statuses() -> impl Strategy<Value = ValidatorStatus> {
        prop_oneof![
            Just(ValidatorStatus::Active),
            Just(ValidatorStatus::PendingJoin),
            Just(ValidatorStatus::PendingLeave),
            Just(ValidatorStatus::Inactive),
        ]
    }

    fn validator_set() -> impl Strategy<Value = Vec<Validator>> {
        prop::collection::vec(statuses(), 1..12).prop_map(|s| {
            s.into_iter()
                .enumerate()
                .map(|(i, status)| validator(&format!("v{}", i), status))
                .collect()
        })
    }

    #[test]
    fn test_rotation_over_active_only() {
        let set = vec![
            validator("A", ValidatorStatus::Active),
            validator("B", ValidatorStatus::PendingJoin),
            validator("C", ValidatorStatus::Active),
            validator("D", ValidatorStatus::PendingLeave),
        ];

        assert_eq!(coordinator_for(&set, 100, 0).as_deref(), Some("A"));
        assert_eq!(coordinator_for(&set, 100, 99).as_deref(), Some("A"));
        assert_eq!(coordinator_for(&set, 100, 100).as_deref(), Some("C"));
        assert_eq!(coordinator_for(&set, 100, 250).as_deref(), Some("A"));
    }

    #[test]
    fn test_bootstrap_falls_back_to_full_set() {
        let set = vec![
            validator("A", ValidatorStatus::PendingJoin),
            validator("B", ValidatorStatus::PendingJoin),
        ];
        assert_eq!(coordinator_for(&set, 10, 5).as_deref(), Some("A"));
        assert_eq!(coordinator_for(&set, 10, 15).as_deref(), Some("B"));
    }

    #[test]
    fn test_empty_set_has_no_coordinator() {
        assert_eq!(coordinator_for(&[], 100, 1234), None);
    }

    #[test]
    fn test_identity_lookups() {
        let cache = ValidatorCache::with_validators(vec![
            validator("A", ValidatorStatus::Active),
            validator("B", ValidatorStatus::Active),
        ]);

        assert_eq!(cache.party_for_peer("peer-B").as_deref(), Some("B"));
        assert_eq!(cache.peer_for_party("A").as_deref(), Some("peer-A"));
        assert_eq!(cache.party_for_peer("peer-Z"), None);
        assert_eq!(cache.peer_for_party("Z"), None);
    }

    #[test]
    fn test_lifecycle_flag_is_idempotent() {
        let cache = ValidatorCache::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        assert!(cache.mark_running(tx1));
        assert!(!cache.mark_running(tx2));
        assert!(cache.is_running());

        assert!(cache.mark_stopped().is_some());
        assert!(cache.mark_stopped().is_none());
        assert!(!cache.is_running());
    }

    struct FlakyProvider {
        fail: bool,
    }

    #[async_trait]
    impl ChainDataProvider for FlakyProvider {
        async fn latest_block_height(&self) -> Result<BlockHeight> {
            Ok(0)
        }

        async fn all_validators(&self) -> Result<Vec<Validator>> {
            if self.fail {
                Err(CoordinatorError::Chain("connection refused".into()))
            } else {
                Ok(vec![validator("fresh", ValidatorStatus::Active)])
            }
        }

        async fn current_tss_key(&self) -> Result<Option<TssKey>> {
            Ok(None)
        }

        async fn gas_price(&self, _chain: &str) -> Result<u128> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_refresh_keeps_stale_set_on_error() {
        let cache =
            ValidatorCache::with_validators(vec![validator("stale", ValidatorStatus::Active)]);

        assert!(!cache.refresh(&FlakyProvider { fail: true }).await);
        assert_eq!(cache.snapshot()[0].address, "stale");

        assert!(cache.refresh(&FlakyProvider { fail: false }).await);
        assert_eq!(cache.snapshot()[0].address, "fresh");
    }

    #[test]
    fn test_snapshot_survives_refresh() {
        let cache =
            ValidatorCache::with_validators(vec![validator("old", ValidatorStatus::Active)]);
        let before = cache.snapshot();
        cache.replace(vec![validator("new", ValidatorStatus::Active)]);

        assert_eq!(before[0].address, "old");
        assert_eq!(cache.snapshot()[0].address, "new");
    }

    proptest! {
        #[test]
        fn prop_epoch_stability(
            set in validator_set(),
            range in 1u64..500,
            epoch in 0u64..10_000,
            a in 0u64..500,
            b in 0u64..500,
        ) {
            let b1 = epoch * range + a % range;
            let b2 = epoch * range + b % range;
            prop_assert_eq!(coordinator_for(&set, range, b1), coordinator_for(&set, range, b2));
        }

        #[test]
        fn prop_never_pending_when_active_exists(
            set in validator_set(),
            range in 1u64..500,
            height in 0u64..1_000_000,
        ) {
            let elected = coordinator_for(&set, range, height).unwrap();
            let status = set.iter().find(|v| v.address == elected).unwrap().status;
            if set.iter().any(|v| v.is_active()) {
                prop_assert_eq!(status, ValidatorStatus::Active);
            }
        }
    }
}
