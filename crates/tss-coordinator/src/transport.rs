//! Point-to-point delivery to peers

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::PeerId;

/// Fire-and-forget delivery of encoded messages
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, peer_id: &str, data: Vec<u8>) -> Result<()>;
}

/// Outcome of sending one message to a set of peers
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<PeerId>,
    pub failed: Vec<PeerId>,
}

impl BroadcastReport {
    pub fn all_failed(&self) -> bool {
        self.delivered.is_empty() && !self.failed.is_empty()
    }
}

/// Send `data` to every peer; a failed peer never stops the rest
pub async fn broadcast(
    transport: &dyn Transport,
    peers: &[PeerId],
    data: &[u8],
) -> BroadcastReport {
    let mut report = BroadcastReport::default();

    for peer_id in peers {
        match transport.send(peer_id, data.to_vec()).await {
            Ok(()) => {
                debug!(peer_id = %peer_id, bytes = data.len(), "message delivered");
                report.delivered.push(peer_id.clone());
            }
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "failed to send message, skipping peer");
                report.failed.push(peer_id.clone());
            }
        }
    }

    report
}
