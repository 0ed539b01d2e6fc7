//! Threshold crypto engine contract and keyshare access
//!
//! The engine is opaque: it only turns coordinator decisions (threshold,
//! participants, key material) into setup payloads. Keyshare handles are
//! native resources and are released through [`LoadedKeyshare`] on drop.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::PartyId;

/// Raw handle to a keyshare loaded inside the engine
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct KeyshareHandle(pub u64);

/// Setup payload construction for each protocol
pub trait TssEngine: Send + Sync {
    /// Setup for a fresh key (keygen and key refresh)
    fn keygen_setup(&self, threshold: usize, participant_ids: &[u8]) -> Result<Vec<u8>>;

    /// Setup for signing `signing_hash` with the key identified by `key_id`
    fn sign_setup(
        &self,
        key_id: &[u8; 32],
        signing_hash: &[u8],
        participant_ids: &[u8],
    ) -> Result<Vec<u8>>;

    /// Setup for moving `old_keyshare` to a new quorum
    fn quorum_change_setup(
        &self,
        old_keyshare: &KeyshareHandle,
        threshold: usize,
        participant_ids: &[u8],
        old_indices: &[u8],
        new_indices: &[u8],
    ) -> Result<Vec<u8>>;

    fn load_keyshare(&self, keyshare: &[u8]) -> Result<KeyshareHandle>;

    fn free_keyshare(&self, handle: KeyshareHandle);
}

/// Local keyshare storage
#[async_trait]
pub trait KeyshareStore: Send + Sync {
    /// Opaque keyshare bytes for `key_id`, `None` if this node holds none
    async fn get(&self, key_id: &str) -> Result<Option<Vec<u8>>>;
}

/// Keyshare loaded into the engine, freed when dropped
pub struct LoadedKeyshare<'a> {
    engine: &'a dyn TssEngine,
    handle: KeyshareHandle,
}

impl<'a> LoadedKeyshare<'a> {
    pub fn load(engine: &'a dyn TssEngine, keyshare: &[u8]) -> Result<Self> {
        let handle = engine.load_keyshare(keyshare)?;
        Ok(Self { engine, handle })
    }

    pub fn handle(&self) -> &KeyshareHandle {
        &self.handle
    }
}

impl Drop for LoadedKeyshare<'_> {
    fn drop(&mut self) {
        let handle = std::mem::replace(&mut self.handle, KeyshareHandle(0));
        self.engine.free_keyshare(handle);
    }
}

/// Engine encoding of a participant list: sorted party ids joined by NUL
pub fn encode_participant_ids(parties: &[PartyId]) -> Vec<u8> {
    let mut sorted: Vec<&str> = parties.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join("\0").into_bytes()
}
