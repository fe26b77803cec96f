//! Virtual-node replay fan-out is an external collaborator (spec §1,
//! §9 redesign note): the server that actually replays frames to
//! mobile clients lives outside this crate. Rather than a process-wide
//! registration slot looked up at broadcast time (the pattern §9 flags
//! for removal), the broadcaster is passed to [`crate::manager::Manager`]
//! at construction as a trait object.

use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait VirtualNodeBroadcaster: Send + Sync {
    /// Forward one raw inbound frame, opaque to this crate, to every
    /// connected virtual-node client (§4.3 step 2).
    async fn broadcast(&self, frame: Bytes);
}

/// Used when no virtual-node server is attached.
pub struct NullBroadcaster;

#[async_trait]
impl VirtualNodeBroadcaster for NullBroadcaster {
    async fn broadcast(&self, _frame: Bytes) {}
}
