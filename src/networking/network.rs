use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{GraphsyncError, Result};
use crate::networking::message::GraphSyncMessage;
use crate::networking::peer::PeerId;

/// The transport graphsync runs over.
///
/// Only message queues call `send_message`; everything arriving from peers is
/// handed to the registered `Receiver`.
#[async_trait]
pub trait GraphSyncNetwork: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Sends one message. Resolves once the transport has accepted it.
    async fn send_message(&self, peer: PeerId, message: GraphSyncMessage) -> Result<()>;

    fn set_delegate(&self, receiver: Arc<dyn Receiver>);
}

/// Incoming traffic and connection events from a `GraphSyncNetwork`.
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn receive_message(&self, sender: PeerId, message: GraphSyncMessage);

    /// A frame from `sender` (when known) could not be decoded or delivered.
    async fn receive_error(&self, sender: Option<PeerId>, err: GraphsyncError);

    async fn connected(&self, peer: PeerId);

    async fn disconnected(&self, peer: PeerId);
}
