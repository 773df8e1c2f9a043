use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{event, Level};

use crate::error::GraphsyncError;
use crate::networking::message::GraphSyncMessage;
use crate::networking::network::Receiver;
use crate::networking::peer::PeerId;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum ReceiverEvent {
    Message(PeerId, GraphSyncMessage),
    Error(Option<PeerId>, GraphsyncError),
    Connected(PeerId),
    Disconnected(PeerId),
}

/// A network receiver that records everything it is handed.
pub struct RecordingReceiver {
    events: mpsc::UnboundedSender<ReceiverEvent>,
}

/// The read side of a `RecordingReceiver`. Each accessor waits for the next
/// event of its kind, skipping others, and panics after a timeout.
pub struct ReceiverEvents {
    events: mpsc::UnboundedReceiver<ReceiverEvent>,
}

impl RecordingReceiver {
    pub fn new() -> (RecordingReceiver, ReceiverEvents) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            RecordingReceiver { events: sender },
            ReceiverEvents { events: receiver },
        )
    }

    fn record(&self, event: ReceiverEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Receiver for RecordingReceiver {
    async fn receive_message(&self, sender: PeerId, message: GraphSyncMessage) {
        self.record(ReceiverEvent::Message(sender, message));
    }

    async fn receive_error(&self, sender: Option<PeerId>, err: GraphsyncError) {
        self.record(ReceiverEvent::Error(sender, err));
    }

    async fn connected(&self, peer: PeerId) {
        self.record(ReceiverEvent::Connected(peer));
    }

    async fn disconnected(&self, peer: PeerId) {
        self.record(ReceiverEvent::Disconnected(peer));
    }
}

impl ReceiverEvents {
    async fn next_matching<T>(&mut self, mut pick: impl FnMut(ReceiverEvent) -> Option<T>) -> T {
        loop {
            let event = tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
                .await
                .expect("timed out waiting for a receiver event")
                .expect("receiver dropped");
            if let Some(value) = pick(event) {
                return value;
            }
        }
    }

    pub async fn message(&mut self) -> (PeerId, GraphSyncMessage) {
        self.next_matching(|event| match event {
            ReceiverEvent::Message(sender, message) => Some((sender, message)),
            other => {
                event!(Level::DEBUG, "skipping {:?}", other);
                None
            }
        })
        .await
    }

    pub async fn error(&mut self) -> (Option<PeerId>, GraphsyncError) {
        self.next_matching(|event| match event {
            ReceiverEvent::Error(sender, err) => Some((sender, err)),
            _ => None,
        })
        .await
    }

    pub async fn connected(&mut self) -> PeerId {
        self.next_matching(|event| match event {
            ReceiverEvent::Connected(peer) => Some(peer),
            _ => None,
        })
        .await
    }

    pub async fn disconnected(&mut self) -> PeerId {
        self.next_matching(|event| match event {
            ReceiverEvent::Disconnected(peer) => Some(peer),
            _ => None,
        })
        .await
    }

    /// Events received so far, without waiting.
    pub fn drain(&mut self) -> Vec<ReceiverEvent> {
        let mut drained = vec![];
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}
