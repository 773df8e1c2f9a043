//! An in-process transport connecting any number of nodes.
//!
//! Every frame is really encoded, delayed by the link's bandwidth and latency,
//! and decoded on the far side with the configured size limit, so it behaves
//! like a slow wire while staying deterministic enough for tests.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{event, Level};

use crate::error::{GraphsyncError, Result};
use crate::networking::message::GraphSyncMessage;
use crate::networking::network::{GraphSyncNetwork, Receiver};
use crate::networking::peer::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOptions {
    pub latency: Duration,
    /// Bytes per second; `None` transmits instantly.
    pub bandwidth: Option<u64>,
}

impl Default for LinkOptions {
    fn default() -> Self {
        LinkOptions {
            latency: Duration::from_millis(0),
            bandwidth: None,
        }
    }
}

impl LinkOptions {
    fn transmission_time(&self, bytes: usize) -> Duration {
        match self.bandwidth {
            Some(bandwidth) if bandwidth > 0 => {
                Duration::from_secs_f64(bytes as f64 / bandwidth as f64)
            }
            _ => Duration::from_millis(0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames: usize,
    pub bytes: u64,
    pub max_frame: usize,
}

type Route = (PeerId, PeerId);

struct Wire {
    options: LinkOptions,
    // one frame on the wire at a time
    transmitter: Mutex<mpsc::UnboundedSender<(Instant, Vec<u8>)>>,
}

struct Hub {
    nodes: RwLock<HashMap<PeerId, Arc<MemoryNode>>>,
    wires: RwLock<HashMap<Route, Arc<Wire>>>,
    connected: RwLock<HashSet<Route>>,
    severed: RwLock<HashSet<Route>>,
    defaults: StdRwLock<LinkOptions>,
    overrides: StdRwLock<HashMap<Route, LinkOptions>>,
    stats: StdRwLock<FrameStats>,
    max_decode_size: u64,
}

fn route(a: PeerId, b: PeerId) -> Route {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// The shared medium. Clones refer to the same set of nodes.
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<Hub>,
}

impl MemoryNetwork {
    pub fn new(max_decode_size: u64) -> Self {
        MemoryNetwork {
            hub: Arc::new(Hub {
                nodes: RwLock::new(HashMap::new()),
                wires: RwLock::new(HashMap::new()),
                connected: RwLock::new(HashSet::new()),
                severed: RwLock::new(HashSet::new()),
                defaults: StdRwLock::new(LinkOptions::default()),
                overrides: StdRwLock::new(HashMap::new()),
                stats: StdRwLock::new(FrameStats::default()),
                max_decode_size,
            }),
        }
    }

    pub async fn add_node(&self) -> Arc<MemoryNode> {
        self.add_node_with_id(PeerId::random()).await
    }

    pub async fn add_node_with_id(&self, peer: PeerId) -> Arc<MemoryNode> {
        let node = Arc::new(MemoryNode {
            peer,
            hub: self.hub.clone(),
            delegate: StdRwLock::new(None),
        });
        self.hub.nodes.write().await.insert(peer, node.clone());
        node
    }

    /// Options for links without an explicit setting, including existing
    /// links that have not carried a frame yet.
    pub fn set_link_defaults(&self, options: LinkOptions) {
        if let Ok(mut defaults) = self.hub.defaults.write() {
            *defaults = options;
        }
    }

    pub fn set_link_options(&self, a: PeerId, b: PeerId, options: LinkOptions) {
        if let Ok(mut overrides) = self.hub.overrides.write() {
            overrides.insert((a, b), options);
            overrides.insert((b, a), options);
        }
    }

    /// Connects two nodes, notifying both. Sending also connects on demand.
    pub async fn connect(&self, a: PeerId, b: PeerId) -> Result<()> {
        self.hub.severed.write().await.remove(&route(a, b));
        self.hub.ensure_connected(a, b).await
    }

    /// Drops the connection between two nodes. Frames still on the wire are
    /// lost and further sends fail until `connect` is called again.
    pub async fn disconnect(&self, a: PeerId, b: PeerId) {
        self.hub.severed.write().await.insert(route(a, b));
        {
            let mut wires = self.hub.wires.write().await;
            wires.remove(&(a, b));
            wires.remove(&(b, a));
        }
        let was_connected = self.hub.connected.write().await.remove(&route(a, b));
        if was_connected {
            for (local, remote) in [(a, b), (b, a)] {
                if let Some(receiver) = self.hub.delegate_of(local).await {
                    receiver.disconnected(remote).await;
                }
            }
        }
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.hub
            .stats
            .read()
            .map(|stats| *stats)
            .unwrap_or_default()
    }
}

impl Hub {
    fn options_for(&self, from: PeerId, to: PeerId) -> LinkOptions {
        if let Ok(overrides) = self.overrides.read() {
            if let Some(options) = overrides.get(&(from, to)) {
                return *options;
            }
        }
        self.defaults.read().map(|defaults| *defaults).unwrap_or_default()
    }

    async fn delegate_of(&self, peer: PeerId) -> Option<Arc<dyn Receiver>> {
        let nodes = self.nodes.read().await;
        nodes.get(&peer).and_then(|node| node.delegate())
    }

    async fn ensure_connected(&self, a: PeerId, b: PeerId) -> Result<()> {
        if self.severed.read().await.contains(&route(a, b)) {
            return Err(GraphsyncError::Connection(format!(
                "{} is disconnected from {}",
                a, b
            )));
        }
        {
            let nodes = self.nodes.read().await;
            if !nodes.contains_key(&a) || !nodes.contains_key(&b) {
                return Err(GraphsyncError::Connection(format!(
                    "no route between {} and {}",
                    a, b
                )));
            }
        }
        let newly_connected = self.connected.write().await.insert(route(a, b));
        if newly_connected {
            event!(Level::DEBUG, "connected {} <-> {}", a, b);
            for (local, remote) in [(a, b), (b, a)] {
                if let Some(receiver) = self.delegate_of(local).await {
                    receiver.connected(remote).await;
                }
            }
        }
        Ok(())
    }

    async fn wire(self: &Arc<Self>, from: PeerId, to: PeerId) -> Arc<Wire> {
        if let Some(wire) = self.wires.read().await.get(&(from, to)) {
            return wire.clone();
        }
        let mut wires = self.wires.write().await;
        wires
            .entry((from, to))
            .or_insert_with(|| {
                let (sender, receiver) = mpsc::unbounded_channel();
                tokio::spawn(deliver(self.clone(), from, to, receiver));
                Arc::new(Wire {
                    options: self.options_for(from, to),
                    transmitter: Mutex::new(sender),
                })
            })
            .clone()
    }

    fn record(&self, frame: usize) {
        if let Ok(mut stats) = self.stats.write() {
            stats.frames += 1;
            stats.bytes += frame as u64;
            stats.max_frame = stats.max_frame.max(frame);
        }
    }
}

// delivers frames in order, each no earlier than its arrival time
async fn deliver(
    hub: Arc<Hub>,
    from: PeerId,
    to: PeerId,
    mut frames: mpsc::UnboundedReceiver<(Instant, Vec<u8>)>,
) {
    while let Some((arrival, bytes)) = frames.recv().await {
        tokio::time::sleep_until(arrival).await;
        if hub.severed.read().await.contains(&route(from, to)) {
            continue;
        }
        let receiver = match hub.delegate_of(to).await {
            Some(receiver) => receiver,
            None => {
                event!(Level::WARN, "dropping frame for {}: no receiver", to);
                continue;
            }
        };
        match GraphSyncMessage::decode(&bytes, hub.max_decode_size) {
            Ok(message) => receiver.receive_message(from, message).await,
            Err(err) => {
                event!(Level::WARN, "undecodable frame from {}: {}", from, err);
                receiver.receive_error(Some(from), err).await;
            }
        }
    }
}

/// One node's view of a `MemoryNetwork`.
pub struct MemoryNode {
    peer: PeerId,
    hub: Arc<Hub>,
    delegate: StdRwLock<Option<Arc<dyn Receiver>>>,
}

impl MemoryNode {
    fn delegate(&self) -> Option<Arc<dyn Receiver>> {
        self.delegate.read().ok().and_then(|delegate| delegate.clone())
    }
}

#[async_trait]
impl GraphSyncNetwork for MemoryNode {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    async fn send_message(&self, peer: PeerId, message: GraphSyncMessage) -> Result<()> {
        self.hub.ensure_connected(self.peer, peer).await?;
        let bytes = message.encode()?;
        let wire = self.hub.wire(self.peer, peer).await;
        let transmitter = wire.transmitter.lock().await;
        tokio::time::sleep(wire.options.transmission_time(bytes.len())).await;
        self.hub.record(bytes.len());
        let arrival = Instant::now() + wire.options.latency;
        transmitter
            .send((arrival, bytes))
            .map_err(|_| GraphsyncError::Connection(format!("link to {} is closed", peer)))
    }

    fn set_delegate(&self, receiver: Arc<dyn Receiver>) {
        if let Ok(mut delegate) = self.delegate.write() {
            *delegate = Some(receiver);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::test_utilities::mocks::RecordingReceiver;

    #[tokio::test]
    async fn frames_arrive_in_order_after_latency() {
        let network = MemoryNetwork::new(1 << 20);
        network.set_link_defaults(LinkOptions {
            latency: Duration::from_millis(20),
            bandwidth: Some(1_000_000),
        });
        let alice = network.add_node_with_id(PeerId::from_label("alice")).await;
        let bob = network.add_node_with_id(PeerId::from_label("bob")).await;
        let (receiver, mut events) = RecordingReceiver::new();
        bob.set_delegate(Arc::new(receiver));

        let started = Instant::now();
        for fill in 0..3u8 {
            let message = GraphSyncMessage::new(vec![], vec![], vec![Block::new(vec![fill; 1000])]);
            alice.send_message(bob.local_peer(), message).await.unwrap();
        }
        assert_eq!(events.connected().await, alice.local_peer());
        for fill in 0..3u8 {
            let (sender, message) = events.message().await;
            assert_eq!(sender, alice.local_peer());
            assert_eq!(message.get_blocks()[0].get_data()[0], fill);
        }
        assert!(started.elapsed() >= Duration::from_millis(20));
        let stats = network.frame_stats();
        assert_eq!(stats.frames, 3);
        assert!(stats.max_frame > 1000);
    }

    #[tokio::test]
    async fn disconnected_peers_cannot_send() {
        let network = MemoryNetwork::new(1 << 20);
        let alice = network.add_node().await;
        let bob = network.add_node().await;
        let (receiver, mut events) = RecordingReceiver::new();
        bob.set_delegate(Arc::new(receiver));
        network.connect(alice.local_peer(), bob.local_peer()).await.unwrap();
        assert_eq!(events.connected().await, alice.local_peer());
        network.disconnect(alice.local_peer(), bob.local_peer()).await;
        assert_eq!(events.disconnected().await, alice.local_peer());
        let err = alice
            .send_message(bob.local_peer(), GraphSyncMessage::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GraphsyncError::Connection(_)));
        assert!(alice
            .send_message(PeerId::from_label("nobody"), GraphSyncMessage::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected_by_the_receiver() {
        let network = MemoryNetwork::new(512);
        let alice = network.add_node().await;
        let bob = network.add_node().await;
        let (receiver, mut events) = RecordingReceiver::new();
        bob.set_delegate(Arc::new(receiver));
        let message = GraphSyncMessage::new(vec![], vec![], vec![Block::new(vec![1; 4096])]);
        alice.send_message(bob.local_peer(), message).await.unwrap();
        let (sender, err) = events.error().await;
        assert_eq!(sender, Some(alice.local_peer()));
        assert!(matches!(err, GraphsyncError::Decode(_)));
    }
}
