use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{event, Level};

use crate::config::GraphSyncConfig;
use crate::context::RequestContext;
use crate::error::GraphsyncError;
use crate::extension::ExtensionData;
use crate::hooks::{Hooks, RequestReceivedHook, ResponseReceivedHook, UnregisterHandle};
use crate::link::Link;
use crate::networking::message::{GraphSyncMessage, Priority};
use crate::networking::message_queue::PeerMessageManager;
use crate::networking::network::{GraphSyncNetwork, Receiver};
use crate::networking::peer::PeerId;
use crate::node::Node;
use crate::request_manager::{RequestManager, RequestManagerHandle};
use crate::response_manager::{ResponseManager, ResponseManagerHandle};
use crate::storage::BlockStore;
use crate::stream::{response_channel, ErrorStream, ResponseProgressStream};

///
/// A graphsync node: requests DAGs from peers and serves its own store.
///
/// `new` wires the request manager, the response manager and the per-peer
/// message queues together and registers itself as the network's receiver.
/// Everything runs on spawned tasks, so it must be created inside a tokio
/// runtime.
///
pub struct GraphSync {
    local_peer: PeerId,
    requests: RequestManagerHandle,
    responses: ResponseManagerHandle,
    queues: PeerMessageManager,
    hooks: Arc<Hooks>,
    config: GraphSyncConfig,
}

impl GraphSync {
    pub fn new(
        network: Arc<dyn GraphSyncNetwork>,
        store: Arc<dyn BlockStore>,
        config: GraphSyncConfig,
    ) -> Arc<GraphSync> {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (protocol_tx, protocol_rx) = mpsc::unbounded_channel();
        let queues = PeerMessageManager::new(network.clone(), config.clone(), failures_tx);
        let hooks = Hooks::new();

        let (request_manager, requests) = RequestManager::new(
            store.clone(),
            queues.clone(),
            hooks.clone(),
            config.clone(),
            protocol_tx.clone(),
        );
        let (response_manager, responses) = ResponseManager::new(
            store,
            queues.clone(),
            hooks.clone(),
            config.clone(),
            protocol_tx.clone(),
        );
        tokio::spawn(request_manager.run());
        tokio::spawn(response_manager.run());

        let peers = PeerSupervisor {
            requests: requests.clone(),
            responses: responses.clone(),
            queues: queues.clone(),
            max_protocol_errors: config.max_protocol_errors,
        };
        tokio::spawn(peers.run(failures_rx, protocol_rx));

        network.set_delegate(Arc::new(GraphSyncReceiver {
            requests: requests.clone(),
            responses: responses.clone(),
            queues: queues.clone(),
            protocol_errors: protocol_tx,
        }));

        event!(Level::INFO, "graphsync started for {}", network.local_peer());
        Arc::new(GraphSync {
            local_peer: network.local_peer(),
            requests,
            responses,
            queues,
            hooks,
            config,
        })
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn config(&self) -> &GraphSyncConfig {
        &self.config
    }

    /// Requests the part of `peer`'s DAG under `root` that `selector` describes.
    ///
    /// Both streams close together. The error stream carries at most one
    /// error; on success it closes empty and `terminal_status` tells whether
    /// the result was full or partial.
    pub async fn request(
        &self,
        context: RequestContext,
        peer: PeerId,
        root: Link,
        selector: Node,
        extensions: Vec<ExtensionData>,
    ) -> (ResponseProgressStream, ErrorStream) {
        self.request_with_priority(context, peer, root, selector, 0, extensions)
            .await
    }

    /// Like `request`, with a priority the responder uses to order its work.
    pub async fn request_with_priority(
        &self,
        context: RequestContext,
        peer: PeerId,
        root: Link,
        selector: Node,
        priority: Priority,
        extensions: Vec<ExtensionData>,
    ) -> (ResponseProgressStream, ErrorStream) {
        match self
            .requests
            .request_with_priority(context.clone(), peer, root, selector, priority, extensions)
            .await
        {
            Ok(streams) => streams,
            Err(err) => {
                let (sender, responses, errors) = response_channel(1, context.child());
                sender.fail(err);
                (responses, errors)
            }
        }
    }

    pub fn register_request_received_hook(
        &self,
        hook: Arc<dyn RequestReceivedHook>,
    ) -> UnregisterHandle {
        self.hooks.register_request_received_hook(hook)
    }

    pub fn register_response_received_hook(
        &self,
        hook: Arc<dyn ResponseReceivedHook>,
    ) -> UnregisterHandle {
        self.hooks.register_response_received_hook(hook)
    }

    /// Stops serving `peer` and fails our requests to it.
    pub async fn disconnect_peer(&self, peer: PeerId) {
        tear_down(&self.requests, &self.responses, &self.queues, peer, "peer disconnected").await;
    }

    pub async fn shutdown(&self) {
        self.queues.shutdown().await;
    }
}

async fn tear_down(
    requests: &RequestManagerHandle,
    responses: &ResponseManagerHandle,
    queues: &PeerMessageManager,
    peer: PeerId,
    reason: &str,
) {
    event!(Level::INFO, "tearing down {}: {}", peer, reason);
    let _ = requests.peer_failed(peer, GraphsyncError::Connection(reason.to_string()));
    let _ = responses.peer_disconnected(peer);
    queues.disconnect(peer).await;
}

//
// watches send failures and protocol errors, tearing peers down
//
struct PeerSupervisor {
    requests: RequestManagerHandle,
    responses: ResponseManagerHandle,
    queues: PeerMessageManager,
    max_protocol_errors: u32,
}

impl PeerSupervisor {
    async fn run(
        self,
        mut failures: mpsc::UnboundedReceiver<(PeerId, GraphsyncError)>,
        mut protocol_errors: mpsc::UnboundedReceiver<(PeerId, GraphsyncError)>,
    ) {
        let mut offences: HashMap<PeerId, u32> = HashMap::new();
        loop {
            tokio::select! {
                failure = failures.recv() => match failure {
                    Some((peer, err)) => {
                        offences.remove(&peer);
                        self.tear_down(peer, &err.to_string()).await;
                    }
                    None => break,
                },
                offence = protocol_errors.recv() => match offence {
                    Some((peer, err)) => {
                        event!(Level::WARN, "protocol error from {}: {}", peer, err);
                        let count = offences.entry(peer).or_insert(0);
                        *count += 1;
                        if *count >= self.max_protocol_errors {
                            offences.remove(&peer);
                            self.tear_down(peer, "too many protocol errors").await;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    async fn tear_down(&self, peer: PeerId, reason: &str) {
        tear_down(&self.requests, &self.responses, &self.queues, peer, reason).await;
    }
}

struct GraphSyncReceiver {
    requests: RequestManagerHandle,
    responses: ResponseManagerHandle,
    queues: PeerMessageManager,
    protocol_errors: mpsc::UnboundedSender<(PeerId, GraphsyncError)>,
}

#[async_trait]
impl Receiver for GraphSyncReceiver {
    async fn receive_message(&self, sender: PeerId, message: GraphSyncMessage) {
        let (requests, responses, blocks) = message.into_parts();
        if !requests.is_empty() {
            if let Err(err) = self.responses.process_requests(sender, requests) {
                event!(Level::ERROR, "{}", err);
            }
        }
        if !responses.is_empty() || !blocks.is_empty() {
            if let Err(err) = self.requests.process_responses(sender, responses, blocks) {
                event!(Level::ERROR, "{}", err);
            }
        }
    }

    async fn receive_error(&self, sender: Option<PeerId>, err: GraphsyncError) {
        match sender {
            Some(peer) => {
                let _ = self.protocol_errors.send((peer, err));
            }
            None => event!(Level::WARN, "network error: {}", err),
        }
    }

    async fn connected(&self, peer: PeerId) {
        event!(Level::DEBUG, "connected to {}", peer);
    }

    async fn disconnected(&self, peer: PeerId) {
        tear_down(&self.requests, &self.responses, &self.queues, peer, "peer disconnected").await;
    }
}
