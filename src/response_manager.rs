use std::collections::HashMap;
use std::sync::Arc;

use ahash::AHashSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::block::Block;
use crate::config::GraphSyncConfig;
use crate::error::{GraphsyncError, Result};
use crate::extension::ExtensionData;
use crate::hooks::Hooks;
use crate::link::Link;
use crate::networking::message::{GraphSyncRequest, RequestId, ResponseStatus};
use crate::networking::message_queue::{MessageQueue, PeerMessageManager, ResponseUpdate};
use crate::networking::metadata::Metadata;
use crate::networking::peer::PeerId;
use crate::request_manager::ProtocolErrorSender;
use crate::selector::Selector;
use crate::storage::BlockStore;
use crate::traversal::{TraversalOutcome, TraversalStep, Traverser};

#[derive(Debug)]
pub enum ResponseManagerMessage {
    ProcessRequests {
        peer: PeerId,
        requests: Vec<GraphSyncRequest>,
    },
    ResponseFinished {
        peer: PeerId,
        id: RequestId,
        generation: u64,
    },
    PeerDisconnected {
        peer: PeerId,
    },
}

#[derive(Debug, Clone)]
pub struct ResponseManagerHandle {
    sender: mpsc::UnboundedSender<ResponseManagerMessage>,
}

impl ResponseManagerHandle {
    pub fn process_requests(&self, peer: PeerId, requests: Vec<GraphSyncRequest>) -> Result<()> {
        self.send(ResponseManagerMessage::ProcessRequests { peer, requests })
    }

    /// Stops every response being served to `peer`.
    pub fn peer_disconnected(&self, peer: PeerId) -> Result<()> {
        self.send(ResponseManagerMessage::PeerDisconnected { peer })
    }

    fn send(&self, message: ResponseManagerMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| GraphsyncError::Connection(String::from("response manager stopped")))
    }
}

struct ActiveResponse {
    generation: u64,
    task: JoinHandle<()>,
}

/// Serves incoming requests from the local store. Each accepted request is
/// traversed in its own task; the manager tracks them by peer and id so that
/// cancels and disconnects can stop them.
pub struct ResponseManager {
    receiver: mpsc::UnboundedReceiver<ResponseManagerMessage>,
    sender: mpsc::UnboundedSender<ResponseManagerMessage>,
    active: HashMap<(PeerId, RequestId), ActiveResponse>,
    next_generation: u64,
    store: Arc<dyn BlockStore>,
    queues: PeerMessageManager,
    hooks: Arc<Hooks>,
    config: GraphSyncConfig,
    protocol_errors: ProtocolErrorSender,
}

impl ResponseManager {
    pub fn new(
        store: Arc<dyn BlockStore>,
        queues: PeerMessageManager,
        hooks: Arc<Hooks>,
        config: GraphSyncConfig,
        protocol_errors: ProtocolErrorSender,
    ) -> (ResponseManager, ResponseManagerHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let manager = ResponseManager {
            receiver,
            sender: sender.clone(),
            active: HashMap::new(),
            next_generation: 0,
            store,
            queues,
            hooks,
            config,
            protocol_errors,
        };
        (manager, ResponseManagerHandle { sender })
    }

    pub async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            match message {
                ResponseManagerMessage::ProcessRequests { peer, requests } => {
                    self.process_requests(peer, requests).await
                }
                ResponseManagerMessage::ResponseFinished {
                    peer,
                    id,
                    generation,
                } => {
                    let current = self
                        .active
                        .get(&(peer, id))
                        .map(|active| active.generation == generation)
                        .unwrap_or(false);
                    if current {
                        self.active.remove(&(peer, id));
                    }
                }
                ResponseManagerMessage::PeerDisconnected { peer } => {
                    let keys: Vec<(PeerId, RequestId)> = self
                        .active
                        .keys()
                        .filter(|(active_peer, _)| *active_peer == peer)
                        .copied()
                        .collect();
                    for key in keys {
                        if let Some(active) = self.active.remove(&key) {
                            active.task.abort();
                        }
                    }
                }
            }
        }
        for (_, active) in self.active.drain() {
            active.task.abort();
        }
        event!(Level::DEBUG, "response manager stopped");
    }

    async fn process_requests(&mut self, peer: PeerId, requests: Vec<GraphSyncRequest>) {
        let queue = self.queues.queue(peer).await;
        let (cancels, mut requests): (Vec<GraphSyncRequest>, Vec<GraphSyncRequest>) =
            requests.into_iter().partition(|request| request.is_cancel());

        for cancel in cancels {
            let id = cancel.get_id();
            match self.active.remove(&(peer, id)) {
                Some(active) => {
                    event!(Level::DEBUG, "{} cancelled request {}", peer, id);
                    active.task.abort();
                    queue.cancel_response(id);
                }
                None => event!(Level::TRACE, "ignoring cancel for unknown request {}", id),
            }
        }

        requests.sort_by(|a, b| b.get_priority().cmp(&a.get_priority()));
        for request in requests {
            let id = request.get_id();
            if self.active.contains_key(&(peer, id)) {
                let _ = self.protocol_errors.send((
                    peer,
                    GraphsyncError::Protocol(format!("request id {} is already in use", id)),
                ));
                continue;
            }
            let generation = self.next_generation;
            self.next_generation += 1;
            queue.start_response(id);
            let responder = Responder {
                peer,
                id,
                store: self.store.clone(),
                queue: queue.clone(),
                config: self.config.clone(),
            };
            let hooks = self.hooks.clone();
            let manager = self.sender.clone();
            let task = tokio::spawn(async move {
                responder.serve(request, hooks).await;
                let _ = manager.send(ResponseManagerMessage::ResponseFinished {
                    peer,
                    id,
                    generation,
                });
            });
            self.active
                .insert((peer, id), ActiveResponse { generation, task });
        }
    }
}

struct Responder {
    peer: PeerId,
    id: RequestId,
    store: Arc<dyn BlockStore>,
    queue: MessageQueue,
    config: GraphSyncConfig,
}

impl Responder {
    async fn serve(&self, request: GraphSyncRequest, hooks: Arc<Hooks>) {
        let actions = hooks.process_request(self.peer, &request);
        if let Some(reason) = actions.rejection() {
            let reason = reason.to_string();
            let mut update = ResponseUpdate::status(self.id, ResponseStatus::RequestFailed(reason));
            update.extensions = actions.into_extensions();
            self.queue.send_response(update, None);
            return;
        }
        let mut extensions = actions.into_extensions();

        let selector = match Selector::from_bytes(request.get_selector()) {
            Ok(selector) => selector,
            Err(err) => {
                event!(Level::INFO, "request {} from {} has a bad selector: {}", self.id, self.peer, err);
                let mut update = ResponseUpdate::status(self.id, ResponseStatus::RequestFailed(err.to_string()));
                update.extensions = extensions;
                self.queue.send_response(update, None);
                return;
            }
        };

        event!(Level::DEBUG, "serving request {} for {} to {}", self.id, request.get_root(), self.peer);
        let mut traverser = Traverser::new(*request.get_root(), selector);
        let mut sent: AHashSet<Link> = AHashSet::new();
        loop {
            match traverser.advance() {
                TraversalStep::Progress(_) => {}
                TraversalStep::NeedLink(link) => {
                    let result = match self.send_link(link, &mut sent, &mut extensions).await {
                        Ok(result) => result,
                        // the queue is gone, so nobody is listening any more
                        Err(_) => return,
                    };
                    traverser.load(result);
                }
                TraversalStep::Done(outcome) => {
                    let status = match outcome {
                        TraversalOutcome::CompletedFull => ResponseStatus::RequestCompletedFull,
                        TraversalOutcome::CompletedPartial { missing } => {
                            event!(Level::DEBUG, "request {} is missing {} links", self.id, missing.len());
                            ResponseStatus::RequestCompletedPartial
                        }
                        TraversalOutcome::Failed(err) => ResponseStatus::RequestFailed(err.to_string()),
                    };
                    let mut update = ResponseUpdate::status(self.id, status);
                    update.extensions = std::mem::take(&mut extensions);
                    self.queue.send_response(update, None);
                    return;
                }
            }
        }
    }

    // queues the block for `link` with its metadata and returns what the
    // traversal should see for it
    async fn send_link(
        &self,
        link: Link,
        sent: &mut AHashSet<Link>,
        extensions: &mut Vec<ExtensionData>,
    ) -> Result<Result<Vec<u8>>> {
        let mut update = ResponseUpdate::status(self.id, ResponseStatus::PartialResponse);
        update.extensions = std::mem::take(extensions);
        let mut metadata = Metadata::default();

        let data = match self.store.get(&link) {
            Ok(data) if !link.verifies(&data) => {
                event!(Level::ERROR, "stored block does not match link {}", link);
                Err(GraphsyncError::Decode(format!("stored block does not match link {}", link)))
            }
            other => other,
        };
        let (result, permit) = match data {
            Ok(data) if data.len() > self.config.max_block_size() => {
                event!(
                    Level::WARN,
                    "block {} of {} bytes exceeds the message limit, reporting it missing",
                    link,
                    data.len()
                );
                metadata.push(link, false);
                (Err(GraphsyncError::NotFound(link)), None)
            }
            Ok(data) => {
                metadata.push(link, true);
                if sent.insert(link) {
                    let permit = self.queue.reserve_block_bytes(data.len()).await?;
                    update.block = Some(Block::with_link(link, data.clone()));
                    (Ok(data), Some(permit))
                } else {
                    (Ok(data), None)
                }
            }
            Err(GraphsyncError::NotFound(link)) => {
                metadata.push(link, false);
                (Err(GraphsyncError::NotFound(link)), None)
            }
            Err(err) => {
                // the traversal fails with it; the terminal status says why
                *extensions = update.extensions;
                return Ok(Err(err));
            }
        };
        update.metadata = metadata;
        self.queue.send_response(update, permit);
        Ok(result)
    }
}
