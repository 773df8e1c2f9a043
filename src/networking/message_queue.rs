use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use ahash::AHashSet;
use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{event, Level};

use crate::block::Block;
use crate::config::GraphSyncConfig;
use crate::error::{GraphsyncError, Result};
use crate::extension::{merge_extensions, set_extension, ExtensionData};
use crate::networking::message::{
    encoded_size, GraphSyncMessage, GraphSyncRequest, GraphSyncResponse, RequestId,
    ResponseStatus,
};
use crate::networking::metadata::Metadata;
use crate::networking::network::GraphSyncNetwork;
use crate::networking::peer::PeerId;

/// Reports a peer whose queue could not deliver a message.
pub type FailureSender = mpsc::UnboundedSender<(PeerId, GraphsyncError)>;

/// One status update for a response, optionally carrying the block that the
/// update's metadata refers to.
#[derive(Debug, Clone)]
pub struct ResponseUpdate {
    pub id: RequestId,
    pub status: ResponseStatus,
    pub metadata: Metadata,
    pub extensions: Vec<ExtensionData>,
    pub block: Option<Block>,
}

impl ResponseUpdate {
    pub fn status(id: RequestId, status: ResponseStatus) -> Self {
        ResponseUpdate {
            id,
            status,
            metadata: Metadata::default(),
            extensions: vec![],
            block: None,
        }
    }
}

#[derive(Debug)]
enum QueueItem {
    Request(GraphSyncRequest),
    Response(ResponseUpdate, Option<OwnedSemaphorePermit>),
    StartResponse(RequestId),
    CancelResponse(RequestId),
    Shutdown,
}

enum Pending {
    Request(GraphSyncRequest),
    Response {
        update: ResponseUpdate,
        permit: Option<OwnedSemaphorePermit>,
        size: usize,
    },
}

impl Pending {
    fn size(&self) -> usize {
        match self {
            Pending::Request(request) => encoded_size(request),
            Pending::Response { size, .. } => *size,
        }
    }
}

/// Outgoing traffic to one peer.
///
/// Handles are cheap to clone; all of them feed a single worker task that
/// packs queued items into messages no larger than the configured maximum
/// and is the only writer to the network for this peer.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    peer: PeerId,
    sender: mpsc::UnboundedSender<QueueItem>,
    block_permits: Arc<Semaphore>,
    permit_capacity: usize,
}

impl MessageQueue {
    pub fn new(
        peer: PeerId,
        network: Arc<dyn GraphSyncNetwork>,
        config: GraphSyncConfig,
        failures: FailureSender,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let block_permits = Arc::new(Semaphore::new(config.max_pending_block_bytes));
        let permit_capacity = config.max_pending_block_bytes;
        let worker = QueueWorker {
            peer,
            network,
            config,
            failures,
            block_permits: block_permits.clone(),
            pending: VecDeque::new(),
            cancelled: AHashSet::new(),
        };
        tokio::spawn(worker.run(receiver));
        MessageQueue {
            peer,
            sender,
            block_permits,
            permit_capacity,
        }
    }

    pub fn get_peer(&self) -> PeerId {
        self.peer
    }

    pub fn send_request(&self, request: GraphSyncRequest) {
        self.push(QueueItem::Request(request));
    }

    /// Waits until `size` more block bytes may be queued for this peer.
    /// Blocks larger than the whole allowance wait for an empty queue.
    pub async fn reserve_block_bytes(&self, size: usize) -> Result<OwnedSemaphorePermit> {
        let permits = size.min(self.permit_capacity).max(1) as u32;
        self.block_permits
            .clone()
            .acquire_many_owned(permits)
            .await
            .map_err(|_| GraphsyncError::Connection(format!("queue for {} is closed", self.peer)))
    }

    pub fn send_response(&self, update: ResponseUpdate, permit: Option<OwnedSemaphorePermit>) {
        self.push(QueueItem::Response(update, permit));
    }

    /// Accepts updates for `id` again after an earlier cancel.
    pub fn start_response(&self, id: RequestId) {
        self.push(QueueItem::StartResponse(id));
    }

    /// Drops every queued, unsent item of the response `id` and any update
    /// for it that arrives before the next `start_response`.
    pub fn cancel_response(&self, id: RequestId) {
        self.push(QueueItem::CancelResponse(id));
    }

    pub fn shutdown(&self) {
        self.push(QueueItem::Shutdown);
    }

    fn push(&self, item: QueueItem) {
        if self.sender.send(item).is_err() {
            event!(Level::DEBUG, "message queue for {} already shut down", self.peer);
        }
    }
}

struct QueueWorker {
    peer: PeerId,
    network: Arc<dyn GraphSyncNetwork>,
    config: GraphSyncConfig,
    failures: FailureSender,
    block_permits: Arc<Semaphore>,
    pending: VecDeque<Pending>,
    cancelled: AHashSet<RequestId>,
}

impl QueueWorker {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<QueueItem>) {
        'outer: while let Some(item) = receiver.recv().await {
            if !self.apply(item) {
                break;
            }
            loop {
                while let Ok(item) = receiver.try_recv() {
                    if !self.apply(item) {
                        break 'outer;
                    }
                }
                if self.pending.is_empty() {
                    break;
                }
                self.flush_one().await;
            }
        }
        self.block_permits.close();
        event!(Level::DEBUG, "message queue for {} stopped", self.peer);
    }

    // returns false when the queue should stop
    fn apply(&mut self, item: QueueItem) -> bool {
        match item {
            QueueItem::Request(request) => {
                let id = request.get_id();
                self.pending.retain(|pending| match pending {
                    Pending::Request(queued) => queued.get_id() != id,
                    _ => true,
                });
                self.pending.push_back(Pending::Request(request));
            }
            QueueItem::Response(update, _) if self.cancelled.contains(&update.id) => {
                event!(Level::TRACE, "dropping update for cancelled response {}", update.id);
            }
            QueueItem::Response(update, permit) => {
                let size = response_size(&update);
                self.pending.push_back(Pending::Response {
                    update,
                    permit,
                    size,
                });
            }
            QueueItem::StartResponse(id) => {
                self.cancelled.remove(&id);
            }
            QueueItem::CancelResponse(id) => {
                self.cancelled.insert(id);
                self.pending.retain(|pending| match pending {
                    Pending::Response { update, .. } => update.id != id,
                    _ => true,
                });
            }
            QueueItem::Shutdown => return false,
        }
        true
    }

    async fn flush_one(&mut self) {
        let (message, permits) = self.build_message();
        if message.is_empty() {
            return;
        }
        event!(
            Level::TRACE,
            "sending {} requests, {} responses, {} blocks to {}",
            message.get_requests().len(),
            message.get_responses().len(),
            message.get_blocks().len(),
            self.peer
        );
        if let Err(err) = self.network.send_message(self.peer, message).await {
            event!(Level::WARN, "failed to send message to {}: {}", self.peer, err);
            self.pending.clear();
            let _ = self.failures.send((self.peer, err));
        }
        drop(permits);
    }

    fn build_message(&mut self) -> (GraphSyncMessage, Vec<OwnedSemaphorePermit>) {
        let budget = self.config.block_budget();
        let mut used = 0;
        let mut requests = vec![];
        let mut responses: Vec<(RequestId, ResponseStatus, Metadata, Vec<ExtensionData>)> = vec![];
        let mut blocks = vec![];
        let mut sent_links = AHashSet::new();
        let mut permits = vec![];

        while let Some(front) = self.pending.front() {
            let size = front.size();
            if used > 0 && used + size > budget {
                break;
            }
            used += size;
            match self.pending.pop_front() {
                Some(Pending::Request(request)) => requests.push(request),
                Some(Pending::Response { update, permit, .. }) => {
                    if let Some(block) = update.block {
                        if sent_links.insert(*block.get_link()) {
                            blocks.push(block);
                        }
                    }
                    match responses.iter_mut().find(|(id, ..)| *id == update.id) {
                        Some((_, status, metadata, extensions)) => {
                            *status = update.status;
                            metadata.append(update.metadata);
                            merge_extensions(extensions, update.extensions);
                        }
                        None => responses.push((
                            update.id,
                            update.status,
                            update.metadata,
                            update.extensions,
                        )),
                    }
                    permits.extend(permit);
                }
                None => break,
            }
        }

        let responses = responses
            .into_iter()
            .map(|(id, status, metadata, mut extensions)| {
                if !metadata.is_empty() {
                    match metadata.to_extension() {
                        Ok(extension) => set_extension(&mut extensions, extension),
                        Err(err) => event!(Level::ERROR, "could not encode metadata: {}", err),
                    }
                }
                GraphSyncResponse::new(id, status, extensions)
            })
            .collect();
        (GraphSyncMessage::new(requests, responses, blocks), permits)
    }
}

fn response_size(update: &ResponseUpdate) -> usize {
    let mut extensions = update.extensions.clone();
    if let Ok(extension) = update.metadata.to_extension() {
        extensions.push(extension);
    }
    let record = GraphSyncResponse::new(update.id, update.status.clone(), extensions);
    let block_size = update.block.as_ref().map(encoded_size).unwrap_or(0);
    encoded_size(&record) + block_size
}

pub type MessageQueues = Arc<RwLock<HashMap<PeerId, MessageQueue>>>;

/// Owns the message queue of every peer we talk to.
#[derive(Clone)]
pub struct PeerMessageManager {
    queues: MessageQueues,
    network: Arc<dyn GraphSyncNetwork>,
    config: GraphSyncConfig,
    failures: FailureSender,
}

impl PeerMessageManager {
    pub fn new(
        network: Arc<dyn GraphSyncNetwork>,
        config: GraphSyncConfig,
        failures: FailureSender,
    ) -> Self {
        PeerMessageManager {
            queues: Arc::new(RwLock::new(HashMap::new())),
            network,
            config,
            failures,
        }
    }

    /// The queue for `peer`, created on first use.
    pub async fn queue(&self, peer: PeerId) -> MessageQueue {
        if let Some(queue) = self.queues.read().await.get(&peer) {
            return queue.clone();
        }
        let mut queues = self.queues.write().await;
        queues
            .entry(peer)
            .or_insert_with(|| {
                event!(Level::DEBUG, "opening message queue for {}", peer);
                MessageQueue::new(
                    peer,
                    self.network.clone(),
                    self.config.clone(),
                    self.failures.clone(),
                )
            })
            .clone()
    }

    /// Stops and forgets the queue for `peer`. Unsent items are dropped.
    pub async fn disconnect(&self, peer: PeerId) {
        if let Some(queue) = self.queues.write().await.remove(&peer) {
            queue.shutdown();
        }
    }

    pub async fn shutdown(&self) {
        let mut queues = self.queues.write().await;
        for (_, queue) in queues.drain() {
            queue.shutdown();
        }
    }
}
