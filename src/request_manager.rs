use std::collections::HashMap;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::block::Block;
use crate::config::GraphSyncConfig;
use crate::context::RequestContext;
use crate::error::{GraphsyncError, Result};
use crate::extension::ExtensionData;
use crate::hooks::Hooks;
use crate::link::Link;
use crate::networking::message::{
    GraphSyncRequest, GraphSyncResponse, Priority, RequestId, ResponseStatus,
};
use crate::networking::message_queue::PeerMessageManager;
use crate::networking::peer::PeerId;
use crate::node::Node;
use crate::selector::Selector;
use crate::storage::BlockStore;
use crate::stream::{response_channel, ErrorStream, ResponseProgressStream, ResponseSender};
use crate::traversal::{TraversalOutcome, TraversalStep, Traverser};

/// Protocol violations observed by a manager, for per-peer accounting.
pub type ProtocolErrorSender = mpsc::UnboundedSender<(PeerId, GraphsyncError)>;

type LoadReply = oneshot::Sender<Result<Vec<u8>>>;

#[derive(Debug)]
pub enum RequestManagerMessage {
    NewRequest {
        context: RequestContext,
        peer: PeerId,
        root: Link,
        selector: Node,
        priority: Priority,
        extensions: Vec<ExtensionData>,
        reply: oneshot::Sender<(ResponseProgressStream, ErrorStream)>,
    },
    ProcessResponses {
        peer: PeerId,
        responses: Vec<GraphSyncResponse>,
        blocks: Vec<Block>,
    },
    Load {
        id: RequestId,
        link: Link,
        reply: LoadReply,
    },
    TraversalFinished {
        id: RequestId,
        failed: bool,
    },
    CancelRequest {
        id: RequestId,
    },
    PeerFailed {
        peer: PeerId,
        err: GraphsyncError,
    },
}

/// Cheap handle to the requestor side of graphsync.
#[derive(Debug, Clone)]
pub struct RequestManagerHandle {
    sender: mpsc::UnboundedSender<RequestManagerMessage>,
}

impl RequestManagerHandle {
    /// Starts a request at the default priority and returns its two streams.
    pub async fn request(
        &self,
        context: RequestContext,
        peer: PeerId,
        root: Link,
        selector: Node,
        extensions: Vec<ExtensionData>,
    ) -> Result<(ResponseProgressStream, ErrorStream)> {
        self.request_with_priority(context, peer, root, selector, 0, extensions)
            .await
    }

    /// Starts a request the responder should rank by `priority`, higher first.
    pub async fn request_with_priority(
        &self,
        context: RequestContext,
        peer: PeerId,
        root: Link,
        selector: Node,
        priority: Priority,
        extensions: Vec<ExtensionData>,
    ) -> Result<(ResponseProgressStream, ErrorStream)> {
        let (reply, streams) = oneshot::channel();
        self.send(RequestManagerMessage::NewRequest {
            context,
            peer,
            root,
            selector,
            priority,
            extensions,
            reply,
        })?;
        streams
            .await
            .map_err(|_| GraphsyncError::Connection(String::from("request manager stopped")))
    }

    pub fn process_responses(
        &self,
        peer: PeerId,
        responses: Vec<GraphSyncResponse>,
        blocks: Vec<Block>,
    ) -> Result<()> {
        self.send(RequestManagerMessage::ProcessResponses {
            peer,
            responses,
            blocks,
        })
    }

    /// Fails every request in flight to `peer`.
    pub fn peer_failed(&self, peer: PeerId, err: GraphsyncError) -> Result<()> {
        self.send(RequestManagerMessage::PeerFailed { peer, err })
    }

    fn send(&self, message: RequestManagerMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| GraphsyncError::Connection(String::from("request manager stopped")))
    }
}

struct CachedBlock {
    data: Vec<u8>,
    // live requests this block arrived for
    requests: AHashSet<RequestId>,
}

struct InProgressRequest {
    peer: PeerId,
    task: JoinHandle<()>,
    termination: Option<oneshot::Sender<GraphsyncError>>,
    remote_status: Option<ResponseStatus>,
    missing: AHashSet<Link>,
    loaded: AHashSet<Link>,
    waiting: AHashMap<Link, Vec<LoadReply>>,
}

/// Owns every outgoing request. Runs as a single task fed through
/// `RequestManagerHandle`; traversals run in their own tasks and reach the
/// manager only to load blocks and to report that they finished.
pub struct RequestManager {
    receiver: mpsc::UnboundedReceiver<RequestManagerMessage>,
    sender: mpsc::UnboundedSender<RequestManagerMessage>,
    requests: HashMap<RequestId, InProgressRequest>,
    blocks: AHashMap<Link, CachedBlock>,
    next_id: RequestId,
    store: Arc<dyn BlockStore>,
    queues: PeerMessageManager,
    hooks: Arc<Hooks>,
    config: GraphSyncConfig,
    protocol_errors: ProtocolErrorSender,
}

impl RequestManager {
    pub fn new(
        store: Arc<dyn BlockStore>,
        queues: PeerMessageManager,
        hooks: Arc<Hooks>,
        config: GraphSyncConfig,
        protocol_errors: ProtocolErrorSender,
    ) -> (RequestManager, RequestManagerHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let manager = RequestManager {
            receiver,
            sender: sender.clone(),
            requests: HashMap::new(),
            blocks: AHashMap::new(),
            next_id: 0,
            store,
            queues,
            hooks,
            config,
            protocol_errors,
        };
        (manager, RequestManagerHandle { sender })
    }

    pub async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            self.handle(message).await;
        }
        for (_, request) in self.requests.drain() {
            request.task.abort();
        }
        event!(Level::DEBUG, "request manager stopped");
    }

    async fn handle(&mut self, message: RequestManagerMessage) {
        match message {
            RequestManagerMessage::NewRequest {
                context,
                peer,
                root,
                selector,
                priority,
                extensions,
                reply,
            } => {
                let streams = self
                    .new_request(context, peer, root, selector, priority, extensions)
                    .await;
                if reply.send(streams).is_err() {
                    event!(Level::DEBUG, "requester went away before receiving its streams");
                }
            }
            RequestManagerMessage::ProcessResponses {
                peer,
                responses,
                blocks,
            } => self.process_responses(peer, responses, blocks).await,
            RequestManagerMessage::Load { id, link, reply } => self.load(id, link, reply),
            RequestManagerMessage::TraversalFinished { id, failed } => {
                if let Some(request) = self.remove_request(id) {
                    if failed && request.remote_status.is_none() {
                        self.queues
                            .queue(request.peer)
                            .await
                            .send_request(GraphSyncRequest::cancel(id));
                    }
                }
            }
            RequestManagerMessage::CancelRequest { id } => {
                if let Some(request) = self.remove_request(id) {
                    event!(Level::DEBUG, "request {} cancelled locally", id);
                    request.task.abort();
                    if request.remote_status.is_none() {
                        self.queues
                            .queue(request.peer)
                            .await
                            .send_request(GraphSyncRequest::cancel(id));
                    }
                }
            }
            RequestManagerMessage::PeerFailed { peer, err } => {
                let ids: Vec<RequestId> = self
                    .requests
                    .iter()
                    .filter(|(_, request)| request.peer == peer)
                    .map(|(id, _)| *id)
                    .collect();
                for id in ids {
                    self.terminate(id, err.clone());
                }
            }
        }
    }

    fn allocate_id(&mut self) -> RequestId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.requests.contains_key(&id) {
                return id;
            }
        }
    }

    async fn new_request(
        &mut self,
        context: RequestContext,
        peer: PeerId,
        root: Link,
        selector_node: Node,
        priority: Priority,
        extensions: Vec<ExtensionData>,
    ) -> (ResponseProgressStream, ErrorStream) {
        // dropping the stream cancels this request only, never the caller's context
        let context = context.child();
        let (sender, responses, errors) =
            response_channel(self.config.result_buffer, context.clone());
        let selector = match Selector::parse(&selector_node) {
            Ok(selector) => selector,
            Err(err) => {
                sender.fail(err);
                return (responses, errors);
            }
        };
        let id = self.allocate_id();
        let request = match GraphSyncRequest::new(id, root, &selector_node, priority, extensions) {
            Ok(request) => request,
            Err(err) => {
                sender.fail(err);
                return (responses, errors);
            }
        };
        event!(Level::DEBUG, "request {} for {} to {}", id, root, peer);
        self.queues.queue(peer).await.send_request(request);

        let (termination_tx, termination_rx) = oneshot::channel();
        let task = tokio::spawn(run_traversal(
            id,
            root,
            selector,
            context,
            sender,
            termination_rx,
            self.sender.clone(),
        ));
        self.requests.insert(
            id,
            InProgressRequest {
                peer,
                task,
                termination: Some(termination_tx),
                remote_status: None,
                missing: AHashSet::new(),
                loaded: AHashSet::new(),
                waiting: AHashMap::new(),
            },
        );
        (responses, errors)
    }

    async fn process_responses(
        &mut self,
        peer: PeerId,
        responses: Vec<GraphSyncResponse>,
        blocks: Vec<Block>,
    ) {
        let live: AHashSet<RequestId> = responses
            .iter()
            .map(|response| response.get_id())
            .filter(|id| {
                self.requests
                    .get(id)
                    .map(|request| request.peer == peer)
                    .unwrap_or(false)
            })
            .collect();

        for block in blocks {
            if live.is_empty() {
                break;
            }
            let link = *block.get_link();
            let entry = self.blocks.entry(link).or_insert_with(|| CachedBlock {
                data: block.into_data(),
                requests: AHashSet::new(),
            });
            entry.requests.extend(live.iter().copied());
            for id in live.iter() {
                let waiters = match self.requests.get_mut(id) {
                    Some(request) => request.waiting.remove(&link),
                    None => None,
                };
                for reply in waiters.unwrap_or_default() {
                    self.load(*id, link, reply);
                }
            }
        }

        for response in responses {
            self.process_response(peer, response).await;
        }
    }

    async fn process_response(&mut self, peer: PeerId, response: GraphSyncResponse) {
        let id = response.get_id();
        match self.requests.get(&id) {
            None => {
                event!(Level::DEBUG, "response for finished request {} from {}", id, peer);
                return;
            }
            Some(request) if request.peer != peer => {
                let _ = self.protocol_errors.send((
                    peer,
                    GraphsyncError::Protocol(format!("response for request {} of another peer", id)),
                ));
                return;
            }
            Some(_) => {}
        }

        if let Err(err) = self.hooks.process_response(peer, &response) {
            event!(Level::INFO, "response hook failed request {}: {}", id, err);
            self.terminate(id, err);
            self.queues
                .queue(peer)
                .await
                .send_request(GraphSyncRequest::cancel(id));
            return;
        }

        match response.metadata() {
            Ok(Some(metadata)) => {
                let missing: Vec<Link> = metadata.missing().copied().collect();
                if let Some(request) = self.requests.get_mut(&id) {
                    for link in missing {
                        request.missing.insert(link);
                        for reply in request.waiting.remove(&link).unwrap_or_default() {
                            let _ = reply.send(Err(GraphsyncError::NotFound(link)));
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                let _ = self.protocol_errors.send((peer, err));
            }
        }

        let status = response.get_status().clone();
        if !status.is_terminal() {
            return;
        }
        match status {
            ResponseStatus::RequestFailed(reason) => {
                self.terminate(id, GraphsyncError::RequestFailed(reason));
            }
            ResponseStatus::RequestCancelled => {
                self.terminate(
                    id,
                    GraphsyncError::RequestFailed(String::from("cancelled by responder")),
                );
            }
            status => {
                if let Some(request) = self.requests.get_mut(&id) {
                    request.remote_status = Some(status);
                    // nothing more will arrive for this request
                    for (link, replies) in request.waiting.drain() {
                        for reply in replies {
                            let _ = reply.send(Err(GraphsyncError::NotFound(link)));
                        }
                    }
                }
            }
        }
    }

    fn load(&mut self, id: RequestId, link: Link, reply: LoadReply) {
        let request = match self.requests.get_mut(&id) {
            Some(request) => request,
            None => return,
        };

        if request.loaded.contains(&link) {
            let _ = reply.send(self.store.get(&link));
            return;
        }

        if let Some(cached) = self.blocks.get_mut(&link) {
            if cached.requests.remove(&id) {
                let data = if cached.requests.is_empty() {
                    self.blocks
                        .remove(&link)
                        .map(|cached| cached.data)
                        .unwrap_or_default()
                } else {
                    cached.data.clone()
                };
                let result = if link.verifies(&data) {
                    self.store.put(data.clone()).map(|_| data)
                } else {
                    Err(GraphsyncError::Decode(format!("block does not match link {}", link)))
                };
                if result.is_ok() {
                    request.loaded.insert(link);
                }
                let _ = reply.send(result);
                return;
            }
        }

        if request.missing.contains(&link) || request.remote_status.is_some() {
            let _ = reply.send(Err(GraphsyncError::NotFound(link)));
            return;
        }

        request.waiting.entry(link).or_default().push(reply);
    }

    // ends a request with a single terminal error delivered by its task
    fn terminate(&mut self, id: RequestId, err: GraphsyncError) {
        if let Some(mut request) = self.remove_request(id) {
            match request.termination.take() {
                Some(termination) => {
                    if termination.send(err).is_err() {
                        request.task.abort();
                    }
                }
                None => request.task.abort(),
            }
        }
    }

    fn remove_request(&mut self, id: RequestId) -> Option<InProgressRequest> {
        let request = self.requests.remove(&id)?;
        self.blocks.retain(|_, cached| {
            cached.requests.remove(&id);
            !cached.requests.is_empty()
        });
        Some(request)
    }
}

async fn run_traversal(
    id: RequestId,
    root: Link,
    selector: Selector,
    context: RequestContext,
    sender: ResponseSender,
    mut termination: oneshot::Receiver<GraphsyncError>,
    manager: mpsc::UnboundedSender<RequestManagerMessage>,
) {
    let mut traverser = Traverser::new(root, selector);
    loop {
        match traverser.advance() {
            TraversalStep::Progress(progress) => {
                tokio::select! {
                    sent = sender.send_progress(progress) => {
                        if !sent {
                            let _ = manager.send(RequestManagerMessage::CancelRequest { id });
                            return;
                        }
                    }
                    terminated = &mut termination => {
                        conclude(sender, terminated);
                        return;
                    }
                    _ = context.done() => {
                        let _ = manager.send(RequestManagerMessage::CancelRequest { id });
                        return;
                    }
                }
            }
            TraversalStep::NeedLink(link) => {
                let (reply, loaded) = oneshot::channel();
                if manager
                    .send(RequestManagerMessage::Load { id, link, reply })
                    .is_err()
                {
                    return;
                }
                tokio::select! {
                    result = loaded => match result {
                        Ok(result) => traverser.load(result),
                        Err(_) => {
                            // the manager dropped the load: the request is over
                            conclude(sender, (&mut termination).await);
                            return;
                        }
                    },
                    terminated = &mut termination => {
                        conclude(sender, terminated);
                        return;
                    }
                    _ = context.done() => {
                        let _ = manager.send(RequestManagerMessage::CancelRequest { id });
                        return;
                    }
                }
            }
            TraversalStep::Done(outcome) => {
                let failed = matches!(outcome, TraversalOutcome::Failed(_));
                match outcome {
                    TraversalOutcome::CompletedFull => {
                        sender.finish(ResponseStatus::RequestCompletedFull)
                    }
                    TraversalOutcome::CompletedPartial { missing } => {
                        event!(Level::DEBUG, "request {} missing {} links", id, missing.len());
                        sender.finish(ResponseStatus::RequestCompletedPartial)
                    }
                    TraversalOutcome::Failed(err) => sender.fail(err),
                }
                let _ = manager.send(RequestManagerMessage::TraversalFinished { id, failed });
                return;
            }
        }
    }
}

fn conclude(sender: ResponseSender, terminated: std::result::Result<GraphsyncError, oneshot::error::RecvError>) {
    match terminated {
        Ok(err) => sender.fail(err),
        // dropped without a reason: close uncleanly
        Err(_) => drop(sender),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::memory::MemoryNetwork;
    use crate::networking::metadata::Metadata;
    use crate::networking::network::GraphSyncNetwork;
    use crate::storage::MemoryStore;
    use crate::test_utilities::mocks::{ReceiverEvents, RecordingReceiver};
    use crate::test_utilities::test_manager::{
        collect_responses, verify_empty_errors, verify_empty_response,
        verify_single_terminal_error, RandomBytes, TestBlockChain,
    };

    struct Fixture {
        requests: RequestManagerHandle,
        store: Arc<MemoryStore>,
        remote: PeerId,
        events: ReceiverEvents,
        protocol_errors: mpsc::UnboundedReceiver<(PeerId, GraphsyncError)>,
        chain: TestBlockChain,
    }

    async fn fixture() -> Fixture {
        let config = GraphSyncConfig::default();
        let network = MemoryNetwork::new(config.max_decode_size);
        let local = network.add_node().await;
        let remote = network.add_node().await;
        let (receiver, events) = RecordingReceiver::new();
        remote.set_delegate(Arc::new(receiver));

        let store = Arc::new(MemoryStore::new());
        let (failures, _) = mpsc::unbounded_channel();
        let (protocol_tx, protocol_errors) = mpsc::unbounded_channel();
        let queues = PeerMessageManager::new(local, config.clone(), failures);
        let (manager, requests) =
            RequestManager::new(store.clone(), queues, Hooks::new(), config, protocol_tx);
        tokio::spawn(manager.run());

        let chain =
            TestBlockChain::setup(&MemoryStore::new(), &mut RandomBytes::new(11), 64, 5).unwrap();
        Fixture {
            requests,
            store,
            remote: remote.local_peer(),
            events,
            protocol_errors,
            chain,
        }
    }

    // starts a request for the fixture chain and returns the id the remote saw
    async fn start(fixture: &mut Fixture) -> (RequestId, ResponseProgressStream, ErrorStream) {
        let (responses, errors) = fixture
            .requests
            .request(
                RequestContext::new(),
                fixture.remote,
                fixture.chain.tip_link,
                fixture.chain.selector(),
                vec![],
            )
            .await
            .unwrap();
        let (_, message) = fixture.events.message().await;
        (message.get_requests()[0].get_id(), responses, errors)
    }

    #[tokio::test]
    async fn received_blocks_are_verified_and_stored() {
        let mut fixture = fixture().await;
        let (id, mut responses, mut errors) = start(&mut fixture).await;

        let mut metadata = Metadata::default();
        for block in fixture.chain.blocks().unwrap() {
            metadata.push(*block.get_link(), true);
        }
        let response = GraphSyncResponse::new(
            id,
            ResponseStatus::RequestCompletedFull,
            vec![metadata.to_extension().unwrap()],
        );
        fixture
            .requests
            .process_responses(fixture.remote, vec![response], fixture.chain.blocks().unwrap())
            .unwrap();

        let collected = collect_responses(&mut responses).await;
        verify_empty_errors(&mut errors).await;
        fixture.chain.verify_whole_chain(&collected);
        assert_eq!(errors.terminal_status(), Some(ResponseStatus::RequestCompletedFull));
        assert_eq!(fixture.store.len(), 5);
    }

    #[tokio::test]
    async fn blocks_missing_from_a_finished_response_complete_partial() {
        let mut fixture = fixture().await;
        let (id, mut responses, mut errors) = start(&mut fixture).await;

        let blocks: Vec<Block> = fixture.chain.blocks().unwrap().into_iter().take(2).collect();
        let response = GraphSyncResponse::new(id, ResponseStatus::RequestCompletedFull, vec![]);
        fixture
            .requests
            .process_responses(fixture.remote, vec![response], blocks)
            .unwrap();

        let collected = collect_responses(&mut responses).await;
        verify_empty_errors(&mut errors).await;
        fixture.chain.verify_response_range(&collected, 0, 2);
        assert_eq!(errors.terminal_status(), Some(ResponseStatus::RequestCompletedPartial));
    }

    #[tokio::test]
    async fn corrupt_blocks_are_rejected() {
        let mut fixture = fixture().await;
        let (id, mut responses, mut errors) = start(&mut fixture).await;

        let forged = Block::with_link(fixture.chain.tip_link, vec![1, 2, 3]);
        let response = GraphSyncResponse::new(id, ResponseStatus::PartialResponse, vec![]);
        fixture
            .requests
            .process_responses(fixture.remote, vec![response], vec![forged])
            .unwrap();

        verify_empty_response(&mut responses).await;
        let err = verify_single_terminal_error(&mut errors).await;
        assert!(matches!(err, GraphsyncError::Decode(_)));
        assert!(fixture.store.is_empty());
    }

    #[tokio::test]
    async fn remote_failure_ends_the_request() {
        let mut fixture = fixture().await;
        let (id, mut responses, mut errors) = start(&mut fixture).await;

        let response = GraphSyncResponse::new(
            id,
            ResponseStatus::RequestFailed(String::from("nope")),
            vec![],
        );
        fixture
            .requests
            .process_responses(fixture.remote, vec![response], vec![])
            .unwrap();

        verify_empty_response(&mut responses).await;
        let err = verify_single_terminal_error(&mut errors).await;
        assert_eq!(err, GraphsyncError::RequestFailed(String::from("nope")));
    }

    #[tokio::test]
    async fn responses_from_another_peer_are_protocol_errors() {
        let mut fixture = fixture().await;
        let (id, _responses, _errors) = start(&mut fixture).await;

        let stranger = PeerId::from_label("stranger");
        let response = GraphSyncResponse::new(id, ResponseStatus::RequestCompletedFull, vec![]);
        fixture
            .requests
            .process_responses(stranger, vec![response], vec![])
            .unwrap();

        let (peer, err) = fixture.protocol_errors.recv().await.unwrap();
        assert_eq!(peer, stranger);
        assert!(matches!(err, GraphsyncError::Protocol(_)));
    }

    #[tokio::test]
    async fn peer_failure_fails_its_requests() {
        let mut fixture = fixture().await;
        let (_, mut responses, mut errors) = start(&mut fixture).await;

        fixture
            .requests
            .peer_failed(fixture.remote, GraphsyncError::Connection(String::from("gone")))
            .unwrap();

        verify_empty_response(&mut responses).await;
        let err = verify_single_terminal_error(&mut errors).await;
        assert_eq!(err, GraphsyncError::Connection(String::from("gone")));
    }

    #[tokio::test]
    async fn dropping_the_stream_sends_a_cancel() {
        let mut fixture = fixture().await;
        let (id, responses, errors) = start(&mut fixture).await;
        drop(responses);
        drop(errors);

        let (_, message) = fixture.events.message().await;
        let cancel = &message.get_requests()[0];
        assert!(cancel.is_cancel());
        assert_eq!(cancel.get_id(), id);
    }

    #[tokio::test]
    async fn blocks_arriving_out_of_order_are_delivered_in_visitation_order() {
        let mut fixture = fixture().await;
        let (id, mut responses, mut errors) = start(&mut fixture).await;

        // genesis first, one block per message
        let mut blocks = fixture.chain.blocks().unwrap();
        blocks.reverse();
        for block in blocks {
            let response = GraphSyncResponse::new(id, ResponseStatus::PartialResponse, vec![]);
            fixture
                .requests
                .process_responses(fixture.remote, vec![response], vec![block])
                .unwrap();
        }
        let response = GraphSyncResponse::new(id, ResponseStatus::RequestCompletedFull, vec![]);
        fixture
            .requests
            .process_responses(fixture.remote, vec![response], vec![])
            .unwrap();

        let collected = collect_responses(&mut responses).await;
        verify_empty_errors(&mut errors).await;
        fixture.chain.verify_whole_chain(&collected);
        assert_eq!(errors.terminal_status(), Some(ResponseStatus::RequestCompletedFull));
        assert_eq!(fixture.store.len(), 5);
    }
}
