use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tracing::{event, Level};

use crate::error::Result;
use crate::extension::{set_extension, ExtensionData};
use crate::networking::message::{GraphSyncRequest, GraphSyncResponse};
use crate::networking::peer::PeerId;

pub type HookId = u64;

/// What a `RequestReceivedHook` decided about an incoming request. Requests
/// are accepted unless a hook terminates them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestReceivedHookActions {
    validated: bool,
    rejection: Option<String>,
    extensions: Vec<ExtensionData>,
}

impl RequestReceivedHookActions {
    pub fn validate_request(&mut self) {
        self.validated = true;
    }

    /// Rejects the request; the remaining hooks do not run.
    pub fn terminate_with_error(&mut self, reason: &str) {
        self.rejection = Some(reason.to_string());
    }

    /// Attaches data to the first response frame. A later call with the same
    /// name replaces the earlier data.
    pub fn send_extension_data(&mut self, extension: ExtensionData) {
        set_extension(&mut self.extensions, extension);
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    pub fn rejection(&self) -> Option<&str> {
        self.rejection.as_deref()
    }

    pub fn extensions(&self) -> &[ExtensionData] {
        &self.extensions
    }

    pub fn into_extensions(self) -> Vec<ExtensionData> {
        self.extensions
    }
}

/// Runs on the responder for every new request, before any traversal.
pub trait RequestReceivedHook: Send + Sync {
    fn on_request_received(
        &self,
        peer: PeerId,
        request: &GraphSyncRequest,
        actions: &mut RequestReceivedHookActions,
    );
}

impl<F> RequestReceivedHook for F
where
    F: Fn(PeerId, &GraphSyncRequest, &mut RequestReceivedHookActions) + Send + Sync,
{
    fn on_request_received(
        &self,
        peer: PeerId,
        request: &GraphSyncRequest,
        actions: &mut RequestReceivedHookActions,
    ) {
        self(peer, request, actions)
    }
}

/// Runs on the requestor for every response frame. An error fails the request.
pub trait ResponseReceivedHook: Send + Sync {
    fn on_response_received(&self, peer: PeerId, response: &GraphSyncResponse) -> Result<()>;
}

impl<F> ResponseReceivedHook for F
where
    F: Fn(PeerId, &GraphSyncResponse) -> Result<()> + Send + Sync,
{
    fn on_response_received(&self, peer: PeerId, response: &GraphSyncResponse) -> Result<()> {
        self(peer, response)
    }
}

/// An ordered chain of hooks.
pub struct HookRegistry<H: ?Sized> {
    hooks: RwLock<Vec<(HookId, Arc<H>)>>,
}

impl<H: ?Sized> Default for HookRegistry<H> {
    fn default() -> Self {
        HookRegistry {
            hooks: RwLock::new(vec![]),
        }
    }
}

impl<H: ?Sized> HookRegistry<H> {
    fn register(&self, id: HookId, hook: Arc<H>) {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.push((id, hook));
        }
    }

    fn unregister(&self, id: HookId) -> bool {
        match self.hooks.write() {
            Ok(mut hooks) => {
                let before = hooks.len();
                hooks.retain(|(hook_id, _)| *hook_id != id);
                hooks.len() != before
            }
            Err(_) => false,
        }
    }

    // a copy, so hooks run without the lock held
    fn snapshot(&self) -> Vec<Arc<H>> {
        self.hooks
            .read()
            .map(|hooks| hooks.iter().map(|(_, hook)| hook.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.hooks.read().map(|hooks| hooks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookKind {
    RequestReceived,
    ResponseReceived,
}

/// Both hook chains of a graphsync instance.
#[derive(Default)]
pub struct Hooks {
    next_id: AtomicU64,
    request_received: HookRegistry<dyn RequestReceivedHook>,
    response_received: HookRegistry<dyn ResponseReceivedHook>,
}

impl Hooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Hooks::default())
    }

    pub fn register_request_received_hook(
        self: &Arc<Self>,
        hook: Arc<dyn RequestReceivedHook>,
    ) -> UnregisterHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.request_received.register(id, hook);
        UnregisterHandle {
            hooks: Arc::downgrade(self),
            kind: HookKind::RequestReceived,
            id,
        }
    }

    pub fn register_response_received_hook(
        self: &Arc<Self>,
        hook: Arc<dyn ResponseReceivedHook>,
    ) -> UnregisterHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.response_received.register(id, hook);
        UnregisterHandle {
            hooks: Arc::downgrade(self),
            kind: HookKind::ResponseReceived,
            id,
        }
    }

    /// Runs the request chain in registration order, stopping at the first
    /// rejection.
    pub fn process_request(
        &self,
        peer: PeerId,
        request: &GraphSyncRequest,
    ) -> RequestReceivedHookActions {
        let mut actions = RequestReceivedHookActions::default();
        for hook in self.request_received.snapshot() {
            hook.on_request_received(peer, request, &mut actions);
            if let Some(reason) = actions.rejection() {
                event!(
                    Level::INFO,
                    "request {} from {} rejected: {}",
                    request.get_id(),
                    peer,
                    reason
                );
                break;
            }
        }
        actions
    }

    /// Runs the response chain in registration order; the first error wins.
    pub fn process_response(&self, peer: PeerId, response: &GraphSyncResponse) -> Result<()> {
        for hook in self.response_received.snapshot() {
            hook.on_response_received(peer, response)?;
        }
        Ok(())
    }
}

/// Removes a registered hook. Dropping the handle leaves the hook in place.
#[derive(Debug)]
pub struct UnregisterHandle {
    hooks: Weak<Hooks>,
    kind: HookKind,
    id: HookId,
}

impl UnregisterHandle {
    /// Returns whether the hook was still registered.
    pub fn unregister(self) -> bool {
        match self.hooks.upgrade() {
            Some(hooks) => match self.kind {
                HookKind::RequestReceived => hooks.request_received.unregister(self.id),
                HookKind::ResponseReceived => hooks.response_received.unregister(self.id),
            },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphsyncError;
    use crate::link::Link;
    use crate::networking::message::ResponseStatus;
    use crate::selector::SelectorSpecBuilder;
    use std::sync::atomic::AtomicUsize;

    fn request() -> GraphSyncRequest {
        let selector = SelectorSpecBuilder::new().matcher();
        GraphSyncRequest::new(1, Link::for_bytes(b"root"), &selector, 0, vec![]).unwrap()
    }

    #[test]
    fn rejection_short_circuits_the_chain() {
        let hooks = Hooks::new();
        let later_calls = Arc::new(AtomicUsize::new(0));
        hooks.register_request_received_hook(Arc::new(
            |_peer: PeerId, _request: &GraphSyncRequest, actions: &mut RequestReceivedHookActions| {
                actions.send_extension_data(ExtensionData::new("app/x", vec![1]));
                actions.send_extension_data(ExtensionData::new("app/x", vec![2]));
                actions.terminate_with_error("nope");
            },
        ));
        let counter = later_calls.clone();
        hooks.register_request_received_hook(Arc::new(
            move |_peer: PeerId, _request: &GraphSyncRequest, actions: &mut RequestReceivedHookActions| {
                counter.fetch_add(1, Ordering::SeqCst);
                actions.validate_request();
            },
        ));

        let actions = hooks.process_request(PeerId::from_label("peer"), &request());
        assert_eq!(actions.rejection(), Some("nope"));
        assert_eq!(actions.extensions(), &[ExtensionData::new("app/x", vec![2])]);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregistered_hooks_stop_running() {
        let hooks = Hooks::new();
        let handle = hooks.register_response_received_hook(Arc::new(
            |_peer: PeerId, _response: &GraphSyncResponse| -> Result<()> {
                Err(GraphsyncError::ValidationRejected(String::from("bad response")))
            },
        ));
        let response = GraphSyncResponse::new(1, ResponseStatus::PartialResponse, vec![]);
        let peer = PeerId::from_label("peer");
        assert!(hooks.process_response(peer, &response).is_err());
        assert!(handle.unregister());
        assert!(hooks.process_response(peer, &response).is_ok());

        let accepted = hooks.process_request(peer, &request());
        assert!(accepted.rejection().is_none());
        assert!(!accepted.is_validated());
    }
}
