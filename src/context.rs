use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::GraphsyncError;

/// Cancellation scope of a request.
///
/// Clones share the same signal: cancelling any of them cancels all. A
/// `child` scope ends whenever its parent does, but cancelling the child
/// leaves the parent running. A context created `with_timeout` also ends
/// once its deadline passes, which the request treats exactly like a cancel.
#[derive(Debug, Clone)]
pub struct RequestContext {
    own: Scope,
    ancestors: Vec<Scope>,
    deadline: Option<Instant>,
}

#[derive(Debug, Clone)]
struct Scope {
    trigger: Arc<watch::Sender<bool>>,
    signal: watch::Receiver<bool>,
}

impl Scope {
    fn new() -> Self {
        let (trigger, signal) = watch::channel(false);
        Scope {
            trigger: Arc::new(trigger),
            signal,
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.signal.borrow()
    }

    async fn cancelled(self) {
        // holding the trigger keeps `changed` from failing
        let Scope { trigger: _trigger, mut signal } = self;
        while !*signal.borrow() {
            if signal.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        RequestContext {
            own: Scope::new(),
            ancestors: vec![],
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let mut context = RequestContext::new();
        context.deadline = Some(Instant::now() + timeout);
        context
    }

    /// A nested scope with the same deadline.
    pub fn child(&self) -> RequestContext {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.own.clone());
        RequestContext {
            own: Scope::new(),
            ancestors,
            deadline: self.deadline,
        }
    }

    /// Cancels the context and its children. Calling it again has no effect.
    pub fn cancel(&self) {
        let _ = self.own.trigger.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.own.is_cancelled()
            || self.ancestors.iter().any(Scope::is_cancelled)
            || self
                .deadline
                .map(|deadline| Instant::now() >= deadline)
                .unwrap_or(false)
    }

    /// Resolves once this scope or any ancestor is cancelled or the deadline
    /// passes, with `Cancelled` or `Timeout` respectively.
    pub async fn done(&self) -> GraphsyncError {
        let scopes = std::iter::once(&self.own)
            .chain(self.ancestors.iter())
            .map(|scope| Box::pin(scope.clone().cancelled()));
        let cancelled = futures::future::select_all(scopes);
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = cancelled => GraphsyncError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => GraphsyncError::Timeout,
            },
            None => {
                cancelled.await;
                GraphsyncError::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_reaches_every_clone() {
        let context = RequestContext::new();
        let clone = context.clone();
        let waiter = tokio::spawn(async move { clone.done().await });
        assert!(!context.is_cancelled());
        context.cancel();
        context.cancel();
        assert_eq!(waiter.await.unwrap(), GraphsyncError::Cancelled);
        assert!(context.is_cancelled());
    }

    #[tokio::test]
    async fn deadline_ends_the_context() {
        let context = RequestContext::with_timeout(Duration::from_millis(10));
        assert_eq!(context.done().await, GraphsyncError::Timeout);
        assert!(context.is_cancelled());
    }

    #[tokio::test]
    async fn child_scopes_end_with_their_parent() {
        let parent = RequestContext::new();
        let first = parent.child();
        let second = parent.child();
        first.cancel();
        assert_eq!(first.done().await, GraphsyncError::Cancelled);
        assert!(!parent.is_cancelled());
        assert!(!second.is_cancelled());

        let grandchild = second.child();
        let waiter = tokio::spawn(async move { grandchild.done().await });
        parent.cancel();
        assert_eq!(waiter.await.unwrap(), GraphsyncError::Cancelled);
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn children_share_the_deadline() {
        let parent = RequestContext::with_timeout(Duration::from_millis(10));
        let child = parent.child();
        assert_eq!(child.done().await, GraphsyncError::Timeout);
        assert!(!parent.own.is_cancelled());
    }
}
