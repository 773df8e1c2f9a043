use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::context::RequestContext;
use crate::error::GraphsyncError;
use crate::networking::message::ResponseStatus;
use crate::traversal::ResponseProgress;

type TerminalMarker = Arc<OnceLock<ResponseStatus>>;

/// Visited nodes of one request, in traversal order.
///
/// Dropping the stream before the request finished cancels the request.
pub struct ResponseProgressStream {
    inner: ReceiverStream<ResponseProgress>,
    terminal: TerminalMarker,
    context: RequestContext,
}

impl ResponseProgressStream {
    /// The status the request ended with. `None` once the stream has closed
    /// means it closed uncleanly, which only local cancellation causes.
    pub fn terminal_status(&self) -> Option<ResponseStatus> {
        self.terminal.get().cloned()
    }
}

impl Stream for ResponseProgressStream {
    type Item = ResponseProgress;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl fmt::Debug for ResponseProgressStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseProgressStream")
            .field("terminal", &self.terminal.get())
            .finish()
    }
}

impl Drop for ResponseProgressStream {
    fn drop(&mut self) {
        if self.terminal.get().is_none() {
            self.context.cancel();
        }
    }
}

/// Whole-request errors. Yields at most one error, then closes together with
/// the progress stream.
pub struct ErrorStream {
    inner: ReceiverStream<GraphsyncError>,
    terminal: TerminalMarker,
}

impl ErrorStream {
    pub fn terminal_status(&self) -> Option<ResponseStatus> {
        self.terminal.get().cloned()
    }
}

impl fmt::Debug for ErrorStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorStream")
            .field("terminal", &self.terminal.get())
            .finish()
    }
}

impl Stream for ErrorStream {
    type Item = GraphsyncError;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// The producing end of a request's two streams.
#[derive(Debug)]
pub struct ResponseSender {
    progress: mpsc::Sender<ResponseProgress>,
    errors: mpsc::Sender<GraphsyncError>,
    terminal: TerminalMarker,
}

impl ResponseSender {
    /// Waits for room in the stream. Returns false if the caller dropped it.
    pub async fn send_progress(&self, progress: ResponseProgress) -> bool {
        self.progress.send(progress).await.is_ok()
    }

    /// Records the terminal status and closes both streams.
    pub fn finish(self, status: ResponseStatus) {
        let _ = self.terminal.set(status);
    }

    /// Delivers the single terminal error, then closes both streams.
    pub fn fail(self, err: GraphsyncError) {
        let _ = self.errors.try_send(err.clone());
        let _ = self.terminal.set(ResponseStatus::RequestFailed(err.to_string()));
    }

    pub fn is_closed(&self) -> bool {
        self.progress.is_closed()
    }
}

/// Creates the streams for one request. `buffer` bounds undelivered results;
/// a full buffer suspends the producer.
pub fn response_channel(
    buffer: usize,
    context: RequestContext,
) -> (ResponseSender, ResponseProgressStream, ErrorStream) {
    let (progress_tx, progress_rx) = mpsc::channel(buffer.max(1));
    let (error_tx, error_rx) = mpsc::channel(1);
    let terminal: TerminalMarker = Arc::new(OnceLock::new());
    (
        ResponseSender {
            progress: progress_tx,
            errors: error_tx,
            terminal: terminal.clone(),
        },
        ResponseProgressStream {
            inner: ReceiverStream::new(progress_rx),
            terminal: terminal.clone(),
            context,
        },
        ErrorStream {
            inner: ReceiverStream::new(error_rx),
            terminal,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::path::Path;
    use futures::StreamExt;

    fn progress() -> ResponseProgress {
        ResponseProgress {
            node: Node::Null,
            path: Path::new(),
            last_block: None,
        }
    }

    #[tokio::test]
    async fn failure_yields_one_error_then_closes() {
        let (sender, mut responses, mut errors) = response_channel(4, RequestContext::new());
        assert!(sender.send_progress(progress()).await);
        sender.fail(GraphsyncError::RequestFailed(String::from("gone")));
        assert_eq!(responses.next().await, Some(progress()));
        assert_eq!(responses.next().await, None);
        assert!(matches!(errors.next().await, Some(GraphsyncError::RequestFailed(_))));
        assert_eq!(errors.next().await, None);
        assert!(matches!(
            errors.terminal_status(),
            Some(ResponseStatus::RequestFailed(_))
        ));
    }

    #[tokio::test]
    async fn unclean_close_has_no_terminal_status() {
        let context = RequestContext::new();
        let (sender, responses, mut errors) = response_channel(4, context.clone());
        drop(sender);
        assert_eq!(errors.next().await, None);
        assert_eq!(errors.terminal_status(), None);
        drop(responses);
        assert!(context.is_cancelled());
    }

    #[tokio::test]
    async fn finished_stream_does_not_cancel_on_drop() {
        let context = RequestContext::new();
        let (sender, responses, _errors) = response_channel(1, context.clone());
        sender.finish(ResponseStatus::RequestCompletedFull);
        assert_eq!(
            responses.terminal_status(),
            Some(ResponseStatus::RequestCompletedFull)
        );
        drop(responses);
        assert!(!context.is_cancelled());
    }
}
