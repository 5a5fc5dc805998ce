//! Writer task for the socket's outbound half.
//!
//! All outbound frames funnel through one bounded queue consumed by a single
//! writer task, so concurrent callers never interleave writes on the sink.
//!
//! # Shutdown
//!
//! 1. **Stop Signal**: `stop()` asks the writer to finish
//! 2. **Drain**: queued frames are written, then a close frame
//! 3. **Done**: the writer confirms and exits
//!
//! Dropping the handle cancels the task without draining.

use std::fmt::Display;

use futures_util::{Sink, SinkExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Queue capacity for outbound frames.
///
/// Bounds memory per connection and applies backpressure to callers.
pub(crate) const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// A frame waiting to be written.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outbound {
    Text(String),
    Ping,
}

impl Outbound {
    fn into_message(self) -> Message {
        match self {
            Outbound::Text(text) => Message::Text(text.into()),
            Outbound::Ping => Message::Ping(Default::default()),
        }
    }
}

/// Handle to a running writer task.
pub(crate) struct WriterTaskHandle {
    _join_handle: tokio::task::JoinHandle<()>,
    stop_tx: Option<oneshot::Sender<()>>,
    done_rx: Option<oneshot::Receiver<()>>,
    cancel_token: CancellationToken,
}

impl WriterTaskHandle {
    /// Drain the queue, send a close frame and wait for the writer to exit.
    pub(crate) async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(done_rx) = self.done_rx.take() {
            // Err means the writer already exited on its own
            let _ = done_rx.await;
        }
    }
}

impl Drop for WriterTaskHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Spawn a writer task that writes queued frames to `sink`.
pub(crate) fn spawn_writer_task<S>(sink: S, rx: mpsc::Receiver<Outbound>) -> WriterTaskHandle
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
{
    let cancel_token = CancellationToken::new();
    let (stop_tx, stop_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel();

    let join_handle = tokio::spawn(writer_loop(sink, rx, cancel_token.clone(), stop_rx, done_tx));

    WriterTaskHandle {
        _join_handle: join_handle,
        stop_tx: Some(stop_tx),
        done_rx: Some(done_rx),
        cancel_token,
    }
}

async fn writer_loop<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    cancel_token: CancellationToken,
    mut stop_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<()>,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
{
    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                log::debug!(
                    target: "finx_socket::session::writer",
                    "Writer task cancelled, shutting down"
                );
                return;
            }

            result = &mut stop_rx => {
                if result.is_ok() {
                    log::debug!(
                        target: "finx_socket::session::writer",
                        "Writer task received stop signal, draining queue"
                    );
                    while let Ok(outbound) = rx.try_recv() {
                        if let Err(e) = sink.send(outbound.into_message()).await {
                            log::warn!(
                                target: "finx_socket::session::writer",
                                "Write error during drain: {}",
                                e
                            );
                            break;
                        }
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    let _ = done_tx.send(());
                }
                return;
            }

            outbound = rx.recv() => {
                match outbound {
                    Some(outbound) => {
                        if let Err(e) = sink.send(outbound.into_message()).await {
                            // The reader observes the broken socket and tears down.
                            log::warn!(
                                target: "finx_socket::session::writer",
                                "Write error: {}",
                                e
                            );
                        }
                    }
                    None => {
                        let _ = sink.close().await;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::PollSender;

    fn capture_sink() -> (PollSender<Message>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        (PollSender::new(tx), rx)
    }

    #[tokio::test]
    async fn writes_frames_in_queue_order() {
        let (sink, mut written) = capture_sink();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let _handle = spawn_writer_task(sink, rx);

        tx.send(Outbound::Text("one".into())).await.unwrap();
        tx.send(Outbound::Text("two".into())).await.unwrap();

        assert_eq!(written.recv().await, Some(Message::Text("one".into())));
        assert_eq!(written.recv().await, Some(Message::Text("two".into())));
    }

    #[tokio::test]
    async fn stop_drains_queue_then_sends_close() {
        let (sink, mut written) = capture_sink();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let mut handle = spawn_writer_task(sink, rx);

        tx.send(Outbound::Text("pending".into())).await.unwrap();
        handle.stop().await;

        let mut frames = Vec::new();
        while let Ok(frame) = written.try_recv() {
            frames.push(frame);
        }
        assert_eq!(frames.last(), Some(&Message::Close(None)));
        assert!(frames.contains(&Message::Text("pending".into())));
    }

    #[tokio::test]
    async fn ping_becomes_ping_frame() {
        let (sink, mut written) = capture_sink();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let _handle = spawn_writer_task(sink, rx);

        tx.send(Outbound::Ping).await.unwrap();
        assert!(matches!(written.recv().await, Some(Message::Ping(_))));
    }
}
