//! `ConnectionActor`: one per WebSocket connection.
//!
//! Owns outbound delivery to a single client. Rooms hand it encoded
//! frames through a non-blocking `try_send`; a client that cannot drain
//! its buffer is disconnected rather than allowed to back-pressure a
//! room's mailbox.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::actors::messages::ConnectionMessage;
use crate::actors::metrics::{ActorMetrics, ActorType, MailboxMonitor};

/// How long the actor waits for the socket writer to accept a frame
/// before declaring the connection dead.
const WRITER_STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle for interacting with a `ConnectionActor`.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: String,
    profile_id: String,
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    monitor: Arc<MailboxMonitor>,
}

impl ConnectionHandle {
    /// Queue an encoded frame for delivery. Never blocks: if the mailbox
    /// is full the frame is dropped and the connection is cancelled.
    pub fn deliver(&self, frame: String) {
        self.monitor.record_enqueue();
        if let Err(err) = self.sender.try_send(ConnectionMessage::Deliver { frame }) {
            self.monitor.record_drop();
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    warn!(
                        target: "gw.actor.connection",
                        connection_id = %self.connection_id,
                        profile_id = %self.profile_id,
                        "Connection mailbox full, disconnecting slow client"
                    );
                    self.cancel_token.cancel();
                }
                mpsc::error::TrySendError::Closed(_) => {
                    // Actor already stopped; room sweep will follow.
                }
            }
        }
    }

    /// Cancel the connection.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: String,
    profile_id: String,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Channel drained by the socket writer task.
    outbound: mpsc::Sender<String>,
    /// Cancellation token (child of the gateway's root token).
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    monitor: Arc<MailboxMonitor>,
}

impl ConnectionActor {
    /// Spawn a new connection actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: String,
        profile_id: String,
        outbound: mpsc::Sender<String>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
        mailbox_capacity: usize,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(mailbox_capacity);
        let monitor = Arc::new(MailboxMonitor::new(ActorType::Connection, &connection_id));

        let actor = Self {
            connection_id: connection_id.clone(),
            profile_id: profile_id.clone(),
            receiver,
            outbound,
            cancel_token: cancel_token.clone(),
            metrics: Arc::clone(&metrics),
            monitor: Arc::clone(&monitor),
        };

        metrics.connection_opened();
        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionHandle {
            connection_id,
            profile_id,
            sender,
            cancel_token,
            monitor,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "gw.actor.connection",
        fields(
            connection_id = %self.connection_id,
            profile_id = %self.profile_id
        )
    )]
    async fn run(mut self) {
        debug!(
            target: "gw.actor.connection",
            connection_id = %self.connection_id,
            profile_id = %self.profile_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "gw.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(ConnectionMessage::Deliver { frame }) => {
                            self.monitor.record_dequeue();
                            self.metrics.record_message_processed();
                            if !self.forward(frame).await {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "gw.actor.connection",
                                connection_id = %self.connection_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.metrics.connection_closed();
        info!(
            target: "gw.actor.connection",
            connection_id = %self.connection_id,
            profile_id = %self.profile_id,
            messages_processed = self.monitor.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    /// Forward one frame to the socket writer. Returns false when the
    /// connection should be torn down.
    async fn forward(&mut self, frame: String) -> bool {
        let send = self.outbound.send(frame);
        tokio::select! {
            () = self.cancel_token.cancelled() => false,
            result = tokio::time::timeout(WRITER_STALL_TIMEOUT, send) => match result {
                Ok(Ok(())) => true,
                Ok(Err(_)) => {
                    // Writer task gone; the socket is closed.
                    false
                }
                Err(_) => {
                    warn!(
                        target: "gw.actor.connection",
                        connection_id = %self.connection_id,
                        "Socket writer stalled, disconnecting"
                    );
                    self.cancel_token.cancel();
                    false
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn spawn_actor(
        outbound_capacity: usize,
        mailbox_capacity: usize,
    ) -> (ConnectionHandle, JoinHandle<()>, mpsc::Receiver<String>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity);
        let (handle, task) = ConnectionActor::spawn(
            "c1".to_string(),
            "u1".to_string(),
            outbound_tx,
            CancellationToken::new(),
            ActorMetrics::new(),
            mailbox_capacity,
        );
        (handle, task, outbound_rx)
    }

    #[tokio::test]
    async fn test_delivers_frames_in_order() {
        let (handle, _task, mut outbound) = spawn_actor(8, 8);

        handle.deliver("first".to_string());
        handle.deliver("second".to_string());

        assert_eq!(outbound.recv().await.unwrap(), "first");
        assert_eq!(outbound.recv().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_overflow_cancels_connection() {
        let (handle, task, _outbound) = spawn_actor(1, 1);

        // Nobody drains outbound, so the mailbox fills and overflows.
        for i in 0..16 {
            handle.deliver(format!("frame-{i}"));
        }

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("actor should stop after overflow")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_actor() {
        let (handle, task, _outbound) = spawn_actor(8, 8);
        handle.close();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("actor should stop when cancelled")
            .unwrap();
    }
}
