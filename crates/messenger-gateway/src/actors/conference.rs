//! `ConferenceRoomActor`: one per dialog with a live conference.
//!
//! Owns the signaling roster: who is in the call, their transport state,
//! and the producers/consumers registered against the media plane. The
//! actor never calls the media plane itself; callers validate with a
//! `begin_*` message, perform the SFU call outside the mailbox, and
//! record the outcome with a `commit_*` message. Teardown returns the
//! released resource ids so the caller can close them against the SFU.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use messenger_protocol::conference::{
    ConferenceServerEvent, ParticipantSummary, PreferredLayers, ProducerInfo, ProducerKind,
};
use messenger_protocol::signal::{ModeratorActionKind, Signal};

use crate::actors::connection::ConnectionHandle;
use crate::actors::messages::{
    ConferenceJoinReply, ConferenceRoomMessage, ConferenceSnapshot, ConsumeGrant, RegistryMessage,
    ReleasedMedia, RoomKind,
};
use crate::actors::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::errors::GatewayError;
use crate::presence::{broadcast_event, send_event};

/// Buffer size for conference room mailboxes.
const CONFERENCE_CHANNEL_BUFFER: usize = 256;

/// A consumer held by a participant.
#[derive(Debug, Clone)]
struct ConsumerState {
    producer_id: String,
    paused: bool,
}

/// A conference participant.
struct Participant {
    connection_id: String,
    connection: ConnectionHandle,
    transport_id: Option<String>,
    transport_ready: bool,
    audio_enabled: bool,
    video_enabled: bool,
    producers: HashMap<String, ProducerKind>,
    consumers: HashMap<String, ConsumerState>,
}

impl Participant {
    fn new(connection_id: String, connection: ConnectionHandle) -> Self {
        Self {
            connection_id,
            connection,
            transport_id: None,
            transport_ready: false,
            audio_enabled: true,
            video_enabled: true,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn summary(&self, user_id: &str) -> ParticipantSummary {
        let mut producers: Vec<ProducerInfo> = self
            .producers
            .iter()
            .map(|(producer_id, kind)| ProducerInfo {
                producer_id: producer_id.clone(),
                user_id: user_id.to_string(),
                kind: *kind,
            })
            .collect();
        producers.sort_unstable_by(|a, b| a.producer_id.cmp(&b.producer_id));

        ParticipantSummary {
            user_id: user_id.to_string(),
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
            producers,
        }
    }
}

/// Handle for interacting with a `ConferenceRoomActor`.
#[derive(Debug, Clone)]
pub struct ConferenceRoomHandle {
    sender: mpsc::Sender<ConferenceRoomMessage>,
    cancel_token: CancellationToken,
    dialog_id: String,
}

macro_rules! request {
    ($self:expr, $variant:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        let (tx, rx) = oneshot::channel();
        $self
            .sender
            .send(ConferenceRoomMessage::$variant {
                $($field: $value,)*
                respond_to: tx,
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| GatewayError::Internal(format!("response receive failed: {e}")))?
    }};
}

impl ConferenceRoomHandle {
    /// Join the conference. Dialog membership must already be verified.
    pub async fn join(
        &self,
        user_id: String,
        connection_id: String,
        connection: ConnectionHandle,
    ) -> Result<ConferenceJoinReply, GatewayError> {
        request!(self, Join { user_id: user_id, connection_id: connection_id, connection: connection })
    }

    /// Record the transport allocated for a participant at join time.
    pub async fn set_transport(
        &self,
        user_id: String,
        transport_id: String,
    ) -> Result<(), GatewayError> {
        request!(self, SetTransport { user_id: user_id, transport_id: transport_id })
    }

    /// Validate a transport-connect attempt; returns the transport id.
    pub async fn begin_connect(&self, user_id: String) -> Result<String, GatewayError> {
        request!(self, BeginConnect { user_id: user_id })
    }

    /// Mark the participant's transport as negotiated.
    pub async fn commit_connect(&self, user_id: String) -> Result<(), GatewayError> {
        request!(self, CommitConnect { user_id: user_id })
    }

    /// Validate a produce attempt; returns the transport id.
    pub async fn begin_produce(
        &self,
        user_id: String,
        kind: ProducerKind,
    ) -> Result<String, GatewayError> {
        request!(self, BeginProduce { user_id: user_id, kind: kind })
    }

    /// Register a created producer and announce it to peers.
    pub async fn commit_produce(
        &self,
        user_id: String,
        kind: ProducerKind,
        producer_id: String,
    ) -> Result<(), GatewayError> {
        request!(self, CommitProduce { user_id: user_id, kind: kind, producer_id: producer_id })
    }

    /// Validate a consume attempt against a live producer.
    pub async fn begin_consume(
        &self,
        user_id: String,
        producer_id: String,
    ) -> Result<ConsumeGrant, GatewayError> {
        request!(self, BeginConsume { user_id: user_id, producer_id: producer_id })
    }

    /// Register a created consumer. It starts paused.
    pub async fn commit_consume(
        &self,
        user_id: String,
        producer_id: String,
        consumer_id: String,
    ) -> Result<ProducerKind, GatewayError> {
        request!(self, CommitConsume {
            user_id: user_id,
            producer_id: producer_id,
            consumer_id: consumer_id,
        })
    }

    /// Pause one of the caller's consumers.
    pub async fn pause_consumer(
        &self,
        user_id: String,
        consumer_id: String,
    ) -> Result<(), GatewayError> {
        request!(self, PauseConsumer { user_id: user_id, consumer_id: consumer_id })
    }

    /// Resume one of the caller's consumers.
    pub async fn resume_consumer(
        &self,
        user_id: String,
        consumer_id: String,
    ) -> Result<(), GatewayError> {
        request!(self, ResumeConsumer { user_id: user_id, consumer_id: consumer_id })
    }

    /// Record an SVC layer preference; returns the consumed producer id.
    pub async fn set_preferred_layers(
        &self,
        user_id: String,
        consumer_id: String,
        layers: PreferredLayers,
    ) -> Result<String, GatewayError> {
        request!(self, SetPreferredLayers {
            user_id: user_id,
            consumer_id: consumer_id,
            layers: layers,
        })
    }

    /// Route a signal. `moderator` reflects the caller's verified role.
    pub async fn relay(
        &self,
        from_user_id: String,
        signal: Signal,
        moderator: bool,
    ) -> Result<ReleasedMedia, GatewayError> {
        request!(self, Relay { from_user_id: from_user_id, signal: signal, moderator: moderator })
    }

    /// Leave the conference explicitly.
    pub async fn leave(&self, user_id: String) -> Result<ReleasedMedia, GatewayError> {
        request!(self, Leave { user_id: user_id })
    }

    /// Notify that a connection dropped without leaving. Returns the
    /// media released by the implicit leave.
    pub async fn disconnected(&self, connection_id: String) -> ReleasedMedia {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .sender
            .send(ConferenceRoomMessage::Disconnected {
                connection_id,
                respond_to: tx,
            })
            .await;
        if sent.is_err() {
            return ReleasedMedia::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Snapshot for tests and the status endpoint.
    pub async fn snapshot(&self) -> Result<ConferenceSnapshot, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConferenceRoomMessage::Snapshot { respond_to: tx })
            .await
            .map_err(|e| GatewayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| GatewayError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the room actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn dialog_id(&self) -> &str {
        &self.dialog_id
    }
}

/// The `ConferenceRoomActor` implementation.
pub struct ConferenceRoomActor {
    dialog_id: String,
    receiver: mpsc::Receiver<ConferenceRoomMessage>,
    /// Cancellation token (child of the registry's token).
    cancel_token: CancellationToken,
    /// Participants keyed by user id: one conference seat per user.
    participants: HashMap<String, Participant>,
    registry: mpsc::Sender<RegistryMessage>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl ConferenceRoomActor {
    /// Spawn a new conference room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        dialog_id: String,
        cancel_token: CancellationToken,
        registry: mpsc::Sender<RegistryMessage>,
        metrics: Arc<ActorMetrics>,
    ) -> (ConferenceRoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONFERENCE_CHANNEL_BUFFER);

        let actor = Self {
            dialog_id: dialog_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            participants: HashMap::new(),
            registry,
            metrics: Arc::clone(&metrics),
            mailbox: MailboxMonitor::new(ActorType::ConferenceRoom, &dialog_id),
        };

        metrics.conference_room_opened();
        let task_handle = tokio::spawn(actor.run());

        let handle = ConferenceRoomHandle {
            sender,
            cancel_token,
            dialog_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "gw.actor.conference", fields(dialog_id = %self.dialog_id))]
    async fn run(mut self) {
        info!(
            target: "gw.actor.conference",
            dialog_id = %self.dialog_id,
            "ConferenceRoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "gw.actor.conference",
                        dialog_id = %self.dialog_id,
                        "ConferenceRoomActor received cancellation signal"
                    );
                    self.broadcast_all(&ConferenceServerEvent::ConferenceEnded);
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "gw.actor.conference",
                                dialog_id = %self.dialog_id,
                                "ConferenceRoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.metrics.conference_room_closed();
        info!(
            target: "gw.actor.conference",
            dialog_id = %self.dialog_id,
            participants = self.participants.len(),
            messages_processed = self.mailbox.messages_processed(),
            "ConferenceRoomActor stopped"
        );
    }

    /// Handle a single message.
    #[allow(clippy::too_many_lines)]
    async fn handle_message(&mut self, message: ConferenceRoomMessage) {
        match message {
            ConferenceRoomMessage::Join {
                user_id,
                connection_id,
                connection,
                respond_to,
            } => {
                let result = self.handle_join(user_id, connection_id, connection);
                let _ = respond_to.send(result);
            }

            ConferenceRoomMessage::SetTransport {
                user_id,
                transport_id,
                respond_to,
            } => {
                let result = self.participant_mut(&user_id).map(|p| {
                    p.transport_id = Some(transport_id);
                });
                let _ = respond_to.send(result);
            }

            ConferenceRoomMessage::BeginConnect {
                user_id,
                respond_to,
            } => {
                let result = self.participant_mut(&user_id).and_then(|p| {
                    p.transport_id
                        .clone()
                        .ok_or(GatewayError::TransportNotReady)
                });
                let _ = respond_to.send(result);
            }

            ConferenceRoomMessage::CommitConnect {
                user_id,
                respond_to,
            } => {
                let result = self.participant_mut(&user_id).map(|p| {
                    p.transport_ready = true;
                });
                let _ = respond_to.send(result);
            }

            ConferenceRoomMessage::BeginProduce {
                user_id,
                kind,
                respond_to,
            } => {
                let result = self.handle_begin_produce(&user_id, kind);
                let _ = respond_to.send(result);
            }

            ConferenceRoomMessage::CommitProduce {
                user_id,
                kind,
                producer_id,
                respond_to,
            } => {
                let result = self.handle_commit_produce(&user_id, kind, producer_id);
                let _ = respond_to.send(result);
            }

            ConferenceRoomMessage::BeginConsume {
                user_id,
                producer_id,
                respond_to,
            } => {
                let result = self.handle_begin_consume(&user_id, &producer_id);
                let _ = respond_to.send(result);
            }

            ConferenceRoomMessage::CommitConsume {
                user_id,
                producer_id,
                consumer_id,
                respond_to,
            } => {
                let result = self.handle_commit_consume(&user_id, producer_id, consumer_id);
                let _ = respond_to.send(result);
            }

            ConferenceRoomMessage::PauseConsumer {
                user_id,
                consumer_id,
                respond_to,
            } => {
                let result = self.set_consumer_paused(&user_id, &consumer_id, true);
                let _ = respond_to.send(result);
            }

            ConferenceRoomMessage::ResumeConsumer {
                user_id,
                consumer_id,
                respond_to,
            } => {
                let result = self.set_consumer_paused(&user_id, &consumer_id, false);
                let _ = respond_to.send(result);
            }

            ConferenceRoomMessage::SetPreferredLayers {
                user_id,
                consumer_id,
                layers,
                respond_to,
            } => {
                let result = self.handle_set_layers(&user_id, &consumer_id, layers);
                let _ = respond_to.send(result);
            }

            ConferenceRoomMessage::Relay {
                from_user_id,
                signal,
                moderator,
                respond_to,
            } => {
                let result = self.handle_relay(&from_user_id, signal, moderator).await;
                let _ = respond_to.send(result);
            }

            ConferenceRoomMessage::Leave {
                user_id,
                respond_to,
            } => {
                let result = self.handle_leave(&user_id).await;
                let _ = respond_to.send(result);
            }

            ConferenceRoomMessage::Disconnected {
                connection_id,
                respond_to,
            } => {
                let user_id = self
                    .participants
                    .iter()
                    .find(|(_, p)| p.connection_id == connection_id)
                    .map(|(user_id, _)| user_id.clone());

                let released = match user_id {
                    Some(user_id) => self.handle_leave(&user_id).await.unwrap_or_default(),
                    None => ReleasedMedia::default(),
                };
                let _ = respond_to.send(released);
            }

            ConferenceRoomMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(ConferenceSnapshot {
                    participants: self.roster(None),
                });
            }
        }
    }

    fn handle_join(
        &mut self,
        user_id: String,
        connection_id: String,
        connection: ConnectionHandle,
    ) -> Result<ConferenceJoinReply, GatewayError> {
        if self.participants.contains_key(&user_id) {
            return Err(GatewayError::Conflict(
                "Already in this conference".to_string(),
            ));
        }

        let roster = self.roster(Some(&user_id));
        self.participants
            .insert(user_id.clone(), Participant::new(connection_id, connection));

        self.broadcast_except(&user_id, &ConferenceServerEvent::UserJoined { user_id: user_id.clone() });

        debug!(
            target: "gw.actor.conference",
            dialog_id = %self.dialog_id,
            user_id = %user_id,
            participants = self.participants.len(),
            "Participant joined conference"
        );

        Ok(ConferenceJoinReply {
            participants: roster,
        })
    }

    fn handle_begin_produce(
        &self,
        user_id: &str,
        kind: ProducerKind,
    ) -> Result<String, GatewayError> {
        let participant = self.participant_ref_shared(user_id)?;
        if !participant.transport_ready {
            return Err(GatewayError::TransportNotReady);
        }
        if participant.producers.values().any(|k| *k == kind) {
            return Err(GatewayError::Conflict(
                "Already producing this media kind".to_string(),
            ));
        }
        participant
            .transport_id
            .clone()
            .ok_or(GatewayError::TransportNotReady)
    }

    fn handle_commit_produce(
        &mut self,
        user_id: &str,
        kind: ProducerKind,
        producer_id: String,
    ) -> Result<(), GatewayError> {
        let participant = self.participant_mut(user_id)?;
        participant.producers.insert(producer_id.clone(), kind);

        if kind == ProducerKind::Screen {
            self.broadcast_except(
                user_id,
                &ConferenceServerEvent::ScreenShareStarted {
                    user_id: user_id.to_string(),
                    producer_id: producer_id.clone(),
                },
            );
        }

        self.broadcast_except(
            user_id,
            &ConferenceServerEvent::NewProducer {
                user_id: user_id.to_string(),
                producer_id,
                kind,
            },
        );
        Ok(())
    }

    fn handle_begin_consume(
        &self,
        user_id: &str,
        producer_id: &str,
    ) -> Result<ConsumeGrant, GatewayError> {
        let participant = self.participant_ref_shared(user_id)?;
        if !participant.transport_ready {
            return Err(GatewayError::TransportNotReady);
        }
        let transport_id = participant
            .transport_id
            .clone()
            .ok_or(GatewayError::TransportNotReady)?;

        let (owner_id, kind) = self
            .find_producer(producer_id)
            .ok_or_else(|| GatewayError::UnknownProducer(producer_id.to_string()))?;
        if owner_id == user_id {
            return Err(GatewayError::Conflict(
                "Cannot consume your own producer".to_string(),
            ));
        }

        Ok(ConsumeGrant {
            transport_id,
            producer_user_id: owner_id,
            kind,
        })
    }

    fn handle_commit_consume(
        &mut self,
        user_id: &str,
        producer_id: String,
        consumer_id: String,
    ) -> Result<ProducerKind, GatewayError> {
        // The producer may have vanished between begin and commit; the
        // caller closes the orphaned consumer when this fails.
        let (_, kind) = self
            .find_producer(&producer_id)
            .ok_or_else(|| GatewayError::UnknownProducer(producer_id.clone()))?;

        let participant = self.participant_mut(user_id)?;
        participant.consumers.insert(
            consumer_id,
            ConsumerState {
                producer_id,
                paused: true,
            },
        );
        Ok(kind)
    }

    fn set_consumer_paused(
        &mut self,
        user_id: &str,
        consumer_id: &str,
        paused: bool,
    ) -> Result<(), GatewayError> {
        let participant = self.participant_mut(user_id)?;
        let consumer = participant
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| GatewayError::UnknownConsumer(consumer_id.to_string()))?;
        // Repeating the current state is a no-op, not an error.
        if consumer.paused != paused {
            consumer.paused = paused;
        }
        Ok(())
    }

    fn handle_set_layers(
        &mut self,
        user_id: &str,
        consumer_id: &str,
        layers: PreferredLayers,
    ) -> Result<String, GatewayError> {
        let participant = self.participant_ref_shared(user_id)?;
        let consumer = participant
            .consumers
            .get(consumer_id)
            .ok_or_else(|| GatewayError::UnknownConsumer(consumer_id.to_string()))?;
        let producer_id = consumer.producer_id.clone();

        self.broadcast_all(&ConferenceServerEvent::VideoQualityChanged {
            producer_id: producer_id.clone(),
            layers,
        });
        Ok(producer_id)
    }

    /// Route a signal to the other participants, applying enforced
    /// moderator actions along the way.
    async fn handle_relay(
        &mut self,
        from_user_id: &str,
        signal: Signal,
        moderator: bool,
    ) -> Result<ReleasedMedia, GatewayError> {
        self.participant_ref_shared(from_user_id)?;

        if signal.requires_moderator() && !moderator {
            return Err(GatewayError::Forbidden(format!(
                "{from_user_id} is not a moderator"
            )));
        }

        if let Signal::ModeratorAction {
            action,
            target_user_id,
        } = &signal
        {
            let target = target_user_id.clone();
            if !self.participants.contains_key(&target) {
                return Err(GatewayError::RoomNotFound(format!(
                    "participant {target} not in conference"
                )));
            }

            match action {
                ModeratorActionKind::Mute => {
                    if let Some(participant) = self.participants.get_mut(&target) {
                        participant.audio_enabled = false;
                    }
                    self.broadcast_except(
                        from_user_id,
                        &ConferenceServerEvent::Signal {
                            from_user_id: from_user_id.to_string(),
                            signal: signal.clone(),
                        },
                    );
                    return Ok(ReleasedMedia::default());
                }
                ModeratorActionKind::Kick => {
                    self.broadcast_except(
                        from_user_id,
                        &ConferenceServerEvent::Signal {
                            from_user_id: from_user_id.to_string(),
                            signal: signal.clone(),
                        },
                    );
                    return self.handle_leave(&target).await;
                }
            }
        }

        self.broadcast_except(
            from_user_id,
            &ConferenceServerEvent::Signal {
                from_user_id: from_user_id.to_string(),
                signal,
            },
        );
        Ok(ReleasedMedia::default())
    }

    /// Remove a participant and tear down everything attached to them.
    async fn handle_leave(&mut self, user_id: &str) -> Result<ReleasedMedia, GatewayError> {
        let Some(participant) = self.participants.remove(user_id) else {
            return Err(GatewayError::NotAMember(self.dialog_id.clone()));
        };

        let mut released = ReleasedMedia {
            transport_id: participant.transport_id.clone(),
            producer_ids: participant.producers.keys().cloned().collect(),
            consumer_ids: participant.consumers.keys().cloned().collect(),
        };

        // Close every peer consumer fed by the leaver's producers.
        for peer in self.participants.values_mut() {
            let dead: Vec<String> = peer
                .consumers
                .iter()
                .filter(|(_, c)| participant.producers.contains_key(&c.producer_id))
                .map(|(consumer_id, _)| consumer_id.clone())
                .collect();
            for consumer_id in dead {
                if let Some(consumer) = peer.consumers.remove(&consumer_id) {
                    send_event(
                        &peer.connection,
                        &ConferenceServerEvent::ConsumerClosed {
                            consumer_id: consumer_id.clone(),
                            producer_id: consumer.producer_id,
                        },
                    );
                    released.consumer_ids.push(consumer_id);
                }
            }
        }

        for (producer_id, kind) in &participant.producers {
            if *kind == ProducerKind::Screen {
                self.broadcast_all(&ConferenceServerEvent::ScreenShareStopped {
                    user_id: user_id.to_string(),
                    producer_id: producer_id.clone(),
                });
            }
        }

        self.broadcast_all(&ConferenceServerEvent::UserLeft {
            user_id: user_id.to_string(),
        });

        debug!(
            target: "gw.actor.conference",
            dialog_id = %self.dialog_id,
            user_id = %user_id,
            producers = released.producer_ids.len(),
            consumers = released.consumer_ids.len(),
            "Participant left conference"
        );

        self.notify_if_empty().await;
        Ok(released)
    }

    /// Roster of participant summaries, excluding one user if given.
    fn roster(&self, exclude: Option<&str>) -> Vec<ParticipantSummary> {
        let mut roster: Vec<ParticipantSummary> = self
            .participants
            .iter()
            .filter(|(user_id, _)| exclude != Some(user_id.as_str()))
            .map(|(user_id, participant)| participant.summary(user_id))
            .collect();
        roster.sort_unstable_by(|a, b| a.user_id.cmp(&b.user_id));
        roster
    }

    fn find_producer(&self, producer_id: &str) -> Option<(String, ProducerKind)> {
        self.participants.iter().find_map(|(user_id, participant)| {
            participant
                .producers
                .get(producer_id)
                .map(|kind| (user_id.clone(), *kind))
        })
    }

    fn participant_mut(&mut self, user_id: &str) -> Result<&mut Participant, GatewayError> {
        self.participants
            .get_mut(user_id)
            .ok_or_else(|| GatewayError::NotAMember(self.dialog_id.clone()))
    }

    fn participant_ref_shared(&self, user_id: &str) -> Result<&Participant, GatewayError> {
        self.participants
            .get(user_id)
            .ok_or_else(|| GatewayError::NotAMember(self.dialog_id.clone()))
    }

    fn broadcast_all(&self, event: &ConferenceServerEvent) {
        broadcast_event(
            self.participants.values().map(|p| &p.connection),
            event,
        );
    }

    fn broadcast_except(&self, skip_user_id: &str, event: &ConferenceServerEvent) {
        broadcast_event(
            self.participants
                .iter()
                .filter(|(user_id, _)| user_id.as_str() != skip_user_id)
                .map(|(_, p)| &p.connection),
            event,
        );
    }

    /// Tell the registry when the last participant is gone so the
    /// conference can be torn down and its end announced to the dialog.
    async fn notify_if_empty(&self) {
        if self.participants.is_empty() {
            let _ = self
                .registry
                .send(RegistryMessage::RoomEmpty {
                    dialog_id: self.dialog_id.clone(),
                    kind: RoomKind::Conference,
                })
                .await;
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::actors::connection::ConnectionActor;
    use std::time::Duration;

    struct TestConference {
        handle: ConferenceRoomHandle,
        registry_rx: mpsc::Receiver<RegistryMessage>,
        metrics: Arc<ActorMetrics>,
    }

    fn spawn_conference(dialog_id: &str) -> TestConference {
        let (registry_tx, registry_rx) = mpsc::channel(16);
        let metrics = ActorMetrics::new();
        let (handle, _task) = ConferenceRoomActor::spawn(
            dialog_id.to_string(),
            CancellationToken::new(),
            registry_tx,
            Arc::clone(&metrics),
        );
        TestConference {
            handle,
            registry_rx,
            metrics,
        }
    }

    fn test_connection(
        conference: &TestConference,
        connection_id: &str,
        user_id: &str,
    ) -> (ConnectionHandle, mpsc::Receiver<String>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (handle, _task) = ConnectionActor::spawn(
            connection_id.to_string(),
            user_id.to_string(),
            outbound_tx,
            CancellationToken::new(),
            Arc::clone(&conference.metrics),
            64,
        );
        (handle, outbound_rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<String>) -> ConferenceServerEvent {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("connection closed");
        serde_json::from_str(&frame).expect("frame should decode")
    }

    /// Join a user and walk their transport to ready.
    async fn join_ready(
        conference: &TestConference,
        connection_id: &str,
        user_id: &str,
    ) -> (ConnectionHandle, mpsc::Receiver<String>) {
        let (conn, rx) = test_connection(conference, connection_id, user_id);
        conference
            .handle
            .join(user_id.to_string(), connection_id.to_string(), conn.clone())
            .await
            .unwrap();
        conference
            .handle
            .set_transport(user_id.to_string(), format!("tr-{user_id}"))
            .await
            .unwrap();
        conference
            .handle
            .begin_connect(user_id.to_string())
            .await
            .unwrap();
        conference
            .handle
            .commit_connect(user_id.to_string())
            .await
            .unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn test_double_join_is_conflict() {
        let conference = spawn_conference("d1");
        let (conn, _rx) = test_connection(&conference, "c1", "u1");

        conference
            .handle
            .join("u1".to_string(), "c1".to_string(), conn.clone())
            .await
            .unwrap();
        let result = conference
            .handle
            .join("u1".to_string(), "c1b".to_string(), conn)
            .await;
        assert!(matches!(result, Err(GatewayError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_produce_requires_connected_transport() {
        let conference = spawn_conference("d1");
        let (conn, _rx) = test_connection(&conference, "c1", "u1");
        conference
            .handle
            .join("u1".to_string(), "c1".to_string(), conn)
            .await
            .unwrap();

        let result = conference
            .handle
            .begin_produce("u1".to_string(), ProducerKind::Audio)
            .await;
        assert!(matches!(result, Err(GatewayError::TransportNotReady)));
    }

    #[tokio::test]
    async fn test_new_producer_announced_before_consume() {
        let conference = spawn_conference("d1");
        let (_c1, _rx1) = join_ready(&conference, "c1", "u1").await;
        let (_c2, mut rx2) = join_ready(&conference, "c2", "u2").await;

        let transport = conference
            .handle
            .begin_produce("u1".to_string(), ProducerKind::Video)
            .await
            .unwrap();
        assert_eq!(transport, "tr-u1");
        conference
            .handle
            .commit_produce("u1".to_string(), ProducerKind::Video, "p1".to_string())
            .await
            .unwrap();

        let ConferenceServerEvent::NewProducer {
            user_id,
            producer_id,
            kind,
        } = next_event(&mut rx2).await
        else {
            panic!("expected new_producer");
        };
        assert_eq!(user_id, "u1");
        assert_eq!(producer_id, "p1");
        assert_eq!(kind, ProducerKind::Video);

        // The announced producer is consumable.
        let grant = conference
            .handle
            .begin_consume("u2".to_string(), "p1".to_string())
            .await
            .unwrap();
        assert_eq!(grant.producer_user_id, "u1");
        assert_eq!(grant.transport_id, "tr-u2");

        let kind = conference
            .handle
            .commit_consume("u2".to_string(), "p1".to_string(), "co1".to_string())
            .await
            .unwrap();
        assert_eq!(kind, ProducerKind::Video);
    }

    #[tokio::test]
    async fn test_consume_unknown_producer_rejected() {
        let conference = spawn_conference("d1");
        let (_c1, _rx1) = join_ready(&conference, "c1", "u1").await;

        let result = conference
            .handle
            .begin_consume("u1".to_string(), "p-ghost".to_string())
            .await;
        assert!(matches!(result, Err(GatewayError::UnknownProducer(_))));
    }

    #[tokio::test]
    async fn test_consume_own_producer_rejected() {
        let conference = spawn_conference("d1");
        let (_c1, _rx1) = join_ready(&conference, "c1", "u1").await;
        conference
            .handle
            .begin_produce("u1".to_string(), ProducerKind::Audio)
            .await
            .unwrap();
        conference
            .handle
            .commit_produce("u1".to_string(), ProducerKind::Audio, "p1".to_string())
            .await
            .unwrap();

        let result = conference
            .handle
            .begin_consume("u1".to_string(), "p1".to_string())
            .await;
        assert!(matches!(result, Err(GatewayError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_kick_requires_moderator() {
        let conference = spawn_conference("d1");
        let (_c1, _rx1) = join_ready(&conference, "c1", "u1").await;
        let (_c2, _rx2) = join_ready(&conference, "c2", "u2").await;

        let kick = Signal::ModeratorAction {
            action: ModeratorActionKind::Kick,
            target_user_id: "u2".to_string(),
        };

        let result = conference
            .handle
            .relay("u1".to_string(), kick.clone(), false)
            .await;
        assert!(matches!(result, Err(GatewayError::Forbidden(_))));

        // With the role verified, the target is removed.
        conference
            .handle
            .relay("u1".to_string(), kick, true)
            .await
            .unwrap();
        let snapshot = conference.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.participants.len(), 1);
        assert_eq!(snapshot.participants[0].user_id, "u1");
    }

    #[tokio::test]
    async fn test_leave_closes_peer_consumers_and_screen_share() {
        let conference = spawn_conference("d1");
        let (_c1, _rx1) = join_ready(&conference, "c1", "u1").await;
        let (_c2, mut rx2) = join_ready(&conference, "c2", "u2").await;

        // u1 shares screen; u2 consumes it.
        conference
            .handle
            .begin_produce("u1".to_string(), ProducerKind::Screen)
            .await
            .unwrap();
        conference
            .handle
            .commit_produce("u1".to_string(), ProducerKind::Screen, "ps".to_string())
            .await
            .unwrap();
        let _ = next_event(&mut rx2).await; // screen_share_started
        let _ = next_event(&mut rx2).await; // new_producer
        conference
            .handle
            .begin_consume("u2".to_string(), "ps".to_string())
            .await
            .unwrap();
        conference
            .handle
            .commit_consume("u2".to_string(), "ps".to_string(), "cs".to_string())
            .await
            .unwrap();

        let released = conference.handle.leave("u1".to_string()).await.unwrap();
        assert_eq!(released.transport_id.as_deref(), Some("tr-u1"));
        assert!(released.producer_ids.contains(&"ps".to_string()));
        // The peer's consumer is released along with the producer.
        assert!(released.consumer_ids.contains(&"cs".to_string()));

        let ConferenceServerEvent::ConsumerClosed {
            consumer_id,
            producer_id,
        } = next_event(&mut rx2).await
        else {
            panic!("expected consumer_closed");
        };
        assert_eq!(consumer_id, "cs");
        assert_eq!(producer_id, "ps");

        assert!(matches!(
            next_event(&mut rx2).await,
            ConferenceServerEvent::ScreenShareStopped { .. }
        ));
        assert!(matches!(
            next_event(&mut rx2).await,
            ConferenceServerEvent::UserLeft { .. }
        ));
    }

    #[tokio::test]
    async fn test_last_leave_notifies_registry() {
        let mut conference = spawn_conference("d1");
        let (_c1, _rx1) = join_ready(&conference, "c1", "u1").await;
        conference.handle.leave("u1".to_string()).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), conference.registry_rx.recv())
            .await
            .expect("registry should be notified")
            .unwrap();
        assert!(matches!(
            msg,
            RegistryMessage::RoomEmpty {
                kind: RoomKind::Conference,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_sweep_releases_media() {
        let conference = spawn_conference("d1");
        let (_c1, _rx1) = join_ready(&conference, "c1", "u1").await;
        conference
            .handle
            .begin_produce("u1".to_string(), ProducerKind::Audio)
            .await
            .unwrap();
        conference
            .handle
            .commit_produce("u1".to_string(), ProducerKind::Audio, "pa".to_string())
            .await
            .unwrap();

        let released = conference.handle.disconnected("c1".to_string()).await;
        assert_eq!(released.producer_ids, vec!["pa".to_string()]);

        let snapshot = conference.handle.snapshot().await.unwrap();
        assert!(snapshot.participants.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_pause_resume_is_idempotent() {
        let conference = spawn_conference("d1");
        let (_c1, _rx1) = join_ready(&conference, "c1", "u1").await;
        let (_c2, _rx2) = join_ready(&conference, "c2", "u2").await;
        conference
            .handle
            .begin_produce("u1".to_string(), ProducerKind::Audio)
            .await
            .unwrap();
        conference
            .handle
            .commit_produce("u1".to_string(), ProducerKind::Audio, "p1".to_string())
            .await
            .unwrap();
        conference
            .handle
            .begin_consume("u2".to_string(), "p1".to_string())
            .await
            .unwrap();
        conference
            .handle
            .commit_consume("u2".to_string(), "p1".to_string(), "co1".to_string())
            .await
            .unwrap();

        // Consumers start paused; resuming twice and re-pausing twice
        // are all accepted.
        for _ in 0..2 {
            conference
                .handle
                .resume_consumer("u2".to_string(), "co1".to_string())
                .await
                .unwrap();
        }
        for _ in 0..2 {
            conference
                .handle
                .pause_consumer("u2".to_string(), "co1".to_string())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_pause_resume_unknown_consumer() {
        let conference = spawn_conference("d1");
        let (_c1, _rx1) = join_ready(&conference, "c1", "u1").await;
        let result = conference
            .handle
            .resume_consumer("u1".to_string(), "ghost".to_string())
            .await;
        assert!(matches!(result, Err(GatewayError::UnknownConsumer(_))));
    }
}
