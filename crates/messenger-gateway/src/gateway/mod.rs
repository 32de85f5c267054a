//! WebSocket gateway: the `/dialog` and `/conference` endpoints.
//!
//! Each upgraded socket gets a `ConnectionActor` for outbound delivery, a
//! writer task draining the outbound channel into the socket, and a read
//! loop that decodes frames and dispatches them to room actors. Teardown
//! is synchronous with the read loop ending: presence is unregistered
//! first, then every room sweeps the connection, then released media is
//! closed against the SFU.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use common::types::Pagination;
use messenger_protocol::codec;
use messenger_protocol::conference::{ConferenceClientEvent, ConferenceServerEvent};
use messenger_protocol::dialog::{DialogClientEvent, DialogServerEvent, MediaRef};

use crate::actors::conference::ConferenceRoomHandle;
use crate::actors::connection::{ConnectionActor, ConnectionHandle};
use crate::actors::dialog::DialogRoomHandle;
use crate::actors::messages::{ReceiptKind, ReleasedMedia};
use crate::actors::metrics::ActorMetrics;
use crate::actors::registry::RegistryHandle;
use crate::auth::{authenticate, Identity};
use crate::connections::ConnectionTable;
use crate::errors::GatewayError;
use crate::media::MediaPlane;
use crate::presence::{conference_error, dialog_error, send_event};
use crate::store::{call_with_timeout, ModeratorAuthority};

/// Shared state for the WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub connections: Arc<ConnectionTable>,
    pub media: Arc<dyn MediaPlane>,
    pub authority: Arc<dyn ModeratorAuthority>,
    pub metrics: Arc<ActorMetrics>,
    pub cancel_token: CancellationToken,
    pub send_buffer: usize,
    pub persistence_timeout: Duration,
}

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/dialog", get(dialog_ws))
        .route("/conference", get(conference_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn dialog_ws(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    match authenticate(&headers, &query) {
        Ok(identity) => {
            ws.on_upgrade(move |socket| dialog_session(socket, state, identity))
        }
        Err(err) => {
            debug!(target: "gw.gateway", error = %err, "Dialog handshake refused");
            (StatusCode::UNAUTHORIZED, err.client_message()).into_response()
        }
    }
}

async fn conference_ws(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    match authenticate(&headers, &query) {
        Ok(identity) => {
            ws.on_upgrade(move |socket| conference_session(socket, state, identity))
        }
        Err(err) => {
            debug!(target: "gw.gateway", error = %err, "Conference handshake refused");
            (StatusCode::UNAUTHORIZED, err.client_message()).into_response()
        }
    }
}

/// Spin up the per-connection plumbing shared by both namespaces:
/// connection actor, writer task, presence registration.
struct Session {
    connection_id: String,
    identity: Identity,
    handle: ConnectionHandle,
    token: CancellationToken,
}

impl Session {
    fn start(socket_tx: mpsc::Sender<String>, state: &AppState, identity: Identity) -> Self {
        let connection_id = format!("conn-{}", uuid::Uuid::new_v4());
        state
            .connections
            .register(&identity.profile_id, &connection_id);

        let token = state.cancel_token.child_token();
        let (handle, _task) = ConnectionActor::spawn(
            connection_id.clone(),
            identity.profile_id.clone(),
            socket_tx,
            token.clone(),
            Arc::clone(&state.metrics),
            state.send_buffer,
        );

        info!(
            target: "gw.gateway",
            connection_id = %connection_id,
            profile_id = %identity.profile_id,
            user_info_id = %identity.user_info_id,
            public_id = %identity.public_id,
            "Connection established"
        );

        Self {
            connection_id,
            identity,
            handle,
            token,
        }
    }

    /// Synchronous teardown: presence first so room sweeps see the
    /// correct status, then the room sweep, then SFU cleanup.
    async fn finish(self, state: &AppState) {
        state
            .connections
            .unregister(&self.identity.profile_id, &self.connection_id);

        let released = state
            .registry
            .connection_closed(self.connection_id.clone())
            .await;
        for media in released {
            close_released(state.media.as_ref(), media).await;
        }

        self.handle.close();
        info!(
            target: "gw.gateway",
            connection_id = %self.connection_id,
            profile_id = %self.identity.profile_id,
            "Connection closed"
        );
    }
}

/// Drain the outbound channel into the socket until either side closes.
fn spawn_writer(
    mut socket_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<String>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if socket_tx.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = socket_tx.close().await;
    });
}

async fn dialog_session(socket: WebSocket, state: AppState, identity: Identity) {
    let (socket_tx, mut socket_rx) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(state.send_buffer);
    let session = Session::start(outbound_tx, &state, identity);
    spawn_writer(socket_tx, outbound_rx, session.token.clone());

    // Rooms this connection has joined, for direct dispatch.
    let mut joined: HashMap<String, DialogRoomHandle> = HashMap::new();

    loop {
        tokio::select! {
            () = session.token.cancelled() => break,
            msg = socket_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_dialog_frame(&state, &session, &mut joined, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary
                    Some(Err(err)) => {
                        debug!(
                            target: "gw.gateway",
                            connection_id = %session.connection_id,
                            error = %err,
                            "Socket read error"
                        );
                        break;
                    }
                }
            }
        }
    }

    session.finish(&state).await;
}

async fn handle_dialog_frame(
    state: &AppState,
    session: &Session,
    joined: &mut HashMap<String, DialogRoomHandle>,
    text: &str,
) {
    let event: DialogClientEvent = match codec::decode_frame(text) {
        Ok(event) => event,
        Err(err) => {
            debug!(
                target: "gw.gateway",
                connection_id = %session.connection_id,
                error = %err,
                "Rejected dialog frame"
            );
            send_event(
                &session.handle,
                &DialogServerEvent::Error {
                    message: "Invalid event payload".to_string(),
                    error: "invalid_payload".to_string(),
                },
            );
            return;
        }
    };

    if let Err(err) = dispatch_dialog_event(state, session, joined, event).await {
        send_event(&session.handle, &dialog_error(&err));
    }
}

async fn dispatch_dialog_event(
    state: &AppState,
    session: &Session,
    joined: &mut HashMap<String, DialogRoomHandle>,
    event: DialogClientEvent,
) -> Result<(), GatewayError> {
    match event {
        DialogClientEvent::JoinDialog {
            dialog_id,
            page,
            per_page,
        } => {
            let room = state.registry.dialog_room(dialog_id.clone()).await?;
            let reply = room
                .join(
                    session.connection_id.clone(),
                    session.identity.profile_id.clone(),
                    session.handle.clone(),
                    Pagination::from_request(page, per_page),
                )
                .await?;
            joined.insert(dialog_id, room);
            send_event(
                &session.handle,
                &DialogServerEvent::DialogHistory {
                    messages: reply.messages,
                    participants: reply.participants,
                    active_participants: reply.active_participants,
                },
            );
            Ok(())
        }

        DialogClientEvent::LeaveDialog { dialog_id } => {
            let room = joined
                .remove(&dialog_id)
                .ok_or(GatewayError::NotAMember(dialog_id))?;
            room.leave(session.connection_id.clone()).await
        }

        DialogClientEvent::SendMessage {
            dialog_id,
            message,
            media,
            voices,
            videos,
        } => {
            let room = joined
                .get(&dialog_id)
                .ok_or(GatewayError::NotAMember(dialog_id))?;
            room.send_message(
                session.connection_id.clone(),
                message,
                merge_attachments(media, voices, videos),
            )
            .await
        }

        DialogClientEvent::StartTyping { dialog_id } => {
            let room = joined
                .get(&dialog_id)
                .ok_or(GatewayError::NotAMember(dialog_id))?;
            room.set_typing(session.connection_id.clone(), true).await
        }

        DialogClientEvent::StopTyping { dialog_id } => {
            let room = joined
                .get(&dialog_id)
                .ok_or(GatewayError::NotAMember(dialog_id))?;
            room.set_typing(session.connection_id.clone(), false).await
        }

        DialogClientEvent::MessageDelivered {
            dialog_id,
            message_ids,
        } => {
            let room = joined
                .get(&dialog_id)
                .ok_or(GatewayError::NotAMember(dialog_id))?;
            room.receipt(
                session.connection_id.clone(),
                ReceiptKind::Delivered,
                message_ids,
            )
            .await
        }

        DialogClientEvent::MessageRead {
            dialog_id,
            message_ids,
        } => {
            let room = joined
                .get(&dialog_id)
                .ok_or(GatewayError::NotAMember(dialog_id))?;
            room.receipt(
                session.connection_id.clone(),
                ReceiptKind::Read,
                message_ids,
            )
            .await
        }
    }
}

/// Attachment arrays arrive split by kind; the pipeline carries one list.
fn merge_attachments(
    media: Vec<MediaRef>,
    voices: Vec<MediaRef>,
    videos: Vec<MediaRef>,
) -> Vec<MediaRef> {
    let mut all = media;
    all.extend(voices);
    all.extend(videos);
    all
}

async fn conference_session(socket: WebSocket, state: AppState, identity: Identity) {
    let (socket_tx, mut socket_rx) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(state.send_buffer);
    let session = Session::start(outbound_tx, &state, identity);
    spawn_writer(socket_tx, outbound_rx, session.token.clone());

    let mut joined: HashMap<String, ConferenceRoomHandle> = HashMap::new();

    loop {
        tokio::select! {
            () = session.token.cancelled() => break,
            msg = socket_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_conference_frame(&state, &session, &mut joined, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(
                            target: "gw.gateway",
                            connection_id = %session.connection_id,
                            error = %err,
                            "Socket read error"
                        );
                        break;
                    }
                }
            }
        }
    }

    session.finish(&state).await;
}

async fn handle_conference_frame(
    state: &AppState,
    session: &Session,
    joined: &mut HashMap<String, ConferenceRoomHandle>,
    text: &str,
) {
    let event: ConferenceClientEvent = match codec::decode_frame(text) {
        Ok(event) => event,
        Err(err) => {
            debug!(
                target: "gw.gateway",
                connection_id = %session.connection_id,
                error = %err,
                "Rejected conference frame"
            );
            send_event(
                &session.handle,
                &ConferenceServerEvent::Error {
                    message: "Invalid event payload".to_string(),
                    error: "invalid_payload".to_string(),
                },
            );
            return;
        }
    };

    if let Err(err) = dispatch_conference_event(state, session, joined, event).await {
        send_event(&session.handle, &conference_error(&err));
    }
}

#[allow(clippy::too_many_lines)]
async fn dispatch_conference_event(
    state: &AppState,
    session: &Session,
    joined: &mut HashMap<String, ConferenceRoomHandle>,
    event: ConferenceClientEvent,
) -> Result<(), GatewayError> {
    let user_id = session.identity.profile_id.clone();

    match event {
        ConferenceClientEvent::JoinConference { dialog_id } => {
            // Conference entry requires live membership of the dialog.
            let dialog = state
                .registry
                .find_dialog_room(dialog_id.clone())
                .await?
                .ok_or_else(|| GatewayError::NotAMember(dialog_id.clone()))?;
            if !dialog.is_member(user_id.clone()).await? {
                return Err(GatewayError::NotAMember(dialog_id));
            }

            let room = state
                .registry
                .conference_room(dialog_id.clone(), user_id.clone())
                .await?;
            let reply = room
                .join(
                    user_id.clone(),
                    session.connection_id.clone(),
                    session.handle.clone(),
                )
                .await?;

            // Allocate the participant's transport while they are joined
            // but not yet negotiated.
            let transport = state
                .media
                .create_transport(&dialog_id, &user_id)
                .await
                .map_err(GatewayError::from);
            let transport_id = match transport {
                Ok(transport_id) => transport_id,
                Err(err) => {
                    // Roll the join back so the roster stays truthful.
                    let _ = room.leave(user_id).await;
                    return Err(err);
                }
            };
            room.set_transport(user_id, transport_id).await?;

            joined.insert(dialog_id.clone(), room);
            send_event(
                &session.handle,
                &ConferenceServerEvent::ConferenceJoined {
                    dialog_id,
                    participants: reply.participants,
                },
            );
            Ok(())
        }

        ConferenceClientEvent::LeaveConference { dialog_id } => {
            let room = joined
                .remove(&dialog_id)
                .ok_or(GatewayError::NotAMember(dialog_id))?;
            let released = room.leave(user_id).await?;
            close_released(state.media.as_ref(), released).await;
            Ok(())
        }

        ConferenceClientEvent::ConnectTransport {
            dialog_id,
            dtls_parameters,
        } => {
            let room = joined
                .get(&dialog_id)
                .ok_or(GatewayError::NotAMember(dialog_id.clone()))?;
            let transport_id = room.begin_connect(user_id.clone()).await?;
            state
                .media
                .connect_transport(&transport_id, &dtls_parameters)
                .await?;
            room.commit_connect(user_id).await?;
            send_event(
                &session.handle,
                &ConferenceServerEvent::TransportConnected { dialog_id },
            );
            Ok(())
        }

        ConferenceClientEvent::Produce {
            dialog_id,
            kind,
            rtp_parameters,
        } => {
            let room = joined
                .get(&dialog_id)
                .ok_or(GatewayError::NotAMember(dialog_id))?;
            let transport_id = room.begin_produce(user_id.clone(), kind).await?;
            let producer_id = state
                .media
                .create_producer(&transport_id, kind, &rtp_parameters)
                .await?;

            if let Err(err) = room
                .commit_produce(user_id, kind, producer_id.clone())
                .await
            {
                // The room refused the producer (e.g. the participant
                // vanished mid-flight); do not leak it on the SFU.
                if let Err(close_err) = state.media.close_producer(&producer_id).await {
                    warn!(
                        target: "gw.gateway",
                        producer_id = %producer_id,
                        error = %close_err,
                        "Failed to close orphaned producer"
                    );
                }
                return Err(err);
            }

            send_event(
                &session.handle,
                &ConferenceServerEvent::ProducerCreated { producer_id, kind },
            );
            Ok(())
        }

        ConferenceClientEvent::Consume {
            dialog_id,
            producer_id,
        } => {
            let room = joined
                .get(&dialog_id)
                .ok_or(GatewayError::NotAMember(dialog_id))?;
            let grant = room
                .begin_consume(user_id.clone(), producer_id.clone())
                .await?;
            let consumer_id = state
                .media
                .create_consumer(&grant.transport_id, &producer_id)
                .await?;

            match room
                .commit_consume(user_id, producer_id.clone(), consumer_id.clone())
                .await
            {
                Ok(kind) => {
                    send_event(
                        &session.handle,
                        &ConferenceServerEvent::ConsumerCreated {
                            consumer_id,
                            producer_id,
                            kind,
                            paused: true,
                        },
                    );
                    Ok(())
                }
                Err(err) => {
                    // Producer vanished between begin and commit.
                    if let Err(close_err) = state.media.close_consumer(&consumer_id).await {
                        warn!(
                            target: "gw.gateway",
                            consumer_id = %consumer_id,
                            error = %close_err,
                            "Failed to close orphaned consumer"
                        );
                    }
                    Err(err)
                }
            }
        }

        ConferenceClientEvent::PauseConsumer {
            dialog_id,
            consumer_id,
        } => {
            let room = joined
                .get(&dialog_id)
                .ok_or(GatewayError::NotAMember(dialog_id))?;
            room.pause_consumer(user_id, consumer_id.clone()).await?;
            if let Err(err) = state.media.pause_consumer(&consumer_id).await {
                warn!(
                    target: "gw.gateway",
                    consumer_id = %consumer_id,
                    error = %err,
                    "Media plane pause failed"
                );
            }
            Ok(())
        }

        ConferenceClientEvent::ResumeConsumer {
            dialog_id,
            consumer_id,
        } => {
            let room = joined
                .get(&dialog_id)
                .ok_or(GatewayError::NotAMember(dialog_id))?;
            room.resume_consumer(user_id, consumer_id.clone()).await?;
            if let Err(err) = state.media.resume_consumer(&consumer_id).await {
                warn!(
                    target: "gw.gateway",
                    consumer_id = %consumer_id,
                    error = %err,
                    "Media plane resume failed"
                );
            }
            Ok(())
        }

        ConferenceClientEvent::SetPreferredLayers {
            dialog_id,
            consumer_id,
            layers,
        } => {
            let room = joined
                .get(&dialog_id)
                .ok_or(GatewayError::NotAMember(dialog_id))?;
            room.set_preferred_layers(user_id, consumer_id.clone(), layers)
                .await?;
            // Layer switching is a hint: an SFU that cannot honor it
            // simply keeps the current layers.
            if let Err(err) = state.media.set_preferred_layers(&consumer_id, layers).await {
                debug!(
                    target: "gw.gateway",
                    consumer_id = %consumer_id,
                    error = %err,
                    "Preferred layers not applied"
                );
            }
            Ok(())
        }

        ConferenceClientEvent::Signal { dialog_id, signal } => {
            let room = joined
                .get(&dialog_id)
                .ok_or(GatewayError::NotAMember(dialog_id.clone()))?;

            // Role check runs out here so the room actor never blocks on
            // the authority backend. Lookup failures fail closed.
            let moderator = if signal.requires_moderator() {
                call_with_timeout(
                    state.persistence_timeout,
                    state.authority.is_moderator(&dialog_id, &user_id),
                )
                .await?
            } else {
                false
            };

            let released = room.relay(user_id, signal, moderator).await?;
            close_released(state.media.as_ref(), released).await;
            Ok(())
        }
    }
}

/// Close released resources against the SFU, consumers before producers
/// before transports. Best effort: the room state is already updated.
async fn close_released(media: &dyn MediaPlane, released: ReleasedMedia) {
    for consumer_id in &released.consumer_ids {
        if let Err(err) = media.close_consumer(consumer_id).await {
            debug!(
                target: "gw.gateway",
                consumer_id = %consumer_id,
                error = %err,
                "Consumer close failed"
            );
        }
    }
    for producer_id in &released.producer_ids {
        if let Err(err) = media.close_producer(producer_id).await {
            debug!(
                target: "gw.gateway",
                producer_id = %producer_id,
                error = %err,
                "Producer close failed"
            );
        }
    }
    if let Some(transport_id) = &released.transport_id {
        if let Err(err) = media.close_transport(transport_id).await {
            debug!(
                target: "gw.gateway",
                transport_id = %transport_id,
                error = %err,
                "Transport close failed"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use messenger_protocol::dialog::MediaKind;

    fn media_ref(id: &str, kind: MediaKind) -> MediaRef {
        MediaRef {
            id: id.to_string(),
            url: format!("https://cdn.example/{id}"),
            kind,
        }
    }

    #[test]
    fn test_merge_attachments_keeps_kind_order() {
        let merged = merge_attachments(
            vec![media_ref("i1", MediaKind::Image)],
            vec![media_ref("v1", MediaKind::Voice)],
            vec![media_ref("m1", MediaKind::Video)],
        );
        let ids: Vec<&str> = merged.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["i1", "v1", "m1"]);
    }
}
