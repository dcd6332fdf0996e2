//! WebSocket connection handler
//!
//! Handles individual client connections: admission during the handshake,
//! registration with the hub, and the two tasks that make up a client actor.
//! The reader turns inbound frames into hub commands; the writer drains the
//! outbound queue onto the socket and keeps the connection alive.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::admission::{self, Authenticator, Identity};
use crate::client::{Client, ClientState, Outbound};
use crate::config::ChatConfig;
use crate::error::{AppError, ProtocolError};
use crate::framing::{encode_batch, split_records};
use crate::hub::HubHandle;
use crate::keepalive::{Activity, KeepalivePolicy};
use crate::message::{sanitize_content, ClientMessage, Message};
use crate::types::{ClientId, Username};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Why one half of a client actor stopped
#[derive(Debug)]
enum DisconnectReason {
    /// Close frame or end of stream from the peer
    ClientClosed,
    /// Nothing received within the idle window
    IdleTimeout,
    /// Frame over the size limit
    Oversize,
    ReadFailed,
    WriteFailed,
    /// Hub dropped the queue (unregistered or evicted)
    QueueClosed,
    HubClosed,
}

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake with admission, registers the client
/// with the hub and runs its reader and writer until either one stops.
pub async fn handle_connection(
    stream: TcpStream,
    hub: HubHandle,
    authenticator: Arc<dyn Authenticator>,
    config: Arc<ChatConfig>,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);
    let mut state = ClientState::Connecting;

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_frame_size);
    ws_config.max_frame_size = Some(config.max_frame_size);

    // Admission runs inside the handshake so refusals are plain HTTP responses
    let mut admitted: Option<Identity> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let identity = admission::admit(request, authenticator.as_ref(), &hub)
            .map_err(|e| e.to_response())?;
        let response =
            admission::accept_response(response, &identity).map_err(|e| e.to_response())?;
        admitted = Some(identity);
        Ok(response)
    };

    let handshake =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await;
    let mut ws_stream = match handshake {
        Ok(ws_stream) => ws_stream,
        Err(WsError::Http(response)) => {
            info!(
                "Refused connection from {} ({}): {}",
                peer_addr,
                response.status(),
                String::from_utf8_lossy(response.body().as_deref().unwrap_or_default())
            );
            advance(&mut state, ClientState::Terminated, None);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let Some(identity) = admitted else {
        return Ok(());
    };
    let client_id = ClientId::new();
    let name = identity.name;

    // Create the outbound queue; the hub owns its only sender
    let (queue_tx, queue_rx) = mpsc::channel::<Outbound>(config.queue_capacity);

    match hub
        .register(Client::new(client_id, name.clone(), queue_tx))
        .await
    {
        Ok(()) => advance(&mut state, ClientState::Registered, Some(client_id)),
        Err(AppError::Admission(e)) => {
            // Lost a race for the name after the handshake
            warn!("Client from {} refused at registration: {}", peer_addr, e);
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: e.to_string().into(),
            };
            let _ = ws_stream.close(Some(frame)).await;
            advance(&mut state, ClientState::Terminated, Some(client_id));
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    info!("Client {} ('{}') connected from {}", client_id, name, peer_addr);

    let (sink, source) = ws_stream.split();
    let activity = Activity::new();

    let reader = Reader {
        client_id,
        name,
        hub: hub.clone(),
        activity: activity.clone(),
        idle_timeout: config.keepalive.idle_timeout,
        max_content_chars: config.max_content_chars,
        max_frame_size: config.max_frame_size,
    };
    let writer = Writer {
        client_id,
        policy: config.keepalive,
        activity,
    };

    let mut read_task = tokio::spawn(reader.run(source));
    let mut write_task = tokio::spawn(writer.run(sink, queue_rx));
    advance(&mut state, ClientState::Active, Some(client_id));

    // Wait for either task to complete
    tokio::select! {
        reason = &mut read_task => {
            advance(&mut state, ClientState::Disconnecting, Some(client_id));
            debug!("Read task for {} ended: {:?}", client_id, reason);
            let _ = hub.unregister(client_id).await;

            // Let the writer flush anything already queued, then close
            if timeout(config.keepalive.write_timeout, &mut write_task).await.is_err() {
                write_task.abort();
            }
        }
        reason = &mut write_task => {
            advance(&mut state, ClientState::Disconnecting, Some(client_id));
            debug!("Write task for {} ended: {:?}", client_id, reason);
            read_task.abort();
            let _ = hub.unregister(client_id).await;
        }
    }

    advance(&mut state, ClientState::Terminated, Some(client_id));
    info!("Client {} disconnected", client_id);

    Ok(())
}

fn advance(state: &mut ClientState, next: ClientState, client_id: Option<ClientId>) {
    debug_assert!(state.can_advance_to(next), "{:?} -> {:?}", state, next);
    match client_id {
        Some(id) => debug!("Client {}: {:?} -> {:?}", id, state, next),
        None => debug!("Connection: {:?} -> {:?}", state, next),
    }
    *state = next;
}

/// Inbound half of a client actor
struct Reader {
    client_id: ClientId,
    name: Username,
    hub: HubHandle,
    activity: Activity,
    idle_timeout: Duration,
    max_content_chars: usize,
    max_frame_size: usize,
}

impl Reader {
    async fn run(self, mut source: WsSource) -> DisconnectReason {
        loop {
            let frame = match timeout(self.idle_timeout, source.next()).await {
                Err(_) => {
                    info!("Client {} idle for {:?}", self.client_id, self.idle_timeout);
                    return DisconnectReason::IdleTimeout;
                }
                Ok(None) => return DisconnectReason::ClientClosed,
                Ok(Some(Err(WsError::Capacity(e)))) => {
                    warn!("Oversized frame from {}: {}", self.client_id, e);
                    let _ = self
                        .reject(ProtocolError::Oversize {
                            max: self.max_frame_size,
                        })
                        .await;
                    return DisconnectReason::Oversize;
                }
                Ok(Some(Err(e))) => {
                    debug!("WebSocket error for {}: {}", self.client_id, e);
                    return DisconnectReason::ReadFailed;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            self.activity.touch();

            let result = match frame {
                WsMessage::Text(text) => self.handle_frame(&text).await,
                WsMessage::Binary(_) => self.reject(ProtocolError::UnsupportedFrame).await,
                WsMessage::Ping(_) => {
                    // Pong is handled automatically by tungstenite
                    debug!("Ping from {}", self.client_id);
                    Ok(())
                }
                WsMessage::Pong(_) => {
                    debug!("Pong from {}", self.client_id);
                    Ok(())
                }
                WsMessage::Close(_) => {
                    debug!("Client {} sent close frame", self.client_id);
                    return DisconnectReason::ClientClosed;
                }
                WsMessage::Frame(_) => Ok(()),
            };

            if let Err(e) = result {
                error!("Client {} lost the hub: {}", self.client_id, e);
                return DisconnectReason::HubClosed;
            }
        }
    }

    /// Handle every record of one text frame in order
    async fn handle_frame(&self, frame: &str) -> Result<(), AppError> {
        for record in split_records(frame) {
            self.handle_record(record).await?;
        }
        Ok(())
    }

    async fn handle_record(&self, record: &str) -> Result<(), AppError> {
        let sender = self.name.as_str();

        match ClientMessage::decode(record) {
            Ok(ClientMessage::Text { content }) => {
                let content = sanitize_content(&content, self.max_content_chars);
                if content.is_empty() {
                    debug!("Dropping blank message from {}", self.client_id);
                    return Ok(());
                }
                self.hub.broadcast(Message::text(sender, content)).await
            }
            Ok(ClientMessage::Typing { content }) => {
                let content = sanitize_content(&content, self.max_content_chars);
                self.hub.relay(Message::typing(sender, content)).await
            }
            Ok(ClientMessage::File {
                content,
                attachment,
            }) => match attachment {
                Some(attachment) => {
                    let content = sanitize_content(&content, self.max_content_chars);
                    self.hub
                        .broadcast(Message::file(sender, content, attachment))
                        .await
                }
                None => self.reject(ProtocolError::MissingAttachment).await,
            },
            Ok(ClientMessage::GetHistory) => self.hub.request_history(self.client_id).await,
            Err(e) => self.reject(e).await,
        }
    }

    /// Report a protocol error to this client only
    async fn reject(&self, err: ProtocolError) -> Result<(), AppError> {
        warn!("Protocol error from {}: {}", self.client_id, err);
        self.hub.send_to(self.client_id, err.into()).await
    }
}

/// Outbound half of a client actor
struct Writer {
    client_id: ClientId,
    policy: KeepalivePolicy,
    activity: Activity,
}

impl Writer {
    async fn run(self, mut sink: WsSink, mut queue: mpsc::Receiver<Outbound>) -> DisconnectReason {
        let period = self.policy.ping_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                next = queue.recv() => {
                    let Some(first) = next else {
                        debug!("Queue closed for {}", self.client_id);
                        let _ = timeout(self.policy.write_timeout, sink.close()).await;
                        return DisconnectReason::QueueClosed;
                    };

                    // Coalesce whatever is already waiting into one frame
                    let mut batch = vec![first];
                    while let Ok(next) = queue.try_recv() {
                        batch.push(next);
                    }

                    let frame = match encode_batch(&batch[..]) {
                        Ok(frame) => frame,
                        Err(e) => {
                            error!("Failed to serialize batch for {}: {}", self.client_id, e);
                            continue;
                        }
                    };
                    if let Err(e) = self.write(&mut sink, WsMessage::Text(frame.into())).await {
                        debug!("WebSocket send failed for {}: {}", self.client_id, e);
                        return DisconnectReason::WriteFailed;
                    }
                }
                _ = ticker.tick() => {
                    // The reader's idle deadline normally ends the connection first;
                    // this catches a reader stuck waiting on the hub.
                    let idle_for = self.activity.idle_for();
                    if idle_for > self.policy.teardown_after() {
                        info!("Client {} silent for {:?}, closing", self.client_id, idle_for);
                        return DisconnectReason::IdleTimeout;
                    }
                    if let Err(e) = self.write(&mut sink, WsMessage::Ping(Default::default())).await {
                        debug!("Ping failed for {}: {}", self.client_id, e);
                        return DisconnectReason::WriteFailed;
                    }
                }
            }
        }
    }

    /// One socket write bounded by the write deadline
    async fn write(&self, sink: &mut WsSink, frame: WsMessage) -> Result<(), AppError> {
        match timeout(self.policy.write_timeout, sink.send(frame)).await {
            Ok(result) => result.map_err(AppError::from),
            Err(_) => Err(AppError::WriteTimeout(self.policy.write_timeout)),
        }
    }
}
