//! Event bridge: the persistent subscription to the external event source.
//!
//! Speaks the event source's WebSocket protocol: an auth handshake on connect,
//! id-correlated commands (`subscribe_events`, `get_states`) and pushed
//! `state_changed` events. Updates for the tracked entity are mapped to
//! [`DomainState`] and pushed into the bounded handoff queue; a terminal
//! connection failure is reported once on the fault channel, where the service
//! adapter's restart policy picks it up. The bridge itself never retries.

use core::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};
use tracing::{debug, info, warn};

use crate::mapper::DomainState;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors surfaced by the event bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to connect to event source at {address}: {source}")]
    Connect {
        address: String,
        source: tungstenite::Error,
    },
    #[error("event source did not complete the connect handshake within {0:?}")]
    ConnectTimeout(Duration),
    #[error("event source rejected the credential{}", .message.as_ref().map(|m| format!(": {m}")).unwrap_or_default())]
    AuthRejected { message: Option<String> },
    #[error("event source closed the connection during {phase}")]
    ConnectionClosed { phase: &'static str },
    #[error("unexpected event source message during {phase}")]
    Protocol { phase: &'static str },
    #[error("event source refused the subscription")]
    SubscribeRejected,
    #[error("entity '{0}' is not known to the event source")]
    UnknownEntity(String),
    #[error("bridge is not connected")]
    NotConnected,
    #[error("websocket transport error: {0}")]
    Transport(#[from] tungstenite::Error),
}

/// Messages sent to the event source.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage<'a> {
    Auth { access_token: &'a str },
    SubscribeEvents { id: u64, event_type: &'a str },
    GetStates { id: u64 },
}

/// Messages received from the event source.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    AuthRequired,
    AuthOk,
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
    Event {
        #[serde(default)]
        id: Option<u64>,
        event: EventPayload,
    },
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    event_type: String,
    #[serde(default)]
    data: Option<StateChangedData>,
}

#[derive(Debug, Deserialize)]
struct StateChangedData {
    entity_id: String,
    #[serde(default)]
    new_state: Option<EntityState>,
}

#[derive(Debug, Deserialize)]
struct EntityState {
    entity_id: String,
    state: String,
}

/// Handle to the spawned listen task.
#[derive(Debug)]
struct Listener {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns the single connection to the event source.
///
/// Present in one of two phases: command phase (between [`EventBridge::open`]
/// and [`EventBridge::spawn_listener`], the socket is driven directly) and
/// listen phase (the socket has moved into the listen task).
#[derive(Debug)]
pub struct EventBridge {
    conn: Option<WsStream>,
    listener: Option<Listener>,
    next_id: u64,
}

impl EventBridge {
    /// Connects to the event source and performs the auth handshake.
    ///
    /// # Errors
    ///
    /// Fails with [`BridgeError::Connect`] when the socket cannot be
    /// established and [`BridgeError::AuthRejected`] when the credential is
    /// refused.
    pub async fn open(address: &str, token: &SecretString) -> Result<Self, BridgeError> {
        let (mut stream, _) = connect_async(address)
            .await
            .map_err(|source| BridgeError::Connect {
                address: address.to_string(),
                source,
            })?;

        match recv_message(&mut stream, "auth").await? {
            ServerMessage::AuthRequired => {}
            _ => return Err(BridgeError::Protocol { phase: "auth" }),
        }

        send_message(
            &mut stream,
            &ClientMessage::Auth {
                access_token: token.expose_secret(),
            },
        )
        .await?;

        match recv_message(&mut stream, "auth").await? {
            ServerMessage::AuthOk => {}
            ServerMessage::AuthInvalid { message } => {
                return Err(BridgeError::AuthRejected { message });
            }
            _ => return Err(BridgeError::Protocol { phase: "auth" }),
        }

        info!(address, "connected to event source");
        Ok(Self {
            conn: Some(stream),
            listener: None,
            next_id: 0,
        })
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Subscribes to state-change events.
    ///
    /// # Errors
    ///
    /// Fails when not in the command phase or when the event source refuses
    /// the subscription.
    pub async fn subscribe(&mut self) -> Result<(), BridgeError> {
        let id = self.next_id();
        let stream = self.conn.as_mut().ok_or(BridgeError::NotConnected)?;
        send_message(
            stream,
            &ClientMessage::SubscribeEvents {
                id,
                event_type: "state_changed",
            },
        )
        .await?;
        let (success, _) = await_result(stream, id, "subscribe").await?;
        if success {
            Ok(())
        } else {
            Err(BridgeError::SubscribeRejected)
        }
    }

    /// Fetches the current raw state of one entity.
    ///
    /// # Errors
    ///
    /// Fails when not in the command phase, when the fetch is refused, or when
    /// the entity is absent from the returned snapshot.
    pub async fn current_state(&mut self, entity_id: &str) -> Result<String, BridgeError> {
        let id = self.next_id();
        let stream = self.conn.as_mut().ok_or(BridgeError::NotConnected)?;
        send_message(stream, &ClientMessage::GetStates { id }).await?;
        let (success, result) = await_result(stream, id, "get_states").await?;
        if !success {
            return Err(BridgeError::Protocol { phase: "get_states" });
        }
        let states: Vec<EntityState> = serde_json::from_value(result.unwrap_or_default())
            .map_err(|_| BridgeError::Protocol { phase: "get_states" })?;
        states
            .into_iter()
            .find(|state| state.entity_id == entity_id)
            .map(|state| state.state)
            .ok_or_else(|| BridgeError::UnknownEntity(entity_id.to_string()))
    }

    /// Moves the connection into an indefinite listen task.
    ///
    /// Mapped updates for `entity_id` go to `updates` (the handoff queue);
    /// events for other entities are ignored. On a terminal connection failure
    /// the task reports once on `faults` and exits; retrying is the service
    /// adapter's job.
    ///
    /// # Errors
    ///
    /// Fails with [`BridgeError::NotConnected`] outside the command phase.
    pub fn spawn_listener(
        &mut self,
        entity_id: String,
        updates: mpsc::Sender<DomainState>,
        faults: mpsc::Sender<BridgeError>,
    ) -> Result<(), BridgeError> {
        let stream = self.conn.take().ok_or(BridgeError::NotConnected)?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(listen_loop(stream, entity_id, updates, faults, stop_rx));
        self.listener = Some(Listener {
            stop: stop_tx,
            task,
        });
        Ok(())
    }

    /// Tears the connection down. Idempotent; safe to call even if `open`
    /// never succeeded or the listener already died.
    ///
    /// # Errors
    ///
    /// Currently infallible; failures during teardown are logged, not surfaced.
    pub async fn close(&mut self) -> Result<(), BridgeError> {
        if let Some(listener) = self.listener.take() {
            // The listener may already be gone after a connection fault.
            let _ = listener.stop.send(());
            if let Err(error) = listener.task.await {
                warn!(%error, "event bridge listener did not exit cleanly");
            }
        }
        if let Some(mut stream) = self.conn.take() {
            if let Err(error) = stream.close(None).await {
                debug!(%error, "closing event source connection failed");
            }
        }
        Ok(())
    }
}

async fn send_message(
    stream: &mut WsStream,
    message: &ClientMessage<'_>,
) -> Result<(), BridgeError> {
    let json =
        serde_json::to_string(message).map_err(|_| BridgeError::Protocol { phase: "send" })?;
    stream.send(Message::text(json)).await?;
    Ok(())
}

/// Reads the next textual protocol message, skipping transport frames.
async fn recv_message(
    stream: &mut WsStream,
    phase: &'static str,
) -> Result<ServerMessage, BridgeError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_ref())
                    .map_err(|_| BridgeError::Protocol { phase });
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(BridgeError::ConnectionClosed { phase });
            }
            Some(Ok(_)) => {}
            Some(Err(source)) => return Err(BridgeError::Transport(source)),
        }
    }
}

/// Waits for the command result matching `id`, letting unrelated events pass.
async fn await_result(
    stream: &mut WsStream,
    id: u64,
    phase: &'static str,
) -> Result<(bool, Option<serde_json::Value>), BridgeError> {
    loop {
        match recv_message(stream, phase).await? {
            ServerMessage::Result {
                id: result_id,
                success,
                result,
            } if result_id == id => return Ok((success, result)),
            ServerMessage::Event { .. } | ServerMessage::Result { .. } => {}
            _ => return Err(BridgeError::Protocol { phase }),
        }
    }
}

async fn listen_loop(
    mut stream: WsStream,
    entity_id: String,
    updates: mpsc::Sender<DomainState>,
    faults: mpsc::Sender<BridgeError>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => {
                drop(stream.close(None).await);
                debug!("event bridge listener stopped");
                return;
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_event_text(text.as_ref(), &entity_id, &updates).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    drop(
                        faults
                            .send(BridgeError::ConnectionClosed { phase: "listen" })
                            .await,
                    );
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(source)) => {
                    drop(faults.send(BridgeError::Transport(source)).await);
                    return;
                }
            }
        }
    }
}

async fn handle_event_text(text: &str, entity_id: &str, updates: &mpsc::Sender<DomainState>) {
    let Ok(ServerMessage::Event { event, .. }) = serde_json::from_str(text) else {
        debug!("ignoring non-event message on subscription");
        return;
    };
    if event.event_type != "state_changed" {
        return;
    }
    let Some(data) = event.data else { return };
    if data.entity_id != entity_id {
        return;
    }
    let Some(new_state) = data.new_state else {
        warn!(entity = data.entity_id, "entity disappeared from event source");
        return;
    };
    let state = DomainState::from_raw(&new_state.state);
    // Handoff queue send; the consumer dropping the queue means the sink is
    // shutting down, which the teardown path handles.
    let _ = updates.send(state).await;
}
