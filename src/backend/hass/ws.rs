use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, connect_async};

use crate::backend::hass::client::{HassClient, HassState};
use crate::backend::hass::{EntityMap, HassConnector, HassLink, HassSession};
use crate::error::{ApiError, ApiResult};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const GET_STATES_ID: u64 = 1;
const SUBSCRIBE_ID: u64 = 2;

#[derive(Debug, Deserialize)]
struct HassWsEventEnvelope {
    #[serde(default)]
    pub event_type: String,
    pub data: HassWsEventData,
}

#[derive(Debug, Deserialize)]
struct HassWsEventData {
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub new_state: Option<HassState>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum HassWsIncoming {
    #[serde(rename = "auth_required")]
    AuthRequired,
    #[serde(rename = "auth_ok")]
    AuthOk,
    #[serde(rename = "auth_invalid")]
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename = "result")]
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
    #[serde(rename = "event")]
    Event { event: HassWsEventEnvelope },
    #[serde(other)]
    Other,
}

enum WsCommand {
    CallService {
        domain: String,
        service: String,
        data: Map<String, Value>,
        reply: oneshot::Sender<ApiResult<()>>,
    },
    GetStates {
        reply: oneshot::Sender<ApiResult<Vec<HassState>>>,
    },
}

enum Pending {
    CallService(oneshot::Sender<ApiResult<()>>),
    GetStates(oneshot::Sender<ApiResult<Vec<HassState>>>),
}

impl Pending {
    fn fail(self, err: &str) {
        match self {
            Self::CallService(reply) => {
                let _ = reply.send(Err(ApiError::service_error(err.to_string())));
            }
            Self::GetStates(reply) => {
                let _ = reply.send(Err(ApiError::service_error(err.to_string())));
            }
        }
    }
}

/// Connects to the Home Assistant websocket API and maintains the full entity
/// map of the instance, pushing a copy after every change.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

impl WsConnector {
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    const UPDATE_QUEUE: usize = 32;

    async fn handshake(url: &str, token: &str) -> ApiResult<(Socket, EntityMap)> {
        let client = HassClient::with_token(url, token)?;
        let ws_url = client.ws_endpoint_url()?;
        let (mut socket, _response) = connect_async(ws_url.as_str()).await?;

        // Consume initial auth challenge.
        let _ = socket.next().await;

        let auth = json!({
            "type": "auth",
            "access_token": token.trim(),
        });
        socket.send(Message::Text(auth.to_string().into())).await?;

        loop {
            match next_incoming(&mut socket, "auth").await? {
                HassWsIncoming::AuthOk => break,
                HassWsIncoming::AuthInvalid { message } => {
                    return Err(ApiError::service_error(format!(
                        "Home Assistant websocket auth failed (check token): {}",
                        message.unwrap_or_default()
                    )));
                }
                _ => {}
            }
        }

        let get_states = json!({ "id": GET_STATES_ID, "type": "get_states" });
        socket
            .send(Message::Text(get_states.to_string().into()))
            .await?;

        let entities = loop {
            if let HassWsIncoming::Result {
                id: GET_STATES_ID,
                success,
                result,
                error,
            } = next_incoming(&mut socket, "get_states").await?
            {
                if !success {
                    return Err(ApiError::service_error(format!(
                        "Home Assistant get_states failed: {}",
                        error.unwrap_or(Value::Null)
                    )));
                }
                let states: Vec<HassState> =
                    serde_json::from_value(result.unwrap_or(Value::Array(vec![])))?;
                break entity_map(states);
            }
        };

        let sub = json!({
            "id": SUBSCRIBE_ID,
            "type": "subscribe_events",
            "event_type": "state_changed",
        });
        socket.send(Message::Text(sub.to_string().into())).await?;

        loop {
            if let HassWsIncoming::Result {
                id: SUBSCRIBE_ID,
                success,
                error,
                ..
            } = next_incoming(&mut socket, "subscribe").await?
            {
                if success {
                    break;
                }
                return Err(ApiError::service_error(format!(
                    "Home Assistant subscribe_events failed: {}",
                    error.unwrap_or(Value::Null)
                )));
            }
        }

        Ok((socket, entities))
    }
}

#[async_trait]
impl HassConnector for WsConnector {
    async fn connect(&self, url: &str, token: &str) -> ApiResult<HassLink> {
        let (socket, entities) =
            tokio::time::timeout(Self::CONNECT_TIMEOUT, Self::handshake(url, token))
            .await
            .map_err(|_| {
                ApiError::service_error(format!("Home Assistant websocket timed out [{url}]"))
            })??;

        log::info!(
            "Home Assistant websocket connected [{url}], {} entities",
            entities.len()
        );

        let (update_tx, update_rx) = mpsc::channel(Self::UPDATE_QUEUE);
        let (command_tx, command_rx) = mpsc::channel(Self::UPDATE_QUEUE);

        // the snapshot is the first push listeners see
        update_tx
            .send(entities.clone())
            .await
            .map_err(|_| ApiError::service_error("update channel closed".to_string()))?;

        let task = SessionTask {
            socket,
            commands: command_rx,
            updates: update_tx,
            pending: HashMap::new(),
            next_id: SUBSCRIBE_ID + 1,
            entities,
        };
        tokio::spawn(task.run());

        Ok(HassLink {
            session: Arc::new(WsSession {
                commands: command_tx,
            }),
            updates: update_rx,
        })
    }
}

async fn next_incoming(socket: &mut Socket, stage: &str) -> ApiResult<HassWsIncoming> {
    loop {
        let Some(msg) = socket.next().await else {
            return Err(ApiError::service_error(format!(
                "Home Assistant websocket closed during {stage}"
            )));
        };
        if let Message::Text(text) = msg? {
            return Ok(serde_json::from_str(&text)?);
        }
    }
}

fn entity_map(states: Vec<HassState>) -> EntityMap {
    states
        .into_iter()
        .map(|state| (state.entity_id.clone(), state))
        .collect()
}

struct SessionTask {
    socket: Socket,
    commands: mpsc::Receiver<WsCommand>,
    updates: mpsc::Sender<EntityMap>,
    pending: HashMap<u64, Pending>,
    next_id: u64,
    entities: EntityMap,
}

impl SessionTask {
    async fn run(mut self) {
        let reason = loop {
            tokio::select! {
                msg = self.socket.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break "closed by server",
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            log::debug!("Home Assistant websocket error: {err}");
                            break "websocket error";
                        }
                    };
                    match serde_json::from_str::<HassWsIncoming>(&text) {
                        Ok(incoming) => {
                            if !self.handle_incoming(incoming).await {
                                break "listener gone";
                            }
                        }
                        Err(err) => log::debug!("Ignoring websocket message: {err}"),
                    }
                }
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        let _ = self.socket.close(None).await;
                        break "session dropped";
                    };
                    if let Err(err) = self.send_command(cmd).await {
                        log::debug!("Home Assistant websocket send failed: {err}");
                        break "send failed";
                    }
                }
            }
        };

        log::debug!("Home Assistant websocket session ended: {reason}");
        for (_, pending) in self.pending.drain() {
            pending.fail("Home Assistant websocket closed");
        }
    }

    async fn send_command(&mut self, cmd: WsCommand) -> ApiResult<()> {
        let id = self.next_id;
        self.next_id += 1;

        let (msg, pending) = match cmd {
            WsCommand::CallService {
                domain,
                service,
                data,
                reply,
            } => (
                json!({
                    "id": id,
                    "type": "call_service",
                    "domain": domain,
                    "service": service,
                    "service_data": data,
                }),
                Pending::CallService(reply),
            ),
            WsCommand::GetStates { reply } => (
                json!({ "id": id, "type": "get_states" }),
                Pending::GetStates(reply),
            ),
        };

        self.pending.insert(id, pending);
        self.socket.send(Message::Text(msg.to_string().into())).await?;
        Ok(())
    }

    /// Returns false once nobody listens for updates anymore.
    async fn handle_incoming(&mut self, incoming: HassWsIncoming) -> bool {
        match incoming {
            HassWsIncoming::Event { event } if event.event_type == "state_changed" => {
                let data = event.data;
                if data.entity_id.is_empty() {
                    return true;
                }
                match data.new_state {
                    Some(state) => {
                        self.entities.insert(data.entity_id, state);
                    }
                    None => {
                        self.entities.remove(&data.entity_id);
                    }
                }
                self.updates.send(self.entities.clone()).await.is_ok()
            }
            HassWsIncoming::Result {
                id,
                success,
                result,
                error,
            } => {
                let Some(pending) = self.pending.remove(&id) else {
                    return true;
                };
                let failure = || {
                    ApiError::service_error(format!(
                        "Home Assistant command failed: {}",
                        error.clone().unwrap_or(Value::Null)
                    ))
                };
                match pending {
                    Pending::CallService(reply) => {
                        let _ = reply.send(if success { Ok(()) } else { Err(failure()) });
                    }
                    Pending::GetStates(reply) => {
                        let res = if success {
                            serde_json::from_value(result.unwrap_or(Value::Array(vec![])))
                                .map_err(ApiError::from)
                        } else {
                            Err(failure())
                        };
                        let _ = reply.send(res);
                    }
                }
                true
            }
            _ => true,
        }
    }
}

struct WsSession {
    commands: mpsc::Sender<WsCommand>,
}

impl WsSession {
    async fn request<T: Send>(
        &self,
        make: impl FnOnce(oneshot::Sender<ApiResult<T>>) -> WsCommand + Send,
    ) -> ApiResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| ApiError::NotConnected)?;
        rx.await.map_err(|_| ApiError::NotConnected)?
    }
}

#[async_trait]
impl HassSession for WsSession {
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Map<String, Value>,
    ) -> ApiResult<()> {
        let domain = domain.to_string();
        let service = service.to_string();
        self.request(|reply| WsCommand::CallService {
            domain,
            service,
            data,
            reply,
        })
        .await
    }

    async fn get_states(&self) -> ApiResult<Vec<HassState>> {
        self.request(|reply| WsCommand::GetStates { reply }).await
    }
}
