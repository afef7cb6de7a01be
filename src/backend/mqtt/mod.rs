pub mod packet;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::backend::mqtt::packet::{ConnectOptions, Packet, SUBACK_FAILURE};
use crate::error::{ApiError, ApiResult};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A message delivered on one of the subscribed topics.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// MQTT over websocket, enough to subscribe and wait for retained or live
/// publishes. No QoS above 0, no session persistence.
pub struct MqttWsClient {
    socket: Socket,
    buffer: Vec<u8>,
    next_packet_id: u16,
}

impl MqttWsClient {
    const KEEP_ALIVE_SECS: u16 = 60;

    pub async fn connect(url: &str, username: &str, password: &str) -> ApiResult<Self> {
        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));
        let (socket, _response) = connect_async(request).await?;

        let mut client = Self {
            socket,
            buffer: vec![],
            next_packet_id: 1,
        };

        let client_id = format!("neolia-{}", uuid::Uuid::new_v4().simple());
        let connect = packet::encode_connect(&ConnectOptions {
            client_id: &client_id,
            username,
            password,
            keep_alive: Self::KEEP_ALIVE_SECS,
        })?;
        client.send(connect).await?;

        loop {
            match client.recv_packet().await? {
                Packet::ConnAck { return_code: 0 } => break,
                Packet::ConnAck { return_code } => {
                    return Err(ApiError::service_error(format!(
                        "MQTT broker refused connection (code {return_code})"
                    )));
                }
                other => log::trace!("Ignoring {other:?} before CONNACK"),
            }
        }

        log::debug!("MQTT connected [{url}]");
        Ok(client)
    }

    async fn send(&mut self, packet: Vec<u8>) -> ApiResult<()> {
        self.socket.send(Message::Binary(packet.into())).await?;
        Ok(())
    }

    async fn recv_packet(&mut self) -> ApiResult<Packet> {
        loop {
            if let Some((packet, used)) = Packet::decode(&self.buffer)? {
                self.buffer.drain(..used);
                return Ok(packet);
            }

            match self.socket.next().await {
                Some(Ok(Message::Binary(data))) => self.buffer.extend_from_slice(&data),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ApiError::service_error(
                        "MQTT broker closed the connection".to_string(),
                    ));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }

    pub async fn subscribe(&mut self, topics: &[String]) -> ApiResult<()> {
        let packet_id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        self.send(packet::encode_subscribe(packet_id, topics)?)
            .await?;

        loop {
            match self.recv_packet().await? {
                Packet::SubAck {
                    packet_id: id,
                    return_codes,
                } if id == packet_id => {
                    if return_codes.contains(&SUBACK_FAILURE) {
                        return Err(ApiError::service_error(format!(
                            "MQTT subscription refused for {topics:?}"
                        )));
                    }
                    log::debug!("MQTT subscribed to {topics:?}");
                    return Ok(());
                }
                other => log::trace!("Ignoring {other:?} before SUBACK"),
            }
        }
    }

    /// Waits for the next publish. Other packets are skipped.
    pub async fn next_message(&mut self) -> ApiResult<MqttMessage> {
        loop {
            if let Packet::Publish { topic, payload } = self.recv_packet().await? {
                return Ok(MqttMessage { topic, payload });
            }
        }
    }

    pub async fn disconnect(mut self) {
        let _ = self.send(packet::encode_disconnect()).await;
        let _ = self.socket.close(None).await;
    }
}
