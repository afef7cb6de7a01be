use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::WebSocketUpgrade;
use axum::extract::ws::{Message, WebSocket};
use axum::routing::get;
use tokio::net::TcpListener;

use crate::backend::mqtt::packet::encode_remaining_length;

/// Serves `router` on an ephemeral local port and returns its address.
pub async fn serve_addr(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Serves `router` on an ephemeral local port and returns its base url.
pub async fn serve(router: Router) -> String {
    format!("http://{}", serve_addr(router).await)
}

/// A local port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// MQTT-over-websocket broker at `/mqtt`. Accepts any CONNECT, grants every
/// subscription and then publishes `messages` in order.
pub fn mqtt_broker(messages: Vec<(String, Vec<u8>)>) -> Router {
    let messages = Arc::new(messages);
    Router::new().route(
        "/mqtt",
        get(move |ws: WebSocketUpgrade| {
            let messages = messages.clone();
            async move {
                ws.protocols(["mqtt"])
                    .on_upgrade(move |socket| broker_session(socket, messages))
            }
        }),
    )
}

async fn recv_binary(socket: &mut WebSocket) -> Option<Vec<u8>> {
    loop {
        match socket.recv().await? {
            Ok(Message::Binary(data)) => return Some(data.to_vec()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

async fn broker_session(mut socket: WebSocket, messages: Arc<Vec<(String, Vec<u8>)>>) {
    let Some(connect) = recv_binary(&mut socket).await else {
        return;
    };
    assert_eq!(connect[0], 0x10);
    socket
        .send(Message::Binary(vec![0x20, 2, 0, 0].into()))
        .await
        .unwrap();

    let Some(subscribe) = recv_binary(&mut socket).await else {
        return;
    };
    assert_eq!(subscribe[0], 0x82);
    let mut at = 1;
    while subscribe[at] & 0x80 != 0 {
        at += 1;
    }
    let id = [subscribe[at + 1], subscribe[at + 2]];
    socket
        .send(Message::Binary(vec![0x90, 4, id[0], id[1], 0, 0].into()))
        .await
        .unwrap();

    for (topic, payload) in messages.iter() {
        let topic_len = u16::try_from(topic.len()).unwrap();
        let mut packet = vec![0x30];
        encode_remaining_length(2 + topic.len() + payload.len(), &mut packet);
        packet.extend_from_slice(&topic_len.to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload);
        if socket.send(Message::Binary(packet.into())).await.is_err() {
            return;
        }
    }

    while recv_binary(&mut socket).await.is_some() {}
}
