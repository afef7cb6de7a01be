use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use neolia_api::config::IntercomConfig;
use neolia_api::intercom::IntercomCall;

use crate::error::ApiResult;

#[derive(Debug, Deserialize)]
struct ListenerMessage {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    call: Option<IntercomCall>,
}

fn parse_message(text: &str) -> ApiResult<Option<IntercomCall>> {
    let msg: ListenerMessage = serde_json::from_str(text)?;
    if msg.kind == "incoming_call" {
        Ok(msg.call)
    } else {
        Ok(None)
    }
}

/// Keeps a websocket to the intercom backend open and forwards announced
/// calls. Reconnects after a fixed delay until cancelled.
pub struct IncomingCallListener {
    url: Url,
    retry: Duration,
}

impl IncomingCallListener {
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

    #[must_use]
    pub fn new(config: &IntercomConfig) -> Self {
        Self::with_retry(config.ws_url.clone(), Self::RECONNECT_DELAY)
    }

    #[must_use]
    pub const fn with_retry(url: Url, retry: Duration) -> Self {
        Self { url, retry }
    }

    pub async fn run(self, calls: mpsc::Sender<IntercomCall>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                res = self.session(&calls) => match res {
                    Ok(()) => log::info!("Intercom websocket disconnected"),
                    Err(err) => log::warn!("Intercom websocket error: {err}"),
                },
            }

            if calls.is_closed() {
                return;
            }

            log::debug!("Reconnecting to intercom in {:?}", self.retry);
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(self.retry) => {}
            }
        }
    }

    async fn session(&self, calls: &mpsc::Sender<IntercomCall>) -> ApiResult<()> {
        log::info!("Connecting to intercom websocket [{}]", self.url);
        let (mut socket, _response) = connect_async(self.url.as_str()).await?;
        log::info!("Intercom websocket connected");

        while let Some(msg) = socket.next().await {
            let Message::Text(text) = msg? else {
                continue;
            };
            match parse_message(&text) {
                Ok(Some(call)) => {
                    log::info!("Incoming call from {} in room {}", call.from, call.room);
                    if calls.send(call).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(err) => log::error!("Error parsing intercom message: {err}"),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::Router;
    use axum::extract::WebSocketUpgrade;
    use axum::extract::ws::Message;
    use axum::routing::get;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use url::Url;

    use crate::intercom::listener::{IncomingCallListener, parse_message};
    use crate::test_support::serve;

    #[test]
    fn only_incoming_call_messages_carry_calls() {
        assert!(parse_message(r#"{"type":"ping"}"#).unwrap().is_none());
        assert!(parse_message("not json").is_err());

        let call = parse_message(r#"{"type":"incoming_call","call":{"id":"1","room":"r"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(call.room, "r");
    }

    #[tokio::test]
    async fn reconnects_after_close() {
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();
        let router = Router::new().route(
            "/ws/intercom",
            get(move |ws: WebSocketUpgrade| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    ws.on_upgrade(move |mut socket| async move {
                        let _ = socket.send(Message::Text("garbage".into())).await;
                        let call = json!({
                            "type": "incoming_call",
                            "call": { "id": n.to_string(), "room": "door" },
                        });
                        let _ = socket.send(Message::Text(call.to_string().into())).await;
                        let _ = socket.send(Message::Close(None)).await;
                    })
                }
            }),
        );
        let base = serve(router).await;
        let url = Url::parse(&format!("{}/ws/intercom", base.replacen("http", "ws", 1))).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let listener = IncomingCallListener::with_retry(url, Duration::from_millis(20));
        let task = tokio::spawn(listener.run(tx, cancel.clone()));

        assert_eq!(rx.recv().await.unwrap().id, "0");
        assert_eq!(rx.recv().await.unwrap().id, "1");

        cancel.cancel();
        task.await.unwrap();
        assert!(connections.load(Ordering::SeqCst) >= 2);
    }
}
