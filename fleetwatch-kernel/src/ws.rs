use crate::contracts::Envelope;
use crate::fanout::{BroadcastFanout, ClientId};
use crate::http::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Inbound client request.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientAction {
    Subscribe { machine_id: String },
    Unsubscribe { machine_id: String },
    Ping,
}

/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app.fanout, app.client_send_timeout))
}

/// One writer task drains the client's queue into the socket; the current
/// task reads client actions. Either side failing ends the connection.
async fn handle_socket(socket: WebSocket, fanout: Arc<BroadcastFanout>, send_timeout: Duration) {
    let (client_id, mut rx) = fanout.register();
    let (mut sink, mut stream) = socket.split();

    let writer_fanout = fanout.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = Message::Text(frame.to_string().into());
            match tokio::time::timeout(send_timeout, sink.send(message)).await {
                Ok(Ok(())) => writer_fanout.touch(client_id),
                Ok(Err(e)) => {
                    tracing::debug!(client_id, error = %e, "socket write failed");
                    break;
                }
                Err(_) => {
                    tracing::warn!(client_id, timeout_ms = send_timeout.as_millis() as u64, "socket write timed out");
                    break;
                }
            }
        }
        writer_fanout.unregister(client_id);
        let _ = sink.close().await;
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                fanout.touch(client_id);
                handle_action(&fanout, client_id, text.as_str());
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => fanout.touch(client_id),
            Err(e) => {
                tracing::debug!(client_id, error = %e, "socket read failed");
                break;
            }
        }
    }

    fanout.unregister(client_id);
    writer.abort();
}

fn handle_action(fanout: &BroadcastFanout, client_id: ClientId, text: &str) {
    match serde_json::from_str::<ClientAction>(text) {
        Ok(ClientAction::Subscribe { machine_id }) => {
            fanout.subscribe(client_id, &machine_id);
        }
        Ok(ClientAction::Unsubscribe { machine_id }) => {
            fanout.unsubscribe(client_id, &machine_id);
        }
        Ok(ClientAction::Ping) => {
            fanout.send_to(client_id, &Envelope::heartbeat(fanout.client_count()));
        }
        Err(e) => tracing::debug!(client_id, error = %e, "ignoring client message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::Subscription;

    #[test]
    fn actions_drive_subscriptions() {
        let fanout = BroadcastFanout::new(8);
        let (id, mut rx) = fanout.register();

        handle_action(&fanout, id, r#"{"action":"subscribe","machine_id":"M1"}"#);
        assert!(matches!(fanout.subscription(id), Some(Subscription::Machines(_))));

        handle_action(&fanout, id, r#"{"action":"unsubscribe","machine_id":"M1"}"#);
        assert_eq!(fanout.subscription(id), Some(Subscription::All));

        handle_action(&fanout, id, r#"{"action":"ping"}"#);
        handle_action(&fanout, id, "not json");

        let kinds: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|f| serde_json::from_str::<serde_json::Value>(&f).unwrap()["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds, ["connection", "subscription", "unsubscription", "heartbeat"]);
    }
}
