use crate::hub::{FanoutHub, Subscription};
use crate::rest::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Inbound control frame: `{"subscribe": "machine_01"}` or
/// `{"subscribe": "all"}`.
#[derive(Debug, Deserialize)]
struct ControlFrame {
    subscribe: String,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

/// Manage one observer connection after upgrade: register with the hub,
/// forward hub messages to the sink from a spawned task, and process inbound
/// subscription frames until the peer goes away.
async fn handle_socket(socket: WebSocket, hub: Arc<FanoutHub>) {
    let conn_id = Uuid::new_v4();
    let mut rx = hub.add(conn_id).await;
    let observers = hub.observer_count().await;
    info!(conn_id = %conn_id, observers = observers, "Observer connected");
    let (mut sink, mut stream) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(Message::Text(text)) => match serde_json::from_str::<ControlFrame>(&text) {
                Ok(frame) => {
                    let subscription = parse_subscription(&frame.subscribe);
                    debug!(conn_id = %conn_id, ?subscription, "Observer changed subscription");
                    hub.set_subscription(conn_id, subscription).await;
                }
                Err(e) => {
                    debug!(conn_id = %conn_id, "Ignoring unrecognized frame: {}", e);
                }
            },
            Ok(_) => {}
            Err(e) => {
                debug!(conn_id = %conn_id, "WebSocket receive error: {}", e);
                break;
            }
        }
    }

    hub.remove(conn_id).await;
    send_task.abort();
    info!(conn_id = %conn_id, "Observer disconnected");
}

fn parse_subscription(target: &str) -> Subscription {
    match target {
        "all" | "*" => Subscription::All,
        device_id => Subscription::Device(device_id.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscription() {
        assert_eq!(parse_subscription("all"), Subscription::All);
        assert_eq!(parse_subscription("*"), Subscription::All);
        assert_eq!(
            parse_subscription("machine_01"),
            Subscription::Device("machine_01".to_string())
        );
    }
}
