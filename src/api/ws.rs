// =============================================================================
// WebSocket Handlers: live candle feed and strategy channel
// =============================================================================
//
// `/stream/market` clients receive the interval and perpetual-market metadata
// on connect, then drive the socket with JSON commands:
//
//   { "type": "subscribe", "symbol": "BTCUSDT", "interval": "1m", "limit": 500 }
//   { "type": "getIntervals" }
//   { "type": "getPerpetuals" }
//
// A socket holds at most one candle subscription. Subscribing again releases
// the previous one first; closing the socket releases it as well.
//
// `/stream/strategy` acknowledges the connection and echoes every text frame.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::market_data::{MarketMessage, Subscription};
use crate::types::{CacheKey, PerpetualMarket};

type WsSender = SplitSink<WebSocket, Message>;

// =============================================================================
// Wire messages
// =============================================================================

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ClientMessage {
    Subscribe {
        symbol: String,
        interval: String,
        #[serde(default)]
        limit: Option<usize>,
    },
    GetIntervals,
    GetPerpetuals,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerMessage<'a> {
    Intervals { payload: Vec<String> },
    Perpetuals { payload: Vec<PerpetualMarket> },
    Snapshot { payload: &'a MarketMessage },
    Update { payload: &'a MarketMessage },
    Error { message: &'a str },
}

impl<'a> From<&'a MarketMessage> for ServerMessage<'a> {
    fn from(msg: &'a MarketMessage) -> Self {
        match msg {
            MarketMessage::Snapshot { .. } => Self::Snapshot { payload: msg },
            MarketMessage::Update { .. } => Self::Update { payload: msg },
        }
    }
}

// =============================================================================
// /stream/market
// =============================================================================

pub async fn market_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_market_connection(socket, state))
}

/// Runs one market socket until either side closes it.
///
/// Client commands and subscription messages are multiplexed with
/// `tokio::select!`; the subscription (if any) is dropped on exit, which
/// detaches it from its live stream.
async fn handle_market_connection(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = Uuid::new_v4();
    info!(conn = %conn_id, "market socket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut subscription: Option<Subscription> = None;

    if send_metadata(&mut sender, &state).await.is_err() {
        debug!(conn = %conn_id, "market socket closed before metadata was sent");
        return;
    }

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(conn = %conn_id, error = %e, "market socket receive error");
                        break;
                    }
                };

                let outcome = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(command) => handle_command(command, &mut sender, &mut subscription, &state, conn_id).await,
                    Err(e) => {
                        debug!(conn = %conn_id, error = %e, "unparseable market socket message");
                        send(&mut sender, &ServerMessage::Error { message: "Invalid message payload" }).await
                    }
                };
                if outcome.is_err() {
                    break;
                }
            }

            update = next_update(&mut subscription) => {
                match update {
                    Some(msg) => {
                        debug!(conn = %conn_id, kind = msg.kind(), "forwarding market message");
                        if send(&mut sender, &ServerMessage::from(&msg)).await.is_err() {
                            break;
                        }
                    }
                    None => subscription = None,
                }
            }
        }
    }

    drop(subscription);
    info!(conn = %conn_id, "market socket closed");
}

async fn handle_command(
    command: ClientMessage,
    sender: &mut WsSender,
    subscription: &mut Option<Subscription>,
    state: &AppState,
    conn_id: Uuid,
) -> Result<(), axum::Error> {
    match command {
        ClientMessage::Subscribe {
            symbol,
            interval,
            limit,
        } => {
            // Release the previous window before opening the next one.
            *subscription = None;

            let limit = limit
                .unwrap_or(state.config.stream.default_limit)
                .clamp(1, state.config.stream.max_limit);
            let key = CacheKey::new(symbol, interval, limit);

            match state.streams.subscribe(key.clone()).await {
                Ok(sub) => {
                    info!(conn = %conn_id, key = %sub.key(), subscriber = sub.id(), "market socket subscribed");
                    *subscription = Some(sub);
                    Ok(())
                }
                Err(e) => {
                    warn!(conn = %conn_id, key = %key, error = %e, "market subscription failed");
                    send(sender, &ServerMessage::Error { message: "Failed to load candles" }).await
                }
            }
        }
        ClientMessage::GetIntervals => {
            send(
                sender,
                &ServerMessage::Intervals {
                    payload: state.source.supported_intervals(),
                },
            )
            .await
        }
        ClientMessage::GetPerpetuals => {
            send(
                sender,
                &ServerMessage::Perpetuals {
                    payload: state.source.perpetual_markets(),
                },
            )
            .await
        }
    }
}

async fn send_metadata(sender: &mut WsSender, state: &AppState) -> Result<(), axum::Error> {
    send(
        sender,
        &ServerMessage::Intervals {
            payload: state.source.supported_intervals(),
        },
    )
    .await?;
    send(
        sender,
        &ServerMessage::Perpetuals {
            payload: state.source.perpetual_markets(),
        },
    )
    .await
}

/// Next message of the active subscription. Pends forever without one so it
/// can sit in a `select!` arm.
async fn next_update(subscription: &mut Option<Subscription>) -> Option<MarketMessage> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn send<S>(sender: &mut S, msg: &ServerMessage<'_>) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            // Serialisation errors are not network errors; don't disconnect.
            warn!(error = %e, "failed to serialise market socket message");
            Ok(())
        }
    }
}

// =============================================================================
// /stream/strategy
// =============================================================================

pub async fn strategy_socket(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(handle_strategy_connection)
}

async fn handle_strategy_connection(mut socket: WebSocket) {
    let conn_id = Uuid::new_v4();
    info!(conn = %conn_id, "strategy socket connected");

    let connected = serde_json::json!({ "type": "connected" }).to_string();
    if socket.send(Message::Text(connected)).await.is_err() {
        return;
    }

    while let Some(msg) = socket.recv().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(conn = %conn_id, error = %e, "strategy socket receive error");
                break;
            }
        };
        let echo = serde_json::json!({ "type": "echo", "payload": text }).to_string();
        if socket.send(Message::Text(echo)).await.is_err() {
            break;
        }
    }

    info!(conn = %conn_id, "strategy socket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{KlineStream, MarketSource};
    use crate::runtime_config::RuntimeConfig;
    use crate::types::UnifiedCandle;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    /// Flat candles on demand; kline feeds stay open and silent.
    struct QuietSource;

    impl MarketSource for QuietSource {
        fn supported_intervals(&self) -> Vec<String> {
            vec!["1m".into(), "5m".into()]
        }

        fn perpetual_markets(&self) -> Vec<PerpetualMarket> {
            vec![PerpetualMarket {
                symbol: "BTCUSDT".into(),
                label: "BTC / USDT".into(),
                description: "Bitcoin perpetual".into(),
            }]
        }

        fn fetch_candles<'a>(
            &'a self,
            _symbol: &'a str,
            _interval: &'a str,
            limit: usize,
        ) -> BoxFuture<'a, anyhow::Result<Vec<UnifiedCandle>>> {
            async move {
                Ok((0..limit)
                    .map(|i| {
                        let t = i as f64 * 60_000.0;
                        [t, 10.0, 11.0, 9.0, 10.0, 1.0, t + 59_999.0, 10.0, 1.0, 0.5, 5.0].into()
                    })
                    .collect())
            }
            .boxed()
        }

        fn subscribe_kline<'a>(
            &'a self,
            _symbol: &'a str,
            _interval: &'a str,
        ) -> BoxFuture<'a, anyhow::Result<KlineStream>> {
            async { Ok(futures_util::stream::pending().boxed()) }.boxed()
        }
    }

    async fn serve() -> (Arc<AppState>, String) {
        let state = Arc::new(AppState::new(RuntimeConfig::default(), Arc::new(QuietSource)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = crate::api::rest::router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (state, format!("ws://{addr}/stream/market"))
    }

    async fn next_json(client: &mut Client) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .expect("receive error");
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn send_text(client: &mut Client, text: &str) {
        client.send(WsMessage::Text(text.to_string())).await.unwrap();
    }

    async fn wait_for_live_keys(state: &AppState, expected: &[CacheKey]) {
        for _ in 0..200 {
            if state.streams.live_keys() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("live streams {:?}, expected {:?}", state.streams.live_keys(), expected);
    }

    #[tokio::test]
    async fn market_socket_lifecycle() {
        let (state, url) = serve().await;
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let intervals = next_json(&mut client).await;
        assert_eq!(intervals, serde_json::json!({ "type": "intervals", "payload": ["1m", "5m"] }));
        let perpetuals = next_json(&mut client).await;
        assert_eq!(perpetuals["type"], "perpetuals");
        assert_eq!(perpetuals["payload"][0]["symbol"], "BTCUSDT");

        send_text(&mut client, r#"{ "type": "subscribe", "symbol": "BTCUSDT", "interval": "1m", "limit": 5 }"#).await;
        let snapshot = next_json(&mut client).await;
        assert_eq!(snapshot["type"], "snapshot");
        assert_eq!(snapshot["payload"]["type"], "snapshot");
        assert_eq!(snapshot["payload"]["symbol"], "BTCUSDT");
        assert_eq!(snapshot["payload"]["candles"].as_array().map(Vec::len), Some(5));
        wait_for_live_keys(&state, &[CacheKey::new("BTCUSDT", "1m", 5)]).await;

        // A second subscribe releases the first window.
        send_text(&mut client, r#"{ "type": "subscribe", "symbol": "ETHUSDT", "interval": "1m", "limit": 5 }"#).await;
        let snapshot = next_json(&mut client).await;
        assert_eq!(snapshot["payload"]["symbol"], "ETHUSDT");
        wait_for_live_keys(&state, &[CacheKey::new("ETHUSDT", "1m", 5)]).await;

        send_text(&mut client, "definitely not json").await;
        let reply = next_json(&mut client).await;
        assert_eq!(reply, serde_json::json!({ "type": "error", "message": "Invalid message payload" }));

        send_text(&mut client, r#"{ "type": "getIntervals" }"#).await;
        assert_eq!(next_json(&mut client).await["type"], "intervals");

        client.close(None).await.unwrap();
        wait_for_live_keys(&state, &[]).await;
    }

    #[test]
    fn parses_client_commands() {
        let cmd: ClientMessage =
            serde_json::from_str(r#"{ "type": "subscribe", "symbol": "ETHUSDT", "interval": "5m" }"#).unwrap();
        assert_eq!(
            cmd,
            ClientMessage::Subscribe {
                symbol: "ETHUSDT".into(),
                interval: "5m".into(),
                limit: None
            }
        );

        let cmd: ClientMessage = serde_json::from_str(r#"{ "type": "getIntervals" }"#).unwrap();
        assert_eq!(cmd, ClientMessage::GetIntervals);
        let cmd: ClientMessage = serde_json::from_str(r#"{ "type": "getPerpetuals" }"#).unwrap();
        assert_eq!(cmd, ClientMessage::GetPerpetuals);
    }

    #[test]
    fn rejects_unknown_or_incomplete_commands() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{ "type": "unsubscribe" }"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{ "type": "subscribe", "symbol": "BTCUSDT" }"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn market_messages_are_wrapped_with_their_kind() {
        let candle: UnifiedCandle = [60_000.0, 1.0, 2.0, 0.5, 1.5, 3.0, 119_999.0, 4.5, 7.0, 1.0, 1.5].into();
        let msg = MarketMessage::Update {
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            candle,
        };
        let value = serde_json::to_value(ServerMessage::from(&msg)).unwrap();
        assert_eq!(value["type"], "update");
        assert_eq!(value["payload"]["type"], "update");
        assert_eq!(value["payload"]["symbol"], "BTCUSDT");
        assert_eq!(value["payload"]["candle"][0], 60_000.0);
    }

    #[test]
    fn error_message_shape() {
        let value = serde_json::to_value(ServerMessage::Error {
            message: "Invalid message payload",
        })
        .unwrap();
        assert_eq!(value, serde_json::json!({ "type": "error", "message": "Invalid message payload" }));
    }
}
