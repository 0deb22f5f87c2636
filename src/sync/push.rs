//! Websocket push channel feeding the quote synchronizer.

use super::QuoteSynchronizer;
use crate::cache::now_unix_ms;
use crate::error::AppError;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type PushStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const UPDATE_MESSAGE_TYPE: &str = "update";

#[derive(Debug, Clone, PartialEq)]
pub struct PushUpdate {
    pub id: String,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
struct PushWire {
    #[serde(rename = "type")]
    kind: Option<String>,
    id: Option<Value>,
    #[serde(default)]
    value: Value,
}

/// Decodes one push frame. Frames of any other type yield `None`.
pub fn parse_push_message(payload: &mut [u8]) -> Result<Option<PushUpdate>, AppError> {
    let wire: PushWire = simd_json::serde::from_slice(payload)?;
    if wire.kind.as_deref() != Some(UPDATE_MESSAGE_TYPE) {
        return Ok(None);
    }

    let id = match wire.id {
        Some(Value::String(id)) => id.trim().to_string(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return Ok(None),
    };
    if id.is_empty() {
        return Ok(None);
    }

    Ok(Some(PushUpdate {
        id,
        value: wire.value,
    }))
}

async fn connect_push_stream(url: &str) -> Result<PushStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
    Ok(stream)
}

enum FrameDirective {
    Continue,
    Reconnect,
}

fn handle_frame(message: Message, synchronizer: &QuoteSynchronizer) -> FrameDirective {
    let mut payload = match message {
        Message::Text(text) => text.into_bytes(),
        Message::Binary(bytes) => bytes,
        Message::Close(_) => return FrameDirective::Reconnect,
        _ => return FrameDirective::Continue,
    };

    match parse_push_message(payload.as_mut_slice()) {
        Ok(Some(update)) => {
            synchronizer.apply_push(update);
        }
        Ok(None) => {}
        Err(error) => debug!(%error, "ignoring undecodable push frame"),
    }
    FrameDirective::Continue
}

/// Keeps a push connection open until `cancel_token` fires, reconnecting
/// with capped backoff.
pub async fn run_push_channel(
    url: String,
    synchronizer: QuoteSynchronizer,
    cancel_token: CancellationToken,
) {
    let mut reconnect_attempt = 0_u32;

    while !cancel_token.is_cancelled() {
        match connect_push_stream(&url).await {
            Ok(mut stream) => {
                info!(url = %url, "push channel connected");
                reconnect_attempt = 0;

                loop {
                    let frame = tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        next = stream.next() => next,
                    };

                    let Some(frame) = frame else {
                        break;
                    };

                    match frame {
                        Ok(message) => {
                            if let FrameDirective::Reconnect = handle_frame(message, &synchronizer) {
                                break;
                            }
                        }
                        Err(error) => {
                            warn!(%error, "push channel frame error");
                            break;
                        }
                    }
                }

                if cancel_token.is_cancelled() {
                    let _ = stream.close(None).await;
                    break;
                }
            }
            Err(error) => warn!(url = %url, attempt = reconnect_attempt, %error, "push channel connect failed"),
        }

        reconnect_attempt = reconnect_attempt.saturating_add(1);
        let delay = reconnect_delay(reconnect_attempt);
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!("push channel stopped");
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = 200_u64.saturating_mul(1_u64 << exponent);
    let jitter_ms = now_unix_ms().unsigned_abs() % 250;
    Duration::from_millis((base_ms + jitter_ms).min(10_000))
}
