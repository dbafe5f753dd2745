use crate::error::AppError;
use crate::sync::types::{CloseEvent, ControlMessage};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type EventWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Lifecycle callbacks of a transport, delivered in order over one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Close(CloseEvent),
}

pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

pub trait TransportHandle: Send {
    fn send(&self, message: &ControlMessage) -> bool;
    fn is_open(&self) -> bool;
    fn dispose(&mut self);
}

pub trait Transport: Send + Sync {
    fn subscribe(
        &self,
        tokens: Arc<dyn TokenProvider>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn TransportHandle>;
}

/// Socket transport that owns reconnects; the engine only sees open/close transitions.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Transport for WebSocketTransport {
    fn subscribe(
        &self,
        tokens: Arc<dyn TokenProvider>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn TransportHandle> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let cancel_token = CancellationToken::new();

        tokio::spawn(run_socket(
            self.url.clone(),
            tokens,
            events,
            outbound_rx,
            Arc::clone(&open),
            cancel_token.clone(),
        ));

        Box::new(WebSocketHandle {
            outbound: outbound_tx,
            open,
            cancel_token,
        })
    }
}

struct WebSocketHandle {
    outbound: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
    cancel_token: CancellationToken,
}

impl TransportHandle for WebSocketHandle {
    fn send(&self, message: &ControlMessage) -> bool {
        if !self.is_open() {
            return false;
        }
        match serde_json::to_string(message) {
            Ok(text) => self.outbound.send(text).is_ok(),
            Err(error) => {
                warn!(%error, "failed to encode control message");
                false
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    fn dispose(&mut self) {
        self.cancel_token.cancel();
        self.open.store(false, Ordering::Relaxed);
    }
}

impl Drop for WebSocketHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

pub async fn connect_event_stream(url: &str, token: Option<String>) -> Result<EventWsStream, AppError> {
    let mut request = url.into_client_request()?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| AppError::InvalidArgument("token is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(request, Some(ws_config), true).await?;
    Ok(stream)
}

async fn run_socket(
    url: String,
    tokens: Arc<dyn TokenProvider>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    open: Arc<AtomicBool>,
    cancel_token: CancellationToken,
) {
    let mut reconnect_attempt = 0_u32;

    while !cancel_token.is_cancelled() {
        let connected = tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = connect_event_stream(&url, tokens.token()) => result,
        };

        match connected {
            Ok(stream) => {
                reconnect_attempt = 0;
                open.store(true, Ordering::Relaxed);
                info!(url = %url, "event stream connected");
                let _ = events.send(TransportEvent::Open);

                let close = pump_stream(stream, &events, &mut outbound, &cancel_token).await;
                open.store(false, Ordering::Relaxed);
                if cancel_token.is_cancelled() {
                    break;
                }
                info!(code = ?close.code, reason = %close.reason, "event stream closed");
                let _ = events.send(TransportEvent::Close(close));
            }
            Err(error) => {
                warn!(%error, attempt = reconnect_attempt, "event stream connect failed");
                let _ = events.send(TransportEvent::Error(error.to_string()));
                let _ = events.send(TransportEvent::Close(CloseEvent {
                    code: None,
                    reason: error.to_string(),
                }));
            }
        }

        reconnect_attempt = reconnect_attempt.saturating_add(1);
        let delay = reconnect_delay(reconnect_attempt);
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    open.store(false, Ordering::Relaxed);
}

async fn pump_stream(
    stream: EventWsStream,
    events: &mpsc::UnboundedSender<TransportEvent>,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    cancel_token: &CancellationToken,
) -> CloseEvent {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return CloseEvent {
                    code: None,
                    reason: "disposed".to_string(),
                };
            }
            Some(text) = outbound.recv() => {
                if let Err(error) = write.send(Message::Text(text)).await {
                    let _ = events.send(TransportEvent::Error(error.to_string()));
                }
            }
            frame = read.next() => {
                let Some(frame_result) = frame else {
                    return CloseEvent {
                        code: Some(ABNORMAL_CLOSE_CODE),
                        reason: "stream ended".to_string(),
                    };
                };

                match frame_result {
                    Ok(Message::Text(text)) => {
                        let _ = events.send(TransportEvent::Message(text));
                    }
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            let _ = events.send(TransportEvent::Message(text));
                        }
                        Err(_) => debug!("dropping non-utf8 binary frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        return CloseEvent {
                            code: frame.as_ref().map(|frame| u16::from(frame.code)),
                            reason: frame
                                .map(|frame| frame.reason.into_owned())
                                .unwrap_or_default(),
                        };
                    }
                    Ok(_) => {}
                    Err(error) => {
                        let _ = events.send(TransportEvent::Error(error.to_string()));
                        return CloseEvent {
                            code: Some(ABNORMAL_CLOSE_CODE),
                            reason: error.to_string(),
                        };
                    }
                }
            }
        }
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = 200_u64.saturating_mul(1_u64 << exponent);
    let jitter_ms = (now_unix_ms().unsigned_abs() % 250).min(249);
    Duration::from_millis((base_ms + jitter_ms).min(5_000))
}

fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_is_bounded() {
        assert!(reconnect_delay(1) >= Duration::from_millis(400));
        assert!(reconnect_delay(30) <= Duration::from_millis(5_000));
    }

    #[test]
    fn static_token_returns_configured_value() {
        assert_eq!(StaticToken(Some("abc".to_string())).token().as_deref(), Some("abc"));
        assert!(StaticToken::default().token().is_none());
    }

    #[test]
    fn control_message_serializes_as_subscribe_action() {
        let message = ControlMessage::subscribe(&["strategy.status".to_string()]);
        let encoded = serde_json::to_string(&message).expect("control message should encode");
        assert_eq!(encoded, r#"{"action":"subscribe","topics":["strategy.status"]}"#);
    }
}
