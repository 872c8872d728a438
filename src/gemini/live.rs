use super::protocol::{self, LiveFrame};
use crate::codec::EncodedFrame;
use crate::error::SessionError;
use crate::transport::{LiveChannel, LiveConfig, LiveConnector, LiveSession, TransportEvent};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite};

/// Opens Gemini Live websocket sessions.
#[derive(Debug, Clone)]
pub struct GeminiLive {
    api_key: String,
    endpoint: String,
}

impl GeminiLive {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: protocol::LIVE_ENDPOINT.into(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn set_api_key(&mut self, api_key: impl Into<String>) {
        self.api_key = api_key.into();
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key.trim())
    }
}

fn build_ws_request(url: &str) -> Result<tungstenite::http::Request<()>, String> {
    tungstenite::http::Request::builder()
        .uri(url)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .header(
            "Host",
            url.split("://")
                .nth(1)
                .and_then(|rest| rest.split('/').next())
                .unwrap_or_default(),
        )
        .body(())
        .map_err(|e| format!("Failed to build request: {}", e))
}

fn is_permanent_connect_error(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Http(resp) => {
            let code = resp.status().as_u16();
            code == 400 || code == 401 || code == 403
        }
        _ => {
            let text = err.to_string();
            text.contains("401") || text.contains("403")
        }
    }
}

enum Outbound {
    Frame(EncodedFrame),
    Close,
}

impl LiveConnector for GeminiLive {
    fn connect(
        &self,
        config: &LiveConfig,
    ) -> impl Future<Output = Result<LiveChannel, SessionError>> + Send {
        let url = self.url();
        let endpoint = self.endpoint.clone();
        let setup = protocol::setup_message(config);
        async move {
            let request = build_ws_request(&url).map_err(SessionError::Transport)?;
            info!("[live] connecting: {}", endpoint);

            let ws_stream = match connect_async(request).await {
                Ok((stream, _)) => stream,
                Err(e) if is_permanent_connect_error(&e) => {
                    return Err(SessionError::InvalidCredential(format!(
                        "Authentication failed: {}",
                        e
                    )));
                }
                Err(e) => {
                    return Err(SessionError::Transport(format!("Connection failed: {}", e)));
                }
            };
            info!("[live] websocket connected");

            let (mut ws_tx, mut ws_rx) = ws_stream.split();
            debug!("[live] sending setup");
            ws_tx
                .send(tungstenite::Message::Text(setup.to_string().into()))
                .await
                .map_err(|e| SessionError::Transport(format!("Failed to send setup: {}", e)))?;

            let (events_tx, events_rx) = mpsc::unbounded_channel::<TransportEvent>();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

            // Task: forward queued frames to the socket in enqueue order.
            let events_send = events_tx.clone();
            let writer = tokio::spawn(async move {
                let mut frames: u64 = 0;
                let mut bytes: u64 = 0;
                while let Some(msg) = out_rx.recv().await {
                    match msg {
                        Outbound::Frame(frame) => {
                            bytes += frame.data.len() as u64;
                            let text = protocol::realtime_input_message(&frame).to_string();
                            if let Err(e) = ws_tx.send(tungstenite::Message::Text(text.into())).await {
                                error!("[live] send failed: {}", e);
                                let _ = events_send.send(TransportEvent::Error(
                                    SessionError::Transport(format!("send failed: {}", e)),
                                ));
                                break;
                            }
                            frames += 1;
                            if frames % 200 == 0 {
                                debug!("[live] audio sent: frames={}, bytes_total={}", frames, bytes);
                            }
                        }
                        Outbound::Close => break,
                    }
                }
                info!("[live] closing websocket");
                let _ = ws_tx.close().await;
            });

            // Task: receive server messages.
            let reader = tokio::spawn(async move {
                loop {
                    let msg = match ws_rx.next().await {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            warn!("[live] websocket error: {}", e);
                            let _ = events_tx.send(TransportEvent::Error(SessionError::Transport(
                                e.to_string(),
                            )));
                            break;
                        }
                        None => {
                            let _ = events_tx.send(TransportEvent::Closed {
                                code: None,
                                reason: "connection dropped".into(),
                            });
                            break;
                        }
                    };

                    let text = match msg {
                        tungstenite::Message::Text(t) => t.to_string(),
                        // Live sends JSON in binary frames as well.
                        tungstenite::Message::Binary(b) => match String::from_utf8(b.to_vec()) {
                            Ok(t) => t,
                            Err(_) => {
                                warn!("[live] ignoring non-UTF-8 binary frame");
                                continue;
                            }
                        },
                        tungstenite::Message::Close(frame) => {
                            let (code, reason) = match frame {
                                Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                                None => (None, String::new()),
                            };
                            info!("[live] websocket closed: {:?} {}", code, reason);
                            let _ = events_tx.send(TransportEvent::Closed { code, reason });
                            break;
                        }
                        _ => continue,
                    };

                    match protocol::parse_server_message(&text) {
                        Ok(LiveFrame::SetupComplete) => {
                            info!("[live] setup complete");
                            let _ = events_tx.send(TransportEvent::Open);
                        }
                        Ok(LiveFrame::Server(msg)) => {
                            let _ = events_tx.send(TransportEvent::Message(msg));
                        }
                        Ok(LiveFrame::Other) => debug!("[live] ignoring message"),
                        Err(e) => warn!("[live] {}", e),
                    }
                }
            });

            Ok(LiveChannel {
                session: Box::new(GeminiSession {
                    out_tx,
                    reader: Some(reader),
                    writer: Some(writer),
                }),
                events: events_rx,
            })
        }
    }
}

/// Outbound handle for one websocket.
pub struct GeminiSession {
    out_tx: mpsc::UnboundedSender<Outbound>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl LiveSession for GeminiSession {
    fn send_realtime_input(&mut self, frame: EncodedFrame) -> Result<(), SessionError> {
        self.out_tx
            .send(Outbound::Frame(frame))
            .map_err(|_| SessionError::Transport("websocket writer has stopped".into()))
    }

    fn close(&mut self) {
        // Stop delivering events at once; the writer drains and closes the socket.
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if self.writer.take().is_some() {
            let _ = self.out_tx.send(Outbound::Close);
        }
    }
}

impl Drop for GeminiSession {
    fn drop(&mut self) {
        self.close();
    }
}
