//! Client for the Gemini Live `BidiGenerateContent` websocket.
//!
//! [`GeminiLiveClient::connect`] opens the socket, sends the session setup and
//! hands back a [`LiveConnection`]: a cloneable [`LiveSender`] for realtime
//! audio input and a channel of [`LiveEvent`]s parsed from server messages.
//! A writer task and a reader task own the two halves of the socket.

pub mod types;

use anyhow::{Context, Result};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::protocol::{CloseFrame, Message as WsMessage, frame::coding::CloseCode},
};
use tracing::{debug, info, instrument, warn};
use types::{
    BidiGenerateContentRealtimeInput, BidiGenerateContentSetup, Blob, ClientMessage, Content,
    GenerationConfig, Part, PrebuiltVoiceConfig, ResponseModality, ServerMessage, SpeechConfig,
    VoiceConfig,
};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
/// Format of realtime audio input: 16 kHz little-endian PCM16, base64 encoded.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Session parameters sent in the setup message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupConfig {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
}

impl SetupConfig {
    pub fn to_message(&self) -> ClientMessage {
        let system_instruction = (!self.system_instruction.is_empty()).then(|| Content {
            parts: vec![Part {
                text: self.system_instruction.clone(),
            }],
        });
        ClientMessage::Setup(BidiGenerateContentSetup {
            model: model_resource_name(&self.model),
            generation_config: GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice_name.clone(),
                        },
                    },
                }),
            },
            system_instruction,
        })
    }
}

/// The protocol expects `models/<name>`.
pub fn model_resource_name(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

pub fn realtime_audio_message(data: String) -> ClientMessage {
    ClientMessage::RealtimeInput(BidiGenerateContentRealtimeInput {
        audio: Blob {
            mime_type: INPUT_MIME_TYPE.to_string(),
            data,
        },
    })
}

/// Events surfaced from the server side of the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    SetupComplete,
    Text(String),
    /// Base64 PCM16 model speech.
    Audio(String),
    TurnComplete,
    /// The model's turn was cut short by user speech.
    Interrupted,
    /// The server will close the connection soon.
    GoAway { time_left: Option<String> },
    /// The socket closed. `code` is `None` if no close frame was received.
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// Splits one server message into events, in the order they should be handled.
pub fn parse_server_message(raw: &str) -> serde_json::Result<Vec<LiveEvent>> {
    let message: ServerMessage = serde_json::from_str(raw)?;
    let mut events = Vec::new();
    if message.setup_complete.is_some() {
        events.push(LiveEvent::SetupComplete);
    }
    if let Some(content) = message.server_content {
        if content.interrupted == Some(true) {
            events.push(LiveEvent::Interrupted);
        }
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(text) = part.text {
                    events.push(LiveEvent::Text(text));
                }
                if let Some(blob) = part.inline_data {
                    events.push(LiveEvent::Audio(blob.data));
                }
            }
        }
        if content.turn_complete == Some(true) {
            events.push(LiveEvent::TurnComplete);
        }
    }
    if let Some(go_away) = message.go_away {
        events.push(LiveEvent::GoAway {
            time_left: go_away.time_left,
        });
    }
    Ok(events)
}

#[derive(Debug)]
enum Outbound {
    Audio(String),
    Close,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("the live connection is closed")]
pub struct ConnectionClosed;

/// Outbound half of a live connection.
#[derive(Debug, Clone)]
pub struct LiveSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl LiveSender {
    /// Queues one base64 PCM16 frame for the writer task.
    pub fn send_audio(&self, data: String) -> Result<(), ConnectionClosed> {
        self.tx
            .send(Outbound::Audio(data))
            .map_err(|_| ConnectionClosed)
    }

    /// Asks the writer to send a normal close frame.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct LiveConnection {
    pub sender: LiveSender,
    pub events: mpsc::UnboundedReceiver<LiveEvent>,
}

/// Installs `ring` as the process-wide rustls crypto provider.
///
/// Call once at start-up before the first connection. Later calls are no-ops.
#[cfg(feature = "rustls")]
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

pub struct GeminiLiveClient {
    endpoint: String,
    api_key: String,
}

impl GeminiLiveClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }

    /// Connects and sends the setup message.
    ///
    /// The returned connection is usable immediately, but the server only
    /// accepts audio after [`LiveEvent::SetupComplete`].
    #[instrument(skip_all, fields(model = %setup.model, voice = %setup.voice_name))]
    pub async fn connect(&self, setup: &SetupConfig) -> Result<LiveConnection> {
        let (ws_stream, _) = connect_async(self.url())
            .await
            .context("Failed to connect to Gemini Live")?;
        info!("Connected to Gemini Live websocket");
        let (mut sink, stream) = ws_stream.split();

        let payload = serde_json::to_string(&setup.to_message())?;
        sink.send(WsMessage::Text(payload.into()))
            .await
            .context("Failed to send setup message")?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, out_rx));
        tokio::spawn(read_loop(stream, event_tx));

        Ok(LiveConnection {
            sender: LiveSender { tx: out_tx },
            events: event_rx,
        })
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Audio(data) => {
                let payload = match serde_json::to_string(&realtime_audio_message(data)) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode audio frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(payload.into())).await {
                    warn!(error = %e, "Failed to write audio frame, stopping writer");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    rx.close();
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
        debug!(error = %e, "Close frame not sent");
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, events: mpsc::UnboundedSender<LiveEvent>) {
    let last = loop {
        let Some(message) = stream.next().await else {
            break LiveEvent::Closed {
                code: None,
                reason: String::new(),
            };
        };
        match message {
            Ok(WsMessage::Text(text)) => forward(&text, &events),
            // The server may deliver JSON in binary frames.
            Ok(WsMessage::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => forward(text, &events),
                Err(_) => debug!(len = data.len(), "Ignoring non-UTF-8 binary frame"),
            },
            Ok(WsMessage::Close(frame)) => {
                break LiveEvent::Closed {
                    code: frame.as_ref().map(|f| u16::from(f.code)),
                    reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                };
            }
            Ok(_) => {}
            Err(e) => break LiveEvent::Error(e.to_string()),
        }
        if events.is_closed() {
            return;
        }
    };
    debug!(event = ?last, "Gemini Live reader finished");
    let _ = events.send(last);
}

fn forward(raw: &str, events: &mpsc::UnboundedSender<LiveEvent>) {
    match parse_server_message(raw) {
        Ok(parsed) => {
            for event in parsed {
                let _ = events.send(event);
            }
        }
        Err(e) => warn!(error = %e, "Failed to parse Gemini Live message"),
    }
}
