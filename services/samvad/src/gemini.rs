//! Gemini Live as a [`VoiceBackend`].

use async_trait::async_trait;
use gemini_live::{GeminiLiveClient, LiveEvent, LiveSender, SetupConfig};
use samvad_core::{
    AudioSender, BackendConnection, BackendEvent, LiveSessionConfig, SessionError, VoiceBackend,
};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct GeminiBackend {
    api_key: Option<SecretString>,
    model: String,
    endpoint: String,
}

impl GeminiBackend {
    pub fn new(
        api_key: Option<SecretString>,
        model: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            api_key,
            model: model.into(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl VoiceBackend for GeminiBackend {
    async fn connect(&self, config: LiveSessionConfig) -> Result<BackendConnection, SessionError> {
        let Some(api_key) = self.api_key.as_ref() else {
            return Err(SessionError::MissingApiKey);
        };
        let client =
            GeminiLiveClient::new(api_key.expose_secret()).with_endpoint(self.endpoint.as_str());
        let setup = SetupConfig {
            model: self.model.clone(),
            voice_name: config.voice_name,
            system_instruction: config.system_instruction,
        };
        let connection = client
            .connect(&setup)
            .await
            .map_err(|e| SessionError::Handshake(format!("{e:#}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(translate(connection.events, tx));
        Ok(BackendConnection {
            sender: Box::new(GeminiSender(connection.sender)),
            events: rx,
        })
    }
}

/// Forwards wire events until either side goes away.
async fn translate(
    mut events: mpsc::UnboundedReceiver<LiveEvent>,
    tx: mpsc::UnboundedSender<BackendEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(mapped) = map_event(event) else {
            continue;
        };
        if tx.send(mapped).is_err() {
            debug!("Session dropped its event stream, stopping translation");
            break;
        }
    }
}

fn map_event(event: LiveEvent) -> Option<BackendEvent> {
    match event {
        LiveEvent::SetupComplete => Some(BackendEvent::Opened),
        LiveEvent::Text(text) => Some(BackendEvent::Text(text)),
        LiveEvent::Audio(data) => Some(BackendEvent::Audio(data)),
        LiveEvent::TurnComplete => Some(BackendEvent::TurnComplete),
        LiveEvent::Closed { code, reason } => Some(BackendEvent::Closed { code, reason }),
        LiveEvent::Error(detail) => Some(BackendEvent::Error(detail)),
        LiveEvent::Interrupted => {
            debug!("Model turn interrupted");
            None
        }
        LiveEvent::GoAway { time_left } => {
            info!(?time_left, "Gemini Live will close the connection soon");
            None
        }
    }
}

struct GeminiSender(LiveSender);

impl AudioSender for GeminiSender {
    fn send_audio(&self, base64_pcm: String) -> Result<(), SessionError> {
        self.0
            .send_audio(base64_pcm)
            .map_err(|_| SessionError::StaleSession)
    }

    fn close(&self) {
        self.0.close();
    }
}
