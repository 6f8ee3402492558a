//! Upstream STT Adapter (C1)
//!
//! Owns one streaming duplex connection per Session to the upstream speech
//! provider. `open` is asynchronous but audio arrives eagerly, so the
//! connection is represented as a *future*: audio chunks queue on a channel
//! whose sole reader is the task that owns the transport, and `send_audio`
//! awaits a one-shot "opened" signal exactly once before the first frame
//! actually reaches the wire. The queue itself is the single writer, so
//! concurrent `send_audio` calls serialize for free.
//!
//! Grounded on the provider adapter's `transcribe_stream` task-spawn-plus-
//! `tokio::select!` shape, generalized from a multi-provider trait down to
//! the spec's one concrete upstream contract, and on `streaming.rs`'s
//! `WebSocketConnection` wrapper for the transport itself.

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};

use crate::constants::DEFAULT_UPSTREAM_AUDIO;
use crate::errors::AdapterError;
use crate::model::UpstreamMessage;

/// Upstream connection parameters, sourced from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: String,
    pub api_key: String,
}

/// Events the adapter task forwards to the owning Session.
#[derive(Debug)]
pub enum UpstreamEvent {
    Message(UpstreamMessage),
    TransportError(String),
    Closed,
}

#[derive(Debug, Clone)]
enum OpenState {
    Pending,
    Open,
    Failed(String),
}

/// Handle to a running upstream connection. One per Session.
pub struct UpstreamHandle {
    audio_tx: mpsc::Sender<Vec<u8>>,
    open_rx: watch::Receiver<OpenState>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl UpstreamHandle {
    /// Open a new upstream connection for `conversation_id`. Returns
    /// immediately; the connection and initial configuration handshake
    /// happen on a spawned task.
    pub fn open(
        conversation_id: String,
        target_language: String,
        source_language_hint: Option<String>,
        vocabularies: Option<serde_json::Value>,
        config: UpstreamConfig,
    ) -> (Self, mpsc::Receiver<UpstreamEvent>) {
        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let (event_tx, event_rx) = mpsc::channel::<UpstreamEvent>(64);
        let (close_tx, close_rx) = oneshot::channel::<()>();
        let (open_tx, open_rx) = watch::channel(OpenState::Pending);

        tokio::spawn(run(
            conversation_id,
            target_language,
            source_language_hint,
            vocabularies,
            config,
            audio_rx,
            event_tx,
            close_rx,
            open_tx,
        ));

        (
            Self {
                audio_tx,
                open_rx,
                close_tx: Some(close_tx),
            },
            event_rx,
        )
    }

    /// Forward a raw PCM16LE binary frame. Awaits the connection-open future
    /// exactly once across the handle's lifetime (subsequent calls see the
    /// already-resolved state immediately).
    pub async fn send_audio(&self, bytes: Vec<u8>) -> Result<(), AdapterError> {
        self.wait_open().await?;
        self.audio_tx
            .send(bytes)
            .await
            .map_err(|_| AdapterError::WebSocketError("adapter task has ended".into()))
    }

    async fn wait_open(&self) -> Result<(), AdapterError> {
        let mut rx = self.open_rx.clone();
        loop {
            match &*rx.borrow() {
                OpenState::Open => return Ok(()),
                OpenState::Failed(e) => return Err(AdapterError::WebSocketError(e.clone())),
                OpenState::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(AdapterError::WebSocketError("adapter task ended before opening".into()));
            }
        }
    }

    /// Gracefully close the upstream. Idempotent: a second call is a no-op.
    pub fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }

    /// A handle with no backing transport: the open-future is already
    /// resolved and `close()` just drops a channel nobody reads from. For
    /// tests (gateway finalization, etc.) that need an `UpstreamHandle` value
    /// without spawning a real upstream connection.
    #[cfg(test)]
    pub fn noop_for_test() -> Self {
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(1);
        tokio::spawn(async move { while audio_rx.recv().await.is_some() {} });
        let (_open_tx, open_rx) = watch::channel(OpenState::Open);
        let (close_tx, _close_rx) = oneshot::channel::<()>();
        Self {
            audio_tx,
            open_rx,
            close_tx: Some(close_tx),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    conversation_id: String,
    target_language: String,
    source_language_hint: Option<String>,
    vocabularies: Option<serde_json::Value>,
    config: UpstreamConfig,
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    event_tx: mpsc::Sender<UpstreamEvent>,
    mut close_rx: oneshot::Receiver<()>,
    open_tx: watch::Sender<OpenState>,
) {
    let mut ws = match connect(&config.url).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(conversation_id, error = %e, "upstream connect failed");
            let _ = open_tx.send(OpenState::Failed(e.to_string()));
            return;
        }
    };

    let config_frame = json!({
        "api_key": config.api_key,
        "model": DEFAULT_UPSTREAM_AUDIO.model,
        "enable_language_identification": true,
        "enable_speaker_diarization": true,
        "enable_endpoint_detection": true,
        "audio_format": DEFAULT_UPSTREAM_AUDIO.format,
        "sample_rate": DEFAULT_UPSTREAM_AUDIO.sample_rate,
        "num_channels": DEFAULT_UPSTREAM_AUDIO.num_channels,
        "translation": { "type": "one_way", "target_language": target_language },
        "language_hints": source_language_hint.map(|h| vec![h]).unwrap_or_default(),
        "vocabularies": vocabularies,
    });

    if let Err(e) = ws.send(Message::Text(config_frame.to_string().into())).await {
        tracing::warn!(conversation_id, error = %e, "upstream config frame send failed");
        let _ = open_tx.send(OpenState::Failed(e.to_string()));
        return;
    }

    let _ = open_tx.send(OpenState::Open);

    loop {
        tokio::select! {
            chunk = audio_rx.recv() => {
                let Some(bytes) = chunk else { break };
                if let Err(e) = ws.send(Message::Binary(bytes.into())).await {
                    let _ = event_tx.send(UpstreamEvent::TransportError(e.to_string())).await;
                    break;
                }
            }
            incoming = ws.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<UpstreamMessage>(&text) {
                            Ok(parsed) => {
                                if event_tx.send(UpstreamEvent::Message(parsed)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(conversation_id, error = %e, "unparsable upstream frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = event_tx.send(UpstreamEvent::Closed).await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = event_tx.send(UpstreamEvent::TransportError(e.to_string())).await;
                        break;
                    }
                }
            }
            _ = &mut close_rx => {
                let _ = ws.close(None).await;
                break;
            }
        }
    }
}

async fn connect(url: &str) -> Result<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, AdapterError> {
    let (stream, _response) = tokio::time::timeout(
        std::time::Duration::from_secs(crate::constants::DEFAULT_TIMEOUTS.upstream_connect_ms / 1000),
        connect_async(url),
    )
    .await
    .map_err(|_| AdapterError::ConnectTimeout)?
    .map_err(|e| AdapterError::WebSocketError(e.to_string()))?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_frame_matches_wire_contract_fields() {
        let frame = json!({
            "api_key": "k",
            "model": DEFAULT_UPSTREAM_AUDIO.model,
            "enable_language_identification": true,
            "enable_speaker_diarization": true,
            "enable_endpoint_detection": true,
            "audio_format": DEFAULT_UPSTREAM_AUDIO.format,
            "sample_rate": DEFAULT_UPSTREAM_AUDIO.sample_rate,
            "num_channels": DEFAULT_UPSTREAM_AUDIO.num_channels,
            "translation": { "type": "one_way", "target_language": "id" },
            "language_hints": Vec::<String>::new(),
            "vocabularies": serde_json::Value::Null,
        });
        assert_eq!(frame["audio_format"], "pcm_s16le");
        assert_eq!(frame["sample_rate"], 16000);
        assert_eq!(frame["translation"]["type"], "one_way");
    }
}
