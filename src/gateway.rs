//! Session Gateway (C6)
//!
//! One task per connected client, modeled as a cooperative actor: a single
//! `tokio::select!` loop serializes audio frames, control events, upstream
//! messages, and the periodic-save timer onto one linear event order, so the
//! Accumulator and RecordingMeter never see concurrent mutation. This is the
//! per-session-actor re-architecture the spec calls for in place of a
//! shared-map event loop.
//!
//! Grounded on the WebSocket upgrade handler shape (query-param extraction,
//! `ws.on_upgrade`, a per-connection task) and generalized to this relay's
//! own control-message vocabulary and finalization sequence.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use dashmap::DashSet;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::accumulator::{Accumulator, TerminalEventKind};
use crate::adapter::{UpstreamConfig, UpstreamEvent, UpstreamHandle};
use crate::config::Config;
use crate::constants::DEFAULT_WRITE_QUEUE;
use crate::errors::ErrorCodes;
use crate::meter::RecordingMeter;
use crate::model::{Segment, TranscriptionRecord, TranscriptionStatus};
use crate::quota::QuotaService;
use crate::queue::DurableWriteQueue;
use crate::store::{Store, TranscriptionUpdate};

/// The result of decoding the (externally handled) session cookie. Real
/// verification is out of scope for this relay; `AuthProvider` is the seam a
/// caller wires up to their own auth collaborator.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub active_organization_id: Option<String>,
}

pub trait AuthProvider: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, ()>;
}

/// Reads a pre-decoded identity off request headers. A real deployment sits
/// this behind whatever already validates the session cookie upstream of
/// this service; cookie/session auth itself is explicitly out of scope here.
pub struct HeaderAuthProvider;

impl AuthProvider for HeaderAuthProvider {
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, ()> {
        let user_id = headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(())?;
        let active_organization_id = headers
            .get("x-active-organization-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(AuthContext {
            user_id,
            active_organization_id,
        })
    }
}

pub struct AppState {
    pub config: Arc<Config>,
    pub quota: Arc<QuotaService>,
    pub write_queue: DurableWriteQueue,
    pub store: Arc<dyn Store>,
    pub auth: Arc<dyn AuthProvider>,
    finalizing: DashSet<String>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        quota: Arc<QuotaService>,
        write_queue: DurableWriteQueue,
        store: Arc<dyn Store>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            config,
            quota,
            write_queue,
            store,
            auth,
            finalizing: DashSet::new(),
        }
    }

    fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            url: self.config.upstream_stt_url.clone(),
            api_key: self.config.upstream_stt_api_key.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    #[serde(rename = "targetLanguage")]
    pub target_language: String,
    pub vocabularies: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientControl {
    StartRecording,
    StopRecording,
}

/// `GET /ws` — axum route entrypoint. Auth, required query params, and the
/// active-organization check all happen before the upgrade; everything past
/// that point (notably quota admission) must happen after, since it has to
/// emit a client-visible event rather than an HTTP status.
pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    let auth = state.auth.authenticate(&headers).map_err(|_| StatusCode::UNAUTHORIZED)?;

    let Some(org_id) = auth.active_organization_id.clone() else {
        tracing::warn!(code = ErrorCodes::NO_ACTIVE_ORGANIZATION, user_id = %auth.user_id, "connect rejected");
        return Err(StatusCode::FORBIDDEN);
    };

    let vocabularies = query.vocabularies.as_deref().and_then(|raw| match serde_json::from_str(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(error = %e, "malformed vocabularies query param, treating as null");
            None
        }
    });

    let conversation_id = query.conversation_id.clone();
    let target_language = query.target_language.clone();

    Ok(ws.on_upgrade(move |socket| run_session(socket, state, conversation_id, target_language, vocabularies, org_id)))
}

async fn run_session(
    socket: WebSocket,
    state: Arc<AppState>,
    conversation_id: String,
    target_language: String,
    vocabularies: Option<serde_json::Value>,
    org_id: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let availability = match state.quota.check_quota_availability(&org_id).await {
        Ok(a) => a,
        Err(e) => {
            tracing::info!(conversation_id = %conversation_id, code = e.code(), "quota check failed at connect");
            let _ = send_json(
                &mut sender,
                json!({ "event": "quota:exceeded", "data": { "error": e.code(), "data": e.to_details() } }),
            )
            .await;
            return;
        }
    };
    tracing::debug!(conversation_id = %conversation_id, remaining = availability.remaining_minutes, "quota admitted");

    let (mut upstream, mut upstream_rx) = UpstreamHandle::open(
        conversation_id.clone(),
        target_language.clone(),
        None,
        vocabularies.clone(),
        state.upstream_config(),
    );

    let mut accumulator = Accumulator::new(target_language, vocabularies);
    let mut meter = RecordingMeter::new();
    let mut persisted_once = false;
    let mut subscribed = false;
    let mut transport_error = false;

    let mut periodic = tokio::time::interval(Duration::from_millis(state.config.periodic_save_interval_ms));
    periodic.tick().await; // first tick fires immediately; consume it so the cadence starts from connect

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        if !meter.is_recording() {
                            let _ = send_json(&mut sender, json!({
                                "event": "transcription:error",
                                "data": { "code": ErrorCodes::RECORDING_NOT_STARTED, "message": "recording not started" }
                            })).await;
                        } else {
                            subscribed = true;
                            if let Err(e) = upstream.send_audio(bytes.to_vec()).await {
                                tracing::warn!(conversation_id = %conversation_id, error = %e, "send_audio failed");
                                let _ = send_json(&mut sender, json!({
                                    "event": "transcription:error",
                                    "data": { "message": e.to_string(), "transcriptionId": conversation_id }
                                })).await;
                            }
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientControl>(&text) {
                            Ok(ClientControl::StartRecording) => {
                                meter.start();
                                let _ = send_json(&mut sender, json!({
                                    "event": "recording:started",
                                    "data": { "conversationId": conversation_id, "timestamp": now_ms() }
                                })).await;
                            }
                            Ok(ClientControl::StopRecording) => {
                                let duration_before = meter.current_duration_ms();
                                meter.stop();
                                schedule_save(&state, &conversation_id, &org_id, &accumulator, &meter, &mut persisted_once, DEFAULT_WRITE_QUEUE.priority_periodic);
                                let _ = send_json(&mut sender, json!({
                                    "event": "recording:stopped",
                                    "data": { "conversationId": conversation_id, "durationMs": duration_before, "timestamp": now_ms() }
                                })).await;
                            }
                            Err(e) => {
                                tracing::debug!(conversation_id = %conversation_id, error = %e, "unrecognized control message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(conversation_id = %conversation_id, error = %e, "client socket error");
                        break;
                    }
                }
            }
            evt = upstream_rx.recv(), if subscribed => {
                match evt {
                    Some(UpstreamEvent::Message(msg)) => {
                        let outcome = accumulator.process(&msg, meter.current_duration_ms());
                        for live in outcome.live_events {
                            if let Ok(value) = serde_json::to_value(&live) {
                                let _ = send_json(&mut sender, json!({ "event": "translation:result", "data": value })).await;
                            }
                        }
                        match outcome.terminal {
                            Some(TerminalEventKind::Error(message)) => {
                                let _ = send_json(&mut sender, json!({
                                    "event": "transcription:error",
                                    "data": { "message": message, "transcriptionId": conversation_id }
                                })).await;
                            }
                            Some(TerminalEventKind::Finished) => {
                                let _ = send_json(&mut sender, json!({
                                    "event": "conversation:complete",
                                    "data": { "conversationId": conversation_id }
                                })).await;
                            }
                            None => {}
                        }
                    }
                    Some(UpstreamEvent::TransportError(message)) => {
                        transport_error = true;
                        tracing::warn!(conversation_id = %conversation_id, %message, "upstream transport error");
                        let _ = send_json(&mut sender, json!({
                            "event": "transcription:error",
                            "data": { "message": message, "code": ErrorCodes::UPSTREAM_STREAM_ERROR, "transcriptionId": conversation_id }
                        })).await;
                    }
                    Some(UpstreamEvent::Closed) | None => {
                        // The adapter task has exited; `upstream_rx.recv()` would
                        // otherwise resolve to `None` immediately forever, spinning
                        // this arm. Stop polling it — the accumulator/meter stay
                        // alive until the client disconnects (spec: transport
                        // errors end the live channel but not the session).
                        subscribed = false;
                    }
                }
            }
            _ = periodic.tick() => {
                schedule_save(&state, &conversation_id, &org_id, &accumulator, &meter, &mut persisted_once, DEFAULT_WRITE_QUEUE.priority_periodic);
            }
        }
    }

    finalize(&state, &conversation_id, &org_id, &mut upstream, &accumulator, &meter, persisted_once, transport_error).await;
}

/// `schedulePeriodicSave`: skip if there's nothing to persist yet, otherwise
/// enqueue a priority-1 upsert — `create` the first time this conversationId
/// is written, `update` (streaming fields only) on every call after.
fn schedule_save(
    state: &AppState,
    conversation_id: &str,
    org_id: &str,
    accumulator: &Accumulator,
    meter: &RecordingMeter,
    persisted_once: &mut bool,
    priority: i32,
) {
    if (accumulator.live_original().is_empty() && accumulator.live_translation().is_empty())
        || accumulator.target_language().is_empty()
    {
        tracing::debug!(conversation_id, "periodic save skipped: nothing accumulated yet");
        return;
    }

    let duration_in_ms = meter.current_duration_ms();
    let transcription_result = Some(accumulator.final_original_segments().to_vec());
    let translation_result = Some(accumulator.final_translation_segments().to_vec());

    if *persisted_once {
        state.write_queue.enqueue_update(
            conversation_id,
            priority,
            TranscriptionUpdate {
                duration_in_ms,
                transcription_result,
                translation_result,
                vocabularies: accumulator.vocabularies().cloned(),
                status: TranscriptionStatus::InProgress,
                target_language: None,
                source_language: None,
            },
        );
    } else {
        state.write_queue.enqueue_create(
            conversation_id,
            priority,
            TranscriptionRecord {
                id: conversation_id.to_string(),
                organization_id: org_id.to_string(),
                duration_in_ms,
                model_name: "stt-rt-v3".to_string(),
                target_language: accumulator.target_language().to_string(),
                source_language: accumulator.source_language().map(str::to_string),
                transcription_result,
                translation_result,
                vocabularies: accumulator.vocabularies().cloned(),
                status: TranscriptionStatus::InProgress,
                version: 1,
            },
        );
        *persisted_once = true;
    }
}

/// Disconnect finalization (spec 4.6 steps 1-10). Guarded so a duplicate
/// invocation for the same conversationId (there should never be one, since
/// each session owns exactly one task, but the guard matches the spec's
/// explicit idempotence requirement) is a no-op.
#[allow(clippy::too_many_arguments)]
async fn finalize(
    state: &AppState,
    conversation_id: &str,
    org_id: &str,
    upstream: &mut UpstreamHandle,
    accumulator: &Accumulator,
    meter: &RecordingMeter,
    persisted_once: bool,
    transport_error: bool,
) {
    if !state.finalizing.insert(conversation_id.to_string()) {
        return;
    }

    upstream.close();

    let duration_in_ms = meter.current_duration_ms();
    if duration_in_ms == 0 {
        tracing::debug!(conversation_id, "zero-duration disconnect, skipping persistence and usage");
        state.finalizing.remove(conversation_id);
        return;
    }

    let has_received_data = accumulator.has_received_data();
    let has_error = accumulator.has_error() || transport_error;
    let final_status = if has_received_data {
        TranscriptionStatus::Completed
    } else if has_error {
        TranscriptionStatus::Failed
    } else {
        TranscriptionStatus::NoData
    };

    let target_language = accumulator.target_language();
    if target_language.trim().is_empty() {
        tracing::warn!(conversation_id, "finalization skipped: blank targetLanguage");
        state.finalizing.remove(conversation_id);
        return;
    }

    let (transcription_result, translation_result, result_vocabularies): (
        Option<Vec<Segment>>,
        Option<Vec<Segment>>,
        Option<serde_json::Value>,
    ) = if has_received_data {
        (
            Some(accumulator.final_original_segments().to_vec()),
            Some(accumulator.final_translation_segments().to_vec()),
            accumulator.vocabularies().cloned(),
        )
    } else {
        (None, None, None)
    };

    if persisted_once {
        state.write_queue.enqueue_update(
            conversation_id,
            DEFAULT_WRITE_QUEUE.priority_final,
            TranscriptionUpdate {
                duration_in_ms,
                transcription_result,
                translation_result,
                vocabularies: result_vocabularies,
                status: final_status,
                target_language: Some(target_language.to_string()),
                source_language: accumulator.source_language().map(str::to_string),
            },
        );
    } else {
        state.write_queue.enqueue_create(
            conversation_id,
            DEFAULT_WRITE_QUEUE.priority_final,
            TranscriptionRecord {
                id: conversation_id.to_string(),
                organization_id: org_id.to_string(),
                duration_in_ms,
                model_name: "stt-rt-v3".to_string(),
                target_language: target_language.to_string(),
                source_language: accumulator.source_language().map(str::to_string),
                transcription_result,
                translation_result,
                vocabularies: result_vocabularies,
                status: final_status,
                version: 1,
            },
        );
    }

    if let Err(e) = state.quota.record_usage(org_id, duration_in_ms).await {
        tracing::warn!(conversation_id, error = %e, "record_usage failed during finalization");
    }

    state.finalizing.remove(conversation_id);
}

async fn send_json(sender: &mut futures::stream::SplitSink<WebSocket, Message>, value: serde_json::Value) -> bool {
    sender.send(Message::Text(value.to_string().into())).await.is_ok()
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
