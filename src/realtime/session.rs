//! Realtime transcription sessions (OpenAI Realtime event protocol).
//!
//! One session per WebSocket connection. The WS receive loop is the only
//! writer of session state; transcription work runs on spawned tasks that
//! consume a WAV snapshot and post results back through the session's
//! event sender, checking the session is still active first.

use super::buffer::{AudioBuffer, FINAL_PAD_MS, INTERIM_PAD_MS};
use super::vad::{EnergyVad, VadConfig, VadEvent};
use crate::error::GatewayError;
use crate::router::Router;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// New audio required (beyond the last interim) before another interim
/// transcription fires.
pub const INTERIM_CHUNK_MS: u32 = 1000;

/// VAD analysis window per append.
const VAD_WINDOW_MS: u32 = 100;

/// One realtime session.
pub struct RealtimeSession {
    pub id: String,
    buffer: AudioBuffer,
    vad: Mutex<EnergyVad>,
    model: Mutex<String>,
    /// Buffer duration at the last interim dispatch (0 = none yet).
    last_interim_ms: AtomicU32,
    /// Guard so interim transcriptions never overlap per session.
    interim_in_flight: AtomicBool,
    active: AtomicBool,
    sender: UnboundedSender<Value>,
}

impl RealtimeSession {
    fn new(id: String, sender: UnboundedSender<Value>) -> Self {
        Self {
            id,
            buffer: AudioBuffer::new(),
            vad: Mutex::new(EnergyVad::new(VadConfig::default())),
            model: Mutex::new(String::new()),
            last_interim_ms: AtomicU32::new(0),
            interim_in_flight: AtomicBool::new(false),
            active: AtomicBool::new(true),
            sender,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn model(&self) -> String {
        self.model
            .lock()
            .map(|m| m.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn send(&self, event: Value) {
        if self.is_active() {
            let _ = self.sender.send(event);
        }
    }

    fn apply_config(&self, config: &Value) {
        if let Some(model) = config.get("model").and_then(Value::as_str) {
            if let Ok(mut guard) = self.model.lock() {
                *guard = model.to_owned();
            }
        }
        if let Some(td) = config.get("turn_detection") {
            let mut vad = self
                .vad
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut vad_config = vad.config();
            if let Some(threshold) = td.get("threshold").and_then(Value::as_f64) {
                vad_config.energy_threshold = threshold as f32;
            }
            if let Some(ms) = td.get("silence_duration_ms").and_then(Value::as_u64) {
                vad_config.min_silence_ms = ms as u32;
            }
            if let Some(ms) = td.get("prefix_padding_ms").and_then(Value::as_u64) {
                vad_config.min_speech_ms = ms as u32;
            }
            if let Some(frames) = td.get("onset_frames").and_then(Value::as_u64) {
                vad_config.onset_frames = frames as u32;
            }
            if let Some(frames) = td.get("hangover_frames").and_then(Value::as_u64) {
                vad_config.hangover_frames = frames as u32;
            }
            vad.set_config(vad_config);
        }
    }
}

/// Owns all realtime sessions and their transcription workers.
pub struct RealtimeSessionManager {
    router: Arc<Router>,
    sessions: Mutex<HashMap<String, Arc<RealtimeSession>>>,
    workers: tokio::sync::Mutex<JoinSet<()>>,
}

impl RealtimeSessionManager {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            sessions: Mutex::new(HashMap::new()),
            workers: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    /// Create a session, apply the initial config, and emit
    /// `session.created`.
    pub fn create_session(&self, sender: UnboundedSender<Value>, config: &Value) -> String {
        let id = generate_session_id();
        let session = Arc::new(RealtimeSession::new(id.clone(), sender));
        session.apply_config(config);

        lock(&self.sessions).insert(id.clone(), Arc::clone(&session));
        info!(session = %id, "realtime session created");

        session.send(json!({
            "type": "session.created",
            "session": { "id": id },
        }));
        id
    }

    /// Merge config updates (model name, VAD tuning); emits
    /// `session.updated`.
    pub fn update_session(&self, session_id: &str, config: &Value) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        session.apply_config(config);
        session.send(json!({
            "type": "session.updated",
            "session": {
                "id": session_id,
                "model": session.model(),
            },
        }));
    }

    /// Append base64 audio, run VAD over the most recent window, and
    /// dispatch any transcriptions that fall out.
    pub async fn append_audio(&self, session_id: &str, base64_audio: &str) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        if !session.is_active() {
            return;
        }

        if let Err(e) = session.buffer.append_base64(base64_audio) {
            session.send(error_event(&e));
            return;
        }
        self.process_vad(&session).await;
    }

    async fn process_vad(&self, session: &Arc<RealtimeSession>) {
        let recent = session.buffer.recent_samples(VAD_WINDOW_MS);
        if recent.is_empty() {
            return;
        }

        let (event, speech_active) = {
            let mut vad = session
                .vad
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let event = vad.process(&recent);
            (event, vad.is_speech_active())
        };

        match event {
            VadEvent::SpeechStart => {
                debug!(session = %session.id, "speech started");
                session.last_interim_ms.store(0, Ordering::Release);
                let start_ms = session
                    .vad
                    .lock()
                    .map(|v| v.speech_start_ms())
                    .unwrap_or(0);
                session.send(json!({
                    "type": "input_audio_buffer.speech_started",
                    "audio_start_ms": start_ms,
                }));
            }
            VadEvent::SpeechEnd => {
                debug!(session = %session.id, "speech ended, dispatching final transcription");
                let end_ms = session.vad.lock().map(|v| v.speech_end_ms()).unwrap_or(0);
                session.send(json!({
                    "type": "input_audio_buffer.speech_stopped",
                    "audio_end_ms": end_ms,
                }));
                self.dispatch_final(session).await;
            }
            VadEvent::None => {
                if speech_active {
                    self.maybe_dispatch_interim(session).await;
                }
            }
        }
    }

    /// Fire an interim transcription when ≥ [`INTERIM_CHUNK_MS`] of new
    /// audio has accumulated and none is already in flight. The buffer is
    /// snapshotted, never cleared.
    async fn maybe_dispatch_interim(&self, session: &Arc<RealtimeSession>) {
        if session.buffer.is_empty() {
            return;
        }
        let buffer_ms = session.buffer.duration_ms();
        let last = session.last_interim_ms.load(Ordering::Acquire);
        let since_last = if last == 0 {
            buffer_ms
        } else {
            buffer_ms.saturating_sub(last)
        };
        if since_last < INTERIM_CHUNK_MS {
            return;
        }
        if session
            .interim_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        session.last_interim_ms.store(buffer_ms, Ordering::Release);
        let wav = session.buffer.wav_padded(INTERIM_PAD_MS);
        debug!(session = %session.id, at_ms = buffer_ms, "dispatching interim transcription");
        self.spawn_transcription(Arc::clone(session), wav, true).await;
    }

    async fn dispatch_final(&self, session: &Arc<RealtimeSession>) {
        if session.buffer.is_empty() {
            return;
        }
        let wav = session.buffer.wav_padded(FINAL_PAD_MS);
        session.buffer.clear();
        if let Ok(mut vad) = session.vad.lock() {
            vad.reset();
        }
        session.last_interim_ms.store(0, Ordering::Release);
        self.spawn_transcription(Arc::clone(session), wav, false).await;
    }

    async fn spawn_transcription(
        &self,
        session: Arc<RealtimeSession>,
        wav: Vec<u8>,
        is_interim: bool,
    ) {
        let router = Arc::clone(&self.router);
        let mut workers = self.workers.lock().await;

        // Reap finished workers so the set stays bounded.
        while workers.try_join_next().is_some() {}

        workers.spawn(async move {
            let model = session.model();
            let model_arg = if model.is_empty() {
                None
            } else {
                Some(model.as_str())
            };
            let result = router
                .audio_transcriptions(model_arg, wav, "realtime_audio.wav", &json!({}))
                .await;

            if is_interim {
                session.interim_in_flight.store(false, Ordering::Release);
            }
            if !session.is_active() {
                return;
            }

            match result {
                Ok(response) => {
                    let transcript = response
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned();
                    if is_interim {
                        session.send(json!({
                            "type": "conversation.item.input_audio_transcription.delta",
                            "delta": transcript,
                        }));
                    } else {
                        session.send(json!({
                            "type": "conversation.item.input_audio_transcription.completed",
                            "transcript": transcript,
                        }));
                    }
                }
                Err(e) => {
                    warn!(session = %session.id, error = %e, "transcription failed");
                    session.send(error_event(&e));
                }
            }
        });
    }

    /// Force a final transcription over the current buffer
    /// (`input_audio_buffer.commit`).
    pub async fn commit_audio(&self, session_id: &str) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        if session.buffer.is_empty() {
            return;
        }
        session.send(json!({ "type": "input_audio_buffer.committed" }));
        self.dispatch_final(&session).await;
    }

    /// Drop buffered audio (`input_audio_buffer.clear`).
    pub fn clear_audio(&self, session_id: &str) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        session.buffer.clear();
        if let Ok(mut vad) = session.vad.lock() {
            vad.reset();
        }
        session.send(json!({ "type": "input_audio_buffer.cleared" }));
    }

    /// Emit a protocol error event on a session's channel.
    pub fn update_session_error(&self, session_id: &str, message: &str) {
        if let Some(session) = self.get(session_id) {
            session.send(json!({
                "type": "error",
                "error": {
                    "message": message,
                    "type": "invalid_request_error",
                },
            }));
        }
    }

    /// Deactivate and drop a session. In-flight workers observe the
    /// inactive flag and discard their results.
    pub fn close_session(&self, session_id: &str) {
        if let Some(session) = lock(&self.sessions).remove(session_id) {
            session.active.store(false, Ordering::Release);
            info!(session = %session_id, "realtime session closed");
        }
    }

    pub fn session_exists(&self, session_id: &str) -> bool {
        lock(&self.sessions).contains_key(session_id)
    }

    /// Await all pending transcription workers, then drop all sessions.
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        while workers.join_next().await.is_some() {}
        for (_, session) in lock(&self.sessions).drain() {
            session.active.store(false, Ordering::Release);
        }
    }

    fn get(&self, session_id: &str) -> Option<Arc<RealtimeSession>> {
        lock(&self.sessions).get(session_id).cloned()
    }
}

fn error_event(error: &GatewayError) -> Value {
    json!({
        "type": "error",
        "error": {
            "message": error.to_string(),
            "type": error.kind(),
        },
    })
}

fn generate_session_id() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let mut id = String::with_capacity(29);
    id.push_str("sess_");
    for _ in 0..24 {
        id.push(HEX[rng.gen_range(0..16)] as char);
    }
    id
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::hardware::{HardwareInfo, StaticOracle};
    use crate::registry::ModelRegistry;
    use tokio::sync::mpsc::unbounded_channel;

    fn manager() -> RealtimeSessionManager {
        let oracle: Arc<dyn crate::hardware::HardwareOracle> =
            Arc::new(StaticOracle(HardwareInfo::default()));
        let registry =
            Arc::new(ModelRegistry::new(Arc::clone(&oracle), None, true).expect("registry"));
        let config = ServerConfig {
            offline: true,
            ..ServerConfig::default()
        };
        RealtimeSessionManager::new(Arc::new(Router::new(registry, oracle, config)))
    }

    fn b64_samples(value: i16, count: usize) -> String {
        use base64::Engine as _;
        let mut bytes = Vec::with_capacity(count * 2);
        for _ in 0..count {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[tokio::test]
    async fn session_created_event_is_first() {
        let manager = manager();
        let (tx, mut rx) = unbounded_channel();
        let id = manager.create_session(tx, &json!({"model": "Whisper-Large-v3"}));
        assert!(id.starts_with("sess_"));
        assert_eq!(id.len(), 29);

        let event = rx.recv().await.expect("event sent");
        assert_eq!(event["type"], "session.created");
        assert_eq!(event["session"]["id"], json!(id));
    }

    #[tokio::test]
    async fn update_session_emits_updated_with_model() {
        let manager = manager();
        let (tx, mut rx) = unbounded_channel();
        let id = manager.create_session(tx, &json!({}));
        let _ = rx.recv().await;

        manager.update_session(&id, &json!({"model": "Whisper-Base"}));
        let event = rx.recv().await.expect("event sent");
        assert_eq!(event["type"], "session.updated");
        assert_eq!(event["session"]["model"], "Whisper-Base");
    }

    #[tokio::test]
    async fn speech_start_fires_after_enough_voiced_audio() {
        let manager = manager();
        let (tx, mut rx) = unbounded_channel();
        let id = manager.create_session(tx, &json!({}));
        let _ = rx.recv().await;

        // 100 ms voiced chunks (amplitude ~0.3) until onset conditions met.
        let chunk = b64_samples(10_000, 1600);
        for _ in 0..3 {
            manager.append_audio(&id, &chunk).await;
        }

        let event = rx.recv().await.expect("speech_started sent");
        assert_eq!(event["type"], "input_audio_buffer.speech_started");
    }

    #[tokio::test]
    async fn clear_emits_cleared_and_empties_buffer() {
        let manager = manager();
        let (tx, mut rx) = unbounded_channel();
        let id = manager.create_session(tx, &json!({}));
        let _ = rx.recv().await;

        manager.append_audio(&id, &b64_samples(0, 1600)).await;
        manager.clear_audio(&id);
        let event = rx.recv().await.expect("cleared sent");
        assert_eq!(event["type"], "input_audio_buffer.cleared");

        let session = manager.get(&id).expect("session exists");
        assert!(session.buffer.is_empty());
    }

    #[tokio::test]
    async fn closed_session_stops_sending() {
        let manager = manager();
        let (tx, mut rx) = unbounded_channel();
        let id = manager.create_session(tx, &json!({}));
        let _ = rx.recv().await;

        manager.close_session(&id);
        assert!(!manager.session_exists(&id));
        // Appends to a closed session are dropped silently.
        manager.append_audio(&id, &b64_samples(10_000, 1600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn bad_base64_surfaces_error_event() {
        let manager = manager();
        let (tx, mut rx) = unbounded_channel();
        let id = manager.create_session(tx, &json!({}));
        let _ = rx.recv().await;

        manager.append_audio(&id, "!!!not-base64!!!").await;
        let event = rx.recv().await.expect("error sent");
        assert_eq!(event["type"], "error");
        assert_eq!(event["error"]["type"], "audio_file_invalid");
    }

    #[test]
    fn session_ids_are_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
    }
}
