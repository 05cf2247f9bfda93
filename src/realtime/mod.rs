//! Realtime transcription: VAD-driven audio sessions over WebSocket.

pub mod buffer;
pub mod session;
pub mod vad;

pub use buffer::AudioBuffer;
pub use session::{RealtimeSession, RealtimeSessionManager, INTERIM_CHUNK_MS};
pub use vad::{EnergyVad, VadConfig, VadEvent};
