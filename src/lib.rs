//! Lemonade: a local, OpenAI-compatible inference gateway.
//!
//! Fronts a heterogeneous pool of native inference engines (text LLMs,
//! embeddings, reranking, speech-to-text, text-to-speech, image
//! generation) behind one HTTP/WebSocket API. Clients address models by
//! logical name; the gateway resolves each name to a backend binary and
//! checkpoint, installs the binary on demand, downloads the weights,
//! launches the backend as a subprocess on an ephemeral loopback port,
//! and forwards requests.
//!
//! # Architecture
//!
//! - **Registry** ([`registry`]): logical names → checkpoints, recipes,
//!   and on-disk artifacts.
//! - **Installer** ([`installer`]): versioned, atomic installation of
//!   backend server binaries.
//! - **Supervisor** ([`process`]): subprocess spawn/health/teardown with
//!   GPU-driver-aware delays.
//! - **Router** ([`router`]): per-class loaded-model caps, LRU eviction,
//!   serialized loads, capability-dispatched forwarding.
//! - **Streaming proxy** ([`streaming`]): byte-transparent SSE and raw
//!   byte forwarding with telemetry extraction.
//! - **Realtime** ([`realtime`]): VAD-driven transcription sessions over
//!   WebSocket.

pub mod api;
pub mod archive;
pub mod backends;
pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod hardware;
pub mod installer;
pub mod paths;
pub mod process;
pub mod realtime;
pub mod registry;
pub mod router;
pub mod streaming;
pub mod telemetry;

pub use config::ServerConfig;
pub use error::{GatewayError, Result};
pub use registry::{ModelEntry, ModelRegistry};
pub use router::Router;
