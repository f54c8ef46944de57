pub mod api;
pub mod config;
pub mod orchestrator;
pub mod transport;

pub use api::{ApiError, ByteStream, HttpPipelineApi, PipelineApi, LAST_EVENT_ID_HEADER};
pub use config::{ClientConfig, ConfigError, DEFAULT_BASE_URL};
pub use orchestrator::RunOrchestrator;
pub use transport::{backoff_delay, StreamTransport, TransportExit, TransportSettings};
