pub mod aggregator;
pub mod event;
pub mod history;
pub mod merge;
pub mod model;
pub mod resume;
pub mod wire;

pub use aggregator::Aggregator;
pub use event::{decode_event, EventError, ProducerKind, RawEvent};
pub use history::{parse_history, HistoryOutcome, HistorySnapshot, SlideEntry};
pub use merge::{RecordBatch, RunState, RunUpdate};
pub use model::{
    CanonicalRecord, LogBody, LogRecord, Phase, RemoteStatus, RunMeta, RunStatus, SearchLink,
    SlideRecord, PLACEHOLDER_TITLE,
};
pub use resume::{MemoryResumeStore, ResumeError, ResumeStore};
pub use wire::{DecodeReport, FrameError, SseFrame, SseFrameDecoder, DEFAULT_MAX_LINE_BYTES};
