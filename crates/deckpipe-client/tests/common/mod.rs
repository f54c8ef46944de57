#![allow(dead_code)]

use async_trait::async_trait;
use deckpipe_client::{ApiError, ByteStream, PipelineApi};
use deckpipe_core::{HistorySnapshot, RemoteStatus, RunState, RunUpdate};
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// What a scripted connection does after its chunks run out.
pub enum Tail {
    End,
    Hang,
    Fail,
}

pub struct Connection {
    pub chunks: Vec<Vec<u8>>,
    pub tail: Tail,
}

impl Connection {
    pub fn new(chunks: Vec<Vec<u8>>, tail: Tail) -> Self {
        Self { chunks, tail }
    }
}

/// Scripted server. Statuses are consumed in order and the last one repeats;
/// `None` is a failed request. Connections are consumed in order; once they
/// run out every open is refused with 503.
#[derive(Default)]
pub struct FakeApi {
    statuses: Mutex<VecDeque<Option<RemoteStatus>>>,
    last_status: Mutex<Option<Option<RemoteStatus>>>,
    history: Mutex<Option<HistorySnapshot>>,
    connections: Mutex<VecDeque<Connection>>,
    opens: Mutex<Vec<Option<String>>>,
    history_calls: Mutex<usize>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statuses(self, statuses: Vec<Option<RemoteStatus>>) -> Self {
        *self.statuses.lock().expect("statuses") = statuses.into();
        self
    }

    pub fn with_history(self, snapshot: HistorySnapshot) -> Self {
        *self.history.lock().expect("history") = Some(snapshot);
        self
    }

    pub fn with_connection(self, connection: Connection) -> Self {
        self.connections
            .lock()
            .expect("connections")
            .push_back(connection);
        self
    }

    /// Resume hints sent with each open, in order.
    pub fn opens(&self) -> Vec<Option<String>> {
        self.opens.lock().expect("opens").clone()
    }

    pub fn history_calls(&self) -> usize {
        *self.history_calls.lock().expect("history calls")
    }
}

fn unavailable(path: &str) -> ApiError {
    ApiError::Status {
        status: 503,
        url: format!("http://fake{path}"),
    }
}

#[async_trait]
impl PipelineApi for FakeApi {
    async fn fetch_status(&self, run_id: &str) -> Result<RemoteStatus, ApiError> {
        let next = self.statuses.lock().expect("statuses").pop_front();
        let mut last = self.last_status.lock().expect("last status");
        let status = match next {
            Some(status) => {
                *last = Some(status);
                status
            }
            None => last.unwrap_or(None),
        };
        status.ok_or_else(|| unavailable(&format!("/presentation-status/{run_id}")))
    }

    async fn fetch_history(&self, run_id: &str) -> Result<HistorySnapshot, ApiError> {
        *self.history_calls.lock().expect("history calls") += 1;
        self.history
            .lock()
            .expect("history")
            .clone()
            .ok_or_else(|| unavailable(&format!("/logs?p_id={run_id}")))
    }

    async fn open_stream(
        &self,
        run_id: &str,
        last_event_id: Option<&str>,
    ) -> Result<ByteStream, ApiError> {
        self.opens
            .lock()
            .expect("opens")
            .push(last_event_id.map(str::to_string));
        let Some(connection) = self.connections.lock().expect("connections").pop_front() else {
            return Err(unavailable(&format!("/stream/{run_id}")));
        };
        let head = stream::iter(connection.chunks.into_iter().map(Ok));
        let stream: ByteStream = match connection.tail {
            Tail::End => Box::pin(head),
            Tail::Hang => Box::pin(head.chain(stream::pending())),
            Tail::Fail => Box::pin(head.chain(stream::iter(vec![Err(ApiError::Stream(
                "connection reset by peer".to_string(),
            ))]))),
        };
        Ok(stream)
    }
}

/// One SSE frame carrying `payload` under `id`.
pub fn sse(id: &str, payload: Value) -> Vec<u8> {
    format!("id: {id}\ndata: {payload}\n\n").into_bytes()
}

pub fn completion() -> Vec<u8> {
    b"data: {\"status\":\"completed\"}\n\n".to_vec()
}

/// Applies everything currently queued on `rx`.
pub fn drain(rx: &mut mpsc::Receiver<RunUpdate>, state: &mut RunState) -> Vec<RunUpdate> {
    let mut seen = Vec::new();
    while let Ok(update) = rx.try_recv() {
        state.apply(update.clone());
        seen.push(update);
    }
    seen
}

pub fn statuses(updates: &[RunUpdate]) -> Vec<deckpipe_core::RunStatus> {
    updates
        .iter()
        .filter_map(|update| match update {
            RunUpdate::Status { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}
