use crate::api::{ByteStream, PipelineApi};
use crate::config::ClientConfig;
use deckpipe_core::{
    Aggregator, RawEvent, RecordBatch, ResumeStore, RunStatus, RunUpdate, SseFrame,
    SseFrameDecoder,
};
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub heartbeat_timeout: Duration,
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub max_line_bytes: usize,
}

impl From<&ClientConfig> for TransportSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout,
            base_delay: config.reconnect_base_delay,
            max_attempts: config.max_reconnect_attempts,
            max_line_bytes: config.max_line_bytes,
        }
    }
}

/// How a `connect()` cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportExit {
    /// The feed ended gracefully or sent the completion signal. Pending
    /// aggregations have been flushed.
    Completed,
    Cancelled,
    /// The reconnect ceiling was reached; carries the last failure.
    GaveUp(String),
}

/// `base * 2^attempt`, saturating.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

enum StreamEnd {
    Completed,
    Cancelled,
    Failed(String),
}

struct Cycle {
    base_delay: Duration,
    attempt: u32,
    announced: bool,
}

/// Long-lived feed for one run: framing, resume markers, heartbeat and
/// reconnects. Owns the aggregator for the run.
pub struct StreamTransport {
    api: Arc<dyn PipelineApi>,
    store: Arc<dyn ResumeStore>,
    settings: TransportSettings,
    aggregator: Aggregator,
    decoder: SseFrameDecoder,
    last_event_id: Option<String>,
    cancel: Option<CancellationToken>,
}

impl StreamTransport {
    pub fn new(
        api: Arc<dyn PipelineApi>,
        store: Arc<dyn ResumeStore>,
        settings: TransportSettings,
    ) -> Self {
        let decoder = SseFrameDecoder::new(settings.max_line_bytes);
        Self {
            api,
            store,
            settings,
            aggregator: Aggregator::new(),
            decoder,
            last_event_id: None,
            cancel: None,
        }
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Drives the feed until completion, cancellation or give-up. Every
    /// record reaches `tx` as an `Append` batch, one per received chunk.
    pub async fn connect(
        &mut self,
        run_id: &str,
        tx: &mpsc::Sender<RunUpdate>,
        cancel: CancellationToken,
    ) -> TransportExit {
        self.aggregator.reset();
        self.decoder.clear();
        self.cancel = Some(cancel.clone());
        self.last_event_id = match self.store.load(run_id) {
            Ok(marker) => marker,
            Err(err) => {
                warn!("resume_load_error: run_id={run_id} {err}");
                None
            }
        };

        let span = info_span!("stream", run_id, cycle = %Uuid::new_v4());
        let exit = self
            .run_cycle(run_id, tx, &cancel)
            .instrument(span)
            .await;
        self.cancel = None;
        exit
    }

    /// Stops an in-flight `connect()`. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.decoder.clear();
    }

    async fn run_cycle(
        &mut self,
        run_id: &str,
        tx: &mpsc::Sender<RunUpdate>,
        cancel: &CancellationToken,
    ) -> TransportExit {
        let mut cycle = Cycle {
            base_delay: self.settings.base_delay,
            attempt: 0,
            announced: false,
        };

        loop {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return TransportExit::Cancelled,
                opened = self.api.open_stream(run_id, self.last_event_id.as_deref()) => opened,
            };

            let end = match opened {
                Ok(stream) => {
                    info!("stream_connected: attempt={}", cycle.attempt);
                    self.pump(run_id, stream, tx, cancel, &mut cycle).await
                }
                Err(err) => StreamEnd::Failed(err.to_string()),
            };

            let reason = match end {
                StreamEnd::Completed => return TransportExit::Completed,
                StreamEnd::Cancelled => return TransportExit::Cancelled,
                StreamEnd::Failed(reason) => reason,
            };

            self.decoder.clear();
            if cycle.attempt >= self.settings.max_attempts {
                warn!(
                    "stream_give_up: attempts={} last_error={reason}",
                    cycle.attempt
                );
                return TransportExit::GaveUp(reason);
            }
            let delay = backoff_delay(cycle.base_delay, cycle.attempt);
            cycle.attempt += 1;
            warn!(
                "stream_reconnect: attempt={} delay_ms={} reason={reason}",
                cycle.attempt,
                delay.as_millis()
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return TransportExit::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn pump(
        &mut self,
        run_id: &str,
        mut stream: ByteStream,
        tx: &mpsc::Sender<RunUpdate>,
        cancel: &CancellationToken,
        cycle: &mut Cycle,
    ) -> StreamEnd {
        let heartbeat = self.settings.heartbeat_timeout;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                next = tokio::time::timeout(heartbeat, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return StreamEnd::Failed(format!(
                        "no data within {}ms",
                        heartbeat.as_millis()
                    ))
                }
                Ok(Some(Err(err))) => return StreamEnd::Failed(err.to_string()),
                Ok(None) => {
                    debug!("stream_eof");
                    let report = self.decoder.finish();
                    for err in report.errors {
                        warn!("stream_decode_error: {err}");
                    }
                    let mut batch = RecordBatch::default();
                    self.ingest(run_id, report.frames, &mut batch, cycle);
                    return self.complete(tx, cancel, batch).await;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            if chunk.is_empty() {
                continue;
            }
            cycle.attempt = 0;
            if !cycle.announced {
                cycle.announced = true;
                if !send_update(tx, cancel, RunUpdate::status(RunStatus::Streaming)).await {
                    return StreamEnd::Cancelled;
                }
            }

            let report = self.decoder.push_chunk(&chunk);
            for err in report.errors {
                warn!("stream_decode_error: {err}");
            }
            let mut batch = RecordBatch::default();
            if self.ingest(run_id, report.frames, &mut batch, cycle) {
                return self.complete(tx, cancel, batch).await;
            }
            if !batch.is_empty() && !send_update(tx, cancel, RunUpdate::Append(batch)).await {
                return StreamEnd::Cancelled;
            }
        }
    }

    /// Feeds decoded frames to the aggregator. Returns true once the
    /// completion signal is seen; frames after it are ignored.
    fn ingest(
        &mut self,
        run_id: &str,
        frames: Vec<SseFrame>,
        batch: &mut RecordBatch,
        cycle: &mut Cycle,
    ) -> bool {
        for frame in frames {
            if let Some(retry) = frame.retry {
                debug!("stream_retry_override: ms={retry}");
                cycle.base_delay = Duration::from_millis(retry);
            }
            if let Some(id) = frame.id.as_deref().filter(|id| !id.is_empty()) {
                self.remember(run_id, id);
            }
            let Some(data) = frame.data.as_deref() else {
                continue;
            };

            let value: Value = match serde_json::from_str(data) {
                Ok(value) => value,
                Err(err) => {
                    warn!("stream_payload_error: {err}");
                    continue;
                }
            };
            if is_completion_signal(&value) {
                info!("stream_completed_signal");
                return true;
            }
            let raw: RawEvent = match serde_json::from_value(value) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!("stream_payload_error: {err}");
                    continue;
                }
            };
            let raw = raw.with_frame_defaults(frame.id.as_deref(), frame.event.as_deref());
            match self.aggregator.parse_event(&raw) {
                Ok(Some(record)) => batch.push(record),
                Ok(None) => {}
                Err(err) => warn!("stream_event_error: {err}"),
            }
        }
        false
    }

    async fn complete(
        &mut self,
        tx: &mpsc::Sender<RunUpdate>,
        cancel: &CancellationToken,
        mut batch: RecordBatch,
    ) -> StreamEnd {
        batch.extend(self.aggregator.flush_pending());
        if !batch.is_empty() && !send_update(tx, cancel, RunUpdate::Append(batch)).await {
            return StreamEnd::Cancelled;
        }
        StreamEnd::Completed
    }

    fn remember(&mut self, run_id: &str, event_id: &str) {
        if self.last_event_id.as_deref() == Some(event_id) {
            return;
        }
        self.last_event_id = Some(event_id.to_string());
        if let Err(err) = self.store.save(run_id, event_id) {
            warn!("resume_save_error: run_id={run_id} {err}");
        }
    }
}

/// Sends `update` unless `cancel` fires first, including while the channel
/// is full. Returns false when nothing was delivered.
pub(crate) async fn send_update(
    tx: &mpsc::Sender<RunUpdate>,
    cancel: &CancellationToken,
    update: RunUpdate,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(update) => sent.is_ok(),
    }
}

fn is_completion_signal(value: &Value) -> bool {
    value.get("status").and_then(Value::as_str) == Some("completed")
        && value.get("agent").is_none()
        && value.get("producer").is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_doubles_and_saturates() {
        let base = Duration::from_millis(250);
        let delays: Vec<_> = (0..6).map(|attempt| backoff_delay(base, attempt)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(backoff_delay(base, 200), base * u32::MAX);
        assert_eq!(backoff_delay(Duration::MAX, 1), Duration::MAX);
    }

    #[test]
    fn completion_signal_is_status_only() {
        assert!(is_completion_signal(&json!({"status": "completed"})));
        assert!(!is_completion_signal(&json!({"status": "processing"})));
        assert!(!is_completion_signal(
            &json!({"agent": "planner", "status": "completed", "data": {}})
        ));
    }
}
