use crate::history::HistoryOutcome;
use crate::model::{CanonicalRecord, LogRecord, RunMeta, RunStatus, SlideRecord};
use serde::Serialize;
use std::collections::HashSet;

/// Records produced by one step of either path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    pub logs: Vec<LogRecord>,
    pub slides: Vec<SlideRecord>,
    pub meta: Option<RunMeta>,
}

impl RecordBatch {
    pub fn push(&mut self, record: CanonicalRecord) {
        match record {
            CanonicalRecord::Log(log) => {
                if let Some(meta) = RunMeta::from_record(&log) {
                    self.meta = Some(meta);
                }
                self.logs.push(log);
            }
            CanonicalRecord::Slide(slide) => self.slides.push(slide),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.slides.is_empty() && self.meta.is_none()
    }
}

impl Extend<CanonicalRecord> for RecordBatch {
    fn extend<I: IntoIterator<Item = CanonicalRecord>>(&mut self, iter: I) {
        for record in iter {
            self.push(record);
        }
    }
}

impl From<HistoryOutcome> for RecordBatch {
    fn from(outcome: HistoryOutcome) -> Self {
        Self {
            logs: outcome.logs,
            slides: outcome.slides,
            meta: Some(outcome.meta),
        }
    }
}

/// Everything the core tells its consumer. Streaming output is always an
/// `Append`; a history load is always a `Replace`.
#[derive(Debug, Clone, PartialEq)]
pub enum RunUpdate {
    Status {
        status: RunStatus,
        error: Option<String>,
    },
    Append(RecordBatch),
    Replace(RecordBatch),
}

impl RunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self::Status {
            status,
            error: None,
        }
    }

    pub fn failure(status: RunStatus, error: impl Into<String>) -> Self {
        Self::Status {
            status,
            error: Some(error.into()),
        }
    }
}

/// Consumer-side view of one run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunState {
    pub run_id: String,
    pub status: RunStatus,
    pub title: String,
    pub total_steps: u32,
    pub logs: Vec<LogRecord>,
    pub slides: Vec<SlideRecord>,
    pub error: Option<String>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>) -> Self {
        let meta = RunMeta::default();
        Self {
            run_id: run_id.into(),
            status: RunStatus::Idle,
            title: meta.title,
            total_steps: meta.total_steps,
            logs: Vec::new(),
            slides: Vec::new(),
            error: None,
        }
    }

    pub fn apply(&mut self, update: RunUpdate) {
        match update {
            RunUpdate::Status { status, error } => {
                self.status = status;
                self.error = error;
            }
            RunUpdate::Append(batch) => self.append(batch),
            RunUpdate::Replace(batch) => self.replace(batch),
        }
    }

    fn append(&mut self, batch: RecordBatch) {
        if let Some(meta) = batch.meta {
            self.set_meta(meta);
        }
        let mut known: HashSet<String> = self.logs.iter().map(|log| log.id.clone()).collect();
        for log in batch.logs {
            if known.insert(log.id.clone()) {
                self.logs.push(log);
            }
        }
        for slide in batch.slides {
            self.upsert_slide(slide);
        }
    }

    fn replace(&mut self, batch: RecordBatch) {
        self.set_meta(batch.meta.unwrap_or_default());
        self.logs = batch.logs;
        self.slides.clear();
        for slide in batch.slides {
            self.upsert_slide(slide);
        }
    }

    fn set_meta(&mut self, meta: RunMeta) {
        self.title = meta.title;
        self.total_steps = meta.total_steps;
    }

    /// Keeps slides unique and ordered by number. A complete slide replaces an
    /// incomplete one; an incomplete slide never replaces a complete one.
    fn upsert_slide(&mut self, slide: SlideRecord) {
        match self
            .slides
            .binary_search_by_key(&slide.slide_number, |existing| existing.slide_number)
        {
            Ok(idx) => {
                if slide.complete || !self.slides[idx].complete {
                    self.slides[idx] = slide;
                }
            }
            Err(idx) => self.slides.insert(idx, slide),
        }
    }

    pub fn completed_slides(&self) -> usize {
        self.slides.iter().filter(|slide| slide.complete).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogBody, PLACEHOLDER_TITLE};
    use chrono::Utc;

    fn tool_log(id: &str) -> LogRecord {
        LogRecord {
            id: id.to_string(),
            timestamp: Utc::now(),
            producer: "tool_executor".to_string(),
            complete: true,
            body: LogBody::ToolCall {
                tool: "chart".to_string(),
                input: serde_json::Value::Null,
                output: None,
            },
        }
    }

    fn slide(number: u32, complete: bool) -> SlideRecord {
        SlideRecord::from_parts(
            number,
            Some(format!("thinking {number}")),
            complete.then(|| format!("<p>{number}</p>")),
            Utc::now(),
        )
    }

    #[test]
    fn append_skips_known_log_ids() {
        let mut state = RunState::new("run-1");
        let batch = RecordBatch {
            logs: vec![tool_log("a"), tool_log("b")],
            ..RecordBatch::default()
        };
        state.apply(RunUpdate::Append(batch.clone()));
        state.apply(RunUpdate::Append(batch));
        assert_eq!(state.logs.len(), 2);
    }

    #[test]
    fn slides_stay_sorted_and_unique() {
        let mut state = RunState::new("run-1");
        state.apply(RunUpdate::Append(RecordBatch {
            slides: vec![slide(3, true), slide(1, false)],
            ..RecordBatch::default()
        }));
        state.apply(RunUpdate::Append(RecordBatch {
            slides: vec![slide(1, true), slide(2, true), slide(3, false)],
            ..RecordBatch::default()
        }));

        let numbers: Vec<_> = state.slides.iter().map(|s| s.slide_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(state.slides.iter().all(|s| s.complete));
        assert_eq!(state.completed_slides(), 3);
    }

    #[test]
    fn replace_discards_streamed_state() {
        let mut state = RunState::new("run-1");
        state.apply(RunUpdate::Append(RecordBatch {
            logs: vec![tool_log("a")],
            slides: vec![slide(1, true)],
            meta: Some(RunMeta {
                title: "Streamed".to_string(),
                total_steps: 4,
            }),
        }));

        state.apply(RunUpdate::Replace(RecordBatch {
            logs: vec![tool_log("z")],
            ..RecordBatch::default()
        }));

        assert_eq!(state.logs.len(), 1);
        assert_eq!(state.logs[0].id, "z");
        assert!(state.slides.is_empty());
        assert_eq!(state.title, PLACEHOLDER_TITLE);
        assert_eq!(state.total_steps, 0);
    }

    #[test]
    fn status_update_sets_and_clears_error() {
        let mut state = RunState::new("run-1");
        state.apply(RunUpdate::failure(RunStatus::Error, "status check failed"));
        assert_eq!(state.status, RunStatus::Error);
        assert_eq!(state.error.as_deref(), Some("status check failed"));

        state.apply(RunUpdate::status(RunStatus::Checking));
        assert_eq!(state.error, None);
    }
}
