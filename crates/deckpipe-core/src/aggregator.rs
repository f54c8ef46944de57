use crate::event::{decode_event, DecodedEvent, EventError, ProducerEvent, RawEvent};
use crate::model::{CanonicalRecord, LogBody, LogRecord, SearchLink, SlideRecord, PLACEHOLDER_TITLE};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone)]
struct PendingResearch {
    producer: String,
    links: Vec<SearchLink>,
    last_event_id: Option<String>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct PendingSlide {
    thinking: Option<String>,
    html_content: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

/// Groups multi-part producer output into canonical records for one run.
///
/// Search workers fan in on a terminal `summary`; slides fan in once both the
/// `thinking` and `content` halves are present. Pending state lives here and
/// nowhere else, and `reset` must be called before the aggregator is reused
/// for another connect cycle.
#[derive(Debug, Default)]
pub struct Aggregator {
    seen: HashSet<String>,
    research: BTreeMap<u32, PendingResearch>,
    slides: BTreeMap<u32, PendingSlide>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Ok(None)` when the event was a duplicate or only advanced
    /// pending state.
    pub fn parse_event(&mut self, raw: &RawEvent) -> Result<Option<CanonicalRecord>, EventError> {
        if let Some(id) = raw.id.as_deref() {
            if self.seen.contains(id) {
                return Ok(None);
            }
        }
        let decoded = decode_event(raw)?;
        if let Some(id) = decoded.id.clone() {
            self.seen.insert(id);
        }
        Ok(self.ingest(decoded))
    }

    fn ingest(&mut self, event: DecodedEvent) -> Option<CanonicalRecord> {
        let DecodedEvent {
            id,
            producer,
            kind: _,
            timestamp,
            body,
        } = event;

        match body {
            ProducerEvent::Plan(plan) => Some(CanonicalRecord::Log(LogRecord {
                id: record_id(id, &producer, timestamp),
                timestamp,
                producer,
                complete: true,
                body: LogBody::Planning {
                    title: plan.title.unwrap_or_else(|| PLACEHOLDER_TITLE.to_string()),
                    total_slides: plan.total_slides.unwrap_or(0),
                    outline: plan.outline,
                },
            })),
            ProducerEvent::Link { worker, link } => {
                let entry = self
                    .research
                    .entry(worker)
                    .or_insert_with(|| PendingResearch {
                        producer: producer.clone(),
                        links: Vec::new(),
                        last_event_id: None,
                        timestamp,
                    });
                entry.links.push(link);
                entry.timestamp = timestamp;
                if id.is_some() {
                    entry.last_event_id = id;
                }
                None
            }
            ProducerEvent::Summary { worker, summary } => {
                let links = self
                    .research
                    .remove(&worker)
                    .map(|pending| pending.links)
                    .unwrap_or_default();
                Some(CanonicalRecord::Log(research_record(
                    record_id(id, &producer, timestamp),
                    producer,
                    timestamp,
                    worker,
                    links,
                    Some(summary),
                )))
            }
            ProducerEvent::Thinking {
                slide_number,
                thinking,
            } => {
                let entry = self.slides.entry(slide_number).or_default();
                entry.thinking = Some(thinking);
                entry.timestamp = Some(timestamp);
                self.complete_slide(slide_number)
            }
            ProducerEvent::Content {
                slide_number,
                html_content,
            } => {
                let entry = self.slides.entry(slide_number).or_default();
                entry.html_content = Some(html_content);
                entry.timestamp = Some(timestamp);
                self.complete_slide(slide_number)
            }
            ProducerEvent::ToolCall(call) => Some(CanonicalRecord::Log(LogRecord {
                id: record_id(id, &producer, timestamp),
                timestamp,
                producer,
                complete: true,
                body: LogBody::ToolCall {
                    tool: call.tool,
                    input: call.input,
                    output: call.output,
                },
            })),
            ProducerEvent::Unrecognized { event, payload } => {
                Some(CanonicalRecord::Log(LogRecord {
                    id: record_id(id, &producer, timestamp),
                    timestamp,
                    producer,
                    complete: true,
                    body: LogBody::Unknown { event, payload },
                }))
            }
        }
    }

    fn complete_slide(&mut self, slide_number: u32) -> Option<CanonicalRecord> {
        let ready = self
            .slides
            .get(&slide_number)
            .map(|pending| pending.thinking.is_some() && pending.html_content.is_some())
            .unwrap_or(false);
        if !ready {
            return None;
        }
        let pending = self.slides.remove(&slide_number)?;
        Some(CanonicalRecord::Slide(SlideRecord::from_parts(
            slide_number,
            pending.thinking,
            pending.html_content,
            pending.timestamp.unwrap_or_else(Utc::now),
        )))
    }

    /// Converts every open aggregation into an incomplete record: workers by
    /// index first, then slides by number. Pending state is empty afterwards;
    /// the dedup set is kept.
    pub fn flush_pending(&mut self) -> Vec<CanonicalRecord> {
        let mut records = Vec::with_capacity(self.research.len() + self.slides.len());
        for (worker, pending) in std::mem::take(&mut self.research) {
            let id = pending
                .last_event_id
                .clone()
                .unwrap_or_else(|| format!("{}-partial", pending.producer));
            records.push(CanonicalRecord::Log(research_record(
                id,
                pending.producer,
                pending.timestamp,
                worker,
                pending.links,
                None,
            )));
        }
        for (slide_number, pending) in std::mem::take(&mut self.slides) {
            records.push(CanonicalRecord::Slide(SlideRecord::from_parts(
                slide_number,
                pending.thinking,
                pending.html_content,
                pending.timestamp.unwrap_or_else(Utc::now),
            )));
        }
        records
    }

    pub fn reset(&mut self) {
        self.seen.clear();
        self.research.clear();
        self.slides.clear();
    }

    #[cfg(test)]
    fn has_pending(&self) -> bool {
        !self.research.is_empty() || !self.slides.is_empty()
    }
}

/// A research record is complete exactly when its summary arrived.
pub(crate) fn research_record(
    id: String,
    producer: String,
    timestamp: DateTime<Utc>,
    worker: u32,
    links: Vec<SearchLink>,
    summary: Option<String>,
) -> LogRecord {
    LogRecord {
        id,
        timestamp,
        producer,
        complete: summary.is_some(),
        body: LogBody::Research {
            worker,
            links,
            summary,
        },
    }
}

pub(crate) fn record_id(id: Option<String>, producer: &str, timestamp: DateTime<Utc>) -> String {
    id.unwrap_or_else(|| format!("{producer}-{}", timestamp.timestamp_millis()))
}
