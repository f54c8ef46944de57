use crate::aggregator::{record_id, research_record};
use crate::event::{
    decode_event, deserialize_u32, parse_event_at, DecodedEvent, ProducerEvent, RawEvent,
};
use crate::model::{
    LogBody, LogRecord, RemoteStatus, RunMeta, SearchLink, SlideRecord, PLACEHOLDER_TITLE,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

/// Body of `GET /logs?p_id={run}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HistorySnapshot {
    #[serde(default)]
    pub logs: Vec<RawEvent>,
    #[serde(default)]
    pub slides: Vec<SlideEntry>,
    #[serde(default)]
    pub status: Option<RemoteStatus>,
}

/// One persisted slide part. The server may store both halves in one entry or
/// split them across several entries sharing a slide number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlideEntry {
    #[serde(deserialize_with = "deserialize_u32")]
    pub slide_number: u32,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default, alias = "html")]
    pub html_content: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistoryOutcome {
    pub logs: Vec<LogRecord>,
    pub slides: Vec<SlideRecord>,
    pub meta: RunMeta,
}

#[derive(Debug)]
struct GatheredLinks {
    producer: String,
    links: Vec<SearchLink>,
    last_event_id: Option<String>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SlideParts {
    thinking: Option<String>,
    html_content: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

/// Rebuilds the canonical view of a run from its stored history.
///
/// The log array is already complete, so research links are gathered for a
/// worker across the whole array before that worker's summary is emitted at
/// the summary's position. Workers that never summarized come last, in index
/// order, as incomplete records, which is where a live flush puts them.
pub fn parse_history(snapshot: &HistorySnapshot) -> HistoryOutcome {
    let decoded = decode_unique(&snapshot.logs);

    let mut links_by_worker: BTreeMap<u32, GatheredLinks> = BTreeMap::new();
    for event in &decoded {
        if let ProducerEvent::Link { worker, link } = &event.body {
            let entry = links_by_worker
                .entry(*worker)
                .or_insert_with(|| GatheredLinks {
                    producer: event.producer.clone(),
                    links: Vec::new(),
                    last_event_id: None,
                    timestamp: event.timestamp,
                });
            entry.links.push(link.clone());
            if event.id.is_some() {
                entry.last_event_id = event.id.clone();
            }
            entry.timestamp = event.timestamp;
        }
    }

    let mut outcome = HistoryOutcome::default();
    for event in decoded {
        let DecodedEvent {
            id,
            producer,
            kind: _,
            timestamp,
            body,
        } = event;
        match body {
            ProducerEvent::Plan(plan) => {
                let title = plan.title.unwrap_or_else(|| PLACEHOLDER_TITLE.to_string());
                let total_slides = plan.total_slides.unwrap_or(0);
                outcome.meta = RunMeta {
                    title: title.clone(),
                    total_steps: total_slides,
                };
                outcome.logs.push(LogRecord {
                    id: record_id(id, &producer, timestamp),
                    timestamp,
                    producer,
                    complete: true,
                    body: LogBody::Planning {
                        title,
                        total_slides,
                        outline: plan.outline,
                    },
                });
            }
            ProducerEvent::Summary { worker, summary } => {
                let links = links_by_worker
                    .remove(&worker)
                    .map(|gathered| gathered.links)
                    .unwrap_or_default();
                outcome.logs.push(research_record(
                    record_id(id, &producer, timestamp),
                    producer,
                    timestamp,
                    worker,
                    links,
                    Some(summary),
                ));
            }
            ProducerEvent::ToolCall(call) => outcome.logs.push(LogRecord {
                id: record_id(id, &producer, timestamp),
                timestamp,
                producer,
                complete: true,
                body: LogBody::ToolCall {
                    tool: call.tool,
                    input: call.input,
                    output: call.output,
                },
            }),
            ProducerEvent::Unrecognized { event, payload } => outcome.logs.push(LogRecord {
                id: record_id(id, &producer, timestamp),
                timestamp,
                producer,
                complete: true,
                body: LogBody::Unknown { event, payload },
            }),
            ProducerEvent::Link { .. } => {}
            ProducerEvent::Thinking { slide_number, .. }
            | ProducerEvent::Content { slide_number, .. } => {
                debug!("history_slide_log_skipped: slide={slide_number}");
            }
        }
    }

    for (worker, gathered) in links_by_worker {
        let id = gathered
            .last_event_id
            .unwrap_or_else(|| format!("{}-partial", gathered.producer));
        outcome.logs.push(research_record(
            id,
            gathered.producer,
            gathered.timestamp,
            worker,
            gathered.links,
            None,
        ));
    }

    outcome.slides = reconcile_slides(&snapshot.slides);
    outcome
}

fn decode_unique(logs: &[RawEvent]) -> Vec<DecodedEvent> {
    let mut seen = HashSet::new();
    let mut decoded = Vec::with_capacity(logs.len());
    for raw in logs {
        if raw.id.as_deref().map_or(false, |id| seen.contains(id)) {
            continue;
        }
        match decode_event(raw) {
            Ok(event) => {
                if let Some(id) = event.id.clone() {
                    seen.insert(id);
                }
                decoded.push(event);
            }
            Err(err) => warn!("history_event_skipped: {err}"),
        }
    }
    decoded
}

fn reconcile_slides(entries: &[SlideEntry]) -> Vec<SlideRecord> {
    let mut parts: BTreeMap<u32, SlideParts> = BTreeMap::new();
    for entry in entries {
        if entry.slide_number == 0 {
            warn!("history_slide_skipped: slide numbers start at 1");
            continue;
        }
        let slot = parts.entry(entry.slide_number).or_default();
        if let Some(thinking) = entry.thinking.as_ref().filter(|text| !text.is_empty()) {
            slot.thinking = Some(thinking.clone());
        }
        if let Some(html) = entry.html_content.as_ref().filter(|html| !html.is_empty()) {
            slot.html_content = Some(html.clone());
        }
        if entry.timestamp.is_some() || slot.timestamp.is_none() {
            slot.timestamp = Some(parse_event_at(entry.timestamp.as_deref()));
        }
    }

    parts
        .into_iter()
        .map(|(slide_number, slot)| {
            SlideRecord::from_parts(
                slide_number,
                slot.thinking,
                slot.html_content,
                slot.timestamp.unwrap_or_else(Utc::now),
            )
        })
        .collect()
}
