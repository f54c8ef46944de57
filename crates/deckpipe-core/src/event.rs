use crate::model::{Phase, SearchLink};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("event has no producer")]
    MissingProducer,
    #[error("unknown producer '{0}'")]
    UnknownProducer(String),
    #[error("event from '{producer}' has no event kind")]
    MissingEventKind { producer: String },
    #[error("invalid '{event}' payload from '{producer}': {reason}")]
    InvalidPayload {
        producer: String,
        event: String,
        reason: String,
    },
}

/// Event as it arrives in a stream `data:` line or in the history log array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RawEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "producer")]
    pub agent: String,
    #[serde(default, alias = "type")]
    pub event: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl RawEvent {
    /// Fills `id` and `event` from the enclosing SSE frame when the payload
    /// itself does not carry them.
    pub fn with_frame_defaults(mut self, frame_id: Option<&str>, frame_event: Option<&str>) -> Self {
        if self.id.as_deref().map_or(true, str::is_empty) {
            self.id = frame_id.filter(|id| !id.is_empty()).map(str::to_string);
        }
        if self.event.as_deref().map_or(true, str::is_empty) {
            self.event = frame_event
                .filter(|event| !event.is_empty() && *event != "message")
                .map(str::to_string);
        }
        self
    }
}

/// Closed set of pipeline stages that may emit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProducerKind {
    Planner,
    SearchWorker(u32),
    SlideGenerator,
    ToolExecutor,
}

impl ProducerKind {
    /// Resolves a producer name. `search_worker` without a numeric suffix
    /// takes its index from the payload's `worker` field.
    pub fn resolve(name: &str, data: &Value) -> Result<Self, EventError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EventError::MissingProducer);
        }
        match name {
            "planner" => return Ok(Self::Planner),
            "slide_generator" => return Ok(Self::SlideGenerator),
            "tool_executor" => return Ok(Self::ToolExecutor),
            _ => {}
        }

        let captures = search_worker_pattern()
            .captures(name)
            .ok_or_else(|| EventError::UnknownProducer(name.to_string()))?;
        let index = match captures.get(1) {
            Some(suffix) => suffix.as_str().parse::<u32>().ok(),
            None => data.get("worker").and_then(flexible_u32),
        };
        index
            .map(Self::SearchWorker)
            .ok_or_else(|| EventError::UnknownProducer(name.to_string()))
    }

    pub fn phase(self) -> Phase {
        match self {
            Self::Planner => Phase::Planning,
            Self::SearchWorker(_) => Phase::Research,
            Self::SlideGenerator => Phase::Generation,
            Self::ToolExecutor => Phase::ToolCall,
        }
    }
}

impl fmt::Display for ProducerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planner => f.write_str("planner"),
            Self::SearchWorker(index) => write!(f, "search_worker_{index}"),
            Self::SlideGenerator => f.write_str("slide_generator"),
            Self::ToolExecutor => f.write_str("tool_executor"),
        }
    }
}

fn search_worker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^search[_-]worker(?:[_-](\d+))?$").expect("static search worker pattern")
    })
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PlanPayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "total_steps", deserialize_with = "deserialize_opt_u32")]
    pub total_slides: Option<u32>,
    #[serde(default)]
    pub outline: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct SummaryPayload {
    summary: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct ThinkingPayload {
    #[serde(deserialize_with = "deserialize_u32")]
    slide_number: u32,
    thinking: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct ContentPayload {
    #[serde(deserialize_with = "deserialize_u32")]
    slide_number: u32,
    #[serde(alias = "html")]
    html_content: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ToolCallPayload {
    pub tool: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
}

/// Typed body of an event after producer routing.
#[derive(Debug, Clone, PartialEq)]
pub enum ProducerEvent {
    Plan(PlanPayload),
    Link { worker: u32, link: SearchLink },
    Summary { worker: u32, summary: String },
    Thinking { slide_number: u32, thinking: String },
    Content { slide_number: u32, html_content: String },
    ToolCall(ToolCallPayload),
    Unrecognized { event: String, payload: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub id: Option<String>,
    pub producer: String,
    pub kind: ProducerKind,
    pub timestamp: DateTime<Utc>,
    pub body: ProducerEvent,
}

/// Routes a raw event to its producer kind and decodes the kind-specific
/// payload. Shared by the live aggregator and the history reconciler so both
/// paths classify events identically.
pub fn decode_event(raw: &RawEvent) -> Result<DecodedEvent, EventError> {
    let kind = ProducerKind::resolve(&raw.agent, &raw.data)?;
    let producer = raw.agent.trim().to_string();
    let event = raw
        .event
        .as_deref()
        .map(str::trim)
        .filter(|event| !event.is_empty())
        .ok_or_else(|| EventError::MissingEventKind {
            producer: producer.clone(),
        })?;

    let body = match (kind, event) {
        (ProducerKind::Planner, "plan") => ProducerEvent::Plan(payload(raw, &producer, event)?),
        (ProducerKind::SearchWorker(worker), "link") => ProducerEvent::Link {
            worker,
            link: payload(raw, &producer, event)?,
        },
        (ProducerKind::SearchWorker(worker), "summary") => {
            let parsed: SummaryPayload = payload(raw, &producer, event)?;
            ProducerEvent::Summary {
                worker,
                summary: parsed.summary,
            }
        }
        (ProducerKind::SlideGenerator, "thinking") => {
            let parsed: ThinkingPayload = payload(raw, &producer, event)?;
            ProducerEvent::Thinking {
                slide_number: require_slide_number(parsed.slide_number, &producer, event)?,
                thinking: parsed.thinking,
            }
        }
        (ProducerKind::SlideGenerator, "content") => {
            let parsed: ContentPayload = payload(raw, &producer, event)?;
            ProducerEvent::Content {
                slide_number: require_slide_number(parsed.slide_number, &producer, event)?,
                html_content: parsed.html_content,
            }
        }
        (ProducerKind::ToolExecutor, "tool_call") => {
            ProducerEvent::ToolCall(payload(raw, &producer, event)?)
        }
        (_, other) => ProducerEvent::Unrecognized {
            event: other.to_string(),
            payload: raw.data.clone(),
        },
    };

    Ok(DecodedEvent {
        id: raw.id.clone().filter(|id| !id.is_empty()),
        producer,
        kind,
        timestamp: parse_event_at(raw.timestamp.as_deref()),
        body,
    })
}

pub fn parse_event_at(timestamp: Option<&str>) -> DateTime<Utc> {
    timestamp
        .and_then(|value| DateTime::parse_from_rfc3339(value.trim()).ok())
        .map(|value| value.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn payload<T: DeserializeOwned>(raw: &RawEvent, producer: &str, event: &str) -> Result<T, EventError> {
    serde_json::from_value(raw.data.clone()).map_err(|err| EventError::InvalidPayload {
        producer: producer.to_string(),
        event: event.to_string(),
        reason: err.to_string(),
    })
}

fn require_slide_number(number: u32, producer: &str, event: &str) -> Result<u32, EventError> {
    if number == 0 {
        return Err(EventError::InvalidPayload {
            producer: producer.to_string(),
            event: event.to_string(),
            reason: "slide numbers start at 1".to_string(),
        });
    }
    Ok(number)
}

fn flexible_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|u| u32::try_from(u).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }
}

/// Accepts a number or a numeric string.
pub(crate) fn deserialize_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    flexible_u32(&val).ok_or_else(|| serde::de::Error::custom("expected string or number for u32"))
}

fn deserialize_opt_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    if val.is_null() {
        return Ok(None);
    }
    flexible_u32(&val)
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom("expected string or number for u32"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(agent: &str, event: &str, data: Value) -> RawEvent {
        RawEvent {
            id: Some("evt-1".to_string()),
            agent: agent.to_string(),
            event: Some(event.to_string()),
            timestamp: Some("2026-10-16T10:00:00Z".to_string()),
            data,
        }
    }

    #[test]
    fn resolves_closed_producer_set() {
        let none = Value::Null;
        assert_eq!(ProducerKind::resolve("planner", &none), Ok(ProducerKind::Planner));
        assert_eq!(
            ProducerKind::resolve("search_worker_3", &none),
            Ok(ProducerKind::SearchWorker(3))
        );
        assert_eq!(
            ProducerKind::resolve("search_worker", &json!({"worker": "2"})),
            Ok(ProducerKind::SearchWorker(2))
        );
        assert_eq!(
            ProducerKind::resolve("slide_generator", &none),
            Ok(ProducerKind::SlideGenerator)
        );
        assert_eq!(
            ProducerKind::resolve("search_workers_summary", &none),
            Err(EventError::UnknownProducer("search_workers_summary".to_string()))
        );
        assert_eq!(ProducerKind::resolve("  ", &none), Err(EventError::MissingProducer));
        assert_eq!(
            ProducerKind::resolve("search_worker", &none),
            Err(EventError::UnknownProducer("search_worker".to_string()))
        );
    }

    #[test]
    fn decodes_slide_parts_with_string_numbers() {
        let decoded = decode_event(&raw(
            "slide_generator",
            "content",
            json!({"slide_number": "4", "html": "<h1>Intro</h1>"}),
        ))
        .expect("decode");
        assert_eq!(
            decoded.body,
            ProducerEvent::Content {
                slide_number: 4,
                html_content: "<h1>Intro</h1>".to_string()
            }
        );
        assert_eq!(decoded.kind.phase(), Phase::Generation);
    }

    #[test]
    fn rejects_slide_zero_and_bad_payloads() {
        let err = decode_event(&raw(
            "slide_generator",
            "thinking",
            json!({"slide_number": 0, "thinking": "x"}),
        ))
        .expect_err("slide zero");
        assert!(matches!(err, EventError::InvalidPayload { .. }));

        let err = decode_event(&raw("search_worker_1", "link", json!({"title": "no url"})))
            .expect_err("missing url");
        assert!(matches!(err, EventError::InvalidPayload { .. }));
    }

    #[test]
    fn undefined_event_kind_is_kept_as_unrecognized() {
        let decoded =
            decode_event(&raw("planner", "replan", json!({"why": "scope"}))).expect("decode");
        assert_eq!(
            decoded.body,
            ProducerEvent::Unrecognized {
                event: "replan".to_string(),
                payload: json!({"why": "scope"})
            }
        );
    }

    #[test]
    fn frame_defaults_fill_missing_id_and_event() {
        let event: RawEvent =
            serde_json::from_str(r#"{"producer":"search_worker_1","data":{"url":"https://a"}}"#)
                .expect("parse");
        let event = event.with_frame_defaults(Some("42"), Some("link"));
        assert_eq!(event.id.as_deref(), Some("42"));
        assert_eq!(event.event.as_deref(), Some("link"));

        let generic = RawEvent::default().with_frame_defaults(None, Some("message"));
        assert_eq!(generic.event, None);
    }

    #[test]
    fn unparseable_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let parsed = parse_event_at(Some("yesterday"));
        assert!(parsed >= before);
    }
}
