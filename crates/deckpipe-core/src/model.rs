use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const PLACEHOLDER_TITLE: &str = "Generating…";
pub const MISSING_THINKING: &str = "(no reasoning was recorded for this slide)";
pub const MISSING_SLIDE_HTML: &str =
    "<div class=\"slide-incomplete\">This slide did not finish generating.</div>";

/// Client-side lifecycle of one run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Checking,
    Queued,
    Streaming,
    Completed,
    Failed,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Queued => "queued",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Error)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status as reported by `GET /presentation-status/{run}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl RemoteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Planning,
    Research,
    Generation,
    ToolCall,
    Unknown,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Research => "research",
            Self::Generation => "generation",
            Self::ToolCall => "tool-call",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchLink {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "phase", content = "content", rename_all = "kebab-case")]
pub enum LogBody {
    Planning {
        title: String,
        total_slides: u32,
        #[serde(default)]
        outline: Vec<String>,
    },
    Research {
        worker: u32,
        links: Vec<SearchLink>,
        #[serde(default)]
        summary: Option<String>,
    },
    ToolCall {
        tool: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        output: Option<Value>,
    },
    Unknown {
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

impl LogBody {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Planning { .. } => Phase::Planning,
            Self::Research { .. } => Phase::Research,
            Self::ToolCall { .. } => Phase::ToolCall,
            Self::Unknown { .. } => Phase::Unknown,
        }
    }
}

/// A finished (or explicitly flushed) unit of pipeline progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub producer: String,
    pub complete: bool,
    #[serde(flatten)]
    pub body: LogBody,
}

impl LogRecord {
    pub fn phase(&self) -> Phase {
        self.body.phase()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlideRecord {
    pub slide_number: u32,
    pub thinking: String,
    pub html_content: String,
    pub timestamp: DateTime<Utc>,
    pub complete: bool,
}

impl SlideRecord {
    /// Builds a slide from whatever parts were collected. Missing parts are
    /// filled with placeholders and mark the slide incomplete.
    pub fn from_parts(
        slide_number: u32,
        thinking: Option<String>,
        html_content: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let complete = thinking.is_some() && html_content.is_some();
        Self {
            slide_number,
            thinking: thinking.unwrap_or_else(|| MISSING_THINKING.to_string()),
            html_content: html_content.unwrap_or_else(|| MISSING_SLIDE_HTML.to_string()),
            timestamp,
            complete,
        }
    }
}

/// Run title and declared step count, taken from the planner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunMeta {
    pub title: String,
    pub total_steps: u32,
}

impl Default for RunMeta {
    fn default() -> Self {
        Self {
            title: PLACEHOLDER_TITLE.to_string(),
            total_steps: 0,
        }
    }
}

impl RunMeta {
    pub fn from_record(record: &LogRecord) -> Option<Self> {
        match &record.body {
            LogBody::Planning {
                title,
                total_slides,
                ..
            } => Some(Self {
                title: title.clone(),
                total_steps: *total_slides,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalRecord {
    Log(LogRecord),
    Slide(SlideRecord),
}
