use std::mem;
use thiserror::Error;

pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// One dispatched server-sent event. Every field is optional on the wire; a
/// frame is only produced when at least one of them was present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: Option<String>,
    pub retry: Option<u64>,
}

impl SseFrame {
    fn is_empty(&self) -> bool {
        self.id.is_none() && self.event.is_none() && self.data.is_none() && self.retry.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("line exceeds max size: {size} > {max}")]
    OversizedLine { size: usize, max: usize },
    #[error("buffer exceeds max size without newline: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("line is not valid utf-8: {0}")]
    Utf8(String),
    #[error("invalid retry value '{0}'")]
    InvalidRetry(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> DecodeReport<T> {
    fn push_frame(&mut self, frame: T) {
        self.frames.push(frame);
    }

    fn push_error(&mut self, error: FrameError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.errors.is_empty()
    }
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes are buffered until a newline arrives, so a chunk boundary that falls
/// inside a multi-byte character never corrupts a line. Malformed lines are
/// reported and skipped; decoding carries on with the next line.
pub struct SseFrameDecoder {
    max_line_bytes: usize,
    pending: Vec<u8>,
    current: SseFrame,
}

impl SseFrameDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            pending: Vec::new(),
            current: SseFrame::default(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<SseFrame> {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            if line.ends_with(b"\n") {
                line.pop();
            }
            if line.ends_with(b"\r") {
                line.pop();
            }
            self.process_line(&line, &mut report);
        }

        if self.pending.len() > self.max_line_bytes {
            report.push_error(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_line_bytes,
            });
            self.pending.clear();
        }

        report
    }

    /// Drains whatever is buffered when the stream ends: a trailing line
    /// without newline and an event that never got its blank-line terminator.
    pub fn finish(&mut self) -> DecodeReport<SseFrame> {
        let mut report = DecodeReport::default();
        if !self.pending.is_empty() {
            let line = mem::take(&mut self.pending);
            self.process_line(&line, &mut report);
        }
        self.dispatch(&mut report);
        report
    }

    /// Drops partial state, used when a connection is replaced.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.current = SseFrame::default();
    }

    fn process_line(&mut self, raw: &[u8], report: &mut DecodeReport<SseFrame>) {
        if raw.len() > self.max_line_bytes {
            report.push_error(FrameError::OversizedLine {
                size: raw.len(),
                max: self.max_line_bytes,
            });
            return;
        }
        if raw.is_empty() {
            self.dispatch(report);
            return;
        }
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line,
            Err(err) => {
                report.push_error(FrameError::Utf8(err.to_string()));
                return;
            }
        };
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => self.current.id = Some(value.to_string()),
            "event" => self.current.event = Some(value.to_string()),
            "data" => match self.current.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.current.data = Some(value.to_string()),
            },
            "retry" => match value.trim().parse::<u64>() {
                Ok(retry) => self.current.retry = Some(retry),
                Err(_) => report.push_error(FrameError::InvalidRetry(value.to_string())),
            },
            _ => {}
        }
    }

    fn dispatch(&mut self, report: &mut DecodeReport<SseFrame>) {
        let frame = mem::take(&mut self.current);
        if !frame.is_empty() {
            report.push_frame(frame);
        }
    }
}

impl Default for SseFrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "id: evt-1\nevent: link\ndata: {\"agent\":\"search_worker_1\"}\n\n\
: keep-alive\n\
id: evt-2\ndata: {\"a\":1}\ndata: {\"b\":2}\nretry: 2500\n\n";

    #[test]
    fn decodes_complete_events_and_skips_comments() {
        let mut decoder = SseFrameDecoder::default();
        let report = decoder.push_chunk(STREAM.as_bytes());

        assert!(report.errors.is_empty());
        assert_eq!(report.frames.len(), 2);
        assert_eq!(report.frames[0].id.as_deref(), Some("evt-1"));
        assert_eq!(report.frames[0].event.as_deref(), Some("link"));
        assert_eq!(
            report.frames[0].data.as_deref(),
            Some("{\"agent\":\"search_worker_1\"}")
        );
        assert_eq!(
            report.frames[1].data.as_deref(),
            Some("{\"a\":1}\n{\"b\":2}")
        );
        assert_eq!(report.frames[1].retry, Some(2500));
    }

    #[test]
    fn chunk_boundaries_do_not_change_frames() {
        let text = "id: é-1\ndata: {\"title\":\"Überblick ✓\"}\n\n";
        let mut whole = SseFrameDecoder::default();
        let expected = whole.push_chunk(text.as_bytes()).frames;

        let bytes = text.as_bytes();
        for split in 1..bytes.len() {
            let mut decoder = SseFrameDecoder::default();
            let mut frames = decoder.push_chunk(&bytes[..split]).frames;
            frames.extend(decoder.push_chunk(&bytes[split..]).frames);
            assert_eq!(frames, expected, "split at byte {split}");
        }
    }

    #[test]
    fn crlf_lines_and_bare_field_names_are_accepted() {
        let mut decoder = SseFrameDecoder::default();
        let report = decoder.push_chunk(b"id:evt-9\r\ndata\r\n\r\n");
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.frames[0].id.as_deref(), Some("evt-9"));
        assert_eq!(report.frames[0].data.as_deref(), Some(""));
    }

    #[test]
    fn oversized_line_is_rejected_and_decoding_continues() {
        let mut decoder = SseFrameDecoder::new(64);
        let mut chunk = format!("data: {}\n\n", "x".repeat(200)).into_bytes();
        chunk.extend_from_slice(b"id: ok\n\n");

        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(
            report.errors[0],
            FrameError::OversizedLine { .. }
        ));
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.frames[0].id.as_deref(), Some("ok"));
    }

    #[test]
    fn unterminated_buffer_over_limit_is_dropped() {
        let mut decoder = SseFrameDecoder::new(16);
        let report = decoder.push_chunk("data: ".repeat(10).as_bytes());
        assert!(matches!(
            report.errors[0],
            FrameError::OversizedBuffer { .. }
        ));
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn finish_dispatches_trailing_event() {
        let mut decoder = SseFrameDecoder::default();
        assert!(decoder.push_chunk(b"id: tail\ndata: {}").frames.is_empty());
        let report = decoder.finish();
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.frames[0].id.as_deref(), Some("tail"));
        assert_eq!(report.frames[0].data.as_deref(), Some("{}"));
    }

    #[test]
    fn invalid_retry_is_reported_without_losing_event() {
        let mut decoder = SseFrameDecoder::default();
        let report = decoder.push_chunk(b"retry: soon\ndata: {}\n\n");
        assert_eq!(report.errors, vec![FrameError::InvalidRetry("soon".to_string())]);
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.frames[0].retry, None);
    }
}
