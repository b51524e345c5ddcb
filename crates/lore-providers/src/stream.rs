use serde::{Deserialize, Serialize};

/// Incremental output from a streaming chat call.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub content_delta: String,
    /// Reasoning-model "thinking" text, when the vendor exposes it.
    pub reasoning_delta: Option<String>,
    pub finish_reason: Option<String>,
    /// Usually only present on the final chunk.
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Parse a single SSE line.
/// SSE format: `event: <type>\ndata: <json>\n\n`
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data:")
            .map(|data| SseParsed::Data(data.trim_start().to_string()))
    }
}

#[derive(Debug)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

/// Accumulates raw bytes and yields complete lines, keeping the trailing
/// partial line buffered until the next chunk arrives.
#[derive(Default)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a decoded chunk, returning every completed line.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buf.push_str(text);
        let mut lines: Vec<String> = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']).to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_and_data_lines() {
        match parse_sse_line("event: message_delta") {
            Some(SseParsed::Event(e)) => assert_eq!(e, "message_delta"),
            other => panic!("unexpected: {:?}", other),
        }
        match parse_sse_line("data: {\"x\":1}") {
            Some(SseParsed::Data(d)) => assert_eq!(d, "{\"x\":1}"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(parse_sse_line(": keepalive").is_none());
    }

    #[test]
    fn line_buffer_holds_partial_lines() {
        let mut buf = LineBuffer::new();
        assert!(buf.push("data: {\"a\":").is_empty());
        let lines = buf.push("1}\ndata: [DO");
        assert_eq!(lines, vec!["data: {\"a\":1}".to_string()]);
        let lines = buf.push("NE]\n");
        assert_eq!(lines, vec!["data: [DONE]".to_string()]);
    }

    #[test]
    fn line_buffer_strips_crlf() {
        let mut buf = LineBuffer::new();
        let lines = buf.push("data: x\r\n\r\n");
        assert_eq!(lines, vec!["data: x".to_string()]);
    }
}
