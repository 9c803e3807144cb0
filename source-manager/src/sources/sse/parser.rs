//! Incremental `text/event-stream` framing.
//!
//! Bytes are buffered until a full line is available, so a chunk boundary
//! that falls inside a line (or inside a multi-byte character) is harmless.

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseMessage {
    pub event_type: String,
    /// `data:` lines joined with `\n`
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event_type: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one chunk and returns every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            let line = String::from_utf8_lossy(&line);
            if let Some(message) = self.process_line(&line) {
                messages.push(message);
            }
        }
        messages
    }

    fn process_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        // Comment / keep-alive
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    /// Blank-line boundary: emit pending data, then reset.
    fn dispatch(&mut self) -> Option<SseMessage> {
        let event_type = self
            .event_type
            .take()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "message".to_string());
        let data = std::mem::take(&mut self.data).join("\n");

        if data.is_empty() {
            return None;
        }
        Some(SseMessage { event_type, data })
    }
}
