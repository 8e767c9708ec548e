//! Server-Sent Events parsing and formatting.

/// SSE event parsed from an upstream stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: Option<String>,
}

/// Incremental SSE parser.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    current: SseEvent,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every event completed by them.
    pub fn parse(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);

            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    events.push(event);
                }
            } else {
                self.apply_line(line);
            }
        }
        events
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.is_empty() {
                self.apply_line(line);
            }
        }
        self.take_event()
    }

    fn apply_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.current.event = Some(value.to_string()),
            "data" => match self.current.data {
                Some(ref mut data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.current.data = Some(value.to_string()),
            },
            _ => {}
        }
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        let event = std::mem::take(&mut self.current);
        if event.data.is_some() || event.event.is_some() {
            Some(event)
        } else {
            None
        }
    }
}

/// Format an SSE event for transmission.
pub fn format_sse_event(event: Option<&str>, data: &str) -> String {
    let mut output = String::new();

    if let Some(event_name) = event {
        output.push_str("event: ");
        output.push_str(event_name);
        output.push('\n');
    }

    for line in data.lines() {
        output.push_str("data: ");
        output.push_str(line);
        output.push('\n');
    }

    output.push('\n');
    output
}

/// Format a data-only SSE event.
pub fn format_sse_data(data: &str) -> String {
    format_sse_event(None, data)
}
