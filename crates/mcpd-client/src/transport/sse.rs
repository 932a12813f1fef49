//! Incremental Server-Sent-Events parser shared by both transports.

/// A parsed SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SseEvent {
    /// The `id:` field, used for delivery dedupe.
    pub id: Option<String>,
    /// The `event:` field. `None` means the default "message" type.
    pub event: Option<String>,
    /// Concatenated `data:` lines.
    pub data: String,
}

impl SseEvent {
    fn is_empty(&self) -> bool {
        self.id.is_none() && self.event.is_none() && self.data.is_empty()
    }
}

/// Incremental parser over arbitrary chunk boundaries.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: String,
    current: SseEvent,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the events completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line terminates the event.
                if !self.current.is_empty() {
                    events.push(std::mem::take(&mut self.current));
                }
                continue;
            }

            // Comment lines (keep-alive pings) are ignored.
            if line.starts_with(':') {
                continue;
            }

            if let Some(value) = line.strip_prefix("data:") {
                let value = value.strip_prefix(' ').unwrap_or(value);
                if !self.current.data.is_empty() {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
            } else if let Some(value) = line.strip_prefix("event:") {
                self.current.event = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("id:") {
                self.current.id = Some(value.trim().to_string());
            }
        }

        events
    }
}
