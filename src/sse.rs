use std::time::Duration;

/// One dispatched `text/event-stream` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    pub fn new(event: &str, data: &str) -> Self {
        Self {
            event: event.to_string(),
            data: data.to_string(),
        }
    }
}

/// Incremental event-stream decoder.
///
/// Chunks may split lines or multi-byte characters anywhere; incomplete
/// lines stay buffered until the rest arrives. Lines are split on `\n`
/// bytes, which never occur inside a UTF-8 sequence.
///
/// Stream format:
/// - `event: <name>` sets the name of the pending event
/// - `data: <text>` appends a data line (several are joined with `\n`)
/// - `id: <text>` and `retry: <ms>` are remembered on the parser
/// - `: comment` lines are keep-alives and ignored
/// - an empty line dispatches the pending event
#[derive(Debug, Default)]
pub struct EventParser {
    buffer: Vec<u8>,
    event: String,
    data: String,
    has_data: bool,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = value.to_string(),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" => self.last_event_id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.trim().parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
        None
    }

    // An event with a name but no data line still dispatches; some
    // notifications carry no payload at all.
    fn dispatch(&mut self) -> Option<SseEvent> {
        if !self.has_data && self.event.is_empty() {
            return None;
        }
        let event = if self.event.is_empty() {
            "message".to_string()
        } else {
            std::mem::take(&mut self.event)
        };
        let data = std::mem::take(&mut self.data);
        self.has_data = false;
        Some(SseEvent { event, data })
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnect delay suggested by the server through `retry:`.
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }
}
