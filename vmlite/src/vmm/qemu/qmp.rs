//! QMP (QEMU Machine Protocol) codec.
//!
//! Outbound commands are single JSON objects terminated by a newline.
//! Inbound output is line-delimited JSON; one read event of the process may
//! carry several records, of which only the first decodable one is acted
//! upon. The rest stay queued for the next read event.

use serde_json::{Map, Value, json};
use vmlite_shared::errors::{VmliteError, VmliteResult};

const HUMAN_MONITOR_COMMAND: &str = "human-monitor-command";

/// Encode `{"execute": "<command>"}`.
pub fn execute(command: &str) -> Vec<u8> {
    encode(&json!({ "execute": command }))
}

/// Encode a human-monitor command line (`savevm`, `delvm`, ...) as QMP.
pub fn human_command(command_line: &str) -> Vec<u8> {
    encode(&json!({
        "execute": HUMAN_MONITOR_COMMAND,
        "arguments": { "command-line": command_line },
    }))
}

fn encode(value: &Value) -> Vec<u8> {
    let mut bytes = value.to_string().into_bytes();
    bytes.push(b'\n');
    bytes
}

/// Asynchronous events the controller reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Reset,
    Powerdown,
    Shutdown,
    Stop,
    Resume,
    Other(String),
}

impl EventKind {
    fn from_name(name: &str) -> Self {
        match name {
            "RESET" => EventKind::Reset,
            "POWERDOWN" => EventKind::Powerdown,
            "SHUTDOWN" => EventKind::Shutdown,
            "STOP" => EventKind::Stop,
            "RESUME" => EventKind::Resume,
            other => EventKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QmpEvent {
    pub kind: EventKind,
    pub data: Option<Value>,
    /// `(seconds, microseconds)` as reported by the hypervisor.
    pub timestamp: Option<(i64, i64)>,
}

/// One decoded inbound record.
#[derive(Debug, Clone, PartialEq)]
pub enum QmpMessage {
    /// Server greeting sent once on connect.
    Greeting(Value),
    /// Successful command reply.
    Return(Value),
    /// Failed command reply.
    Error { class: String, desc: String },
    Event(QmpEvent),
}

/// Decode a single line of hypervisor output.
pub fn decode_record(line: &[u8]) -> VmliteResult<QmpMessage> {
    let value: Value = serde_json::from_slice(line)
        .map_err(|e| VmliteError::ProtocolDecode(format!("invalid JSON record: {}", e)))?;

    let Value::Object(mut object) = value else {
        return Err(VmliteError::ProtocolDecode(
            "record is not a JSON object".into(),
        ));
    };

    if let Some(greeting) = object.remove("QMP") {
        return Ok(QmpMessage::Greeting(greeting));
    }

    if let Some(ret) = object.remove("return") {
        return Ok(QmpMessage::Return(ret));
    }

    if let Some(error) = object.remove("error") {
        return Ok(QmpMessage::Error {
            class: string_field(&error, "class"),
            desc: string_field(&error, "desc"),
        });
    }

    if let Some(Value::String(name)) = object.remove("event") {
        return Ok(QmpMessage::Event(QmpEvent {
            kind: EventKind::from_name(&name),
            data: object.remove("data"),
            timestamp: object.remove("timestamp").and_then(|ts| parse_timestamp(&ts)),
        }));
    }

    Err(VmliteError::ProtocolDecode(format!(
        "unrecognized record with keys [{}]",
        keys(&object)
    )))
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_timestamp(value: &Value) -> Option<(i64, i64)> {
    Some((
        value.get("seconds")?.as_i64()?,
        value.get("microseconds")?.as_i64()?,
    ))
}

fn keys(object: &Map<String, Value>) -> String {
    object.keys().cloned().collect::<Vec<_>>().join(", ")
}

/// Accumulates hypervisor stdout and yields one record per read event.
#[derive(Debug, Default)]
pub struct QmpDecoder {
    buffer: Vec<u8>,
}

impl QmpDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw output from one read event.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Consume complete lines until the first decodable record.
    ///
    /// Blank and undecodable lines are dropped with a debug log. Lines after
    /// the returned record remain buffered, as does any trailing partial line.
    pub fn next_message(&mut self) -> Option<QmpMessage> {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match decode_record(&line) {
                Ok(message) => return Some(message),
                Err(e) => {
                    tracing::debug!(
                        error = %e,
                        line = %String::from_utf8_lossy(&line),
                        "Dropping undecodable QMP output"
                    );
                }
            }
        }
        None
    }

    /// Bytes not yet consumed.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
