//! JSON Lines protocol spoken with `java` and `python` source processes.
//!
//! Every line is one [`Envelope`]. The host sends a single `call`; the child
//! may send any number of `capability` requests, each answered by a
//! `capability_result`, before it sends the `result` for the call.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SourceRequest;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            message,
        }
    }

    /// One encoded line, newline included.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode a line. A version other than [`PROTOCOL_VERSION`] is rejected.
    pub fn parse(line: &str) -> Result<Self, String> {
        let raw: Value = serde_json::from_str(line).map_err(|err| err.to_string())?;
        match raw.get("v").and_then(Value::as_u64) {
            Some(v) if v == u64::from(PROTOCOL_VERSION) => {}
            other => return Err(format!("unsupported protocol version {other:?}")),
        }
        serde_json::from_value(raw).map_err(|err| err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Call {
        id: u64,
        request: SourceRequest,
    },
    Result {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ok: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Capability {
        id: u64,
        /// `http`, `bypass` or `extract`.
        op: String,
        #[serde(default)]
        params: Value,
    },
    CapabilityResult {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ok: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Message {
    pub fn capability_answer(id: u64, answer: Result<Value, String>) -> Self {
        match answer {
            Ok(value) => Message::CapabilityResult {
                id,
                ok: Some(value),
                error: None,
            },
            Err(error) => Message::CapabilityResult {
                id,
                ok: None,
                error: Some(error),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn call_line_carries_version_and_request() {
        let line = Envelope::new(Message::Call {
            id: 1,
            request: SourceRequest::GetEntry {
                slug: "super-metroid".into(),
            },
        })
        .to_line()
        .unwrap();

        assert!(line.ends_with('\n'));
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            json!({"v":1,"type":"call","id":1,"request":{"method":"getEntry","slug":"super-metroid"}})
        );
    }

    #[test]
    fn parses_child_messages_and_ignores_unknown_fields() {
        let capability = Envelope::parse(
            r#"{"v":1,"type":"capability","id":3,"op":"http","params":{"url":"https://x.example"},"trace":"abc"}"#,
        )
        .unwrap();
        assert_eq!(
            capability.message,
            Message::Capability {
                id: 3,
                op: "http".into(),
                params: json!({"url":"https://x.example"}),
            }
        );

        let failed = Envelope::parse(r#"{"v":1,"type":"result","id":1,"error":"boom"}"#).unwrap();
        assert_eq!(
            failed.message,
            Message::Result {
                id: 1,
                ok: None,
                error: Some("boom".into()),
            }
        );
    }

    #[test]
    fn rejects_other_versions() {
        let err = Envelope::parse(r#"{"v":2,"type":"result","id":1,"ok":[]}"#).unwrap_err();
        assert!(err.contains("version"));
        assert!(Envelope::parse(r#"{"type":"result","id":1}"#).is_err());
    }
}
