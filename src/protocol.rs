//! Wire envelope and reply shapes.
//!
//! Requests are JSON objects:
//!
//! ```json
//! {"cmd": "uptime", "execSync": true, "execTimeout": 2000, "timestamp": "2024-05-01T10:00:00Z"}
//! ```
//!
//! `content` may be used instead of `cmd` by chat-style clients; those get a
//! [`CommandResponse::Chat`] reply with the output fenced as a code block.
//! Everyone else gets [`CommandResponse::Plain`].

use std::fmt;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Requests older than this are rejected as replays.
pub const MAX_MESSAGE_AGE_MS: i64 = 60_000;

/// Terminal size carried by a resize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Resize {
    pub cols: u16,
    pub rows: u16,
}

/// Inbound envelope.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub cmd: Option<String>,
    pub content: Option<String>,
    pub exec_sync: Option<bool>,
    /// Milliseconds; a missing or non-positive value means "use the default".
    pub exec_timeout: Option<f64>,
    pub resize: Option<Resize>,
    pub timestamp: Option<String>,
}

/// Which reply shape a request expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// `cmd` request, answered with `{stdout, stderr}`.
    Plain,
    /// `content` request, answered with a chat message.
    Chat,
}

/// Why an envelope could not be decoded.
#[derive(Debug)]
pub enum ProtocolError {
    /// Not valid JSON.
    Json(serde_json::Error),
    /// Valid JSON, but not an object.
    NotAnObject,
    /// An object with fields of the wrong type.
    Shape(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Json(e) => write!(f, "invalid JSON: {e}"),
            ProtocolError::NotAnObject => write!(f, "payload is not a JSON object"),
            ProtocolError::Shape(e) => write!(f, "invalid request: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl CommandRequest {
    /// Decode a text payload.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(payload).map_err(ProtocolError::Json)?;
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        serde_json::from_value(value).map_err(ProtocolError::Shape)
    }

    pub fn kind(&self) -> RequestKind {
        if self.content.as_deref().is_some_and(|c| !c.is_empty()) {
            RequestKind::Chat
        } else {
            RequestKind::Plain
        }
    }

    /// The command to run: `cmd`, else `content`. Empty strings count as absent.
    pub fn command(&self) -> Option<&str> {
        self.cmd
            .as_deref()
            .filter(|c| !c.is_empty())
            .or_else(|| self.content.as_deref().filter(|c| !c.is_empty()))
    }

    pub fn is_sync(&self) -> bool {
        self.exec_sync.unwrap_or(false)
    }

    /// Request-level timeout override in milliseconds.
    #[allow(clippy::cast_sign_loss)]
    pub fn timeout_override(&self) -> Option<u64> {
        self.exec_timeout
            .filter(|t| t.is_finite() && *t >= 1.0)
            .map(|t| t as u64)
    }

    /// Effective timeout: the request's override, else `default_ms`.
    pub fn timeout_or(&self, default_ms: u64) -> u64 {
        self.timeout_override().unwrap_or(default_ms)
    }
}

/// Offset-less date-time layouts, read as local time.
const LOCAL_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse an ISO 8601 or RFC 2822 timestamp.
///
/// Date-times with an offset are exact. Date-times without one are local
/// time; a bare date is midnight UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s).or_else(|_| DateTime::parse_from_rfc2822(s)) {
        return Some(t.with_timezone(&Utc));
    }
    if let Some(naive) = LOCAL_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
    {
        return Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|t| t.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// True if a message stamped `ts` is too old at `now`. Exactly
/// [`MAX_MESSAGE_AGE_MS`] old is still fresh.
pub fn is_stale(ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    (now - ts).num_milliseconds() > MAX_MESSAGE_AGE_MS
}

/// Reply payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CommandResponse {
    Plain {
        #[serde(skip_serializing_if = "Option::is_none")]
        stdout: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
    },
    Chat {
        content: String,
        #[serde(rename = "contentType")]
        content_type: String,
        timestamp: String,
        #[serde(rename = "isPrivate")]
        is_private: bool,
    },
}

impl CommandResponse {
    pub fn stdout(stdout: String) -> Self {
        CommandResponse::Plain {
            stdout: Some(stdout),
            stderr: None,
        }
    }

    pub fn stderr(stderr: String) -> Self {
        CommandResponse::Plain {
            stdout: None,
            stderr: Some(stderr),
        }
    }

    /// Chat reply showing stdout, or stderr when stdout is empty.
    pub fn chat(stdout: &str, stderr: &str, now: DateTime<Utc>) -> Self {
        let body = if stdout.is_empty() { stderr } else { stdout };
        CommandResponse::Chat {
            content: format!("```\n{body}\n```"),
            content_type: "text".to_string(),
            timestamp: now.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            is_private: true,
        }
    }

    /// Reply for a completed asynchronous one-shot.
    pub fn for_kind(kind: RequestKind, stdout: String, stderr: String, now: DateTime<Utc>) -> Self {
        match kind {
            RequestKind::Chat => Self::chat(&stdout, &stderr, now),
            RequestKind::Plain => CommandResponse::Plain {
                stdout: Some(stdout),
                stderr: Some(stderr),
            },
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
