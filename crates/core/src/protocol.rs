// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket protocol frames for client-server communication.
//!
//! The protocol multiplexes two kinds of traffic over one socket:
//! - Requests from the client, each tagged with a `correlation_id`
//! - Responses from the server echoing that `correlation_id`, interleaved with
//!   unsolicited events that carry a `type` discriminator instead

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Discriminator for client requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// A state-changing command.
    Command,
    /// A read-only query.
    Query,
    /// Ask the server for its current wall clock.
    ServerTimestamp,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Command => "command",
            RequestKind::Query => "query",
            RequestKind::ServerTimestamp => "server_timestamp",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientFrame {
    /// Caller-generated token used to match the eventual response.
    pub correlation_id: String,
    pub kind: RequestKind,
    #[serde(default)]
    pub payload: Value,
}

impl ClientFrame {
    /// Creates a request frame.
    pub fn new(correlation_id: impl Into<String>, kind: RequestKind, payload: Value) -> Self {
        ClientFrame {
            correlation_id: correlation_id.into(),
            kind,
            payload,
        }
    }

    /// Serializes the frame to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes the frame from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Server reply to a single request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub correlation_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Creates a successful response.
    pub fn ok(correlation_id: impl Into<String>, data: Value) -> Self {
        Response {
            correlation_id: correlation_id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Creates a failed response.
    pub fn err(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Response {
            correlation_id: correlation_id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Converts the response into its data or the server's error message.
    pub fn into_result(self) -> Result<Value, String> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| "request rejected without a reason".to_string()))
        }
    }
}

/// Unsolicited event pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ServerEvent {
    pub fn new(event_type: impl Into<String>, data: Option<Value>) -> Self {
        ServerEvent {
            event_type: event_type.into(),
            data,
        }
    }
}

/// Frame sent from server to client.
///
/// A frame carrying a `correlation_id` is a [`Response`]; anything else with a
/// `type` field is a [`ServerEvent`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ServerFrame {
    Response(Response),
    Event(ServerEvent),
}

impl ServerFrame {
    /// Creates an event frame.
    pub fn event(event_type: impl Into<String>, data: Option<Value>) -> Self {
        ServerFrame::Event(ServerEvent::new(event_type, data))
    }

    /// The correlation id, when this frame answers a request.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ServerFrame::Response(r) => Some(&r.correlation_id),
            ServerFrame::Event(_) => None,
        }
    }

    /// Serializes the frame to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes the frame from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Body of a `command` request as the server sees it.
///
/// The caller's payload fields are flattened next to the command `id` (used
/// by the server to drop redeliveries) and the `scope_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandBody {
    pub id: String,
    #[serde(default)]
    pub scope_id: String,
    pub action: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl CommandBody {
    /// Build the wire payload for a queued command.
    ///
    /// Object payloads get `id` and `scope_id` added; any other payload is
    /// wrapped under `body`.
    pub fn encode(id: &Uuid, scope_id: &str, payload: &Value) -> Value {
        let mut fields = match payload {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("body".to_string(), other.clone());
                map
            }
        };
        fields.insert("id".to_string(), Value::String(id.to_string()));
        fields.insert("scope_id".to_string(), Value::String(scope_id.to_string()));
        Value::Object(fields)
    }

    /// Parse a command payload, requiring string `id` and `action` fields.
    pub fn decode(payload: &Value) -> Result<Self, String> {
        if !payload.is_object() {
            return Err("command payload must be an object".to_string());
        }
        serde_json::from_value(payload.clone()).map_err(|e| format!("invalid command: {e}"))
    }
}

impl From<Response> for ServerFrame {
    fn from(response: Response) -> Self {
        ServerFrame::Response(response)
    }
}

impl From<ServerEvent> for ServerFrame {
    fn from(event: ServerEvent) -> Self {
        ServerFrame::Event(event)
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
