//! JSON wire types for the WebSocket protocol.
//!
//! Requests carry an optional `id` that replies echo; events omit it.

use serde::{Deserialize, Serialize};

use crate::agents::{Agent, RegistryEvent, RegistryEventKind};

/// Client request bodies, tagged by `type`.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RequestBody {
    ListAgents,
    GetAgent {
        agent: String,
    },
    #[serde(rename_all = "camelCase")]
    SubscribeAgents {
        #[serde(default)]
        include_session_filter: Option<String>,
        #[serde(default)]
        exclude_session_filter: Option<String>,
    },
    UnsubscribeAgents,
    SubscribeOutput {
        agent: String,
        #[serde(default)]
        stream: Option<bool>,
    },
    UnsubscribeOutput {
        agent: String,
    },
    SendPrompt {
        agent: String,
        prompt: String,
    },
    /// Legacy alias of `send-prompt`.
    SendMessage {
        agent: String,
        prompt: String,
    },
}

/// Parse a text frame into `(id, body)`. The id is recovered even when the
/// body fails to parse, so error replies can echo it.
pub fn parse_request(text: &str) -> (Option<String>, Result<RequestBody, String>) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return (None, Err(format!("malformed JSON: {e}"))),
    };
    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    match serde_json::from_value::<RequestBody>(value) {
        Ok(body) => (id, Ok(body)),
        Err(e) => (id, Err(format!("invalid request: {e}"))),
    }
}

/// Server reply / event shape. Optional fields are omitted from the wire.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents: Option<Vec<Agent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<Agent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_agents: Option<usize>,
}

impl Response {
    pub fn ack(id: Option<String>) -> Self {
        Self {
            kind: "ok".into(),
            id,
            ok: Some(true),
            ..Default::default()
        }
    }

    pub fn error(id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind: "error".into(),
            id,
            ok: Some(false),
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn agent_list(id: Option<String>, agents: Vec<Agent>, total: Option<usize>) -> Self {
        Self {
            kind: "agents".into(),
            id,
            agents: Some(agents),
            total_agents: total,
            ..Default::default()
        }
    }

    pub fn single_agent(id: Option<String>, agent: Agent) -> Self {
        Self {
            kind: "agent".into(),
            id,
            agent: Some(agent),
            ..Default::default()
        }
    }

    pub fn agents_count(total: usize) -> Self {
        Self {
            kind: "agents-count".into(),
            total_agents: Some(total),
            ..Default::default()
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            // Serialization of these plain structs cannot fail in practice.
            format!("{{\"type\":\"error\",\"error\":\"serialize: {e}\"}}")
        })
    }
}

/// Build the lifecycle event for a registry change. Removals carry only the
/// agent name; additions and updates carry the full agent.
pub fn agent_event(event: &RegistryEvent) -> Response {
    match event.kind {
        RegistryEventKind::Added => Response {
            kind: "agent-added".into(),
            agent: Some(event.agent.clone()),
            ..Default::default()
        },
        RegistryEventKind::Updated => Response {
            kind: "agent-updated".into(),
            agent: Some(event.agent.clone()),
            ..Default::default()
        },
        RegistryEventKind::Removed => Response {
            kind: "agent-removed".into(),
            name: Some(event.agent.name.clone()),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str) -> Agent {
        Agent {
            name: name.into(),
            runtime: "claude".into(),
            work_dir: "/tmp".into(),
            attached: false,
        }
    }

    #[test]
    fn parse_list_agents() {
        let (id, body) = parse_request(r#"{"id":"1","type":"list-agents"}"#);
        assert_eq!(id.as_deref(), Some("1"));
        assert!(matches!(body.unwrap(), RequestBody::ListAgents));
    }

    #[test]
    fn parse_get_agent() {
        let (_, body) = parse_request(r#"{"type":"get-agent","agent":"agent-a"}"#);
        match body.unwrap() {
            RequestBody::GetAgent { agent } => assert_eq!(agent, "agent-a"),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn parse_subscribe_agents_with_filters() {
        let (_, body) = parse_request(
            r#"{"type":"subscribe-agents","includeSessionFilter":"^agent-","excludeSessionFilter":"debug"}"#,
        );
        match body.unwrap() {
            RequestBody::SubscribeAgents {
                include_session_filter,
                exclude_session_filter,
            } => {
                assert_eq!(include_session_filter.as_deref(), Some("^agent-"));
                assert_eq!(exclude_session_filter.as_deref(), Some("debug"));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn parse_subscribe_agents_without_filters() {
        let (_, body) = parse_request(r#"{"type":"subscribe-agents"}"#);
        match body.unwrap() {
            RequestBody::SubscribeAgents {
                include_session_filter,
                exclude_session_filter,
            } => {
                assert!(include_session_filter.is_none());
                assert!(exclude_session_filter.is_none());
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn parse_subscribe_output_defaults_stream() {
        let (_, body) = parse_request(r#"{"type":"subscribe-output","agent":"a"}"#);
        match body.unwrap() {
            RequestBody::SubscribeOutput { agent, stream } => {
                assert_eq!(agent, "a");
                assert!(stream.is_none());
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn parse_send_message_alias() {
        let (_, body) = parse_request(r#"{"type":"send-message","agent":"a","prompt":"hi"}"#);
        assert!(matches!(body.unwrap(), RequestBody::SendMessage { .. }));
    }

    #[test]
    fn parse_unknown_type_keeps_id() {
        let (id, body) = parse_request(r#"{"id":"42","type":"no-such-request"}"#);
        assert_eq!(id.as_deref(), Some("42"));
        assert!(body.is_err());
    }

    #[test]
    fn parse_missing_field_is_error() {
        let (_, body) = parse_request(r#"{"type":"send-prompt","agent":"a"}"#);
        assert!(body.is_err());
    }

    #[test]
    fn parse_garbage_is_error() {
        let (id, body) = parse_request("{nope");
        assert!(id.is_none());
        assert!(body.is_err());
    }

    #[test]
    fn added_event_carries_agent() {
        let event = RegistryEvent {
            kind: RegistryEventKind::Added,
            agent: agent("foo"),
        };
        let json: serde_json::Value =
            serde_json::from_str(&agent_event(&event).to_json()).unwrap();
        assert_eq!(json["type"], "agent-added");
        assert_eq!(json["agent"]["name"], "foo");
        assert_eq!(json["agent"]["runtime"], "claude");
        assert_eq!(json["agent"]["workDir"], "/tmp");
    }

    #[test]
    fn removed_event_carries_name_only() {
        let event = RegistryEvent {
            kind: RegistryEventKind::Removed,
            agent: agent("bar"),
        };
        let json: serde_json::Value =
            serde_json::from_str(&agent_event(&event).to_json()).unwrap();
        assert_eq!(json["type"], "agent-removed");
        assert_eq!(json["name"], "bar");
        assert!(json.get("agent").is_none());
    }

    #[test]
    fn updated_event_carries_agent() {
        let event = RegistryEvent {
            kind: RegistryEventKind::Updated,
            agent: Agent {
                runtime: "gemini".into(),
                ..agent("baz")
            },
        };
        let json: serde_json::Value =
            serde_json::from_str(&agent_event(&event).to_json()).unwrap();
        assert_eq!(json["type"], "agent-updated");
        assert_eq!(json["agent"]["runtime"], "gemini");
    }

    #[test]
    fn ack_and_error_shapes() {
        let ack: serde_json::Value =
            serde_json::from_str(&Response::ack(Some("7".into())).to_json()).unwrap();
        assert_eq!(ack["id"], "7");
        assert_eq!(ack["ok"], true);

        let err: serde_json::Value =
            serde_json::from_str(&Response::error(None, "agent not found").to_json()).unwrap();
        assert_eq!(err["type"], "error");
        assert_eq!(err["ok"], false);
        assert_eq!(err["error"], "agent not found");
        assert!(err.get("id").is_none());
    }

    #[test]
    fn agents_count_shape() {
        let json: serde_json::Value =
            serde_json::from_str(&Response::agents_count(3).to_json()).unwrap();
        assert_eq!(json["type"], "agents-count");
        assert_eq!(json["totalAgents"], 3);
    }
}
