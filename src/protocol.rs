//! Wire protocol between agents and the hub: one JSON frame per WebSocket
//! message, discriminated by a `type` field. The sums are closed on purpose —
//! every frame type is matched exhaustively at the dispatch sites.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{valid_agent_name, AgentInfo, Task};

/// Frames sent by agents to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Register {
        agent_name: String,
        token: String,
    },
    Pong,
    TaskResult {
        task_id: Uuid,
        result: String,
        status: ResultStatus,
    },
    TaskCancelled {
        task_id: Uuid,
    },
    TaskProgress {
        task_id: Uuid,
        status: String,
        #[serde(default)]
        detail: Option<String>,
        #[serde(default)]
        elapsed_ms: u64,
    },
    StatusReport {
        running_tasks: u32,
        #[serde(default)]
        current_task_id: Option<Uuid>,
        #[serde(default)]
        idle_since: Option<DateTime<Utc>>,
    },
    ListAgents {
        request_id: String,
    },
    TaskStatus {
        request_id: String,
        task_id: Uuid,
    },
    /// Reserved for agent-to-agent messaging; accepted and ignored.
    SendMessage {
        target_agent: String,
        content: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Error,
}

/// Frames sent by the hub to agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubFrame {
    RegisterAck {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Ping,
    Task {
        task_id: Uuid,
        from: String,
        content: String,
        chat_id: i64,
        message_id: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_task_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        attachments: Option<Vec<WireAttachment>>,
    },
    CancelTask {
        task_id: Uuid,
    },
    ListAgentsResponse {
        request_id: String,
        agents: Vec<WireAgent>,
    },
    TaskStatusResponse {
        request_id: String,
        task: Option<Task>,
    },
}

/// Inline attachment as carried on the wire (base64 payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireAttachment {
    pub filename: String,
    pub mime_type: String,
    pub data_base64: String,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireAgent {
    pub name: String,
    pub status: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<u64>,
}

impl From<AgentInfo> for WireAgent {
    fn from(info: AgentInfo) -> Self {
        Self {
            name: info.name,
            status: "online".to_string(),
            connected_at: info.connected_at,
            last_seen: info.last_seen,
            owner_id: info.owner_id,
        }
    }
}

impl AgentFrame {
    /// Parse an inbound text frame. Malformed JSON and unknown `type`s are
    /// dropped silently, as are frames failing field validation.
    pub fn parse(text: &str) -> Option<AgentFrame> {
        let frame: AgentFrame = serde_json::from_str(text).ok()?;
        frame.validate().then_some(frame)
    }

    /// Length/shape checks for identity-bearing fields. UUID fields are
    /// already enforced by the typed deserializer.
    fn validate(&self) -> bool {
        match self {
            AgentFrame::Register { agent_name, token } => {
                valid_agent_name(agent_name) && !token.is_empty() && token.len() <= 128
            }
            AgentFrame::ListAgents { request_id } | AgentFrame::TaskStatus { request_id, .. } => {
                !request_id.is_empty() && request_id.len() <= 128
            }
            AgentFrame::SendMessage { target_agent, .. } => valid_agent_name(target_agent),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_frame_round_trip() {
        let raw = r#"{"type":"register","agent_name":"alice","token":"agt_abc123"}"#;
        let frame = AgentFrame::parse(raw).expect("valid register frame");
        match frame {
            AgentFrame::Register { agent_name, token } => {
                assert_eq!(agent_name, "alice");
                assert_eq!(token, "agt_abc123");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn unknown_and_malformed_frames_dropped() {
        assert!(AgentFrame::parse("not json").is_none());
        assert!(AgentFrame::parse(r#"{"type":"mystery","x":1}"#).is_none());
        assert!(AgentFrame::parse(r#"{"no_type":true}"#).is_none());
    }

    #[test]
    fn invalid_identity_fields_dropped() {
        assert!(AgentFrame::parse(r#"{"type":"register","agent_name":"","token":"t"}"#).is_none());
        assert!(
            AgentFrame::parse(r#"{"type":"register","agent_name":"a b","token":"t"}"#).is_none()
        );
        assert!(
            AgentFrame::parse(r#"{"type":"register","agent_name":"ok","token":""}"#).is_none()
        );
        assert!(AgentFrame::parse(r#"{"type":"list_agents","request_id":""}"#).is_none());
        // Bad UUID is rejected by the typed field.
        assert!(AgentFrame::parse(
            r#"{"type":"task_result","task_id":"nope","result":"x","status":"success"}"#
        )
        .is_none());
    }

    #[test]
    fn optional_progress_fields_default() {
        let task_id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"task_progress","task_id":"{}","status":"thinking"}}"#,
            task_id
        );
        match AgentFrame::parse(&raw) {
            Some(AgentFrame::TaskProgress {
                task_id: got,
                status,
                detail,
                elapsed_ms,
            }) => {
                assert_eq!(got, task_id);
                assert_eq!(status, "thinking");
                assert!(detail.is_none());
                assert_eq!(elapsed_ms, 0);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn pong_is_a_bare_type_tag() {
        assert!(matches!(
            AgentFrame::parse(r#"{"type":"pong"}"#),
            Some(AgentFrame::Pong)
        ));
    }

    #[test]
    fn hub_frames_serialize_with_type_tag() {
        let ack = HubFrame::RegisterAck {
            success: true,
            error: None,
        };
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains(r#""type":"register_ack""#));
        assert!(!json.contains("error"));

        let ping = serde_json::to_string(&HubFrame::Ping).unwrap();
        assert_eq!(ping, r#"{"type":"ping"}"#);
    }

    #[test]
    fn task_frame_omits_empty_optionals() {
        let frame = HubFrame::Task {
            task_id: Uuid::new_v4(),
            from: "bob".into(),
            content: "ping".into(),
            chat_id: 42,
            message_id: 7,
            conversation_id: None,
            parent_task_id: None,
            attachments: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"task""#));
        assert!(!json.contains("conversation_id"));
        assert!(!json.contains("attachments"));
    }
}
