//! Client wire protocol: frame envelopes, method names, and typed request
//! parameters.
//!
//! Every frame is one JSON object. The first frame on a connection must be
//! a `connect` request announcing the protocol version; everything after
//! is `req`/`res`/`event`. Adapters (chat bots) translate to these frames
//! at the edge.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ab_domain::event::PermissionDecision;

/// Version announced in the `connect` handshake. Incompatible clients are
/// rejected with a response and the connection is closed.
pub const PROTOCOL_VERSION: u32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frame envelopes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Client → gateway request.
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: serde_json::Value,
    },

    /// Gateway → client response, matched by `id`.
    Res {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Gateway → client event fanout.
    Event {
        event: String,
        payload: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl Frame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::Res {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Res {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(message.into()),
        }
    }

    pub fn event(name: impl Into<String>, payload: serde_json::Value, seq: Option<u64>) -> Self {
        Self::Event {
            event: name.into(),
            payload,
            seq,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Methods
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The recognized request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Connect,
    Agent,
    RunStop,
    PermissionRespond,
    MemorySearch,
    MemoryList,
    MemoryDelete,
    MemoryPin,
    SchedulesList,
    SchedulesCreate,
    SchedulesUpdate,
    SchedulesDelete,
    WorkersList,
    Status,
}

impl Method {
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "connect" => Self::Connect,
            "agent" => Self::Agent,
            "run.stop" => Self::RunStop,
            "permission.respond" => Self::PermissionRespond,
            "memory.search" => Self::MemorySearch,
            "memory.list" => Self::MemoryList,
            "memory.delete" => Self::MemoryDelete,
            "memory.pin" => Self::MemoryPin,
            "schedules.list" => Self::SchedulesList,
            "schedules.create" => Self::SchedulesCreate,
            "schedules.update" => Self::SchedulesUpdate,
            "schedules.delete" => Self::SchedulesDelete,
            "workers.list" => Self::WorkersList,
            "status" => Self::Status,
            _ => return None,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Typed request parameters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    pub protocol_version: u32,
    /// Stable client identity (e.g. "terminal", "dashboard").
    pub client: String,
    /// Bearer token when the gateway requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Last event seq the client observed; pending events since it are
    /// replayed after the handshake (bounded window).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentParams {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    /// Reuse a session; a fresh session is created per channel otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStopParams {
    /// Targets the latest active run of the session when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRespondParams {
    pub perm_id: Uuid,
    pub decision: PermissionDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySearchParams {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryListParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDeleteParams {
    pub item_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPinParams {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleCreateParams {
    pub name: String,
    /// `interval` / `daily` / `cron`.
    pub kind: String,
    /// Seconds for interval, `HH:MM` for daily, 5-field expression for cron.
    pub spec: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default = "d_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleUpdateParams {
    pub schedule_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDeleteParams {
    pub schedule_id: Uuid,
}

fn d_true() -> bool {
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_frame_shape() {
        let raw = r#"{"type":"req","id":"1","method":"agent","params":{"text":"hello"}}"#;
        let frame: Frame = serde_json::from_str(raw).unwrap();
        match frame {
            Frame::Req { id, method, params } => {
                assert_eq!(id, "1");
                assert_eq!(method, "agent");
                let params: AgentParams = serde_json::from_value(params).unwrap();
                assert_eq!(params.text, "hello");
            }
            _ => panic!("expected Req"),
        }
    }

    #[test]
    fn res_frame_omits_empty_fields() {
        let json = serde_json::to_value(Frame::ok("1", serde_json::json!({"x": 1}))).unwrap();
        assert_eq!(json["type"], "res");
        assert_eq!(json["ok"], true);
        assert!(json.get("error").is_none());

        let json = serde_json::to_value(Frame::err("2", "nope")).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "nope");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn event_frame_carries_seq() {
        let frame = Frame::event("token", serde_json::json!({"text": "hi"}), Some(42));
        let json = serde_json::to_value(frame).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"], "token");
        assert_eq!(json["seq"], 42);
    }

    #[test]
    fn all_documented_methods_parse() {
        for raw in [
            "connect",
            "agent",
            "run.stop",
            "permission.respond",
            "memory.search",
            "memory.list",
            "memory.delete",
            "memory.pin",
            "schedules.list",
            "schedules.create",
            "schedules.update",
            "schedules.delete",
            "workers.list",
            "status",
        ] {
            assert!(Method::parse(raw).is_some(), "{raw} must parse");
        }
        assert!(Method::parse("nonsense").is_none());
    }

    #[test]
    fn run_stop_params_default_to_latest() {
        let params: RunStopParams = serde_json::from_str("{}").unwrap();
        assert!(params.run_id.is_none());
    }

    #[test]
    fn connect_params_roundtrip() {
        let params = ConnectParams {
            protocol_version: PROTOCOL_VERSION,
            client: "terminal".into(),
            token: None,
            last_seq: Some(17),
        };
        let json = serde_json::to_string(&params).unwrap();
        let back: ConnectParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.protocol_version, 1);
        assert_eq!(back.last_seq, Some(17));
    }
}
