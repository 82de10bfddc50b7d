//! Client/daemon wire protocol: newline-delimited JSON objects.
//!
//! Framing here is deliberately simpler than length-prefixing: messages are
//! UTF-8 JSON terminated by `\n`. Discriminated unions are modelled as
//! internally-tagged enums (`#[serde(tag = "type")]`) — unknown tags fail to
//! deserialize, satisfying the "implementations must reject unknown tags"
//! requirement.

use serde::{Deserialize, Serialize};

use crate::queue::{EnqueueRequest, QueueItem, QueueStats};

/// Operational metadata attached to a `status` response — not part of the
/// queue's own data model, just "is the daemon alive and how long has it
/// been running" for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonHealth {
    pub pid: u32,
    pub uptime_secs: u64,
}

/// Messages sent from a client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Enqueue {
        payload: EnqueueRequest,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Cancel {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Shutdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    PlaybackComplete { id: String, duration_ms: u64 },
    PlaybackFailed { id: String, error: String },
    PlaybackInterrupted { id: String },
}

/// Messages sent from the daemon to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    // Correlated responses
    Queued {
        id: String,
        position: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Cancelled {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Status {
        stats: QueueStats,
        health: DaemonHealth,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    ShutdownAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    // Pushed, uncorrelated
    PlayNow {
        id: String,
        item: QueueItem,
    },
    Abort {
        id: String,
        reason: String,
    },
}

/// Write one newline-terminated JSON message.
pub async fn write_line<W, T>(writer: &mut W, msg: &T) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    use tokio::io::AsyncWriteExt;
    let mut json = serde_json::to_vec(msg)?;
    json.push(b'\n');
    writer.write_all(&json).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_roundtrip() {
        let msg = ClientMessage::Enqueue {
            payload: EnqueueRequest {
                text: "hello".into(),
                priority: 50,
                voice_config: serde_json::json!({"voice": "x"}),
                session_id: None,
                agent_id: Some("agent-1".into()),
                timeout: None,
            },
            request_id: Some("req-1".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"enqueue\""));
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::Enqueue { payload, request_id } => {
                assert_eq!(payload.text, "hello");
                assert_eq!(request_id.as_deref(), Some("req-1"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let line = r#"{"type":"not_a_real_message"}"#;
        let parsed: Result<ClientMessage, _> = serde_json::from_str(line);
        assert!(parsed.is_err());
    }

    #[test]
    fn push_messages_have_no_request_id_field() {
        let msg = DaemonMessage::Abort {
            id: "x".into(),
            reason: "preempted".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("request_id"));
    }

    #[tokio::test]
    async fn write_line_is_newline_terminated() {
        let msg = DaemonMessage::ShutdownAck { request_id: None };
        let mut buf = Vec::new();
        write_line(&mut buf, &msg).await.unwrap();
        assert_eq!(*buf.last().unwrap(), b'\n');
    }
}
