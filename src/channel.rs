// ABOUTME: Wire records exchanged between a worker and its host, plus the ndjson codec.
// ABOUTME: One JSON object per line; malformed lines are reported, never fatal.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Errors raised by the line codec.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel closed by peer")]
    Closed,

    #[error("Malformed record: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Request correlation id. The host may use numbers or strings; ids this
/// process allocates are always numeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        RequestId::Number(value)
    }
}

/// Task payload carried by `execute_task` and `assign_task` records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, alias = "desc")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

/// Every record kind that travels over the channel, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    ExecuteTask {
        #[serde(default)]
        request_id: Option<RequestId>,
        #[serde(default)]
        task: TaskSpec,
    },
    HandleMessage {
        #[serde(default)]
        request_id: Option<RequestId>,
        #[serde(default)]
        message: serde_json::Value,
    },
    Response {
        request_id: Option<RequestId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ToolCall {
        request_id: RequestId,
        #[serde(default)]
        mcp_name: Option<String>,
        tool_name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    ToolResponse {
        request_id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StatusUpdate {
        status: String,
    },
    Log {
        content: String,
    },
    ProgressUpdate {
        progress: u8,
        #[serde(default)]
        activity: String,
    },
    ActivityLog {
        message: String,
        timestamp: f64,
    },
    AssignTask {
        target_agent: String,
        task: TaskSpec,
    },
    TaskComplete {
        subtask_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    OrchestrationReport {
        orchestration_id: String,
        title: String,
        summary: String,
        completed: usize,
        failed: usize,
        undelegated: usize,
    },
}

impl Message {
    /// Wire name of this record's kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ExecuteTask { .. } => "execute_task",
            Message::HandleMessage { .. } => "handle_message",
            Message::Response { .. } => "response",
            Message::ToolCall { .. } => "tool_call",
            Message::ToolResponse { .. } => "tool_response",
            Message::StatusUpdate { .. } => "status_update",
            Message::Log { .. } => "log",
            Message::ProgressUpdate { .. } => "progress_update",
            Message::ActivityLog { .. } => "activity_log",
            Message::AssignTask { .. } => "assign_task",
            Message::TaskComplete { .. } => "task_complete",
            Message::OrchestrationReport { .. } => "orchestration_report",
        }
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Serialize a record as a single newline-terminated line.
pub fn encode(message: &Message) -> Result<Vec<u8>, ChannelError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse one line. Blank lines yield `Ok(None)`.
pub fn decode(line: &str) -> Result<Option<Message>, ChannelError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(trimmed)?))
}

/// Write one record and flush it.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let line = encode(message)?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next raw line. Returns `ChannelError::Closed` at end of stream.
///
/// Invalid UTF-8 is replaced rather than rejected so that a corrupt line
/// only costs that one record.
pub async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<String, ChannelError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    buf.clear();
    let n = reader.read_until(b'\n', buf).await?;
    if n == 0 {
        return Err(ChannelError::Closed);
    }
    Ok(String::from_utf8_lossy(buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[test]
    fn execute_task_decodes_from_host_json() {
        let line = r#"{"type":"execute_task","requestId":7,"task":{"id":"t1","type":"feature","description":"Build login","title":"Login"}}"#;
        let message = decode(line).unwrap().unwrap();
        match message {
            Message::ExecuteTask { request_id, task } => {
                assert_eq!(request_id, Some(RequestId::Number(7)));
                assert_eq!(task.id.as_deref(), Some("t1"));
                assert_eq!(task.task_type.as_deref(), Some("feature"));
                assert_eq!(task.description, "Build login");
                assert_eq!(task.title.as_deref(), Some("Login"));
            }
            other => panic!("Expected ExecuteTask, got {:?}", other),
        }
    }

    #[test]
    fn tool_call_serializes_with_camel_case_fields() {
        let message = Message::ToolCall {
            request_id: RequestId::Number(3),
            mcp_name: None,
            tool_name: "file_system_read".to_string(),
            args: json!({"filePath": "src/main.rs"}),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["requestId"], 3);
        assert_eq!(value["toolName"], "file_system_read");
        assert_eq!(value["mcpName"], serde_json::Value::Null);
        assert_eq!(value["args"]["filePath"], "src/main.rs");
    }

    #[test]
    fn response_omits_absent_result_or_error() {
        let ok = Message::Response {
            request_id: Some(RequestId::Text("abc".to_string())),
            result: Some(json!({"success": true})),
            error: None,
        };
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["requestId"], "abc");
        assert!(value.get("error").is_none());

        let failed = Message::Response {
            request_id: Some(RequestId::Number(1)),
            result: None,
            error: Some("boom".to_string()),
        };
        let value = serde_json::to_value(&failed).unwrap();
        assert!(value.get("result").is_none());
        assert_eq!(value["error"], "boom");
    }

    #[test]
    fn task_spec_accepts_desc_alias() {
        let task: TaskSpec = serde_json::from_str(r#"{"type":"qa","desc":"Test it"}"#).unwrap();
        assert_eq!(task.description, "Test it");
    }

    #[test]
    fn encode_appends_exactly_one_newline() {
        let bytes = encode(&Message::Log {
            content: "hello\nworld".to_string(),
        })
        .unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(bytes.last(), Some(&b'\n'));
    }

    #[test]
    fn decode_rejects_garbage_and_unknown_kinds() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"type":"teleport"}"#).is_err());
        assert!(decode("   ").unwrap().is_none());
    }

    #[tokio::test]
    async fn read_line_reports_closed_at_eof() {
        let data: &[u8] = b"{\"type\":\"log\",\"content\":\"x\"}\n";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();

        let first = read_line(&mut reader, &mut buf).await.unwrap();
        assert!(matches!(decode(&first).unwrap(), Some(Message::Log { .. })));

        let err = read_line(&mut reader, &mut buf).await.unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
    }
}
