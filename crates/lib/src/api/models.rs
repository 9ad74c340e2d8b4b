//! Canonical conversation/message model and normalization of backend JSON.
//!
//! Open-WebUI responses are heterogeneous: lists arrive bare or wrapped in
//! `{data: [...]}`, timestamps are seconds, milliseconds, or numeric strings,
//! and messages live either in a flat array or in a parent-chain history map.
//! Everything here normalizes into the one model the rest of the crate uses.
//! Parsing is best-effort per item: a malformed entry is skipped and logged,
//! never aborting the batch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";
pub const ROLE_TOOL: &str = "tool";

/// Millisecond timestamps are disambiguated from seconds by magnitude.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// A full conversation: ordered messages plus chat-level metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// List-view entry for a conversation (no messages).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
}

/// One structured tool call carried by an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    /// Result text, when a matching tool-role message (or inline result) exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// A single message. Content grows while `streaming` is true; a message
/// transitions streaming -> final exactly once and is immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status_history: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub follow_ups: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_executions: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    /// When role is "tool", the call id this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub streaming: bool,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(ROLE_USER, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(ROLE_ASSISTANT, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::with_role(ROLE_TOOL, content)
    }

    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: role.to_string(),
            content: content.into(),
            model: None,
            attachment_ids: Vec::new(),
            files: Vec::new(),
            status_history: Vec::new(),
            follow_ups: Vec::new(),
            code_executions: Vec::new(),
            sources: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            streaming: false,
        }
    }

    /// Clear the streaming flag. After this the reconciliation loop treats
    /// the message as immutable.
    pub fn finalize(&mut self) {
        self.streaming = false;
    }
}

/// A list endpoint returns either a bare array or a `{data: [...]}` wrapper.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ListEnvelope<T> {
    Bare(Vec<T>),
    Wrapped { data: Vec<T> },
}

impl<T> ListEnvelope<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            ListEnvelope::Bare(items) => items,
            ListEnvelope::Wrapped { data } => data,
        }
    }
}

/// Parse a timestamp that may be integer seconds, integer milliseconds, or a
/// numeric string. Returns unix seconds.
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    let n = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    if n > MILLIS_THRESHOLD {
        Some(n / 1000)
    } else {
        Some(n)
    }
}

/// Message content is a plain string or a list of typed blocks; text-typed
/// blocks are concatenated in encountered order.
pub fn flatten_content(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let mut out = String::new();
            for block in blocks {
                if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        out.push_str(text);
                    }
                }
            }
            out
        }
        _ => String::new(),
    }
}

fn str_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(k))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn timestamp_field(value: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| value.get(k)).and_then(parse_timestamp)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn value_list(value: Option<&Value>) -> Vec<Value> {
    value
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Parse one tool-call record: either `{id, name, arguments}` or the
/// OpenAI-style `{id, function: {name, arguments}}`.
fn parse_tool_call(value: &Value) -> Option<ToolCallRecord> {
    let id = str_field(value, &["id", "call_id", "callId"])?;
    let (name, arguments) = if let Some(function) = value.get("function") {
        (
            str_field(function, &["name"])?,
            function.get("arguments").cloned().unwrap_or(Value::Null),
        )
    } else {
        (
            str_field(value, &["name"])?,
            value.get("arguments").cloned().unwrap_or(Value::Null),
        )
    };
    let result = value
        .get("result")
        .filter(|v| !v.is_null())
        .map(|r| match r {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    Some(ToolCallRecord {
        id,
        name,
        arguments,
        result,
    })
}

/// Parse a single message object. Returns None only when the value is not an
/// object at all; missing ids get a locally generated UUID so the message can
/// still be correlated by position.
pub fn parse_message(value: &Value) -> Option<Message> {
    if !value.is_object() {
        return None;
    }
    let id = str_field(value, &["id"]).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let role = str_field(value, &["role"]).unwrap_or_else(|| ROLE_ASSISTANT.to_string());
    let content = value.get("content").map(flatten_content).unwrap_or_default();
    // Assistant messages carry "done": false while the backend is writing.
    let done = value.get("done").and_then(|d| d.as_bool());
    let streaming = role == ROLE_ASSISTANT && done == Some(false);
    let tool_calls = value
        .get("tool_calls")
        .or_else(|| value.get("toolCalls"))
        .and_then(|v| v.as_array())
        .map(|calls| calls.iter().filter_map(parse_tool_call).collect())
        .unwrap_or_default();
    Some(Message {
        id,
        role,
        content,
        model: str_field(value, &["model", "modelName"]),
        attachment_ids: string_list(value.get("attachments").or_else(|| value.get("attachmentIds"))),
        files: value_list(value.get("files")),
        status_history: value_list(value.get("statusHistory").or_else(|| value.get("status_history"))),
        follow_ups: string_list(value.get("followUps").or_else(|| value.get("follow_ups"))),
        code_executions: value_list(value.get("code_executions").or_else(|| value.get("codeExecutions"))),
        sources: value_list(value.get("sources").or_else(|| value.get("citations"))),
        tool_calls,
        tool_call_id: str_field(value, &["tool_call_id", "toolCallId"]),
        streaming,
    })
}

/// Reconstruct message order from a history map: start at `currentId`, walk
/// `parentId` links back to the root, then reverse to forward order.
/// Returns None when there is no history map or the chain is empty.
fn messages_from_history(body: &Value) -> Option<Vec<Message>> {
    let history = body.get("history")?;
    let map = history.get("messages")?.as_object()?;
    let current = history
        .get("currentId")
        .or_else(|| history.get("current_id"))
        .and_then(|v| v.as_str())?;

    let mut chain = Vec::new();
    let mut cursor = Some(current.to_string());
    while let Some(id) = cursor {
        let Some(raw) = map.get(&id) else { break };
        match parse_message(raw) {
            Some(msg) => chain.push(msg),
            None => log::warn!("skipping malformed message {} in history", id),
        }
        cursor = raw
            .get("parentId")
            .or_else(|| raw.get("parent_id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        if chain.len() > map.len() {
            log::warn!("history parent chain has a cycle, truncating");
            break;
        }
    }
    if chain.is_empty() {
        return None;
    }
    chain.reverse();
    Some(chain)
}

fn messages_from_flat_list(body: &Value) -> Vec<Message> {
    body.get("messages")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|raw| {
                    let msg = parse_message(raw);
                    if msg.is_none() {
                        log::warn!("skipping malformed message in flat list");
                    }
                    msg
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Escape a string for use inside a double-quoted attribute of a marker block.
fn encode_attr(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render one tool call as a collapsible marker block. `done="true"` only
/// when a result is present; the reconciliation loop keys off that attribute.
pub fn tool_call_marker(call: &ToolCallRecord) -> String {
    let arguments = match &call.arguments {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let done = call.result.is_some();
    let mut block = format!(
        "<details type=\"tool_calls\" done=\"{}\" id=\"{}\" name=\"{}\" arguments=\"{}\">",
        done,
        encode_attr(&call.id),
        encode_attr(&call.name),
        encode_attr(&arguments),
    );
    if let Some(result) = &call.result {
        block.push('\n');
        block.push_str(result);
    }
    block.push_str("\n</details>");
    block
}

/// True when the content carries a tool-call marker block flagged done.
pub fn has_done_marker(content: &str) -> bool {
    let mut rest = content;
    while let Some(start) = rest.find("type=\"tool_calls\"") {
        let tail = &rest[start..];
        let end = tail.find('>').unwrap_or(tail.len());
        if tail[..end].contains("done=\"true\"") {
            return true;
        }
        rest = &tail[end..];
    }
    false
}

/// Attach renderable marker blocks to assistant messages carrying tool calls.
///
/// Results come from either the inline record or a trailing tool-role message
/// referencing the call id; consumed tool-role messages are removed so the UI
/// sees one assistant message with collapsible blocks instead of raw records.
pub fn synthesize_tool_markers(messages: &mut Vec<Message>) {
    // Collect results from tool-role messages first.
    let mut results: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    for msg in messages.iter() {
        if msg.role == ROLE_TOOL {
            if let Some(call_id) = &msg.tool_call_id {
                results.insert(call_id.clone(), msg.content.clone());
            }
        }
    }

    for msg in messages.iter_mut() {
        if msg.role != ROLE_ASSISTANT || msg.tool_calls.is_empty() {
            continue;
        }
        let mut blocks = String::new();
        for call in &mut msg.tool_calls {
            if call.result.is_none() {
                call.result = results.get(&call.id).cloned();
            }
            if !blocks.is_empty() || !msg.content.is_empty() {
                blocks.push('\n');
            }
            blocks.push_str(&tool_call_marker(call));
        }
        msg.content.push_str(&blocks);
    }

    // Drop tool-role messages whose result was absorbed into a marker block.
    let absorbed: std::collections::HashSet<String> = messages
        .iter()
        .filter(|m| m.role == ROLE_ASSISTANT)
        .flat_map(|m| m.tool_calls.iter())
        .filter(|c| c.result.is_some())
        .map(|c| c.id.clone())
        .collect();
    messages.retain(|m| {
        m.role != ROLE_TOOL
            || m.tool_call_id
                .as_ref()
                .map(|id| !absorbed.contains(id))
                .unwrap_or(true)
    });
}

/// Parse a full conversation record (GET /api/v1/chats/{id} shape).
/// Message order prefers the history parent chain; falls back to the flat
/// `messages` array when no history map is present or the chain is empty.
pub fn parse_conversation(value: &Value) -> Option<Conversation> {
    let id = str_field(value, &["id"])?;
    let body = value.get("chat").unwrap_or(value);

    let mut messages =
        messages_from_history(body).unwrap_or_else(|| messages_from_flat_list(body));
    synthesize_tool_markers(&mut messages);

    Some(Conversation {
        id,
        title: str_field(value, &["title"])
            .or_else(|| str_field(body, &["title"]))
            .unwrap_or_default(),
        created_at: timestamp_field(value, &["created_at", "createdAt", "timestamp"]),
        updated_at: timestamp_field(value, &["updated_at", "updatedAt"]),
        messages,
        pinned: value.get("pinned").and_then(|v| v.as_bool()).unwrap_or(false),
        archived: value.get("archived").and_then(|v| v.as_bool()).unwrap_or(false),
        folder_id: str_field(value, &["folder_id", "folderId"]),
        share_id: str_field(value, &["share_id", "shareId"]),
        system_prompt: str_field(body, &["system"]),
    })
}

/// Parse one list entry. Returns None (logged by callers) for shapeless items.
pub fn parse_summary(value: &Value) -> Option<ConversationSummary> {
    let id = str_field(value, &["id"])?;
    Some(ConversationSummary {
        id,
        title: str_field(value, &["title"]).unwrap_or_default(),
        updated_at: timestamp_field(value, &["updated_at", "updatedAt", "timestamp"]),
        pinned: value.get("pinned").and_then(|v| v.as_bool()).unwrap_or(false),
        archived: value.get("archived").and_then(|v| v.as_bool()).unwrap_or(false),
        folder_id: str_field(value, &["folder_id", "folderId"]),
    })
}
