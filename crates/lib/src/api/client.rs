//! Open-WebUI HTTP API client.
//!
//! Submitting a turn returns only a background-task handle; content is later
//! read back by polling the conversation snapshot (see `stream::reconcile`).

use serde_json::{json, Value};

use crate::api::models::{
    parse_conversation, parse_summary, Conversation, ConversationSummary, ListEnvelope, Message,
};

/// Safety stop for conversation-list pagination.
const MAX_LIST_PAGES: usize = 60;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend error: {status} {message}")]
    Status { status: u16, message: String },
    /// 307/308 almost always means a misconfigured server URL (http vs https,
    /// missing path prefix); surface the target so it can be diagnosed.
    #[error("backend redirected ({status}) to {location}; check the server URL")]
    Redirect { status: u16, location: String },
    #[error("unexpected backend response: {0}")]
    Parse(String),
}

/// Parameters for submitting one chat turn.
#[derive(Debug, Clone, Default)]
pub struct SendTurn {
    pub model: String,
    pub messages: Vec<Message>,
    /// Existing conversation to append to, if any.
    pub conversation_id: Option<String>,
    /// Response message id; generated when absent so the reply can be
    /// correlated during reconciliation.
    pub message_id: Option<String>,
    pub session_id: Option<String>,
    pub tool_ids: Vec<String>,
    pub web_search: bool,
    pub image_generation: bool,
    pub files: Vec<Value>,
}

/// Handle returned by `send_turn`: the backend generates asynchronously.
#[derive(Debug, Clone)]
pub struct TurnHandle {
    pub task_id: Option<String>,
    pub message_id: String,
    pub session_id: String,
}

/// Client for an Open-WebUI-compatible backend.
#[derive(Clone)]
pub struct OpenWebUiClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenWebUiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        // Redirects are not followed so 307/308 can be classified instead of
        // silently re-posting credentials to another host.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.get(format!("{}{}", self.base_url, path)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.post(format!("{}{}", self.base_url, path)))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Check status, classifying redirects and mapping failures to `ApiError`.
    async fn check(res: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = res.status();
        if status == reqwest::StatusCode::TEMPORARY_REDIRECT
            || status == reqwest::StatusCode::PERMANENT_REDIRECT
        {
            let location = res
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("<missing Location header>")
                .to_string();
            return Err(ApiError::Redirect {
                status: status.as_u16(),
                location,
            });
        }
        if !status.is_success() {
            let message = res.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(res)
    }

    /// POST /api/chat/completions — submit a turn. Always requests streaming
    /// delivery and attaches a deterministic response-message id so the reply
    /// can be located while polling. No content is returned synchronously.
    pub async fn send_turn(&self, turn: SendTurn) -> Result<TurnHandle, ApiError> {
        let message_id = turn
            .message_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let session_id = turn
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let wire_messages: Vec<Value> = turn
            .messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect();

        let mut body = json!({
            "stream": true,
            "model": turn.model,
            "messages": wire_messages,
            "id": message_id,
            "session_id": session_id,
        });
        if let Some(chat_id) = &turn.conversation_id {
            body["chat_id"] = json!(chat_id);
        }
        if !turn.tool_ids.is_empty() {
            body["tool_ids"] = json!(turn.tool_ids);
        }
        if turn.web_search {
            body["web_search"] = json!(true);
        }
        if turn.image_generation {
            body["image_generation"] = json!(true);
        }
        if !turn.files.is_empty() {
            body["files"] = json!(turn.files);
        }

        let res = self.post("/api/chat/completions").json(&body).send().await?;
        let res = Self::check(res).await?;
        let data: Value = res.json().await.unwrap_or(Value::Null);
        let task_id = data
            .get("task_id")
            .or_else(|| data.get("taskId"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        log::debug!(
            "send_turn accepted: message_id={} task_id={:?}",
            message_id,
            task_id
        );
        Ok(TurnHandle {
            task_id,
            message_id,
            session_id,
        })
    }

    /// GET /api/v1/chats/{id} — fetch a full conversation snapshot.
    pub async fn fetch_conversation(&self, id: &str) -> Result<Conversation, ApiError> {
        let res = self.get(&format!("/api/v1/chats/{}", id)).send().await?;
        let res = Self::check(res).await?;
        let data: Value = res.json().await?;
        parse_conversation(&data)
            .ok_or_else(|| ApiError::Parse(format!("conversation {} has no id field", id)))
    }

    /// Fetch one endpoint that returns a list of conversation summaries
    /// (bare array or `{data: [...]}`); malformed items are skipped.
    async fn fetch_summary_list(&self, path: &str) -> Result<Vec<ConversationSummary>, ApiError> {
        let res = self.get(path).send().await?;
        let res = Self::check(res).await?;
        let envelope: ListEnvelope<Value> = res.json().await?;
        let mut out = Vec::new();
        for item in envelope.into_vec() {
            match parse_summary(&item) {
                Some(summary) => out.push(summary),
                None => log::warn!("skipping malformed conversation entry from {}", path),
            }
        }
        Ok(out)
    }

    /// Fetch the conversation list: paginate `/api/v1/chats/` (1-based `page`;
    /// page 0 is invalid) until an empty page, bounded by a max page count,
    /// then merge the pinned and archived collections with de-duplication by
    /// id. Pinned/archived entries take precedence over the same id from the
    /// page set. `limit` truncates the merged result when set.
    pub async fn fetch_conversation_list(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationSummary>, ApiError> {
        let mut paged = Vec::new();
        for page in 1..=MAX_LIST_PAGES {
            let batch = self
                .fetch_summary_list(&format!("/api/v1/chats/?page={}", page))
                .await?;
            if batch.is_empty() {
                break;
            }
            paged.extend(batch);
        }

        let pinned = self.fetch_summary_list("/api/v1/chats/pinned").await?;
        let archived = self.fetch_summary_list("/api/v1/chats/all/archived").await?;

        let mut seen = std::collections::HashSet::new();
        let mut merged = Vec::new();
        for summary in pinned.into_iter().chain(archived).chain(paged) {
            if seen.insert(summary.id.clone()) {
                merged.push(summary);
            }
        }
        if let Some(limit) = limit {
            merged.truncate(limit);
        }
        Ok(merged)
    }

    /// POST /api/tasks/stop/{id} — cancel a background generation task.
    pub async fn stop_task(&self, task_id: &str) -> Result<(), ApiError> {
        let res = self
            .post(&format!("/api/tasks/stop/{}", task_id))
            .send()
            .await?;
        Self::check(res).await?;
        Ok(())
    }

    /// GET /api/tasks/chat/{id} — task ids for a chat, for stop-parity when a
    /// generation spawned more than one task. Accepts a bare list of ids or a
    /// `{task_ids: [...]}` object.
    pub async fn list_chat_tasks(&self, chat_id: &str) -> Result<Vec<String>, ApiError> {
        let res = self
            .get(&format!("/api/tasks/chat/{}", chat_id))
            .send()
            .await?;
        let res = Self::check(res).await?;
        let data: Value = res.json().await?;
        let ids = data
            .get("task_ids")
            .or_else(|| data.get("taskIds"))
            .or(Some(&data))
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }
}
