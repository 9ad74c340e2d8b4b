//! Backend API: Open-WebUI client and the canonical conversation model.
//!
//! The client submits turns and fetches conversation snapshots; the model
//! module normalizes the backend's heterogeneous JSON shapes.

mod client;
pub mod models;

pub use client::{ApiError, OpenWebUiClient, SendTurn, TurnHandle};
pub use models::{
    flatten_content, has_done_marker, parse_conversation, parse_message, parse_summary,
    parse_timestamp, synthesize_tool_markers, Conversation, ConversationSummary, ListEnvelope,
    Message, ToolCallRecord, ROLE_ASSISTANT, ROLE_TOOL, ROLE_USER,
};
