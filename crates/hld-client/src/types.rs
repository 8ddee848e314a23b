// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Typed request and result payloads for the daemon's RPC methods.
//!
//! Records owned by the daemon (sessions, approvals, events) are read
//! snapshots. They only ever enter the process through [`crate::validate`].

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

// --- Sessions ---

/// Well-known session status values. The daemon may add more; `status` stays a string.
pub mod session_status {
	pub const RUNNING: &str = "running";
	pub const COMPLETED: &str = "completed";
	pub const FAILED: &str = "failed";
	pub const INTERRUPTED: &str = "interrupted";
	pub const ARCHIVED: &str = "archived";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
	pub id: String,
	pub run_id: String,
	pub query: String,
	pub status: String,
	pub created_at: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub claude_session_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parent_session_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub summary: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub title: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub working_dir: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_turns: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_activity_at: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub completed_at: Option<String>,
	/// Fields this client does not model, or whose value had an unexpected
	/// type, kept verbatim.
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl Session {
	pub fn is_terminal(&self) -> bool {
		matches!(
			self.status.as_str(),
			session_status::COMPLETED | session_status::FAILED | session_status::ARCHIVED
		)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLeaf {
	pub id: String,
	pub status: String,
	pub created_at: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub title: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_activity_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServer {
	pub command: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub args: Vec<String>,
	#[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
	pub env: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpConfig {
	#[serde(rename = "mcpServers")]
	pub mcp_servers: std::collections::BTreeMap<String, McpServer>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LaunchSessionRequest {
	pub query: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub working_dir: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_turns: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub permission_prompt_tool: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system_prompt: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub append_system_prompt: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub resume_session_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub mcp_config: Option<McpConfig>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub forbidden_paths: Vec<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub allowed_tools: Vec<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub disallowed_tools: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub custom_instructions: Option<String>,
}

impl LaunchSessionRequest {
	pub fn new(query: impl Into<String>) -> Self {
		Self {
			query: query.into(),
			..Default::default()
		}
	}
}

/// Result of `launchSession` and `continueSession`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSessionResponse {
	pub session_id: String,
	pub run_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub claude_session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContinueSessionRequest {
	pub session_id: String,
	pub query: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_turns: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub working_dir: Option<String>,
}

// --- Conversations ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: String,
	pub content: String,
	pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
	pub id: String,
	pub title: String,
	pub timestamp: String,
	pub message_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
	pub session_id: String,
	#[serde(default)]
	pub messages: Vec<ConversationMessage>,
	#[serde(default)]
	pub snapshots: Vec<Snapshot>,
}

// --- Approvals ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
	pub id: String,
	pub session_id: String,
	pub run_id: String,
	pub tool_name: String,
	pub tool_input: Map<String, Value>,
	pub created_at: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub function_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub status: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resolved_at: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub approved: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub response_text: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_email: Option<String>,
	/// Fields this client does not model, or whose value had an unexpected
	/// type, kept verbatim.
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl Approval {
	pub fn is_resolved(&self) -> bool {
		self.approved.is_some() || self.resolved_at.is_some()
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CreateApprovalRequest {
	pub run_id: String,
	pub tool_name: String,
	pub tool_input: Map<String, Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub function_name: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateApprovalResponse {
	#[serde(alias = "approval_id")]
	pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateApprovalRequest {
	pub id: String,
	pub approved: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_text: Option<String>,
}

/// A human decision on a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
	Approve,
	Deny,
}

impl Decision {
	pub fn is_approved(self) -> bool {
		matches!(self, Decision::Approve)
	}
}

impl std::str::FromStr for Decision {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"approve" | "approved" => Ok(Decision::Approve),
			"deny" | "denied" => Ok(Decision::Deny),
			other => Err(format!("unknown decision '{other}', expected approve or deny")),
		}
	}
}

// --- Tool results ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
	pub tool_use_id: String,
	pub content: String,
	#[serde(default)]
	pub is_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AddToolResultRequest {
	pub session_id: String,
	pub run_id: String,
	pub tool_use_id: String,
	pub content: String,
	#[serde(skip_serializing_if = "std::ops::Not::not")]
	pub is_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GetToolResultRequest {
	pub session_id: String,
	pub run_id: String,
	pub tool_use_id: String,
}

// --- Health ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
	pub status: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
}

impl HealthResponse {
	pub const OK: &'static str = "ok";

	pub fn is_ok(&self) -> bool {
		self.status == Self::OK
	}
}

// --- Subscriptions ---

/// Event types the daemon publishes on the subscription feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
	NewApproval,
	ApprovalResolved,
	SessionStatusChanged,
}

impl EventType {
	pub const ALL: [EventType; 3] = [
		EventType::NewApproval,
		EventType::ApprovalResolved,
		EventType::SessionStatusChanged,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			EventType::NewApproval => "new_approval",
			EventType::ApprovalResolved => "approval_resolved",
			EventType::SessionStatusChanged => "session_status_changed",
		}
	}

	pub fn parse(raw: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|t| t.as_str() == raw)
	}
}

impl std::fmt::Display for EventType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubscribeRequest {
	pub event_types: Vec<EventType>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub run_id: Option<String>,
}

impl SubscribeRequest {
	pub fn for_types(event_types: impl IntoIterator<Item = EventType>) -> Self {
		Self {
			event_types: event_types.into_iter().collect(),
			..Default::default()
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeResponse {
	pub subscription_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewApprovalData {
	pub session_id: String,
	pub run_id: String,
	pub approval_id: String,
	pub tool_name: String,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResolvedData {
	pub session_id: String,
	pub run_id: String,
	pub approval_id: String,
	pub approved: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub response_text: Option<String>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatusChangedData {
	pub session_id: String,
	pub old_status: String,
	pub new_status: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parent_session_id: Option<String>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

/// Event payload. The variant determines the event's `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventData {
	NewApproval(NewApprovalData),
	ApprovalResolved(ApprovalResolvedData),
	SessionStatusChanged(SessionStatusChangedData),
}

impl EventData {
	pub fn event_type(&self) -> EventType {
		match self {
			EventData::NewApproval(_) => EventType::NewApproval,
			EventData::ApprovalResolved(_) => EventType::ApprovalResolved,
			EventData::SessionStatusChanged(_) => EventType::SessionStatusChanged,
		}
	}

	pub fn session_id(&self) -> &str {
		match self {
			EventData::NewApproval(d) => &d.session_id,
			EventData::ApprovalResolved(d) => &d.session_id,
			EventData::SessionStatusChanged(d) => &d.session_id,
		}
	}
}

/// A validated event from the subscription feed.
///
/// Serializes to `{"type", "timestamp", "data"}`; the type is always derived
/// from the data variant so the two cannot disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
	pub timestamp: String,
	pub data: EventData,
}

impl Event {
	pub fn new(timestamp: impl Into<String>, data: EventData) -> Self {
		Self {
			timestamp: timestamp.into(),
			data,
		}
	}

	pub fn event_type(&self) -> EventType {
		self.data.event_type()
	}

	/// The timestamp parsed as RFC 3339, if it is one.
	pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
		DateTime::parse_from_rfc3339(&self.timestamp)
			.ok()
			.map(|t| t.with_timezone(&Utc))
	}
}

impl Serialize for Event {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let mut state = serializer.serialize_struct("Event", 3)?;
		state.serialize_field("type", &self.event_type())?;
		state.serialize_field("timestamp", &self.timestamp)?;
		state.serialize_field("data", &self.data)?;
		state.end()
	}
}
