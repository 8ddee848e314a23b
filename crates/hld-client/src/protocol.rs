// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! JSON-RPC 2.0 envelopes and method names spoken by the daemon.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Request/response correlation id. The client only issues numeric ids but
/// accepts either form when decoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
	Number(u64),
	String(String),
}

impl RequestId {
	pub fn as_u64(&self) -> Option<u64> {
		match self {
			RequestId::Number(n) => Some(*n),
			RequestId::String(_) => None,
		}
	}
}

impl From<u64> for RequestId {
	fn from(id: u64) -> Self {
		RequestId::Number(id)
	}
}

/// JSON-RPC request from client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request<'a> {
	pub jsonrpc: &'static str,
	pub method: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub params: Option<Value>,
	pub id: RequestId,
}

impl<'a> Request<'a> {
	pub fn new(id: impl Into<RequestId>, method: &'a str, params: Option<Value>) -> Self {
		Self {
			jsonrpc: JSONRPC_VERSION,
			method,
			params,
			id: id.into(),
		}
	}
}

/// JSON-RPC response from daemon. `result` and `error` are both optional on
/// the wire; `error` wins when both are present. A present `"result": null`
/// decodes as `Some(Value::Null)`. The error object stays raw so the caller
/// can validate its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub jsonrpc: Option<Value>,
	#[serde(default)]
	pub id: Option<RequestId>,
	#[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<Value>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
	D: serde::Deserializer<'de>,
{
	Value::deserialize(deserializer).map(Some)
}

impl Response {
	/// Interpret a decoded frame as a response. Frames that are not JSON
	/// objects or carry a mistyped `id` yield `None`.
	pub fn from_frame(frame: &Value) -> Option<Self> {
		if !frame.is_object() {
			return None;
		}
		serde_json::from_value(frame.clone()).ok()
	}

	pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
		Self {
			jsonrpc: Some(Value::from(JSONRPC_VERSION)),
			id: Some(id.into()),
			result: Some(result),
			error: None,
		}
	}
}

/// Error details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
	pub code: i64,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

// Standard JSON-RPC error codes
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

// Method names
pub const METHOD_HEALTH: &str = "health";
pub const METHOD_LAUNCH_SESSION: &str = "launchSession";
pub const METHOD_CONTINUE_SESSION: &str = "continueSession";
pub const METHOD_LIST_SESSIONS: &str = "listSessions";
pub const METHOD_GET_SESSION: &str = "getSession";
pub const METHOD_GET_SESSION_LEAVES: &str = "getSessionLeaves";
pub const METHOD_ARCHIVE_SESSION: &str = "archiveSession";
pub const METHOD_INTERRUPT_SESSION: &str = "interruptSession";
pub const METHOD_GET_CONVERSATION: &str = "getConversation";
pub const METHOD_CREATE_APPROVAL: &str = "createApproval";
pub const METHOD_UPDATE_APPROVAL: &str = "updateApproval";
pub const METHOD_GET_APPROVAL: &str = "getApproval";
pub const METHOD_LIST_APPROVALS: &str = "listApprovals";
pub const METHOD_ADD_TOOL_RESULT: &str = "addToolResult";
pub const METHOD_GET_TOOL_RESULT: &str = "getToolResult";
pub const METHOD_SUBSCRIBE: &str = "Subscribe";
