// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Typed client for the daemon.
//!
//! Each method is exactly one RPC on the primary connection. Health reports,
//! sessions, approvals and leaves are validated before they are returned; any other
//! result is decoded with serde. Subscriptions open their own connection.

use std::sync::Arc;

use hld_client_config::{ClientConfig, ConfigOverrides, RetryPolicy};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::connection::ConnectionState;
use crate::error::{ClientError, Result};
use crate::protocol::*;
use crate::rpc::RpcChannel;
use crate::subscription::{Subscription, SubscriptionConfig};
use crate::types::*;
use crate::validate::{array_field, validate, validate_array};

/// Client for the HumanLayer daemon.
pub struct DaemonClient {
	config: ClientConfig,
	channel: RwLock<Option<Arc<RpcChannel>>>,
}

impl std::fmt::Debug for DaemonClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DaemonClient")
			.field("socket_path", &self.config.socket_path)
			.finish_non_exhaustive()
	}
}

impl DaemonClient {
	/// Create a disconnected client.
	pub fn new(config: ClientConfig) -> Self {
		Self {
			config,
			channel: RwLock::new(None),
		}
	}

	/// Create a client from the layered configuration (file, environment,
	/// `overrides`).
	pub fn from_overrides(overrides: &ConfigOverrides) -> Result<Self> {
		Ok(Self::new(hld_client_config::load_config(overrides)?))
	}

	/// Create a client over an existing channel.
	pub fn with_channel(config: ClientConfig, channel: RpcChannel) -> Self {
		Self {
			config,
			channel: RwLock::new(Some(Arc::new(channel))),
		}
	}

	pub fn config(&self) -> &ClientConfig {
		&self.config
	}

	/// Open the primary connection. A no-op while it is open.
	#[instrument(skip(self), fields(socket = %self.config.socket_path.display()))]
	pub async fn connect(&self) -> Result<()> {
		let mut slot = self.channel.write().await;
		if slot.as_ref().is_some_and(|channel| channel.is_open()) {
			return Ok(());
		}

		let channel = RpcChannel::open(
			&self.config.socket_path,
			self.config.connect_timeout,
			self.config.call_timeout,
		)
		.await?;
		*slot = Some(Arc::new(channel));
		Ok(())
	}

	/// Close the primary connection. In-flight calls fail with
	/// [`ClientError::Connection`]. Idempotent.
	pub async fn close(&self) {
		let channel = self.channel.write().await.take();
		if let Some(channel) = channel {
			channel.close().await;
			info!(socket = %self.config.socket_path.display(), "disconnected from daemon");
		}
	}

	/// Replace the primary connection with a fresh one. No pending call
	/// survives and request ids restart at 1.
	pub async fn reconnect(&self) -> Result<()> {
		self.close().await;
		self.connect().await
	}

	pub async fn is_connected(&self) -> bool {
		self.state().await == ConnectionState::Connected
	}

	pub async fn state(&self) -> ConnectionState {
		match self.channel.read().await.as_ref() {
			Some(channel) => channel.state(),
			None => ConnectionState::Disconnected,
		}
	}

	async fn channel(&self) -> Result<Arc<RpcChannel>> {
		self.channel
			.read()
			.await
			.clone()
			.ok_or(ClientError::NotConnected)
	}

	/// Issue an untyped call on the primary connection.
	pub async fn call_raw(&self, method: &str, params: Option<Value>) -> Result<Value> {
		self.channel().await?.call_default(method, params).await
	}

	/// Issue a call with serializable params and decode the result.
	pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
	where
		P: Serialize + ?Sized,
		R: DeserializeOwned,
	{
		let params = serde_json::to_value(params)?;
		let result = self.call_raw(method, Some(params)).await?;
		Ok(serde_json::from_value(result)?)
	}

	/// Check daemon health. A status other than `ok` fails with
	/// [`ClientError::Unhealthy`].
	pub async fn health(&self) -> Result<HealthResponse> {
		let result = self.call_raw(METHOD_HEALTH, None).await?;
		let health = validate::<HealthResponse>(&result)?;
		if !health.is_ok() {
			return Err(ClientError::Unhealthy {
				status: health.status,
			});
		}
		Ok(health)
	}

	// --- Sessions ---

	pub async fn launch_session(&self, request: &LaunchSessionRequest) -> Result<LaunchSessionResponse> {
		let response: LaunchSessionResponse = self.call(METHOD_LAUNCH_SESSION, request).await?;
		info!(session_id = %response.session_id, run_id = %response.run_id, "session launched");
		Ok(response)
	}

	pub async fn continue_session(&self, request: &ContinueSessionRequest) -> Result<LaunchSessionResponse> {
		self.call(METHOD_CONTINUE_SESSION, request).await
	}

	pub async fn list_sessions(&self) -> Result<Vec<Session>> {
		let result = self.call_raw(METHOD_LIST_SESSIONS, None).await?;
		let sessions = array_field("listSessions result", &result, "sessions")?;
		Ok(validate_array::<Session>(sessions)?)
	}

	pub async fn get_session(&self, id: &str) -> Result<Session> {
		let result = self.call_raw(METHOD_GET_SESSION, Some(json!({ "id": id }))).await?;
		Ok(validate::<Session>(unwrap_field(&result, "session"))?)
	}

	/// Leaf sessions of the conversation tree rooted at `parent_session_id`.
	pub async fn get_session_leaves(&self, parent_session_id: &str) -> Result<Vec<SessionLeaf>> {
		let params = json!({ "parent_session_id": parent_session_id });
		let result = self.call_raw(METHOD_GET_SESSION_LEAVES, Some(params)).await?;
		let leaves = array_field("getSessionLeaves result", &result, "leaves")?;
		Ok(validate_array::<SessionLeaf>(leaves)?)
	}

	pub async fn archive_session(&self, id: &str) -> Result<()> {
		self.call_raw(METHOD_ARCHIVE_SESSION, Some(json!({ "id": id })))
			.await
			.map(drop)
	}

	pub async fn interrupt_session(&self, id: &str) -> Result<()> {
		self.call_raw(METHOD_INTERRUPT_SESSION, Some(json!({ "id": id })))
			.await
			.map(drop)
	}

	pub async fn get_conversation(&self, session_id: &str) -> Result<Conversation> {
		self.call(METHOD_GET_CONVERSATION, &json!({ "session_id": session_id }))
			.await
	}

	// --- Approvals ---

	pub async fn create_approval(&self, request: &CreateApprovalRequest) -> Result<CreateApprovalResponse> {
		self.call(METHOD_CREATE_APPROVAL, request).await
	}

	/// Pending and resolved approvals, optionally limited to one session.
	pub async fn fetch_approvals(&self, session_id: Option<&str>) -> Result<Vec<Approval>> {
		let params = match session_id {
			Some(session_id) => json!({ "session_id": session_id }),
			None => json!({}),
		};
		let result = self.call_raw(METHOD_LIST_APPROVALS, Some(params)).await?;
		let approvals = array_field("listApprovals result", &result, "approvals")?;
		Ok(validate_array::<Approval>(approvals)?)
	}

	pub async fn get_approval(&self, id: &str) -> Result<Approval> {
		let result = self.call_raw(METHOD_GET_APPROVAL, Some(json!({ "id": id }))).await?;
		Ok(validate::<Approval>(unwrap_field(&result, "approval"))?)
	}

	pub async fn update_approval(&self, request: &UpdateApprovalRequest) -> Result<()> {
		let result: Value = self.call(METHOD_UPDATE_APPROVAL, request).await?;
		debug!(approval_id = %request.id, approved = request.approved, ?result, "approval updated");
		Ok(())
	}

	/// Record a human decision on an approval.
	pub async fn send_decision(&self, approval_id: &str, decision: Decision, comment: Option<&str>) -> Result<()> {
		let request = UpdateApprovalRequest {
			id: approval_id.to_string(),
			approved: decision.is_approved(),
			response_text: comment.map(str::to_string),
		};
		self.update_approval(&request).await
	}

	// --- Tool results ---

	pub async fn add_tool_result(&self, request: &AddToolResultRequest) -> Result<()> {
		let _: Value = self.call(METHOD_ADD_TOOL_RESULT, request).await?;
		Ok(())
	}

	pub async fn get_tool_result(&self, request: &GetToolResultRequest) -> Result<ToolResult> {
		self.call(METHOD_GET_TOOL_RESULT, request).await
	}

	// --- Events ---

	/// Open a dedicated connection and subscribe to the event feed.
	pub async fn subscribe(&self, request: &SubscribeRequest) -> Result<Subscription> {
		Subscription::open(
			&self.config.socket_path,
			request,
			SubscriptionConfig::from(&self.config),
		)
		.await
	}

	/// Connect and health-check using `config.retry`.
	pub async fn connect_with_retry(config: ClientConfig) -> Result<Self> {
		let policy = config.retry;
		connect_with_retry(config, policy).await
	}
}

/// Some daemon builds wrap single records, e.g. `{"approval": {...}}`.
fn unwrap_field<'a>(result: &'a Value, field: &str) -> &'a Value {
	match result.get(field) {
		Some(inner) if inner.is_object() && result.get("id").is_none() => inner,
		_ => result,
	}
}

/// Connect and health-check, retrying the whole cycle up to
/// `policy.max_retries` more times with a fixed delay between attempts.
#[instrument(skip_all, fields(socket = %config.socket_path.display(), max_retries = policy.max_retries))]
pub async fn connect_with_retry(config: ClientConfig, policy: RetryPolicy) -> Result<DaemonClient> {
	let attempts = policy.total_attempts();
	let mut last = ClientError::NotConnected;

	for attempt in 1..=attempts {
		let client = DaemonClient::new(config.clone());
		let outcome = match client.connect().await {
			Ok(()) => client.health().await.map(drop),
			Err(e) => Err(e),
		};

		match outcome {
			Ok(()) => {
				info!(attempt, "connected to daemon");
				return Ok(client);
			}
			Err(e) => {
				warn!(attempt, attempts, retryable = e.is_retryable(), error = %e, "daemon connection attempt failed");
				client.close().await;
				last = e;
			}
		}

		if attempt < attempts {
			tokio::time::sleep(policy.retry_delay).await;
		}
	}

	Err(ClientError::RetryExhausted {
		attempts,
		last: Box::new(last),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::codec::encode_frame;
	use std::time::Duration;
	use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

	/// Serve one connection, answering each request with `reply(method, params)`.
	fn scripted<F>(reply: F) -> DaemonClient
	where
		F: Fn(&str, &Value) -> Value + Send + 'static,
	{
		let (client, server) = tokio::io::duplex(64 * 1024);
		tokio::spawn(async move {
			let (reader, mut writer) = tokio::io::split(server);
			let mut lines = BufReader::new(reader).lines();
			while let Ok(Some(line)) = lines.next_line().await {
				let request: Value = serde_json::from_str(&line).unwrap();
				let method = request["method"].as_str().unwrap_or_default().to_string();
				let params = request.get("params").cloned().unwrap_or(Value::Null);
				let mut response = reply(&method, &params);
				response["id"] = request["id"].clone();
				writer.write_all(&encode_frame(&response).unwrap()).await.unwrap();
			}
		});

		let config = ClientConfig::with_socket("/nonexistent/daemon.sock");
		DaemonClient::with_channel(config, RpcChannel::from_stream(client, Duration::from_secs(5)))
	}

	fn session(id: &str) -> Value {
		json!({
			"id": id,
			"run_id": "r1",
			"query": "fix the tests",
			"status": "running",
			"created_at": "2025-06-01T12:00:00Z",
			"model": "sonnet"
		})
	}

	fn approval(id: &str) -> Value {
		json!({
			"id": id,
			"session_id": "s1",
			"run_id": "r1",
			"tool_name": "Bash",
			"tool_input": {"command": "ls"},
			"created_at": "2025-06-01T12:00:00Z"
		})
	}

	#[tokio::test]
	async fn test_calls_without_connection_fail() {
		let client = DaemonClient::new(ClientConfig::with_socket("/nonexistent/daemon.sock"));
		assert!(!client.is_connected().await);
		assert_eq!(client.state().await, ConnectionState::Disconnected);
		assert!(matches!(client.health().await, Err(ClientError::NotConnected)));
		client.close().await;
	}

	#[tokio::test]
	async fn test_health_ok_and_unhealthy() {
		let client = scripted(|_, _| json!({"result": {"status": "ok", "version": "1.2.3"}}));
		let health = client.health().await.unwrap();
		assert_eq!(health.version.as_deref(), Some("1.2.3"));

		let client = scripted(|_, _| json!({"result": {"status": "degraded"}}));
		let err = client.health().await.unwrap_err();
		assert!(matches!(err, ClientError::Unhealthy { ref status } if status == "degraded"));
	}

	#[tokio::test]
	async fn test_malformed_health_payload_fails_validation() {
		let client = scripted(|_, _| json!({"result": {"status": 1}}));
		let err = client.health().await.unwrap_err();
		match err {
			ClientError::Validation(e) => {
				assert_eq!(e.entity, "health");
				assert_eq!(e.field, "status");
			}
			other => panic!("expected validation error, got {other:?}"),
		}

		let client = scripted(|_, _| json!({"result": "ok"}));
		let err = client.health().await.unwrap_err();
		assert!(matches!(err, ClientError::Validation(ref e) if e.entity == "health"));
	}

	#[tokio::test]
	async fn test_list_sessions_validates_every_record() {
		let client = scripted(|method, _| {
			assert_eq!(method, "listSessions");
			json!({"result": {"sessions": [session("s1"), session("s2")]}})
		});
		let sessions = client.list_sessions().await.unwrap();
		assert_eq!(sessions.len(), 2);
		assert_eq!(sessions[1].id, "s2");
		assert_eq!(sessions[0].model.as_deref(), Some("sonnet"));

		let client = scripted(|_, _| {
			let mut broken = session("s2");
			broken.as_object_mut().unwrap().remove("run_id");
			json!({"result": {"sessions": [session("s1"), broken]}})
		});
		let err = client.list_sessions().await.unwrap_err();
		match err {
			ClientError::Validation(e) => {
				assert_eq!(e.entity, "session");
				assert_eq!(e.field, "[1].run_id");
			}
			other => panic!("expected validation error, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn test_list_sessions_requires_sessions_array() {
		let client = scripted(|_, _| json!({"result": {"sessions": "nope"}}));
		let err = client.list_sessions().await.unwrap_err();
		assert!(matches!(err, ClientError::Validation(ref e) if e.field == "sessions"));
	}

	#[tokio::test]
	async fn test_get_approval_accepts_bare_and_wrapped_records() {
		let client = scripted(|method, params| {
			assert_eq!(method, "getApproval");
			match params["id"].as_str() {
				Some("a1") => json!({"result": approval("a1")}),
				_ => json!({"result": {"approval": approval("a2")}}),
			}
		});
		assert_eq!(client.get_approval("a1").await.unwrap().id, "a1");
		assert_eq!(client.get_approval("a2").await.unwrap().id, "a2");
	}

	#[tokio::test]
	async fn test_fetch_approvals_passes_session_filter() {
		let client = scripted(|method, params| {
			assert_eq!(method, "listApprovals");
			assert_eq!(params, &json!({"session_id": "s1"}));
			json!({"result": {"approvals": [approval("a1")]}})
		});
		let approvals = client.fetch_approvals(Some("s1")).await.unwrap();
		assert_eq!(approvals.len(), 1);
		assert_eq!(approvals[0].tool_input.get("command"), Some(&json!("ls")));
	}

	#[tokio::test]
	async fn test_send_decision_maps_to_update_approval() {
		let client = scripted(|method, params| {
			assert_eq!(method, "updateApproval");
			assert_eq!(
				params,
				&json!({"id": "a1", "approved": false, "response_text": "too risky"})
			);
			json!({"result": {}})
		});
		client
			.send_decision("a1", Decision::Deny, Some("too risky"))
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn test_rpc_errors_surface_to_caller() {
		let client = scripted(|_, _| json!({"error": {"code": -32602, "message": "invalid params"}}));
		let err = client.archive_session("s1").await.unwrap_err();
		assert!(matches!(err, ClientError::Rpc { code: -32602, .. }));
	}

	#[tokio::test]
	async fn test_launch_session_sends_only_set_fields() {
		let client = scripted(|method, params| {
			assert_eq!(method, "launchSession");
			assert_eq!(params, &json!({"query": "hello", "model": "opus"}));
			json!({"result": {"session_id": "s9", "run_id": "r9"}})
		});
		let mut request = LaunchSessionRequest::new("hello");
		request.model = Some("opus".into());
		let response = client.launch_session(&request).await.unwrap();
		assert_eq!(response.session_id, "s9");
		assert_eq!(response.claude_session_id, None);
	}

	#[tokio::test]
	async fn test_close_fails_later_calls() {
		let client = scripted(|_, _| json!({"result": {"status": "ok"}}));
		assert!(client.is_connected().await);
		client.close().await;
		client.close().await;
		assert!(matches!(client.health().await, Err(ClientError::NotConnected)));
	}

	#[tokio::test]
	async fn test_connect_with_retry_exhausts_attempts() {
		let dir = tempfile::tempdir().unwrap();
		let config = ClientConfig::with_socket(dir.path().join("missing.sock"));
		let policy = RetryPolicy {
			max_retries: 2,
			retry_delay: Duration::from_millis(5),
		};

		let err = connect_with_retry(config, policy).await.unwrap_err();
		match err {
			ClientError::RetryExhausted { attempts, last } => {
				assert_eq!(attempts, 3);
				assert!(matches!(*last, ClientError::Connection(_)));
			}
			other => panic!("expected retry exhaustion, got {other:?}"),
		}
	}
}
