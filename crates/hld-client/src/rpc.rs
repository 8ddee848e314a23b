// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Request/response correlation over one [`Connection`].
//!
//! Every call gets a fresh numeric id and an entry in the pending table. A
//! single demultiplexing task owns the connection's events and resolves the
//! entry whose id matches each response. Removal from the table is the only
//! way to resolve a call, so a late response and a timeout can never both
//! complete it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::codec::encode_frame;
use crate::connection::{Connection, ConnectionEvent, ConnectionEvents, ConnectionState};
use crate::error::{ClientError, Result};
use crate::protocol::{Request, Response, RpcErrorObject, INTERNAL_ERROR};
use crate::validate::validate;

pub use hld_client_config::DEFAULT_CALL_TIMEOUT;

type PendingCalls = HashMap<u64, oneshot::Sender<Result<Value>>>;

// Never held across an await.
fn lock(pending: &Mutex<PendingCalls>) -> MutexGuard<'_, PendingCalls> {
	pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a call's pending entry however its future ends: resolved, timed
/// out, failed to write, or dropped by the caller mid-flight.
struct PendingEntry<'a> {
	pending: &'a Mutex<PendingCalls>,
	id: u64,
}

impl Drop for PendingEntry<'_> {
	fn drop(&mut self) {
		lock(self.pending).remove(&self.id);
	}
}

pub struct RpcChannel {
	connection: Arc<Connection>,
	pending: Arc<Mutex<PendingCalls>>,
	next_id: AtomicU64,
	call_timeout: Duration,
}

impl std::fmt::Debug for RpcChannel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RpcChannel")
			.field("connection", &self.connection)
			.field("next_id", &self.next_id.load(Ordering::Relaxed))
			.field("call_timeout", &self.call_timeout)
			.finish()
	}
}

impl RpcChannel {
	/// Connect to the daemon socket and start correlating calls.
	pub async fn open(path: &Path, connect_timeout: Duration, call_timeout: Duration) -> Result<Self> {
		let (connection, events) = Connection::open(path, connect_timeout).await?;
		Ok(Self::new(connection, events, call_timeout))
	}

	pub fn from_stream<S>(stream: S, call_timeout: Duration) -> Self
	where
		S: AsyncRead + AsyncWrite + Send + 'static,
	{
		let (connection, events) = Connection::from_stream(stream);
		Self::new(connection, events, call_timeout)
	}

	pub fn new(connection: Connection, events: ConnectionEvents, call_timeout: Duration) -> Self {
		let pending: Arc<Mutex<PendingCalls>> = Arc::new(Mutex::new(HashMap::new()));
		tokio::spawn(demultiplex(events, pending.clone()));

		Self {
			connection: Arc::new(connection),
			pending,
			next_id: AtomicU64::new(1),
			call_timeout,
		}
	}

	pub fn state(&self) -> ConnectionState {
		self.connection.state()
	}

	pub fn is_open(&self) -> bool {
		self.connection.is_open()
	}

	pub fn call_timeout(&self) -> Duration {
		self.call_timeout
	}

	/// Calls still waiting for a response.
	pub fn pending_count(&self) -> usize {
		lock(&self.pending).len()
	}

	/// Issue `method` with the channel's default timeout.
	pub async fn call_default(&self, method: &str, params: Option<Value>) -> Result<Value> {
		self.call(method, params, self.call_timeout).await
	}

	/// Issue one request and wait for the response with the same id.
	///
	/// Returns the response's `result`, which may be `null`. An error envelope
	/// fails with [`ClientError::Rpc`], as does a response carrying neither
	/// `result` nor `error`.
	pub async fn call(&self, method: &str, params: Option<Value>, limit: Duration) -> Result<Value> {
		let id = self.next_id.fetch_add(1, Ordering::SeqCst);
		let frame = encode_frame(&Request::new(id, method, params))?;

		let (tx, rx) = oneshot::channel();
		lock(&self.pending).insert(id, tx);
		let _entry = PendingEntry {
			pending: &self.pending,
			id,
		};

		self.connection.write(&frame).await?;
		trace!(id, method, "request sent");

		match timeout(limit, rx).await {
			Ok(Ok(outcome)) => outcome,
			Ok(Err(_)) => Err(ClientError::connection("connection closed before response")),
			Err(_) => {
				debug!(id, method, timeout_ms = limit.as_millis() as u64, "call timed out");
				Err(ClientError::Timeout {
					method: method.to_string(),
					timeout: limit,
				})
			}
		}
	}

	/// Close the underlying connection. Pending calls fail with
	/// [`ClientError::Connection`]; later calls fail with [`ClientError::Write`].
	pub async fn close(&self) {
		self.connection.close().await;
	}
}

async fn demultiplex(mut events: ConnectionEvents, pending: Arc<Mutex<PendingCalls>>) {
	let reason = loop {
		match events.recv().await {
			Some(ConnectionEvent::Frame(frame)) => route(&pending, &frame),
			Some(ConnectionEvent::Closed) | None => break "connection closed".to_string(),
			Some(ConnectionEvent::Error(e)) => break e,
		}
	};

	let mut pending = lock(&pending);
	if !pending.is_empty() {
		warn!(count = pending.len(), reason = %reason, "failing pending calls");
	}
	for (_, tx) in pending.drain() {
		let _ = tx.send(Err(ClientError::Connection(reason.clone())));
	}
}

fn route(pending: &Mutex<PendingCalls>, frame: &Value) {
	let Some((id, outcome)) = interpret_response(frame) else {
		trace!("ignoring non-response frame");
		return;
	};

	let Some(tx) = lock(pending).remove(&id) else {
		debug!(id, "ignoring unmatched response");
		return;
	};
	let _ = tx.send(outcome);
}

/// Extract `(id, outcome)` from a frame that looks like a response to one of
/// our numeric-id requests.
fn interpret_response(frame: &Value) -> Option<(u64, Result<Value>)> {
	let response = Response::from_frame(frame)?;
	let id = response.id?.as_u64()?;

	let outcome = match (response.error, response.result) {
		(Some(error), _) => match validate::<RpcErrorObject>(&error) {
			Ok(err) => Err(ClientError::Rpc {
				code: err.code,
				message: err.message,
				data: err.data,
			}),
			Err(invalid) => Err(ClientError::Validation(invalid)),
		},
		(None, Some(result)) => Ok(result),
		(None, None) => Err(ClientError::Rpc {
			code: INTERNAL_ERROR,
			message: "response missing result".to_string(),
			data: None,
		}),
	};
	Some((id, outcome))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protocol::METHOD_HEALTH;
	use proptest::prelude::*;
	use serde_json::json;
	use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

	struct MockDaemon {
		lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
		writer: WriteHalf<DuplexStream>,
	}

	impl MockDaemon {
		fn pair(call_timeout: Duration) -> (RpcChannel, MockDaemon) {
			let (client, server) = tokio::io::duplex(64 * 1024);
			let (reader, writer) = tokio::io::split(server);
			let channel = RpcChannel::from_stream(client, call_timeout);
			let daemon = MockDaemon {
				lines: BufReader::new(reader).lines(),
				writer,
			};
			(channel, daemon)
		}

		async fn next_request(&mut self) -> Value {
			let line = self.lines.next_line().await.unwrap().unwrap();
			serde_json::from_str(&line).unwrap()
		}

		async fn send(&mut self, frame: Value) {
			let bytes = encode_frame(&frame).unwrap();
			self.writer.write_all(&bytes).await.unwrap();
		}
	}

	#[tokio::test]
	async fn test_call_resolves_with_result() {
		let (channel, mut daemon) = MockDaemon::pair(DEFAULT_CALL_TIMEOUT);

		let server = tokio::spawn(async move {
			let request = daemon.next_request().await;
			assert_eq!(request["jsonrpc"], "2.0");
			assert_eq!(request["method"], "health");
			assert_eq!(request["id"], 1);
			assert!(request.get("params").is_none());
			let reply = Response::success(1, json!({"status": "ok", "version": "0.1.0"}));
			daemon.send(serde_json::to_value(reply).unwrap()).await;
			daemon
		});

		let result = channel.call_default(METHOD_HEALTH, None).await.unwrap();
		assert_eq!(result, json!({"status": "ok", "version": "0.1.0"}));
		assert_eq!(channel.pending_count(), 0);
		server.await.unwrap();
	}

	#[tokio::test]
	async fn test_ids_increase_from_one() {
		let (channel, mut daemon) = MockDaemon::pair(DEFAULT_CALL_TIMEOUT);

		let server = tokio::spawn(async move {
			for expected in 1..=3u64 {
				let request = daemon.next_request().await;
				assert_eq!(request["id"], expected);
				daemon.send(json!({"jsonrpc": "2.0", "id": expected, "result": expected})).await;
			}
		});

		for expected in 1..=3u64 {
			let result = channel.call_default("listSessions", None).await.unwrap();
			assert_eq!(result, json!(expected));
		}
		server.await.unwrap();
	}

	#[tokio::test]
	async fn test_error_envelope_becomes_rpc_error() {
		let (channel, mut daemon) = MockDaemon::pair(DEFAULT_CALL_TIMEOUT);

		tokio::spawn(async move {
			let request = daemon.next_request().await;
			let id = request["id"].as_u64().unwrap();
			daemon
				.send(json!({
					"jsonrpc": "2.0",
					"id": id,
					"error": {"code": -32601, "message": "method not found"}
				}))
				.await;
			daemon
		});

		let err = channel.call_default("nope", None).await.unwrap_err();
		match err {
			ClientError::Rpc { code, message, .. } => {
				assert_eq!(code, -32601);
				assert_eq!(message, "method not found");
			}
			other => panic!("expected rpc error, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn test_malformed_error_envelope_fails_validation() {
		let (channel, mut daemon) = MockDaemon::pair(DEFAULT_CALL_TIMEOUT);

		tokio::spawn(async move {
			let request = daemon.next_request().await;
			let id = request["id"].as_u64().unwrap();
			daemon.send(json!({"id": id, "error": {"message": "no code"}})).await;
			daemon
		});

		let err = channel.call_default("health", None).await.unwrap_err();
		assert!(matches!(err, ClientError::Validation(_)));
	}

	#[tokio::test]
	async fn test_response_without_result_or_error_fails_the_call() {
		let (channel, mut daemon) = MockDaemon::pair(Duration::from_secs(5));

		tokio::spawn(async move {
			let request = daemon.next_request().await;
			assert_eq!(request["id"], 1);
			daemon.send(json!({"jsonrpc": "2.0", "id": 1})).await;
			daemon
		});

		let err = channel.call_default(METHOD_HEALTH, None).await.unwrap_err();
		match err {
			ClientError::Rpc { code, message, data } => {
				assert_eq!(code, INTERNAL_ERROR);
				assert_eq!(message, "response missing result");
				assert_eq!(data, None);
			}
			other => panic!("expected rpc error, got {other:?}"),
		}
		assert_eq!(channel.pending_count(), 0);
	}

	#[tokio::test]
	async fn test_null_result_resolves_as_null() {
		let (channel, mut daemon) = MockDaemon::pair(DEFAULT_CALL_TIMEOUT);

		tokio::spawn(async move {
			let request = daemon.next_request().await;
			daemon.send(json!({"id": request["id"].clone(), "result": null})).await;
			daemon
		});

		let result = channel.call_default("archiveSession", None).await.unwrap();
		assert_eq!(result, Value::Null);
	}

	#[tokio::test]
	async fn test_aborted_call_releases_its_entry() {
		let (channel, mut daemon) = MockDaemon::pair(DEFAULT_CALL_TIMEOUT);
		let channel = Arc::new(channel);

		let caller = channel.clone();
		let call = tokio::spawn(async move {
			caller
				.call(METHOD_HEALTH, None, Duration::from_secs(60))
				.await
		});

		let request = daemon.next_request().await;
		assert_eq!(request["id"], 1);
		assert_eq!(channel.pending_count(), 1);

		tokio::time::sleep(Duration::from_millis(50)).await;
		call.abort();
		assert!(call.await.unwrap_err().is_cancelled());
		assert_eq!(channel.pending_count(), 0);

		daemon.send(json!({"id": 1, "result": "too late"})).await;
		let server = tokio::spawn(async move {
			let request = daemon.next_request().await;
			assert_eq!(request["id"], 2);
			daemon.send(json!({"id": 2, "result": "fresh"})).await;
			daemon
		});
		assert_eq!(channel.call_default(METHOD_HEALTH, None).await.unwrap(), json!("fresh"));
		server.await.unwrap();
	}

	#[tokio::test]
	async fn test_timeout_removes_entry_and_late_response_is_ignored() {
		let (channel, mut daemon) = MockDaemon::pair(DEFAULT_CALL_TIMEOUT);

		let err = channel
			.call("getSession", Some(json!({"id": "s1"})), Duration::from_millis(50))
			.await
			.unwrap_err();
		assert!(matches!(err, ClientError::Timeout { ref method, .. } if method == "getSession"));
		assert_eq!(channel.pending_count(), 0);

		let stale = daemon.next_request().await;
		assert_eq!(stale["id"], 1);
		daemon.send(json!({"id": 1, "result": {"stale": true}})).await;

		let server = tokio::spawn(async move {
			let request = daemon.next_request().await;
			assert_eq!(request["id"], 2);
			daemon.send(json!({"id": 2, "result": {"fresh": true}})).await;
			daemon
		});

		let result = channel.call_default("getSession", None).await.unwrap();
		assert_eq!(result, json!({"fresh": true}));
		server.await.unwrap();
	}

	#[tokio::test]
	async fn test_unmatched_and_non_response_frames_are_ignored() {
		let (channel, mut daemon) = MockDaemon::pair(DEFAULT_CALL_TIMEOUT);

		tokio::spawn(async move {
			let request = daemon.next_request().await;
			let id = request["id"].as_u64().unwrap();
			daemon.send(json!({"id": 999, "result": "other"})).await;
			daemon.send(json!({"method": "notify", "params": {}})).await;
			daemon.send(json!([1, 2, 3])).await;
			daemon.send(json!({"id": id, "result": "mine"})).await;
			daemon
		});

		let result = channel.call_default("health", None).await.unwrap();
		assert_eq!(result, json!("mine"));
	}

	#[tokio::test]
	async fn test_connection_close_fails_pending_calls() {
		let (channel, mut daemon) = MockDaemon::pair(DEFAULT_CALL_TIMEOUT);

		tokio::spawn(async move {
			let _ = daemon.next_request().await;
			let _ = daemon.next_request().await;
			drop(daemon);
		});

		let (first, second) = tokio::join!(
			channel.call_default("listSessions", None),
			channel.call_default("listApprovals", None),
		);
		assert!(matches!(first, Err(ClientError::Connection(_))));
		assert!(matches!(second, Err(ClientError::Connection(_))));
		assert_eq!(channel.pending_count(), 0);

		let later = channel.call_default("health", None).await.unwrap_err();
		assert!(matches!(later, ClientError::Write(_)));
	}

	#[tokio::test]
	async fn test_write_after_close_leaves_no_entry() {
		let (channel, _daemon) = MockDaemon::pair(DEFAULT_CALL_TIMEOUT);
		channel.close().await;
		channel.close().await;

		let err = channel.call_default("health", None).await.unwrap_err();
		assert!(matches!(err, ClientError::Write(_)));
		assert_eq!(channel.pending_count(), 0);
		assert!(!channel.is_open());
	}

	proptest! {
		#![proptest_config(ProptestConfig::with_cases(32))]

		#[test]
		fn test_shuffled_responses_reach_their_callers(
			order in (1usize..8).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle()),
		) {
			let runtime = tokio::runtime::Builder::new_current_thread()
				.enable_all()
				.build()
				.unwrap();

			runtime.block_on(async move {
				let n = order.len();
				let (channel, mut daemon) = MockDaemon::pair(Duration::from_secs(5));

				let server = tokio::spawn(async move {
					let mut requests = Vec::with_capacity(n);
					for _ in 0..n {
						requests.push(daemon.next_request().await);
					}
					for index in order {
						let request = &requests[index];
						let reply = json!({
							"jsonrpc": "2.0",
							"id": request["id"].clone(),
							"result": {"n": request["params"]["n"].clone()},
						});
						daemon.send(reply).await;
					}
					daemon
				});

				let calls = (0..n).map(|i| {
					let channel = &channel;
					async move {
						let result = channel
							.call_default("getSession", Some(json!({"n": i})))
							.await
							.unwrap();
						(i, result)
					}
				});
				for (i, result) in futures::future::join_all(calls).await {
					assert_eq!(result, json!({"n": i}));
				}
				assert_eq!(channel.pending_count(), 0);
				server.await.unwrap();
			});
		}
	}
}
