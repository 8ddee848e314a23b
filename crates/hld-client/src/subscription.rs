// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The push-event feed.
//!
//! A subscription runs on its own connection. After sending `Subscribe` it
//! waits for a confirmation, then classifies every frame by the shape of its
//! `result`: a confirmation carries `subscription_id`, a heartbeat carries
//! `type: "heartbeat"` and a notification carries `event`. Only notifications
//! that pass validation reach the caller.

use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

use crate::codec::encode_frame;
use crate::connection::{Connection, ConnectionEvent, ConnectionEvents};
use crate::error::{ClientError, Result};
use crate::protocol::{Request, METHOD_SUBSCRIBE};
use crate::types::{Event, SubscribeRequest, SubscribeResponse};
use crate::validate::validate;

pub use hld_client_config::DEFAULT_HANDSHAKE_TIMEOUT;

const SUBSCRIBE_REQUEST_ID: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
	Connecting,
	HandshakePending,
	Active,
	Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionConfig {
	pub connect_timeout: Duration,
	pub handshake_timeout: Duration,
}

impl Default for SubscriptionConfig {
	fn default() -> Self {
		Self {
			connect_timeout: hld_client_config::DEFAULT_CONNECT_TIMEOUT,
			handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
		}
	}
}

impl From<&hld_client_config::ClientConfig> for SubscriptionConfig {
	fn from(config: &hld_client_config::ClientConfig) -> Self {
		Self {
			connect_timeout: config.connect_timeout,
			handshake_timeout: config.handshake_timeout,
		}
	}
}

/// What a subscription delivers to its consumer. `Closed` and `Error` are
/// terminal and delivered at most once.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionMessage {
	Event(Event),
	Closed,
	Error(String),
}

/// Classification of one subscription frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
	Error(Value),
	Confirmation(Value),
	Heartbeat,
	Event(Value),
	Unknown,
}

impl Envelope {
	/// Classify `frame`. Checks run in a fixed order (error, confirmation,
	/// heartbeat, event) because a `result` may satisfy more than one shape.
	/// Confirmations are only recognised while `confirmed` is false.
	pub fn classify(frame: &Value, confirmed: bool) -> Self {
		if let Some(error) = frame.get("error").filter(|e| !e.is_null()) {
			return Envelope::Error(error.clone());
		}

		let Some(result) = frame.get("result").and_then(Value::as_object) else {
			return Envelope::Unknown;
		};

		if !confirmed && result.contains_key("subscription_id") {
			return Envelope::Confirmation(Value::Object(result.clone()));
		}
		if result.get("type").and_then(Value::as_str) == Some("heartbeat") {
			return Envelope::Heartbeat;
		}
		match result.get("event") {
			Some(event) => Envelope::Event(event.clone()),
			None => Envelope::Unknown,
		}
	}
}

/// Handle to an active subscription.
///
/// Consume it with [`Subscription::recv`] or as a [`futures::Stream`]. Dropping
/// the handle closes its connection.
pub struct Subscription {
	subscription_id: String,
	connection: Connection,
	state: Arc<StdMutex<SubscriptionState>>,
	rejected: Arc<AtomicU64>,
	messages: mpsc::UnboundedReceiver<SubscriptionMessage>,
}

impl std::fmt::Debug for Subscription {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Subscription")
			.field("subscription_id", &self.subscription_id)
			.field("state", &self.state())
			.field("rejected_events", &self.rejected_events())
			.finish()
	}
}

impl Subscription {
	/// Open a dedicated connection to `path` and subscribe.
	#[instrument(skip_all, fields(socket = %path.display()))]
	pub async fn open(path: &Path, request: &SubscribeRequest, config: SubscriptionConfig) -> Result<Self> {
		debug!(state = ?SubscriptionState::Connecting, "opening subscription connection");
		let (connection, events) = Connection::open(path, config.connect_timeout).await?;
		Self::from_connection(connection, events, request, config.handshake_timeout).await
	}

	/// Subscribe over an already-connected stream.
	pub async fn from_stream<S>(stream: S, request: &SubscribeRequest, handshake_timeout: Duration) -> Result<Self>
	where
		S: AsyncRead + AsyncWrite + Send + 'static,
	{
		let (connection, events) = Connection::from_stream(stream);
		Self::from_connection(connection, events, request, handshake_timeout).await
	}

	/// Run the handshake on a fresh connection. On any failure the connection
	/// is closed before the error is returned.
	pub async fn from_connection(
		connection: Connection,
		mut events: ConnectionEvents,
		request: &SubscribeRequest,
		handshake_timeout: Duration,
	) -> Result<Self> {
		let state = Arc::new(StdMutex::new(SubscriptionState::HandshakePending));

		let params = serde_json::to_value(request)?;
		let frame = encode_frame(&Request::new(SUBSCRIBE_REQUEST_ID, METHOD_SUBSCRIBE, Some(params)))?;
		if let Err(e) = connection.write(&frame).await {
			connection.close().await;
			return Err(e);
		}

		let confirmation = match timeout(handshake_timeout, await_confirmation(&mut events)).await {
			Ok(Ok(confirmation)) => confirmation,
			Ok(Err(e)) => {
				connection.close().await;
				return Err(e);
			}
			Err(_) => {
				warn!(
					timeout_ms = handshake_timeout.as_millis() as u64,
					"subscription not confirmed in time"
				);
				connection.close().await;
				return Err(ClientError::SubscriptionHandshake {
					timeout: handshake_timeout,
				});
			}
		};

		set_state(&state, SubscriptionState::Active);
		info!(
			subscription_id = %confirmation.subscription_id,
			event_types = ?request.event_types,
			"subscription confirmed"
		);

		let (tx, rx) = mpsc::unbounded_channel();
		let rejected = Arc::new(AtomicU64::new(0));
		tokio::spawn(pump(events, tx, state.clone(), rejected.clone()));

		Ok(Self {
			subscription_id: confirmation.subscription_id,
			connection,
			state,
			rejected,
			messages: rx,
		})
	}

	pub fn subscription_id(&self) -> &str {
		&self.subscription_id
	}

	pub fn state(&self) -> SubscriptionState {
		*self
			.state
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// Notifications discarded because they failed validation.
	pub fn rejected_events(&self) -> u64 {
		self.rejected.load(Ordering::Relaxed)
	}

	/// Next message, or `None` after the terminal message has been delivered.
	pub async fn recv(&mut self) -> Option<SubscriptionMessage> {
		self.messages.recv().await
	}

	/// Stop the feed and close the connection. Idempotent; no RPC is sent.
	pub async fn unsubscribe(&self) {
		if set_state(&self.state, SubscriptionState::Closed) != SubscriptionState::Closed {
			debug!(subscription_id = %self.subscription_id, "unsubscribing");
		}
		self.connection.close().await;
	}
}

impl Stream for Subscription {
	type Item = SubscriptionMessage;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		self.get_mut().messages.poll_recv(cx)
	}
}

/// Set the state and return the previous one.
fn set_state(state: &StdMutex<SubscriptionState>, next: SubscriptionState) -> SubscriptionState {
	let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
	std::mem::replace(&mut *state, next)
}

async fn await_confirmation(events: &mut ConnectionEvents) -> Result<SubscribeResponse> {
	loop {
		match events.recv().await {
			Some(ConnectionEvent::Frame(frame)) => match Envelope::classify(&frame, false) {
				Envelope::Confirmation(result) => return Ok(validate::<SubscribeResponse>(&result)?),
				other => trace!(envelope = ?other, "discarding frame before confirmation"),
			},
			Some(ConnectionEvent::Closed) | None => {
				return Err(ClientError::connection(
					"connection closed during subscription handshake",
				))
			}
			Some(ConnectionEvent::Error(e)) => return Err(ClientError::Connection(e)),
		}
	}
}

async fn pump(
	mut events: ConnectionEvents,
	tx: mpsc::UnboundedSender<SubscriptionMessage>,
	state: Arc<StdMutex<SubscriptionState>>,
	rejected: Arc<AtomicU64>,
) {
	let terminal = loop {
		let frame = match events.recv().await {
			Some(ConnectionEvent::Frame(frame)) => frame,
			Some(ConnectionEvent::Closed) | None => break SubscriptionMessage::Closed,
			Some(ConnectionEvent::Error(e)) => break SubscriptionMessage::Error(e),
		};

		match Envelope::classify(&frame, true) {
			Envelope::Event(raw) => match validate::<Event>(&raw) {
				Ok(event) => {
					trace!(event_type = %event.event_type(), "event received");
					if tx.send(SubscriptionMessage::Event(event)).is_err() {
						return;
					}
				}
				Err(e) => {
					rejected.fetch_add(1, Ordering::Relaxed);
					warn!(error = %e, "rejecting invalid event");
				}
			},
			Envelope::Heartbeat => trace!("heartbeat"),
			Envelope::Error(error) => debug!(error = %error, "ignoring error frame on subscription"),
			Envelope::Confirmation(_) | Envelope::Unknown => trace!("ignoring unrecognised frame"),
		}
	};

	set_state(&state, SubscriptionState::Closed);
	debug!(?terminal, "subscription ended");
	let _ = tx.send(terminal);
}
