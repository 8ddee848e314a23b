// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! A single duplex byte-stream endpoint to the daemon.
//!
//! A [`Connection`] owns the write half of the stream and a background reader
//! task that decodes the read half with its own [`FrameCodec`]. Everything the
//! reader observes is reported on [`ConnectionEvents`]: decoded frames, then
//! exactly one terminal `Closed` or `Error`. Once closed a connection is never
//! reopened; callers create a new one.

use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::codec::FrameCodec;
use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
	Closed,
}

/// Observable connection events.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
	/// One decoded frame.
	Frame(Value),
	/// The stream ended or was closed locally. Terminal.
	Closed,
	/// The stream failed. Terminal.
	Error(String),
}

impl ConnectionEvent {
	pub fn is_terminal(&self) -> bool {
		!matches!(self, ConnectionEvent::Frame(_))
	}
}

/// Receiving side of a connection's events.
#[derive(Debug)]
pub struct ConnectionEvents {
	rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl ConnectionEvents {
	/// Next event, or `None` once the terminal event has been consumed.
	pub async fn recv(&mut self) -> Option<ConnectionEvent> {
		self.rx.recv().await
	}
}

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

pub struct Connection {
	label: String,
	state: Arc<StdMutex<ConnectionState>>,
	writer: Mutex<Option<BoxedWriter>>,
	shutdown: CancellationToken,
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection")
			.field("label", &self.label)
			.field("state", &self.state())
			.finish()
	}
}

impl Connection {
	/// Make a single connection attempt to the daemon socket at `path`.
	///
	/// Refusal, a missing socket, or exceeding `connect_timeout` fail with
	/// [`ClientError::Connection`]. There is no retry here.
	#[instrument(skip_all, fields(socket = %path.display()))]
	pub async fn open(path: &Path, connect_timeout: Duration) -> Result<(Self, ConnectionEvents)> {
		debug!(state = ?ConnectionState::Connecting, "connecting to daemon");
		let stream = timeout(connect_timeout, UnixStream::connect(path))
			.await
			.map_err(|_| {
				ClientError::Connection(format!(
					"timed out after {}ms connecting to {}",
					connect_timeout.as_millis(),
					path.display()
				))
			})?
			.map_err(|e| ClientError::Connection(format!("{}: {e}", path.display())))?;

		info!("connected to daemon");
		Ok(Self::with_label(stream, path.display().to_string()))
	}

	/// Wrap an already-connected stream.
	pub fn from_stream<S>(stream: S) -> (Self, ConnectionEvents)
	where
		S: AsyncRead + AsyncWrite + Send + 'static,
	{
		Self::with_label(stream, "stream".to_string())
	}

	fn with_label<S>(stream: S, label: String) -> (Self, ConnectionEvents)
	where
		S: AsyncRead + AsyncWrite + Send + 'static,
	{
		let (reader, writer) = tokio::io::split(stream);
		let (tx, rx) = mpsc::unbounded_channel();
		let state = Arc::new(StdMutex::new(ConnectionState::Connected));
		let shutdown = CancellationToken::new();

		tokio::spawn(read_loop(
			reader,
			tx,
			state.clone(),
			shutdown.clone(),
			label.clone(),
		));

		let connection = Self {
			label,
			state,
			writer: Mutex::new(Some(Box::pin(writer))),
			shutdown,
		};
		(connection, ConnectionEvents { rx })
	}

	pub fn state(&self) -> ConnectionState {
		*self
			.state
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	pub fn is_open(&self) -> bool {
		self.state() == ConnectionState::Connected
	}

	/// Write one encoded frame.
	///
	/// Fails with [`ClientError::Write`] unless the connection is open. An I/O
	/// error while writing closes the connection.
	pub async fn write(&self, frame: &[u8]) -> Result<()> {
		if !self.is_open() {
			return Err(ClientError::write("connection is not open"));
		}

		let mut guard = self.writer.lock().await;
		let Some(writer) = guard.as_mut() else {
			return Err(ClientError::write("connection is not open"));
		};

		let outcome = async {
			writer.write_all(frame).await?;
			writer.flush().await
		}
		.await;

		if let Err(e) = outcome {
			drop(guard);
			debug!(connection = %self.label, error = %e, "write failed, closing connection");
			self.close().await;
			return Err(ClientError::write(e));
		}
		Ok(())
	}

	/// Close the connection. Idempotent.
	pub async fn close(&self) {
		let first = set_closed(&self.state);
		self.shutdown.cancel();

		if let Some(mut writer) = self.writer.lock().await.take() {
			let _ = writer.shutdown().await;
		}

		if first {
			debug!(connection = %self.label, "connection closed locally");
		}
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

/// Move to `Closed`; returns whether this call performed the transition.
fn set_closed(state: &StdMutex<ConnectionState>) -> bool {
	let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
	let was_open = *state != ConnectionState::Closed;
	*state = ConnectionState::Closed;
	was_open
}

async fn read_loop<R>(
	reader: R,
	tx: mpsc::UnboundedSender<ConnectionEvent>,
	state: Arc<StdMutex<ConnectionState>>,
	shutdown: CancellationToken,
	label: String,
) where
	R: AsyncRead + Send + Unpin,
{
	let mut frames = FramedRead::new(reader, FrameCodec::new());

	let terminal = loop {
		tokio::select! {
			_ = shutdown.cancelled() => break ConnectionEvent::Closed,
			next = frames.next() => match next {
				Some(Ok(frame)) => {
					if tx.send(ConnectionEvent::Frame(frame)).is_err() {
						break ConnectionEvent::Closed;
					}
				}
				Some(Err(e)) => break ConnectionEvent::Error(e.to_string()),
				None => break ConnectionEvent::Closed,
			}
		}
	};

	set_closed(&state);
	let dropped = frames.decoder().dropped_frames();
	debug!(connection = %label, ?terminal, dropped_frames = dropped, "reader stopped");
	let _ = tx.send(terminal);
}
