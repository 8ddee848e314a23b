// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the daemon client.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::validate::ValidationError;

/// Errors surfaced by every public client operation.
#[derive(Debug, Error)]
pub enum ClientError {
	/// Transport-level failure: refusal, reset, premature close.
	#[error("daemon connection failed: {0}")]
	Connection(String),

	/// A write was attempted on a connection that is not open, or the write failed.
	#[error("write to daemon failed: {0}")]
	Write(String),

	/// No response with a matching id arrived in time.
	#[error("RPC call '{method}' timed out after {}ms", .timeout.as_millis())]
	Timeout { method: String, timeout: Duration },

	/// The daemon answered with an error envelope.
	#[error("RPC error {code}: {message}")]
	Rpc {
		code: i64,
		message: String,
		data: Option<Value>,
	},

	/// A decoded payload failed shape validation.
	#[error(transparent)]
	Validation(#[from] ValidationError),

	/// The subscription was not confirmed in time.
	#[error("timeout waiting for subscription confirmation after {}ms", .timeout.as_millis())]
	SubscriptionHandshake { timeout: Duration },

	/// Encoding a request or decoding a typed result failed.
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	/// The daemon reported a health status other than `ok`.
	#[error("daemon unhealthy: {status}")]
	Unhealthy { status: String },

	/// Client configuration could not be resolved.
	#[error(transparent)]
	Config(#[from] hld_client_config::ConfigError),

	/// The facade has no open primary connection.
	#[error("not connected to daemon")]
	NotConnected,

	/// `connect_with_retry` used up every attempt.
	#[error("failed to connect to daemon after {attempts} attempts: {last}")]
	RetryExhausted {
		attempts: u32,
		#[source]
		last: Box<ClientError>,
	},
}

impl ClientError {
	pub(crate) fn connection(err: impl std::fmt::Display) -> Self {
		Self::Connection(err.to_string())
	}

	pub(crate) fn write(err: impl std::fmt::Display) -> Self {
		Self::Write(err.to_string())
	}

	/// Whether retrying the whole connect cycle could plausibly succeed.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			ClientError::Connection(_)
				| ClientError::Write(_)
				| ClientError::Timeout { .. }
				| ClientError::Unhealthy { .. }
		)
	}
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
