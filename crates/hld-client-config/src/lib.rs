// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration for the HumanLayer daemon client.
//!
//! This crate provides:
//! - Daemon socket and config file path resolution
//! - Layered configuration: defaults, TOML file, environment, overrides
//! - Provenance of the resolved socket path

pub mod error;
pub mod layer;
pub mod paths;

use std::path::{Path, PathBuf};
use std::time::Duration;

pub use error::ConfigError;
pub use layer::{ConfigLayer, ConfigSource};

/// Default timeout for a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default timeout for a single RPC call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(30_000);
/// Default timeout for the subscription handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5_000);
/// Default number of retries after the first connect attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default fixed delay between connect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1_000);

/// Fixed-delay retry policy for `connect_with_retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	/// Retries after the first attempt; total attempts are `max_retries + 1`.
	pub max_retries: u32,
	pub retry_delay: Duration,
}

impl RetryPolicy {
	pub fn total_attempts(&self) -> u32 {
		self.max_retries.saturating_add(1)
	}
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_retries: DEFAULT_MAX_RETRIES,
			retry_delay: DEFAULT_RETRY_DELAY,
		}
	}
}

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
	pub socket_path: PathBuf,
	/// Layer that supplied `socket_path`.
	pub socket_source: ConfigSource,
	pub connect_timeout: Duration,
	pub call_timeout: Duration,
	pub handshake_timeout: Duration,
	pub retry: RetryPolicy,
}

impl ClientConfig {
	/// Defaults with an explicit socket path.
	pub fn with_socket(path: impl Into<PathBuf>) -> Self {
		Self {
			socket_path: path.into(),
			socket_source: ConfigSource::Override,
			connect_timeout: DEFAULT_CONNECT_TIMEOUT,
			call_timeout: DEFAULT_CALL_TIMEOUT,
			handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
			retry: RetryPolicy::default(),
		}
	}

	/// Built-in defaults, socket at `~/.humanlayer/daemon.sock`.
	pub fn defaults() -> Result<Self, ConfigError> {
		let mut config = Self::with_socket(paths::default_socket_path()?);
		config.socket_source = ConfigSource::Default;
		Ok(config)
	}

	/// Apply a layer on top of this configuration.
	pub fn apply(&mut self, layer: &ConfigLayer, source: ConfigSource) -> Result<(), ConfigError> {
		if let Some(raw) = &layer.daemon_socket {
			self.socket_path = paths::expand_home(raw)?;
			self.socket_source = source;
		}
		if let Some(ms) = layer.connect_timeout_ms {
			self.connect_timeout = non_zero_millis("connect_timeout_ms", ms)?;
		}
		if let Some(ms) = layer.call_timeout_ms {
			self.call_timeout = non_zero_millis("call_timeout_ms", ms)?;
		}
		if let Some(ms) = layer.handshake_timeout_ms {
			self.handshake_timeout = non_zero_millis("handshake_timeout_ms", ms)?;
		}
		if let Some(retries) = layer.max_retries {
			self.retry.max_retries = retries;
		}
		if let Some(ms) = layer.retry_delay_ms {
			self.retry.retry_delay = Duration::from_millis(ms);
		}
		Ok(())
	}
}

fn non_zero_millis(field: &str, ms: u64) -> Result<Duration, ConfigError> {
	if ms == 0 {
		return Err(ConfigError::invalid_value(field, "must be greater than zero"));
	}
	Ok(Duration::from_millis(ms))
}

/// Explicit overrides, typically from command-line flags of the embedding
/// application. Highest precedence.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
	pub config_file: Option<PathBuf>,
	pub daemon_socket: Option<PathBuf>,
	pub call_timeout: Option<Duration>,
	pub handshake_timeout: Option<Duration>,
}

impl ConfigOverrides {
	fn as_layer(&self) -> ConfigLayer {
		ConfigLayer {
			daemon_socket: self
				.daemon_socket
				.as_ref()
				.map(|p| p.to_string_lossy().into_owned()),
			connect_timeout_ms: None,
			call_timeout_ms: self.call_timeout.map(|d| d.as_millis() as u64),
			handshake_timeout_ms: self.handshake_timeout.map(|d| d.as_millis() as u64),
			max_retries: None,
			retry_delay_ms: None,
		}
	}
}

/// Resolve configuration from an explicit file, an environment lookup and overrides.
pub fn resolve<F>(
	config_file: &Path,
	env: F,
	overrides: &ConfigOverrides,
) -> Result<ClientConfig, ConfigError>
where
	F: Fn(&str) -> Option<String>,
{
	let mut config = ClientConfig::defaults()?;

	let file_layer = ConfigLayer::from_file(config_file)?;
	config.apply(&file_layer, ConfigSource::File(config_file.to_path_buf()))?;

	let env_layer = ConfigLayer::from_env(env)?;
	config.apply(&env_layer, ConfigSource::Env(layer::ENV_DAEMON_SOCKET))?;

	config.apply(&overrides.as_layer(), ConfigSource::Override)?;

	tracing::debug!(
		socket = %config.socket_path.display(),
		source = %config.socket_source,
		call_timeout_ms = config.call_timeout.as_millis() as u64,
		handshake_timeout_ms = config.handshake_timeout.as_millis() as u64,
		"resolved client configuration"
	);

	Ok(config)
}

/// Load configuration from the user config file and the process environment.
pub fn load_config(overrides: &ConfigOverrides) -> Result<ClientConfig, ConfigError> {
	let config_file = match &overrides.config_file {
		Some(path) => paths::expand_path(path)?,
		None => paths::user_config_file()?,
	};
	resolve(&config_file, |key| std::env::var(key).ok(), overrides)
}
