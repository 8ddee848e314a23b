// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Partial configuration layers and the sources that produce them.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::ConfigError;

/// Environment variable overriding the daemon socket path.
pub const ENV_DAEMON_SOCKET: &str = "HUMANLAYER_DAEMON_SOCKET";
/// Environment variable overriding the per-call timeout, in milliseconds.
pub const ENV_CALL_TIMEOUT_MS: &str = "HUMANLAYER_CALL_TIMEOUT_MS";
/// Environment variable overriding the subscription handshake timeout, in milliseconds.
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "HUMANLAYER_HANDSHAKE_TIMEOUT_MS";
/// Environment variable overriding the connect timeout, in milliseconds.
pub const ENV_CONNECT_TIMEOUT_MS: &str = "HUMANLAYER_CONNECT_TIMEOUT_MS";

/// Where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
	Default,
	File(PathBuf),
	Env(&'static str),
	Override,
}

impl std::fmt::Display for ConfigSource {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ConfigSource::Default => write!(f, "default"),
			ConfigSource::File(path) => write!(f, "config file {}", path.display()),
			ConfigSource::Env(var) => write!(f, "env {var}"),
			ConfigSource::Override => write!(f, "override"),
		}
	}
}

/// A partial configuration. Unset fields leave lower layers untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
	pub daemon_socket: Option<String>,
	pub connect_timeout_ms: Option<u64>,
	pub call_timeout_ms: Option<u64>,
	pub handshake_timeout_ms: Option<u64>,
	pub max_retries: Option<u32>,
	pub retry_delay_ms: Option<u64>,
}

impl ConfigLayer {
	/// Parse a layer from TOML text. `path` is only used for error reporting.
	pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
		toml::from_str(text).map_err(|source| ConfigError::TomlParse {
			path: path.to_path_buf(),
			source,
		})
	}

	/// Read a layer from a TOML file. A missing file yields an empty layer.
	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		if !path.exists() {
			tracing::debug!(path = %path.display(), "client config file not found, skipping");
			return Ok(Self::default());
		}
		let text = std::fs::read_to_string(path)?;
		Self::from_toml(&text, path)
	}

	/// Build a layer from environment lookups.
	///
	/// The lookup is injected so tests do not have to mutate the process
	/// environment.
	pub fn from_env<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		Ok(Self {
			daemon_socket: lookup(ENV_DAEMON_SOCKET).filter(|s| !s.trim().is_empty()),
			connect_timeout_ms: parse_millis(&lookup, ENV_CONNECT_TIMEOUT_MS)?,
			call_timeout_ms: parse_millis(&lookup, ENV_CALL_TIMEOUT_MS)?,
			handshake_timeout_ms: parse_millis(&lookup, ENV_HANDSHAKE_TIMEOUT_MS)?,
			max_retries: None,
			retry_delay_ms: None,
		})
	}
}

fn parse_millis<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, ConfigError>
where
	F: Fn(&str) -> Option<String>,
{
	match lookup(var) {
		None => Ok(None),
		Some(raw) => raw
			.trim()
			.parse::<u64>()
			.map(Some)
			.map_err(|e| ConfigError::invalid_value(var, e.to_string())),
	}
}
