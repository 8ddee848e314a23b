// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Path resolution for the daemon socket and the client config file.

use std::path::{Path, PathBuf};

use crate::ConfigError;

/// Directory under `$HOME` where the daemon keeps its socket.
pub const DAEMON_HOME_DIR: &str = ".humanlayer";

/// File name of the daemon socket.
pub const SOCKET_FILE_NAME: &str = "daemon.sock";

/// Default socket path before `~` expansion.
pub const DEFAULT_SOCKET_PATH: &str = "~/.humanlayer/daemon.sock";

/// Resolve the default daemon socket: `~/.humanlayer/daemon.sock`.
pub fn default_socket_path() -> Result<PathBuf, ConfigError> {
	let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
	Ok(home.join(DAEMON_HOME_DIR).join(SOCKET_FILE_NAME))
}

/// Resolve the user config file according to the XDG Base Directory
/// Specification: `$XDG_CONFIG_HOME/humanlayer/client.toml`, falling back to
/// `~/.config/humanlayer/client.toml`.
pub fn user_config_file() -> Result<PathBuf, ConfigError> {
	let config_home = match std::env::var_os("XDG_CONFIG_HOME") {
		Some(dir) => PathBuf::from(dir),
		None => dirs::home_dir()
			.ok_or(ConfigError::HomeDirNotFound)?
			.join(".config"),
	};

	let path = config_home.join("humanlayer/client.toml");
	tracing::debug!(path = %path.display(), "resolved client config path");
	Ok(path)
}

/// Expand a leading `~` to the home directory.
///
/// Paths without a leading `~` are returned unchanged.
pub fn expand_home(raw: &str) -> Result<PathBuf, ConfigError> {
	if raw == "~" {
		return dirs::home_dir().ok_or(ConfigError::HomeDirNotFound);
	}
	match raw.strip_prefix("~/") {
		Some(rest) => {
			let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
			Ok(home.join(rest))
		}
		None => Ok(PathBuf::from(raw)),
	}
}

/// Expand `~` in an already-typed path.
pub fn expand_path(path: &Path) -> Result<PathBuf, ConfigError> {
	match path.to_str() {
		Some(raw) => expand_home(raw),
		None => Ok(path.to_path_buf()),
	}
}
