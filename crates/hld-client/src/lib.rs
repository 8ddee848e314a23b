// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client runtime for the HumanLayer daemon.
//!
//! The daemon speaks newline-delimited JSON-RPC 2.0 over a Unix socket. This
//! crate layers, bottom up:
//!
//! - [`codec`]: NDJSON framing that tolerates arbitrary chunking and drops
//!   malformed lines.
//! - [`connection`]: one duplex stream with a reader task and an event feed.
//! - [`rpc`]: id-correlated calls with per-call timeouts.
//! - [`subscription`]: the push-event feed on a dedicated connection.
//! - [`validate`]: shape checks for every record received from the daemon.
//! - [`client`]: the typed [`DaemonClient`].
//!
//! ```no_run
//! use hld_client::{DaemonClient, SubscribeRequest, EventType, SubscriptionMessage};
//! use hld_client_config::ClientConfig;
//!
//! # async fn run() -> hld_client::Result<()> {
//! let config = ClientConfig::defaults()?;
//! let client = DaemonClient::connect_with_retry(config).await?;
//! for session in client.list_sessions().await? {
//!     println!("{} {}", session.id, session.status);
//! }
//!
//! let mut feed = client
//!     .subscribe(&SubscribeRequest::for_types([EventType::NewApproval]))
//!     .await?;
//! while let Some(SubscriptionMessage::Event(event)) = feed.recv().await {
//!     println!("{} at {}", event.event_type(), event.timestamp);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod rpc;
pub mod subscription;
pub mod types;
pub mod validate;

pub use client::{connect_with_retry, DaemonClient};
pub use codec::{encode_frame, FrameCodec};
pub use connection::{Connection, ConnectionEvent, ConnectionEvents, ConnectionState};
pub use error::{ClientError, Result};
pub use rpc::RpcChannel;
pub use subscription::{
	Envelope, Subscription, SubscriptionConfig, SubscriptionMessage, SubscriptionState,
};
pub use types::*;
pub use validate::{validate, validate_array, Validate, ValidationError};
