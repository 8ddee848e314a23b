// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Boundary validation of untrusted payloads.
//!
//! Every structured value received from the daemon passes through here before
//! it becomes a typed record. Validation is a conjunction of required-field
//! presence and type checks; the first failing check produces a
//! [`ValidationError`] naming the entity and field. An optional field whose
//! value has the wrong type decodes as absent; records that carry an `extra`
//! map keep the raw value there.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use crate::protocol::RpcErrorObject;
use crate::types::{
	Approval, ApprovalResolvedData, Event, EventData, EventType, HealthResponse, NewApprovalData,
	Session, SessionLeaf, SessionStatusChangedData, SubscribeResponse,
};

/// JSON type expected by a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
	String,
	Bool,
	Integer,
	Object,
	Array,
}

impl Expected {
	fn matches(self, value: &Value) -> bool {
		match self {
			Expected::String => value.is_string(),
			Expected::Bool => value.is_boolean(),
			Expected::Integer => value.is_i64(),
			Expected::Object => value.is_object(),
			Expected::Array => value.is_array(),
		}
	}
}

impl std::fmt::Display for Expected {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			Expected::String => "string",
			Expected::Bool => "boolean",
			Expected::Integer => "integer",
			Expected::Object => "object",
			Expected::Array => "array",
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
	NotAnObject,
	Missing,
	WrongType { expected: Expected },
	UnknownEventType(String),
	Malformed(String),
}

/// A value failed its shape check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {entity}: {}", describe(.field, .problem))]
pub struct ValidationError {
	pub entity: &'static str,
	/// Field path, empty when the value itself is the problem.
	pub field: String,
	pub problem: Problem,
}

fn describe(field: &str, problem: &Problem) -> String {
	match problem {
		Problem::NotAnObject => "expected object".to_string(),
		Problem::Missing => format!("missing {field}"),
		Problem::WrongType { expected } => format!("{field} must be a {expected}"),
		Problem::UnknownEventType(ty) => format!("unknown event type {ty}"),
		Problem::Malformed(msg) if field.is_empty() => msg.clone(),
		Problem::Malformed(msg) => format!("{field}: {msg}"),
	}
}

impl ValidationError {
	pub fn new(entity: &'static str, field: impl Into<String>, problem: Problem) -> Self {
		Self {
			entity,
			field: field.into(),
			problem,
		}
	}

	fn at_index(mut self, index: usize) -> Self {
		self.field = if self.field.is_empty() {
			format!("[{index}]")
		} else {
			format!("[{index}].{}", self.field)
		};
		self
	}
}

/// Conversion from an untrusted JSON value to a trusted typed value.
pub trait Validate: Sized {
	fn validate(raw: &Value) -> Result<Self, ValidationError>;
}

/// Validate a single value.
pub fn validate<T: Validate>(raw: &Value) -> Result<T, ValidationError> {
	T::validate(raw)
}

/// Validate every element; the first failure fails the whole batch and its
/// field path is prefixed with the element index.
pub fn validate_array<T: Validate>(items: &[Value]) -> Result<Vec<T>, ValidationError> {
	items
		.iter()
		.enumerate()
		.map(|(i, item)| T::validate(item).map_err(|e| e.at_index(i)))
		.collect()
}

/// Borrow the array under `field` of a wrapper result such as
/// `{"sessions": [...]}`.
pub fn array_field<'a>(
	entity: &'static str,
	raw: &'a Value,
	field: &str,
) -> Result<&'a [Value], ValidationError> {
	let shape = Shape::of(entity, raw)?;
	let items = shape.require(field, Expected::Array)?;
	Ok(items.as_array().map(Vec::as_slice).unwrap_or_default())
}

/// Field checks against one JSON object.
struct Shape<'a> {
	entity: &'static str,
	object: &'a Map<String, Value>,
}

impl<'a> Shape<'a> {
	fn of(entity: &'static str, raw: &'a Value) -> Result<Self, ValidationError> {
		match raw.as_object() {
			Some(object) => Ok(Self { entity, object }),
			None => Err(ValidationError::new(entity, "", Problem::NotAnObject)),
		}
	}

	fn require(&self, field: &str, expected: Expected) -> Result<&'a Value, ValidationError> {
		let value = match self.object.get(field) {
			None | Some(Value::Null) => {
				return Err(ValidationError::new(self.entity, field, Problem::Missing));
			}
			Some(value) => value,
		};
		if expected.matches(value) {
			Ok(value)
		} else {
			Err(ValidationError::new(
				self.entity,
				field,
				Problem::WrongType { expected },
			))
		}
	}

	fn strings(&self, fields: &[&str]) -> Result<(), ValidationError> {
		for field in fields {
			self.require(field, Expected::String)?;
		}
		Ok(())
	}

	fn str(&self, field: &str) -> Result<&'a str, ValidationError> {
		Ok(self
			.require(field, Expected::String)?
			.as_str()
			.unwrap_or_default())
	}

	/// Decode the whole object once the required fields are known good.
	///
	/// Each listed optional field whose value is present, non-null and of the
	/// wrong type is removed before decoding and returned alongside the record.
	fn decode<T: DeserializeOwned>(
		&self,
		optional: &[(&str, Expected)],
	) -> Result<(T, Map<String, Value>), ValidationError> {
		let mut object = self.object.clone();
		let mut set_aside = Map::new();
		for &(field, expected) in optional {
			let mistyped = object
				.get(field)
				.is_some_and(|v| !v.is_null() && !expected.matches(v));
			if !mistyped {
				continue;
			}
			if let Some(raw) = object.remove(field) {
				debug!(entity = self.entity, field, expected = %expected, "ignoring mistyped optional field");
				set_aside.insert(field.to_string(), raw);
			}
		}

		let record = serde_json::from_value(Value::Object(object))
			.map_err(|e| ValidationError::new(self.entity, "", Problem::Malformed(e.to_string())))?;
		Ok((record, set_aside))
	}
}

const SESSION_OPTIONAL: &[(&str, Expected)] = &[
	("claude_session_id", Expected::String),
	("parent_session_id", Expected::String),
	("summary", Expected::String),
	("title", Expected::String),
	("model", Expected::String),
	("working_dir", Expected::String),
	("max_turns", Expected::Integer),
	("last_activity_at", Expected::String),
	("completed_at", Expected::String),
];

const SESSION_LEAF_OPTIONAL: &[(&str, Expected)] = &[
	("title", Expected::String),
	("last_activity_at", Expected::String),
];

const APPROVAL_OPTIONAL: &[(&str, Expected)] = &[
	("function_name", Expected::String),
	("status", Expected::String),
	("resolved_at", Expected::String),
	("approved", Expected::Bool),
	("response_text", Expected::String),
	("user_id", Expected::String),
	("user_email", Expected::String),
];

impl Validate for Session {
	fn validate(raw: &Value) -> Result<Self, ValidationError> {
		let shape = Shape::of("session", raw)?;
		shape.strings(&["id", "run_id", "query", "status", "created_at"])?;
		let (mut session, set_aside) = shape.decode::<Session>(SESSION_OPTIONAL)?;
		session.extra.extend(set_aside);
		Ok(session)
	}
}

impl Validate for SessionLeaf {
	fn validate(raw: &Value) -> Result<Self, ValidationError> {
		let shape = Shape::of("session leaf", raw)?;
		shape.strings(&["id", "status", "created_at"])?;
		Ok(shape.decode(SESSION_LEAF_OPTIONAL)?.0)
	}
}

impl Validate for Approval {
	fn validate(raw: &Value) -> Result<Self, ValidationError> {
		let shape = Shape::of("approval", raw)?;
		shape.strings(&["id", "session_id", "run_id", "tool_name", "created_at"])?;
		shape.require("tool_input", Expected::Object)?;
		let (mut approval, set_aside) = shape.decode::<Approval>(APPROVAL_OPTIONAL)?;
		approval.extra.extend(set_aside);
		Ok(approval)
	}
}

impl Validate for SubscribeResponse {
	fn validate(raw: &Value) -> Result<Self, ValidationError> {
		let shape = Shape::of("subscription confirmation", raw)?;
		shape.strings(&["subscription_id"])?;
		Ok(shape.decode(&[("message", Expected::String)])?.0)
	}
}

impl Validate for HealthResponse {
	fn validate(raw: &Value) -> Result<Self, ValidationError> {
		let shape = Shape::of("health", raw)?;
		shape.strings(&["status"])?;
		Ok(shape.decode(&[("version", Expected::String)])?.0)
	}
}

impl Validate for RpcErrorObject {
	fn validate(raw: &Value) -> Result<Self, ValidationError> {
		let shape = Shape::of("rpc error", raw)?;
		shape.require("code", Expected::Integer)?;
		shape.require("message", Expected::String)?;
		Ok(shape.decode(&[])?.0)
	}
}

impl Validate for Event {
	fn validate(raw: &Value) -> Result<Self, ValidationError> {
		let shape = Shape::of("event", raw)?;
		let type_name = shape.str("type")?;
		let timestamp = shape.str("timestamp")?;
		let data = shape.require("data", Expected::Object)?;

		let event_type = EventType::parse(type_name).ok_or_else(|| {
			ValidationError::new(
				"event",
				"type",
				Problem::UnknownEventType(type_name.to_string()),
			)
		})?;

		let data = match event_type {
			EventType::NewApproval => {
				let shape = Shape::of("new_approval event", data)?;
				shape.strings(&["session_id", "run_id", "approval_id", "tool_name"])?;
				EventData::NewApproval(shape.decode::<NewApprovalData>(&[])?.0)
			}
			EventType::ApprovalResolved => {
				let shape = Shape::of("approval_resolved event", data)?;
				shape.strings(&["session_id", "run_id", "approval_id"])?;
				shape.require("approved", Expected::Bool)?;
				let (mut resolved, set_aside) =
					shape.decode::<ApprovalResolvedData>(&[("response_text", Expected::String)])?;
				resolved.extra.extend(set_aside);
				EventData::ApprovalResolved(resolved)
			}
			EventType::SessionStatusChanged => {
				let shape = Shape::of("session_status_changed event", data)?;
				shape.strings(&["session_id", "old_status", "new_status"])?;
				let (mut changed, set_aside) = shape
					.decode::<SessionStatusChangedData>(&[("parent_session_id", Expected::String)])?;
				changed.extra.extend(set_aside);
				EventData::SessionStatusChanged(changed)
			}
		};

		Ok(Event::new(timestamp, data))
	}
}
