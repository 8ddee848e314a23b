// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Newline-delimited JSON framing.
//!
//! One frame is one JSON value followed by `\n`. `serde_json` never emits a
//! raw newline inside a value, so the delimiter is unambiguous. Lines that do
//! not parse are dropped: the daemon may interleave partial or corrupt lines
//! and a single bad line must not tear down the stream.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

const DELIMITER: u8 = b'\n';

/// Serialize `value` into a single frame.
pub fn encode_frame<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, serde_json::Error> {
	let mut buf = serde_json::to_vec(value)?;
	buf.push(DELIMITER);
	Ok(Bytes::from(buf))
}

/// Stateful NDJSON decoder/encoder. One instance per connection.
#[derive(Debug, Default)]
pub struct FrameCodec {
	/// Accumulation buffer used by [`FrameCodec::push`].
	pending: BytesMut,
	/// Bytes already scanned for a delimiter in the decoder's buffer.
	scanned: usize,
	dropped: u64,
}

impl FrameCodec {
	pub fn new() -> Self {
		Self::default()
	}

	/// Number of lines discarded because they were not valid JSON.
	pub fn dropped_frames(&self) -> u64 {
		self.dropped
	}

	/// Append a chunk and drain every complete frame. The trailing incomplete
	/// segment stays buffered until a later chunk completes it.
	pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
		let mut buf = std::mem::take(&mut self.pending);
		buf.extend_from_slice(chunk);
		let mut frames = Vec::new();
		while let Some(frame) = self.next_frame(&mut buf) {
			frames.push(frame);
		}
		self.pending = buf;
		frames
	}

	/// Bytes held back waiting for a delimiter.
	pub fn buffered_len(&self) -> usize {
		self.pending.len()
	}

	fn next_frame(&mut self, buf: &mut BytesMut) -> Option<Value> {
		loop {
			let newline = buf[self.scanned..].iter().position(|b| *b == DELIMITER);
			let Some(offset) = newline else {
				self.scanned = buf.len();
				return None;
			};

			let line = buf.split_to(self.scanned + offset + 1);
			self.scanned = 0;
			if let Some(frame) = self.parse_line(&line[..line.len() - 1]) {
				return Some(frame);
			}
		}
	}

	fn parse_line(&mut self, line: &[u8]) -> Option<Value> {
		let line = line.strip_suffix(b"\r").unwrap_or(line);
		if line.iter().all(u8::is_ascii_whitespace) {
			return None;
		}
		match serde_json::from_slice::<Value>(line) {
			Ok(value) => Some(value),
			Err(e) => {
				self.dropped += 1;
				debug!(error = %e, len = line.len(), "dropping malformed frame");
				None
			}
		}
	}
}

impl Decoder for FrameCodec {
	type Item = Value;
	type Error = std::io::Error;

	fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Value>, Self::Error> {
		Ok(self.next_frame(buf))
	}

	fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Value>, Self::Error> {
		if let Some(frame) = self.next_frame(buf) {
			return Ok(Some(frame));
		}
		if !buf.is_empty() {
			debug!(len = buf.len(), "discarding unterminated frame at end of stream");
			buf.clear();
			self.scanned = 0;
		}
		Ok(None)
	}
}

impl<T: Serialize> Encoder<T> for FrameCodec {
	type Error = std::io::Error;

	fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
		let json = serde_json::to_vec(&item)?;
		dst.reserve(json.len() + 1);
		dst.put_slice(&json);
		dst.put_u8(DELIMITER);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use serde_json::json;

	#[test]
	fn test_encode_appends_single_newline() {
		let bytes = encode_frame(&json!({"method": "health", "id": 1})).unwrap();
		assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
		assert_eq!(bytes.last(), Some(&b'\n'));
	}

	#[test]
	fn test_encode_escapes_embedded_newlines() {
		let bytes = encode_frame(&json!({"text": "line one\nline two"})).unwrap();
		assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
	}

	#[test]
	fn test_push_handles_multiple_frames_per_chunk() {
		let mut codec = FrameCodec::new();
		let frames = codec.push(b"{\"id\":1}\n{\"id\":2}\n{\"id\":");
		assert_eq!(frames, vec![json!({"id": 1}), json!({"id": 2})]);
		assert_eq!(codec.buffered_len(), 6);

		let frames = codec.push(b"3}\n");
		assert_eq!(frames, vec![json!({"id": 3})]);
		assert_eq!(codec.buffered_len(), 0);
	}

	#[test]
	fn test_push_drops_malformed_lines() {
		let mut codec = FrameCodec::new();
		let frames = codec.push(b"{\"id\":1}\nnot json\n{\"id\":\n{\"id\":2}\n");
		assert_eq!(frames, vec![json!({"id": 1}), json!({"id": 2})]);
		assert_eq!(codec.dropped_frames(), 2);
	}

	#[test]
	fn test_push_skips_blank_lines_and_crlf() {
		let mut codec = FrameCodec::new();
		let frames = codec.push(b"\n  \n{\"id\":1}\r\n");
		assert_eq!(frames, vec![json!({"id": 1})]);
		assert_eq!(codec.dropped_frames(), 0);
	}

	#[test]
	fn test_decoder_waits_for_delimiter() {
		let mut codec = FrameCodec::new();
		let mut buf = BytesMut::from(&b"{\"result\":{}"[..]);
		assert_eq!(codec.decode(&mut buf).unwrap(), None);
		buf.extend_from_slice(b",\"id\":9}\n");
		assert_eq!(
			codec.decode(&mut buf).unwrap(),
			Some(json!({"result": {}, "id": 9}))
		);
		assert!(buf.is_empty());
	}

	#[test]
	fn test_decode_eof_discards_partial_tail() {
		let mut codec = FrameCodec::new();
		let mut buf = BytesMut::from(&b"{\"id\":1}\n{\"id\":"[..]);
		assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(json!({"id": 1})));
		assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
		assert!(buf.is_empty());
	}

	#[test]
	fn test_encoder_matches_encode_frame() {
		let value = json!({"jsonrpc": "2.0", "method": "Subscribe", "id": 2});
		let mut codec = FrameCodec::new();
		let mut dst = BytesMut::new();
		codec.encode(&value, &mut dst).unwrap();
		assert_eq!(dst.freeze(), encode_frame(&value).unwrap());
	}

	fn split_at_points(bytes: &[u8], mut points: Vec<usize>) -> Vec<&[u8]> {
		points.retain(|p| *p < bytes.len());
		points.sort_unstable();
		points.dedup();
		let mut chunks = Vec::new();
		let mut start = 0;
		for p in points {
			chunks.push(&bytes[start..p]);
			start = p;
		}
		chunks.push(&bytes[start..]);
		chunks
	}

	fn arb_line() -> impl Strategy<Value = Vec<u8>> {
		prop_oneof![
			4 => (any::<u32>(), "[a-z \\n\"]{0,12}").prop_map(|(id, text)| {
				encode_frame(&json!({"id": id, "result": {"text": text}})).unwrap().to_vec()
			}),
			1 => "[a-z{}:]{1,8}".prop_map(|garbage| format!("{garbage}\n").into_bytes()),
			1 => Just(b"\n".to_vec()),
		]
	}

	proptest! {
		#[test]
		fn test_chunking_invariance(
			lines in proptest::collection::vec(arb_line(), 0..20),
			points in proptest::collection::vec(0usize..2048, 0..40),
		) {
			let stream: Vec<u8> = lines.concat();

			let mut whole = FrameCodec::new();
			let expected = whole.push(&stream);

			let mut chunked = FrameCodec::new();
			let mut actual = Vec::new();
			for chunk in split_at_points(&stream, points) {
				actual.extend(chunked.push(chunk));
			}

			prop_assert_eq!(actual, expected);
			prop_assert_eq!(chunked.buffered_len(), 0);
		}

		#[test]
		fn test_byte_at_a_time_through_decoder(
			lines in proptest::collection::vec(arb_line(), 0..10),
		) {
			let stream: Vec<u8> = lines.concat();
			let expected = FrameCodec::new().push(&stream);

			let mut codec = FrameCodec::new();
			let mut buf = BytesMut::new();
			let mut actual = Vec::new();
			for byte in &stream {
				buf.put_u8(*byte);
				while let Some(frame) = codec.decode(&mut buf).unwrap() {
					actual.push(frame);
				}
			}
			prop_assert_eq!(actual, expected);
		}
	}
}
