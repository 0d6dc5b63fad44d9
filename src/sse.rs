//! SSE streaming helpers (spec §4.6, §4.8, §8 boundary behaviour): decode an
//! upstream `text/event-stream` into parsed JSON frames, and encode
//! converted frames back out to the client.

use async_stream::stream;
use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::error::GatewayError;
use crate::json::find_sse_error_envelope;

pub const DONE_MARKER: &str = "[DONE]";

/// `Ok(Value::Null)` signals a clean terminator (`[DONE]`); any other
/// `Ok(Value)` is a parsed frame. A stream that ends without ever yielding
/// the terminator or an `Err` is itself surfaced as an `SSE_DECODE_ERROR`
/// (spec §8: "ends without terminator and without a wrapper error").
pub fn decode_sse_response(response: reqwest::Response) -> BoxStream<'static, Result<Value, GatewayError>> {
	decode_byte_stream(response.bytes_stream())
}

pub fn decode_byte_stream<S>(byte_stream: S) -> BoxStream<'static, Result<Value, GatewayError>>
where
	S: Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
{
	let es = byte_stream.eventsource();
	let out = stream! {
		futures::pin_mut!(es);
		let mut terminated = false;
		while let Some(frame) = es.next().await {
			match frame {
				Ok(event) => {
					if event.data.trim() == DONE_MARKER {
						terminated = true;
						yield Ok(Value::Null);
						break;
					}
					match serde_json::from_str::<Value>(&event.data) {
						Ok(value) => {
							if let Some(message) = find_sse_error_envelope(&value, 2) {
								terminated = true;
								yield Err(GatewayError::SseDecodeError(message));
								break;
							}
							yield Ok(value);
						},
						Err(e) => {
							terminated = true;
							yield Err(GatewayError::SseDecodeError(e.to_string()));
							break;
						},
					}
				},
				Err(e) => {
					terminated = true;
					yield Err(GatewayError::SseDecodeError(e.to_string()));
					break;
				},
			}
		}
		if !terminated {
			yield Err(GatewayError::SseDecodeError("upstream stream ended without a terminator".to_string()));
		}
	};
	Box::pin(out)
}

/// Renders one client-bound SSE frame. `Value::Null` renders the `[DONE]`
/// sentinel so the decode/encode pair round-trips through the terminator.
pub fn encode_sse_data(value: &Value) -> String {
	if value.is_null() {
		format!("data: {DONE_MARKER}\n\n")
	} else {
		format!("data: {value}\n\n")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures::stream;

	fn chunk(s: &str) -> Result<bytes::Bytes, reqwest::Error> {
		Ok(bytes::Bytes::from(s.to_string()))
	}

	#[tokio::test]
	async fn decodes_frames_until_done() {
		let raw = stream::iter(vec![
			chunk("data: {\"delta\":\"hi\"}\n\n"),
			chunk("data: [DONE]\n\n"),
		]);
		let mut decoded = decode_byte_stream(raw);
		let first = decoded.next().await.unwrap().unwrap();
		assert_eq!(first["delta"], "hi");
		let second = decoded.next().await.unwrap().unwrap();
		assert!(second.is_null());
		assert!(decoded.next().await.is_none());
	}

	#[tokio::test]
	async fn missing_terminator_is_a_decode_error() {
		let raw = stream::iter(vec![chunk("data: {\"delta\":\"hi\"}\n\n")]);
		let mut decoded = decode_byte_stream(raw);
		let _ = decoded.next().await.unwrap().unwrap();
		let err = decoded.next().await.unwrap().unwrap_err();
		assert!(matches!(err, GatewayError::SseDecodeError(_)));
	}

	#[tokio::test]
	async fn wrapped_error_envelope_is_a_decode_error() {
		let raw = stream::iter(vec![chunk("data: {\"mode\":\"sse\",\"error\":\"boom\"}\n\n")]);
		let mut decoded = decode_byte_stream(raw);
		let err = decoded.next().await.unwrap().unwrap_err();
		assert!(matches!(err, GatewayError::SseDecodeError(_)));
	}
}
