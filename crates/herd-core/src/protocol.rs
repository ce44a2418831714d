use crate::types::StatsReport;
use serde_json::{Map, Value};

/// Environment variable carrying the worker's slot index.
pub const WORKER_ENV: &str = "HERD_WORKER";
/// Environment flag that tells a process it was forked by the master.
pub const ROLE_ENV: &str = "HERD_ROLE";
pub const ROLE_WORKER: &str = "worker";

const CMD_STATS_REQUEST: &str = "send stats";
const CMD_STATS_RESPONSE: &str = "stats";

/// One message on the master/worker channel.
///
/// Lines are newline-delimited JSON objects. A single line may match more than
/// one route (a stats reply that also sets `broadcast`), so decoding yields
/// every message the line classifies as.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
	/// `{"cmd":"send stats"}`, master to worker.
	StatsRequest,
	/// `{"cmd":"stats","data":{...}}`, worker to master.
	StatsResponse(StatsReport),
	/// `{"broadcast":true, ...}`, relayed verbatim to every worker.
	Broadcast(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
	/// Line was not valid JSON.
	Json(String),
	/// Line was JSON but not an object.
	NotAnObject,
	/// `cmd:"stats"` with a `data` field that does not fit the report shape.
	BadStats(String),
	/// Object matched no known route.
	Unroutable,
}

impl std::fmt::Display for DecodeError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			DecodeError::Json(e) => write!(f, "invalid json: {}", e),
			DecodeError::NotAnObject => write!(f, "message is not an object"),
			DecodeError::BadStats(e) => write!(f, "malformed stats payload: {}", e),
			DecodeError::Unroutable => write!(f, "message matches no route"),
		}
	}
}

impl std::error::Error for DecodeError {}

impl Message {
	pub fn broadcast(payload: Map<String, Value>) -> Self {
		Message::Broadcast(payload)
	}

	pub fn to_value(&self) -> Value {
		match self {
			Message::StatsRequest => serde_json::json!({ "cmd": CMD_STATS_REQUEST }),
			Message::StatsResponse(report) => serde_json::json!({
				"cmd": CMD_STATS_RESPONSE,
				"data": report,
			}),
			Message::Broadcast(payload) => {
				let mut obj = payload.clone();
				obj.insert("broadcast".to_string(), Value::Bool(true));
				Value::Object(obj)
			}
		}
	}

	/// Serialize to a JSON line, newline included.
	pub fn to_line(&self) -> String {
		let mut line = self.to_value().to_string();
		line.push('\n');
		line
	}

	/// Classify one line into every route it matches.
	pub fn decode(line: &str) -> Result<Vec<Message>, DecodeError> {
		let value: Value =
			serde_json::from_str(line.trim()).map_err(|e| DecodeError::Json(e.to_string()))?;
		let Value::Object(obj) = value else {
			return Err(DecodeError::NotAnObject);
		};

		let mut messages = Vec::new();
		let mut stats_error = None;

		match obj.get("cmd").and_then(Value::as_str) {
			Some(CMD_STATS_REQUEST) => messages.push(Message::StatsRequest),
			Some(CMD_STATS_RESPONSE) => {
				let data = obj.get("data").cloned().unwrap_or(Value::Null);
				match serde_json::from_value::<StatsReport>(data) {
					Ok(report) => messages.push(Message::StatsResponse(report)),
					Err(e) => stats_error = Some(DecodeError::BadStats(e.to_string())),
				}
			}
			_ => {}
		}

		if obj.get("broadcast") == Some(&Value::Bool(true)) {
			messages.push(Message::Broadcast(obj));
		}

		if messages.is_empty() {
			return Err(stats_error.unwrap_or(DecodeError::Unroutable));
		}
		Ok(messages)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::MemoryUsage;

	#[test]
	fn decodes_stats_request() {
		assert_eq!(
			Message::decode(r#"{"cmd":"send stats"}"#).unwrap(),
			vec![Message::StatsRequest]
		);
	}

	#[test]
	fn decodes_stats_response() {
		let line = r#"{"cmd":"stats","data":{"pid":10,"filename":"app.js","memory":{"rss":100,"heapTotal":50,"heapUsed":30},"uptime":1.5}}"#;
		let messages = Message::decode(line).unwrap();
		assert_eq!(
			messages,
			vec![Message::StatsResponse(StatsReport {
				pid: 10,
				filename: "app.js".into(),
				memory: MemoryUsage {
					rss: 100,
					heap_total: 50,
					heap_used: 30,
				},
				uptime: 1.5,
			})]
		);
	}

	#[test]
	fn broadcast_keeps_payload_verbatim() {
		let line = r#"{"broadcast":true,"topic":"cache","keys":[1,2]}"#;
		let messages = Message::decode(line).unwrap();
		let Message::Broadcast(obj) = &messages[0] else {
			panic!("expected broadcast");
		};
		assert_eq!(obj.get("topic"), Some(&Value::String("cache".into())));
		assert_eq!(messages[0].to_value(), serde_json::from_str::<Value>(line).unwrap());
	}

	#[test]
	fn stats_with_broadcast_matches_both_routes() {
		let line = r#"{"cmd":"stats","broadcast":true,"data":{"pid":1,"filename":"a","memory":{"rss":1,"heapTotal":1,"heapUsed":1}}}"#;
		let messages = Message::decode(line).unwrap();
		assert_eq!(messages.len(), 2);
		assert!(matches!(messages[0], Message::StatsResponse(_)));
		assert!(matches!(messages[1], Message::Broadcast(_)));
	}

	#[test]
	fn bad_stats_still_routes_broadcast() {
		let line = r#"{"cmd":"stats","broadcast":true,"data":"nope"}"#;
		let messages = Message::decode(line).unwrap();
		assert_eq!(messages.len(), 1);
		assert!(matches!(messages[0], Message::Broadcast(_)));
	}

	#[test]
	fn rejects_unknown_and_malformed() {
		assert_eq!(Message::decode(r#"{"cmd":"reboot"}"#), Err(DecodeError::Unroutable));
		assert_eq!(Message::decode(r#"{"broadcast":"yes"}"#), Err(DecodeError::Unroutable));
		assert_eq!(Message::decode("[1,2]"), Err(DecodeError::NotAnObject));
		assert!(matches!(Message::decode("not json"), Err(DecodeError::Json(_))));
		assert!(matches!(
			Message::decode(r#"{"cmd":"stats","data":{"pid":"x"}}"#),
			Err(DecodeError::BadStats(_))
		));
	}

	#[test]
	fn to_line_is_newline_terminated() {
		assert_eq!(Message::StatsRequest.to_line(), "{\"cmd\":\"send stats\"}\n");
	}
}
