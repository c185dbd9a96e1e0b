//! Values exchanged between a [`Controller`](crate::Controller) and its worker.
//!
//! Everything in here derives `Serialize`/`Deserialize` since a process
//! isolated worker receives them as JSON lines over its stdio. Payloads are
//! restricted to [`serde_json::Value`] for the same reason: whatever the
//! handler returns has to survive the trip across the process boundary.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::CorrelationId;

/// Reserved command that stops the worker control loop.
pub const QUIT: &str = "quit";

/// Free-form request parameters, only interpreted by the worker's handler.
pub type Parameters = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    pub correlation_id: CorrelationId,
    /// When `false` the worker never enqueues a [`Response`] for this request.
    pub respond: bool,
    #[serde(default)]
    pub parameters: Parameters,
}

impl Request {
    pub fn new(command: impl Into<String>, parameters: Parameters, respond: bool) -> Self {
        Self {
            command: command.into(),
            correlation_id: uuid::Uuid::new_v4(),
            respond,
            parameters,
        }
    }

    pub fn quit(respond: bool) -> Self {
        Self::new(QUIT, Parameters::new(), respond)
    }

    pub fn is_quit(&self) -> bool {
        self.command == QUIT
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub command: String,
    pub correlation_id: CorrelationId,
    pub success: bool,
    /// Handler output when `success` is set, `None` otherwise.
    pub result: Option<Value>,
}

impl Response {
    pub(crate) fn ok(command: String, correlation_id: CorrelationId, result: Value) -> Self {
        Self {
            command,
            correlation_id,
            success: true,
            result: Some(result),
        }
    }

    pub(crate) fn failed(command: String, correlation_id: CorrelationId) -> Self {
        Self {
            command,
            correlation_id,
            success: false,
            result: None,
        }
    }

    /// Acknowledgment sent once the worker has run its cleanup after a quit.
    pub(crate) fn quit_ack(correlation_id: CorrelationId) -> Self {
        Self {
            command: QUIT.to_string(),
            correlation_id,
            success: true,
            result: None,
        }
    }

    pub fn is_quit(&self) -> bool {
        self.command == QUIT
    }
}

/// Everything the worker pushes onto the response channel. The first reply is
/// always one of the two lifecycle signals, every following one a `Response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Started,
    StartupError { message: String },
    Response(Response),
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn quit_ack_carries_no_result() {
        let quit = Request::quit(true);
        let ack = Response::quit_ack(quit.correlation_id);

        assert!(ack.is_quit());
        assert!(ack.success);
        assert_eq!(ack.result, None);
        assert_eq!(ack.correlation_id, quit.correlation_id);
    }

    #[test]
    fn failed_response_drops_result() {
        let response = Response::failed("echo".to_string(), uuid::Uuid::new_v4());

        assert_eq!(response.command, "echo");
        assert!(!response.success);
        assert_eq!(response.result, None);
    }

    #[test]
    fn reply_wire_shape_is_tagged() {
        let reply = Reply::Response(Response::ok("echo".to_string(), uuid::Uuid::new_v4(), json!(42)));
        let encoded = serde_json::to_value(&reply).unwrap();

        assert_eq!(encoded["kind"], "response");
        assert_eq!(encoded["command"], "echo");
        assert_eq!(encoded["result"], 42);

        let started = serde_json::to_string(&Reply::Started).unwrap();
        assert_eq!(started, r#"{"kind":"started"}"#);
    }

    #[test]
    fn missing_parameters_decode_as_empty() {
        let id = uuid::Uuid::new_v4();
        let raw = format!(r#"{{"command":"noop","correlation_id":"{id}","respond":false}}"#);
        let request: Request = serde_json::from_str(&raw).unwrap();

        assert!(request.parameters.is_empty());
        assert!(!request.respond);
    }
}
