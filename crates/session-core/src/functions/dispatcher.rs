//! Function-call validation, execution and result shaping
//!
//! A call is first prepared synchronously: unknown names and malformed
//! arguments are rejected there without touching a handler. Prepared calls
//! are then executed under the configured timeout. Every path ends in a
//! resolved [`FunctionCallRequest`] whose payload goes back to the engine;
//! nothing here returns an error to the session.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{Arguments, FunctionName, FunctionRegistry, ToolContext, ToolHandler};
use crate::errors::{Result, SessionError};
use crate::protocol::EngineCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunctionCallStatus {
    Pending,
    Completed,
    Failed,
    TimedOut,
}

/// One tool call from the engine and, once resolved, its result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionCallRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: Arguments,
    pub status: FunctionCallStatus,
    /// Result or error payload; `None` while pending
    pub outcome: Option<Value>,
}

impl FunctionCallRequest {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
            status: FunctionCallStatus::Pending,
            outcome: None,
        }
    }

    fn resolve(mut self, status: FunctionCallStatus, payload: Value) -> Self {
        self.status = status;
        self.outcome = Some(payload);
        self
    }

    fn fail(self, status: FunctionCallStatus, kind: &str, message: impl fmt::Display) -> Self {
        let payload = error_payload(kind, message);
        self.resolve(status, payload)
    }

    pub fn is_pending(&self) -> bool {
        self.status == FunctionCallStatus::Pending
    }

    /// Payload delivered to the engine
    pub fn output(&self) -> Value {
        self.outcome.clone().unwrap_or(Value::Null)
    }

    /// Commands that hand the result back and let the engine continue
    pub fn result_commands(&self) -> [EngineCommand; 2] {
        [
            EngineCommand::function_output(self.call_id.clone(), &self.output()),
            EngineCommand::create_response(),
        ]
    }

    /// The failure as a session error, for logging
    pub fn error(&self) -> Option<SessionError> {
        match self.status {
            FunctionCallStatus::Pending | FunctionCallStatus::Completed => None,
            FunctionCallStatus::Failed | FunctionCallStatus::TimedOut => {
                let details = self
                    .outcome
                    .as_ref()
                    .and_then(|v| v.pointer("/error/message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown failure");
                Some(SessionError::function_failed(&self.name, details))
            }
        }
    }
}

/// `{"error": {"kind": .., "message": ..}}`
pub fn error_payload(kind: &str, message: impl fmt::Display) -> Value {
    json!({"error": {"kind": kind, "message": message.to_string()}})
}

/// A validated call ready to run
pub struct ReadyCall {
    pub request: FunctionCallRequest,
    pub function: FunctionName,
    handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for ReadyCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyCall")
            .field("request", &self.request)
            .field("function", &self.function)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum Prepared {
    Ready(ReadyCall),
    /// Rejected before reaching a handler; already resolved
    Rejected(FunctionCallRequest),
}

pub struct FunctionDispatcher {
    registry: FunctionRegistry,
    enabled: HashSet<FunctionName>,
    advertised: Vec<FunctionName>,
    timeout: Duration,
}

impl fmt::Debug for FunctionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDispatcher")
            .field("registry", &self.registry)
            .field("advertised", &self.advertised)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl FunctionDispatcher {
    /// Build a dispatcher for the advertised functions
    ///
    /// Fails if any advertised function lacks a handler.
    pub fn new(registry: FunctionRegistry, advertised: Vec<FunctionName>, timeout: Duration) -> Result<Self> {
        registry.validate(&advertised)?;
        Ok(Self {
            enabled: advertised.iter().copied().collect(),
            registry,
            advertised,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn advertised(&self) -> &[FunctionName] {
        &self.advertised
    }

    /// Tool definitions for `session.update`
    pub fn tool_schemas(&self) -> Vec<Value> {
        self.registry.tool_schemas(&self.advertised)
    }

    /// Validate a tool-call event
    pub fn prepare(&self, call_id: &str, name: &str, raw_arguments: &str) -> Prepared {
        let function = match FunctionName::from_str(name) {
            Ok(function) if self.enabled.contains(&function) => function,
            _ => {
                let request = FunctionCallRequest::new(call_id, name, Arguments::default());
                return Prepared::Rejected(request.fail(
                    FunctionCallStatus::Failed,
                    "unsupported_function",
                    format!("function '{}' is not supported", name),
                ));
            }
        };

        let arguments = match Arguments::parse_for(function, raw_arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                let request = FunctionCallRequest::new(call_id, name, Arguments::default());
                return Prepared::Rejected(request.fail(FunctionCallStatus::Failed, "invalid_arguments", e));
            }
        };

        let request = FunctionCallRequest::new(call_id, function.as_ref(), arguments);
        match self.registry.resolve(function) {
            Some(handler) => Prepared::Ready(ReadyCall {
                request,
                function,
                handler,
            }),
            None => Prepared::Rejected(request.fail(
                FunctionCallStatus::Failed,
                "unsupported_function",
                format!("no handler for '{}'", name),
            )),
        }
    }

    /// Run a prepared call under the timeout
    pub async fn execute(&self, ctx: ToolContext, call: ReadyCall) -> FunctionCallRequest {
        let ReadyCall { request, function, handler } = call;
        debug!(call_id = %ctx.call_id, function = %function, function_call_id = %request.call_id, "invoking function");

        let result = tokio::time::timeout(self.timeout, handler.invoke(&ctx, &request.arguments)).await;
        match result {
            Ok(Ok(result)) => request.resolve(FunctionCallStatus::Completed, result),
            Ok(Err(e)) => {
                warn!(call_id = %ctx.call_id, function = %function, error = %e, "function failed");
                let kind = e.kind();
                request.fail(FunctionCallStatus::Failed, kind, e)
            }
            Err(_) => {
                warn!(call_id = %ctx.call_id, function = %function, timeout = ?self.timeout, "function timed out");
                let message = format!("{} did not complete within {} ms", function, self.timeout.as_millis());
                request.fail(FunctionCallStatus::TimedOut, "timed_out", message)
            }
        }
    }

    /// Prepare and execute in one step
    pub async fn dispatch(&self, ctx: ToolContext, name: &str, raw_arguments: &str) -> FunctionCallRequest {
        let call_id = ctx.function_call_id.clone();
        match self.prepare(&call_id, name, raw_arguments) {
            Prepared::Ready(call) => self.execute(ctx, call).await,
            Prepared::Rejected(request) => request,
        }
    }
}
