//! Static mapping from function name to business-logic handler

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{Arguments, FunctionName};
use crate::errors::{Result, SessionError};
use crate::types::{CallId, CallerMetadata};

/// Failure reported by a business-logic collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    /// The requested record does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// The arguments were understood but rejected
    #[error("invalid request: {0}")]
    Invalid(String),
    /// The backing service could not be reached
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::NotFound(_) => "not_found",
            ToolError::Invalid(_) => "invalid",
            ToolError::Unavailable(_) => "unavailable",
        }
    }
}

/// What a handler knows about the call it serves
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub call_id: CallId,
    /// Engine-assigned id of this function call
    pub function_call_id: String,
    pub caller: CallerMetadata,
}

/// Business-logic collaborator for one function
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, ctx: &ToolContext, args: &Arguments) -> std::result::Result<Value, ToolError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(ToolContext, Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, ToolError>> + Send + 'static,
{
    async fn invoke(&self, ctx: &ToolContext, args: &Arguments) -> std::result::Result<Value, ToolError> {
        (self.0)(ctx.clone(), args.clone()).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(ToolContext, Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, ToolError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handlers keyed by function name
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    handlers: HashMap<FunctionName, Arc<dyn ToolHandler>>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("handlers", &names).finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the name
    pub fn register(&mut self, name: FunctionName, handler: Arc<dyn ToolHandler>) -> &mut Self {
        self.handlers.insert(name, handler);
        self
    }

    pub fn with(mut self, name: FunctionName, handler: Arc<dyn ToolHandler>) -> Self {
        self.register(name, handler);
        self
    }

    pub fn resolve(&self, name: FunctionName) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(&name).cloned()
    }

    pub fn contains(&self, name: FunctionName) -> bool {
        self.handlers.contains_key(&name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Check every advertised function has a handler
    pub fn validate(&self, advertised: &[FunctionName]) -> Result<()> {
        let missing: Vec<String> = advertised
            .iter()
            .filter(|name| !self.contains(**name))
            .map(|name| name.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SessionError::config(format!(
                "no handler registered for advertised function(s): {}",
                missing.join(", ")
            )))
        }
    }

    /// Tool definitions for the advertised functions, in advertised order
    pub fn tool_schemas(&self, advertised: &[FunctionName]) -> Vec<Value> {
        advertised.iter().map(FunctionName::schema).collect()
    }
}
