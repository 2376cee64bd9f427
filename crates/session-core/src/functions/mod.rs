//! Function (tool) calls from the engine
//!
//! The set of callable functions is the closed [`FunctionName`] enum. A
//! [`FunctionRegistry`] binds each name to a [`ToolHandler`] and is checked
//! against the advertised list when the dispatcher is built, so a typo or a
//! missing handler fails at startup instead of mid-call.

mod arguments;
mod dispatcher;
mod name;
mod registry;

pub use arguments::{ArgValue, ArgumentError, Arguments};
pub use dispatcher::{
    FunctionCallRequest, FunctionCallStatus, FunctionDispatcher, Prepared, ReadyCall, error_payload,
};
pub use name::FunctionName;
pub use registry::{FunctionRegistry, ToolContext, ToolError, ToolHandler, handler_fn};
