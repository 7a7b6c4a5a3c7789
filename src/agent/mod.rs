//! External agent invocation — batch and streaming modes, timeout recovery,
//! process supervision, prompt composition and lifecycle hooks.

pub mod batch;
pub mod hooks;
pub mod invoker;
pub mod process;
pub mod prompt;
pub mod recovery;
pub mod stream;
pub mod types;

pub use invoker::AgentInvoker;
pub use process::ProcessSupervisor;
pub use recovery::TimeoutRecovery;
pub use types::{AgentBackend, InvocationResult, InvokeOptions, SessionHandle, ToolUseEntry};
