//! External process execution and agent invocation.
//!
//! # Architecture
//!
//! ```text
//! Workspace → AgentInvoker → ProcessRunner → agent binary → git diff
//! ```
//!
//! Every external program (git, the agent, the test suite) is launched through
//! the [`ProcessRunner`] trait with a hard wall-clock deadline. The
//! [`AgentInvoker`] builds the task prompt and command line for one attempt
//! and reports what the run left behind.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use swe_eval::config::EvalConfig;
//! use swe_eval::runner::{AgentInvoker, SystemProcessRunner};
//!
//! let config = EvalConfig::default().with_agent_binary("/usr/local/bin/sage");
//! let invoker = AgentInvoker::new(Arc::new(SystemProcessRunner::new()), &config);
//! let outcome = invoker.invoke(&workspace, &instance.problem_statement, 0, false).await;
//! println!("exit: {:?}, trajectory: {:?}", outcome.exit_code, outcome.trajectory_file);
//! ```

pub mod agent;
pub mod process;

pub use agent::{build_prompt, locate_binary, AgentInvoker, InvocationOutcome};
pub use process::{CommandSpec, ProcessOutput, ProcessRunner, SystemProcessRunner};
