#![forbid(unsafe_code)]

//! Instrumented sandbox engine for pulse assertion scripts.
//!
//! An assertion arrives as base64 source of `function main(params) {...}`.
//! [`decoder`] extracts the body, [`instrumentor`] parses it into an
//! [`ast`] and injects probes, and [`sandbox_executor`] runs the result in
//! the [`interpreter`] against a shared [`CapabilityContext`].
//! [`test_orchestrator`] sequences many assertions into one [`RunReport`].

pub mod ast;
mod builtins;
pub mod capability_context;
pub mod config;
pub mod decoder;
pub mod error;
pub mod input;
pub mod instrumentor;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod printer;
pub mod sandbox_executor;
pub mod template;
pub mod test_orchestrator;
pub mod value;

pub use capability_context::{CapabilityContext, CapabilityError, ConfigurationError};
pub use config::{ConfigError, EngineConfig};
pub use decoder::{SourceBody, decode, encode_source};
pub use error::AssertionError;
pub use input::{AssertionSpec, InputError, RunInput};
pub use instrumentor::{ConditionSite, InstrumentedBody, instrument};
pub use interpreter::ExecutionLimits;
pub use parser::{ParseError, ParseErrorCode};
pub use sandbox_executor::{AssertionResult, ConditionRecord, execute_payload};
pub use test_orchestrator::{
    OrchestratorEvent, RunReport, RunState, TestOrchestrator, TestResult, render_summary, run_tests,
};
