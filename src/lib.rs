//! Marvin: a Signal group bot bridging signal-cli's JSON-RPC daemon, an
//! OpenAI-compatible LLM endpoint, and an idempotent weekly poll
//! scheduler.

pub mod config;
pub mod history;
pub mod llm;
pub mod poll;
pub mod responder;
pub mod runtime;
pub mod scheduler;
pub mod signal;
