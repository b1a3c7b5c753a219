//! Rocketship: a declarative end-to-end testing engine.
//!
//! Suites are written in YAML, compiled by the [`dsl`] module, and executed
//! as in-process workflows ([`engine`]) that sequence plugin activities
//! ([`plugins`]) with retries ([`retry`]), assertions ([`assertions`]), and
//! state chaining ([`saves`], [`state`], [`template`]). The [`rpc`] module
//! exposes the run API over gRPC with per-run log streaming.

pub mod assertions;
pub mod dsl;
pub mod engine;
pub mod errors;
pub mod plugins;
pub mod retry;
pub mod rpc;
pub mod saves;
pub mod state;
pub mod telemetry;
pub mod template;

pub use engine::runs::{LogEntry, RunRecord, RunStatus};
pub use engine::{Engine, EngineConfig};
pub use errors::EngineError;
