//! Orchestrated multi-agent task runner.
//!
//! Given a free-text goal, an [`runner_orchestrator::Orchestrator`] either
//! reuses a previously successful plan or asks a generative model to build
//! one, executes it step by step through a fixed registry of sub-agents, and
//! learns from the outcome. See `SPEC_FULL.md` for the full design.
//!
//! The storage layer and data model (`storage`, `model`, `embedding`,
//! `config`, `error`) are always available. Everything that drives the
//! planner/executor/learner loop itself — the generative model client,
//! sub-agents, planner, reuse gate, executor, learner, and CLI — requires the
//! `runtime` feature (enabled by default).

#![warn(missing_docs)]

pub mod config;
pub mod embedding;
pub mod error;
pub mod model;
pub mod storage;

#[cfg(feature = "runtime")]
pub mod executor_runtime;
#[cfg(feature = "runtime")]
pub mod learner;
#[cfg(feature = "runtime")]
pub mod llm;
#[cfg(feature = "runtime")]
pub mod planner;
#[cfg(feature = "runtime")]
pub mod reuse;
#[cfg(feature = "runtime")]
pub mod runner_orchestrator;
#[cfg(feature = "runtime")]
pub mod subagents;

#[cfg(feature = "runtime")]
pub mod cli;
