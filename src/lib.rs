//! Dossier: plan-driven document analysis.
//!
//! A validated [`plan::ExecutionPlan`] is resolved into a dependency graph
//! of phases. Each phase runs one operation or a chain of operations against
//! the input documents, either once over everything or once per item, and
//! every completion call is checkpointed so an interrupted job resumes
//! without repeating finished work.

pub mod completion;
pub mod config;
pub mod context;
pub mod dag;
pub mod errors;
pub mod jobs;
pub mod plan;
pub mod pool;
pub mod runner;
pub mod server;
pub mod telemetry;
