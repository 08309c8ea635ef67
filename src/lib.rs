//! Rule-based query optimizer and pull-based execution pipeline for a sharded
//! document store.
//!
//! A validated [`query::logical::Plan`] is optimized by [`query::optimizer::Optimizer`],
//! compiled into a tree of execution blocks and driven batch by batch by
//! [`exec::Executor`]. Sharded collections are executed through the
//! [`cluster`] layer.

#![warn(missing_docs)]

pub mod cluster;
pub mod config;
pub mod exec;
pub mod primitives;
pub mod query;
pub mod storage;
pub mod types;

pub use config::{EngineConfig, QueryOptions};
pub use exec::{Executor, QueryResult, ResultStream, WriteSummary};
pub use query::builder::PlanBuilder;
pub use query::logical::Plan;
pub use types::{AqlError, ErrorCategory, Result};
