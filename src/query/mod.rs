#![forbid(unsafe_code)]

//! Plan model, cost model and optimizer.
//!
//! A query arrives as a validated [`logical::Plan`], is rewritten by the
//! [`optimizer`] using the [`estimator`] and handed to the execution layer.

/// Document values and their ordering.
pub mod value;

/// Calculation expressions.
///
/// Evaluation plus the static analysis the optimizer relies on.
pub mod expr;

/// Built-in function registry.
pub mod functions;

/// Plan node model.
pub mod logical;

/// Fluent plan construction.
pub mod builder;

/// Collection and index metadata.
///
/// Snapshotted once per query so planning and execution agree.
pub mod metadata;

/// Index ranking and cost estimation.
pub mod estimator;

/// Rule engine and built-in rules.
pub mod optimizer;

/// Explain output and plan hashing.
pub mod explain;

/// Performance profiling for query operations.
///
/// Collects timing and count statistics to identify performance bottlenecks.
pub mod profile;

pub use builder::PlanBuilder;
pub use explain::PlanExplain;
pub use logical::Plan;
pub use optimizer::{Optimizer, OptimizerOutput};
