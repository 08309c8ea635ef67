//! Low-level primitives shared by the planner and the runtime.

/// Deterministic fault injection.
///
/// Named points compiled into the execution blocks that fail on demand.
pub mod fault;
