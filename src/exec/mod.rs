//! Pull-based execution.
//!
//! A plan is compiled into a [`BlockTree`] with one block per plan node.
//! The consumer pulls batches from the root; every block pulls from its
//! upstream only as much as it needs, through `getSome`/`skipSome` calls
//! driven without recursion.

pub mod block;
pub mod blocks;
pub mod compiler;
pub mod driver;
pub mod executor;
pub mod row;
pub mod summary;

#[cfg(test)]
pub(crate) mod testing;

pub use block::{BlockCall, BlockState, ExecContext, ExecutionBlock, Step, Upstream};
pub use compiler::compile;
pub use driver::{BlockStats, BlockTree};
pub use executor::{Executor, QueryResult, ResultStream};
pub use row::Row;
pub use summary::{WriteError, WriteSummary};
