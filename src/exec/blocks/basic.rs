use std::collections::VecDeque;

use crate::exec::block::{BlockCall, ExecContext, ExecutionBlock, Step, Upstream};
use crate::exec::blocks::{RowTransform, TransformBlock};
use crate::exec::row::Row;
use crate::types::Result;

/// Emits its seed row once.
#[derive(Default)]
pub struct SingletonBlock {
    seed: Row,
    emitted: bool,
}

impl SingletonBlock {
    /// Singleton seeded with an empty row.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionBlock for SingletonBlock {
    fn kind(&self) -> &'static str {
        "Singleton"
    }

    fn step(&mut self, call: BlockCall, _input: Option<Upstream>, _ctx: &ExecContext) -> Result<Step> {
        if self.emitted {
            return Ok(Step::finished(call));
        }
        self.emitted = true;
        Ok(match call {
            BlockCall::Get(_) => Step::Rows {
                rows: vec![self.seed.clone()],
                done: true,
            },
            BlockCall::Skip(_) => Step::Skipped {
                count: 1,
                done: true,
            },
        })
    }

    fn reset(&mut self, seed: &Row) {
        self.seed = seed.clone();
        self.emitted = false;
    }
}

/// Produces nothing and never pulls.
#[derive(Default)]
pub struct NoResultsBlock;

impl ExecutionBlock for NoResultsBlock {
    fn kind(&self) -> &'static str {
        "NoResults"
    }

    fn step(&mut self, call: BlockCall, _input: Option<Upstream>, _ctx: &ExecContext) -> Result<Step> {
        Ok(Step::finished(call))
    }
}

/// Forwards rows unchanged under the name of the node it stands in for.
pub struct Forward {
    kind: &'static str,
}

impl RowTransform for Forward {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn process(&mut self, rows: Vec<Row>, out: &mut VecDeque<Row>, _ctx: &ExecContext) -> Result<()> {
        out.extend(rows);
        Ok(())
    }

    fn skips_through(&self) -> bool {
        true
    }
}

/// Scatter, Remote or Gather over a collection with a single shard.
pub type PassThroughBlock = TransformBlock<Forward>;

impl TransformBlock<Forward> {
    /// Pass-through block reporting `kind`.
    pub fn pass_through(kind: &'static str) -> Self {
        Self::from_transform(Forward { kind })
    }
}

/// Root of a read query. The tree extracts the returned variable from its
/// rows, so the block only hands them on.
#[derive(Default)]
pub struct Returning;

impl RowTransform for Returning {
    fn kind(&self) -> &'static str {
        "Return"
    }

    fn process(&mut self, rows: Vec<Row>, out: &mut VecDeque<Row>, _ctx: &ExecContext) -> Result<()> {
        out.extend(rows);
        Ok(())
    }

    fn skips_through(&self) -> bool {
        true
    }
}

/// Return node.
pub type ReturnBlock = TransformBlock<Returning>;

impl TransformBlock<Returning> {
    /// Return block.
    pub fn new() -> Self {
        Self::from_transform(Returning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing;
    use crate::query::logical::VariableId;
    use serde_json::json;

    #[test]
    fn singleton_emits_seed_once() {
        let storage = testing::storage(vec![]);
        let ctx = testing::context(&storage);
        let mut block = SingletonBlock::new();
        block.reset(&Row::new().with(VariableId(1), json!("seed")));
        match block.step(BlockCall::Get(10), None, &ctx).expect("get") {
            Step::Rows { rows, done } => {
                assert!(done);
                assert_eq!(rows[0].get(VariableId(1)), Some(&json!("seed")));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            block.step(BlockCall::Skip(1), None, &ctx).expect("skip"),
            Step::Skipped { count: 0, done: true }
        ));
    }

    #[test]
    fn no_results_never_pulls() {
        let storage = testing::storage(vec![]);
        let ctx = testing::context(&storage);
        let mut block = NoResultsBlock;
        assert!(matches!(
            block.step(BlockCall::Get(5), None, &ctx).expect("get"),
            Step::Rows { ref rows, done: true } if rows.is_empty()
        ));
    }

    #[test]
    fn pass_through_forwards_skips() {
        let storage = testing::storage(vec![]);
        let ctx = testing::context(&storage);
        let mut block = PassThroughBlock::pass_through("Gather");
        assert_eq!(block.kind(), "Gather");
        assert!(matches!(
            block.step(BlockCall::Skip(4), None, &ctx).expect("skip"),
            Step::Pull(BlockCall::Skip(4))
        ));
        assert!(matches!(
            block
                .step(
                    BlockCall::Skip(4),
                    Some(Upstream::Skipped { count: 3, done: true }),
                    &ctx
                )
                .expect("answer"),
            Step::Skipped { count: 3, done: true }
        ));
    }

    #[test]
    fn return_block_hands_rows_on() {
        let storage = testing::storage(vec![]);
        let ctx = testing::context(&storage);
        let mut block = ReturnBlock::new();
        assert_eq!(block.kind(), "Return");
        let rows = vec![Row::new().with(VariableId(2), json!(7))];
        match block
            .step(
                BlockCall::Get(3),
                Some(Upstream::Rows { rows, done: true }),
                &ctx,
            )
            .expect("answer")
        {
            Step::Rows { rows, done } => {
                assert!(done);
                assert_eq!(rows[0].get(VariableId(2)), Some(&json!(7)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
