use std::cmp::Ordering;
use std::collections::VecDeque;

use tracing::debug;

use crate::exec::block::{BlockCall, ExecContext, ExecutionBlock, Step, Upstream};
use crate::exec::blocks::{emit, expect_rows};
use crate::exec::row::Row;
use crate::primitives::fault::points;
use crate::query::logical::SortElement;
use crate::query::value::{compare_values, NULL};
use crate::types::Result;

/// Orders two rows by `elements`, most significant first.
pub(crate) fn compare_rows(elements: &[SortElement], a: &Row, b: &Row) -> Ordering {
    for element in elements {
        let lhs = a.get(element.variable).unwrap_or(&NULL);
        let rhs = b.get(element.variable).unwrap_or(&NULL);
        let ord = compare_values(lhs, rhs);
        let ord = if element.ascending { ord } else { ord.reverse() };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Buffers every input row, then returns them sorted. The sort is stable.
pub struct SortBlock {
    elements: Vec<SortElement>,
    input: Vec<Row>,
    output: VecDeque<Row>,
    upstream_done: bool,
    sorted: bool,
}

impl SortBlock {
    /// Block sorting by `elements`.
    pub fn new(elements: Vec<SortElement>) -> Self {
        Self {
            elements,
            input: Vec::new(),
            output: VecDeque::new(),
            upstream_done: false,
            sorted: false,
        }
    }
}

impl ExecutionBlock for SortBlock {
    fn kind(&self) -> &'static str {
        "Sort"
    }

    fn step(&mut self, call: BlockCall, input: Option<Upstream>, ctx: &ExecContext) -> Result<Step> {
        if let Some((rows, done)) = expect_rows(self.kind(), input)? {
            self.input.extend(rows);
            self.upstream_done = done;
        }
        if !self.upstream_done {
            return Ok(Step::Pull(BlockCall::Get(ctx.batch_size())));
        }
        if !self.sorted {
            ctx.check_fault(points::SORT_DO_SORTING)?;
            let mut rows = std::mem::take(&mut self.input);
            rows.sort_by(|a, b| compare_rows(&self.elements, a, b));
            debug!(rows = rows.len(), "sorted");
            self.output = rows.into();
            self.sorted = true;
        }
        Ok(emit(call, &mut self.output, true))
    }

    fn reset(&mut self, _seed: &Row) {
        self.input.clear();
        self.output.clear();
        self.upstream_done = false;
        self.sorted = false;
    }
}

/// Skips `offset` rows through upstream `skipSome` calls, then returns at
/// most `count` rows.
pub struct LimitBlock {
    offset: u64,
    count: u64,
    skipped: u64,
    returned: u64,
    upstream_done: bool,
}

impl LimitBlock {
    /// Block for `LIMIT offset, count`.
    pub fn new(offset: u64, count: u64) -> Self {
        Self {
            offset,
            count,
            skipped: 0,
            returned: 0,
            upstream_done: false,
        }
    }

    fn exhausted(&self) -> bool {
        self.upstream_done || self.returned >= self.count
    }
}

impl ExecutionBlock for LimitBlock {
    fn kind(&self) -> &'static str {
        "Limit"
    }

    fn step(&mut self, call: BlockCall, input: Option<Upstream>, _ctx: &ExecContext) -> Result<Step> {
        match input {
            Some(Upstream::Skipped { count, done }) if self.skipped < self.offset => {
                self.skipped += count as u64;
                self.upstream_done = done;
            }
            Some(Upstream::Skipped { count, done }) => {
                self.returned += count as u64;
                self.upstream_done = done;
                return Ok(Step::Skipped {
                    count,
                    done: self.exhausted(),
                });
            }
            Some(Upstream::Rows { rows, done }) => {
                self.returned += rows.len() as u64;
                self.upstream_done = done;
                return Ok(Step::Rows {
                    rows,
                    done: self.exhausted(),
                });
            }
            None => {}
        }
        if self.skipped < self.offset && !self.upstream_done {
            let pending = usize::try_from(self.offset - self.skipped).unwrap_or(usize::MAX);
            return Ok(Step::Pull(BlockCall::Skip(pending)));
        }
        if self.exhausted() {
            return Ok(Step::finished(call));
        }
        let left = usize::try_from(self.count - self.returned).unwrap_or(usize::MAX);
        let wanted = call.count().min(left);
        Ok(Step::Pull(match call {
            BlockCall::Get(_) => BlockCall::Get(wanted),
            BlockCall::Skip(_) => BlockCall::Skip(wanted),
        }))
    }

    fn reset(&mut self, _seed: &Row) {
        self.skipped = 0;
        self.returned = 0;
        self.upstream_done = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing;
    use crate::query::logical::VariableId;
    use serde_json::json;

    fn row(v: serde_json::Value) -> Row {
        Row::new().with(VariableId(0), v)
    }

    #[test]
    fn sort_waits_for_all_input() {
        let storage = testing::storage(vec![]);
        let ctx = testing::context(&storage);
        let mut block = SortBlock::new(vec![SortElement {
            variable: VariableId(0),
            ascending: false,
        }]);
        let first = block
            .step(
                BlockCall::Get(10),
                Some(Upstream::Rows {
                    rows: vec![row(json!(2)), row(json!(9))],
                    done: false,
                }),
                &ctx,
            )
            .expect("first");
        assert!(matches!(first, Step::Pull(BlockCall::Get(_))));
        let second = block
            .step(
                BlockCall::Get(10),
                Some(Upstream::Rows {
                    rows: vec![row(json!(null)), row(json!(5))],
                    done: true,
                }),
                &ctx,
            )
            .expect("second");
        match second {
            Step::Rows { rows, done } => {
                assert!(done);
                let values: Vec<_> = rows.iter().map(|r| r.get(VariableId(0)).cloned()).collect();
                assert_eq!(
                    values,
                    vec![Some(json!(9)), Some(json!(5)), Some(json!(2)), Some(json!(null))]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sort_fault_fires_before_output() {
        let storage = testing::storage(vec![]);
        let ctx = testing::context(&storage);
        ctx.faults().arm(points::SORT_DO_SORTING);
        let mut block = SortBlock::new(vec![]);
        let err = block
            .step(
                BlockCall::Get(1),
                Some(Upstream::Rows {
                    rows: vec![],
                    done: true,
                }),
                &ctx,
            )
            .expect_err("fault");
        assert_eq!(err.code(), 22);
    }

    #[test]
    fn limit_skips_offset_then_caps_count() {
        let storage = testing::storage(vec![]);
        let ctx = testing::context(&storage);
        let mut block = LimitBlock::new(3, 2);
        assert!(matches!(
            block.step(BlockCall::Get(100), None, &ctx).expect("offset"),
            Step::Pull(BlockCall::Skip(3))
        ));
        assert!(matches!(
            block
                .step(
                    BlockCall::Get(100),
                    Some(Upstream::Skipped { count: 3, done: false }),
                    &ctx
                )
                .expect("after skip"),
            Step::Pull(BlockCall::Get(2))
        ));
        let step = block
            .step(
                BlockCall::Get(100),
                Some(Upstream::Rows {
                    rows: vec![row(json!(1)), row(json!(2))],
                    done: false,
                }),
                &ctx,
            )
            .expect("rows");
        assert!(matches!(step, Step::Rows { ref rows, done: true } if rows.len() == 2));
    }

    #[test]
    fn limit_zero_returns_nothing() {
        let storage = testing::storage(vec![]);
        let ctx = testing::context(&storage);
        let mut block = LimitBlock::new(0, 0);
        assert!(matches!(
            block.step(BlockCall::Get(5), None, &ctx).expect("get"),
            Step::Rows { ref rows, done: true } if rows.is_empty()
        ));
    }
}
