//! Loop ordering.

use super::PlanEdit;
use crate::query::logical::{NodeKind, Pipeline, Plan, VarList};
use crate::query::optimizer::{Rule, RuleContext};
use crate::types::Result;

/// Offers every ordering of adjacent, independent collection loops as an
/// alternative plan. The cost model then picks the cheapest nesting, which
/// matters once later rules turn the inner loop into an index lookup.
pub struct InterchangeAdjacentEnumerations;

impl Rule for InterchangeAdjacentEnumerations {
    fn name(&self) -> &'static str {
        "interchange-adjacent-enumerations"
    }

    fn pass(&self) -> u32 {
        35
    }

    fn offers_alternatives(&self) -> bool {
        true
    }

    fn apply(&self, plan: &Plan, ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        let limit = ctx.config.max_plans.saturating_sub(1);
        for scope in plan.scopes() {
            let Some(pipeline) = plan.pipeline(&scope) else {
                continue;
            };
            let runs = loop_runs(pipeline);
            if runs.is_empty() {
                continue;
            }
            let mut order: Vec<usize> = runs.iter().flatten().copied().collect();
            let positions = order.clone();
            let mut plans = Vec::new();
            while plans.len() < limit && next_ordering(&mut order, &runs) {
                let mut edit = PlanEdit::new(plan, &scope, pipeline);
                let original = edit.nodes.clone();
                for (slot, from) in positions.iter().zip(&order) {
                    edit.nodes[*slot] = original[*from].clone();
                }
                plans.push(edit.finish());
            }
            return Ok(plans);
        }
        Ok(Vec::new())
    }
}

/// Maximal runs of two or more adjacent full scans that do not read each
/// other's documents, as node positions.
fn loop_runs(pipeline: &Pipeline) -> Vec<Vec<usize>> {
    let mut runs = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut produced = VarList::new();
    for (idx, node) in pipeline.nodes().iter().enumerate() {
        let independent = matches!(node.kind, NodeKind::EnumerateCollection { .. })
            && !node
                .kind
                .input_variables()
                .iter()
                .any(|v| produced.contains(v));
        if independent {
            current.push(idx);
            produced.extend(node.kind.output_variables());
            continue;
        }
        if current.len() > 1 {
            runs.push(std::mem::take(&mut current));
        }
        current.clear();
        produced.clear();
        if matches!(node.kind, NodeKind::EnumerateCollection { .. }) {
            current.push(idx);
            produced.extend(node.kind.output_variables());
        }
    }
    if current.len() > 1 {
        runs.push(current);
    }
    runs
}

/// Advances `order` to the next combination of per-run permutations in
/// lexicographic order. Returns false once every combination was produced.
fn next_ordering(order: &mut [usize], runs: &[Vec<usize>]) -> bool {
    let mut end = order.len();
    for run in runs.iter().rev() {
        let start = end - run.len();
        if next_permutation(&mut order[start..end]) {
            return true;
        }
        end = start;
    }
    false
}

/// Rearranges `items` into the next lexicographic permutation, wrapping to the
/// first one and returning false after the last.
fn next_permutation(items: &mut [usize]) -> bool {
    let Some(pivot) = items.windows(2).rposition(|w| w[0] < w[1]) else {
        items.reverse();
        return false;
    };
    let Some(successor) = items.iter().rposition(|v| *v > items[pivot]) else {
        return false;
    };
    items.swap(pivot, successor);
    items[pivot + 1..].reverse();
    true
}
