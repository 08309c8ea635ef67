//! Index selection rules.

use std::cmp::Ordering;

use super::{available_at, first_rewrite, needed_paths, producer_calculation, sort_paths, PlanEdit};
use crate::query::estimator::{extract_constraints, sort_order, ConstraintKind};
use crate::query::expr::Expression;
use crate::query::logical::{
    FieldLookup, IndexCondition, NodeKind, Pipeline, Plan, SortElement, VariableId,
};
use crate::query::metadata::IndexDescriptor;
use crate::query::optimizer::{Rule, RuleContext};
use crate::query::value::{compare_values, Value};
use crate::types::Result;

/// Replaces a full collection scan by an index scan, one candidate plan per
/// usable index in ranking order.
pub struct UseIndexes;

impl Rule for UseIndexes {
    fn name(&self) -> &'static str {
        "use-indexes"
    }

    fn pass(&self) -> u32 {
        40
    }

    fn apply(&self, plan: &Plan, ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        for scope in plan.scopes() {
            let Some(pipeline) = plan.pipeline(&scope) else {
                continue;
            };
            for (idx, node) in pipeline.nodes().iter().enumerate() {
                let NodeKind::EnumerateCollection {
                    collection,
                    out,
                    projections,
                    filter,
                } = &node.kind
                else {
                    continue;
                };
                let info = ctx.estimator.metadata().get(collection)?;
                let conjuncts = scan_conjuncts(pipeline, idx, filter.as_ref());
                let constraints: Vec<_> = extract_constraints(*out, &conjuncts)
                    .into_iter()
                    .filter(|c| {
                        let value = match &c.kind {
                            ConstraintKind::Eq(v) | ConstraintKind::In(v) => v,
                            ConstraintKind::Lower { value, .. } | ConstraintKind::Upper { value, .. } => {
                                value
                            }
                        };
                        value.is_deterministic()
                            && !value.can_throw()
                            && value.variables().iter().all(|v| available_at(pipeline, *v, idx))
                    })
                    .collect();
                if constraints.is_empty() {
                    continue;
                }
                let needed = needed_paths(pipeline, idx, *out);
                let sort = pending_sort(pipeline, idx)
                    .and_then(|elements| sort_paths(pipeline, elements, *out))
                    .unwrap_or_default();
                let candidates =
                    ctx.estimator
                        .rank_indexes(info, &constraints, needed.as_deref(), &sort);
                if candidates.is_empty() {
                    continue;
                }
                let plans = candidates
                    .into_iter()
                    .take(ctx.config.max_plans.max(1))
                    .map(|candidate| {
                        let mut edit = PlanEdit::new(plan, &scope, pipeline);
                        edit.replace(
                            idx,
                            NodeKind::IndexScan {
                                collection: collection.clone(),
                                index: candidate.index,
                                condition: candidate.condition,
                                out: *out,
                                projections: projections.clone(),
                                covering: false,
                                filter: filter.clone(),
                                reverse: false,
                            },
                        );
                        edit.finish()
                    })
                    .collect();
                return Ok(plans);
            }
        }
        Ok(Vec::new())
    }
}

/// Filter conjuncts that apply to every row leaving the scan at `idx`.
fn scan_conjuncts(pipeline: &Pipeline, idx: usize, own: Option<&Expression>) -> Vec<Expression> {
    let mut out: Vec<Expression> = own
        .map(|f| f.conjuncts().into_iter().cloned().collect())
        .unwrap_or_default();
    for node in pipeline.nodes().iter().skip(idx + 1) {
        match &node.kind {
            NodeKind::Filter { input } => {
                if let Some((_, expr)) = producer_calculation(pipeline, *input) {
                    out.extend(expr.conjuncts().into_iter().cloned());
                }
            }
            NodeKind::Limit { .. } | NodeKind::Collect { .. } | NodeKind::Modify { .. } => break,
            _ => {}
        }
    }
    out
}

/// First Sort after `idx` that sees every row of the scan.
fn pending_sort(pipeline: &Pipeline, idx: usize) -> Option<&[SortElement]> {
    for node in pipeline.nodes().iter().skip(idx + 1) {
        match &node.kind {
            NodeKind::Sort { elements } => return Some(elements),
            NodeKind::Limit { .. } | NodeKind::Collect { .. } | NodeKind::Modify { .. } => {
                return None
            }
            _ => {}
        }
    }
    None
}

/// Removes a Sort that the outermost scan of a pipeline already produces in
/// order. A full collection scan is turned into a full-range scan over a
/// sorted index for this purpose.
pub struct UseIndexForSort;

impl Rule for UseIndexForSort {
    fn name(&self) -> &'static str {
        "use-index-for-sort"
    }

    fn pass(&self) -> u32 {
        45
    }

    fn apply(&self, plan: &Plan, ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        first_rewrite(plan, |scope, pipeline| {
            let nodes = pipeline.nodes();
            let Some(idx) = nodes.iter().position(|n| n.kind.is_loop()) else {
                return Ok(None);
            };
            let Some(collection) = nodes[idx].kind.scanned_collection() else {
                return Ok(None);
            };
            let info = ctx.estimator.metadata().get(collection)?;
            if ctx.config.cluster && info.is_sharded() {
                return Ok(None);
            }
            let mut sort_idx = None;
            for (j, node) in nodes.iter().enumerate().skip(idx + 1) {
                match &node.kind {
                    NodeKind::Sort { .. } => {
                        sort_idx = Some(j);
                        break;
                    }
                    NodeKind::Calculation { .. }
                    | NodeKind::Filter { .. }
                    | NodeKind::Subquery { .. }
                    | NodeKind::Materialize { .. } => {}
                    _ => break,
                }
            }
            let Some(sort_idx) = sort_idx else {
                return Ok(None);
            };
            let NodeKind::Sort { elements } = &nodes[sort_idx].kind else {
                return Ok(None);
            };
            let rewritten = match &nodes[idx].kind {
                NodeKind::IndexScan {
                    collection,
                    index,
                    condition,
                    out,
                    projections,
                    covering,
                    filter,
                    ..
                } => {
                    let Some(sort) = sort_paths(pipeline, elements, *out) else {
                        return Ok(None);
                    };
                    let Some(reverse) = sort_order(index, condition, &sort) else {
                        return Ok(None);
                    };
                    NodeKind::IndexScan {
                        collection: collection.clone(),
                        index: index.clone(),
                        condition: condition.clone(),
                        out: *out,
                        projections: projections.clone(),
                        covering: *covering,
                        filter: filter.clone(),
                        reverse,
                    }
                }
                NodeKind::EnumerateCollection {
                    collection,
                    out,
                    projections,
                    filter,
                } => {
                    let Some(sort) = sort_paths(pipeline, elements, *out) else {
                        return Ok(None);
                    };
                    let full = IndexCondition::default();
                    let Some((index, reverse)) = info.indexes.iter().find_map(|index| {
                        if !index.kind.is_sorted() || index.sparse {
                            return None;
                        }
                        sort_order(index, &full, &sort).map(|reverse| (index, reverse))
                    }) else {
                        return Ok(None);
                    };
                    NodeKind::IndexScan {
                        collection: collection.clone(),
                        index: index.clone(),
                        condition: full,
                        out: *out,
                        projections: projections.clone(),
                        covering: false,
                        filter: filter.clone(),
                        reverse,
                    }
                }
                _ => return Ok(None),
            };
            let mut edit = PlanEdit::new(plan, scope, pipeline);
            edit.nodes.remove(sort_idx);
            edit.replace(idx, rewritten);
            Ok(Some(edit.finish()))
        })
    }
}

/// Removes filters whose condition the index lookup of a preceding index
/// scan already guarantees.
pub struct RemoveFiltersCoveredByIndex;

impl Rule for RemoveFiltersCoveredByIndex {
    fn name(&self) -> &'static str {
        "remove-filters-covered-by-index"
    }

    fn pass(&self) -> u32 {
        45
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        first_rewrite(plan, |scope, pipeline| {
            let nodes = pipeline.nodes();
            for (idx, node) in nodes.iter().enumerate() {
                let NodeKind::IndexScan {
                    index,
                    condition,
                    out,
                    ..
                } = &node.kind
                else {
                    continue;
                };
                for (fidx, later) in nodes.iter().enumerate().skip(idx + 1) {
                    let NodeKind::Filter { input } = later.kind else {
                        continue;
                    };
                    let Some((pidx, expr)) = producer_calculation(pipeline, input) else {
                        continue;
                    };
                    if pidx < idx {
                        continue;
                    }
                    let redundant = condition.covered.contains(expr)
                        || implied_by_lookup(index, condition, *out, expr);
                    if redundant {
                        let mut edit = PlanEdit::new(plan, scope, pipeline);
                        edit.nodes.remove(fidx);
                        return Ok(Some(edit.finish()));
                    }
                }
            }
            Ok(None)
        })
    }
}

/// True if every document the lookup returns satisfies `expr`.
fn implied_by_lookup(
    index: &IndexDescriptor,
    condition: &IndexCondition,
    doc: VariableId,
    expr: &Expression,
) -> bool {
    let constraints = extract_constraints(doc, std::slice::from_ref(expr));
    let [constraint] = constraints.as_slice() else {
        return false;
    };
    let Some(lookup) = index
        .fields
        .iter()
        .position(|field| field == &constraint.path)
        .and_then(|pos| condition.lookups.get(pos))
    else {
        return false;
    };
    let constant = |e: &Expression| e.as_constant().cloned();
    match (&constraint.kind, lookup) {
        (ConstraintKind::Eq(want), FieldLookup::Eq { value }) => {
            matches!((constant(want), constant(value)), (Some(a), Some(b)) if compare_values(&a, &b) == Ordering::Equal)
        }
        (ConstraintKind::Lower { value: want, inclusive }, FieldLookup::Eq { value }) => {
            bound_holds(constant(value), constant(want), *inclusive, true, Ordering::Greater)
        }
        (ConstraintKind::Upper { value: want, inclusive }, FieldLookup::Eq { value }) => {
            bound_holds(constant(value), constant(want), *inclusive, true, Ordering::Less)
        }
        (
            ConstraintKind::Lower { value: want, inclusive },
            FieldLookup::Range {
                lower: Some(bound), ..
            },
        ) => bound_holds(
            constant(&bound.value),
            constant(want),
            *inclusive,
            bound.inclusive,
            Ordering::Greater,
        ),
        (
            ConstraintKind::Upper { value: want, inclusive },
            FieldLookup::Range {
                upper: Some(bound), ..
            },
        ) => bound_holds(
            constant(&bound.value),
            constant(want),
            *inclusive,
            bound.inclusive,
            Ordering::Less,
        ),
        _ => false,
    }
}

/// Whether a guaranteed bound `have` implies the wanted bound `want`.
/// `direction` is `Greater` for lower bounds and `Less` for upper bounds.
fn bound_holds(
    have: Option<Value>,
    want: Option<Value>,
    want_inclusive: bool,
    have_inclusive: bool,
    direction: Ordering,
) -> bool {
    let (Some(have), Some(want)) = (have, want) else {
        return false;
    };
    match compare_values(&have, &want) {
        Ordering::Equal => want_inclusive || !have_inclusive,
        ord => ord == direction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::query::builder::PlanBuilder;
    use crate::query::expr::CompareOp;
    use crate::query::metadata::{CollectionInfo, IndexKind, MetadataSnapshot};
    use crate::query::optimizer::rules::test_support::{kinds, run_rule};
    use serde_json::json;

    fn snapshot() -> MetadataSnapshot {
        MetadataSnapshot::from_collections([CollectionInfo::new("c", 1000)
            .with_index(IndexDescriptor::new("by_value", IndexKind::Sorted, &["value"]))
            .with_index(IndexDescriptor::new("by_a", IndexKind::Hash, &["a"]))])
    }

    fn cmp(doc: VariableId, op: CompareOp, path: &str, v: Value) -> Expression {
        Expression::compare(op, Expression::attribute(doc, path), Expression::value(v))
    }

    #[test]
    fn fans_out_one_plan_per_usable_index() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.filter_expr(cmp(doc, CompareOp::Eq, "a", json!("x")));
        b.filter_expr(cmp(doc, CompareOp::Ge, "value", json!(3)));
        b.return_var(doc);
        let plan = b.build().expect("plan");
        let config = EngineConfig::default();
        let snapshot = snapshot();
        let ctx = RuleContext {
            estimator: crate::query::estimator::Estimator::new(&config.estimator, &snapshot),
            config: &config.optimizer,
        };
        let plans = UseIndexes.apply(&plan, &ctx).expect("apply");
        let ids: Vec<String> = plans
            .iter()
            .filter_map(|p| match &p.root().nodes()[1].kind {
                NodeKind::IndexScan { index, .. } => Some(index.id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, ["by_a", "by_value"]);
    }

    #[test]
    fn sort_is_served_by_range_scan() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.filter_expr(cmp(doc, CompareOp::Ge, "value", json!(15)));
        b.sort_by(Expression::attribute(doc, "value"), false);
        b.return_var(doc);
        let config = EngineConfig::default();
        let snapshot = snapshot();
        let plan = run_rule(&UseIndexes, &b.build().expect("plan"), &config, &snapshot);
        let plan = run_rule(&UseIndexForSort, &plan, &config, &snapshot);
        assert!(!kinds(&plan).contains(&"Sort"));
        assert!(matches!(
            plan.root().nodes()[1].kind,
            NodeKind::IndexScan { reverse: true, .. }
        ));
    }

    #[test]
    fn full_scan_becomes_ordered_index_scan() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.sort_by(Expression::attribute(doc, "value"), true);
        b.return_var(doc);
        let config = EngineConfig::default();
        let plan = run_rule(&UseIndexForSort, &b.build().expect("plan"), &config, &snapshot());
        assert_eq!(
            kinds(&plan),
            ["Singleton", "IndexScan", "Calculation", "Return"]
        );
    }

    #[test]
    fn implied_range_filters_are_removed() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.filter_expr(cmp(doc, CompareOp::Gt, "value", json!(10)));
        b.filter_expr(cmp(doc, CompareOp::Ge, "value", json!(5)));
        b.filter_expr(cmp(doc, CompareOp::Ge, "value", json!(20)));
        b.return_var(doc);
        let config = EngineConfig::default();
        let snapshot = snapshot();
        let scan = run_rule(&UseIndexes, &b.build().expect("plan"), &config, &snapshot);
        let out = run_rule(&RemoveFiltersCoveredByIndex, &scan, &config, &snapshot);
        assert_eq!(
            kinds(&out).iter().filter(|k| **k == "Filter").count(),
            1,
            "only the stronger bound survives"
        );
    }
}
