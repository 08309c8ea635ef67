//! Scan-side rules: filter pushdown and projection extraction.

use super::{available_at, first_rewrite, needed_paths, producer_calculation, PlanEdit};
use crate::query::expr::Expression;
use crate::query::logical::{AttributePath, NodeKind, Pipeline, Plan, ProjectionSet, VariableId};
use crate::query::metadata::IndexDescriptor;
use crate::query::optimizer::{Rule, RuleContext};
use crate::query::value::KEY_ATTRIBUTE;
use crate::types::Result;

/// Scans reading more attributes than this fetch whole documents.
pub const MAX_PROJECTIONS: usize = 5;

/// Evaluates a filter as part of the nearest preceding scan and drops the
/// separate Filter node.
pub struct PushFiltersIntoEnumeration;

impl Rule for PushFiltersIntoEnumeration {
    fn name(&self) -> &'static str {
        "push-filters-into-enumeration"
    }

    fn pass(&self) -> u32 {
        50
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        first_rewrite(plan, |scope, pipeline| {
            let nodes = pipeline.nodes();
            for (fidx, node) in nodes.iter().enumerate() {
                let NodeKind::Filter { input } = node.kind else {
                    continue;
                };
                let Some((_, expr)) = producer_calculation(pipeline, input) else {
                    continue;
                };
                if expr.can_throw() {
                    continue;
                }
                let Some(sidx) = pushdown_target(pipeline, fidx, expr) else {
                    continue;
                };
                let merged = |own: &Option<Expression>| match own {
                    Some(existing) => Expression::and(existing.clone(), expr.clone()),
                    None => expr.clone(),
                };
                let rewritten = match &nodes[sidx].kind {
                    NodeKind::EnumerateCollection {
                        collection,
                        out,
                        projections,
                        filter,
                    } => NodeKind::EnumerateCollection {
                        collection: collection.clone(),
                        out: *out,
                        projections: projections.clone(),
                        filter: Some(merged(filter)),
                    },
                    NodeKind::IndexScan {
                        collection,
                        index,
                        condition,
                        out,
                        projections,
                        covering,
                        filter,
                        reverse,
                    } => NodeKind::IndexScan {
                        collection: collection.clone(),
                        index: index.clone(),
                        condition: condition.clone(),
                        out: *out,
                        projections: projections.clone(),
                        covering: *covering,
                        filter: Some(merged(filter)),
                        reverse: *reverse,
                    },
                    _ => continue,
                };
                let mut edit = PlanEdit::new(plan, scope, pipeline);
                edit.nodes.remove(fidx);
                edit.replace(sidx, rewritten);
                return Ok(Some(edit.finish()));
            }
            Ok(None)
        })
    }
}

/// Index of the scan the filter at `fidx` can be evaluated in.
///
/// The filter stays put when a node between would observe the dropped rows,
/// or when one of its inputs is only bound after the scan. A
/// non-deterministic condition is never moved out of an inner loop.
fn pushdown_target(pipeline: &Pipeline, fidx: usize, expr: &Expression) -> Option<usize> {
    let nodes = pipeline.nodes();
    let mut crossed_loop = false;
    for sidx in (0..fidx).rev() {
        let kind = &nodes[sidx].kind;
        match kind {
            NodeKind::Limit { .. }
            | NodeKind::Collect { .. }
            | NodeKind::Modify { .. }
            | NodeKind::Subquery { .. }
            | NodeKind::Scatter { .. }
            | NodeKind::Remote { .. }
            | NodeKind::Gather { .. }
            | NodeKind::Singleton => return None,
            NodeKind::Calculation { expression, .. } if expression.can_throw() => return None,
            NodeKind::EnumerateCollection { .. } | NodeKind::IndexScan { .. } => {
                if crossed_loop && !expr.is_deterministic() {
                    return None;
                }
                let available = expr
                    .variables()
                    .iter()
                    .all(|var| available_at(pipeline, *var, sidx));
                return available.then_some(sidx);
            }
            NodeKind::EnumerateList { .. } => crossed_loop = true,
            _ => {}
        }
    }
    None
}

/// Records on every scan which attributes are read from its documents and
/// whether its index alone can serve them.
pub struct ReduceExtractionToProjection;

impl Rule for ReduceExtractionToProjection {
    fn name(&self) -> &'static str {
        "reduce-extraction-to-projection"
    }

    fn pass(&self) -> u32 {
        55
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        first_rewrite(plan, |scope, pipeline| {
            for (idx, node) in pipeline.nodes().iter().enumerate() {
                let rewritten = match &node.kind {
                    NodeKind::EnumerateCollection {
                        collection,
                        out,
                        projections,
                        filter,
                    } => {
                        let next = scan_projections(pipeline, idx, *out, filter.as_ref());
                        if &next == projections {
                            continue;
                        }
                        NodeKind::EnumerateCollection {
                            collection: collection.clone(),
                            out: *out,
                            projections: next,
                            filter: filter.clone(),
                        }
                    }
                    NodeKind::IndexScan {
                        collection,
                        index,
                        condition,
                        out,
                        projections,
                        covering,
                        filter,
                        reverse,
                    } => {
                        let next = scan_projections(pipeline, idx, *out, filter.as_ref());
                        let next_covering = covers_all(index, &next);
                        if &next == projections && next_covering == *covering {
                            continue;
                        }
                        NodeKind::IndexScan {
                            collection: collection.clone(),
                            index: index.clone(),
                            condition: condition.clone(),
                            out: *out,
                            projections: next,
                            covering: next_covering,
                            filter: filter.clone(),
                            reverse: *reverse,
                        }
                    }
                    _ => continue,
                };
                let mut edit = PlanEdit::new(plan, scope, pipeline);
                edit.replace(idx, rewritten);
                return Ok(Some(edit.finish()));
            }
            Ok(None)
        })
    }
}

/// Attributes of `var` the rest of the pipeline and the scan's own filter
/// read. An unread document still projects `_key`.
pub(crate) fn scan_projections(
    pipeline: &Pipeline,
    idx: usize,
    var: VariableId,
    filter: Option<&Expression>,
) -> ProjectionSet {
    let mut uses = needed_paths(pipeline, idx, var);
    if let Some(filter) = filter {
        filter.attribute_uses(var, &mut uses);
    }
    match uses {
        Some(paths) if paths.is_empty() => {
            ProjectionSet::new(vec![AttributePath(vec![KEY_ATTRIBUTE.to_owned()])])
        }
        Some(paths) => {
            let set = ProjectionSet::new(paths);
            if set.len() > MAX_PROJECTIONS {
                ProjectionSet::full_document()
            } else {
                set
            }
        }
        None => ProjectionSet::full_document(),
    }
}

/// True if the index key data serves every projection.
pub(crate) fn covers_all(index: &IndexDescriptor, projections: &ProjectionSet) -> bool {
    !projections.is_empty() && projections.paths().iter().all(|p| index.covers(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::query::builder::PlanBuilder;
    use crate::query::expr::CompareOp;
    use crate::query::metadata::{CollectionInfo, IndexKind, MetadataSnapshot};
    use crate::query::optimizer::rules::test_support::{kinds, run_rule};
    use crate::query::optimizer::rules::UseIndexes;
    use serde_json::json;

    fn run(rule: &dyn Rule, plan: &Plan, snapshot: &MetadataSnapshot) -> Plan {
        run_rule(rule, plan, &EngineConfig::default(), snapshot)
    }

    #[test]
    fn filter_is_merged_into_scan() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.filter_expr(Expression::compare(
            CompareOp::Eq,
            Expression::attribute(doc, "a"),
            Expression::value(json!(1)),
        ));
        b.return_var(doc);
        let out = run(
            &PushFiltersIntoEnumeration,
            &b.build().expect("plan"),
            &MetadataSnapshot::default(),
        );
        assert_eq!(
            kinds(&out),
            ["Singleton", "EnumerateCollection", "Calculation", "Return"]
        );
        assert!(matches!(
            &out.root().nodes()[1].kind,
            NodeKind::EnumerateCollection { filter: Some(_), .. }
        ));
    }

    #[test]
    fn filter_on_later_variable_stays() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        let item = b.for_values("i", vec![json!(1), json!(2)]);
        b.filter_expr(Expression::compare(
            CompareOp::Eq,
            Expression::attribute(doc, "a"),
            Expression::reference(item),
        ));
        b.return_var(doc);
        let plan = b.build().expect("plan");
        let out = run(&PushFiltersIntoEnumeration, &plan, &MetadataSnapshot::default());
        assert_eq!(kinds(&out), kinds(&plan));
    }

    #[test]
    fn random_filter_is_not_pushed_past_inner_loop() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.for_values("i", vec![json!(1), json!(2)]);
        b.filter_expr(Expression::compare(
            CompareOp::Lt,
            Expression::call("RAND", vec![]),
            Expression::attribute(doc, "p"),
        ));
        b.return_var(doc);
        let plan = b.build().expect("plan");
        let out = run(&PushFiltersIntoEnumeration, &plan, &MetadataSnapshot::default());
        assert_eq!(kinds(&out), kinds(&plan));
    }

    #[test]
    fn covering_index_scan_reports_projections() {
        let snapshot = MetadataSnapshot::from_collections([CollectionInfo::new("c", 100)
            .with_index(IndexDescriptor::new("by_a", IndexKind::Sorted, &["a"]))]);
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.filter_expr(Expression::compare(
            CompareOp::Gt,
            Expression::attribute(doc, "a"),
            Expression::value(json!(1)),
        ));
        b.return_expr(Expression::attribute(doc, "a"));
        let plan = run(&UseIndexes, &b.build().expect("plan"), &snapshot);
        let out = run(&ReduceExtractionToProjection, &plan, &snapshot);
        match &out.root().nodes()[1].kind {
            NodeKind::IndexScan {
                projections,
                covering,
                ..
            } => {
                assert_eq!(projections.paths(), &[AttributePath::parse("a")]);
                assert!(*covering);
            }
            other => panic!("expected index scan, got {other:?}"),
        }
    }

    #[test]
    fn too_many_attributes_fetch_whole_document() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        let fields = ["a", "b", "c", "d", "e", "f"];
        b.return_expr(Expression::Array {
            items: fields
                .iter()
                .map(|f| Expression::attribute(doc, f))
                .collect(),
        });
        let out = run(
            &ReduceExtractionToProjection,
            &b.build().expect("plan"),
            &MetadataSnapshot::default(),
        );
        assert!(matches!(
            &out.root().nodes()[1].kind,
            NodeKind::EnumerateCollection { projections, .. } if projections.is_empty()
        ));
    }
}
