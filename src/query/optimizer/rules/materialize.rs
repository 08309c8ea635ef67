use rustc_hash::FxHashMap;

use super::projections::scan_projections;
use super::{first_rewrite, node_uses, PlanEdit};
use crate::query::logical::{NodeKind, Pipeline, Plan, VariableId};
use crate::query::optimizer::{Rule, RuleContext};
use crate::types::Result;

/// Defers document fetches of an index scan until after `SORT ... LIMIT`.
///
/// Applies when everything between the scan and the Limit reads only
/// attributes the index covers. The scan then produces partial documents
/// from index data and a Materialize node after the Limit fetches the full
/// documents of the surviving rows.
pub struct LateDocumentMaterialization;

impl Rule for LateDocumentMaterialization {
    fn name(&self) -> &'static str {
        "late-document-materialization"
    }

    fn pass(&self) -> u32 {
        60
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        first_rewrite(plan, |scope, pipeline| {
            let nodes = pipeline.nodes();
            for (idx, node) in nodes.iter().enumerate() {
                let NodeKind::IndexScan {
                    collection,
                    index,
                    condition,
                    out,
                    covering,
                    filter,
                    reverse,
                    ..
                } = &node.kind
                else {
                    continue;
                };
                if *covering || feeds_materialize(pipeline, *out) {
                    continue;
                }
                let Some(limit) = sorted_limit(pipeline, idx) else {
                    continue;
                };
                let mut uses = Some(Vec::new());
                if let Some(filter) = filter {
                    filter.attribute_uses(*out, &mut uses);
                }
                for between in &nodes[idx + 1..limit] {
                    node_uses(&between.kind, *out, &mut uses);
                }
                let Some(paths) = uses else {
                    continue;
                };
                if !paths.iter().all(|p| index.covers(p)) {
                    continue;
                }
                if !nodes[limit + 1..]
                    .iter()
                    .any(|n| n.kind.input_variables().contains(out))
                {
                    continue;
                }

                let mut edit = PlanEdit::new(plan, scope, pipeline);
                let name = edit.variable_name(*out);
                let partial = edit.variable(format!("{name}_partial"));
                let map = FxHashMap::from_iter([(*out, partial)]);
                let renamed =
                    Pipeline::new(edit.nodes[idx + 1..=limit].to_vec()).replace_variables(&map);
                edit.nodes
                    .splice(idx + 1..=limit, renamed.nodes().iter().cloned());
                edit.insert(
                    limit + 1,
                    NodeKind::Materialize {
                        collection: collection.clone(),
                        input: partial,
                        out: *out,
                    },
                );
                let filter = filter.as_ref().map(|f| f.replace_variables(&map));
                let preview = Pipeline::new(edit.nodes.clone());
                let projections = scan_projections(&preview, idx, partial, filter.as_ref());
                edit.replace(
                    idx,
                    NodeKind::IndexScan {
                        collection: collection.clone(),
                        index: index.clone(),
                        condition: condition.clone(),
                        out: partial,
                        projections,
                        covering: true,
                        filter,
                        reverse: *reverse,
                    },
                );
                return Ok(Some(edit.finish()));
            }
            Ok(None)
        })
    }
}

fn feeds_materialize(pipeline: &Pipeline, var: VariableId) -> bool {
    pipeline
        .nodes()
        .iter()
        .any(|n| matches!(n.kind, NodeKind::Materialize { input, .. } if input == var))
}

/// Index of the Limit closing a `scan → (Calculation | Filter | Sort)* → Limit`
/// chain that contains at least one Sort.
fn sorted_limit(pipeline: &Pipeline, idx: usize) -> Option<usize> {
    let mut sorted = false;
    for (j, node) in pipeline.nodes().iter().enumerate().skip(idx + 1) {
        match node.kind {
            NodeKind::Calculation { .. } | NodeKind::Filter { .. } => {}
            NodeKind::Sort { .. } => sorted = true,
            NodeKind::Limit { .. } if sorted => return Some(j),
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::query::builder::PlanBuilder;
    use crate::query::expr::{CompareOp, Expression};
    use crate::query::metadata::{CollectionInfo, IndexDescriptor, IndexKind, MetadataSnapshot};
    use crate::query::optimizer::rules::test_support::{kinds, run_rule};
    use crate::query::optimizer::rules::UseIndexes;
    use serde_json::json;

    fn snapshot() -> MetadataSnapshot {
        MetadataSnapshot::from_collections([CollectionInfo::new("c", 10_000)
            .with_index(IndexDescriptor::new("by_a", IndexKind::Sorted, &["a"]))])
    }

    fn top_k(sort_on: &str) -> Plan {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.filter_expr(Expression::compare(
            CompareOp::Gt,
            Expression::attribute(doc, "a"),
            Expression::value(json!(0)),
        ));
        b.sort_by(Expression::attribute(doc, sort_on), true);
        b.limit(0, 10);
        b.return_var(doc);
        b.build().expect("plan")
    }

    #[test]
    fn fetch_moves_after_limit() {
        let config = EngineConfig::default();
        let snapshot = snapshot();
        let plan = run_rule(&UseIndexes, &top_k("a"), &config, &snapshot);
        let out = run_rule(&LateDocumentMaterialization, &plan, &config, &snapshot);
        assert_eq!(
            kinds(&out),
            [
                "Singleton",
                "IndexScan",
                "Calculation",
                "Filter",
                "Calculation",
                "Sort",
                "Limit",
                "Materialize",
                "Return"
            ]
        );
        let NodeKind::IndexScan { out: partial, covering, .. } = &out.root().nodes()[1].kind else {
            panic!("index scan expected");
        };
        assert!(*covering);
        assert_eq!(out.variables().name(*partial), "doc_partial");
    }

    #[test]
    fn uncovered_sort_key_keeps_early_fetch() {
        let config = EngineConfig::default();
        let snapshot = snapshot();
        let plan = run_rule(&UseIndexes, &top_k("b"), &config, &snapshot);
        let out = run_rule(&LateDocumentMaterialization, &plan, &config, &snapshot);
        assert!(!kinds(&out).contains(&"Materialize"));
    }
}
