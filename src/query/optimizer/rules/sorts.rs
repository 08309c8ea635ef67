use super::{first_rewrite, producer_calculation, PlanEdit};
use crate::query::logical::{NodeKind, Pipeline, Plan, SortElement};
use crate::query::optimizer::{Rule, RuleContext};
use crate::types::Result;

/// Removes sorts that cannot change the final row order.
///
/// A sort on constants orders nothing. A sort whose keys are a prefix of a
/// later sort's keys is overridden by it, as long as no node in between
/// depends on the intermediate order.
pub struct RemoveRedundantSorts;

impl Rule for RemoveRedundantSorts {
    fn name(&self) -> &'static str {
        "remove-redundant-sorts"
    }

    fn pass(&self) -> u32 {
        30
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        first_rewrite(plan, |scope, pipeline| {
            for (idx, node) in pipeline.nodes().iter().enumerate() {
                let NodeKind::Sort { elements } = &node.kind else {
                    continue;
                };
                if sorts_on_constants(pipeline, elements) || overridden_later(pipeline, idx, elements)
                {
                    let mut edit = PlanEdit::new(plan, scope, pipeline);
                    edit.nodes.remove(idx);
                    return Ok(Some(edit.finish()));
                }
            }
            Ok(None)
        })
    }
}

fn sorts_on_constants(pipeline: &Pipeline, elements: &[SortElement]) -> bool {
    elements.iter().all(|element| {
        producer_calculation(pipeline, element.variable)
            .is_some_and(|(_, expr)| expr.as_constant().is_some())
    })
}

fn overridden_later(pipeline: &Pipeline, idx: usize, elements: &[SortElement]) -> bool {
    for node in pipeline.nodes().iter().skip(idx + 1) {
        match &node.kind {
            NodeKind::Sort { elements: later } => {
                return later.len() >= elements.len() && later[..elements.len()] == *elements;
            }
            NodeKind::Limit { .. }
            | NodeKind::Collect { .. }
            | NodeKind::Modify { .. }
            | NodeKind::Subquery { .. }
            | NodeKind::Scatter { .. }
            | NodeKind::Remote { .. }
            | NodeKind::Gather { .. }
            | NodeKind::Return { .. } => return false,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::query::builder::PlanBuilder;
    use crate::query::expr::Expression;
    use crate::query::metadata::MetadataSnapshot;
    use crate::query::optimizer::rules::test_support::{kinds, run_rule};
    use serde_json::json;

    fn run(plan: &Plan) -> Plan {
        run_rule(
            &RemoveRedundantSorts,
            plan,
            &EngineConfig::default(),
            &MetadataSnapshot::default(),
        )
    }

    #[test]
    fn earlier_prefix_sort_is_dropped() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        let a = b.sort_by(Expression::attribute(doc, "a"), true);
        let bb = b.calc("b", Expression::attribute(doc, "b"));
        b.sort(&[(a, true), (bb, false)]);
        b.return_var(doc);
        let out = run(&b.build().expect("plan"));
        let sorts = kinds(&out).iter().filter(|k| **k == "Sort").count();
        assert_eq!(sorts, 1);
    }

    #[test]
    fn sort_before_limit_is_kept() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        let a = b.sort_by(Expression::attribute(doc, "a"), true);
        b.limit(0, 2);
        b.sort(&[(a, true)]);
        b.return_var(doc);
        let plan = b.build().expect("plan");
        assert_eq!(kinds(&run(&plan)), kinds(&plan));
    }

    #[test]
    fn constant_sort_is_dropped() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.sort_by(Expression::value(json!(1)), true);
        b.return_var(doc);
        let out = run(&b.build().expect("plan"));
        assert!(!kinds(&out).contains(&"Sort"));
    }
}
