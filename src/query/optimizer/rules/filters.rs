//! Filter and calculation placement rules.

use std::cmp::Ordering;

use super::{first_rewrite, has_modification_before, producer_calculation, PlanEdit};
use crate::query::expr::{CompareOp, Expression};
use crate::query::logical::{NodeKind, Pipeline, Plan, VariableId};
use crate::query::optimizer::{Rule, RuleContext};
use crate::query::value::{compare_values, is_truthy, Value};
use crate::types::Result;

/// Splits `FILTER x AND y` into one Calculation and Filter per conjunct so
/// each conjunct can move and match indexes on its own.
pub struct SplitFilters;

impl Rule for SplitFilters {
    fn name(&self) -> &'static str {
        "split-filters"
    }

    fn pass(&self) -> u32 {
        20
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        first_rewrite(plan, |scope, pipeline| {
            for (idx, node) in pipeline.nodes().iter().enumerate() {
                let NodeKind::Filter { input } = node.kind else {
                    continue;
                };
                let Some((calc, expression)) = producer_calculation(pipeline, input) else {
                    continue;
                };
                let conjuncts = expression.conjuncts();
                if conjuncts.len() < 2 || used_elsewhere(pipeline, input, idx) {
                    continue;
                }
                let conjuncts: Vec<_> = conjuncts.into_iter().cloned().collect();
                let mut edit = PlanEdit::new(plan, scope, pipeline);
                let base = edit.variable_name(input);
                edit.nodes.remove(idx);
                let mut at = idx;
                for (n, conjunct) in conjuncts.into_iter().enumerate() {
                    let out = edit.variable(format!("{base}_{n}"));
                    edit.insert(
                        at,
                        NodeKind::Calculation {
                            out,
                            expression: conjunct,
                        },
                    );
                    edit.insert(at + 1, NodeKind::Filter { input: out });
                    at += 2;
                }
                edit.nodes.remove(calc);
                return Ok(Some(edit.finish()));
            }
            Ok(None)
        })
    }
}

fn used_elsewhere(pipeline: &Pipeline, var: VariableId, filter: usize) -> bool {
    pipeline
        .nodes()
        .iter()
        .enumerate()
        .any(|(idx, node)| idx != filter && node.kind.input_variables().contains(&var))
}

/// Removes filters that are always true or repeat an earlier filter on the
/// same variable, and replaces always-false filters with NoResults.
///
/// A false filter after a write is kept so the write still happens.
pub struct RemoveUnnecessaryFilters;

impl Rule for RemoveUnnecessaryFilters {
    fn name(&self) -> &'static str {
        "remove-unnecessary-filters"
    }

    fn pass(&self) -> u32 {
        20
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        first_rewrite(plan, |scope, pipeline| {
            let nodes = pipeline.nodes();
            for (idx, node) in nodes.iter().enumerate() {
                let NodeKind::Filter { input } = node.kind else {
                    continue;
                };
                let repeated = nodes[..idx]
                    .iter()
                    .any(|n| matches!(n.kind, NodeKind::Filter { input: other } if other == input));
                if repeated {
                    let mut edit = PlanEdit::new(plan, scope, pipeline);
                    edit.nodes.remove(idx);
                    return Ok(Some(edit.finish()));
                }
                let constant = producer_calculation(pipeline, input)
                    .and_then(|(_, expr)| expr.as_constant().cloned());
                let Some(constant) = constant else {
                    continue;
                };
                if is_truthy(&constant) {
                    let mut edit = PlanEdit::new(plan, scope, pipeline);
                    edit.nodes.remove(idx);
                    return Ok(Some(edit.finish()));
                }
                if !has_modification_before(pipeline, idx) {
                    let mut edit = PlanEdit::new(plan, scope, pipeline);
                    edit.replace(idx, NodeKind::NoResults);
                    return Ok(Some(edit.finish()));
                }
            }
            Ok(None)
        })
    }
}

/// Moves deterministic, non-throwing calculations towards the root.
pub struct MoveCalculationsUp;

impl Rule for MoveCalculationsUp {
    fn name(&self) -> &'static str {
        "move-calculations-up"
    }

    fn pass(&self) -> u32 {
        20
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        first_rewrite(plan, |scope, pipeline| {
            let nodes = pipeline.nodes();
            for (idx, node) in nodes.iter().enumerate() {
                let NodeKind::Calculation { expression, .. } = &node.kind else {
                    continue;
                };
                if !expression.is_movable() || expression.can_throw() {
                    continue;
                }
                let inputs = expression.variables();
                let mut target = None;
                for j in (0..idx).rev() {
                    let kind = &nodes[j].kind;
                    if kind.output_variables().iter().any(|v| inputs.contains(v)) {
                        break;
                    }
                    match kind {
                        NodeKind::Limit { .. }
                        | NodeKind::Modify { .. }
                        | NodeKind::Collect { .. }
                        | NodeKind::Scatter { .. }
                        | NodeKind::Remote { .. }
                        | NodeKind::Gather { .. }
                        | NodeKind::Singleton
                        | NodeKind::NoResults => break,
                        NodeKind::Calculation { .. } => {}
                        _ => target = Some(j),
                    }
                }
                if let Some(target) = target {
                    return Ok(Some(move_node(plan, scope, pipeline, idx, target)));
                }
            }
            Ok(None)
        })
    }
}

/// Moves filters towards the root so rows are dropped as early as possible.
pub struct MoveFiltersUp;

impl Rule for MoveFiltersUp {
    fn name(&self) -> &'static str {
        "move-filters-up"
    }

    fn pass(&self) -> u32 {
        20
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        first_rewrite(plan, |scope, pipeline| {
            let nodes = pipeline.nodes();
            for (idx, node) in nodes.iter().enumerate() {
                let NodeKind::Filter { input } = node.kind else {
                    continue;
                };
                let deterministic = producer_calculation(pipeline, input)
                    .map_or(true, |(_, expr)| expr.is_deterministic());
                let mut target = None;
                for j in (0..idx).rev() {
                    let kind = &nodes[j].kind;
                    if kind.output_variables().contains(&input) {
                        break;
                    }
                    match kind {
                        NodeKind::Limit { .. }
                        | NodeKind::Collect { .. }
                        | NodeKind::Modify { .. }
                        | NodeKind::Subquery { .. }
                        | NodeKind::Scatter { .. }
                        | NodeKind::Remote { .. }
                        | NodeKind::Gather { .. }
                        | NodeKind::Singleton
                        | NodeKind::NoResults => break,
                        NodeKind::Calculation { expression, .. } if expression.can_throw() => {
                            break
                        }
                        NodeKind::Calculation { .. } | NodeKind::Filter { .. } => {}
                        other if other.is_loop() && !deterministic => break,
                        _ => target = Some(j),
                    }
                }
                if let Some(target) = target {
                    return Ok(Some(move_node(plan, scope, pipeline, idx, target)));
                }
            }
            Ok(None)
        })
    }
}

/// Rewrites `x == 1 OR x == 2 OR x IN [3]` into `x IN [1, 2, 3]` when every
/// disjunct compares the same attribute or variable with constants, so the
/// filter can match an index.
pub struct ReplaceOrWithIn;

impl Rule for ReplaceOrWithIn {
    fn name(&self) -> &'static str {
        "replace-or-with-in"
    }

    fn pass(&self) -> u32 {
        20
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        first_rewrite(plan, |scope, pipeline| {
            for node in pipeline.nodes() {
                let NodeKind::Filter { input } = node.kind else {
                    continue;
                };
                let Some((calc, expression)) = producer_calculation(pipeline, input) else {
                    continue;
                };
                let Some(replacement) = or_to_in(expression) else {
                    continue;
                };
                let mut edit = PlanEdit::new(plan, scope, pipeline);
                edit.replace(
                    calc,
                    NodeKind::Calculation {
                        out: input,
                        expression: replacement,
                    },
                );
                return Ok(Some(edit.finish()));
            }
            Ok(None)
        })
    }
}

fn or_to_in(expression: &Expression) -> Option<Expression> {
    if !matches!(expression, Expression::Or { .. }) {
        return None;
    }
    let mut subject: Option<&Expression> = None;
    let mut values = Vec::new();
    for disjunct in expression.disjuncts() {
        let (side, constants) = equality_operands(disjunct)?;
        match subject {
            Some(seen) if seen != side => return None,
            Some(_) => {}
            None => subject = Some(side),
        }
        values.extend(constants);
    }
    values.sort_by(compare_values);
    values.dedup_by(|a, b| compare_values(a, b) == Ordering::Equal);
    Some(Expression::compare(
        CompareOp::In,
        subject?.clone(),
        Expression::value(Value::Array(values)),
    ))
}

/// Splits `subject == constant`, its mirror, or `subject IN [constants]`.
fn equality_operands(expression: &Expression) -> Option<(&Expression, Vec<Value>)> {
    let Expression::Compare { op, lhs, rhs } = expression else {
        return None;
    };
    let (lhs, rhs) = (lhs.as_ref(), rhs.as_ref());
    let is_subject =
        |e: &Expression| e.as_attribute_access().is_some() || e.as_reference().is_some();
    match op {
        CompareOp::Eq => match (lhs.as_constant(), rhs.as_constant()) {
            (None, Some(value)) if is_subject(lhs) => Some((lhs, vec![value.clone()])),
            (Some(value), None) if is_subject(rhs) => Some((rhs, vec![value.clone()])),
            _ => None,
        },
        CompareOp::In => match rhs.as_constant() {
            Some(Value::Array(items)) if is_subject(lhs) => Some((lhs, items.clone())),
            _ => None,
        },
        _ => None,
    }
}

/// Moves deterministic, non-throwing calculations down past filters, sorts,
/// limits and subqueries that do not read them, so they run for fewer rows.
/// A calculation never moves into a loop, a collect or a write.
pub struct MoveCalculationsDown;

impl Rule for MoveCalculationsDown {
    fn name(&self) -> &'static str {
        "move-calculations-down"
    }

    fn pass(&self) -> u32 {
        56
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        first_rewrite(plan, |scope, pipeline| {
            let nodes = pipeline.nodes();
            for (idx, node) in nodes.iter().enumerate() {
                let NodeKind::Calculation { out, expression } = &node.kind else {
                    continue;
                };
                if !expression.is_movable() || expression.can_throw() {
                    continue;
                }
                let mut worthwhile = false;
                let mut user = None;
                for (j, later) in nodes.iter().enumerate().skip(idx + 1) {
                    if later.kind.input_variables().contains(out) {
                        user = Some(j);
                        break;
                    }
                    match later.kind {
                        NodeKind::Filter { .. }
                        | NodeKind::Sort { .. }
                        | NodeKind::Limit { .. }
                        | NodeKind::Subquery { .. } => worthwhile = true,
                        NodeKind::Calculation { .. } | NodeKind::Gather { .. } => {}
                        _ => break,
                    }
                }
                match user {
                    Some(user) if worthwhile => {
                        return Ok(Some(move_node(plan, scope, pipeline, idx, user - 1)));
                    }
                    _ => {}
                }
            }
            Ok(None)
        })
    }
}

fn move_node(
    plan: &Plan,
    scope: &crate::query::logical::Scope,
    pipeline: &Pipeline,
    from: usize,
    to: usize,
) -> Plan {
    let mut edit = PlanEdit::new(plan, scope, pipeline);
    let node = edit.nodes.remove(from);
    edit.nodes.insert(to, node);
    edit.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::query::builder::PlanBuilder;
    use crate::query::expr::ArithOp;
    use crate::query::metadata::MetadataSnapshot;
    use crate::query::optimizer::rules::test_support::{kinds, run_rule};
    use serde_json::json;

    fn run(rule: &dyn Rule, plan: &Plan) -> Plan {
        run_rule(
            rule,
            plan,
            &EngineConfig::default(),
            &MetadataSnapshot::default(),
        )
    }

    #[test]
    fn conjunction_becomes_two_filters() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.filter_expr(Expression::and(
            Expression::compare(
                CompareOp::Eq,
                Expression::attribute(doc, "a"),
                Expression::value(json!(1)),
            ),
            Expression::compare(
                CompareOp::Gt,
                Expression::attribute(doc, "b"),
                Expression::value(json!(2)),
            ),
        ));
        b.return_var(doc);
        let out = run(&SplitFilters, &b.build().expect("plan"));
        assert_eq!(
            kinds(&out),
            [
                "Singleton",
                "EnumerateCollection",
                "Calculation",
                "Filter",
                "Calculation",
                "Filter",
                "Return"
            ]
        );
    }

    #[test]
    fn false_filter_becomes_no_results() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.filter_expr(Expression::value(json!(false)));
        b.return_var(doc);
        let out = run(&RemoveUnnecessaryFilters, &b.build().expect("plan"));
        assert!(kinds(&out).contains(&"NoResults"));
        assert!(!kinds(&out).contains(&"Filter"));
    }

    #[test]
    fn false_filter_after_write_stays() {
        let mut b = PlanBuilder::new();
        let item = b.for_values("i", vec![json!({"a": 1})]);
        b.insert("c", item);
        let cond = b.calc("never", Expression::value(json!(false)));
        b.filter(cond);
        b.return_var(item);
        let out = run(&RemoveUnnecessaryFilters, &b.build().expect("plan"));
        assert!(kinds(&out).contains(&"Filter"));
    }

    #[test]
    fn filter_moves_above_inner_loop() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        let other = b.for_collection("d", "other");
        b.filter_expr(Expression::compare(
            CompareOp::Eq,
            Expression::attribute(doc, "a"),
            Expression::value(json!(1)),
        ));
        b.return_var(other);
        let plan = b.build().expect("plan");
        let out = run(&MoveCalculationsUp, &plan);
        let out = run(&MoveFiltersUp, &out);
        assert_eq!(
            kinds(&out),
            [
                "Singleton",
                "EnumerateCollection",
                "Calculation",
                "Filter",
                "EnumerateCollection",
                "Return"
            ]
        );
    }

    #[test]
    fn random_filter_stays_inside_loop() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.for_collection("d", "other");
        b.filter_expr(Expression::compare(
            CompareOp::Gt,
            Expression::call("RAND", vec![]),
            Expression::value(json!(0.5)),
        ));
        b.return_var(doc);
        let plan = b.build().expect("plan");
        let out = run(&MoveCalculationsUp, &plan);
        let out = run(&MoveFiltersUp, &out);
        assert_eq!(kinds(&out), kinds(&plan));
    }

    #[test]
    fn equality_disjunction_becomes_in() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        let eq = |v: i64| {
            Expression::compare(
                CompareOp::Eq,
                Expression::attribute(doc, "a"),
                Expression::value(json!(v)),
            )
        };
        b.filter_expr(Expression::or(
            Expression::or(eq(3), eq(1)),
            Expression::compare(
                CompareOp::In,
                Expression::attribute(doc, "a"),
                Expression::value(json!([2, 3])),
            ),
        ));
        b.return_var(doc);
        let out = run(&ReplaceOrWithIn, &b.build().expect("plan"));
        let expression = out
            .root()
            .nodes()
            .iter()
            .find_map(|n| match &n.kind {
                NodeKind::Calculation { expression, .. } => Some(expression.clone()),
                _ => None,
            })
            .expect("calculation");
        assert_eq!(
            expression,
            Expression::compare(
                CompareOp::In,
                Expression::attribute(doc, "a"),
                Expression::value(json!([1, 2, 3])),
            )
        );
    }

    #[test]
    fn disjunction_over_different_attributes_stays() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.filter_expr(Expression::or(
            Expression::compare(
                CompareOp::Eq,
                Expression::attribute(doc, "a"),
                Expression::value(json!(1)),
            ),
            Expression::compare(
                CompareOp::Eq,
                Expression::attribute(doc, "b"),
                Expression::value(json!(1)),
            ),
        ));
        b.return_var(doc);
        let plan = b.build().expect("plan");
        assert_eq!(run(&ReplaceOrWithIn, &plan), plan);
    }

    #[test]
    fn calculation_moves_below_filter_and_limit() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        let doubled = b.calc(
            "doubled",
            Expression::arithmetic(
                ArithOp::Mul,
                Expression::attribute(doc, "a"),
                Expression::value(json!(2)),
            ),
        );
        b.filter_expr(Expression::compare(
            CompareOp::Gt,
            Expression::attribute(doc, "b"),
            Expression::value(json!(1)),
        ));
        b.limit(0, 10);
        b.return_var(doubled);
        let out = run(&MoveCalculationsDown, &b.build().expect("plan"));
        assert_eq!(
            kinds(&out),
            [
                "Singleton",
                "EnumerateCollection",
                "Calculation",
                "Filter",
                "Limit",
                "Calculation",
                "Return"
            ]
        );
        assert!(matches!(
            &out.root().nodes()[5].kind,
            NodeKind::Calculation { out, .. } if *out == doubled
        ));
    }

    #[test]
    fn throwing_calculation_and_loops_stop_the_move() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        let ratio = b.calc(
            "ratio",
            Expression::arithmetic(
                ArithOp::Div,
                Expression::value(json!(10)),
                Expression::attribute(doc, "a"),
            ),
        );
        let label = b.calc("label", Expression::attribute(doc, "name"));
        b.filter_expr(Expression::value(json!(true)));
        b.for_collection("d", "other");
        b.return_expr(Expression::and(
            Expression::reference(ratio),
            Expression::reference(label),
        ));
        let plan = b.build().expect("plan");
        assert_eq!(run(&MoveCalculationsDown, &plan), plan);
    }

    #[test]
    fn filter_never_crosses_limit() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.limit(0, 3);
        b.filter_expr(Expression::compare(
            CompareOp::Eq,
            Expression::attribute(doc, "a"),
            Expression::value(json!(1)),
        ));
        b.return_var(doc);
        let plan = b.build().expect("plan");
        let out = run(&MoveFiltersUp, &run(&MoveCalculationsUp, &plan));
        assert_eq!(kinds(&out), kinds(&plan));
    }
}
