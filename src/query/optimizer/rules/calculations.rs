//! Calculation clean-up rules.

use rustc_hash::FxHashMap;

use super::{first_rewrite, PlanEdit};
use crate::query::expr::Expression;
use crate::query::logical::{NodeKind, Plan};
use crate::query::optimizer::{Rule, RuleContext};
use crate::types::Result;

/// Drops a Calculation whose expression repeats an earlier one in the same
/// scope and points its uses at the earlier variable.
pub struct RemoveRedundantCalculations;

impl Rule for RemoveRedundantCalculations {
    fn name(&self) -> &'static str {
        "remove-redundant-calculations"
    }

    fn pass(&self) -> u32 {
        10
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        first_rewrite(plan, |scope, pipeline| {
            let nodes = pipeline.nodes();
            for (later, node) in nodes.iter().enumerate() {
                let NodeKind::Calculation {
                    out: duplicate,
                    expression,
                } = &node.kind
                else {
                    continue;
                };
                if !expression.is_movable() || expression.is_constant() {
                    continue;
                }
                let mut original = None;
                for earlier in nodes[..later].iter().rev() {
                    match &earlier.kind {
                        NodeKind::Collect { .. } => break,
                        NodeKind::Calculation {
                            out,
                            expression: other,
                        } if other == expression => {
                            original = Some(*out);
                            break;
                        }
                        _ => {}
                    }
                }
                let Some(original) = original else {
                    continue;
                };
                let mut edit = PlanEdit::new(plan, scope, pipeline);
                edit.nodes.remove(later);
                let map = FxHashMap::from_iter([(*duplicate, original)]);
                edit.rename(&map);
                return Ok(Some(edit.finish()));
            }
            Ok(None)
        })
    }
}

/// Evaluates constant sub-expressions at plan time and inlines constant
/// variables into the calculations that read them.
pub struct FoldConstantCalculations;

impl Rule for FoldConstantCalculations {
    fn name(&self) -> &'static str {
        "fold-constant-calculations"
    }

    fn pass(&self) -> u32 {
        10
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        first_rewrite(plan, |scope, pipeline| {
            let mut constants: FxHashMap<_, Expression> = FxHashMap::default();
            for (idx, node) in pipeline.nodes().iter().enumerate() {
                let NodeKind::Calculation { out, expression } = &node.kind else {
                    continue;
                };
                let mut folded = expression.clone();
                for var in expression.variables() {
                    if let Some(constant) = constants.get(&var) {
                        folded = folded.substitute(var, constant);
                    }
                }
                let folded = folded.simplify();
                if &folded != expression {
                    let mut edit = PlanEdit::new(plan, scope, pipeline);
                    edit.replace(
                        idx,
                        NodeKind::Calculation {
                            out: *out,
                            expression: folded,
                        },
                    );
                    return Ok(Some(edit.finish()));
                }
                if expression.as_constant().is_some() {
                    constants.insert(*out, expression.clone());
                }
            }
            Ok(None)
        })
    }
}

/// Removes `LET b = a` and renames uses of `b` to `a`.
pub struct CollapseAliasCalculations;

impl Rule for CollapseAliasCalculations {
    fn name(&self) -> &'static str {
        "collapse-alias-calculations"
    }

    fn pass(&self) -> u32 {
        10
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        first_rewrite(plan, |scope, pipeline| {
            for (idx, node) in pipeline.nodes().iter().enumerate() {
                let NodeKind::Calculation { out, expression } = &node.kind else {
                    continue;
                };
                let Some(source) = expression.as_reference() else {
                    continue;
                };
                let mut edit = PlanEdit::new(plan, scope, pipeline);
                edit.nodes.remove(idx);
                edit.rename(&FxHashMap::from_iter([(*out, source)]));
                return Ok(Some(edit.finish()));
            }
            Ok(None)
        })
    }
}

/// Removes calculations whose result is never read.
///
/// Non-deterministic or throwing calculations stay, as do calculations read
/// from inside a subquery.
pub struct RemoveUnnecessaryCalculations {
    name: &'static str,
    pass: u32,
}

impl RemoveUnnecessaryCalculations {
    /// Instance run with the early clean-up rules.
    pub fn early() -> Self {
        Self {
            name: "remove-unnecessary-calculations",
            pass: 10,
        }
    }

    /// Instance run after the late rules.
    pub fn late() -> Self {
        Self {
            name: "remove-unnecessary-calculations-2",
            pass: 80,
        }
    }
}

impl Rule for RemoveUnnecessaryCalculations {
    fn name(&self) -> &'static str {
        self.name
    }

    fn pass(&self) -> u32 {
        self.pass
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        first_rewrite(plan, |scope, pipeline| {
            let dead: Vec<usize> = pipeline
                .nodes()
                .iter()
                .enumerate()
                .filter(|(idx, node)| match &node.kind {
                    NodeKind::Calculation { out, expression } => {
                        expression.is_movable()
                            && !expression.can_throw()
                            && !pipeline.is_used_after(*idx, *out)
                    }
                    _ => false,
                })
                .map(|(idx, _)| idx)
                .collect();
            if dead.is_empty() {
                return Ok(None);
            }
            let mut edit = PlanEdit::new(plan, scope, pipeline);
            for idx in dead.into_iter().rev() {
                edit.nodes.remove(idx);
            }
            Ok(Some(edit.finish()))
        })
    }
}
