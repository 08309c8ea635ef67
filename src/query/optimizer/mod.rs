//! Rule engine.
//!
//! Rules are grouped into ascending passes. Within a pass the rules run in
//! name order and are repeated until none of them changes the plan; a later
//! pass never re-triggers an earlier one. A rule may fan out into several
//! candidate plans, each of which continues independently through the
//! remaining passes. The cheapest candidate wins, ties going to the one
//! generated first. Whole sweeps are repeated until the chosen plan stops
//! changing, so optimizing an optimized plan returns it unchanged.
//!
//! Rules that only offer alternatives (loop reordering) leave the candidate
//! as it is and add the alternatives next to it.

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::config::{EngineConfig, OptimizerConfig};
use crate::query::estimator::{Estimator, PlanEstimate};
use crate::query::logical::Plan;
use crate::query::metadata::MetadataSnapshot;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::types::{AqlError, Result};

pub mod rules;

const MAX_ROUNDS_PER_PASS: usize = 1000;

/// Environment a rule runs in.
pub struct RuleContext<'a> {
    /// Cost model over the query's metadata snapshot.
    pub estimator: Estimator<'a>,
    /// Optimizer settings.
    pub config: &'a OptimizerConfig,
}

/// A named plan rewrite.
///
/// `apply` is pure: it returns freshly built plans and never touches the
/// input. An empty result means the rule did not fire; more than one plan is
/// a fan-out into alternative candidates, best-ranked first.
pub trait Rule: Send + Sync {
    /// Stable rule name.
    fn name(&self) -> &'static str;

    /// Pass number; passes run in increasing order.
    fn pass(&self) -> u32;

    /// Cheap applicability check made before `apply`.
    fn applies(&self, _plan: &Plan, _ctx: &RuleContext<'_>) -> bool {
        true
    }

    /// True when `apply` returns alternatives to the input instead of
    /// rewrites of it. The input stays a candidate and the rule offers
    /// alternatives at most once per candidate.
    fn offers_alternatives(&self) -> bool {
        false
    }

    /// Rewrites the plan.
    fn apply(&self, plan: &Plan, ctx: &RuleContext<'_>) -> Result<Vec<Plan>>;
}

/// Result of an optimizer run.
#[derive(Clone, Debug)]
pub struct OptimizerOutput {
    /// The chosen plan.
    pub plan: Plan,
    /// Cost and row estimates of the chosen plan.
    pub estimate: PlanEstimate,
    /// Rules that fired for the chosen plan, in first-application order.
    pub rules: Vec<&'static str>,
    /// Largest number of complete candidate plans compared in one sweep.
    pub plans_considered: usize,
    /// Sweeps needed to reach the fixed point.
    pub sweeps: usize,
}

#[derive(Clone)]
struct Candidate {
    plan: Plan,
    fired: Vec<&'static str>,
    expanded: Vec<&'static str>,
}

/// Applies the registered rules to a plan.
pub struct Optimizer<'a> {
    config: &'a EngineConfig,
    metadata: &'a MetadataSnapshot,
    rules: Vec<Box<dyn Rule>>,
}

impl<'a> Optimizer<'a> {
    /// Optimizer with every built-in rule.
    pub fn new(config: &'a EngineConfig, metadata: &'a MetadataSnapshot) -> Self {
        Self::with_rules(config, metadata, rules::all_rules())
    }

    /// Optimizer with an explicit rule set.
    pub fn with_rules(
        config: &'a EngineConfig,
        metadata: &'a MetadataSnapshot,
        mut rules: Vec<Box<dyn Rule>>,
    ) -> Self {
        rules.sort_by(|a, b| (a.pass(), a.name()).cmp(&(b.pass(), b.name())));
        Self {
            config,
            metadata,
            rules,
        }
    }

    /// Registered rules as `(pass, name)` in execution order.
    pub fn rule_names(&self) -> Vec<(u32, &'static str)> {
        self.rules.iter().map(|r| (r.pass(), r.name())).collect()
    }

    /// Optimizes `plan` and returns the cheapest candidate.
    pub fn optimize(&self, plan: &Plan) -> Result<OptimizerOutput> {
        let start = profile_timer();
        plan.validate()?;
        let ctx = RuleContext {
            estimator: Estimator::new(&self.config.estimator, self.metadata),
            config: &self.config.optimizer,
        };
        let max_sweeps = self.config.optimizer.max_sweeps.max(1);
        let mut current = plan.clone();
        let mut fired: Vec<&'static str> = Vec::new();
        let mut considered = 0;
        let mut sweeps = 0;
        let estimate = loop {
            sweeps += 1;
            let (best, estimate, best_fired, count) = self.sweep(&current, &ctx)?;
            considered = considered.max(count);
            for name in best_fired {
                if !fired.contains(&name) {
                    fired.push(name);
                }
            }
            let unchanged = best == current;
            current = best;
            if unchanged {
                break estimate;
            }
            if sweeps >= max_sweeps {
                warn!(sweeps, "optimizer stopped before reaching a fixed point");
                break estimate;
            }
        };
        current.validate().map_err(|err| {
            AqlError::internal(format!("optimizer produced an invalid plan: {err}"))
        })?;
        record_profile_timer(QueryProfileKind::Optimize, start);
        debug!(
            cost = estimate.cost,
            rows = estimate.rows,
            plans = considered,
            sweeps,
            rules = ?fired,
            "optimizer chose plan"
        );
        Ok(OptimizerOutput {
            plan: current,
            estimate,
            rules: fired,
            plans_considered: considered,
            sweeps,
        })
    }

    fn passes(&self) -> Vec<u32> {
        let mut passes: Vec<u32> = self.rules.iter().map(|r| r.pass()).collect();
        passes.dedup();
        passes
    }

    fn sweep(
        &self,
        plan: &Plan,
        ctx: &RuleContext<'_>,
    ) -> Result<(Plan, PlanEstimate, Vec<&'static str>, usize)> {
        let max_plans = self.config.optimizer.max_plans.max(1);
        let mut candidates = vec![Candidate {
            plan: plan.clone(),
            fired: Vec::new(),
            expanded: Vec::new(),
        }];
        for pass in self.passes() {
            let rules: Vec<&dyn Rule> = self
                .rules
                .iter()
                .filter(|r| r.pass() == pass && !ctx.config.is_disabled(r.name()))
                .map(|r| r.as_ref())
                .collect();
            if rules.is_empty() {
                continue;
            }
            trace!(pass, candidates = candidates.len(), "optimizer pass");
            let mut worklist: VecDeque<Candidate> = candidates.drain(..).collect();
            let mut done = Vec::new();
            while let Some(mut candidate) = worklist.pop_front() {
                let mut rounds = 0;
                loop {
                    rounds += 1;
                    if rounds > MAX_ROUNDS_PER_PASS {
                        warn!(pass, "rule pass did not settle");
                        break;
                    }
                    let mut changed = false;
                    for rule in &rules {
                        let alternatives = rule.offers_alternatives();
                        if alternatives && candidate.expanded.contains(&rule.name()) {
                            continue;
                        }
                        if !rule.applies(&candidate.plan, ctx) {
                            continue;
                        }
                        let mut produced = rule.apply(&candidate.plan, ctx)?;
                        if alternatives {
                            candidate.expanded.push(rule.name());
                        }
                        if produced.is_empty() {
                            continue;
                        }
                        trace!(rule = rule.name(), candidates = produced.len(), "rule fired");
                        let first = if alternatives {
                            None
                        } else {
                            Some(produced.remove(0))
                        };
                        let room = max_plans.saturating_sub(done.len() + worklist.len() + 1);
                        for (offset, extra) in produced.into_iter().take(room).enumerate() {
                            let mut fired = candidate.fired.clone();
                            fired.push(rule.name());
                            worklist.insert(
                                offset,
                                Candidate {
                                    plan: extra,
                                    fired,
                                    expanded: candidate.expanded.clone(),
                                },
                            );
                        }
                        let Some(first) = first else {
                            continue;
                        };
                        candidate.plan = first;
                        candidate.fired.push(rule.name());
                        changed = true;
                    }
                    if !changed {
                        break;
                    }
                }
                done.push(candidate);
            }
            candidates = done;
        }
        let count = candidates.len();
        let mut best: Option<(Candidate, PlanEstimate)> = None;
        for candidate in candidates {
            let estimate = ctx.estimator.estimate_plan(&candidate.plan)?;
            match &best {
                Some((_, cheapest)) if cheapest.cost <= estimate.cost => {}
                _ => best = Some((candidate, estimate)),
            }
        }
        let (candidate, estimate) =
            best.ok_or_else(|| AqlError::NoPlan("no candidate plan survived".to_owned()))?;
        Ok((candidate.plan, estimate, candidate.fired, count))
    }
}
