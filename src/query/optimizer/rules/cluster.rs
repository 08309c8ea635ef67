//! Rules that distribute work across the shards of a collection.

use super::PlanEdit;
use crate::query::logical::{NodeKind, Plan, Scope};
use crate::query::optimizer::{Rule, RuleContext};
use crate::types::Result;

/// Wraps the shard-local part of the pipeline around the first sharded scan
/// or write in `Scatter → Remote → ... → Gather`.
///
/// For reads the shard part is the scan plus the calculations and filters
/// directly after it. Writes are routed by their input document.
pub struct ScatterInCluster;

impl Rule for ScatterInCluster {
    fn name(&self) -> &'static str {
        "scatter-in-cluster"
    }

    fn pass(&self) -> u32 {
        70
    }

    fn applies(&self, _plan: &Plan, ctx: &RuleContext<'_>) -> bool {
        ctx.config.cluster
    }

    fn apply(&self, plan: &Plan, ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        let scope = Scope::root();
        let pipeline = plan.root();
        let nodes = pipeline.nodes();
        let mut distributed = false;
        for (idx, node) in nodes.iter().enumerate() {
            let (collection, route) = match &node.kind {
                NodeKind::Remote { .. } => {
                    distributed = true;
                    continue;
                }
                NodeKind::Gather { .. } => {
                    distributed = false;
                    continue;
                }
                _ if distributed => continue,
                NodeKind::EnumerateCollection { collection, .. }
                | NodeKind::IndexScan { collection, .. } => (collection, None),
                NodeKind::Modify {
                    collection,
                    input,
                    key,
                    ..
                } => (collection, Some(key.unwrap_or(*input))),
                _ => continue,
            };
            if !ctx.estimator.metadata().get(collection)?.is_sharded() {
                continue;
            }
            let end = if route.is_some() {
                idx + 1
            } else {
                nodes
                    .iter()
                    .enumerate()
                    .skip(idx + 1)
                    .find(|(_, n)| {
                        !matches!(
                            n.kind,
                            NodeKind::Calculation { .. } | NodeKind::Filter { .. }
                        )
                    })
                    .map_or(nodes.len(), |(j, _)| j)
            };
            let mut edit = PlanEdit::new(plan, &scope, pipeline);
            edit.insert(
                end,
                NodeKind::Gather {
                    collection: collection.clone(),
                    sort: Vec::new(),
                },
            );
            edit.insert(
                idx,
                NodeKind::Remote {
                    collection: collection.clone(),
                },
            );
            edit.insert(
                idx,
                NodeKind::Scatter {
                    collection: collection.clone(),
                    route,
                },
            );
            return Ok(vec![edit.finish()]);
        }
        Ok(Vec::new())
    }
}

/// Moves a Sort that directly follows a Gather into the shard part and lets
/// the Gather merge the sorted shard streams.
pub struct DistributeSortToCluster;

impl Rule for DistributeSortToCluster {
    fn name(&self) -> &'static str {
        "distribute-sort-to-cluster"
    }

    fn pass(&self) -> u32 {
        71
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        let pipeline = plan.root();
        let nodes = pipeline.nodes();
        let mut remote = None;
        for (idx, node) in nodes.iter().enumerate() {
            match &node.kind {
                NodeKind::Remote { .. } => remote = Some(idx),
                NodeKind::Gather { collection, sort } if sort.is_empty() => {
                    let Some(start) = remote else { continue };
                    let Some(NodeKind::Sort { elements }) = nodes.get(idx + 1).map(|n| &n.kind)
                    else {
                        continue;
                    };
                    let shard_side = elements.iter().all(|e| {
                        pipeline
                            .producer_of(e.variable)
                            .is_some_and(|p| p > start && p < idx)
                    });
                    if !shard_side {
                        continue;
                    }
                    let mut edit = PlanEdit::new(plan, &Scope::root(), pipeline);
                    edit.nodes.remove(idx + 1);
                    edit.replace(
                        idx,
                        NodeKind::Gather {
                            collection: collection.clone(),
                            sort: elements.clone(),
                        },
                    );
                    edit.insert(
                        idx,
                        NodeKind::Sort {
                            elements: elements.clone(),
                        },
                    );
                    return Ok(vec![edit.finish()]);
                }
                _ => {}
            }
        }
        Ok(Vec::new())
    }
}

/// Moves a filter or calculation that directly follows a Gather into the
/// shard part of a read, so shards drop rows before they are shipped.
pub struct DistributeFilterCalcToCluster;

impl Rule for DistributeFilterCalcToCluster {
    fn name(&self) -> &'static str {
        "distribute-filtercalc-to-cluster"
    }

    fn pass(&self) -> u32 {
        71
    }

    fn applies(&self, _plan: &Plan, ctx: &RuleContext<'_>) -> bool {
        ctx.config.cluster
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        let pipeline = plan.root();
        let nodes = pipeline.nodes();
        let mut remote = None;
        for (idx, node) in nodes.iter().enumerate() {
            match &node.kind {
                NodeKind::Remote { .. } => remote = Some(idx),
                NodeKind::Gather { .. } => {
                    let Some(start) = remote.take() else { continue };
                    if nodes[start + 1..idx]
                        .iter()
                        .any(|n| matches!(n.kind, NodeKind::Modify { .. }))
                    {
                        continue;
                    }
                    let movable = match nodes.get(idx + 1).map(|n| &n.kind) {
                        Some(NodeKind::Filter { .. }) => true,
                        Some(NodeKind::Calculation { expression, .. }) => {
                            expression.is_movable() && !expression.can_throw()
                        }
                        _ => false,
                    };
                    if !movable {
                        continue;
                    }
                    let mut edit = PlanEdit::new(plan, &Scope::root(), pipeline);
                    let moved = edit.nodes.remove(idx + 1);
                    edit.nodes.insert(idx, moved);
                    return Ok(vec![edit.finish()]);
                }
                _ => {}
            }
        }
        Ok(Vec::new())
    }
}

/// Drops a broadcasting Scatter that only forwards the initial row.
pub struct RemoveUnnecessaryRemoteScatter;

impl Rule for RemoveUnnecessaryRemoteScatter {
    fn name(&self) -> &'static str {
        "remove-unnecessary-remote-scatter"
    }

    fn pass(&self) -> u32 {
        72
    }

    fn apply(&self, plan: &Plan, _ctx: &RuleContext<'_>) -> Result<Vec<Plan>> {
        let pipeline = plan.root();
        match pipeline.get(1).map(|n| &n.kind) {
            Some(NodeKind::Scatter { route: None, .. }) => {
                let mut edit = PlanEdit::new(plan, &Scope::root(), pipeline);
                edit.nodes.remove(1);
                Ok(vec![edit.finish()])
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::query::builder::PlanBuilder;
    use crate::query::expr::{ArithOp, CompareOp, Expression};
    use crate::query::metadata::{CollectionInfo, MetadataSnapshot};
    use crate::query::optimizer::rules::test_support::{kinds, run_rule};
    use serde_json::json;

    fn cluster_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.optimizer.cluster = true;
        config
    }

    fn sharded() -> MetadataSnapshot {
        MetadataSnapshot::from_collections([CollectionInfo::new("c", 100).with_shards(3, &[])])
    }

    #[test]
    fn read_is_wrapped_and_sorted_on_shards() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.filter_expr(Expression::compare(
            CompareOp::Gt,
            Expression::attribute(doc, "v"),
            Expression::value(json!(1)),
        ));
        let key = b.calc("key", Expression::attribute(doc, "v"));
        b.sort(&[(key, true)]);
        b.return_var(doc);
        let config = cluster_config();
        let snapshot = sharded();
        let plan = b.build().expect("plan");
        let out = run_rule(&ScatterInCluster, &plan, &config, &snapshot);
        let out = run_rule(&DistributeSortToCluster, &out, &config, &snapshot);
        let out = run_rule(&RemoveUnnecessaryRemoteScatter, &out, &config, &snapshot);
        assert_eq!(
            kinds(&out),
            [
                "Singleton",
                "Remote",
                "EnumerateCollection",
                "Calculation",
                "Filter",
                "Calculation",
                "Sort",
                "Gather",
                "Return"
            ]
        );
        assert!(matches!(
            &out.root().nodes()[7].kind,
            NodeKind::Gather { sort, .. } if sort.len() == 1
        ));
    }

    #[test]
    fn calculation_after_gather_runs_on_shards() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        let key = b.calc("key", Expression::attribute(doc, "v"));
        b.sort(&[(key, true)]);
        let label = b.calc("label", Expression::attribute(doc, "name"));
        let ratio = b.calc(
            "ratio",
            Expression::arithmetic(
                ArithOp::Div,
                Expression::value(json!(1)),
                Expression::attribute(doc, "v"),
            ),
        );
        b.return_expr(Expression::and(
            Expression::reference(label),
            Expression::reference(ratio),
        ));
        let config = cluster_config();
        let snapshot = sharded();
        let out = run_rule(&ScatterInCluster, &b.build().expect("plan"), &config, &snapshot);
        let out = run_rule(&DistributeSortToCluster, &out, &config, &snapshot);
        let out = run_rule(&DistributeFilterCalcToCluster, &out, &config, &snapshot);
        assert_eq!(
            kinds(&out),
            [
                "Singleton",
                "Scatter",
                "Remote",
                "EnumerateCollection",
                "Calculation",
                "Sort",
                "Calculation",
                "Gather",
                "Calculation",
                "Calculation",
                "Return"
            ]
        );
        assert!(matches!(
            &out.root().nodes()[6].kind,
            NodeKind::Calculation { out, .. } if *out == label
        ));
    }

    #[test]
    fn filters_stay_put_without_cluster() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.return_var(doc);
        let plan = b.build().expect("plan");
        let out = run_rule(
            &DistributeFilterCalcToCluster,
            &plan,
            &EngineConfig::default(),
            &sharded(),
        );
        assert_eq!(out, plan);
    }

    #[test]
    fn insert_is_routed_by_document() {
        let mut b = PlanBuilder::new();
        let item = b.for_values("i", vec![json!({"_key": "a"})]);
        b.insert("c", item);
        let config = cluster_config();
        let out = run_rule(&ScatterInCluster, &b.build().expect("plan"), &config, &sharded());
        assert_eq!(
            kinds(&out),
            [
                "Singleton",
                "Calculation",
                "EnumerateList",
                "Scatter",
                "Remote",
                "Insert",
                "Gather"
            ]
        );
        assert!(matches!(
            &out.root().nodes()[3].kind,
            NodeKind::Scatter { route: Some(r), .. } if *r == item
        ));
    }

    #[test]
    fn unsharded_collections_stay_local() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.return_var(doc);
        let plan = b.build().expect("plan");
        let snapshot = MetadataSnapshot::from_collections([CollectionInfo::new("c", 100)]);
        let out = run_rule(&ScatterInCluster, &plan, &cluster_config(), &snapshot);
        assert_eq!(out, plan);
    }
}
