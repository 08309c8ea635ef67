//! The full rule engine over realistic plans.

use aqueduct::query::expr::{CompareOp, Expression};
use aqueduct::query::explain::PlanExplain;
use aqueduct::query::logical::{NodeKind, Plan};
use aqueduct::query::metadata::{CollectionInfo, IndexDescriptor, IndexKind, MetadataSnapshot};
use aqueduct::query::optimizer::{Optimizer, OptimizerOutput};
use aqueduct::{EngineConfig, PlanBuilder};
use serde_json::json;

fn snapshot() -> MetadataSnapshot {
    MetadataSnapshot::from_collections([
        CollectionInfo::new("orders", 50_000)
            .with_index(IndexDescriptor::new("by_total", IndexKind::Sorted, &["total"]))
            .with_index(IndexDescriptor::new("by_status", IndexKind::Hash, &["status"])),
        CollectionInfo::new("items", 2_000),
    ])
}

fn sharded_snapshot() -> MetadataSnapshot {
    MetadataSnapshot::from_collections([CollectionInfo::new("orders", 50_000).with_shards(4, &[])])
}

fn optimize(plan: &Plan, config: &EngineConfig, snapshot: &MetadataSnapshot) -> OptimizerOutput {
    Optimizer::new(config, snapshot)
        .optimize(plan)
        .expect("optimize")
}

fn kinds(plan: &Plan) -> Vec<&'static str> {
    plan.root().nodes().iter().map(|n| n.kind.name()).collect()
}

fn big_orders_by_total() -> Plan {
    let mut b = PlanBuilder::new();
    let o = b.for_collection("orders", "o");
    b.filter_expr(Expression::compare(
        CompareOp::Gt,
        Expression::attribute(o, "total"),
        Expression::value(json!(100)),
    ));
    b.sort_by(Expression::attribute(o, "total"), true);
    b.return_var(o);
    b.build().expect("plan")
}

fn open_and_recent() -> Plan {
    let mut b = PlanBuilder::new();
    let o = b.for_collection("orders", "o");
    b.filter_expr(Expression::and(
        Expression::compare(
            CompareOp::Eq,
            Expression::attribute(o, "status"),
            Expression::value(json!("open")),
        ),
        Expression::compare(
            CompareOp::Gt,
            Expression::attribute(o, "day"),
            Expression::value(json!(300)),
        ),
    ));
    b.return_var(o);
    b.build().expect("plan")
}

#[test]
fn range_filter_and_sort_share_one_index_scan() {
    let out = optimize(&big_orders_by_total(), &EngineConfig::default(), &snapshot());
    let kinds = kinds(&out.plan);
    assert!(kinds.contains(&"IndexScan"), "{kinds:?}");
    assert!(!kinds.contains(&"Sort"), "{kinds:?}");
    assert!(!kinds.contains(&"EnumerateCollection"));
    assert!(
        out.rules.contains(&"use-indexes") || out.rules.contains(&"use-index-for-sort"),
        "{:?}",
        out.rules
    );
    assert!(out.plans_considered >= 1);
}

#[test]
fn conjunction_is_split_and_matched_against_the_hash_index() {
    let out = optimize(&open_and_recent(), &EngineConfig::default(), &snapshot());
    assert!(out.rules.contains(&"split-filters"), "{:?}", out.rules);
    let scan = out
        .plan
        .root()
        .nodes()
        .iter()
        .find_map(|n| match &n.kind {
            NodeKind::IndexScan { index, .. } => Some(index.id.clone()),
            _ => None,
        })
        .expect("index scan");
    assert_eq!(scan, "by_status");
}

#[test]
fn optimizing_an_optimized_plan_changes_nothing() {
    let config = EngineConfig::default();
    let snapshot = snapshot();
    for plan in [big_orders_by_total(), open_and_recent()] {
        let first = optimize(&plan, &config, &snapshot);
        let second = optimize(&first.plan, &config, &snapshot);
        assert_eq!(first.plan, second.plan);
        assert_eq!(
            PlanExplain::from_output(&first).plan_hash,
            PlanExplain::from_output(&second).plan_hash
        );
    }
}

#[test]
fn explain_reports_the_fired_rules() {
    let out = optimize(&big_orders_by_total(), &EngineConfig::default(), &snapshot());
    let explain = PlanExplain::from_output(&out);
    let names: Vec<&str> = out.rules.to_vec();
    assert_eq!(explain.rules, names);
    assert_eq!(explain.kinds(), kinds(&out.plan));
    assert!(explain.render_text().contains("IndexScan"));
}

#[test]
fn disabled_index_rules_leave_the_full_scan() {
    let mut config = EngineConfig::default();
    config.optimizer.disabled_rules = vec!["use-indexes".into(), "use-index-for-sort".into()];
    let out = optimize(&big_orders_by_total(), &config, &snapshot());
    assert!(!out.rules.contains(&"use-indexes"));
    assert!(!out.rules.contains(&"use-index-for-sort"));
    assert!(!kinds(&out.plan).contains(&"IndexScan"));
    assert!(kinds(&out.plan).contains(&"Sort"));
}

#[test]
fn all_rules_can_be_disabled_from_toml() {
    let config = EngineConfig::from_toml_str("[optimizer]\ndisabled_rules = [\"-all\"]\n")
        .expect("config");
    let plan = big_orders_by_total();
    let out = optimize(&plan, &config, &snapshot());
    assert_eq!(out.plan, plan);
    assert!(out.rules.is_empty());
}

#[test]
fn cluster_rules_need_the_cluster_switch() {
    let plan = big_orders_by_total();
    let local = optimize(&plan, &EngineConfig::default(), &sharded_snapshot());
    assert!(!kinds(&local.plan).contains(&"Remote"));

    let mut config = EngineConfig::default();
    config.optimizer.cluster = true;
    let out = optimize(&plan, &config, &sharded_snapshot());
    let kinds = kinds(&out.plan);
    assert!(kinds.contains(&"Remote"), "{kinds:?}");
    assert!(kinds.contains(&"Gather"), "{kinds:?}");
    assert!(!kinds.contains(&"Scatter"), "reads need no scatter: {kinds:?}");
    for rule in [
        "scatter-in-cluster",
        "distribute-sort-to-cluster",
        "remove-unnecessary-remote-scatter",
    ] {
        assert!(out.rules.contains(&rule), "{rule} in {:?}", out.rules);
    }
    let gather_sorted = out.plan.root().nodes().iter().any(|n| {
        matches!(&n.kind, NodeKind::Gather { sort, .. } if !sort.is_empty())
    });
    assert!(gather_sorted);
    let remote = kinds.iter().position(|k| *k == "Remote").expect("remote");
    let gather = kinds.iter().position(|k| *k == "Gather").expect("gather");
    assert!(kinds[remote..gather].contains(&"Sort"));
}

#[test]
fn cluster_insert_is_routed_by_its_document() {
    let mut b = PlanBuilder::new();
    let item = b.for_values("item", vec![json!({"_key": "a"}), json!({"_key": "b"})]);
    b.insert("orders", item);
    let plan = b.build().expect("plan");
    let mut config = EngineConfig::default();
    config.optimizer.cluster = true;
    let out = optimize(&plan, &config, &sharded_snapshot());
    let nodes = out.plan.root().nodes();
    let scatter = nodes
        .iter()
        .position(|n| matches!(n.kind, NodeKind::Scatter { route: Some(_), .. }))
        .expect("routed scatter");
    assert_eq!(nodes[scatter + 1].kind.name(), "Remote");
    assert_eq!(nodes[scatter + 2].kind.name(), "Insert");
    assert_eq!(nodes[scatter + 3].kind.name(), "Gather");
}

#[test]
fn random_filter_is_not_hoisted_out_of_the_inner_loop() {
    let mut b = PlanBuilder::new();
    let o = b.for_collection("orders", "o");
    b.for_collection("items", "i");
    b.filter_expr(Expression::compare(
        CompareOp::Lt,
        Expression::call("RAND", vec![]),
        Expression::value(json!(0.5)),
    ));
    b.return_var(o);
    let plan = b.build().expect("plan");
    let out = optimize(&plan, &EngineConfig::default(), &snapshot());
    let nodes = out.plan.root().nodes();
    let inner = nodes
        .iter()
        .position(|n| n.kind.scanned_collection() == Some("items"))
        .expect("inner loop");
    for node in &nodes[..inner] {
        let uses_rand = match &node.kind {
            NodeKind::Calculation { expression, .. } => expression.calls_function("RAND"),
            NodeKind::EnumerateCollection { filter, .. } | NodeKind::IndexScan { filter, .. } => {
                filter.as_ref().is_some_and(|f| f.calls_function("RAND"))
            }
            _ => false,
        };
        assert!(!uses_rand, "RAND evaluated before the inner loop: {:?}", kinds(&out.plan));
    }
}

#[test]
fn constant_false_filter_produces_no_results() {
    let mut b = PlanBuilder::new();
    let o = b.for_collection("orders", "o");
    b.filter_expr(Expression::compare(
        CompareOp::Eq,
        Expression::value(json!(1)),
        Expression::value(json!(2)),
    ));
    b.return_var(o);
    let out = optimize(&b.build().expect("plan"), &EngineConfig::default(), &snapshot());
    assert!(kinds(&out.plan).contains(&"NoResults"), "{:?}", kinds(&out.plan));
    assert!(out.rules.contains(&"remove-unnecessary-filters"));
}

#[test]
fn equality_alternatives_use_the_hash_index() {
    let mut b = PlanBuilder::new();
    let o = b.for_collection("orders", "o");
    let status = |value: &str| {
        Expression::compare(
            CompareOp::Eq,
            Expression::attribute(o, "status"),
            Expression::value(json!(value)),
        )
    };
    b.filter_expr(Expression::or(status("open"), status("held")));
    b.return_var(o);
    let out = optimize(&b.build().expect("plan"), &EngineConfig::default(), &snapshot());
    assert!(out.rules.contains(&"replace-or-with-in"), "{:?}", out.rules);
    let index = out.plan.root().nodes().iter().find_map(|n| match &n.kind {
        NodeKind::IndexScan { index, .. } => Some(index.id.clone()),
        _ => None,
    });
    assert_eq!(index.as_deref(), Some("by_status"));
}

#[test]
fn smaller_collection_becomes_the_outer_loop() {
    let mut b = PlanBuilder::new();
    let o = b.for_collection("orders", "o");
    b.for_collection("items", "i");
    b.return_var(o);
    let out = optimize(&b.build().expect("plan"), &EngineConfig::default(), &snapshot());
    let scans: Vec<_> = out
        .plan
        .root()
        .nodes()
        .iter()
        .filter_map(|n| n.kind.scanned_collection())
        .collect();
    assert_eq!(scans, ["items", "orders"]);
    assert!(out.rules.contains(&"interchange-adjacent-enumerations"));
    assert!(out.plans_considered >= 2);
}

#[test]
fn sorted_cluster_read_computes_its_result_on_the_shards() {
    let mut b = PlanBuilder::new();
    let o = b.for_collection("orders", "o");
    b.sort_by(Expression::attribute(o, "total"), false);
    b.return_expr(Expression::attribute(o, "customer"));
    let plan = b.build().expect("plan");
    let mut config = EngineConfig::default();
    config.optimizer.cluster = true;
    let snapshot = sharded_snapshot();
    let out = optimize(&plan, &config, &snapshot);
    let kinds = kinds(&out.plan);
    let gather = kinds.iter().position(|k| *k == "Gather").expect("gather");
    assert_eq!(kinds[gather - 1], "Calculation", "{kinds:?}");
    assert_eq!(kinds[gather + 1..], ["Return"], "{kinds:?}");
    for rule in ["move-calculations-down", "distribute-filtercalc-to-cluster"] {
        assert!(out.rules.contains(&rule), "{rule} in {:?}", out.rules);
    }
    let again = optimize(&out.plan, &config, &snapshot);
    assert_eq!(again.plan, out.plan);
}
