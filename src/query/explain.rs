//! Explain output for optimized plans.
//!
//! Explain never compiles or runs blocks: it is built from the optimizer
//! output alone, so it cannot fail with an execution error.

use std::fmt;
use std::hash::Hasher;

use serde::Serialize;
use xxhash_rust::xxh64::Xxh64;

use crate::query::estimator::PlanEstimate;
use crate::query::logical::{
    FieldLookup, IndexCondition, NodeKind, Pipeline, Plan, SortElement, VariableTable,
};
use crate::query::metadata::IndexDescriptor;
use crate::query::optimizer::OptimizerOutput;

/// Explain view of the chosen plan.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanExplain {
    /// Nodes in execution order; nested subquery nodes follow their Subquery node.
    pub nodes: Vec<ExplainNode>,
    /// Rules that fired, in first-application order.
    pub rules: Vec<String>,
    /// Estimated total cost.
    pub estimated_cost: f64,
    /// Estimated result rows.
    pub estimated_rows: f64,
    /// Candidate plans compared.
    pub plans_considered: usize,
    /// Deterministic hash of the plan shape.
    pub plan_hash: u64,
}

/// One plan node.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainNode {
    /// Node id.
    pub id: u32,
    /// Node kind name.
    pub kind: &'static str,
    /// Subquery nesting depth.
    pub depth: usize,
    /// Attribute paths read from documents, for scans.
    pub projections: Vec<String>,
    /// The node emits whole documents.
    pub produces_full_document: bool,
    /// Projections are served from index data without fetching documents.
    pub covers_projections_from_index: bool,
    /// Estimated rows leaving the node.
    pub estimated_rows: f64,
    /// Kind-specific properties.
    pub props: Vec<ExplainProp>,
}

/// Single property of an [`ExplainNode`].
#[derive(Clone, Debug, Serialize)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value rendered for display.
    pub value: String,
    /// Whether the value contains literal data that may be redacted.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub redactable: bool,
}

impl ExplainProp {
    fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: false,
        }
    }

    fn literal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: true,
        }
    }
}

impl PlanExplain {
    /// Builds the explain view of an optimizer result.
    pub fn from_output(output: &OptimizerOutput) -> Self {
        let mut explain = Self::from_plan(&output.plan, &output.estimate);
        explain.rules = output.rules.iter().map(|r| (*r).to_owned()).collect();
        explain.plans_considered = output.plans_considered;
        explain
    }

    /// Builds the explain view of a plan that was not optimized.
    pub fn from_plan(plan: &Plan, estimate: &PlanEstimate) -> Self {
        let mut nodes = Vec::new();
        describe_pipeline(plan.root(), plan.variables(), estimate, 0, &mut nodes);
        Self {
            plan_hash: plan_hash(&nodes),
            nodes,
            rules: Vec::new(),
            estimated_cost: estimate.cost,
            estimated_rows: estimate.rows,
            plans_considered: 1,
        }
    }

    /// Kind names in order, nested nodes included.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.nodes.iter().map(|n| n.kind).collect()
    }

    /// Renders the plan as indented text, one node per line.
    pub fn render_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PlanExplain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>4}  {:<20} {:>10}  {}", "id", "kind", "est.rows", "details")?;
        for node in &self.nodes {
            let props: Vec<String> = node
                .props
                .iter()
                .map(|p| format!("{}={}", p.key, p.value))
                .collect();
            let mut details = props.join(" ");
            if !node.projections.is_empty() {
                details.push_str(&format!(" projections=[{}]", node.projections.join(", ")));
            }
            if node.covers_projections_from_index {
                details.push_str(" (covering)");
            }
            writeln!(
                f,
                "{:>4}  {:<20} {:>10.0}  {}",
                node.id,
                format!("{}{}", "  ".repeat(node.depth), node.kind),
                node.estimated_rows,
                details.trim_start()
            )?;
        }
        if !self.rules.is_empty() {
            writeln!(f, "rules: {}", self.rules.join(", "))?;
        }
        write!(
            f,
            "cost: {:.2}  plans: {}  hash: {:016x}",
            self.estimated_cost, self.plans_considered, self.plan_hash
        )
    }
}

fn describe_pipeline(
    pipeline: &Pipeline,
    vars: &VariableTable,
    estimate: &PlanEstimate,
    depth: usize,
    out: &mut Vec<ExplainNode>,
) {
    for node in pipeline.nodes() {
        let (projections, full, covering) = match &node.kind {
            NodeKind::EnumerateCollection { projections, .. } => {
                (projections.paths().to_vec(), projections.is_empty(), false)
            }
            NodeKind::IndexScan {
                projections,
                covering,
                ..
            } => (
                projections.paths().to_vec(),
                projections.is_empty() && !covering,
                *covering,
            ),
            NodeKind::Materialize { .. } => (Vec::new(), true, false),
            _ => (Vec::new(), false, false),
        };
        out.push(ExplainNode {
            id: node.id.0,
            kind: node.kind.name(),
            depth,
            projections: projections.iter().map(ToString::to_string).collect(),
            produces_full_document: full,
            covers_projections_from_index: covering,
            estimated_rows: estimate.node_rows.get(&node.id).copied().unwrap_or(0.0),
            props: node_props(&node.kind, vars),
        });
        if let NodeKind::Subquery { subquery, .. } = &node.kind {
            describe_pipeline(subquery, vars, estimate, depth + 1, out);
        }
    }
}

fn node_props(kind: &NodeKind, vars: &VariableTable) -> Vec<ExplainProp> {
    let var = |v| vars.name(v);
    match kind {
        NodeKind::Singleton | NodeKind::NoResults => Vec::new(),
        NodeKind::EnumerateCollection {
            collection,
            out,
            filter,
            ..
        } => {
            let mut props = vec![
                ExplainProp::plain("collection", collection.clone()),
                ExplainProp::plain("out", var(*out)),
            ];
            if let Some(filter) = filter {
                props.push(ExplainProp::literal("filter", filter.render(vars)));
            }
            props
        }
        NodeKind::IndexScan {
            collection,
            index,
            condition,
            out,
            filter,
            reverse,
            ..
        } => {
            let mut props = vec![
                ExplainProp::plain("collection", collection.clone()),
                ExplainProp::plain("index", index.to_string()),
                ExplainProp::literal("condition", render_condition(index, condition, vars)),
                ExplainProp::plain("out", var(*out)),
            ];
            if *reverse {
                props.push(ExplainProp::plain("reverse", "true"));
            }
            if let Some(filter) = filter {
                props.push(ExplainProp::literal("filter", filter.render(vars)));
            }
            props
        }
        NodeKind::Calculation { out, expression } => vec![
            ExplainProp::plain("out", var(*out)),
            ExplainProp::literal("expression", expression.render(vars)),
        ],
        NodeKind::Filter { input } | NodeKind::Return { input } => {
            vec![ExplainProp::plain("input", var(*input))]
        }
        NodeKind::Sort { elements } => {
            vec![ExplainProp::plain("by", render_sort(elements, vars))]
        }
        NodeKind::Limit { offset, count } => vec![
            ExplainProp::plain("offset", offset.to_string()),
            ExplainProp::plain("count", count.to_string()),
        ],
        NodeKind::Collect {
            groups,
            aggregates,
            count,
        } => {
            let mut props = Vec::new();
            if !groups.is_empty() {
                let rendered: Vec<String> = groups
                    .iter()
                    .map(|g| format!("{} = {}", var(g.out), var(g.input)))
                    .collect();
                props.push(ExplainProp::plain("groups", rendered.join(", ")));
            }
            if !aggregates.is_empty() {
                let rendered: Vec<String> = aggregates
                    .iter()
                    .map(|a| {
                        let input = a.input.map(var).unwrap_or_default();
                        format!("{} = {:?}({input})", var(a.out), a.function)
                    })
                    .collect();
                props.push(ExplainProp::plain("aggregates", rendered.join(", ")));
            }
            if let Some(count) = count {
                props.push(ExplainProp::plain("count", var(*count)));
            }
            props
        }
        NodeKind::EnumerateList { input, out } => vec![
            ExplainProp::plain("input", var(*input)),
            ExplainProp::plain("out", var(*out)),
        ],
        NodeKind::Subquery { out, .. } => vec![ExplainProp::plain("out", var(*out))],
        NodeKind::Modify {
            collection,
            input,
            key,
            options,
            old,
            new,
            ..
        } => {
            let mut props = vec![
                ExplainProp::plain("collection", collection.clone()),
                ExplainProp::plain("input", var(*input)),
            ];
            if let Some(key) = key {
                props.push(ExplainProp::plain("key", var(*key)));
            }
            if options.ignore_errors {
                props.push(ExplainProp::plain("ignoreErrors", "true"));
            }
            if let Some(old) = old {
                props.push(ExplainProp::plain("old", var(*old)));
            }
            if let Some(new) = new {
                props.push(ExplainProp::plain("new", var(*new)));
            }
            props
        }
        NodeKind::Scatter { collection, route } => {
            let mut props = vec![ExplainProp::plain("collection", collection.clone())];
            if let Some(route) = route {
                props.push(ExplainProp::plain("route", var(*route)));
            }
            props
        }
        NodeKind::Remote { collection } => {
            vec![ExplainProp::plain("collection", collection.clone())]
        }
        NodeKind::Gather { collection, sort } => {
            let mut props = vec![ExplainProp::plain("collection", collection.clone())];
            if !sort.is_empty() {
                props.push(ExplainProp::plain("merge", render_sort(sort, vars)));
            }
            props
        }
        NodeKind::Materialize {
            collection,
            input,
            out,
        } => vec![
            ExplainProp::plain("collection", collection.clone()),
            ExplainProp::plain("input", var(*input)),
            ExplainProp::plain("out", var(*out)),
        ],
    }
}

fn render_sort(elements: &[SortElement], vars: &VariableTable) -> String {
    elements
        .iter()
        .map(|e| {
            format!(
                "{} {}",
                vars.name(e.variable),
                if e.ascending { "ASC" } else { "DESC" }
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_condition(
    index: &IndexDescriptor,
    condition: &IndexCondition,
    vars: &VariableTable,
) -> String {
    if condition.lookups.is_empty() {
        return "full range".to_owned();
    }
    let mut parts = Vec::new();
    for (field, lookup) in index.fields.iter().zip(&condition.lookups) {
        match lookup {
            FieldLookup::Eq { value } => parts.push(format!("{field} == {}", value.render(vars))),
            FieldLookup::In { values } => {
                parts.push(format!("{field} IN {}", values.render(vars)))
            }
            FieldLookup::Range { lower, upper } => {
                if let Some(bound) = lower {
                    let op = if bound.inclusive { ">=" } else { ">" };
                    parts.push(format!("{field} {op} {}", bound.value.render(vars)));
                }
                if let Some(bound) = upper {
                    let op = if bound.inclusive { "<=" } else { "<" };
                    parts.push(format!("{field} {op} {}", bound.value.render(vars)));
                }
            }
        }
    }
    parts.join(" AND ")
}

/// Hash over kinds and properties, ignoring node ids.
fn plan_hash(nodes: &[ExplainNode]) -> u64 {
    let mut hasher = Xxh64::new(0);
    for node in nodes {
        hasher.write(node.kind.as_bytes());
        hasher.write_u64(node.depth as u64);
        for prop in &node.props {
            hasher.write(prop.key.as_bytes());
            hasher.write(prop.value.as_bytes());
        }
        for projection in &node.projections {
            hasher.write(projection.as_bytes());
        }
        hasher.write_u8(node.covers_projections_from_index as u8);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::query::builder::PlanBuilder;
    use crate::query::expr::{CompareOp, Expression};
    use crate::query::metadata::{CollectionInfo, IndexKind, MetadataSnapshot};
    use crate::query::optimizer::Optimizer;
    use serde_json::json;

    fn optimized() -> OptimizerOutput {
        let config = EngineConfig::default();
        let snapshot = MetadataSnapshot::from_collections([CollectionInfo::new("c", 500)
            .with_index(IndexDescriptor::new("by_a", IndexKind::Sorted, &["a"]))]);
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.filter_expr(Expression::compare(
            CompareOp::Ge,
            Expression::attribute(doc, "a"),
            Expression::value(json!(3)),
        ));
        b.return_expr(Expression::attribute(doc, "a"));
        let plan = b.build().expect("plan");
        Optimizer::new(&config, &snapshot)
            .optimize(&plan)
            .expect("optimize")
    }

    #[test]
    fn reports_covering_index_scan() {
        let explain = PlanExplain::from_output(&optimized());
        let scan = explain
            .nodes
            .iter()
            .find(|n| n.kind == "IndexScan")
            .expect("index scan");
        assert!(scan.covers_projections_from_index);
        assert!(!scan.produces_full_document);
        assert_eq!(scan.projections, ["a"]);
        assert!(explain.rules.contains(&"use-indexes".to_owned()));
    }

    #[test]
    fn hash_ignores_node_ids() {
        let first = PlanExplain::from_output(&optimized());
        let second = PlanExplain::from_output(&optimized());
        assert_eq!(first.plan_hash, second.plan_hash);
        let json = serde_json::to_value(&first).expect("serialize");
        assert!(json["nodes"][1].get("coversProjectionsFromIndex").is_some());
        assert!(first.render_text().contains("IndexScan"));
    }
}
