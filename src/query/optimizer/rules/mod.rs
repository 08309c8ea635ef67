//! Built-in rules and the helpers they share.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::query::expr::Expression;
use crate::query::logical::{
    AttributePath, FieldLookup, NodeKind, Pipeline, Plan, PlanNode, Scope, SortElement,
    VariableId,
};
use crate::query::optimizer::Rule;
use crate::query::value::KEY_ATTRIBUTE;
use crate::types::Result;

mod calculations;
mod cluster;
mod enumerations;
mod filters;
mod indexes;
mod materialize;
mod projections;
mod sorts;

pub use calculations::{
    CollapseAliasCalculations, FoldConstantCalculations, RemoveRedundantCalculations,
    RemoveUnnecessaryCalculations,
};
pub use cluster::{
    DistributeFilterCalcToCluster, DistributeSortToCluster, RemoveUnnecessaryRemoteScatter,
    ScatterInCluster,
};
pub use enumerations::InterchangeAdjacentEnumerations;
pub use filters::{
    MoveCalculationsDown, MoveCalculationsUp, MoveFiltersUp, RemoveUnnecessaryFilters,
    ReplaceOrWithIn, SplitFilters,
};
pub use indexes::{RemoveFiltersCoveredByIndex, UseIndexForSort, UseIndexes};
pub use materialize::LateDocumentMaterialization;
pub use projections::{PushFiltersIntoEnumeration, ReduceExtractionToProjection};
pub use sorts::RemoveRedundantSorts;

/// Every built-in rule.
pub fn all_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(RemoveRedundantCalculations),
        Box::new(FoldConstantCalculations),
        Box::new(CollapseAliasCalculations),
        Box::new(RemoveUnnecessaryCalculations::early()),
        Box::new(SplitFilters),
        Box::new(RemoveUnnecessaryFilters),
        Box::new(MoveCalculationsUp),
        Box::new(MoveFiltersUp),
        Box::new(ReplaceOrWithIn),
        Box::new(RemoveRedundantSorts),
        Box::new(InterchangeAdjacentEnumerations),
        Box::new(UseIndexes),
        Box::new(UseIndexForSort),
        Box::new(RemoveFiltersCoveredByIndex),
        Box::new(PushFiltersIntoEnumeration),
        Box::new(ReduceExtractionToProjection),
        Box::new(MoveCalculationsDown),
        Box::new(LateDocumentMaterialization),
        Box::new(ScatterInCluster),
        Box::new(DistributeFilterCalcToCluster),
        Box::new(DistributeSortToCluster),
        Box::new(RemoveUnnecessaryRemoteScatter),
        Box::new(RemoveUnnecessaryCalculations::late()),
    ]
}

/// In-progress rewrite of one pipeline scope.
pub(crate) struct PlanEdit {
    plan: Plan,
    scope: Scope,
    pub(crate) nodes: Vec<Arc<PlanNode>>,
}

impl PlanEdit {
    pub(crate) fn new(plan: &Plan, scope: &Scope, pipeline: &Pipeline) -> Self {
        Self {
            plan: plan.clone(),
            scope: scope.clone(),
            nodes: pipeline.nodes().to_vec(),
        }
    }

    /// Allocates a fresh node.
    pub(crate) fn node(&mut self, kind: NodeKind) -> Arc<PlanNode> {
        self.plan.create_node(kind)
    }

    /// Replaces the node at `idx` with a fresh allocation of `kind`.
    pub(crate) fn replace(&mut self, idx: usize, kind: NodeKind) {
        let node = self.node(kind);
        self.nodes[idx] = node;
    }

    /// Inserts a fresh node at `idx`.
    pub(crate) fn insert(&mut self, idx: usize, kind: NodeKind) {
        let node = self.node(kind);
        self.nodes.insert(idx, node);
    }

    /// Allocates a variable.
    pub(crate) fn variable(&mut self, name: impl Into<String>) -> VariableId {
        self.plan.create_variable(name)
    }

    /// Name of a variable.
    pub(crate) fn variable_name(&self, var: VariableId) -> String {
        self.plan.variables().name(var)
    }

    /// Renames every variable reference in the scope through `map`.
    pub(crate) fn rename(&mut self, map: &FxHashMap<VariableId, VariableId>) {
        let renamed = Pipeline::new(std::mem::take(&mut self.nodes)).replace_variables(map);
        self.nodes = renamed.nodes().to_vec();
    }

    pub(crate) fn finish(mut self) -> Plan {
        self.plan
            .set_pipeline(&self.scope, Pipeline::new(self.nodes));
        self.plan
    }
}

/// Runs `rewrite` over every scope and returns the first rewritten plan.
pub(crate) fn first_rewrite<F>(plan: &Plan, mut rewrite: F) -> Result<Vec<Plan>>
where
    F: FnMut(&Scope, &Pipeline) -> Result<Option<Plan>>,
{
    for scope in plan.scopes() {
        let Some(pipeline) = plan.pipeline(&scope) else {
            continue;
        };
        if let Some(next) = rewrite(&scope, pipeline)? {
            return Ok(vec![next]);
        }
    }
    Ok(Vec::new())
}

/// Calculation producing `var` in `pipeline`.
pub(crate) fn producer_calculation(
    pipeline: &Pipeline,
    var: VariableId,
) -> Option<(usize, &Expression)> {
    let idx = pipeline.producer_of(var)?;
    match &pipeline.get(idx)?.kind {
        NodeKind::Calculation { expression, .. } => Some((idx, expression)),
        _ => None,
    }
}

/// Attribute paths of `var` read by the nodes after `from`.
///
/// `None` means some node needs the whole value; an empty list means the
/// variable is not read at all.
pub(crate) fn needed_paths(
    pipeline: &Pipeline,
    from: usize,
    var: VariableId,
) -> Option<Vec<AttributePath>> {
    let mut uses = Some(Vec::new());
    for node in pipeline.nodes().iter().skip(from + 1) {
        node_uses(&node.kind, var, &mut uses);
        uses.as_ref()?;
    }
    uses
}

/// Records how `kind` reads `var`.
pub(crate) fn node_uses(kind: &NodeKind, var: VariableId, uses: &mut Option<Vec<AttributePath>>) {
    match kind {
        NodeKind::Calculation { expression, .. } => expression.attribute_uses(var, uses),
        NodeKind::EnumerateCollection { filter, .. } => {
            if let Some(filter) = filter {
                filter.attribute_uses(var, uses);
            }
        }
        NodeKind::IndexScan {
            condition, filter, ..
        } => {
            for lookup in &condition.lookups {
                for expr in lookup_expressions(lookup) {
                    expr.attribute_uses(var, uses);
                }
            }
            if let Some(filter) = filter {
                filter.attribute_uses(var, uses);
            }
        }
        NodeKind::Subquery { subquery, .. } => {
            for inner in subquery.nodes() {
                node_uses(&inner.kind, var, uses);
            }
        }
        NodeKind::Materialize { input, .. } if *input == var => {
            if let Some(paths) = uses.as_mut() {
                paths.push(AttributePath(vec![KEY_ATTRIBUTE.to_owned()]));
            }
        }
        other => {
            if other.input_variables().contains(&var) {
                *uses = None;
            }
        }
    }
}

/// Expressions evaluated by an index lookup.
pub(crate) fn lookup_expressions(lookup: &FieldLookup) -> Vec<&Expression> {
    match lookup {
        FieldLookup::Eq { value } => vec![value],
        FieldLookup::In { values } => vec![values],
        FieldLookup::Range { lower, upper } => lower
            .iter()
            .chain(upper.iter())
            .map(|bound| &bound.value)
            .collect(),
    }
}

/// Resolves sort elements to `(path, ascending)` on `doc` when each element
/// is a Calculation of the form `doc.path`.
pub(crate) fn sort_paths(
    pipeline: &Pipeline,
    elements: &[SortElement],
    doc: VariableId,
) -> Option<Vec<(AttributePath, bool)>> {
    elements
        .iter()
        .map(|element| {
            let (_, expr) = producer_calculation(pipeline, element.variable)?;
            match expr.as_attribute_access() {
                Some((base, path)) if base == doc => Some((path, element.ascending)),
                _ => None,
            }
        })
        .collect()
}

/// True if a variable is visible to (produced at or before) position `at`,
/// or comes from an enclosing scope.
pub(crate) fn available_at(pipeline: &Pipeline, var: VariableId, at: usize) -> bool {
    match pipeline.producer_of(var) {
        Some(idx) => idx <= at,
        None => true,
    }
}

/// True if any node before `idx` writes, directly or inside a subquery.
pub(crate) fn has_modification_before(pipeline: &Pipeline, idx: usize) -> bool {
    fn writes(pipeline: &Pipeline) -> bool {
        pipeline.nodes().iter().any(|node| match &node.kind {
            NodeKind::Modify { .. } => true,
            NodeKind::Subquery { subquery, .. } => writes(subquery),
            _ => false,
        })
    }
    pipeline.nodes().iter().take(idx).any(|node| match &node.kind {
        NodeKind::Modify { .. } => true,
        NodeKind::Subquery { subquery, .. } => writes(subquery),
        _ => false,
    })
}
