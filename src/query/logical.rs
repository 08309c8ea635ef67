//! Plan node model: typed nodes, variables and the persistent plan structure
//! shared by the optimizer, the explain output and the block compiler.
//!
//! A [`Plan`] is a chain of immutable [`PlanNode`]s held behind `Arc`s. Each node
//! depends on its predecessor in the chain; a Subquery node nests a whole inner
//! [`Pipeline`]. Rules never patch a node: they clone the (cheap) vector of
//! node handles, drop the nodes they replace and allocate fresh ones, so
//! candidate plans produced by a fan-out never observe each other's edits.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::query::expr::Expression;
use crate::query::metadata::IndexDescriptor;
use crate::types::{AqlError, Result};

/// Identifier of a variable; unique within a plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableId(pub u32);

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a plan node; unique within a plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

/// Small inline list of variables used by or produced by a node.
pub type VarList = SmallVec<[VariableId; 4]>;

/// Dotted attribute path such as `address.city`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributePath(pub Vec<String>);

impl AttributePath {
    /// Parses a dotted path.
    pub fn parse(dotted: &str) -> Self {
        Self(dotted.split('.').map(str::to_owned).collect())
    }

    /// Path steps.
    pub fn steps(&self) -> &[String] {
        &self.0
    }

    /// Returns true if `self` is a prefix of (or equal to) `other`.
    pub fn is_prefix_of(&self, other: &AttributePath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Ordered set of attribute paths a node needs from its input documents.
///
/// An empty set means the whole document is required.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectionSet(Vec<AttributePath>);

impl ProjectionSet {
    /// Builds a set; paths are sorted and any path covered by a shorter prefix is dropped.
    pub fn new(mut paths: Vec<AttributePath>) -> Self {
        paths.sort();
        paths.dedup();
        let mut kept: Vec<AttributePath> = Vec::with_capacity(paths.len());
        for path in paths {
            if !kept.iter().any(|prefix| prefix.is_prefix_of(&path)) {
                kept.push(path);
            }
        }
        Self(kept)
    }

    /// Empty set (whole document).
    pub fn full_document() -> Self {
        Self(Vec::new())
    }

    /// True when the whole document is required.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Paths in canonical order.
    pub fn paths(&self) -> &[AttributePath] {
        &self.0
    }

    /// Number of paths.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ProjectionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// One key of a Sort or sorted Gather.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortElement {
    /// Variable whose value is compared.
    pub variable: VariableId,
    /// Ascending when true.
    pub ascending: bool,
}

/// Write operation of a Modify node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifyOp {
    /// Insert a new document.
    Insert,
    /// Merge attributes into an existing document.
    Update,
    /// Replace an existing document.
    Replace,
    /// Remove a document.
    Remove,
}

impl ModifyOp {
    /// Node kind name for explain output.
    pub fn name(self) -> &'static str {
        match self {
            ModifyOp::Insert => "Insert",
            ModifyOp::Update => "Update",
            ModifyOp::Replace => "Replace",
            ModifyOp::Remove => "Remove",
        }
    }
}

/// Per-node write options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModifyOptions {
    /// Record per-document failures and continue instead of aborting.
    #[serde(default)]
    pub ignore_errors: bool,
}

/// Aggregate function of a Collect node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateFunction {
    /// Number of rows in the group.
    Length,
    /// Sum of numeric inputs.
    Sum,
    /// Minimum input.
    Min,
    /// Maximum input.
    Max,
    /// Arithmetic mean of numeric inputs.
    Average,
}

/// `out = input` group key of a Collect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectGroup {
    /// Produced variable.
    pub out: VariableId,
    /// Grouped input variable.
    pub input: VariableId,
}

/// `out = FUNC(input)` aggregate of a Collect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggregate {
    /// Produced variable.
    pub out: VariableId,
    /// Aggregate function.
    pub function: AggregateFunction,
    /// Aggregated input; `None` only for `LENGTH`.
    pub input: Option<VariableId>,
}

/// Bound of a range lookup on one index field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeBound {
    /// Bound value, evaluated once per input row.
    pub value: Expression,
    /// Whether the bound value itself matches.
    pub inclusive: bool,
}

/// Lookup applied to one index field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldLookup {
    /// Field equals the value.
    Eq {
        /// Compared value.
        value: Expression,
    },
    /// Field equals one of the array elements.
    In {
        /// Array expression.
        values: Expression,
    },
    /// Field lies within the bounds.
    Range {
        /// Lower bound, open when absent.
        lower: Option<RangeBound>,
        /// Upper bound, open when absent.
        upper: Option<RangeBound>,
    },
}

impl FieldLookup {
    /// True for equality-style lookups that fix the field to a single value set.
    pub fn is_equality(&self) -> bool {
        matches!(self, FieldLookup::Eq { .. } | FieldLookup::In { .. })
    }
}

/// Condition matched by an index scan.
///
/// `lookups[i]` constrains `index.fields[i]`; equality lookups come first,
/// followed by at most one range lookup. No lookups means a full index scan.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexCondition {
    /// Per-field lookups on the leading index fields.
    pub lookups: Vec<FieldLookup>,
    /// Filter conjuncts the lookups represent exactly.
    #[serde(default)]
    pub covered: Vec<Expression>,
}

/// Typed node variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeKind {
    /// Produces one empty row (or the outer row inside a subquery).
    Singleton,
    /// Full scan over a collection.
    EnumerateCollection {
        /// Collection name.
        collection: String,
        /// Document variable.
        out: VariableId,
        /// Attributes needed from each document; empty means whole document.
        #[serde(default)]
        projections: ProjectionSet,
        /// Condition evaluated during the scan.
        #[serde(default)]
        filter: Option<Expression>,
    },
    /// Scan through an index.
    IndexScan {
        /// Collection name.
        collection: String,
        /// Snapshot of the chosen index.
        index: IndexDescriptor,
        /// Matched condition.
        condition: IndexCondition,
        /// Document variable.
        out: VariableId,
        /// Attributes needed from each document; empty means whole document.
        #[serde(default)]
        projections: ProjectionSet,
        /// Projections are served from index key data without fetching documents.
        #[serde(default)]
        covering: bool,
        /// Condition evaluated during the scan.
        #[serde(default)]
        filter: Option<Expression>,
        /// Iterate in descending index order.
        #[serde(default)]
        reverse: bool,
    },
    /// Evaluates an expression into a variable.
    Calculation {
        /// Produced variable.
        out: VariableId,
        /// Expression to evaluate.
        expression: Expression,
    },
    /// Drops rows whose variable is falsy.
    Filter {
        /// Condition variable.
        input: VariableId,
    },
    /// Sorts all rows.
    Sort {
        /// Sort keys, most significant first.
        elements: Vec<SortElement>,
    },
    /// Skips `offset` rows then passes at most `count`.
    Limit {
        /// Rows to skip.
        offset: u64,
        /// Rows to return.
        count: u64,
    },
    /// Groups rows.
    Collect {
        /// Group keys.
        groups: Vec<CollectGroup>,
        /// Aggregates.
        #[serde(default)]
        aggregates: Vec<Aggregate>,
        /// `WITH COUNT INTO` variable.
        #[serde(default)]
        count: Option<VariableId>,
    },
    /// Iterates an array value.
    EnumerateList {
        /// Array variable.
        input: VariableId,
        /// Element variable.
        out: VariableId,
    },
    /// Runs a nested pipeline per row and collects its results into an array.
    Subquery {
        /// Nested pipeline; starts with Singleton, ends with Return or Modify.
        subquery: Pipeline,
        /// Array of the nested pipeline's results.
        out: VariableId,
    },
    /// Writes documents.
    Modify {
        /// Operation.
        op: ModifyOp,
        /// Target collection.
        collection: String,
        /// Document (insert, update, replace) or key/document (remove).
        input: VariableId,
        /// Key expression variable for `UPDATE key WITH doc`.
        #[serde(default)]
        key: Option<VariableId>,
        /// Failure policy.
        #[serde(default)]
        options: ModifyOptions,
        /// Previous document.
        #[serde(default)]
        old: Option<VariableId>,
        /// Written document.
        #[serde(default)]
        new: Option<VariableId>,
    },
    /// Emits one variable per row to the client.
    Return {
        /// Returned variable.
        input: VariableId,
    },
    /// Distributes rows to shards.
    Scatter {
        /// Sharded collection.
        collection: String,
        /// Route rows by this document variable's shard key; broadcast when absent.
        #[serde(default)]
        route: Option<VariableId>,
    },
    /// Shard-side entry of a distributed part.
    Remote {
        /// Sharded collection.
        collection: String,
    },
    /// Merges shard results.
    Gather {
        /// Sharded collection.
        collection: String,
        /// Merge order; empty means arbitrary interleaving.
        #[serde(default)]
        sort: Vec<SortElement>,
    },
    /// Fetches full documents after late materialization.
    Materialize {
        /// Collection name.
        collection: String,
        /// Partial document carrying `_key`.
        input: VariableId,
        /// Full document variable.
        out: VariableId,
    },
    /// Produces no rows.
    NoResults,
}

impl NodeKind {
    /// Kind name for explain output.
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Singleton => "Singleton",
            NodeKind::EnumerateCollection { .. } => "EnumerateCollection",
            NodeKind::IndexScan { .. } => "IndexScan",
            NodeKind::Calculation { .. } => "Calculation",
            NodeKind::Filter { .. } => "Filter",
            NodeKind::Sort { .. } => "Sort",
            NodeKind::Limit { .. } => "Limit",
            NodeKind::Collect { .. } => "Collect",
            NodeKind::EnumerateList { .. } => "EnumerateList",
            NodeKind::Subquery { .. } => "Subquery",
            NodeKind::Modify { op, .. } => op.name(),
            NodeKind::Return { .. } => "Return",
            NodeKind::Scatter { .. } => "Scatter",
            NodeKind::Remote { .. } => "Remote",
            NodeKind::Gather { .. } => "Gather",
            NodeKind::Materialize { .. } => "Materialize",
            NodeKind::NoResults => "NoResults",
        }
    }

    /// True for nodes that may emit more rows than they receive.
    pub fn is_loop(&self) -> bool {
        matches!(
            self,
            NodeKind::EnumerateCollection { .. }
                | NodeKind::IndexScan { .. }
                | NodeKind::EnumerateList { .. }
        )
    }

    /// True for collection scans.
    pub fn is_scan(&self) -> bool {
        matches!(
            self,
            NodeKind::EnumerateCollection { .. } | NodeKind::IndexScan { .. }
        )
    }

    /// Collection read by a scan node.
    pub fn scanned_collection(&self) -> Option<&str> {
        match self {
            NodeKind::EnumerateCollection { collection, .. }
            | NodeKind::IndexScan { collection, .. } => Some(collection),
            _ => None,
        }
    }

    /// Variables this node reads. For a Subquery these are the outer variables
    /// referenced anywhere inside it.
    pub fn input_variables(&self) -> VarList {
        let mut vars = VarList::new();
        match self {
            NodeKind::Singleton | NodeKind::NoResults | NodeKind::Remote { .. } => {}
            NodeKind::EnumerateCollection { filter, out, .. } => {
                if let Some(expr) = filter {
                    expr.collect_variables(&mut vars);
                }
                // The scan binds its own document before the filter runs.
                vars.retain(|v| *v != *out);
            }
            NodeKind::IndexScan {
                condition,
                filter,
                out,
                ..
            } => {
                for lookup in &condition.lookups {
                    match lookup {
                        FieldLookup::Eq { value } => value.collect_variables(&mut vars),
                        FieldLookup::In { values } => values.collect_variables(&mut vars),
                        FieldLookup::Range { lower, upper } => {
                            for bound in lower.iter().chain(upper.iter()) {
                                bound.value.collect_variables(&mut vars);
                            }
                        }
                    }
                }
                if let Some(expr) = filter {
                    expr.collect_variables(&mut vars);
                }
                vars.retain(|v| *v != *out);
            }
            NodeKind::Calculation { expression, .. } => expression.collect_variables(&mut vars),
            NodeKind::Filter { input }
            | NodeKind::Return { input }
            | NodeKind::EnumerateList { input, .. }
            | NodeKind::Materialize { input, .. } => vars.push(*input),
            NodeKind::Sort { elements } | NodeKind::Gather { sort: elements, .. } => {
                vars.extend(elements.iter().map(|e| e.variable))
            }
            NodeKind::Limit { .. } => {}
            NodeKind::Collect {
                groups, aggregates, ..
            } => {
                vars.extend(groups.iter().map(|g| g.input));
                vars.extend(aggregates.iter().filter_map(|a| a.input));
            }
            NodeKind::Subquery { subquery, .. } => {
                let produced = subquery.produced_variables();
                for var in subquery.used_variables() {
                    if !produced.contains(&var) {
                        vars.push(var);
                    }
                }
            }
            NodeKind::Modify { input, key, .. } => {
                vars.push(*input);
                vars.extend(key.iter().copied());
            }
            NodeKind::Scatter { route, .. } => vars.extend(route.iter().copied()),
        }
        vars.sort();
        vars.dedup();
        vars
    }

    /// Variables this node produces.
    pub fn output_variables(&self) -> VarList {
        let mut vars = VarList::new();
        match self {
            NodeKind::EnumerateCollection { out, .. }
            | NodeKind::IndexScan { out, .. }
            | NodeKind::Calculation { out, .. }
            | NodeKind::EnumerateList { out, .. }
            | NodeKind::Subquery { out, .. }
            | NodeKind::Materialize { out, .. } => vars.push(*out),
            NodeKind::Collect {
                groups,
                aggregates,
                count,
            } => {
                vars.extend(groups.iter().map(|g| g.out));
                vars.extend(aggregates.iter().map(|a| a.out));
                vars.extend(count.iter().copied());
            }
            NodeKind::Modify { old, new, .. } => {
                vars.extend(old.iter().copied());
                vars.extend(new.iter().copied());
            }
            _ => {}
        }
        vars
    }

    /// Returns a copy with every variable reference (not definition) renamed through `map`.
    pub fn replace_variables(&self, map: &FxHashMap<VariableId, VariableId>) -> NodeKind {
        let rename = |var: &VariableId| *map.get(var).unwrap_or(var);
        let mut next = self.clone();
        match &mut next {
            NodeKind::Singleton
            | NodeKind::NoResults
            | NodeKind::Remote { .. }
            | NodeKind::Limit { .. } => {}
            NodeKind::EnumerateCollection { filter, .. } => {
                if let Some(expr) = filter {
                    *expr = expr.replace_variables(map);
                }
            }
            NodeKind::IndexScan {
                condition, filter, ..
            } => {
                for lookup in &mut condition.lookups {
                    match lookup {
                        FieldLookup::Eq { value } => *value = value.replace_variables(map),
                        FieldLookup::In { values } => *values = values.replace_variables(map),
                        FieldLookup::Range { lower, upper } => {
                            for bound in lower.iter_mut().chain(upper.iter_mut()) {
                                bound.value = bound.value.replace_variables(map);
                            }
                        }
                    }
                }
                for expr in &mut condition.covered {
                    *expr = expr.replace_variables(map);
                }
                if let Some(expr) = filter {
                    *expr = expr.replace_variables(map);
                }
            }
            NodeKind::Calculation { expression, .. } => {
                *expression = expression.replace_variables(map)
            }
            NodeKind::Filter { input }
            | NodeKind::Return { input }
            | NodeKind::EnumerateList { input, .. }
            | NodeKind::Materialize { input, .. } => *input = rename(input),
            NodeKind::Sort { elements } | NodeKind::Gather { sort: elements, .. } => {
                for element in elements {
                    element.variable = rename(&element.variable);
                }
            }
            NodeKind::Collect {
                groups, aggregates, ..
            } => {
                for group in groups {
                    group.input = rename(&group.input);
                }
                for aggregate in aggregates {
                    aggregate.input = aggregate.input.as_ref().map(rename);
                }
            }
            NodeKind::Subquery { subquery, .. } => {
                *subquery = subquery.replace_variables(map);
            }
            NodeKind::Modify { input, key, .. } => {
                *input = rename(input);
                *key = key.as_ref().map(rename);
            }
            NodeKind::Scatter { route, .. } => *route = route.as_ref().map(rename),
        }
        next
    }
}

/// Immutable plan node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Node identifier.
    pub id: NodeId,
    /// Node variant.
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Linear chain of nodes; each node depends on its predecessor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pipeline {
    nodes: Vec<Arc<PlanNode>>,
}

impl Pipeline {
    /// Wraps a node chain.
    pub fn new(nodes: Vec<Arc<PlanNode>>) -> Self {
        Self { nodes }
    }

    /// Nodes in execution order (root first).
    pub fn nodes(&self) -> &[Arc<PlanNode>] {
        &self.nodes
    }

    /// Mutable access to the chain of handles. Nodes themselves stay immutable.
    pub fn nodes_mut(&mut self) -> &mut Vec<Arc<PlanNode>> {
        &mut self.nodes
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when there are no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node at `idx`.
    pub fn get(&self, idx: usize) -> Option<&Arc<PlanNode>> {
        self.nodes.get(idx)
    }

    /// Index of the node producing `var` in this pipeline.
    pub fn producer_of(&self, var: VariableId) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node.kind.output_variables().contains(&var))
    }

    /// True if any node after `idx` reads `var`.
    pub fn is_used_after(&self, idx: usize, var: VariableId) -> bool {
        self.nodes
            .iter()
            .skip(idx + 1)
            .any(|node| node.kind.input_variables().contains(&var))
    }

    /// All variables read anywhere in this pipeline, including nested pipelines.
    pub fn used_variables(&self) -> FxHashSet<VariableId> {
        let mut used = FxHashSet::default();
        for node in &self.nodes {
            match &node.kind {
                NodeKind::Subquery { subquery, .. } => used.extend(subquery.used_variables()),
                kind => used.extend(kind.input_variables()),
            }
        }
        used
    }

    /// All variables produced anywhere in this pipeline, including nested pipelines.
    pub fn produced_variables(&self) -> FxHashSet<VariableId> {
        let mut produced = FxHashSet::default();
        for node in &self.nodes {
            produced.extend(node.kind.output_variables());
            if let NodeKind::Subquery { subquery, .. } = &node.kind {
                produced.extend(subquery.produced_variables());
            }
        }
        produced
    }

    /// Copy with every variable reference renamed through `map`.
    pub fn replace_variables(&self, map: &FxHashMap<VariableId, VariableId>) -> Pipeline {
        let nodes = self
            .nodes
            .iter()
            .map(|node| {
                let kind = node.kind.replace_variables(map);
                if kind == node.kind {
                    Arc::clone(node)
                } else {
                    Arc::new(PlanNode { id: node.id, kind })
                }
            })
            .collect();
        Pipeline { nodes }
    }
}

/// Path of Subquery node indices leading from the top-level pipeline to a nested one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Scope(pub Vec<usize>);

impl Scope {
    /// The top-level pipeline.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Nesting depth; zero for the top level.
    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

/// Variable names and the id allocator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableTable {
    names: BTreeMap<VariableId, String>,
    next: u32,
}

impl VariableTable {
    /// Allocates a new variable.
    pub fn create(&mut self, name: impl Into<String>) -> VariableId {
        let id = VariableId(self.next);
        self.next += 1;
        self.names.insert(id, name.into());
        id
    }

    /// Name of a variable, or its id rendered as `#n` when unknown.
    pub fn name(&self, id: VariableId) -> String {
        self.names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    /// True if the variable exists.
    pub fn contains(&self, id: VariableId) -> bool {
        self.names.contains_key(&id)
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True when no variables exist.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Validated plan: the top-level pipeline plus variable bindings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    root: Pipeline,
    variables: VariableTable,
    next_node: u32,
}

impl Plan {
    /// Assembles a plan without validating it.
    pub fn from_parts(root: Pipeline, variables: VariableTable) -> Self {
        let next_node = max_node_id(&root).map(|id| id.0 + 1).unwrap_or(0);
        Self {
            root,
            variables,
            next_node,
        }
    }

    /// Decodes a plan from JSON and validates it.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut plan: Plan = serde_json::from_str(json)?;
        let floor = max_node_id(&plan.root).map(|id| id.0 + 1).unwrap_or(0);
        plan.next_node = plan.next_node.max(floor);
        plan.validate()?;
        Ok(plan)
    }

    /// Encodes the plan as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Top-level pipeline.
    pub fn root(&self) -> &Pipeline {
        &self.root
    }

    /// Variable table.
    pub fn variables(&self) -> &VariableTable {
        &self.variables
    }

    /// Allocates a variable.
    pub fn create_variable(&mut self, name: impl Into<String>) -> VariableId {
        self.variables.create(name)
    }

    /// Allocates a fresh node.
    pub fn create_node(&mut self, kind: NodeKind) -> Arc<PlanNode> {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        Arc::new(PlanNode { id, kind })
    }

    /// Every pipeline scope, top level first, nested scopes depth-first.
    pub fn scopes(&self) -> Vec<Scope> {
        let mut scopes = vec![Scope::root()];
        collect_scopes(&self.root, &mut Vec::new(), &mut scopes);
        scopes
    }

    /// Pipeline at `scope`.
    pub fn pipeline(&self, scope: &Scope) -> Option<&Pipeline> {
        let mut current = &self.root;
        for idx in &scope.0 {
            match current.get(*idx).map(|node| &node.kind) {
                Some(NodeKind::Subquery { subquery, .. }) => current = subquery,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Replaces the pipeline at `scope`, re-wrapping the enclosing Subquery nodes.
    pub fn set_pipeline(&mut self, scope: &Scope, pipeline: Pipeline) {
        self.root = replace_nested(&self.root, &scope.0, pipeline);
    }

    /// Total number of nodes including nested pipelines.
    pub fn node_count(&self) -> usize {
        fn count(p: &Pipeline) -> usize {
            p.nodes()
                .iter()
                .map(|node| match &node.kind {
                    NodeKind::Subquery { subquery, .. } => 1 + count(subquery),
                    _ => 1,
                })
                .sum()
        }
        count(&self.root)
    }

    /// Names of collections read by scans anywhere in the plan.
    pub fn collections(&self) -> Vec<String> {
        fn walk(p: &Pipeline, out: &mut Vec<String>) {
            for node in p.nodes() {
                match &node.kind {
                    NodeKind::EnumerateCollection { collection, .. }
                    | NodeKind::IndexScan { collection, .. }
                    | NodeKind::Modify { collection, .. }
                    | NodeKind::Materialize { collection, .. }
                    | NodeKind::Scatter { collection, .. }
                    | NodeKind::Remote { collection }
                    | NodeKind::Gather { collection, .. } => out.push(collection.clone()),
                    NodeKind::Subquery { subquery, .. } => walk(subquery, out),
                    _ => {}
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.root, &mut out);
        out.sort();
        out.dedup();
        out
    }

    /// Checks the structural invariants of the plan.
    pub fn validate(&self) -> Result<()> {
        let mut seen = FxHashSet::default();
        let mut modified = FxHashSet::default();
        validate_pipeline(
            self,
            &self.root,
            true,
            &FxHashSet::default(),
            &mut seen,
            &mut modified,
        )
    }
}

fn max_node_id(pipeline: &Pipeline) -> Option<NodeId> {
    pipeline
        .nodes()
        .iter()
        .map(|node| match &node.kind {
            NodeKind::Subquery { subquery, .. } => {
                max_node_id(subquery).map_or(node.id, |inner| inner.max(node.id))
            }
            _ => node.id,
        })
        .max()
}

fn collect_scopes(pipeline: &Pipeline, prefix: &mut Vec<usize>, out: &mut Vec<Scope>) {
    for (idx, node) in pipeline.nodes().iter().enumerate() {
        if let NodeKind::Subquery { subquery, .. } = &node.kind {
            prefix.push(idx);
            out.push(Scope(prefix.clone()));
            collect_scopes(subquery, prefix, out);
            prefix.pop();
        }
    }
}

fn replace_nested(pipeline: &Pipeline, path: &[usize], replacement: Pipeline) -> Pipeline {
    let Some((idx, rest)) = path.split_first() else {
        return replacement;
    };
    let mut next = pipeline.clone();
    if let Some(node) = pipeline.get(*idx) {
        if let NodeKind::Subquery { subquery, out } = &node.kind {
            let inner = replace_nested(subquery, rest, replacement);
            next.nodes_mut()[*idx] = Arc::new(PlanNode {
                id: node.id,
                kind: NodeKind::Subquery {
                    subquery: inner,
                    out: *out,
                },
            });
        }
    }
    next
}

fn validate_pipeline(
    plan: &Plan,
    pipeline: &Pipeline,
    top_level: bool,
    outer: &FxHashSet<VariableId>,
    seen: &mut FxHashSet<VariableId>,
    modified: &mut FxHashSet<String>,
) -> Result<()> {
    let nodes = pipeline.nodes();
    match nodes.first().map(|n| &n.kind) {
        Some(NodeKind::Singleton) => {}
        _ => return Err(AqlError::invalid_plan("pipeline must start with a Singleton")),
    }
    let sink_ok = match nodes.last().map(|n| &n.kind) {
        Some(NodeKind::Return { .. }) | Some(NodeKind::Modify { .. }) => true,
        Some(NodeKind::Gather { .. }) if top_level => nodes
            .iter()
            .rev()
            .nth(1)
            .is_some_and(|n| matches!(n.kind, NodeKind::Modify { .. })),
        _ => false,
    };
    if !sink_ok {
        return Err(AqlError::invalid_plan(
            "pipeline must end with a Return or Modify node",
        ));
    }
    let mut visible = outer.clone();
    let mut open_remote = false;
    for (idx, node) in nodes.iter().enumerate() {
        if idx > 0 && matches!(node.kind, NodeKind::Singleton) {
            return Err(AqlError::invalid_plan("Singleton must be the first node"));
        }
        for var in node.kind.input_variables() {
            if !plan.variables().contains(var) {
                return Err(AqlError::invalid_plan(format!("unknown variable {var}")));
            }
            if !visible.contains(&var) {
                return Err(AqlError::invalid_plan(format!(
                    "variable '{}' used by {} before it is defined",
                    plan.variables().name(var),
                    node.kind.name()
                )));
            }
        }
        if let Some(collection) = node.kind.scanned_collection() {
            if modified.contains(collection) {
                return Err(AqlError::AccessAfterModification(collection.to_owned()));
            }
        }
        match &node.kind {
            NodeKind::Subquery { subquery, .. } => {
                validate_pipeline(plan, subquery, false, &visible, seen, modified)?;
            }
            NodeKind::Modify { collection, .. } => {
                modified.insert(collection.clone());
            }
            NodeKind::Scatter { .. } => {
                if !matches!(
                    nodes.get(idx + 1).map(|n| &n.kind),
                    Some(NodeKind::Remote { .. })
                ) {
                    return Err(AqlError::invalid_plan("Scatter must be followed by Remote"));
                }
            }
            NodeKind::Remote { .. } => {
                if open_remote || !top_level {
                    return Err(AqlError::invalid_plan("unbalanced Remote node"));
                }
                open_remote = true;
            }
            NodeKind::Gather { .. } => {
                if !open_remote {
                    return Err(AqlError::invalid_plan("Gather without matching Remote"));
                }
                open_remote = false;
            }
            NodeKind::Collect { .. } => {
                // Only the collect outputs and outer-scope variables survive a COLLECT.
                visible = outer.clone();
            }
            _ => {}
        }
        for var in node.kind.output_variables() {
            if !plan.variables().contains(var) {
                return Err(AqlError::invalid_plan(format!("unknown variable {var}")));
            }
            if !seen.insert(var) {
                return Err(AqlError::invalid_plan(format!(
                    "variable '{}' is produced more than once",
                    plan.variables().name(var)
                )));
            }
            visible.insert(var);
        }
    }
    if open_remote {
        return Err(AqlError::invalid_plan("Remote without matching Gather"));
    }
    Ok(())
}
