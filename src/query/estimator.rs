//! Index ranking and cost estimation.
//!
//! Two entry points: [`Estimator::rank_indexes`] matches the constraints of a
//! scan against the collection's indexes and returns the usable ones in
//! ranking order; [`Estimator::estimate_plan`] walks a whole plan and produces
//! the row and cost estimates the optimizer compares candidates by.

use std::cmp::Ordering;

use rustc_hash::FxHashMap;

use crate::config::EstimatorConfig;
use crate::query::expr::{CompareOp, Expression};
use crate::query::logical::{
    AttributePath, FieldLookup, IndexCondition, NodeId, NodeKind, Pipeline, Plan, RangeBound,
    VariableId,
};
use crate::query::metadata::{CollectionInfo, IndexDescriptor, IndexKind, MetadataSnapshot};
use crate::query::value::Value;
use crate::types::Result;

const MIN_SELECTIVITY: f64 = 1e-6;
const COLLECT_REDUCTION: f64 = 0.5;

/// What a single filter conjunct says about one attribute of the scanned document.
#[derive(Clone, Debug, PartialEq)]
pub enum ConstraintKind {
    /// `attr == value`
    Eq(Expression),
    /// `attr IN values`
    In(Expression),
    /// `attr > value` or `attr >= value`
    Lower {
        /// Bound value.
        value: Expression,
        /// `>=` when true.
        inclusive: bool,
    },
    /// `attr < value` or `attr <= value`
    Upper {
        /// Bound value.
        value: Expression,
        /// `<=` when true.
        inclusive: bool,
    },
}

/// Constraint extracted from one conjunct.
#[derive(Clone, Debug, PartialEq)]
pub struct AttributeConstraint {
    /// Constrained attribute of the scanned document.
    pub path: AttributePath,
    /// Constraint.
    pub kind: ConstraintKind,
    /// Conjunct the constraint was extracted from.
    pub source: Expression,
}

/// Extracts index-usable constraints on `var` from filter conjuncts.
///
/// Conjuncts that do not have the shape `var.path OP expr` (or its mirror),
/// or whose other side references `var`, are ignored.
pub fn extract_constraints(var: VariableId, conjuncts: &[Expression]) -> Vec<AttributeConstraint> {
    let mut out = Vec::new();
    for conjunct in conjuncts {
        let Expression::Compare { op, lhs, rhs } = conjunct else {
            continue;
        };
        let oriented = match (lhs.as_attribute_access(), rhs.as_attribute_access()) {
            (Some((base, path)), _) if base == var && !rhs.references(var) => {
                Some((*op, path, rhs.as_ref()))
            }
            (_, Some((base, path))) if base == var && !lhs.references(var) => {
                op.reversed().map(|op| (op, path, lhs.as_ref()))
            }
            _ => None,
        };
        let Some((op, path, value)) = oriented else {
            continue;
        };
        let value = value.clone();
        let kind = match op {
            CompareOp::Eq => ConstraintKind::Eq(value),
            CompareOp::In => ConstraintKind::In(value),
            CompareOp::Gt => ConstraintKind::Lower {
                value,
                inclusive: false,
            },
            CompareOp::Ge => ConstraintKind::Lower {
                value,
                inclusive: true,
            },
            CompareOp::Lt => ConstraintKind::Upper {
                value,
                inclusive: false,
            },
            CompareOp::Le => ConstraintKind::Upper {
                value,
                inclusive: true,
            },
            CompareOp::Ne | CompareOp::NotIn => continue,
        };
        out.push(AttributeConstraint {
            path,
            kind,
            source: conjunct.clone(),
        });
    }
    out
}

/// Index matched against a set of constraints.
#[derive(Clone, Debug)]
pub struct IndexCandidate {
    /// The index.
    pub index: IndexDescriptor,
    /// Lookups on its leading fields and the conjuncts they cover.
    pub condition: IndexCondition,
    /// Number of leading fields matched by equality.
    pub eq_prefix: usize,
    /// Requested projections are served from index key data.
    pub covering: bool,
    /// Index order satisfies the pending sort.
    pub sort_match: bool,
    /// Iterate descending to satisfy the pending sort.
    pub reverse: bool,
    /// Position in the collection's index list.
    pub declaration: usize,
    /// Estimated rows produced per input row.
    pub estimated_rows: f64,
    /// Estimated cost per input row.
    pub cost: f64,
}

/// Row and cost estimates for a whole plan.
#[derive(Clone, Debug, Default)]
pub struct PlanEstimate {
    /// Total estimated cost.
    pub cost: f64,
    /// Estimated rows leaving the sink.
    pub rows: f64,
    /// Estimated rows leaving each node.
    pub node_rows: FxHashMap<NodeId, f64>,
}

/// Cost model bound to one query's metadata snapshot.
pub struct Estimator<'a> {
    config: &'a EstimatorConfig,
    metadata: &'a MetadataSnapshot,
}

impl<'a> Estimator<'a> {
    /// Creates an estimator.
    pub fn new(config: &'a EstimatorConfig, metadata: &'a MetadataSnapshot) -> Self {
        Self { config, metadata }
    }

    /// Metadata snapshot in use.
    pub fn metadata(&self) -> &'a MetadataSnapshot {
        self.metadata
    }

    /// Returns every usable index for `constraints` in ranking order.
    ///
    /// `needed` lists the attribute paths read from the document, or `None`
    /// when the whole document is required. `sort` is the pending sort as
    /// `(path, ascending)` pairs on the scanned document.
    pub fn rank_indexes(
        &self,
        collection: &CollectionInfo,
        constraints: &[AttributeConstraint],
        needed: Option<&[AttributePath]>,
        sort: &[(AttributePath, bool)],
    ) -> Vec<IndexCandidate> {
        let mut candidates: Vec<IndexCandidate> = collection
            .indexes
            .iter()
            .enumerate()
            .filter_map(|(declaration, index)| {
                let (condition, eq_prefix) = match_index(index, constraints)?;
                let covering = is_covering(index, needed);
                let reverse = sort_order(index, &condition, sort);
                let selectivity = self.selectivity(index, &condition, collection);
                let estimated_rows = collection.document_count as f64 * selectivity;
                let cost = self.scan_cost(estimated_rows, covering);
                Some(IndexCandidate {
                    index: index.clone(),
                    condition,
                    eq_prefix,
                    covering,
                    sort_match: reverse.is_some(),
                    reverse: reverse.unwrap_or(false),
                    declaration,
                    estimated_rows,
                    cost,
                })
            })
            .collect();
        candidates.sort_by(compare_candidates);
        candidates
    }

    /// Selectivity of a matched condition.
    pub fn selectivity(
        &self,
        index: &IndexDescriptor,
        condition: &IndexCondition,
        collection: &CollectionInfo,
    ) -> f64 {
        let all_fields_eq = !condition.lookups.is_empty()
            && condition.lookups.len() == index.fields.len()
            && condition
                .lookups
                .iter()
                .all(|l| matches!(l, FieldLookup::Eq { .. }));
        if all_fields_eq {
            let distinct = index.distinct_estimate.or_else(|| {
                (index.unique || index.kind == IndexKind::Primary)
                    .then_some(collection.document_count)
            });
            if let Some(distinct) = distinct {
                return (1.0 / distinct.max(1) as f64).clamp(MIN_SELECTIVITY, 1.0);
            }
        }
        let eq = match index.distinct_estimate {
            Some(distinct) => 1.0 / distinct.max(1) as f64,
            None => self.config.default_eq_selectivity,
        };
        let mut selectivity = 1.0;
        for lookup in &condition.lookups {
            selectivity *= match lookup {
                FieldLookup::Eq { .. } => eq,
                FieldLookup::In { values } => {
                    let count = match values.as_constant() {
                        Some(Value::Array(items)) => items.len().max(1) as f64,
                        _ => 1.0 / self.config.default_eq_selectivity.max(MIN_SELECTIVITY),
                    };
                    (eq * count).min(1.0)
                }
                FieldLookup::Range { lower, upper } => match (lower, upper) {
                    (Some(_), Some(_)) => self.config.range_selectivity * 0.5,
                    (None, None) => 1.0,
                    _ => self.config.range_selectivity,
                },
            };
        }
        selectivity.clamp(MIN_SELECTIVITY, 1.0)
    }

    /// Cost of producing `rows` through an index.
    pub fn scan_cost(&self, rows: f64, covering: bool) -> f64 {
        if covering {
            rows
        } else {
            rows * self.config.fetch_penalty
        }
    }

    /// Walks the whole plan and estimates its cost.
    pub fn estimate_plan(&self, plan: &Plan) -> Result<PlanEstimate> {
        let mut estimate = PlanEstimate::default();
        let (cost, rows) = self.estimate_pipeline(plan.root(), 1.0, &mut estimate)?;
        estimate.cost = cost;
        estimate.rows = rows;
        Ok(estimate)
    }

    fn estimate_pipeline(
        &self,
        pipeline: &Pipeline,
        input_rows: f64,
        estimate: &mut PlanEstimate,
    ) -> Result<(f64, f64)> {
        let mut rows = input_rows;
        let mut cost = 0.0;
        for node in pipeline.nodes() {
            match &node.kind {
                NodeKind::Singleton => cost += 1.0,
                NodeKind::EnumerateCollection {
                    collection, filter, ..
                } => {
                    let count = self.metadata.get(collection)?.document_count as f64;
                    cost += rows * count;
                    rows *= count;
                    if filter.is_some() {
                        rows *= self.config.filter_selectivity;
                    }
                }
                NodeKind::IndexScan {
                    collection,
                    index,
                    condition,
                    covering,
                    filter,
                    ..
                } => {
                    let info = self.metadata.get(collection)?;
                    let per_row =
                        info.document_count as f64 * self.selectivity(index, condition, info);
                    cost += rows * self.scan_cost(per_row, *covering) + rows;
                    rows *= per_row;
                    if filter.is_some() {
                        rows *= self.config.filter_selectivity;
                    }
                }
                NodeKind::Calculation { .. }
                | NodeKind::Return { .. }
                | NodeKind::Modify { .. }
                | NodeKind::Scatter { .. }
                | NodeKind::Remote { .. }
                | NodeKind::Gather { .. } => cost += rows,
                NodeKind::Filter { .. } => {
                    cost += rows;
                    rows *= self.config.filter_selectivity;
                }
                NodeKind::Sort { .. } => cost += rows * rows.max(2.0).log2(),
                NodeKind::Limit { offset, count } => {
                    cost += rows.min(*offset as f64 + *count as f64);
                    rows = (rows - *offset as f64).clamp(0.0, *count as f64);
                }
                NodeKind::Collect { groups, .. } => {
                    cost += rows;
                    rows = if groups.is_empty() {
                        1.0
                    } else {
                        (rows * COLLECT_REDUCTION).max(1.0)
                    };
                }
                NodeKind::EnumerateList { input, .. } => {
                    let length = constant_list_length(pipeline, *input)
                        .unwrap_or(self.config.default_list_length);
                    rows *= length;
                    cost += rows;
                }
                NodeKind::Subquery { subquery, .. } => {
                    let (inner_cost, _) = self.estimate_pipeline(subquery, 1.0, estimate)?;
                    cost += rows * inner_cost;
                }
                NodeKind::Materialize { .. } => cost += rows * self.config.fetch_penalty,
                NodeKind::NoResults => rows = 0.0,
            }
            estimate.node_rows.insert(node.id, rows);
        }
        Ok((cost, rows))
    }
}

fn constant_list_length(pipeline: &Pipeline, var: VariableId) -> Option<f64> {
    let producer = pipeline.get(pipeline.producer_of(var)?)?;
    match &producer.kind {
        NodeKind::Calculation { expression, .. } => match expression {
            Expression::Value {
                value: Value::Array(items),
            } => Some(items.len() as f64),
            Expression::Array { items } => Some(items.len() as f64),
            _ => None,
        },
        _ => None,
    }
}

/// Ranking order: longer equality prefix, then covering, then sort match,
/// then declaration order.
fn compare_candidates(a: &IndexCandidate, b: &IndexCandidate) -> Ordering {
    b.eq_prefix
        .cmp(&a.eq_prefix)
        .then_with(|| b.covering.cmp(&a.covering))
        .then_with(|| b.sort_match.cmp(&a.sort_match))
        .then_with(|| a.declaration.cmp(&b.declaration))
}

/// True if every needed path can be served from the index.
pub fn is_covering(index: &IndexDescriptor, needed: Option<&[AttributePath]>) -> bool {
    match needed {
        Some(paths) if !paths.is_empty() => paths.iter().all(|path| index.covers(path)),
        _ => false,
    }
}

/// Matches constraints against the index fields.
///
/// Returns the condition and its equality prefix length, or `None` when the
/// index cannot serve the constraints according to its kind.
pub fn match_index(
    index: &IndexDescriptor,
    constraints: &[AttributeConstraint],
) -> Option<(IndexCondition, usize)> {
    if !index.kind.supports_comparisons() {
        return None;
    }
    let mut condition = IndexCondition::default();
    let mut eq_prefix = 0;
    for field in &index.fields {
        let on_field: Vec<&AttributeConstraint> =
            constraints.iter().filter(|c| &c.path == field).collect();
        let equality = on_field
            .iter()
            .find(|c| matches!(c.kind, ConstraintKind::Eq(_)))
            .or_else(|| {
                on_field
                    .iter()
                    .find(|c| matches!(c.kind, ConstraintKind::In(_)))
            });
        if let Some(constraint) = equality {
            condition.lookups.push(match &constraint.kind {
                ConstraintKind::In(values) => FieldLookup::In {
                    values: values.clone(),
                },
                ConstraintKind::Eq(value) => FieldLookup::Eq {
                    value: value.clone(),
                },
                _ => return None,
            });
            condition.covered.push(constraint.source.clone());
            eq_prefix += 1;
            continue;
        }
        if index.kind.is_sorted() {
            let lower = on_field.iter().find_map(|c| match &c.kind {
                ConstraintKind::Lower { value, inclusive } => Some((c, value, *inclusive)),
                _ => None,
            });
            let upper = on_field.iter().find_map(|c| match &c.kind {
                ConstraintKind::Upper { value, inclusive } => Some((c, value, *inclusive)),
                _ => None,
            });
            if lower.is_some() || upper.is_some() {
                let bound = |b: Option<(&&AttributeConstraint, &Expression, bool)>| {
                    b.map(|(_, value, inclusive)| RangeBound {
                        value: value.clone(),
                        inclusive,
                    })
                };
                for (c, _, _) in lower.iter().chain(upper.iter()) {
                    condition.covered.push(c.source.clone());
                }
                condition.lookups.push(FieldLookup::Range {
                    lower: bound(lower),
                    upper: bound(upper),
                });
            }
        }
        break;
    }
    let usable = match index.kind {
        IndexKind::Hash => eq_prefix == index.fields.len(),
        IndexKind::Edge => eq_prefix >= 1,
        IndexKind::Primary | IndexKind::Sorted => !condition.lookups.is_empty(),
        IndexKind::Geo | IndexKind::Fulltext => false,
    };
    if !usable {
        return None;
    }
    if index.sparse && !condition.lookups.iter().all(excludes_null) {
        return None;
    }
    Some((condition, eq_prefix))
}

/// True if the lookup provably never matches `null`.
fn excludes_null(lookup: &FieldLookup) -> bool {
    let non_null = |expr: &Expression| matches!(expr.as_constant(), Some(v) if !v.is_null());
    match lookup {
        FieldLookup::Eq { value } => non_null(value),
        FieldLookup::In { values } => match values.as_constant() {
            Some(Value::Array(items)) => items.iter().all(|v| !v.is_null()),
            _ => false,
        },
        FieldLookup::Range { lower, .. } => match lower {
            Some(bound) => match bound.value.as_constant() {
                Some(Value::Null) => !bound.inclusive,
                Some(_) => true,
                None => false,
            },
            None => false,
        },
    }
}

/// If iterating `index` under `condition` yields rows ordered by `sort`,
/// returns whether the iteration must run in reverse.
///
/// Sparse indexes never qualify since they skip documents a sort must still
/// return.
pub fn sort_order(
    index: &IndexDescriptor,
    condition: &IndexCondition,
    sort: &[(AttributePath, bool)],
) -> Option<bool> {
    if sort.is_empty() || !index.kind.is_sorted() || index.sparse {
        return None;
    }
    let ascending = sort[0].1;
    if sort.iter().any(|(_, asc)| *asc != ascending) {
        return None;
    }
    let fixed = condition
        .lookups
        .iter()
        .take_while(|l| matches!(l, FieldLookup::Eq { .. }))
        .count();
    let matches_at = |start: usize| {
        sort.iter().enumerate().all(|(i, (path, _))| {
            index.fields.get(start + i) == Some(path)
                && !matches!(condition.lookups.get(start + i), Some(FieldLookup::In { .. }))
        })
    };
    (0..=fixed).any(matches_at).then_some(!ascending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::metadata::IndexDescriptor;
    use serde_json::json;

    fn doc() -> VariableId {
        VariableId(0)
    }

    fn cmp(op: CompareOp, path: &str, value: Value) -> Expression {
        Expression::compare(
            op,
            Expression::attribute(doc(), path),
            Expression::value(value),
        )
    }

    #[test]
    fn extracts_mirrored_comparisons() {
        let conjuncts = vec![
            Expression::compare(
                CompareOp::Lt,
                Expression::value(json!(5)),
                Expression::attribute(doc(), "a"),
            ),
            cmp(CompareOp::Ne, "b", json!(1)),
        ];
        let constraints = extract_constraints(doc(), &conjuncts);
        assert_eq!(constraints.len(), 1);
        assert_eq!(
            constraints[0].kind,
            ConstraintKind::Lower {
                value: Expression::value(json!(5)),
                inclusive: false
            }
        );
    }

    #[test]
    fn hash_index_needs_all_fields() {
        let idx = IndexDescriptor::new("h", IndexKind::Hash, &["a", "b"]);
        let only_a = extract_constraints(doc(), &[cmp(CompareOp::Eq, "a", json!(1))]);
        assert!(match_index(&idx, &only_a).is_none());
        let both = extract_constraints(
            doc(),
            &[
                cmp(CompareOp::Eq, "b", json!(2)),
                cmp(CompareOp::Eq, "a", json!(1)),
            ],
        );
        let (condition, eq_prefix) = match_index(&idx, &both).expect("usable");
        assert_eq!(eq_prefix, 2);
        assert_eq!(condition.covered.len(), 2);
    }

    #[test]
    fn sorted_index_takes_eq_prefix_and_range() {
        let idx = IndexDescriptor::new("s", IndexKind::Sorted, &["a", "b", "c"]);
        let constraints = extract_constraints(
            doc(),
            &[
                cmp(CompareOp::Eq, "a", json!(1)),
                cmp(CompareOp::Ge, "b", json!(2)),
                cmp(CompareOp::Lt, "b", json!(9)),
                cmp(CompareOp::Eq, "c", json!(3)),
            ],
        );
        let (condition, eq_prefix) = match_index(&idx, &constraints).expect("usable");
        assert_eq!(eq_prefix, 1);
        assert_eq!(condition.lookups.len(), 2);
        assert_eq!(condition.covered.len(), 3, "c stays a filter");
    }

    #[test]
    fn sparse_index_requires_null_exclusion() {
        let idx = IndexDescriptor::new("s", IndexKind::Sorted, &["a"]).sparse();
        let upper_only = extract_constraints(doc(), &[cmp(CompareOp::Lt, "a", json!(3))]);
        assert!(match_index(&idx, &upper_only).is_none());
        let lower = extract_constraints(doc(), &[cmp(CompareOp::Gt, "a", json!(3))]);
        assert!(match_index(&idx, &lower).is_some());
        let eq_null = extract_constraints(doc(), &[cmp(CompareOp::Eq, "a", json!(null))]);
        assert!(match_index(&idx, &eq_null).is_none());
    }

    #[test]
    fn ranking_prefers_eq_prefix_then_covering() {
        let info = CollectionInfo::new("c", 1000)
            .with_index(IndexDescriptor::new("range_a", IndexKind::Sorted, &["a"]))
            .with_index(IndexDescriptor::new("eq_b", IndexKind::Hash, &["b"]))
            .with_index(IndexDescriptor::new("eq_b_sorted", IndexKind::Sorted, &["b", "a"]));
        let constraints = extract_constraints(
            doc(),
            &[
                cmp(CompareOp::Gt, "a", json!(1)),
                cmp(CompareOp::Eq, "b", json!(2)),
            ],
        );
        let config = EstimatorConfig::default();
        let snapshot = MetadataSnapshot::from_collections([info.clone()]);
        let estimator = Estimator::new(&config, &snapshot);
        let needed = [AttributePath::parse("a")];
        let ranked = estimator.rank_indexes(&info, &constraints, Some(&needed), &[]);
        let ids: Vec<&str> = ranked.iter().map(|c| c.index.id.as_str()).collect();
        assert_eq!(ids, ["eq_b_sorted", "eq_b", "range_a"]);
        assert!(ranked[0].covering);
    }

    #[test]
    fn sort_order_respects_direction_and_prefix() {
        let idx = IndexDescriptor::new("s", IndexKind::Sorted, &["a", "b"]);
        let eq_a = extract_constraints(doc(), &[cmp(CompareOp::Eq, "a", json!(1))]);
        let (condition, _) = match_index(&idx, &eq_a).expect("usable");
        let by_b = [(AttributePath::parse("b"), false)];
        assert_eq!(sort_order(&idx, &condition, &by_b), Some(true));
        let mixed = [
            (AttributePath::parse("a"), true),
            (AttributePath::parse("b"), false),
        ];
        assert_eq!(sort_order(&idx, &condition, &mixed), None);
        let hash = IndexDescriptor::new("h", IndexKind::Hash, &["a"]);
        assert_eq!(
            sort_order(&hash, &IndexCondition::default(), &[(AttributePath::parse("a"), true)]),
            None
        );
    }
}
