//! Fluent plan builder.
//!
//! Stands in for the parser/validator: each call appends one node to the
//! pipeline and hands back the variables it produced, and [`PlanBuilder::build`]
//! validates the result.

use std::mem;
use std::sync::Arc;

use serde_json::Value;

use crate::query::expr::Expression;
use crate::query::logical::{
    Aggregate, AggregateFunction, CollectGroup, ModifyOp, ModifyOptions, NodeId, NodeKind, Pipeline,
    Plan, PlanNode, SortElement, VariableId, VariableTable,
};
use crate::types::{AqlError, Result};

/// Variables produced by a Collect.
#[derive(Clone, Debug, Default)]
pub struct CollectVars {
    /// Group variables in declaration order.
    pub groups: Vec<VariableId>,
    /// Aggregate variables in declaration order.
    pub aggregates: Vec<VariableId>,
    /// `WITH COUNT INTO` variable.
    pub count: Option<VariableId>,
}

/// Builds plans node by node.
pub struct PlanBuilder {
    variables: VariableTable,
    nodes: Vec<Arc<PlanNode>>,
    next_node: u32,
    error: Option<AqlError>,
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanBuilder {
    /// Starts a pipeline with its Singleton.
    pub fn new() -> Self {
        let mut builder = Self {
            variables: VariableTable::default(),
            nodes: Vec::new(),
            next_node: 0,
            error: None,
        };
        builder.push(NodeKind::Singleton);
        builder
    }

    fn push(&mut self, kind: NodeKind) {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        self.nodes.push(Arc::new(PlanNode { id, kind }));
    }

    /// Allocates a variable without a producing node.
    pub fn variable(&mut self, name: &str) -> VariableId {
        self.variables.create(name)
    }

    /// `FOR name IN collection`.
    pub fn for_collection(&mut self, collection: &str, name: &str) -> VariableId {
        let out = self.variables.create(name);
        self.push(NodeKind::EnumerateCollection {
            collection: collection.to_owned(),
            out,
            projections: Default::default(),
            filter: None,
        });
        out
    }

    /// `FOR name IN input`.
    pub fn for_list(&mut self, name: &str, input: VariableId) -> VariableId {
        let out = self.variables.create(name);
        self.push(NodeKind::EnumerateList { input, out });
        out
    }

    /// `FOR name IN [values...]`, through a constant Calculation.
    pub fn for_values(&mut self, name: &str, values: Vec<Value>) -> VariableId {
        let list = self.calc(
            &format!("{name}_list"),
            Expression::value(Value::Array(values)),
        );
        self.for_list(name, list)
    }

    /// `LET name = expression`.
    pub fn calc(&mut self, name: &str, expression: Expression) -> VariableId {
        let out = self.variables.create(name);
        self.push(NodeKind::Calculation { out, expression });
        out
    }

    /// `FILTER input`.
    pub fn filter(&mut self, input: VariableId) {
        self.push(NodeKind::Filter { input });
    }

    /// `FILTER expression`, through a Calculation the way the parser emits it.
    pub fn filter_expr(&mut self, expression: Expression) -> VariableId {
        let var = self.calc("filter", expression);
        self.filter(var);
        var
    }

    /// `SORT var ASC|DESC, ...`.
    pub fn sort(&mut self, elements: &[(VariableId, bool)]) {
        self.push(NodeKind::Sort {
            elements: elements
                .iter()
                .map(|(variable, ascending)| SortElement {
                    variable: *variable,
                    ascending: *ascending,
                })
                .collect(),
        });
    }

    /// `SORT expression`, through a Calculation.
    pub fn sort_by(&mut self, expression: Expression, ascending: bool) -> VariableId {
        let var = self.calc("sort", expression);
        self.sort(&[(var, ascending)]);
        var
    }

    /// `LIMIT offset, count`.
    pub fn limit(&mut self, offset: u64, count: u64) {
        self.push(NodeKind::Limit { offset, count });
    }

    /// `COLLECT ... AGGREGATE ... WITH COUNT INTO`.
    pub fn collect(
        &mut self,
        groups: &[(&str, VariableId)],
        aggregates: &[(&str, AggregateFunction, Option<VariableId>)],
        count: Option<&str>,
    ) -> CollectVars {
        let mut vars = CollectVars::default();
        let groups = groups
            .iter()
            .map(|(name, input)| {
                let out = self.variables.create(*name);
                vars.groups.push(out);
                CollectGroup { out, input: *input }
            })
            .collect();
        let aggregates = aggregates
            .iter()
            .map(|(name, function, input)| {
                let out = self.variables.create(*name);
                vars.aggregates.push(out);
                Aggregate {
                    out,
                    function: *function,
                    input: *input,
                }
            })
            .collect();
        vars.count = count.map(|name| self.variables.create(name));
        self.push(NodeKind::Collect {
            groups,
            aggregates,
            count: vars.count,
        });
        vars
    }

    /// `LET name = (subquery)`; `build` receives a builder for the inner pipeline.
    pub fn subquery<F>(&mut self, name: &str, build: F) -> Result<VariableId>
    where
        F: FnOnce(&mut PlanBuilder) -> Result<()>,
    {
        let mut inner = PlanBuilder {
            variables: mem::take(&mut self.variables),
            nodes: Vec::new(),
            next_node: self.next_node,
            error: None,
        };
        inner.push(NodeKind::Singleton);
        let outcome = build(&mut inner);
        self.variables = mem::take(&mut inner.variables);
        self.next_node = inner.next_node;
        outcome?;
        if let Some(err) = inner.error {
            return Err(err);
        }
        let out = self.variables.create(name);
        self.push(NodeKind::Subquery {
            subquery: Pipeline::new(inner.nodes),
            out,
        });
        Ok(out)
    }

    fn modify(
        &mut self,
        op: ModifyOp,
        collection: &str,
        input: VariableId,
        key: Option<VariableId>,
    ) {
        self.push(NodeKind::Modify {
            op,
            collection: collection.to_owned(),
            input,
            key,
            options: ModifyOptions::default(),
            old: None,
            new: None,
        });
    }

    /// `INSERT doc INTO collection`.
    pub fn insert(&mut self, collection: &str, doc: VariableId) {
        self.modify(ModifyOp::Insert, collection, doc, None);
    }

    /// `UPDATE doc IN collection`, or `UPDATE key WITH doc IN collection`.
    pub fn update(&mut self, collection: &str, doc: VariableId, key: Option<VariableId>) {
        self.modify(ModifyOp::Update, collection, doc, key);
    }

    /// `REPLACE doc IN collection`, or `REPLACE key WITH doc IN collection`.
    pub fn replace(&mut self, collection: &str, doc: VariableId, key: Option<VariableId>) {
        self.modify(ModifyOp::Replace, collection, doc, key);
    }

    /// `REMOVE keyOrDoc IN collection`.
    pub fn remove(&mut self, collection: &str, key_or_doc: VariableId) {
        self.modify(ModifyOp::Remove, collection, key_or_doc, None);
    }

    fn last_modify(&mut self) -> Option<NodeKind> {
        match self.nodes.last().map(|n| &n.kind) {
            Some(kind @ NodeKind::Modify { .. }) => Some(kind.clone()),
            _ => {
                self.error.get_or_insert_with(|| {
                    AqlError::invalid_plan("modification options require a preceding Modify node")
                });
                None
            }
        }
    }

    fn replace_last(&mut self, kind: NodeKind) {
        if let Some(last) = self.nodes.last_mut() {
            *last = Arc::new(PlanNode { id: last.id, kind });
        }
    }

    /// `OPTIONS { ignoreErrors }` on the preceding Modify node.
    pub fn options(&mut self, options: ModifyOptions) {
        if let Some(NodeKind::Modify {
            op,
            collection,
            input,
            key,
            old,
            new,
            ..
        }) = self.last_modify()
        {
            self.replace_last(NodeKind::Modify {
                op,
                collection,
                input,
                key,
                options,
                old,
                new,
            });
        }
    }

    /// Exposes `NEW` of the preceding Modify node.
    pub fn returning_new(&mut self, name: &str) -> VariableId {
        let var = self.variables.create(name);
        if let Some(NodeKind::Modify {
            op,
            collection,
            input,
            key,
            options,
            old,
            ..
        }) = self.last_modify()
        {
            self.replace_last(NodeKind::Modify {
                op,
                collection,
                input,
                key,
                options,
                old,
                new: Some(var),
            });
        }
        var
    }

    /// Exposes `OLD` of the preceding Modify node.
    pub fn returning_old(&mut self, name: &str) -> VariableId {
        let var = self.variables.create(name);
        if let Some(NodeKind::Modify {
            op,
            collection,
            input,
            key,
            options,
            new,
            ..
        }) = self.last_modify()
        {
            self.replace_last(NodeKind::Modify {
                op,
                collection,
                input,
                key,
                options,
                old: Some(var),
                new,
            });
        }
        var
    }

    /// `RETURN var`.
    pub fn return_var(&mut self, input: VariableId) {
        self.push(NodeKind::Return { input });
    }

    /// `RETURN expression`, through a Calculation.
    pub fn return_expr(&mut self, expression: Expression) -> VariableId {
        let var = self.calc("result", expression);
        self.return_var(var);
        var
    }

    /// Appends an arbitrary node.
    pub fn node(&mut self, kind: NodeKind) {
        self.push(kind);
    }

    /// Finishes and validates the plan.
    pub fn build(self) -> Result<Plan> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let plan = Plan::from_parts(Pipeline::new(self.nodes), self.variables);
        plan.validate()?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expr::CompareOp;
    use serde_json::json;

    #[test]
    fn builds_filter_sort_limit_chain() {
        let mut b = PlanBuilder::new();
        let doc = b.for_collection("c", "doc");
        b.filter_expr(Expression::compare(
            CompareOp::Ge,
            Expression::attribute(doc, "a"),
            Expression::value(json!(0)),
        ));
        b.sort_by(Expression::attribute(doc, "a"), true);
        b.limit(10, 5);
        b.return_expr(Expression::attribute(doc, "a"));
        let plan = b.build().expect("valid");
        let kinds: Vec<&str> = plan.root().nodes().iter().map(|n| n.kind.name()).collect();
        assert_eq!(
            kinds,
            [
                "Singleton",
                "EnumerateCollection",
                "Calculation",
                "Filter",
                "Calculation",
                "Sort",
                "Limit",
                "Calculation",
                "Return"
            ]
        );
    }

    #[test]
    fn options_without_modify_fail_on_build() {
        let mut b = PlanBuilder::new();
        b.options(ModifyOptions {
            ignore_errors: true,
        });
        let v = b.calc("x", Expression::value(json!(1)));
        b.return_var(v);
        assert_eq!(b.build().unwrap_err().code(), 1590);
    }

    #[test]
    fn returning_new_exposes_variable() {
        let mut b = PlanBuilder::new();
        let d = b.for_values("d", vec![json!({"x": 1})]);
        b.insert("c", d);
        let new = b.returning_new("NEW");
        b.return_var(new);
        let plan = b.build().expect("valid");
        let modify = &plan.root().nodes()[3].kind;
        assert_eq!(modify.output_variables().as_slice(), &[new]);
    }
}
