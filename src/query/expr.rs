//! Expressions evaluated by Calculation nodes, scan filters and index lookups.

use std::borrow::Cow;
use std::fmt::Write as _;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::query::functions;
use crate::query::logical::{AttributePath, VarList, VariableId, VariableTable};
use crate::query::value::{self, Value};
use crate::types::{AqlError, Result};

/// Comparison operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `IN`
    In,
    /// `NOT IN`
    NotIn,
}

impl CompareOp {
    /// Operator with operands swapped (`a < b` becomes `b > a`).
    pub fn reversed(self) -> Option<CompareOp> {
        Some(match self {
            CompareOp::Eq => CompareOp::Eq,
            CompareOp::Ne => CompareOp::Ne,
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
            CompareOp::In | CompareOp::NotIn => return None,
        })
    }

    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::In => "IN",
            CompareOp::NotIn => "NOT IN",
        }
    }
}

/// Arithmetic operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
}

impl ArithOp {
    fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        }
    }
}

/// Expression tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expression {
    /// Constant value.
    Value {
        /// The constant.
        value: Value,
    },
    /// Variable reference.
    Reference {
        /// Referenced variable.
        variable: VariableId,
    },
    /// Attribute access `base.name`.
    Attribute {
        /// Accessed value.
        base: Box<Expression>,
        /// Attribute name.
        name: String,
    },
    /// Binary comparison.
    Compare {
        /// Operator.
        op: CompareOp,
        /// Left operand.
        lhs: Box<Expression>,
        /// Right operand.
        rhs: Box<Expression>,
    },
    /// Logical conjunction.
    And {
        /// Left operand.
        lhs: Box<Expression>,
        /// Right operand.
        rhs: Box<Expression>,
    },
    /// Logical disjunction.
    Or {
        /// Left operand.
        lhs: Box<Expression>,
        /// Right operand.
        rhs: Box<Expression>,
    },
    /// Logical negation.
    Not {
        /// Negated operand.
        operand: Box<Expression>,
    },
    /// Binary arithmetic.
    Arithmetic {
        /// Operator.
        op: ArithOp,
        /// Left operand.
        lhs: Box<Expression>,
        /// Right operand.
        rhs: Box<Expression>,
    },
    /// Inclusive integer range `from..to`.
    Range {
        /// First element.
        from: Box<Expression>,
        /// Last element.
        to: Box<Expression>,
    },
    /// Array literal.
    Array {
        /// Elements.
        items: Vec<Expression>,
    },
    /// Object literal.
    Object {
        /// Attribute name/value pairs.
        entries: Vec<(String, Expression)>,
    },
    /// Function call.
    Call {
        /// Upper-case function name.
        function: String,
        /// Arguments.
        args: Vec<Expression>,
    },
}

/// Most values a single range may produce when evaluated.
pub const MAX_RANGE_LENGTH: u64 = 10_000_000;

/// Longest constant range the optimizer folds into a plan literal.
const MAX_FOLDED_RANGE: u64 = 1_000;

/// Largest magnitude an `f64` range bound keeps as an exact integer.
const MAX_RANGE_BOUND: f64 = 9_007_199_254_740_992.0;

fn range_bound(value: &Value) -> Result<i64> {
    let n = value::to_number(value);
    if !n.is_finite() || n.abs() > MAX_RANGE_BOUND {
        return Err(AqlError::ResourceLimit(format!("range bound {n} is out of bounds")));
    }
    Ok(n.trunc() as i64)
}

/// Length of a range whose bounds are literals.
fn constant_range_length(from: &Expression, to: &Expression) -> Option<u64> {
    let from = range_bound(from.as_constant()?).ok()?;
    let to = range_bound(to.as_constant()?).ok()?;
    Some(from.abs_diff(to).saturating_add(1))
}

/// Source of variable values during evaluation.
pub trait Bindings {
    /// Value bound to `var`, if any.
    fn lookup(&self, var: VariableId) -> Option<&Value>;
}

/// Empty binding set used for plan-time evaluation.
pub struct NoBindings;

impl Bindings for NoBindings {
    fn lookup(&self, _var: VariableId) -> Option<&Value> {
        None
    }
}

impl Expression {
    /// Constant.
    pub fn value(value: impl Into<Value>) -> Self {
        Expression::Value {
            value: value.into(),
        }
    }

    /// Variable reference.
    pub fn reference(variable: VariableId) -> Self {
        Expression::Reference { variable }
    }

    /// Attribute access on a variable; `path` may be dotted.
    pub fn attribute(variable: VariableId, path: &str) -> Self {
        path.split('.')
            .fold(Expression::reference(variable), |base, name| {
                Expression::Attribute {
                    base: Box::new(base),
                    name: name.to_owned(),
                }
            })
    }

    /// Comparison.
    pub fn compare(op: CompareOp, lhs: Expression, rhs: Expression) -> Self {
        Expression::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Conjunction.
    pub fn and(lhs: Expression, rhs: Expression) -> Self {
        Expression::And {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Disjunction.
    pub fn or(lhs: Expression, rhs: Expression) -> Self {
        Expression::Or {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Negation.
    pub fn not(operand: Expression) -> Self {
        Expression::Not {
            operand: Box::new(operand),
        }
    }

    /// Arithmetic.
    pub fn arithmetic(op: ArithOp, lhs: Expression, rhs: Expression) -> Self {
        Expression::Arithmetic {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Integer range.
    pub fn range(from: Expression, to: Expression) -> Self {
        Expression::Range {
            from: Box::new(from),
            to: Box::new(to),
        }
    }

    /// Function call; the name is upper-cased.
    pub fn call(function: &str, args: Vec<Expression>) -> Self {
        Expression::Call {
            function: function.to_ascii_uppercase(),
            args,
        }
    }

    fn children(&self) -> SmallVec<[&Expression; 4]> {
        let mut out = SmallVec::new();
        match self {
            Expression::Value { .. } | Expression::Reference { .. } => {}
            Expression::Attribute { base, .. } => out.push(base.as_ref()),
            Expression::Not { operand } => out.push(operand.as_ref()),
            Expression::Compare { lhs, rhs, .. }
            | Expression::And { lhs, rhs }
            | Expression::Or { lhs, rhs }
            | Expression::Arithmetic { lhs, rhs, .. } => {
                out.push(lhs.as_ref());
                out.push(rhs.as_ref());
            }
            Expression::Range { from, to } => {
                out.push(from.as_ref());
                out.push(to.as_ref());
            }
            Expression::Array { items } => out.extend(items.iter()),
            Expression::Object { entries } => out.extend(entries.iter().map(|(_, e)| e)),
            Expression::Call { args, .. } => out.extend(args.iter()),
        }
        out
    }

    fn any(&self, pred: &impl Fn(&Expression) -> bool) -> bool {
        pred(self) || self.children().into_iter().any(|child| child.any(pred))
    }

    /// Appends every referenced variable to `out`.
    pub fn collect_variables(&self, out: &mut VarList) {
        if let Expression::Reference { variable } = self {
            if !out.contains(variable) {
                out.push(*variable);
            }
        }
        for child in self.children() {
            child.collect_variables(out);
        }
    }

    /// Referenced variables, sorted.
    pub fn variables(&self) -> VarList {
        let mut vars = VarList::new();
        self.collect_variables(&mut vars);
        vars.sort();
        vars
    }

    /// True if the expression references `var`.
    pub fn references(&self, var: VariableId) -> bool {
        self.any(&|e| matches!(e, Expression::Reference { variable } if *variable == var))
    }

    /// False if any function call is non-deterministic or unknown.
    pub fn is_deterministic(&self) -> bool {
        !self.any(&|e| match e {
            Expression::Call { function, .. } => {
                functions::lookup(function).map_or(true, |f| !f.deterministic)
            }
            _ => false,
        })
    }

    /// True if evaluation can raise an error.
    pub fn can_throw(&self) -> bool {
        self.any(&|e| match e {
            Expression::Call { function, .. } => {
                functions::lookup(function).map_or(true, |f| f.can_throw)
            }
            Expression::Arithmetic { op, .. } => matches!(op, ArithOp::Div | ArithOp::Mod),
            Expression::Range { from, to } => {
                constant_range_length(from, to).map_or(true, |len| len > MAX_RANGE_LENGTH)
            }
            _ => false,
        })
    }

    /// True if the expression calls `function` anywhere.
    pub fn calls_function(&self, function: &str) -> bool {
        self.any(&|e| matches!(e, Expression::Call { function: f, .. } if f == function))
    }

    /// True if the optimizer may reorder, merge or drop the expression.
    /// `NOOPT(...)` and non-deterministic calls pin it in place.
    pub fn is_movable(&self) -> bool {
        self.is_deterministic() && !self.calls_function("NOOPT")
    }

    /// True if the expression can be evaluated at plan time.
    pub fn is_constant(&self) -> bool {
        !self.any(&|e| match e {
            Expression::Reference { .. } => true,
            Expression::Call { function, .. } => {
                functions::lookup(function).map_or(true, |f| !f.foldable)
            }
            _ => false,
        })
    }

    /// Constant value of a `Value` node.
    pub fn as_constant(&self) -> Option<&Value> {
        match self {
            Expression::Value { value } => Some(value),
            _ => None,
        }
    }

    /// Variable of a bare reference.
    pub fn as_reference(&self) -> Option<VariableId> {
        match self {
            Expression::Reference { variable } => Some(*variable),
            _ => None,
        }
    }

    /// Decomposes `var.a.b` into the variable and its path.
    pub fn as_attribute_access(&self) -> Option<(VariableId, AttributePath)> {
        let mut steps = Vec::new();
        let mut current = self;
        loop {
            match current {
                Expression::Attribute { base, name } => {
                    steps.push(name.clone());
                    current = base;
                }
                Expression::Reference { variable } if !steps.is_empty() => {
                    steps.reverse();
                    return Some((*variable, AttributePath(steps)));
                }
                _ => return None,
            }
        }
    }

    /// Records how `var` is used: `Some(paths)` when only attribute paths are
    /// read, `None` once the whole value is needed.
    pub fn attribute_uses(&self, var: VariableId, uses: &mut Option<Vec<AttributePath>>) {
        if uses.is_none() {
            return;
        }
        if let Some((base, path)) = self.as_attribute_access() {
            if base == var {
                if let Some(paths) = uses.as_mut() {
                    paths.push(path);
                }
            }
            return;
        }
        if let Expression::Reference { variable } = self {
            if *variable == var {
                *uses = None;
            }
            return;
        }
        for child in self.children() {
            child.attribute_uses(var, uses);
        }
    }

    /// Splits a conjunction into its operands.
    pub fn conjuncts(&self) -> Vec<&Expression> {
        match self {
            Expression::And { lhs, rhs } => {
                let mut out = lhs.conjuncts();
                out.extend(rhs.conjuncts());
                out
            }
            other => vec![other],
        }
    }

    pub fn disjuncts(&self) -> Vec<&Expression> {
        match self {
            Expression::Or { lhs, rhs } => {
                let mut out = lhs.disjuncts();
                out.extend(rhs.disjuncts());
                out
            }
            other => vec![other],
        }
    }

    /// Copy with references renamed through `map`.
    pub fn replace_variables(&self, map: &FxHashMap<VariableId, VariableId>) -> Expression {
        self.map_references(&|var| map.get(&var).map(|to| Expression::reference(*to)))
    }

    /// Copy with every reference to `var` replaced by `with`.
    pub fn substitute(&self, var: VariableId, with: &Expression) -> Expression {
        self.map_references(&|v| (v == var).then(|| with.clone()))
    }

    fn map_references(&self, f: &impl Fn(VariableId) -> Option<Expression>) -> Expression {
        let boxed = |e: &Expression| Box::new(e.map_references(f));
        match self {
            Expression::Value { .. } => self.clone(),
            Expression::Reference { variable } => f(*variable).unwrap_or_else(|| self.clone()),
            Expression::Attribute { base, name } => Expression::Attribute {
                base: boxed(base),
                name: name.clone(),
            },
            Expression::Compare { op, lhs, rhs } => Expression::Compare {
                op: *op,
                lhs: boxed(lhs),
                rhs: boxed(rhs),
            },
            Expression::And { lhs, rhs } => Expression::And {
                lhs: boxed(lhs),
                rhs: boxed(rhs),
            },
            Expression::Or { lhs, rhs } => Expression::Or {
                lhs: boxed(lhs),
                rhs: boxed(rhs),
            },
            Expression::Not { operand } => Expression::Not {
                operand: boxed(operand),
            },
            Expression::Arithmetic { op, lhs, rhs } => Expression::Arithmetic {
                op: *op,
                lhs: boxed(lhs),
                rhs: boxed(rhs),
            },
            Expression::Range { from, to } => Expression::Range {
                from: boxed(from),
                to: boxed(to),
            },
            Expression::Array { items } => Expression::Array {
                items: items.iter().map(|e| e.map_references(f)).collect(),
            },
            Expression::Object { entries } => Expression::Object {
                entries: entries
                    .iter()
                    .map(|(k, e)| (k.clone(), e.map_references(f)))
                    .collect(),
            },
            Expression::Call { function, args } => Expression::Call {
                function: function.clone(),
                args: args.iter().map(|e| e.map_references(f)).collect(),
            },
        }
    }

    /// Folds constant sub-expressions. Sub-expressions whose evaluation fails
    /// are left in place so the error surfaces at runtime.
    /// Ranges are folded only while they stay short.
    pub fn simplify(&self) -> Expression {
        if self.is_foldable() {
            if let Ok(value) = self.evaluate(&NoBindings) {
                return Expression::Value { value };
            }
        }
        let simplified = self.map_children(&|child| child.simplify());
        if simplified.is_foldable() {
            if let Ok(value) = simplified.evaluate(&NoBindings) {
                return Expression::Value { value };
            }
        }
        simplified
    }

    fn is_foldable(&self) -> bool {
        !matches!(self, Expression::Value { .. })
            && self.is_constant()
            && !self.any(&|e| match e {
                Expression::Range { from, to } => {
                    constant_range_length(from, to).map_or(true, |len| len > MAX_FOLDED_RANGE)
                }
                _ => false,
            })
    }

    fn map_children(&self, f: &impl Fn(&Expression) -> Expression) -> Expression {
        let boxed = |e: &Expression| Box::new(f(e));
        match self {
            Expression::Value { .. } | Expression::Reference { .. } => self.clone(),
            Expression::Attribute { base, name } => Expression::Attribute {
                base: boxed(base),
                name: name.clone(),
            },
            Expression::Compare { op, lhs, rhs } => Expression::Compare {
                op: *op,
                lhs: boxed(lhs),
                rhs: boxed(rhs),
            },
            Expression::And { lhs, rhs } => Expression::And {
                lhs: boxed(lhs),
                rhs: boxed(rhs),
            },
            Expression::Or { lhs, rhs } => Expression::Or {
                lhs: boxed(lhs),
                rhs: boxed(rhs),
            },
            Expression::Not { operand } => Expression::Not {
                operand: boxed(operand),
            },
            Expression::Arithmetic { op, lhs, rhs } => Expression::Arithmetic {
                op: *op,
                lhs: boxed(lhs),
                rhs: boxed(rhs),
            },
            Expression::Range { from, to } => Expression::Range {
                from: boxed(from),
                to: boxed(to),
            },
            Expression::Array { items } => Expression::Array {
                items: items.iter().map(f).collect(),
            },
            Expression::Object { entries } => Expression::Object {
                entries: entries.iter().map(|(k, e)| (k.clone(), f(e))).collect(),
            },
            Expression::Call { function, args } => Expression::Call {
                function: function.clone(),
                args: args.iter().map(f).collect(),
            },
        }
    }

    /// Evaluates the expression into an owned value.
    pub fn evaluate(&self, bindings: &dyn Bindings) -> Result<Value> {
        self.eval(bindings).map(Cow::into_owned)
    }

    fn eval<'a>(&'a self, bindings: &'a dyn Bindings) -> Result<Cow<'a, Value>> {
        match self {
            Expression::Value { value } => Ok(Cow::Borrowed(value)),
            Expression::Reference { variable } => bindings
                .lookup(*variable)
                .map(Cow::Borrowed)
                .ok_or_else(|| AqlError::internal(format!("variable {variable} is not bound"))),
            Expression::Attribute { base, name } => {
                let step = std::slice::from_ref(name);
                Ok(match base.eval(bindings)? {
                    Cow::Borrowed(doc) => Cow::Borrowed(value::get_path(doc, step)),
                    Cow::Owned(doc) => Cow::Owned(value::get_path(&doc, step).clone()),
                })
            }
            Expression::Compare { op, lhs, rhs } => {
                let l = lhs.eval(bindings)?;
                let r = rhs.eval(bindings)?;
                Ok(Cow::Owned(Value::Bool(compare(*op, &l, &r))))
            }
            Expression::And { lhs, rhs } => {
                let l = lhs.eval(bindings)?;
                if !value::is_truthy(&l) {
                    return Ok(l);
                }
                rhs.eval(bindings)
            }
            Expression::Or { lhs, rhs } => {
                let l = lhs.eval(bindings)?;
                if value::is_truthy(&l) {
                    return Ok(l);
                }
                rhs.eval(bindings)
            }
            Expression::Not { operand } => {
                let v = operand.eval(bindings)?;
                Ok(Cow::Owned(Value::Bool(!value::is_truthy(&v))))
            }
            Expression::Arithmetic { op, lhs, rhs } => {
                let l = value::to_number(lhs.eval(bindings)?.as_ref());
                let r = value::to_number(rhs.eval(bindings)?.as_ref());
                let result = match op {
                    ArithOp::Add => l + r,
                    ArithOp::Sub => l - r,
                    ArithOp::Mul => l * r,
                    ArithOp::Div => {
                        if r == 0.0 {
                            return Err(AqlError::DivisionByZero);
                        }
                        l / r
                    }
                    ArithOp::Mod => {
                        if r == 0.0 {
                            return Err(AqlError::DivisionByZero);
                        }
                        l % r
                    }
                };
                Ok(Cow::Owned(value::number_value(result)))
            }
            Expression::Range { from, to } => {
                let from = range_bound(from.eval(bindings)?.as_ref())?;
                let to = range_bound(to.eval(bindings)?.as_ref())?;
                let len = from.abs_diff(to).saturating_add(1);
                if len > MAX_RANGE_LENGTH {
                    return Err(AqlError::ResourceLimit(format!(
                        "range of {len} values exceeds the limit of {MAX_RANGE_LENGTH}"
                    )));
                }
                let items: Vec<Value> = if from <= to {
                    (from..=to).map(Value::from).collect()
                } else {
                    (to..=from).rev().map(Value::from).collect()
                };
                Ok(Cow::Owned(Value::Array(items)))
            }
            Expression::Array { items } => {
                let values = items
                    .iter()
                    .map(|item| item.evaluate(bindings))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Cow::Owned(Value::Array(values)))
            }
            Expression::Object { entries } => {
                let mut map = serde_json::Map::new();
                for (key, expr) in entries {
                    map.insert(key.clone(), expr.evaluate(bindings)?);
                }
                Ok(Cow::Owned(Value::Object(map)))
            }
            Expression::Call { function, args } => {
                let values = args
                    .iter()
                    .map(|arg| arg.evaluate(bindings))
                    .collect::<Result<Vec<_>>>()?;
                functions::call(function, values).map(Cow::Owned)
            }
        }
    }

    /// Renders the expression in query-language syntax.
    pub fn render(&self, vars: &VariableTable) -> String {
        let mut out = String::new();
        self.render_into(vars, &mut out);
        out
    }

    fn render_into(&self, vars: &VariableTable, out: &mut String) {
        match self {
            Expression::Value { value } => {
                let _ = write!(out, "{value}");
            }
            Expression::Reference { variable } => out.push_str(&vars.name(*variable)),
            Expression::Attribute { base, name } => {
                base.render_into(vars, out);
                out.push('.');
                out.push_str(name);
            }
            Expression::Compare { op, lhs, rhs } => {
                binary(vars, out, lhs, op.symbol(), rhs);
            }
            Expression::And { lhs, rhs } => binary(vars, out, lhs, "AND", rhs),
            Expression::Or { lhs, rhs } => binary(vars, out, lhs, "OR", rhs),
            Expression::Arithmetic { op, lhs, rhs } => binary(vars, out, lhs, op.symbol(), rhs),
            Expression::Not { operand } => {
                out.push_str("NOT ");
                operand.render_into(vars, out);
            }
            Expression::Range { from, to } => {
                from.render_into(vars, out);
                out.push_str("..");
                to.render_into(vars, out);
            }
            Expression::Array { items } => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.render_into(vars, out);
                }
                out.push(']');
            }
            Expression::Object { entries } => {
                out.push('{');
                for (i, (key, item)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{key}: ");
                    item.render_into(vars, out);
                }
                out.push('}');
            }
            Expression::Call { function, args } => {
                out.push_str(function);
                out.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    arg.render_into(vars, out);
                }
                out.push(')');
            }
        }
    }
}

fn binary(vars: &VariableTable, out: &mut String, lhs: &Expression, op: &str, rhs: &Expression) {
    out.push('(');
    lhs.render_into(vars, out);
    let _ = write!(out, " {op} ");
    rhs.render_into(vars, out);
    out.push(')');
}

/// Applies a comparison operator to two values.
pub fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CompareOp::Eq => value::values_equal(lhs, rhs),
        CompareOp::Ne => !value::values_equal(lhs, rhs),
        CompareOp::Lt => value::compare_values(lhs, rhs) == Less,
        CompareOp::Le => value::compare_values(lhs, rhs) != Greater,
        CompareOp::Gt => value::compare_values(lhs, rhs) == Greater,
        CompareOp::Ge => value::compare_values(lhs, rhs) != Less,
        CompareOp::In => match rhs {
            Value::Array(items) => items.iter().any(|item| value::values_equal(lhs, item)),
            _ => false,
        },
        CompareOp::NotIn => match rhs {
            Value::Array(items) => !items.iter().any(|item| value::values_equal(lhs, item)),
            _ => true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Single(VariableId, Value);

    impl Bindings for Single {
        fn lookup(&self, var: VariableId) -> Option<&Value> {
            (var == self.0).then_some(&self.1)
        }
    }

    #[test]
    fn evaluates_attribute_comparisons() {
        let doc = VariableId(0);
        let expr = Expression::compare(
            CompareOp::Ge,
            Expression::attribute(doc, "value"),
            Expression::value(json!(15)),
        );
        assert_eq!(
            expr.evaluate(&Single(doc, json!({"value": 20}))).unwrap(),
            json!(true)
        );
        assert_eq!(
            expr.evaluate(&Single(doc, json!({"value": 3}))).unwrap(),
            json!(false)
        );
        assert_eq!(
            expr.evaluate(&Single(doc, json!({}))).unwrap(),
            json!(false),
            "missing attribute is null and sorts before numbers"
        );
    }

    #[test]
    fn simplify_folds_pure_constants_only() {
        let folded = Expression::arithmetic(
            ArithOp::Add,
            Expression::value(json!(1)),
            Expression::value(json!(2)),
        )
        .simplify();
        assert_eq!(folded, Expression::value(json!(3)));

        let rand = Expression::call("RAND", vec![]);
        assert_eq!(rand.simplify(), rand);

        let div = Expression::arithmetic(
            ArithOp::Div,
            Expression::value(json!(1)),
            Expression::value(json!(0)),
        );
        assert_eq!(div.simplify(), div, "failing folds stay for runtime");
    }

    #[test]
    fn determinism_and_throw_analysis() {
        let v = VariableId(3);
        let rand = Expression::compare(
            CompareOp::Lt,
            Expression::call("RAND", vec![]),
            Expression::attribute(v, "p"),
        );
        assert!(!rand.is_deterministic());
        assert!(!rand.can_throw());
        let fail = Expression::call("FAIL", vec![Expression::value(json!("x"))]);
        assert!(fail.can_throw());
        assert!(fail.is_deterministic());
    }

    #[test]
    fn attribute_uses_tracks_whole_value_reads() {
        let v = VariableId(1);
        let mut uses = Some(Vec::new());
        Expression::and(
            Expression::attribute(v, "a.b"),
            Expression::attribute(v, "c"),
        )
        .attribute_uses(v, &mut uses);
        assert_eq!(
            uses,
            Some(vec![AttributePath::parse("a.b"), AttributePath::parse("c")])
        );
        Expression::call("LENGTH", vec![Expression::reference(v)]).attribute_uses(v, &mut uses);
        assert_eq!(uses, None);
    }

    #[test]
    fn long_ranges_are_not_folded() {
        let short = Expression::range(Expression::value(json!(1)), Expression::value(json!(3)));
        assert_eq!(short.simplify(), Expression::value(json!([1, 2, 3])));
        assert!(!short.can_throw());

        let long = Expression::range(
            Expression::value(json!(1)),
            Expression::arithmetic(
                ArithOp::Mul,
                Expression::value(json!(5)),
                Expression::value(json!(1_000_000)),
            ),
        );
        let simplified = long.simplify();
        assert_eq!(
            simplified,
            Expression::range(
                Expression::value(json!(1)),
                Expression::value(json!(5_000_000))
            ),
            "bounds fold, the range stays"
        );
        let length = Expression::call("LENGTH", vec![long]);
        assert!(matches!(length.simplify(), Expression::Call { .. }));
    }

    #[test]
    fn oversized_range_is_a_resource_error() {
        let huge = Expression::range(Expression::value(json!(1)), Expression::value(json!(1e12)));
        assert!(huge.can_throw());
        let err = huge.evaluate(&NoBindings).unwrap_err();
        assert_eq!(err.code(), 32);
        let unbounded = Expression::range(Expression::value(json!(0)), Expression::value(json!(1e300)));
        assert_eq!(unbounded.evaluate(&NoBindings).unwrap_err().code(), 32);
    }

    #[test]
    fn ranges_and_in() {
        let r = Expression::range(Expression::value(json!(3)), Expression::value(json!(1)));
        assert_eq!(r.evaluate(&NoBindings).unwrap(), json!([3, 2, 1]));
        assert!(compare(CompareOp::In, &json!(2), &json!([1, 2])));
        assert!(!compare(CompareOp::In, &json!(2), &json!("2")));
    }
}
