use serde_json::Value;
use smallvec::SmallVec;

use crate::query::expr::Bindings;
use crate::query::logical::VariableId;

/// One row of variable bindings flowing between blocks.
///
/// Bindings are kept sorted by variable id. `route` is set by a Scatter on
/// rows that must go to one specific shard.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    values: SmallVec<[(VariableId, Value); 8]>,
    route: Option<u32>,
}

impl Row {
    /// Row without bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value bound to `var`.
    pub fn get(&self, var: VariableId) -> Option<&Value> {
        self.values
            .binary_search_by_key(&var, |(v, _)| *v)
            .ok()
            .map(|pos| &self.values[pos].1)
    }

    /// Binds `var`, replacing an earlier binding.
    pub fn set(&mut self, var: VariableId, value: Value) {
        match self.values.binary_search_by_key(&var, |(v, _)| *v) {
            Ok(pos) => self.values[pos].1 = value,
            Err(pos) => self.values.insert(pos, (var, value)),
        }
    }

    /// Copy of this row with `var` bound to `value`.
    pub fn with(&self, var: VariableId, value: Value) -> Row {
        let mut next = self.clone();
        next.set(var, value);
        next
    }

    /// Target shard, if routed.
    pub fn route(&self) -> Option<u32> {
        self.route
    }

    /// Sets the target shard.
    pub fn set_route(&mut self, shard: Option<u32>) {
        self.route = shard;
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Bindings in variable order.
    pub fn iter(&self) -> impl Iterator<Item = (VariableId, &Value)> {
        self.values.iter().map(|(var, value)| (*var, value))
    }
}

impl Bindings for Row {
    fn lookup(&self, var: VariableId) -> Option<&Value> {
        self.get(var)
    }
}

/// A row plus one extra binding that is not stored in it, used to evaluate
/// scan filters before the output row is built.
pub(crate) struct Extended<'a> {
    pub row: &'a Row,
    pub var: VariableId,
    pub value: &'a Value,
}

impl Bindings for Extended<'_> {
    fn lookup(&self, var: VariableId) -> Option<&Value> {
        if var == self.var {
            Some(self.value)
        } else {
            self.row.get(var)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bindings_stay_sorted() {
        let mut row = Row::new();
        row.set(VariableId(5), json!(5));
        row.set(VariableId(1), json!(1));
        row.set(VariableId(3), json!(3));
        row.set(VariableId(1), json!("one"));
        let vars: Vec<u32> = row.iter().map(|(v, _)| v.0).collect();
        assert_eq!(vars, [1, 3, 5]);
        assert_eq!(row.get(VariableId(1)), Some(&json!("one")));
        assert_eq!(row.get(VariableId(2)), None);
    }

    #[test]
    fn extended_bindings_shadow_nothing_else() {
        let row = Row::new().with(VariableId(0), json!(1));
        let extra = json!({"a": 2});
        let ext = Extended {
            row: &row,
            var: VariableId(9),
            value: &extra,
        };
        assert_eq!(ext.lookup(VariableId(0)), Some(&json!(1)));
        assert_eq!(ext.lookup(VariableId(9)), Some(&extra));
    }
}
