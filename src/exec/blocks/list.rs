use std::collections::VecDeque;

use serde_json::Value;

use crate::exec::block::ExecContext;
use crate::exec::blocks::{RowTransform, TransformBlock};
use crate::exec::driver::BlockTree;
use crate::exec::row::Row;
use crate::query::logical::VariableId;
use crate::types::{AqlError, Result};

/// Emits one row per element of an array variable.
pub struct EnumerateList {
    input: VariableId,
    out: VariableId,
}

impl RowTransform for EnumerateList {
    fn kind(&self) -> &'static str {
        "EnumerateList"
    }

    fn process(&mut self, rows: Vec<Row>, out: &mut VecDeque<Row>, _ctx: &ExecContext) -> Result<()> {
        for row in rows {
            match row.get(self.input) {
                Some(Value::Array(items)) => {
                    out.extend(items.iter().map(|item| row.with(self.out, item.clone())));
                }
                None | Some(Value::Null) => {}
                Some(other) => {
                    return Err(AqlError::Type(format!(
                        "cannot iterate over a value of type {}",
                        type_name(other)
                    )));
                }
            }
        }
        Ok(())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// EnumerateList node.
pub type EnumerateListBlock = TransformBlock<EnumerateList>;

impl TransformBlock<EnumerateList> {
    /// Block iterating `input` into `out`.
    pub fn new(input: VariableId, out: VariableId) -> Self {
        Self::from_transform(EnumerateList { input, out })
    }
}

/// Runs the nested tree once per row, seeded with that row, and binds the
/// array of its results.
pub struct Subquery {
    tree: BlockTree,
    out: VariableId,
}

impl RowTransform for Subquery {
    fn kind(&self) -> &'static str {
        "Subquery"
    }

    fn process(&mut self, rows: Vec<Row>, out: &mut VecDeque<Row>, ctx: &ExecContext) -> Result<()> {
        for mut row in rows {
            self.tree.reset(&row);
            let values = self.tree.run_to_end(ctx)?;
            row.set(self.out, Value::Array(values));
            out.push_back(row);
        }
        Ok(())
    }

    fn documents_fetched(&self) -> u64 {
        self.tree.stats().iter().map(|s| s.documents_fetched).sum()
    }
}

/// Subquery node.
pub type SubqueryBlock = TransformBlock<Subquery>;

impl TransformBlock<Subquery> {
    /// Block running `tree` per row into `out`.
    pub fn new(tree: BlockTree, out: VariableId) -> Self {
        Self::from_transform(Subquery { tree, out })
    }
}
