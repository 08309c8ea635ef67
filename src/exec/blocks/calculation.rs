use std::collections::VecDeque;

use crate::exec::block::ExecContext;
use crate::exec::blocks::{RowTransform, TransformBlock};
use crate::exec::row::Row;
use crate::primitives::fault::points;
use crate::query::expr::Expression;
use crate::query::logical::VariableId;
use crate::query::value::{is_truthy, NULL};
use crate::types::Result;

/// Evaluates an expression per row.
pub struct Calculation {
    out: VariableId,
    expression: Expression,
    can_throw: bool,
}

impl RowTransform for Calculation {
    fn kind(&self) -> &'static str {
        "Calculation"
    }

    fn process(&mut self, rows: Vec<Row>, out: &mut VecDeque<Row>, ctx: &ExecContext) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        ctx.check_fault(points::CALCULATION_EVALUATE)?;
        for mut row in rows {
            let value = self.expression.evaluate(&row)?;
            row.set(self.out, value);
            out.push_back(row);
        }
        Ok(())
    }

    // A throwing expression must see every row, skipped or not.
    fn skips_through(&self) -> bool {
        !self.can_throw
    }
}

/// Calculation node.
pub type CalculationBlock = TransformBlock<Calculation>;

impl TransformBlock<Calculation> {
    /// Block binding `out` to `expression`.
    pub fn new(out: VariableId, expression: Expression) -> Self {
        let can_throw = expression.can_throw();
        Self::from_transform(Calculation {
            out,
            expression,
            can_throw,
        })
    }
}

/// Keeps rows whose condition variable is truthy.
pub struct Filter {
    input: VariableId,
}

impl RowTransform for Filter {
    fn kind(&self) -> &'static str {
        "Filter"
    }

    fn process(&mut self, rows: Vec<Row>, out: &mut VecDeque<Row>, _ctx: &ExecContext) -> Result<()> {
        out.extend(
            rows.into_iter()
                .filter(|row| is_truthy(row.get(self.input).unwrap_or(&NULL))),
        );
        Ok(())
    }
}

/// Filter node.
pub type FilterBlock = TransformBlock<Filter>;

impl TransformBlock<Filter> {
    /// Block filtering on `input`.
    pub fn new(input: VariableId) -> Self {
        Self::from_transform(Filter { input })
    }
}
